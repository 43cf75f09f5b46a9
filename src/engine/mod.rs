//! Core engine: the balance → signals → transfer settlement loop.

pub mod accountant;
pub mod settlement;
pub mod signer;
pub mod state;
