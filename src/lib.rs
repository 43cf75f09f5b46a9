//! QUORUM SETTLER: scheduled settlement agent over a quorum of ledger nodes.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod rpc;
pub mod signals;
pub mod engine;
pub mod dashboard;
