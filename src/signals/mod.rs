//! Signal oracles.
//!
//! Defines the `SignalOracle` trait consumed by the settlement engine.
//! The engine treats oracles as opaque: it only asks whether any signal
//! in a batch is actionable.

use rand::Rng;
use serde::Serialize;

/// One boolean strategy signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Signal {
    pub id: u32,
    pub actionable: bool,
}

/// A fixed-size batch produced once per tick. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalBatch {
    pub signals: Vec<Signal>,
}

impl SignalBatch {
    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    pub fn positive_count(&self) -> usize {
        self.signals.iter().filter(|s| s.actionable).count()
    }

    pub fn from_flags(flags: impl IntoIterator<Item = bool>) -> Self {
        Self {
            signals: flags
                .into_iter()
                .enumerate()
                .map(|(i, actionable)| Signal {
                    id: i as u32,
                    actionable,
                })
                .collect(),
        }
    }
}

/// Source of actionable signals for a settlement tick.
///
/// Implementations must return exactly `size` signals and have no side
/// effects visible to the engine.
pub trait SignalOracle: Send + Sync {
    fn produce_batch(&self, size: usize) -> SignalBatch;

    /// Oracle name for logging.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Random oracle
// ---------------------------------------------------------------------------

/// Stand-in strategy: each signal is independently actionable with
/// probability `hit_probability`.
pub struct RandomOracle {
    hit_probability: f64,
}

impl RandomOracle {
    /// Out-of-range probabilities are clamped; NaN means never actionable.
    pub fn new(hit_probability: f64) -> Self {
        let hit_probability = if hit_probability.is_nan() {
            0.0
        } else {
            hit_probability.clamp(0.0, 1.0)
        };
        Self { hit_probability }
    }
}

impl SignalOracle for RandomOracle {
    fn produce_batch(&self, size: usize) -> SignalBatch {
        let mut rng = rand::thread_rng();
        SignalBatch::from_flags((0..size).map(|_| rng.gen_bool(self.hit_probability)))
    }

    fn name(&self) -> &str {
        "random"
    }
}

// ---------------------------------------------------------------------------
// Fixed oracle
// ---------------------------------------------------------------------------

/// Replays a fixed pattern of positives. Positions past the end of the
/// pattern are negative.
pub struct FixedOracle {
    pattern: Vec<bool>,
}

impl FixedOracle {
    pub fn new(pattern: Vec<bool>) -> Self {
        Self { pattern }
    }

    pub fn never() -> Self {
        Self::new(Vec::new())
    }

    /// Only the first signal of each batch is actionable.
    pub fn first_only() -> Self {
        Self::new(vec![true])
    }
}

impl SignalOracle for FixedOracle {
    fn produce_batch(&self, size: usize) -> SignalBatch {
        SignalBatch::from_flags((0..size).map(|i| self.pattern.get(i).copied().unwrap_or(false)))
    }

    fn name(&self) -> &str {
        "fixed"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
