//! Refresh cache & rate-limit gate, plus the periodic evictor.

pub mod evictor;
pub mod gate;

pub use gate::{CacheStatus, Preflight, RefreshGate, RefreshOutcome};
