//! Tuner slot accounting.

pub mod pool;

pub use pool::{TunerLease, TunerPool};
