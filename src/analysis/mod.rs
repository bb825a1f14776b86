//! Analyses over function bodies.

pub mod liveness;
pub use liveness::Liveness;
