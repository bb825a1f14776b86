//! Liveset: liveness analysis over adaptive sparse bit-sets for
//! SSA-form IR.

pub mod analysis;
pub mod bitset;
pub mod cfg;
pub mod entity;
mod ir;

pub use analysis::Liveness;
pub use bitset::SparseBitset;
pub use ir::*;
