//! Database models.

pub mod job;
pub mod rotation;

pub use job::*;
pub use rotation::*;
