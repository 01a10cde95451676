//! Repository layer for database access.
//!
//! Every SQL statement the application issues lives behind one of these traits,
//! so the job queue and the rotation manager can be exercised against fakes.

pub mod job;
pub mod rotation;

pub use job::*;
pub use rotation::*;
