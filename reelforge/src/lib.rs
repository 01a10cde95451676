//! reelforge library crate.
//!
//! Resumable batch runner that turns social video links into character-swapped
//! videos. The binary wires these modules together; integration tests use
//! them directly.

pub mod config;
pub mod credentials;
pub mod database;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod providers;
pub mod records;
pub mod utils;

pub use error::{Error, Result};
