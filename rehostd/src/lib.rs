//! rehostd library crate.
//!
//! This module exposes the core functionality for integration testing.

pub mod config;
pub mod database;
pub mod delivery;
pub mod error;
pub mod locator;
pub mod logging;
pub mod pipeline;
pub mod transcode;

pub use error::{Error, Result};
