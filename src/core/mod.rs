//! Core module - shared infrastructure for agentrelay
//!
//! This module contains foundational types, configuration, error handling,
//! the durable snapshot store and logging setup used throughout the crate.

pub mod config;
pub mod error;
pub mod logging;
pub mod store;
pub mod types;

pub use config::Config;
pub use error::{RelayError, Result};
pub use types::*;
