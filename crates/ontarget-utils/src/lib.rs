//! # OnTarget Utilities
//!
//! Shared utilities, logging, and helpers for OnTarget.
//!
//! This crate provides common functionality used across the OnTarget
//! workspace, including production-ready logging infrastructure built on
//! `tracing`.

pub mod logging;

// Re-export commonly used logging functions for convenience
pub use logging::{LogFormat, LogLevel, init_logging, init_logging_for_run, init_logging_with_level};
pub use tracing::{debug, error, info, trace, warn};
