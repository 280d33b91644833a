//! # vmcreator Common
//!
//! Shared utilities for the vmcreator crates.
//!
//! ## Logging
//!
//! ```rust,ignore
//! use vmcreator_common::{init_logging, LogFormat};
//!
//! init_logging(LogFormat::Pretty, "info").unwrap();
//! tracing::info!(vm = "web01", "Provisioning");
//! ```

pub mod logging;

pub use logging::{
    init_cli_logging, init_logging, init_logging_json, init_logging_pretty, level_for, LogFormat,
};
