//! pgstage Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared logging, configuration helpers, and error handling for the pgstage workspace.
//!
//! # Overview
//!
//! - **Logging**: `tracing` subscriber setup driven by [`logging::LogConfig`]
//! - **Configuration**: TOML file loading and environment variable parsing
//! - **Error Handling**: [`CommonError`] and the [`Result`] alias
//!
//! # Example
//!
//! ```no_run
//! use pgstage_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let _guard = init_logging(&LogConfig::from_env()?)?;
//!     tracing::info!("pipeline starting");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{CommonError, Result};
