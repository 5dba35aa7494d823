//! Configuration module for scraping runs
//!
//! This module provides the `ScrapeConfig` struct and its validating
//! builder. Credentials (database DSN, proxy API token) are deliberately
//! not part of this struct; they are read from the environment at the
//! binary boundary and passed to the components that need them.

// Sub-modules
pub mod builder;
pub mod getters;
pub mod types;

// Re-exports for public API
pub use builder::ScrapeConfigBuilder;
pub use types::{CacheStrategy, ScrapeConfig};
