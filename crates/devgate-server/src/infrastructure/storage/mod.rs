//! Storage infrastructure: configuration file persistence.
//!
//! The `config` sub-module handles:
//!
//! - Reading the TOML configuration file from an explicit path or the
//!   platform-appropriate directory.
//! - Writing a default configuration for first-time setup.
//! - Providing sensible defaults for every absent field.

pub mod config;
