//! cposd configuration management
//!
//! This crate provides configuration loading and parsing for cposd:
//! - TOML configuration file parsing
//! - Stack configuration structures
//! - Environment variable overrides (`CPOSD_*`)

pub mod stack_config;
pub mod toml_config;

pub use stack_config::*;
pub use toml_config::*;
