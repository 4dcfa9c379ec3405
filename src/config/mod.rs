//! Configuration module for Sumi-Conductor
//!
//! This module handles loading, parsing, and validating TOML configuration files.
//!
//! # Example
//!
//! ```no_run
//! use sumi_conductor::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("conductor.toml")).unwrap();
//! println!("Workers: {}", config.scheduler.workers);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    BudgetConfig, CircuitConfig, Config, DomainRule, FetchConfig, ProxyConfig, RetryConfig,
    SchedulerConfig, SeedEntry, StrategyKind, UserAgentConfig,
};

// Re-export parser functions
pub use parser::{
    compute_config_hash, load_config, load_config_with_hash, parse_config, read_config,
};

pub use validation::{validate, validate_domain_pattern, validate_domain_rule};
pub(crate) use validation::check_rate;
