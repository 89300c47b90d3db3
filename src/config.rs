//! Configuration loading and schema definitions for pytest-bridge.
//!
//! This module provides types and functions for loading the bridge
//! configuration from TOML files or strings. Every setting has a default, so
//! a missing section (or an empty file) yields a usable configuration.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Loads pytest-bridge configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
///
/// # Example
///
/// ```no_run
/// use pytest_bridge::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("pytest-bridge.toml"))?;
/// println!("Python: {}", config.pytest.python);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    config
        .pytest
        .extra_args()
        .with_context(|| format!("Invalid [pytest] section in {}", path.display()))?;

    Ok(config)
}

/// Loads pytest-bridge configuration from a TOML string.
///
/// # Example
///
/// ```
/// use pytest_bridge::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [bridge]
///     verbose = true
///
///     [pytest]
///     python = ".venv/bin/python"
/// "#)?;
///
/// assert!(config.bridge.verbose);
/// assert_eq!(config.pytest.python, ".venv/bin/python");
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;
    config.pytest.extra_args().context("Invalid [pytest] section")?;

    Ok(config)
}
