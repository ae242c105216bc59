//! Configuration loading for the test engine.
//!
//! The engine reads a single TOML file. Every field has a default, and a
//! missing file is not an error for [`load_config_or_default`].

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

/// Loads engine configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read
/// - The file contains invalid TOML syntax
/// - A field has the wrong type
///
/// # Example
///
/// ```no_run
/// use testagency::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("testagency.toml"))?;
/// println!("Hosting runtime: {}", config.runtime.current);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads configuration from `path` if it exists, defaults otherwise.
///
/// A file that exists but fails to parse is still an error.
pub fn load_config_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        debug!("No config file at {}, using defaults", path.display());
        Ok(Config::default())
    }
}

/// Loads engine configuration from a TOML string.
///
/// # Example
///
/// ```
/// use testagency::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [runtime]
///     current = "net-4.5"
/// "#)?;
///
/// assert_eq!(config.runtime.current, "net-4.5");
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}
