//! Configuration loading and schema definitions.
//!
//! The file format is TOML; see [`Config`] for the layout and
//! [`STARTER_CONFIG`] for an annotated example.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Default configuration file name.
pub const DEFAULT_PATH: &str = "gauntlet.toml";

/// Annotated configuration written by `gauntlet init`.
pub const STARTER_CONFIG: &str = r#"# gauntlet configuration file

[gauntlet]
default_timeout_ms = 30000
max_concurrency = 1
bail = false
# grep = "login"

[tunnel]
type = "selenium"            # or "browserstack"
hostname = "localhost"
port = 4444
startup_timeout_secs = 60
stop_grace_secs = 5
# directory = "~/.cache/gauntlet/selenium"

[tunnel.selenium]
version = "3.141.59"
drivers = ["chrome", "firefox"]

# [tunnel.browserstack]
# username and access_key default to BROWSERSTACK_USERNAME / BROWSERSTACK_ACCESS_KEY
# force = true

[[environments]]
browser_name = "chrome"
"#;

/// Loads configuration from a TOML file.
///
/// # Example
///
/// ```no_run
/// use gauntlet::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("gauntlet.toml"))?;
/// println!("Concurrency: {}", config.gauntlet.max_concurrency);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads configuration from a TOML string.
///
/// ```
/// use gauntlet::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [gauntlet]
///     bail = true
/// "#)?;
///
/// assert!(config.gauntlet.bail);
/// assert_eq!(config.tunnel.port, 4444);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}
