//! Configuration schema for gauntlet.
//!
//! ```text
//! Config (root)
//! ├── GauntletConfig         - Run settings (timeouts, concurrency, grep, bail)
//! ├── TunnelSettings         - Which tunnel to manage and how to reach it
//! │   ├── ProxyConfig        - Optional outbound proxy
//! │   ├── SeleniumSettings   - `[tunnel.selenium]`
//! │   └── BrowserStackSettings - `[tunnel.browserstack]`
//! └── [EnvironmentRequest]   - Browsers to run against
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::environment::EnvironmentRequest;
use crate::suite::RunOptions;
use crate::tunnel::browserstack::{self, BrowserStackProvider};
use crate::tunnel::selenium::{self, Driver, SeleniumProvider};
use crate::tunnel::{Credentials, Protocol, ProxySettings, TunnelConfig};

pub const USERNAME_ENV: &str = "BROWSERSTACK_USERNAME";
pub const ACCESS_KEY_ENV: &str = "BROWSERSTACK_ACCESS_KEY";

/// Root configuration structure.
///
/// Every section is optional; an empty file runs with defaults against a
/// local Selenium server.
///
/// # Example
///
/// ```
/// use gauntlet::config::{Config, TunnelKind};
///
/// let config: Config = toml::from_str(r#"
///     [gauntlet]
///     max_concurrency = 2
///
///     [tunnel]
///     type = "browserstack"
///
///     [[environments]]
///     browser_name = "chrome"
///     version = "latest"
/// "#).unwrap();
///
/// assert_eq!(config.tunnel.kind, TunnelKind::BrowserStack);
/// assert_eq!(config.environments.len(), 1);
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub gauntlet: GauntletConfig,

    #[serde(default)]
    pub tunnel: TunnelSettings,

    #[serde(default)]
    pub environments: Vec<EnvironmentRequest>,
}

/// Run settings.
///
/// | Field | Default |
/// |-------|---------|
/// | `default_timeout_ms` | 30000 |
/// | `max_concurrency` | 1 |
/// | `bail` | false |
/// | `grep` | None (run everything) |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GauntletConfig {
    /// Timeout for tests and hooks that do not set their own.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Root suites (one per environment) run at the same time.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Skip everything after the first failure.
    #[serde(default)]
    pub bail: bool,

    /// Regex over test ids; non-matching tests are skipped.
    #[serde(default)]
    pub grep: Option<String>,
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_concurrency() -> usize {
    1
}

impl Default for GauntletConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            max_concurrency: default_max_concurrency(),
            bail: false,
            grep: None,
        }
    }
}

impl GauntletConfig {
    /// Builds run options, compiling the grep pattern.
    pub fn run_options(&self) -> Result<RunOptions> {
        let grep = self
            .grep
            .as_deref()
            .map(Regex::new)
            .transpose()
            .context("Invalid grep pattern")?;

        Ok(RunOptions {
            default_timeout: Duration::from_millis(self.default_timeout_ms),
            grep,
            bail: self.bail,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelKind {
    #[default]
    Selenium,
    BrowserStack,
}

/// `[tunnel]`: the provider and the WebDriver endpoint it serves.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TunnelSettings {
    #[serde(rename = "type", default)]
    pub kind: TunnelKind,

    #[serde(default)]
    pub protocol: Protocol,

    #[serde(default = "default_hostname")]
    pub hostname: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_pathname")]
    pub pathname: String,

    /// Install directory. `~` and `$VARS` are expanded. A per-provider,
    /// per-version cache directory is used when unset.
    #[serde(default)]
    pub directory: Option<String>,

    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,

    /// Log every line the tunnel prints at info level.
    #[serde(default)]
    pub verbose: bool,

    #[serde(default)]
    pub tunnel_id: Option<String>,

    #[serde(default)]
    pub proxy: Option<ProxyConfig>,

    #[serde(default)]
    pub selenium: SeleniumSettings,

    #[serde(default)]
    pub browserstack: BrowserStackSettings,
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    4444
}

fn default_pathname() -> String {
    "/wd/hub".to_string()
}

fn default_startup_timeout() -> u64 {
    60
}

fn default_stop_grace() -> u64 {
    5
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            kind: TunnelKind::default(),
            protocol: Protocol::default(),
            hostname: default_hostname(),
            port: default_port(),
            pathname: default_pathname(),
            directory: None,
            startup_timeout_secs: default_startup_timeout(),
            stop_grace_secs: default_stop_grace(),
            verbose: false,
            tunnel_id: None,
            proxy: None,
            selenium: SeleniumSettings::default(),
            browserstack: BrowserStackSettings::default(),
        }
    }
}

impl TunnelSettings {
    /// Builds the driver configuration. BrowserStack credentials fall back
    /// to `BROWSERSTACK_USERNAME` / `BROWSERSTACK_ACCESS_KEY`.
    pub fn tunnel_config(&self) -> Result<TunnelConfig> {
        let directory = self
            .directory
            .as_deref()
            .map(|dir| {
                shellexpand::full(dir)
                    .map(|expanded| PathBuf::from(expanded.into_owned()))
                    .with_context(|| format!("Failed to expand tunnel directory: {}", dir))
            })
            .transpose()?;

        let auth = match self.kind {
            TunnelKind::Selenium => None,
            TunnelKind::BrowserStack => self.browserstack.credentials(),
        };

        Ok(TunnelConfig {
            protocol: self.protocol,
            hostname: self.hostname.clone(),
            port: self.port,
            pathname: self.pathname.clone(),
            auth,
            directory,
            proxy: self.proxy.clone().map(ProxyConfig::into_settings),
            verbose: self.verbose,
            tunnel_id: self.tunnel_id.clone(),
            startup_timeout: Duration::from_secs(self.startup_timeout_secs),
            stop_grace: Duration::from_secs(self.stop_grace_secs),
        })
    }
}

/// `[tunnel.proxy]`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl ProxyConfig {
    fn into_settings(self) -> ProxySettings {
        ProxySettings {
            host: self.host,
            port: self.port,
            username: self.username,
            password: self.password,
        }
    }
}

/// `[tunnel.selenium]`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SeleniumSettings {
    #[serde(default = "default_selenium_version")]
    pub version: String,

    /// Browser drivers to install. An empty list installs only the server.
    #[serde(default = "default_drivers")]
    pub drivers: Vec<Driver>,

    #[serde(default = "default_chromedriver_version")]
    pub chromedriver_version: String,

    #[serde(default = "default_geckodriver_version")]
    pub geckodriver_version: String,

    /// Mirror for the server jar and IE driver releases.
    #[serde(default = "default_selenium_base_url")]
    pub base_url: String,
}

fn default_selenium_version() -> String {
    selenium::DEFAULT_VERSION.to_string()
}

fn default_drivers() -> Vec<Driver> {
    vec![Driver::Chrome, Driver::Firefox]
}

fn default_chromedriver_version() -> String {
    selenium::DEFAULT_CHROMEDRIVER_VERSION.to_string()
}

fn default_geckodriver_version() -> String {
    selenium::DEFAULT_GECKODRIVER_VERSION.to_string()
}

fn default_selenium_base_url() -> String {
    selenium::SELENIUM_RELEASES.to_string()
}

impl Default for SeleniumSettings {
    fn default() -> Self {
        Self {
            version: default_selenium_version(),
            drivers: default_drivers(),
            chromedriver_version: default_chromedriver_version(),
            geckodriver_version: default_geckodriver_version(),
            base_url: default_selenium_base_url(),
        }
    }
}

impl SeleniumSettings {
    pub fn provider(&self) -> SeleniumProvider {
        SeleniumProvider {
            version: self.version.clone(),
            drivers: self.drivers.clone(),
            chromedriver_version: self.chromedriver_version.clone(),
            geckodriver_version: self.geckodriver_version.clone(),
            base_url: self.base_url.clone(),
        }
    }
}

/// `[tunnel.browserstack]`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrowserStackSettings {
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub access_key: Option<String>,

    #[serde(default)]
    pub force: bool,

    #[serde(default = "default_true")]
    pub only_automate: bool,

    #[serde(default)]
    pub skip_check: bool,

    #[serde(default = "default_api_url")]
    pub api_url: String,
}

fn default_true() -> bool {
    true
}

fn default_api_url() -> String {
    browserstack::DEFAULT_API_URL.to_string()
}

impl Default for BrowserStackSettings {
    fn default() -> Self {
        Self {
            username: None,
            access_key: None,
            force: false,
            only_automate: true,
            skip_check: false,
            api_url: default_api_url(),
        }
    }
}

impl BrowserStackSettings {
    pub fn provider(&self) -> BrowserStackProvider {
        BrowserStackProvider {
            force: self.force,
            only_automate: self.only_automate,
            skip_check: self.skip_check,
            api_url: self.api_url.clone(),
            ..BrowserStackProvider::default()
        }
    }

    /// Configured credentials, falling back to the environment.
    pub fn credentials(&self) -> Option<Credentials> {
        let username = self
            .username
            .clone()
            .or_else(|| std::env::var(USERNAME_ENV).ok())?;
        let access_key = self
            .access_key
            .clone()
            .or_else(|| std::env::var(ACCESS_KEY_ENV).ok())?;
        Some(Credentials {
            username,
            access_key,
        })
    }
}
