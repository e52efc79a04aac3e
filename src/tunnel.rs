//! Tunnel processes that connect tests to remote WebDriver services.
//!
//! A tunnel is a third-party binary (a Selenium standalone server, a
//! BrowserStack Local agent) that gauntlet downloads, launches, watches,
//! and tears down. Provider specifics live behind the [`TunnelProvider`]
//! capability trait; the lifecycle is implemented once by the generic
//! [`Tunnel`] driver.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Tunnel<P>                              │
//! │                                                               │
//! │  download(force) ──► P::artifacts() ──► fetch / unpack / chmod│
//! │  start()         ──► P::command()   ──► spawn child           │
//! │                      read lines ──► P::error_in / P::is_ready │
//! │  stop()          ──► SIGTERM, grace period, kill              │
//! │  environments()  ──► P::environments()                        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # States
//!
//! ```text
//! Stopped ──start()──► Starting ──ready──► Running ──stop()──► Stopping ──► Stopped
//!                         │                   │
//!                         └─error/cancel──────┴─unexpected exit──────────► Stopped
//! ```
//!
//! At most one child process exists per tunnel. Concurrent `start()` calls
//! share one in-flight start; `stop()` during `Starting` cancels it.
//!
//! # Built-in providers
//!
//! | Provider | Module | Binary |
//! |----------|--------|--------|
//! | Selenium standalone | [`selenium`] | `selenium-server-standalone.jar` plus drivers |
//! | BrowserStack Local | [`browserstack`] | `BrowserStackLocal` |

pub mod browserstack;
pub mod download;
mod driver;
pub mod process;
pub mod selenium;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::environment::EnvironmentDescriptor;

pub use driver::Tunnel;
pub use process::{Command, OutputLine};

/// Result type for tunnel operations.
pub type TunnelResult<T> = Result<T, TunnelError>;

/// Errors from downloading, starting, stopping or querying a tunnel.
///
/// Errors are `Clone` because one start attempt may be awaited by several
/// callers, each of which receives the same error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TunnelError {
    /// The executable could not be launched.
    #[error("Failed to spawn {program}: {message}")]
    Spawn { program: String, message: String },

    /// The tunnel printed a line matching the provider's error pattern.
    #[error("Tunnel reported an error: {0}")]
    Protocol(String),

    /// No ready line was seen within the startup timeout.
    #[error("Tunnel was not ready after {0:?}")]
    StartupTimeout(Duration),

    /// The process exited while starting.
    #[error("Tunnel exited before it was ready (exit code {})", .code.map_or_else(|| "unknown".to_string(), |c| c.to_string()))]
    UnexpectedExit { code: Option<i32> },

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Failed to unpack {artifact}: {message}")]
    Unpack { artifact: String, message: String },

    #[error("Checksum mismatch for {artifact}: expected {expected}, got {actual}")]
    Checksum {
        artifact: String,
        expected: String,
        actual: String,
    },

    #[error("Unsupported platform: {os}/{arch}")]
    UnsupportedPlatform { os: String, arch: String },

    #[error("Tunnel binaries are not downloaded in {}", .0.display())]
    NotDownloaded(PathBuf),

    #[error("Cannot {operation} while tunnel is {state}")]
    InvalidState {
        operation: &'static str,
        state: TunnelState,
    },

    #[error("Tunnel start was cancelled")]
    Cancelled,

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Invalid tunnel configuration: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for TunnelError {
    fn from(err: std::io::Error) -> Self {
        TunnelError::Io(err.to_string())
    }
}

impl From<reqwest::Error> for TunnelError {
    fn from(err: reqwest::Error) -> Self {
        TunnelError::Http(err.to_string())
    }
}

/// Lifecycle state of a [`Tunnel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelState::Stopped => write!(f, "stopped"),
            TunnelState::Starting => write!(f, "starting"),
            TunnelState::Running => write!(f, "running"),
            TunnelState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Broadcast to every [`Tunnel::subscribe`] receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    StateChanged(TunnelState),
    /// Human readable progress ("Downloading chromedriver", ...).
    Status(String),
    DownloadProgress {
        artifact: String,
        loaded: u64,
        total: Option<u64>,
    },
    /// A line the tunnel process printed.
    Output(OutputLine),
    /// The tunnel process exited. `unexpected` is set when nobody asked it
    /// to stop.
    Exited {
        code: Option<i32>,
        unexpected: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Https,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => write!(f, "http"),
            Protocol::Https => write!(f, "https"),
        }
    }
}

/// Account credentials for a remote WebDriver service.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub access_key: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("access_key", &"<redacted>")
            .finish()
    }
}

/// Outbound proxy the tunnel should use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Connection descriptor and process settings shared by all providers.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub protocol: Protocol,
    pub hostname: String,
    pub port: u16,
    pub pathname: String,
    pub auth: Option<Credentials>,
    /// Where binaries are installed. Tunnels sharing a directory share one
    /// install; when unset each tunnel gets a private temporary directory.
    pub directory: Option<PathBuf>,
    pub proxy: Option<ProxySettings>,
    pub verbose: bool,
    /// Identifier that lets several tunnels share one account.
    pub tunnel_id: Option<String>,
    pub startup_timeout: Duration,
    /// Time between SIGTERM and kill when stopping.
    pub stop_grace: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Http,
            hostname: "localhost".to_string(),
            port: 4444,
            pathname: "/wd/hub".to_string(),
            auth: None,
            directory: None,
            proxy: None,
            verbose: false,
            tunnel_id: None,
            startup_timeout: Duration::from_secs(60),
            stop_grace: Duration::from_secs(5),
        }
    }
}

impl TunnelConfig {
    /// WebDriver endpoint the tests should talk to.
    pub fn url(&self) -> String {
        format!(
            "{}://{}:{}{}",
            self.protocol, self.hostname, self.port, self.pathname
        )
    }
}

/// Operating system and CPU architecture, as named by `std::env::consts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }

    pub fn current() -> Self {
        Self::new(std::env::consts::OS, std::env::consts::ARCH)
    }

    pub fn is_windows(&self) -> bool {
        self.os == "windows"
    }

    pub(crate) fn unsupported(&self) -> TunnelError {
        TunnelError::UnsupportedPlatform {
            os: self.os.clone(),
            arch: self.arch.clone(),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)
    }
}

/// How a downloaded artifact is turned into its installed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    /// The download is the file itself.
    Raw,
    Zip,
    TarGz,
}

/// One file a provider needs installed before it can start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Short label used in progress events.
    pub name: String,
    pub url: String,
    pub archive: ArchiveKind,
    /// Path of the wanted file inside the archive; the first regular file
    /// is used when unset.
    pub entry: Option<String>,
    /// Install location, relative to the tunnel directory.
    pub target: String,
    pub executable: bool,
    /// Expected SHA-256 of the download, lowercase hex.
    pub sha256: Option<String>,
}

impl Artifact {
    pub fn raw(name: impl Into<String>, url: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            archive: ArchiveKind::Raw,
            entry: None,
            target: target.into(),
            executable: false,
            sha256: None,
        }
    }

    pub fn archived(
        name: impl Into<String>,
        url: impl Into<String>,
        archive: ArchiveKind,
        entry: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            archive,
            entry: Some(entry.into()),
            target: target.into(),
            executable: false,
            sha256: None,
        }
    }

    pub fn executable(mut self) -> Self {
        self.executable = true;
        self
    }

    pub fn with_sha256(mut self, digest: impl Into<String>) -> Self {
        self.sha256 = Some(digest.into());
        self
    }

    pub fn path_in(&self, directory: &Path) -> PathBuf {
        directory.join(&self.target)
    }
}

/// Final state of a remote job (browser session).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Completed,
    Error,
}

/// Provider specific behaviour composed by [`Tunnel`].
///
/// Providers are pure descriptions: which files to install, how to launch
/// the binary, and how to read its output. The driver owns the process.
#[async_trait]
pub trait TunnelProvider: Send + Sync + 'static {
    /// Short provider name, used for logging and the default directory.
    fn name(&self) -> &'static str;

    /// Version of the binaries this provider installs.
    fn version(&self) -> &str;

    /// Files to install for `platform`. Fails with
    /// [`TunnelError::UnsupportedPlatform`] without touching the network.
    fn artifacts(&self, platform: &Platform) -> TunnelResult<Vec<Artifact>>;

    /// The command that launches the tunnel installed in `directory` for
    /// `platform`.
    fn command(
        &self,
        config: &TunnelConfig,
        directory: &Path,
        platform: &Platform,
    ) -> TunnelResult<Command>;

    /// Whether an output line signals that the tunnel is ready.
    fn is_ready(&self, line: &str) -> bool;

    /// The error message carried by an output line, if it reports a fatal
    /// startup error.
    fn error_in(&self, line: &str) -> Option<String>;

    /// Environments the remote service offers to a tunnel on `platform`.
    async fn environments(
        &self,
        config: &TunnelConfig,
        client: &reqwest::Client,
        platform: &Platform,
    ) -> TunnelResult<Vec<EnvironmentDescriptor>>;

    /// Reports the final status of a remote session. No-op by default.
    async fn send_job_state(
        &self,
        _config: &TunnelConfig,
        _client: &reqwest::Client,
        _session_id: &str,
        _status: JobStatus,
        _reason: &str,
    ) -> TunnelResult<()> {
        Ok(())
    }
}

/// Install directory shared by every tunnel of a provider version:
/// `<cache dir>/gauntlet/<provider>-<version>`.
///
/// Tunnels only use it when it is set as [`TunnelConfig::directory`].
pub fn cache_directory(provider: &str, version: &str) -> PathBuf {
    cache_dir()
        .join("gauntlet")
        .join(format!("{}-{}", provider, version))
}

fn cache_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CACHE_HOME") {
        return PathBuf::from(xdg);
    }
    if let Ok(home) = std::env::var("HOME") {
        if cfg!(target_os = "macos") {
            return PathBuf::from(home).join("Library").join("Caches");
        }
        return PathBuf::from(home).join(".cache");
    }
    if let Ok(local) = std::env::var("LOCALAPPDATA") {
        return PathBuf::from(local);
    }
    std::env::temp_dir()
}
