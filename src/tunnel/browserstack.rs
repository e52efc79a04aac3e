//! BrowserStack Local: a binary that tunnels BrowserStack's browsers back to
//! a local server.

use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{
    ArchiveKind, Artifact, Command, Credentials, JobStatus, Platform, Protocol, TunnelConfig,
    TunnelError, TunnelProvider, TunnelResult,
};
use crate::environment::EnvironmentDescriptor;

pub const DEFAULT_API_URL: &str = "https://www.browserstack.com";
const DOWNLOADS: &str = "https://www.browserstack.com/browserstack-local";

const READY_PATTERN: &str = "Press Ctrl-C to exit";
const ERROR_PREFIX: &str = "*** Error: ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserStackProvider {
    /// Label for the install directory; the binary itself is unversioned.
    pub version: String,
    /// Kill other running instances of the binary.
    pub force: bool,
    /// Only tunnel Automate sessions.
    pub only_automate: bool,
    /// Skip the server certificate check.
    pub skip_check: bool,
    /// REST API root; overridable for on-premise mirrors.
    pub api_url: String,
}

impl Default for BrowserStackProvider {
    fn default() -> Self {
        Self {
            version: "latest".to_string(),
            force: false,
            only_automate: true,
            skip_check: false,
            api_url: DEFAULT_API_URL.to_string(),
        }
    }
}

impl BrowserStackProvider {
    fn binary(platform: &Platform) -> &'static str {
        if platform.is_windows() {
            "BrowserStackLocal.exe"
        } else {
            "BrowserStackLocal"
        }
    }

    fn credentials(config: &TunnelConfig) -> TunnelResult<&Credentials> {
        config.auth.as_ref().ok_or_else(|| {
            TunnelError::Config("BrowserStack needs a username and access key".to_string())
        })
    }
}

#[async_trait]
impl TunnelProvider for BrowserStackProvider {
    fn name(&self) -> &'static str {
        "browserstack"
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn artifacts(&self, platform: &Platform) -> TunnelResult<Vec<Artifact>> {
        let build = match (platform.os.as_str(), platform.arch.as_str()) {
            ("macos", _) => "darwin-x64",
            ("linux", "x86_64") => "linux-x64",
            ("linux", "x86") => "linux-ia32",
            ("windows", _) => "win32",
            _ => return Err(platform.unsupported()),
        };
        let binary = Self::binary(platform);
        Ok(vec![
            Artifact::archived(
                "BrowserStackLocal",
                format!("{}/BrowserStackLocal-{}.zip", DOWNLOADS, build),
                ArchiveKind::Zip,
                binary,
                binary,
            )
            .executable(),
        ])
    }

    fn command(
        &self,
        config: &TunnelConfig,
        directory: &Path,
        platform: &Platform,
    ) -> TunnelResult<Command> {
        let credentials = Self::credentials(config)?;
        let binary = directory.join(Self::binary(platform));
        let is_https = u8::from(config.protocol == Protocol::Https);

        let mut command = Command::new(binary.display().to_string())
            .secret_arg(&credentials.access_key)
            .arg(format!("{},{},{}", config.hostname, config.port, is_https));

        if self.only_automate {
            command = command.arg("-onlyAutomate");
        }
        if self.force {
            command = command.arg("-force");
        }
        if self.skip_check {
            command = command.arg("-skipCheck");
        }
        if config.verbose {
            command = command.arg("-v");
        }
        if let Some(id) = &config.tunnel_id {
            command = command.arg("-localIdentifier").arg(id);
        }
        if let Some(proxy) = &config.proxy {
            command = command
                .arg("-proxyHost")
                .arg(&proxy.host)
                .arg("-proxyPort")
                .arg(proxy.port.to_string());
            if let Some(user) = &proxy.username {
                command = command.arg("-proxyUser").arg(user);
            }
            if let Some(password) = &proxy.password {
                command = command.arg("-proxyPass").secret_arg(password);
            }
        }

        Ok(command.working_dir(directory.display().to_string()))
    }

    fn is_ready(&self, line: &str) -> bool {
        line.contains(READY_PATTERN)
    }

    fn error_in(&self, line: &str) -> Option<String> {
        line.trim()
            .strip_prefix(ERROR_PREFIX)
            .map(|message| message.trim().to_string())
    }

    async fn environments(
        &self,
        config: &TunnelConfig,
        client: &reqwest::Client,
        _platform: &Platform,
    ) -> TunnelResult<Vec<EnvironmentDescriptor>> {
        let credentials = Self::credentials(config)?;
        let url = format!("{}/automate/browsers.json", self.api_url);
        debug!("GET {}", url);

        let response = client
            .get(&url)
            .basic_auth(&credentials.username, Some(&credentials.access_key))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TunnelError::Http(format!(
                "GET {} returned {}",
                url,
                response.status()
            )));
        }

        let browsers: Vec<serde_json::Map<String, Value>> = response.json().await?;
        Ok(browsers.into_iter().filter_map(descriptor).collect())
    }

    async fn send_job_state(
        &self,
        config: &TunnelConfig,
        client: &reqwest::Client,
        session_id: &str,
        status: JobStatus,
        reason: &str,
    ) -> TunnelResult<()> {
        let credentials = Self::credentials(config)?;
        let url = format!("{}/automate/sessions/{}.json", self.api_url, session_id);
        debug!("PUT {} ({:?})", url, status);

        let response = client
            .put(&url)
            .basic_auth(&credentials.username, Some(&credentials.access_key))
            .json(&serde_json::json!({ "status": status, "reason": reason }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TunnelError::Http(format!(
                "PUT {} returned {}",
                url,
                response.status()
            )));
        }
        Ok(())
    }
}

/// Maps one `browsers.json` record; records without a browser are dropped.
fn descriptor(mut record: serde_json::Map<String, Value>) -> Option<EnvironmentDescriptor> {
    let text = |value: Option<Value>| match value {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        _ => None,
    };

    let browser = text(record.remove("browser"))?;
    let version = text(record.remove("browser_version"));
    let os = text(record.remove("os"));
    let os_version = text(record.remove("os_version"));
    let platform = match (os, os_version) {
        (Some(os), Some(os_version)) => Some(format!("{} {}", os, os_version)),
        (os, None) => os,
        (None, os_version) => os_version,
    };

    let mut descriptor = EnvironmentDescriptor::new(browser);
    descriptor.version = version;
    descriptor.platform = platform;
    descriptor.extra = record
        .into_iter()
        .filter(|(_, value)| !value.is_null())
        .collect();
    Some(descriptor)
}
