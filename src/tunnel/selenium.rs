//! Selenium standalone server with locally installed browser drivers.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    ArchiveKind, Artifact, Command, Platform, TunnelConfig, TunnelProvider, TunnelResult,
};
use crate::environment::EnvironmentDescriptor;

pub const DEFAULT_VERSION: &str = "3.141.59";
pub const DEFAULT_CHROMEDRIVER_VERSION: &str = "2.46";
pub const DEFAULT_GECKODRIVER_VERSION: &str = "0.24.0";

pub const SELENIUM_RELEASES: &str = "https://selenium-release.storage.googleapis.com";
const CHROMEDRIVER_RELEASES: &str = "https://chromedriver.storage.googleapis.com";
const GECKODRIVER_RELEASES: &str = "https://github.com/mozilla/geckodriver/releases/download";

const READY_PATTERNS: &[&str] = &[
    "Selenium Server is up and running",
    "Started Selenium Standalone",
];
const ERROR_PATTERNS: &[&str] = &["Address already in use", "Failed to start"];

/// A browser driver the server can delegate to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Driver {
    Chrome,
    Firefox,
    /// Internet Explorer; only installed on Windows.
    Ie,
}

impl Driver {
    fn browser_name(self) -> &'static str {
        match self {
            Driver::Chrome => "chrome",
            Driver::Firefox => "firefox",
            Driver::Ie => "internet explorer",
        }
    }

    fn system_property(self) -> &'static str {
        match self {
            Driver::Chrome => "webdriver.chrome.driver",
            Driver::Firefox => "webdriver.gecko.driver",
            Driver::Ie => "webdriver.ie.driver",
        }
    }

    fn binary(self, platform: &Platform) -> String {
        let name = match self {
            Driver::Chrome => "chromedriver",
            Driver::Firefox => "geckodriver",
            Driver::Ie => "IEDriverServer",
        };
        if platform.is_windows() {
            format!("{}.exe", name)
        } else {
            name.to_string()
        }
    }

    fn available_on(self, platform: &Platform) -> bool {
        self != Driver::Ie || platform.is_windows()
    }
}

/// Runs `selenium-server-standalone` under `java`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeleniumProvider {
    pub version: String,
    pub drivers: Vec<Driver>,
    pub chromedriver_version: String,
    pub geckodriver_version: String,
    /// Where the server jar and IE driver are fetched from.
    pub base_url: String,
}

impl Default for SeleniumProvider {
    fn default() -> Self {
        Self {
            version: DEFAULT_VERSION.to_string(),
            drivers: vec![Driver::Chrome, Driver::Firefox],
            chromedriver_version: DEFAULT_CHROMEDRIVER_VERSION.to_string(),
            geckodriver_version: DEFAULT_GECKODRIVER_VERSION.to_string(),
            base_url: SELENIUM_RELEASES.to_string(),
        }
    }
}

impl SeleniumProvider {
    pub fn new(version: impl Into<String>, drivers: Vec<Driver>) -> Self {
        Self {
            version: version.into(),
            drivers,
            ..Self::default()
        }
    }

    fn jar(&self) -> String {
        format!("selenium-server-standalone-{}.jar", self.version)
    }

    /// Release bucket directory: "3.141" for "3.141.59".
    fn release(&self) -> String {
        let mut parts = self.version.split('.');
        match (parts.next(), parts.next()) {
            (Some(major), Some(minor)) => format!("{}.{}", major, minor),
            _ => self.version.clone(),
        }
    }

    fn driver_artifact(&self, driver: Driver, platform: &Platform) -> TunnelResult<Artifact> {
        let binary = driver.binary(platform);
        let artifact = match driver {
            Driver::Chrome => {
                let build = match (platform.os.as_str(), platform.arch.as_str()) {
                    ("linux", "x86_64") => "linux64",
                    ("macos", "x86_64" | "aarch64") => "mac64",
                    ("windows", _) => "win32",
                    _ => return Err(platform.unsupported()),
                };
                Artifact::archived(
                    "chromedriver",
                    format!(
                        "{}/{}/chromedriver_{}.zip",
                        CHROMEDRIVER_RELEASES, self.chromedriver_version, build
                    ),
                    ArchiveKind::Zip,
                    binary.clone(),
                    binary,
                )
            }
            Driver::Firefox => {
                let (build, archive, extension) =
                    match (platform.os.as_str(), platform.arch.as_str()) {
                        ("linux", "x86_64") => ("linux64", ArchiveKind::TarGz, "tar.gz"),
                        ("linux", "x86") => ("linux32", ArchiveKind::TarGz, "tar.gz"),
                        ("macos", "x86_64" | "aarch64") => ("macos", ArchiveKind::TarGz, "tar.gz"),
                        ("windows", "x86_64") => ("win64", ArchiveKind::Zip, "zip"),
                        ("windows", "x86") => ("win32", ArchiveKind::Zip, "zip"),
                        _ => return Err(platform.unsupported()),
                    };
                let version = &self.geckodriver_version;
                Artifact::archived(
                    "geckodriver",
                    format!(
                        "{}/v{}/geckodriver-v{}-{}.{}",
                        GECKODRIVER_RELEASES, version, version, build, extension
                    ),
                    archive,
                    binary.clone(),
                    binary,
                )
            }
            Driver::Ie => {
                let build = if platform.arch == "x86_64" { "x64" } else { "Win32" };
                Artifact::archived(
                    "IEDriverServer",
                    format!(
                        "{}/{}/IEDriverServer_{}_{}.zip",
                        self.base_url,
                        self.release(),
                        build,
                        self.version
                    ),
                    ArchiveKind::Zip,
                    binary.clone(),
                    binary,
                )
            }
        };
        Ok(artifact.executable())
    }
}

#[async_trait]
impl TunnelProvider for SeleniumProvider {
    fn name(&self) -> &'static str {
        "selenium"
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn artifacts(&self, platform: &Platform) -> TunnelResult<Vec<Artifact>> {
        let mut artifacts = vec![Artifact::raw(
            "selenium-server",
            format!("{}/{}/{}", self.base_url, self.release(), self.jar()),
            self.jar(),
        )];
        for driver in &self.drivers {
            if driver.available_on(platform) {
                artifacts.push(self.driver_artifact(*driver, platform)?);
            }
        }
        Ok(artifacts)
    }

    fn command(
        &self,
        config: &TunnelConfig,
        directory: &Path,
        platform: &Platform,
    ) -> TunnelResult<Command> {
        let mut command = Command::new("java");
        for driver in &self.drivers {
            if driver.available_on(platform) {
                let path = directory.join(driver.binary(platform));
                command = command.arg(format!(
                    "-D{}={}",
                    driver.system_property(),
                    path.display()
                ));
            }
        }
        Ok(command
            .arg("-jar")
            .arg(directory.join(self.jar()).display().to_string())
            .arg("-port")
            .arg(config.port.to_string())
            .working_dir(directory.display().to_string()))
    }

    fn is_ready(&self, line: &str) -> bool {
        READY_PATTERNS.iter().any(|pattern| line.contains(pattern))
    }

    fn error_in(&self, line: &str) -> Option<String> {
        let line = line.trim();
        let failed = line.starts_with("Exception in thread")
            || ERROR_PATTERNS.iter().any(|pattern| line.contains(pattern));
        failed.then(|| line.to_string())
    }

    async fn environments(
        &self,
        _config: &TunnelConfig,
        _client: &reqwest::Client,
        platform: &Platform,
    ) -> TunnelResult<Vec<EnvironmentDescriptor>> {
        Ok(self
            .drivers
            .iter()
            .filter(|driver| driver.available_on(platform))
            .map(|driver| EnvironmentDescriptor::new(driver.browser_name()))
            .collect())
    }
}
