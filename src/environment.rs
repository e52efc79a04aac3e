//! Browser environments offered by a tunnel and resolution of requested ones.
//!
//! A tunnel reports the environments it can serve as
//! [`EnvironmentDescriptor`]s. Configuration asks for environments with
//! [`EnvironmentRequest`]s whose `version` may be symbolic:
//!
//! | Version | Meaning |
//! |---------|---------|
//! | unset | Every matching environment, versioned or not |
//! | `76.0` | That exact version |
//! | `latest` | Highest available version |
//! | `latest-2` | Third highest available version |
//! | `70..latest` | Every available version in the inclusive range |
//!
//! Version ordering is numeric per dot-separated component, so `10.0` sorts
//! after `9.1`. Versions that do not parse (`beta`, `dev`) only match
//! exactly.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// One environment a tunnel can serve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentDescriptor {
    pub browser_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    /// Provider specific capabilities (device, os_version, ...).
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl EnvironmentDescriptor {
    pub fn new(browser_name: impl Into<String>) -> Self {
        Self {
            browser_name: browser_name.into(),
            version: None,
            platform: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }
}

impl fmt::Display for EnvironmentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.browser_name)?;
        if let Some(version) = &self.version {
            write!(f, " {}", version)?;
        }
        if let Some(platform) = &self.platform {
            write!(f, " on {}", platform)?;
        }
        Ok(())
    }
}

/// An environment asked for in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentRequest {
    pub browser_name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvironmentError {
    #[error("no environment available for {browser}{}", .platform.as_ref().map(|p| format!(" on {}", p)).unwrap_or_default())]
    NoMatch {
        browser: String,
        platform: Option<String>,
    },

    #[error("{browser} {version} is not available")]
    UnknownVersion { browser: String, version: String },

    #[error("{browser} {alias} is out of range: only {available} versions available")]
    OutOfRange {
        browser: String,
        alias: String,
        available: usize,
    },

    #[error("invalid version expression: {0}")]
    InvalidVersion(String),
}

/// A parsed version expression.
#[derive(Debug, Clone, PartialEq, Eq)]
enum VersionSpec {
    Any,
    Latest(usize),
    Exact(String),
    Range(Box<VersionSpec>, Box<VersionSpec>),
}

impl VersionSpec {
    fn parse(raw: Option<&str>) -> Result<Self, EnvironmentError> {
        let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
            return Ok(VersionSpec::Any);
        };

        if let Some((low, high)) = raw.split_once("..") {
            let low = Self::parse_single(low.trim(), raw)?;
            let high = Self::parse_single(high.trim(), raw)?;
            return Ok(VersionSpec::Range(Box::new(low), Box::new(high)));
        }

        Self::parse_single(raw, raw)
    }

    fn parse_single(part: &str, whole: &str) -> Result<Self, EnvironmentError> {
        if part.is_empty() {
            return Err(EnvironmentError::InvalidVersion(whole.to_string()));
        }
        if part == "latest" {
            return Ok(VersionSpec::Latest(0));
        }
        if let Some(offset) = part.strip_prefix("latest-") {
            return offset
                .parse()
                .map(VersionSpec::Latest)
                .map_err(|_| EnvironmentError::InvalidVersion(whole.to_string()));
        }
        Ok(VersionSpec::Exact(part.to_string()))
    }
}

fn numeric_key(version: &str) -> Option<Vec<u64>> {
    version
        .split('.')
        .map(|part| part.trim().parse::<u64>().ok())
        .collect()
}

fn compare_versions(a: &[u64], b: &[u64]) -> Ordering {
    let len = a.len().max(b.len());
    for i in 0..len {
        let left = a.get(i).copied().unwrap_or(0);
        let right = b.get(i).copied().unwrap_or(0);
        match left.cmp(&right) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

fn same_name(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Distinct numeric versions, ascending.
fn sorted_versions(candidates: &[&EnvironmentDescriptor]) -> Vec<(Vec<u64>, String)> {
    let mut versions: Vec<(Vec<u64>, String)> = candidates
        .iter()
        .filter_map(|env| env.version.as_deref())
        .filter_map(|version| numeric_key(version).map(|key| (key, version.to_string())))
        .collect();
    versions.sort_by(|a, b| compare_versions(&a.0, &b.0));
    versions.dedup_by(|a, b| compare_versions(&a.0, &b.0) == Ordering::Equal);
    versions
}

/// Resolves requests against the environments a tunnel reports.
///
/// The result keeps request order; within one request environments are
/// ordered by ascending version.
///
/// ```
/// use gauntlet::environment::{EnvironmentDescriptor, EnvironmentRequest, resolve};
///
/// let available = vec![
///     EnvironmentDescriptor::new("chrome").with_version("74.0"),
///     EnvironmentDescriptor::new("chrome").with_version("75.0"),
///     EnvironmentDescriptor::new("chrome").with_version("76.0"),
/// ];
/// let requests = vec![EnvironmentRequest {
///     browser_name: "chrome".to_string(),
///     version: Some("latest-1..latest".to_string()),
///     platform: None,
/// }];
///
/// let resolved = resolve(&requests, &available).unwrap();
/// let versions: Vec<_> = resolved.iter().filter_map(|e| e.version.as_deref()).collect();
/// assert_eq!(versions, ["75.0", "76.0"]);
/// ```
pub fn resolve(
    requests: &[EnvironmentRequest],
    available: &[EnvironmentDescriptor],
) -> Result<Vec<EnvironmentDescriptor>, EnvironmentError> {
    let mut resolved = Vec::new();
    for request in requests {
        resolved.extend(resolve_one(request, available)?);
    }
    Ok(resolved)
}

fn resolve_one(
    request: &EnvironmentRequest,
    available: &[EnvironmentDescriptor],
) -> Result<Vec<EnvironmentDescriptor>, EnvironmentError> {
    let spec = VersionSpec::parse(request.version.as_deref())?;

    let candidates: Vec<&EnvironmentDescriptor> = available
        .iter()
        .filter(|env| same_name(&env.browser_name, &request.browser_name))
        .filter(|env| match (&request.platform, &env.platform) {
            (Some(wanted), Some(actual)) => same_name(wanted, actual),
            (Some(_), None) => true,
            (None, _) => true,
        })
        .collect();

    if candidates.is_empty() {
        return Err(EnvironmentError::NoMatch {
            browser: request.browser_name.clone(),
            platform: request.platform.clone(),
        });
    }

    let versions = sorted_versions(&candidates);

    // A provider that does not report versions serves whatever it has.
    if versions.is_empty() && !matches!(spec, VersionSpec::Exact(_)) {
        return Ok(candidates.into_iter().cloned().collect());
    }

    let selected: Vec<String> = match &spec {
        VersionSpec::Any => return Ok(order_by_version(candidates)),
        VersionSpec::Exact(version) => {
            let exists = candidates
                .iter()
                .any(|env| env.version.as_deref() == Some(version.as_str()));
            if !exists {
                return Err(EnvironmentError::UnknownVersion {
                    browser: request.browser_name.clone(),
                    version: version.clone(),
                });
            }
            vec![version.clone()]
        }
        VersionSpec::Latest(_) => {
            let index = bound_index(&spec, &versions, request)?;
            vec![versions[index].1.clone()]
        }
        VersionSpec::Range(low, high) => {
            let low = bound_index(low, &versions, request)?;
            let high = bound_index(high, &versions, request)?;
            let (low, high) = if low <= high { (low, high) } else { (high, low) };
            versions[low..=high]
                .iter()
                .map(|(_, version)| version.clone())
                .collect()
        }
    };

    Ok(selected
        .iter()
        .flat_map(|version| {
            candidates
                .iter()
                .filter(move |env| env.version.as_deref() == Some(version.as_str()))
                .map(|env| (*env).clone())
        })
        .collect())
}

/// Position of a single (non-range) bound in the ascending version list.
fn bound_index(
    spec: &VersionSpec,
    versions: &[(Vec<u64>, String)],
    request: &EnvironmentRequest,
) -> Result<usize, EnvironmentError> {
    match spec {
        VersionSpec::Latest(offset) => {
            versions
                .len()
                .checked_sub(offset + 1)
                .ok_or_else(|| EnvironmentError::OutOfRange {
                    browser: request.browser_name.clone(),
                    alias: if *offset == 0 {
                        "latest".to_string()
                    } else {
                        format!("latest-{}", offset)
                    },
                    available: versions.len(),
                })
        }
        VersionSpec::Exact(version) => {
            let key = numeric_key(version)
                .ok_or_else(|| EnvironmentError::InvalidVersion(version.clone()))?;
            versions
                .iter()
                .position(|(candidate, _)| compare_versions(candidate, &key) == Ordering::Equal)
                .ok_or_else(|| EnvironmentError::UnknownVersion {
                    browser: request.browser_name.clone(),
                    version: version.clone(),
                })
        }
        VersionSpec::Any | VersionSpec::Range(..) => Err(EnvironmentError::InvalidVersion(
            request.version.clone().unwrap_or_default(),
        )),
    }
}

fn order_by_version(mut candidates: Vec<&EnvironmentDescriptor>) -> Vec<EnvironmentDescriptor> {
    candidates.sort_by(|a, b| {
        let a = a.version.as_deref().and_then(numeric_key);
        let b = b.version.as_deref().and_then(numeric_key);
        match (a, b) {
            (Some(a), Some(b)) => compare_versions(&a, &b),
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    });
    candidates.into_iter().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chrome(version: &str) -> EnvironmentDescriptor {
        EnvironmentDescriptor::new("chrome").with_version(version)
    }

    fn request(browser: &str, version: Option<&str>) -> EnvironmentRequest {
        EnvironmentRequest {
            browser_name: browser.to_string(),
            version: version.map(str::to_string),
            platform: None,
        }
    }

    fn versions(resolved: &[EnvironmentDescriptor]) -> Vec<&str> {
        resolved
            .iter()
            .filter_map(|env| env.version.as_deref())
            .collect()
    }

    fn available() -> Vec<EnvironmentDescriptor> {
        vec![
            chrome("9.1"),
            chrome("10.0"),
            chrome("74.0"),
            chrome("beta"),
            EnvironmentDescriptor::new("firefox").with_version("66.0"),
        ]
    }

    #[test]
    fn test_latest_uses_numeric_order() {
        let resolved = resolve(&[request("chrome", Some("latest"))], &available()).unwrap();
        assert_eq!(versions(&resolved), ["74.0"]);

        let resolved = resolve(&[request("Chrome", Some("latest-2"))], &available()).unwrap();
        assert_eq!(versions(&resolved), ["9.1"]);
    }

    #[test]
    fn test_latest_offset_out_of_range() {
        let err = resolve(&[request("chrome", Some("latest-3"))], &available()).unwrap_err();
        assert!(matches!(err, EnvironmentError::OutOfRange { available: 3, .. }));
    }

    #[test]
    fn test_range_with_exact_and_alias_bounds() {
        let resolved = resolve(&[request("chrome", Some("10..latest"))], &available()).unwrap();
        assert_eq!(versions(&resolved), ["10.0", "74.0"]);
    }

    #[test]
    fn test_exact_non_numeric_version_matches() {
        let resolved = resolve(&[request("chrome", Some("beta"))], &available()).unwrap();
        assert_eq!(versions(&resolved), ["beta"]);

        let err = resolve(&[request("chrome", Some("11.0"))], &available()).unwrap_err();
        assert!(matches!(err, EnvironmentError::UnknownVersion { .. }));
    }

    #[test]
    fn test_unset_version_returns_every_match() {
        let resolved = resolve(&[request("chrome", None)], &available()).unwrap();
        assert_eq!(resolved.len(), 4);
        assert_eq!(resolved[0].version.as_deref(), Some("beta"));
    }

    #[test]
    fn test_unversioned_provider_serves_aliases() {
        let available = vec![EnvironmentDescriptor::new("firefox")];
        let resolved = resolve(&[request("firefox", Some("latest"))], &available).unwrap();
        assert_eq!(resolved, available);
    }

    #[test]
    fn test_unknown_browser_is_an_error() {
        let err = resolve(&[request("safari", None)], &available()).unwrap_err();
        assert_eq!(err.to_string(), "no environment available for safari");
    }

    #[test]
    fn test_platform_filter() {
        let available = vec![
            chrome("76.0").with_platform("Windows 10"),
            chrome("76.0").with_platform("OS X Mojave"),
        ];
        let mut req = request("chrome", Some("latest"));
        req.platform = Some("os x mojave".to_string());

        let resolved = resolve(&[req], &available).unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].platform.as_deref(), Some("OS X Mojave"));
    }

    #[test]
    fn test_descriptor_keeps_extra_capabilities() {
        let json = r#"{"browser_name":"chrome","version":"76.0","os_version":"10","device":null}"#;
        let env: EnvironmentDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(env.extra.get("os_version"), Some(&serde_json::json!("10")));
        assert_eq!(env.to_string(), "chrome 76.0");
    }

    #[test]
    fn test_invalid_expression() {
        let err = resolve(&[request("chrome", Some("latest-x"))], &available()).unwrap_err();
        assert_eq!(err, EnvironmentError::InvalidVersion("latest-x".to_string()));
    }
}
