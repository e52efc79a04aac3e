//! Run-wide options and the context threaded through a suite run.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use regex::Regex;

use crate::report::{Event, Hub};

/// Timeout applied when neither the test nor any enclosing suite sets one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Options that apply to a whole run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub default_timeout: Duration,
    /// Only tests whose id matches run; the rest are skipped.
    pub grep: Option<Regex>,
    /// Skip everything after the first failed test.
    pub bail: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_TIMEOUT,
            grep: None,
            bail: false,
        }
    }
}

/// Shared state for one run: event hub, options, bail flag, and the
/// timeout in effect at the current depth of the suite tree.
///
/// Cloning is cheap. [`RunContext::scoped`] derives a child context whose
/// timeout is overridden by a suite, leaving the parent untouched.
#[derive(Clone)]
pub struct RunContext {
    hub: Arc<Hub>,
    options: Arc<RunOptions>,
    timeout: Duration,
    bailed: Arc<AtomicBool>,
}

impl RunContext {
    pub fn new(options: RunOptions, hub: Hub) -> Self {
        Self {
            timeout: options.default_timeout,
            hub: Arc::new(hub),
            options: Arc::new(options),
            bailed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Context for the contents of a suite with the given timeout override.
    pub fn scoped(&self, timeout: Option<Duration>) -> Self {
        let mut scoped = self.clone();
        if let Some(timeout) = timeout {
            scoped.timeout = timeout;
        }
        scoped
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub async fn emit(&self, event: Event) {
        self.hub.emit(&event).await;
    }

    pub fn bail(&self) {
        self.bailed.store(true, Ordering::SeqCst);
    }

    pub fn is_bailed(&self) -> bool {
        self.bailed.load(Ordering::SeqCst)
    }

    pub fn grep_matches(&self, id: &str) -> bool {
        self.options
            .grep
            .as_ref()
            .is_none_or(|pattern| pattern.is_match(id))
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new(RunOptions::default(), Hub::new())
    }
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("options", &self.options)
            .field("timeout", &self.timeout)
            .field("bailed", &self.is_bailed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_overrides_only_when_set() {
        let ctx = RunContext::default();
        assert_eq!(ctx.timeout(), DEFAULT_TIMEOUT);

        let inner = ctx.scoped(Some(Duration::from_millis(5)));
        assert_eq!(inner.timeout(), Duration::from_millis(5));
        assert_eq!(inner.scoped(None).timeout(), Duration::from_millis(5));
        assert_eq!(ctx.timeout(), DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_bail_flag_is_shared_between_scopes() {
        let ctx = RunContext::default();
        let inner = ctx.scoped(Some(Duration::from_secs(1)));

        inner.bail();
        assert!(ctx.is_bailed());
    }

    #[test]
    fn test_grep_matches_everything_without_pattern() {
        let ctx = RunContext::default();
        assert!(ctx.grep_matches("anything - at all"));

        let options = RunOptions {
            grep: Some(Regex::new("^login").unwrap()),
            ..RunOptions::default()
        };
        let ctx = RunContext::new(options, Hub::new());
        assert!(ctx.grep_matches("login - works"));
        assert!(!ctx.grep_matches("profile - login"));
    }
}
