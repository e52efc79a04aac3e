//! A single runnable test case.

use std::time::{Duration, Instant};

use tracing::debug;

use super::ID_SEPARATOR;
use super::body::{Settlement, SharedRemote, TestBody, TestContext};
use super::context::RunContext;
use crate::report::{Event, TestReport};
use crate::suite::TestError;

/// A named test body plus the state of its last run.
///
/// `has_passed` and `error` are only meaningful after [`Test::run`]:
/// `error` is set exactly when `has_passed == Some(false)`, and a skipped
/// test never has `has_passed` set.
#[derive(Debug)]
pub struct Test {
    pub name: String,
    ancestors: Vec<String>,
    body: TestBody,
    /// Overrides the suite timeout for this test.
    pub timeout: Option<Duration>,
    pending_skip: Option<String>,
    pub skipped: Option<String>,
    pub has_passed: Option<bool>,
    pub error: Option<TestError>,
    pub time_elapsed: Option<Duration>,
    remote: Option<SharedRemote>,
}

impl Test {
    pub fn new(name: impl Into<String>, body: TestBody) -> Self {
        Self {
            name: name.into(),
            ancestors: Vec::new(),
            body,
            timeout: None,
            pending_skip: None,
            skipped: None,
            has_passed: None,
            error: None,
            time_elapsed: None,
            remote: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Marks the test so that it is reported as skipped instead of run.
    pub fn with_skip(mut self, reason: impl Into<String>) -> Self {
        self.pending_skip = Some(reason.into());
        self
    }

    pub(crate) fn pending_skip(&self) -> Option<&str> {
        self.pending_skip.as_deref()
    }

    /// Full id: ancestor names and own name joined with `" - "`.
    pub fn id(&self) -> String {
        self.ancestors
            .iter()
            .map(String::as_str)
            .chain((!self.name.is_empty()).then_some(self.name.as_str()))
            .collect::<Vec<_>>()
            .join(ID_SEPARATOR)
    }

    pub fn remote(&self) -> Option<&SharedRemote> {
        self.remote.as_ref()
    }

    pub fn report(&self) -> TestReport {
        TestReport {
            id: self.id(),
            name: self.name.clone(),
            skipped: self.skipped.clone(),
            has_passed: self.has_passed,
            error: self.error.clone(),
            time_elapsed: self.time_elapsed,
        }
    }

    pub(super) fn adopt(&mut self, ancestors: Vec<String>, remote: Option<SharedRemote>) {
        self.ancestors = ancestors;
        self.remote = remote;
    }

    fn reset(&mut self) {
        self.skipped = None;
        self.has_passed = None;
        self.error = None;
        self.time_elapsed = None;
    }

    pub(super) async fn mark_skipped(&mut self, reason: &str, ctx: &RunContext) {
        self.reset();
        self.skipped = Some(reason.to_string());
        ctx.emit(Event::TestSkip(self.report())).await;
    }

    /// Runs the body once and records the outcome. Never fails.
    pub async fn run(&mut self, ctx: &RunContext) {
        if let Some(reason) = self.pending_skip.clone() {
            self.mark_skipped(&reason, ctx).await;
            return;
        }

        self.reset();
        ctx.emit(Event::TestStart(self.report())).await;

        let timeout = self.timeout.unwrap_or_else(|| ctx.timeout());
        let test_ctx = TestContext::new(self.id(), timeout, self.remote.clone());

        let start = Instant::now();
        let settlement = self.body.invoke(test_ctx, timeout).await;
        self.time_elapsed = Some(start.elapsed());

        match settlement {
            Settlement::Passed => {
                self.has_passed = Some(true);
                ctx.emit(Event::TestPass(self.report())).await;
            }
            Settlement::Skipped(reason) => {
                debug!("Test {} skipped: {}", self.id(), reason);
                self.skipped = Some(reason);
                ctx.emit(Event::TestSkip(self.report())).await;
            }
            Settlement::Failed(error) => {
                debug!("Test {} failed: {}", self.id(), error);
                self.has_passed = Some(false);
                self.error = Some(error);
                ctx.emit(Event::TestFail(self.report())).await;
            }
        }

        ctx.emit(Event::TestEnd(self.report())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    use crate::report::{EventKind, EventLog, Hub};
    use crate::suite::{RunOptions, TestErrorKind};

    #[tokio::test]
    async fn test_passing_test_records_success() {
        let mut test = Test::new("ok", TestBody::sync(|_| Ok(())));
        test.run(&RunContext::default()).await;

        assert_eq!(test.has_passed, Some(true));
        assert!(test.error.is_none());
        assert!(test.skipped.is_none());
        assert!(test.time_elapsed.is_some());
    }

    #[tokio::test]
    async fn test_async_body_exceeding_timeout_fails() {
        let mut test = Test::new(
            "slow",
            TestBody::future(|_| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            }),
        )
        .with_timeout(Duration::from_millis(50));

        test.run(&RunContext::default()).await;

        assert_eq!(test.has_passed, Some(false));
        let error = test.error.as_ref().unwrap();
        assert_eq!(error.kind, TestErrorKind::Timeout);
        assert!(error.message.contains("50ms"));
    }

    #[tokio::test]
    async fn test_timeout_falls_back_to_context_default() {
        let options = RunOptions {
            default_timeout: Duration::from_millis(30),
            ..RunOptions::default()
        };
        let ctx = RunContext::new(options, Hub::new());
        let mut test = Test::new(
            "slow",
            TestBody::future(|ctx| async move {
                anyhow::ensure!(ctx.timeout() == Duration::from_millis(30));
                futures::future::pending::<()>().await;
                Ok(())
            }),
        );

        test.run(&ctx).await;

        assert!(test.error.as_ref().unwrap().is_timeout());
    }

    #[tokio::test]
    async fn test_failure_keeps_error_context() {
        let mut test = Test::new(
            "fails",
            TestBody::future(|_| async {
                "x".parse::<u32>().context("reading fixture")?;
                Ok(())
            }),
        );

        test.run(&RunContext::default()).await;

        let error = test.error.as_ref().unwrap();
        assert_eq!(error.kind, TestErrorKind::Failure);
        assert!(error.message.starts_with("reading fixture: "));
        assert!(error.cause().is_some());
    }

    #[tokio::test]
    async fn test_skip_leaves_has_passed_unset() {
        let mut test = Test::new("skips", TestBody::sync(|ctx| Err(ctx.skip("later"))));
        test.run(&RunContext::default()).await;

        assert_eq!(test.skipped.as_deref(), Some("later"));
        assert_eq!(test.has_passed, None);
        assert!(test.error.is_none());
    }

    #[tokio::test]
    async fn test_preset_skip_never_invokes_body() {
        let log = EventLog::new();
        let ctx = RunContext::new(RunOptions::default(), Hub::new().with_reporter(log.clone()));
        let mut test = Test::new("never", TestBody::sync(|_| panic!("must not run")))
            .with_skip("pending");

        test.run(&ctx).await;

        assert_eq!(test.skipped.as_deref(), Some("pending"));
        assert_eq!(log.kinds(), vec![EventKind::TestSkip]);
    }

    #[tokio::test]
    async fn test_rerun_resets_previous_outcome() {
        let flag = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fail = std::sync::Arc::clone(&flag);
        let mut test = Test::new(
            "flips",
            TestBody::sync(move |_| {
                if fail.load(std::sync::atomic::Ordering::SeqCst) {
                    anyhow::bail!("now failing");
                }
                Ok(())
            }),
        );

        test.run(&RunContext::default()).await;
        assert_eq!(test.has_passed, Some(true));

        flag.store(true, std::sync::atomic::Ordering::SeqCst);
        test.run(&RunContext::default()).await;
        assert_eq!(test.has_passed, Some(false));
        assert_eq!(test.error.as_ref().unwrap().message, "now failing");
    }
}
