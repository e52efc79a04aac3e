//! Hierarchical suites, tests, and the lifecycle state machine that runs them.
//!
//! # Structure
//!
//! A [`Suite`] owns an ordered list of children, each either a [`Test`] or a
//! nested [`Suite`]. Suites carry four optional [`Hook`]s:
//!
//! ```text
//! Suite::run
//! ├── before                      (once)
//! ├── for each child, in order
//! │   ├── before_each
//! │   ├── child.run()             (Test or nested Suite)
//! │   └── after_each
//! └── after                       (once, always attempted)
//! ```
//!
//! # Failure isolation
//!
//! | Failure | Effect |
//! |---------|--------|
//! | Test body fails or times out | Recorded on the test; siblings keep running |
//! | `before` fails | Recorded as [`Suite::error`]; no children run; `after` still runs |
//! | `before_each` / `after_each` fails | Recorded as [`Suite::error`]; remaining children never run |
//! | `after` fails | Recorded as [`Suite::error`] unless an earlier error exists |
//!
//! `run()` never fails. A nested suite's fatal error stays on that suite, so
//! the parent carries on with its next child.
//!
//! # Example
//!
//! ```
//! use gauntlet::suite::{Hook, RunContext, Suite, Test, TestBody};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut suite = Suite::new("math")
//!     .with_before_each(Hook::sync(|_| Ok(())))
//!     .with_test(Test::new("adds", TestBody::sync(|_| {
//!         anyhow::ensure!(1 + 1 == 2);
//!         Ok(())
//!     })))
//!     .with_test(Test::new("fails", TestBody::sync(|_| {
//!         anyhow::bail!("nope")
//!     })));
//!
//! suite.run(&RunContext::default()).await;
//!
//! assert_eq!(suite.num_tests(), 2);
//! assert_eq!(suite.num_failed_tests(), 1);
//! assert!(suite.error.is_none());
//! # }
//! ```

pub mod body;
pub mod context;
pub mod registry;
mod test;

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use crate::report::{Event, SuiteReport};

pub use body::{
    Done, Hook, HookContext, RemoteSession, SharedRemote, SkipSignal, StaticSession, TestBody,
    TestContext, skip,
};
use body::Settlement;
pub use context::{RunContext, RunOptions};
pub use registry::{Registry, SuiteBuilder};
pub use test::Test;

/// Separator between ancestor names in an id.
pub const ID_SEPARATOR: &str = " - ";

/// Skip reason for tests excluded by the grep filter.
pub const GREP_SKIP_REASON: &str = "grep";

/// Skip reason for tests not run because an earlier test failed in bail mode.
pub const BAIL_SKIP_REASON: &str = "bailed";

/// Category of a [`TestError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestErrorKind {
    /// The body returned an error or rejected its completion handle.
    Failure,
    /// The body or hook did not settle within its timeout.
    Timeout,
    /// The body or hook panicked.
    Panic,
}

impl fmt::Display for TestErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestErrorKind::Failure => write!(f, "failure"),
            TestErrorKind::Timeout => write!(f, "timeout"),
            TestErrorKind::Panic => write!(f, "panic"),
        }
    }
}

/// A captured test or hook failure.
///
/// Whatever the body produced is coerced into this shape: errors keep their
/// full context chain in `message`, panics keep their payload text.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct TestError {
    pub kind: TestErrorKind,
    pub message: String,
    cause: Option<Arc<anyhow::Error>>,
}

impl TestError {
    pub fn new(kind: TestErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    pub(crate) fn failure(error: anyhow::Error) -> Self {
        Self::shared_failure(Arc::new(error))
    }

    pub(crate) fn shared_failure(error: Arc<anyhow::Error>) -> Self {
        Self {
            kind: TestErrorKind::Failure,
            message: format!("{:#}", error),
            cause: Some(error),
        }
    }

    pub(crate) fn timeout(id: &str, timeout: Duration) -> Self {
        Self::new(
            TestErrorKind::Timeout,
            format!("Timeout of {}ms reached on {}", timeout.as_millis(), id),
        )
    }

    pub(crate) fn panic(payload: Box<dyn Any + Send>) -> Self {
        let detail = if let Some(text) = payload.downcast_ref::<&str>() {
            (*text).to_string()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::new(TestErrorKind::Panic, format!("panicked: {}", detail))
    }

    /// The original error, when the failure came from an `anyhow::Error`.
    pub fn cause(&self) -> Option<&anyhow::Error> {
        self.cause.as_deref()
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == TestErrorKind::Timeout
    }
}

/// Which lifecycle hook a [`SuiteError`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    Before,
    BeforeEach,
    AfterEach,
    After,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookKind::Before => write!(f, "before"),
            HookKind::BeforeEach => write!(f, "beforeEach"),
            HookKind::AfterEach => write!(f, "afterEach"),
            HookKind::After => write!(f, "after"),
        }
    }
}

/// A fatal suite error: a lifecycle hook failed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{hook} hook failed: {error}")]
pub struct SuiteError {
    pub hook: HookKind,
    pub error: TestError,
}

/// A child of a [`Suite`].
#[derive(Debug)]
pub enum Node {
    Test(Test),
    Suite(Suite),
}

impl Node {
    pub fn name(&self) -> &str {
        match self {
            Node::Test(test) => &test.name,
            Node::Suite(suite) => &suite.name,
        }
    }

    pub fn id(&self) -> String {
        match self {
            Node::Test(test) => test.id(),
            Node::Suite(suite) => suite.id(),
        }
    }

    pub fn num_tests(&self) -> usize {
        match self {
            Node::Test(_) => 1,
            Node::Suite(suite) => suite.num_tests(),
        }
    }

    pub fn num_failed_tests(&self) -> usize {
        match self {
            Node::Test(test) => usize::from(test.has_passed == Some(false)),
            Node::Suite(suite) => suite.num_failed_tests(),
        }
    }

    pub fn num_skipped_tests(&self) -> usize {
        match self {
            Node::Test(test) => usize::from(test.skipped.is_some()),
            Node::Suite(suite) => suite.num_skipped_tests(),
        }
    }

    fn adopt(&mut self, ancestors: Vec<String>, remote: Option<SharedRemote>) {
        match self {
            Node::Test(test) => test.adopt(ancestors, remote),
            Node::Suite(suite) => suite.adopt(ancestors, remote),
        }
    }

    /// Pre-run skip reason, if this child must not run at all.
    fn skip_reason(&self, ctx: &RunContext) -> Option<String> {
        if ctx.is_bailed() {
            return Some(BAIL_SKIP_REASON.to_string());
        }
        match self {
            Node::Test(test) => test.pending_skip().map(str::to_string).or_else(|| {
                (!ctx.grep_matches(&test.id())).then(|| GREP_SKIP_REASON.to_string())
            }),
            Node::Suite(suite) => suite.skipped.clone().or_else(|| {
                (!suite.has_grep_match(ctx)).then(|| GREP_SKIP_REASON.to_string())
            }),
        }
    }

    async fn mark_skipped(&mut self, reason: &str, ctx: &RunContext) {
        match self {
            Node::Test(test) => test.mark_skipped(reason, ctx).await,
            Node::Suite(suite) => suite.mark_skipped(reason, ctx).await,
        }
    }

    fn failed(&self) -> bool {
        match self {
            Node::Test(test) => test.has_passed == Some(false),
            Node::Suite(suite) => suite.error.is_some() || suite.num_failed_tests() > 0,
        }
    }
}

/// A named, ordered collection of tests and nested suites with hooks.
#[derive(Debug)]
pub struct Suite {
    pub name: String,
    ancestors: Vec<String>,
    children: Vec<Node>,
    pub before: Option<Hook>,
    pub before_each: Option<Hook>,
    pub after_each: Option<Hook>,
    pub after: Option<Hook>,
    /// Default timeout for the tests and hooks below this suite.
    pub timeout: Option<Duration>,
    /// Reason the suite is skipped, when set before or during a run.
    pub skipped: Option<String>,
    /// The first fatal error of the last run.
    pub error: Option<SuiteError>,
    /// Hook failures that happened after `error` was already recorded.
    pub secondary_errors: Vec<SuiteError>,
    pub time_elapsed: Option<Duration>,
    remote: Option<SharedRemote>,
    inherited_remote: Option<SharedRemote>,
}

impl Suite {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ancestors: Vec::new(),
            children: Vec::new(),
            before: None,
            before_each: None,
            after_each: None,
            after: None,
            timeout: None,
            skipped: None,
            error: None,
            secondary_errors: Vec::new(),
            time_elapsed: None,
            remote: None,
            inherited_remote: None,
        }
    }

    pub fn with_test(mut self, test: Test) -> Self {
        self.add_test(test);
        self
    }

    pub fn with_suite(mut self, suite: Suite) -> Self {
        self.add_suite(suite);
        self
    }

    pub fn with_before(mut self, hook: Hook) -> Self {
        self.before = Some(hook);
        self
    }

    pub fn with_before_each(mut self, hook: Hook) -> Self {
        self.before_each = Some(hook);
        self
    }

    pub fn with_after_each(mut self, hook: Hook) -> Self {
        self.after_each = Some(hook);
        self
    }

    pub fn with_after(mut self, hook: Hook) -> Self {
        self.after = Some(hook);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_remote(mut self, remote: SharedRemote) -> Self {
        self.set_remote(Some(remote));
        self
    }

    /// Appends a test, linking it beneath this suite.
    pub fn add_test(&mut self, mut test: Test) {
        test.adopt(self.path(), self.remote());
        self.children.push(Node::Test(test));
    }

    /// Appends a nested suite, linking its whole subtree beneath this suite.
    pub fn add_suite(&mut self, mut suite: Suite) {
        suite.adopt(self.path(), self.remote());
        self.children.push(Node::Suite(suite));
    }

    pub fn children(&self) -> &[Node] {
        &self.children
    }

    pub fn children_mut(&mut self) -> &mut [Node] {
        &mut self.children
    }

    /// Depth-first iterator over every test in the subtree.
    pub fn tests(&self) -> Box<dyn Iterator<Item = &Test> + '_> {
        Box::new(self.children.iter().flat_map(|child| match child {
            Node::Test(test) => Box::new(std::iter::once(test)) as Box<dyn Iterator<Item = &Test>>,
            Node::Suite(suite) => suite.tests(),
        }))
    }

    /// Depth-first iterator over this suite and every nested suite.
    pub fn suites(&self) -> Box<dyn Iterator<Item = &Suite> + '_> {
        Box::new(std::iter::once(self).chain(self.children.iter().flat_map(|child| {
            match child {
                Node::Test(_) => Box::new(std::iter::empty()) as Box<dyn Iterator<Item = &Suite>>,
                Node::Suite(suite) => suite.suites(),
            }
        })))
    }

    /// Names from the root down to this suite, empty names omitted.
    pub fn path(&self) -> Vec<String> {
        let mut path = self.ancestors.clone();
        if !self.name.is_empty() {
            path.push(self.name.clone());
        }
        path
    }

    /// Full id: ancestor names and own name joined by [`ID_SEPARATOR`].
    pub fn id(&self) -> String {
        self.path().join(ID_SEPARATOR)
    }

    /// The remote session of this suite or of its nearest ancestor that has one.
    pub fn remote(&self) -> Option<SharedRemote> {
        self.remote
            .clone()
            .or_else(|| self.inherited_remote.clone())
    }

    /// Attaches (or detaches) a remote session and re-links descendants.
    pub fn set_remote(&mut self, remote: Option<SharedRemote>) {
        self.remote = remote;
        self.relink_children();
    }

    pub fn num_tests(&self) -> usize {
        self.children.iter().map(Node::num_tests).sum()
    }

    pub fn num_failed_tests(&self) -> usize {
        self.children.iter().map(Node::num_failed_tests).sum()
    }

    pub fn num_skipped_tests(&self) -> usize {
        self.children.iter().map(Node::num_skipped_tests).sum()
    }

    pub fn num_passed_tests(&self) -> usize {
        self.tests()
            .filter(|test| test.has_passed == Some(true))
            .count()
    }

    /// Marks the suite so that none of its children run.
    pub fn skip(&mut self, reason: impl Into<String>) {
        self.skipped = Some(reason.into());
    }

    /// Point-in-time view of the suite for reporters.
    pub fn report(&self) -> SuiteReport {
        SuiteReport {
            id: self.id(),
            name: self.name.clone(),
            num_tests: self.num_tests(),
            num_failed_tests: self.num_failed_tests(),
            num_skipped_tests: self.num_skipped_tests(),
            skipped: self.skipped.clone(),
            error: self.error.clone(),
            time_elapsed: self.time_elapsed,
        }
    }

    fn adopt(&mut self, ancestors: Vec<String>, remote: Option<SharedRemote>) {
        self.ancestors = ancestors;
        self.inherited_remote = remote;
        self.relink_children();
    }

    fn relink_children(&mut self) {
        let path = self.path();
        let remote = self.remote();
        for child in &mut self.children {
            child.adopt(path.clone(), remote.clone());
        }
    }

    fn has_grep_match(&self, ctx: &RunContext) -> bool {
        self.tests().any(|test| ctx.grep_matches(&test.id()))
    }

    /// Runs the suite to completion. Never fails; see the module docs.
    pub fn run<'a>(&'a mut self, ctx: &'a RunContext) -> BoxFuture<'a, ()> {
        async move {
            let start = Instant::now();
            let scope = ctx.scoped(self.timeout);

            self.error = None;
            self.secondary_errors.clear();
            self.time_elapsed = None;

            info!("Running suite {}", self.id());
            ctx.emit(Event::SuiteStart(self.report())).await;

            if let Some(reason) = self.skipped.clone() {
                self.skip_children(&reason, &scope).await;
            } else {
                if self.run_before(&scope).await {
                    self.run_children(&scope).await;
                }
                self.run_after(&scope).await;
            }

            self.time_elapsed = Some(start.elapsed());
            debug!(
                "Suite {} finished: {} tests, {} failed, {} skipped in {:?}",
                self.id(),
                self.num_tests(),
                self.num_failed_tests(),
                self.num_skipped_tests(),
                self.time_elapsed.unwrap_or_default()
            );
            ctx.emit(Event::SuiteEnd(self.report())).await;
        }
        .boxed()
    }

    /// Runs `before`. Returns `true` if the children should run.
    async fn run_before(&mut self, ctx: &RunContext) -> bool {
        let Some(hook) = self.before.clone() else {
            return true;
        };

        match self.invoke_hook(&hook, None, ctx).await {
            Settlement::Passed => true,
            Settlement::Skipped(reason) => {
                debug!("Suite {} skipped from before hook: {}", self.id(), reason);
                self.skipped = Some(reason.clone());
                self.skip_children(&reason, ctx).await;
                false
            }
            Settlement::Failed(error) => {
                self.record_error(HookKind::Before, error);
                false
            }
        }
    }

    async fn run_children(&mut self, ctx: &RunContext) {
        for index in 0..self.children.len() {
            if let Some(reason) = self.children[index].skip_reason(ctx) {
                self.children[index].mark_skipped(&reason, ctx).await;
                continue;
            }

            let child_id = self.children[index].id();

            if let Some(hook) = self.before_each.clone() {
                match self.invoke_hook(&hook, Some(child_id.clone()), ctx).await {
                    Settlement::Passed => {}
                    Settlement::Skipped(reason) => {
                        self.children[index].mark_skipped(&reason, ctx).await;
                        if !self.run_after_each(child_id, ctx).await {
                            return;
                        }
                        continue;
                    }
                    Settlement::Failed(error) => {
                        self.record_error(HookKind::BeforeEach, error);
                        return;
                    }
                }
            }

            match &mut self.children[index] {
                Node::Test(test) => test.run(ctx).await,
                Node::Suite(suite) => suite.run(ctx).await,
            }

            if ctx.options().bail && self.children[index].failed() {
                info!("Bailing after failure in {}", child_id);
                ctx.bail();
            }

            if !self.run_after_each(child_id, ctx).await {
                return;
            }
        }
    }

    /// Runs `after_each`. Returns `false` if the suite must abort.
    async fn run_after_each(&mut self, child_id: String, ctx: &RunContext) -> bool {
        let Some(hook) = self.after_each.clone() else {
            return true;
        };

        match self.invoke_hook(&hook, Some(child_id), ctx).await {
            Settlement::Passed => true,
            Settlement::Skipped(reason) => {
                debug!("Ignoring skip from afterEach in {}: {}", self.id(), reason);
                true
            }
            Settlement::Failed(error) => {
                self.record_error(HookKind::AfterEach, error);
                false
            }
        }
    }

    async fn run_after(&mut self, ctx: &RunContext) {
        let Some(hook) = self.after.clone() else {
            return;
        };

        match self.invoke_hook(&hook, None, ctx).await {
            Settlement::Passed => {}
            Settlement::Skipped(reason) => {
                debug!("Ignoring skip from after hook in {}: {}", self.id(), reason);
            }
            Settlement::Failed(error) => self.record_error(HookKind::After, error),
        }
    }

    async fn invoke_hook(
        &self,
        hook: &Hook,
        child_id: Option<String>,
        ctx: &RunContext,
    ) -> Settlement {
        let hook_ctx = HookContext::new(self.id(), child_id, self.remote());
        hook.invoke(hook_ctx, ctx.timeout()).await
    }

    /// Records a hook failure; the earliest error stays primary.
    fn record_error(&mut self, hook: HookKind, error: TestError) {
        let failure = SuiteError { hook, error };
        if self.error.is_none() {
            warn!("Suite {} aborted: {}", self.id(), failure);
            self.error = Some(failure);
        } else {
            warn!("Suite {} secondary error: {}", self.id(), failure);
            self.secondary_errors.push(failure);
        }
    }

    async fn skip_children(&mut self, reason: &str, ctx: &RunContext) {
        for child in &mut self.children {
            child.mark_skipped(reason, ctx).await;
        }
    }

    fn mark_skipped<'a>(&'a mut self, reason: &'a str, ctx: &'a RunContext) -> BoxFuture<'a, ()> {
        async move {
            self.skipped = Some(reason.to_string());
            self.skip_children(reason, ctx).await;
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::report::{EventKind, EventLog};

    type Log = Arc<Mutex<Vec<String>>>;

    fn push(log: &Log, entry: impl Into<String>) {
        log.lock().unwrap().push(entry.into());
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    fn logging_test(name: &str, log: &Log) -> Test {
        let log = Arc::clone(log);
        let entry = name.to_string();
        Test::new(
            name,
            TestBody::sync(move |_| {
                push(&log, entry.clone());
                Ok(())
            }),
        )
    }

    fn hook_logging_child(log: &Log, prefix: &'static str) -> Hook {
        let log = Arc::clone(log);
        Hook::sync(move |ctx| {
            let child = ctx.test_id().unwrap_or_default();
            let name = child.rsplit(ID_SEPARATOR).next().unwrap_or_default();
            push(&log, format!("{}({})", prefix, name));
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_children_and_hooks_run_in_order() {
        let log: Log = Arc::default();
        let mut suite = Suite::new("root")
            .with_before_each(hook_logging_child(&log, "before"))
            .with_after_each(hook_logging_child(&log, "after"))
            .with_test(logging_test("T1", &log))
            .with_test(logging_test("T2", &log))
            .with_test(logging_test("T3", &log));

        suite.run(&RunContext::default()).await;

        assert_eq!(
            entries(&log),
            vec![
                "before(T1)",
                "T1",
                "after(T1)",
                "before(T2)",
                "T2",
                "after(T2)",
                "before(T3)",
                "T3",
                "after(T3)",
            ]
        );
        assert!(suite.error.is_none());
        assert!(suite.time_elapsed.is_some());
    }

    #[tokio::test]
    async fn test_before_each_failure_aborts_remaining_children() {
        let log: Log = Arc::default();
        let hook_log = Arc::clone(&log);
        let calls = Arc::new(Mutex::new(0usize));
        let mut suite = Suite::new("root")
            .with_before_each(Hook::sync(move |_| {
                let mut calls = calls.lock().unwrap();
                *calls += 1;
                if *calls == 2 {
                    anyhow::bail!("fixture broke");
                }
                push(&hook_log, "before");
                Ok(())
            }))
            .with_test(Test::new("T1", TestBody::sync(|_| anyhow::bail!("T1 failed"))))
            .with_test(logging_test("T2", &log))
            .with_test(logging_test("T3", &log));

        suite.run(&RunContext::default()).await;

        assert_eq!(entries(&log), vec!["before"]);
        let error = suite.error.as_ref().expect("suite error");
        assert_eq!(error.hook, HookKind::BeforeEach);
        assert_eq!(error.error.message, "fixture broke");

        let tests: Vec<&Test> = suite.tests().collect();
        assert_eq!(tests[0].has_passed, Some(false));
        assert_eq!(tests[0].error.as_ref().unwrap().message, "T1 failed");
        assert_eq!(tests[1].has_passed, None);
        assert_eq!(tests[2].has_passed, None);
        assert_eq!(tests[2].skipped, None);
    }

    #[tokio::test]
    async fn test_after_each_failure_aborts_remaining_children() {
        let log: Log = Arc::default();
        let mut suite = Suite::new("root")
            .with_after_each(Hook::sync(|_| anyhow::bail!("cleanup failed")))
            .with_test(logging_test("T1", &log))
            .with_test(logging_test("T2", &log));

        suite.run(&RunContext::default()).await;

        assert_eq!(entries(&log), vec!["T1"]);
        assert_eq!(suite.error.as_ref().unwrap().hook, HookKind::AfterEach);
    }

    #[tokio::test]
    async fn test_before_failure_skips_children_but_runs_after() {
        let log: Log = Arc::default();
        let after_log = Arc::clone(&log);
        let mut suite = Suite::new("root")
            .with_before(Hook::sync(|_| anyhow::bail!("no database")))
            .with_after(Hook::sync(move |_| {
                push(&after_log, "after");
                anyhow::bail!("teardown also failed")
            }))
            .with_test(logging_test("T1", &log));

        suite.run(&RunContext::default()).await;

        assert_eq!(entries(&log), vec!["after"]);
        let error = suite.error.as_ref().unwrap();
        assert_eq!(error.hook, HookKind::Before);
        assert_eq!(error.error.message, "no database");
        assert_eq!(suite.secondary_errors.len(), 1);
        assert_eq!(suite.secondary_errors[0].hook, HookKind::After);
        assert_eq!(suite.num_failed_tests(), 0);
    }

    #[tokio::test]
    async fn test_after_failure_recorded_when_no_earlier_error() {
        let mut suite = Suite::new("root")
            .with_after(Hook::sync(|_| anyhow::bail!("teardown failed")))
            .with_test(Test::new("ok", TestBody::sync(|_| Ok(()))));

        suite.run(&RunContext::default()).await;

        assert_eq!(suite.error.as_ref().unwrap().hook, HookKind::After);
        assert_eq!(suite.num_failed_tests(), 0);
        assert!(suite.secondary_errors.is_empty());
    }

    #[tokio::test]
    async fn test_counters_walk_nested_suites() {
        let inner = Suite::new("inner")
            .with_test(Test::new("a", TestBody::sync(|_| Ok(()))))
            .with_test(Test::new("b", TestBody::sync(|_| anyhow::bail!("b"))))
            .with_test(Test::new("c", TestBody::sync(|ctx| Err(ctx.skip("later")))));
        let mut root = Suite::new("root")
            .with_test(Test::new("d", TestBody::sync(|_| anyhow::bail!("d"))))
            .with_suite(inner);

        root.run(&RunContext::default()).await;

        assert_eq!(root.num_tests(), 4);
        assert_eq!(root.num_failed_tests(), 2);
        assert_eq!(root.num_skipped_tests(), 1);
        assert_eq!(root.num_passed_tests(), 1);

        let child_sum: usize = root.children().iter().map(Node::num_tests).sum();
        assert_eq!(root.num_tests(), child_sum);
    }

    #[tokio::test]
    async fn test_nested_suite_error_does_not_stop_siblings() {
        let log: Log = Arc::default();
        let broken = Suite::new("broken")
            .with_before(Hook::sync(|_| anyhow::bail!("setup")))
            .with_test(logging_test("never", &log));
        let mut root = Suite::new("root")
            .with_suite(broken)
            .with_test(logging_test("sibling", &log));

        root.run(&RunContext::default()).await;

        assert!(root.error.is_none());
        assert_eq!(entries(&log), vec!["sibling"]);
        match &root.children()[0] {
            Node::Suite(suite) => assert_eq!(suite.error.as_ref().unwrap().hook, HookKind::Before),
            Node::Test(_) => panic!("expected suite"),
        }
    }

    #[tokio::test]
    async fn test_scenario_before_each_after_each_with_one_failure() {
        let log: Log = Arc::default();
        let before_log = Arc::clone(&log);
        let after_log = Arc::clone(&log);
        let mut suite = Suite::new("root")
            .with_before_each(Hook::sync(move |_| {
                push(&before_log, "b");
                Ok(())
            }))
            .with_after_each(Hook::sync(move |_| {
                push(&after_log, "a");
                Ok(())
            }))
            .with_test(Test::new("t1", TestBody::sync(|_| Ok(()))))
            .with_test(Test::new("t2", TestBody::sync(|_| anyhow::bail!("throws"))));

        suite.run(&RunContext::default()).await;

        assert_eq!(suite.num_tests(), 2);
        assert_eq!(suite.num_failed_tests(), 1);
        assert_eq!(entries(&log), vec!["b", "a", "b", "a"]);
    }

    #[tokio::test]
    async fn test_ids_join_ancestor_names() {
        let inner = Suite::new("inner").with_test(Test::new("leaf", TestBody::sync(|_| Ok(()))));
        let root = Suite::new("root").with_suite(inner);
        let unnamed = Suite::new("").with_suite(root);

        let test = unnamed.tests().next().unwrap();
        assert_eq!(test.id(), "root - inner - leaf");
        assert_eq!(unnamed.suites().nth(2).unwrap().id(), "root - inner");
    }

    #[tokio::test]
    async fn test_remote_is_inherited_from_nearest_ancestor() {
        let seen: Arc<Mutex<Option<String>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let inner = Suite::new("inner").with_test(Test::new(
            "uses session",
            TestBody::sync(move |ctx| {
                let id = ctx.remote().map(|remote| remote.session_id().to_string());
                *sink.lock().unwrap() = id;
                Ok(())
            }),
        ));
        let mut root = Suite::new("chrome").with_suite(inner);
        root.set_remote(Some(Arc::new(StaticSession::new("session-1"))));

        match &root.children()[0] {
            Node::Suite(suite) => {
                assert_eq!(suite.remote().unwrap().session_id(), "session-1")
            }
            Node::Test(_) => panic!("expected suite"),
        }

        root.run(&RunContext::default()).await;
        assert_eq!(seen.lock().unwrap().as_deref(), Some("session-1"));
    }

    #[tokio::test]
    async fn test_skip_from_before_skips_all_descendants() {
        let log: Log = Arc::default();
        let after_log = Arc::clone(&log);
        let mut suite = Suite::new("root")
            .with_before(Hook::sync(|ctx| Err(ctx.skip("no browser"))))
            .with_before_each(hook_logging_child(&log, "before"))
            .with_after(Hook::sync(move |_| {
                push(&after_log, "after");
                Ok(())
            }))
            .with_test(logging_test("T1", &log))
            .with_suite(Suite::new("nested").with_test(logging_test("T2", &log)));

        suite.run(&RunContext::default()).await;

        assert_eq!(entries(&log), vec!["after"]);
        assert_eq!(suite.skipped.as_deref(), Some("no browser"));
        assert_eq!(suite.num_skipped_tests(), 2);
        assert!(suite.error.is_none());
        assert!(suite.tests().all(|test| test.has_passed.is_none()));
    }

    #[tokio::test]
    async fn test_skip_from_before_each_skips_only_that_child() {
        let log: Log = Arc::default();
        let mut suite = Suite::new("root")
            .with_before_each(Hook::sync(|ctx| {
                if ctx.test_id() == Some("root - T1") {
                    return Err(ctx.skip("flaky"));
                }
                Ok(())
            }))
            .with_test(logging_test("T1", &log))
            .with_test(logging_test("T2", &log));

        suite.run(&RunContext::default()).await;

        assert_eq!(entries(&log), vec!["T2"]);
        let tests: Vec<&Test> = suite.tests().collect();
        assert_eq!(tests[0].skipped.as_deref(), Some("flaky"));
        assert_eq!(tests[1].has_passed, Some(true));
    }

    #[tokio::test]
    async fn test_grep_skips_non_matching_tests_without_hooks() {
        let log: Log = Arc::default();
        let options = RunOptions {
            grep: Some(regex::Regex::new("login").unwrap()),
            ..RunOptions::default()
        };
        let ctx = RunContext::new(options, crate::report::Hub::new());
        let mut suite = Suite::new("root")
            .with_before_each(hook_logging_child(&log, "before"))
            .with_test(logging_test("login works", &log))
            .with_test(logging_test("logout works", &log))
            .with_suite(Suite::new("other").with_test(logging_test("profile", &log)));

        suite.run(&ctx).await;

        assert_eq!(entries(&log), vec!["before(login works)", "login works"]);
        assert_eq!(suite.num_skipped_tests(), 2);
        assert!(
            suite
                .tests()
                .filter(|test| test.skipped.is_some())
                .all(|test| test.skipped.as_deref() == Some(GREP_SKIP_REASON))
        );
    }

    #[tokio::test]
    async fn test_bail_skips_everything_after_first_failure() {
        let log: Log = Arc::default();
        let options = RunOptions {
            bail: true,
            ..RunOptions::default()
        };
        let ctx = RunContext::new(options, crate::report::Hub::new());
        let mut suite = Suite::new("root")
            .with_test(Test::new("fails", TestBody::sync(|_| anyhow::bail!("x"))))
            .with_test(logging_test("T2", &log))
            .with_suite(Suite::new("nested").with_test(logging_test("T3", &log)));

        suite.run(&ctx).await;

        assert!(entries(&log).is_empty());
        assert_eq!(suite.num_failed_tests(), 1);
        assert_eq!(suite.num_skipped_tests(), 2);
        assert!(ctx.is_bailed());
    }

    #[tokio::test]
    async fn test_hook_inherits_suite_timeout() {
        let mut suite = Suite::new("root")
            .with_timeout(Duration::from_millis(20))
            .with_before(Hook::future(|_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            }))
            .with_test(Test::new("t", TestBody::sync(|_| Ok(()))));

        suite.run(&RunContext::default()).await;

        let error = suite.error.as_ref().unwrap();
        assert_eq!(error.hook, HookKind::Before);
        assert!(error.error.is_timeout());
    }

    #[tokio::test]
    async fn test_events_are_emitted_in_lifecycle_order() {
        let log = EventLog::new();
        let ctx = RunContext::new(RunOptions::default(), crate::report::Hub::new().with_reporter(log.clone()));
        let mut suite = Suite::new("root")
            .with_test(Test::new("ok", TestBody::sync(|_| Ok(()))))
            .with_test(Test::new("bad", TestBody::sync(|_| anyhow::bail!("bad"))));

        suite.run(&ctx).await;

        assert_eq!(
            log.kinds(),
            vec![
                EventKind::SuiteStart,
                EventKind::TestStart,
                EventKind::TestPass,
                EventKind::TestEnd,
                EventKind::TestStart,
                EventKind::TestFail,
                EventKind::TestEnd,
                EventKind::SuiteEnd,
            ]
        );
    }
}
