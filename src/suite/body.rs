//! Test bodies, lifecycle hooks and the contexts handed to them.
//!
//! A test body declares how it completes when it is registered:
//!
//! | Constructor | Completion |
//! |-------------|------------|
//! | [`TestBody::sync`] | The closure's return value |
//! | [`TestBody::future`] | The returned future |
//! | [`TestBody::callback`] | An explicit [`Done`] handle |
//!
//! All of them report failure with an `anyhow::Error`. Skipping is a
//! distinguishable signal produced by [`TestContext::skip`], which the runner
//! recognises and records as a skip rather than a failure.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::deferred::{Deferred, TaskError, deferred};
use crate::environment::EnvironmentDescriptor;
use crate::suite::{TestError, TestErrorKind};

/// Reason recorded when a skip is requested without one.
pub const DEFAULT_SKIP_REASON: &str = "skipped";

/// Future returned by asynchronous bodies and hooks.
pub type BodyFuture = BoxFuture<'static, anyhow::Result<()>>;

type SyncBody = Arc<dyn Fn(&TestContext) -> anyhow::Result<()> + Send + Sync>;
type AsyncBody = Arc<dyn Fn(TestContext) -> BodyFuture + Send + Sync>;
type CallbackBody = Arc<dyn Fn(TestContext, Done) -> anyhow::Result<()> + Send + Sync>;
type SyncHook = Arc<dyn Fn(&HookContext) -> anyhow::Result<()> + Send + Sync>;
type AsyncHook = Arc<dyn Fn(HookContext) -> BodyFuture + Send + Sync>;

/// Control-flow signal raised by a skip request.
///
/// Carried inside an `anyhow::Error` so that bodies can return it with `?` or
/// `return Err(..)` like any other error.
#[derive(Debug, Clone, thiserror::Error)]
#[error("skipped: {reason}")]
pub struct SkipSignal {
    reason: String,
}

impl SkipSignal {
    pub fn new(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let reason = if reason.trim().is_empty() {
            DEFAULT_SKIP_REASON.to_string()
        } else {
            reason
        };
        Self { reason }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Builds the error a body returns to skip itself.
pub fn skip(reason: impl Into<String>) -> anyhow::Error {
    SkipSignal::new(reason).into()
}

/// A remote browser session shared by the tests of a suite subtree.
///
/// The concrete WebDriver client is owned elsewhere; suites only hold a
/// handle and hand it to the tests beneath them.
pub trait RemoteSession: Send + Sync + fmt::Debug {
    /// Session identifier assigned by the WebDriver service.
    fn session_id(&self) -> &str;

    /// Environment the session was created for, if known.
    fn environment(&self) -> Option<&EnvironmentDescriptor> {
        None
    }

    /// Access to the concrete session type.
    fn as_any(&self) -> &dyn Any;
}

/// Shared handle to a [`RemoteSession`].
pub type SharedRemote = Arc<dyn RemoteSession>;

/// Minimal [`RemoteSession`] identified only by its session id.
#[derive(Debug, Clone)]
pub struct StaticSession {
    id: String,
    environment: Option<EnvironmentDescriptor>,
}

impl StaticSession {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            environment: None,
        }
    }

    pub fn with_environment(mut self, environment: EnvironmentDescriptor) -> Self {
        self.environment = Some(environment);
        self
    }
}

impl RemoteSession for StaticSession {
    fn session_id(&self) -> &str {
        &self.id
    }

    fn environment(&self) -> Option<&EnvironmentDescriptor> {
        self.environment.as_ref()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// What a test body can see while it runs.
#[derive(Clone)]
pub struct TestContext {
    id: String,
    timeout: Duration,
    remote: Option<SharedRemote>,
}

impl TestContext {
    pub(crate) fn new(id: String, timeout: Duration, remote: Option<SharedRemote>) -> Self {
        Self {
            id,
            timeout,
            remote,
        }
    }

    /// Full id of the running test.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Timeout applied to this run of the test.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Remote session of the nearest enclosing suite that has one.
    pub fn remote(&self) -> Option<&SharedRemote> {
        self.remote.as_ref()
    }

    /// Builds the signal that skips the test when returned from the body.
    ///
    /// ```
    /// use gauntlet::suite::{Test, TestBody};
    ///
    /// let test = Test::new(
    ///     "needs a session",
    ///     TestBody::sync(|ctx| match ctx.remote() {
    ///         Some(_) => Ok(()),
    ///         None => Err(ctx.skip("no remote session")),
    ///     }),
    /// );
    /// # let _ = test;
    /// ```
    pub fn skip(&self, reason: impl Into<String>) -> anyhow::Error {
        skip(reason)
    }
}

/// What a lifecycle hook can see while it runs.
#[derive(Clone)]
pub struct HookContext {
    suite_id: String,
    test_id: Option<String>,
    remote: Option<SharedRemote>,
}

impl HookContext {
    pub(crate) fn new(
        suite_id: String,
        test_id: Option<String>,
        remote: Option<SharedRemote>,
    ) -> Self {
        Self {
            suite_id,
            test_id,
            remote,
        }
    }

    /// Id of the suite owning the hook.
    pub fn suite_id(&self) -> &str {
        &self.suite_id
    }

    /// Id of the child about to run (or that just ran), for per-child hooks.
    pub fn test_id(&self) -> Option<&str> {
        self.test_id.as_deref()
    }

    pub fn remote(&self) -> Option<&SharedRemote> {
        self.remote.as_ref()
    }

    /// Builds a skip signal. From `before` it skips the whole suite, from
    /// `before_each` it skips the upcoming child.
    pub fn skip(&self, reason: impl Into<String>) -> anyhow::Error {
        skip(reason)
    }
}

/// Shareable error carried through a [`Done`] handle.
pub type SharedError = Arc<anyhow::Error>;

/// Explicit completion handle for callback-style test bodies.
///
/// Only the first call counts; anything after a timeout is ignored.
#[derive(Clone, Debug)]
pub struct Done {
    inner: Deferred<(), SharedError>,
}

impl Done {
    /// Marks the test as passed.
    pub fn resolve(&self) -> bool {
        self.inner.resolve(())
    }

    /// Marks the test as failed with the given error.
    pub fn reject(&self, error: impl Into<anyhow::Error>) -> bool {
        self.inner.reject(Arc::new(error.into()))
    }

    /// Settles the test from a result.
    pub fn settle(&self, result: anyhow::Result<()>) -> bool {
        self.inner.settle(result.map_err(Arc::new))
    }

    /// Skips the test.
    pub fn skip(&self, reason: impl Into<String>) -> bool {
        self.inner.reject(Arc::new(skip(reason)))
    }
}

/// Runnable body of a [`Test`](crate::suite::Test).
#[derive(Clone)]
pub enum TestBody {
    /// Completes when the closure returns.
    Sync(SyncBody),
    /// Completes when the returned future settles.
    Async(AsyncBody),
    /// Completes when the [`Done`] handle is settled.
    Callback(CallbackBody),
}

impl fmt::Debug for TestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            TestBody::Sync(_) => "sync",
            TestBody::Async(_) => "async",
            TestBody::Callback(_) => "callback",
        };
        f.debug_tuple("TestBody").field(&kind).finish()
    }
}

impl TestBody {
    pub fn sync<F>(body: F) -> Self
    where
        F: Fn(&TestContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        TestBody::Sync(Arc::new(body))
    }

    pub fn future<F, Fut>(body: F) -> Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        TestBody::Async(Arc::new(move |ctx| body(ctx).boxed()))
    }

    pub fn callback<F>(body: F) -> Self
    where
        F: Fn(TestContext, Done) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        TestBody::Callback(Arc::new(body))
    }

    /// Runs the body under `timeout` and classifies how it ended.
    pub(crate) async fn invoke(&self, ctx: TestContext, timeout: Duration) -> Settlement {
        let id = ctx.id().to_string();

        match self {
            TestBody::Sync(body) => {
                match std::panic::catch_unwind(AssertUnwindSafe(|| body(&ctx))) {
                    Ok(result) => Settlement::from_result(result),
                    Err(payload) => Settlement::Failed(TestError::panic(payload)),
                }
            }
            TestBody::Async(body) => {
                let future = match std::panic::catch_unwind(AssertUnwindSafe(|| body(ctx))) {
                    Ok(future) => future,
                    Err(payload) => return Settlement::Failed(TestError::panic(payload)),
                };
                match tokio::time::timeout(timeout, AssertUnwindSafe(future).catch_unwind()).await
                {
                    Ok(Ok(result)) => Settlement::from_result(result),
                    Ok(Err(payload)) => Settlement::Failed(TestError::panic(payload)),
                    Err(_) => Settlement::Failed(TestError::timeout(&id, timeout)),
                }
            }
            TestBody::Callback(body) => {
                let (handle, task) = deferred::<(), SharedError>();
                let done = Done { inner: handle };

                match std::panic::catch_unwind(AssertUnwindSafe(|| body(ctx, done))) {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => {
                        task.cancel();
                        return Settlement::from_error(error);
                    }
                    Err(payload) => {
                        task.cancel();
                        return Settlement::Failed(TestError::panic(payload));
                    }
                }

                match tokio::time::timeout(timeout, task.clone()).await {
                    Ok(Ok(())) => Settlement::Passed,
                    Ok(Err(TaskError::Failed(error))) => Settlement::from_shared(&error),
                    Ok(Err(TaskError::Cancelled | TaskError::Abandoned)) => {
                        Settlement::Failed(TestError::new(
                            TestErrorKind::Failure,
                            "completion handle was dropped before the test settled",
                        ))
                    }
                    Err(_) => {
                        // Late settlements after this point are ignored.
                        task.cancel();
                        Settlement::Failed(TestError::timeout(&id, timeout))
                    }
                }
            }
        }
    }
}

/// How a body or hook invocation ended.
#[derive(Debug, Clone)]
pub(crate) enum Settlement {
    Passed,
    Skipped(String),
    Failed(TestError),
}

impl Settlement {
    pub(crate) fn from_result(result: anyhow::Result<()>) -> Self {
        match result {
            Ok(()) => Settlement::Passed,
            Err(error) => Settlement::from_error(error),
        }
    }

    pub(crate) fn from_error(error: anyhow::Error) -> Self {
        match error.downcast_ref::<SkipSignal>() {
            Some(signal) => Settlement::Skipped(signal.reason().to_string()),
            None => Settlement::Failed(TestError::failure(error)),
        }
    }

    fn from_shared(error: &SharedError) -> Self {
        match error.downcast_ref::<SkipSignal>() {
            Some(signal) => Settlement::Skipped(signal.reason().to_string()),
            None => Settlement::Failed(TestError::shared_failure(Arc::clone(error))),
        }
    }
}

/// A suite lifecycle callback.
#[derive(Clone)]
pub enum Hook {
    Sync(SyncHook),
    Async(AsyncHook),
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Hook::Sync(_) => "sync",
            Hook::Async(_) => "async",
        };
        f.debug_tuple("Hook").field(&kind).finish()
    }
}

impl Hook {
    pub fn sync<F>(hook: F) -> Self
    where
        F: Fn(&HookContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Hook::Sync(Arc::new(hook))
    }

    pub fn future<F, Fut>(hook: F) -> Self
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Hook::Async(Arc::new(move |ctx| hook(ctx).boxed()))
    }

    pub(crate) async fn invoke(&self, ctx: HookContext, timeout: Duration) -> Settlement {
        let label = ctx.suite_id().to_string();

        match self {
            Hook::Sync(hook) => match std::panic::catch_unwind(AssertUnwindSafe(|| hook(&ctx))) {
                Ok(result) => Settlement::from_result(result),
                Err(payload) => Settlement::Failed(TestError::panic(payload)),
            },
            Hook::Async(hook) => {
                let future = match std::panic::catch_unwind(AssertUnwindSafe(|| hook(ctx))) {
                    Ok(future) => future,
                    Err(payload) => return Settlement::Failed(TestError::panic(payload)),
                };
                match tokio::time::timeout(timeout, AssertUnwindSafe(future).catch_unwind()).await
                {
                    Ok(Ok(result)) => Settlement::from_result(result),
                    Ok(Err(payload)) => Settlement::Failed(TestError::panic(payload)),
                    Err(_) => Settlement::Failed(TestError::timeout(&label, timeout)),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TestContext {
        TestContext::new("root - t".to_string(), Duration::from_secs(1), None)
    }

    #[tokio::test]
    async fn test_sync_body_passes() {
        let body = TestBody::sync(|_| Ok(()));
        let settled = body.invoke(ctx(), Duration::from_secs(1)).await;
        assert!(matches!(settled, Settlement::Passed));
    }

    #[tokio::test]
    async fn test_skip_signal_is_not_a_failure() {
        let body = TestBody::sync(|ctx| Err(ctx.skip("not on this platform")));
        match body.invoke(ctx(), Duration::from_secs(1)).await {
            Settlement::Skipped(reason) => assert_eq!(reason, "not on this platform"),
            other => panic!("unexpected settlement: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_skip_reason_uses_default() {
        let body = TestBody::sync(|ctx| Err(ctx.skip("")));
        match body.invoke(ctx(), Duration::from_secs(1)).await {
            Settlement::Skipped(reason) => assert_eq!(reason, DEFAULT_SKIP_REASON),
            other => panic!("unexpected settlement: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_panicking_body_is_reported_as_panic() {
        let body = TestBody::sync(|_| panic!("boom"));
        match body.invoke(ctx(), Duration::from_secs(1)).await {
            Settlement::Failed(error) => {
                assert_eq!(error.kind, TestErrorKind::Panic);
                assert!(error.message.contains("boom"));
            }
            other => panic!("unexpected settlement: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_callback_body_settles_from_another_task() {
        let body = TestBody::callback(|_, done| {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                done.resolve();
            });
            Ok(())
        });
        let settled = body.invoke(ctx(), Duration::from_secs(1)).await;
        assert!(matches!(settled, Settlement::Passed));
    }

    #[tokio::test]
    async fn test_callback_rejection_is_a_failure() {
        let body = TestBody::callback(|_, done| {
            done.reject(anyhow::anyhow!("assertion failed"));
            Ok(())
        });
        match body.invoke(ctx(), Duration::from_secs(1)).await {
            Settlement::Failed(error) => {
                assert_eq!(error.kind, TestErrorKind::Failure);
                assert_eq!(error.message, "assertion failed");
            }
            other => panic!("unexpected settlement: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_late_callback_after_timeout_is_ignored() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let slot = std::sync::Mutex::new(Some(tx));
        let body = TestBody::callback(move |_, done| {
            if let Some(tx) = slot.lock().unwrap().take() {
                let _ = tx.send(done);
            }
            Ok(())
        });

        match body.invoke(ctx(), Duration::from_millis(20)).await {
            Settlement::Failed(error) => assert!(error.is_timeout()),
            other => panic!("unexpected settlement: {:?}", other),
        }

        let done = rx.await.unwrap();
        assert!(!done.resolve());
    }

    #[tokio::test]
    async fn test_async_hook_times_out() {
        let hook = Hook::future(|_| async {
            futures::future::pending::<()>().await;
            Ok(())
        });
        let ctx = HookContext::new("root".to_string(), None, None);
        match hook.invoke(ctx, Duration::from_millis(20)).await {
            Settlement::Failed(error) => assert!(error.is_timeout()),
            other => panic!("unexpected settlement: {:?}", other),
        }
    }
}
