//! Cancellable, shareable futures used for lifecycle coordination.
//!
//! Two building blocks live here:
//!
//! - [`Task`] - a cloneable future that every holder can await. All clones
//!   observe the same settlement, and any clone may [`cancel`](Task::cancel)
//!   it.
//! - [`Deferred`] - the settling side of a task created with [`deferred`].
//!   The first call to [`resolve`](Deferred::resolve) or
//!   [`reject`](Deferred::reject) wins; later calls are ignored and report
//!   `false`.
//!
//! The test engine uses a deferred as the explicit completion handle for
//! callback-style test bodies, so a late completion after a timeout cannot
//! double-report. The tunnel uses spawned tasks so that repeated `start()`
//! calls share one in-flight start and `stop()` can cancel it.
//!
//! # Example
//!
//! ```
//! use gauntlet::deferred::{TaskError, deferred};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let (handle, task) = deferred::<u32, String>();
//!
//! assert!(handle.resolve(7));
//! assert!(!handle.reject("too late".to_string()));
//! assert_eq!(task.await, Ok(7));
//!
//! let (_handle, task) = deferred::<u32, String>();
//! task.cancel();
//! assert_eq!(task.await, Err(TaskError::Cancelled));
//! # }
//! ```

use std::fmt;
use std::future::{Future, IntoFuture};
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Why a [`Task`] did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError<E> {
    /// The task was cancelled before it settled.
    #[error("task was cancelled")]
    Cancelled,

    /// Every settling handle went away without settling the task, or the
    /// spawned future panicked.
    #[error("task was abandoned before it settled")]
    Abandoned,

    /// The task settled with an error.
    #[error("{0}")]
    Failed(E),
}

type SharedOutput<T, E> = Shared<BoxFuture<'static, Result<T, TaskError<E>>>>;

/// A cloneable, cancellable future.
///
/// Awaiting a task consumes that handle; clone it first to await it from
/// several places.
pub struct Task<T, E> {
    shared: SharedOutput<T, E>,
    token: CancellationToken,
}

impl<T, E> Clone for Task<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            token: self.token.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Task<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<T, E> Task<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Wraps a future in a lazily polled task.
    ///
    /// The future only makes progress while some clone of the task is being
    /// awaited. Cancelling drops the future at its next poll.
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let shared = async move {
            tokio::select! {
                biased;
                _ = cancelled.cancelled() => Err(TaskError::Cancelled),
                result = future => result.map_err(TaskError::Failed),
            }
        }
        .boxed()
        .shared();

        Self { shared, token }
    }

    /// Runs a future on the tokio runtime and returns a task for its result.
    ///
    /// The future keeps running even if nobody awaits the task. It receives
    /// the task's cancellation token and is responsible for observing it, so
    /// that it can release resources (kill processes, remove files) before
    /// reporting its own cancellation error.
    pub fn spawn<F, Fut>(make_future: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let token = CancellationToken::new();
        let handle = tokio::spawn(make_future(token.clone()));
        let shared = async move {
            match handle.await {
                Ok(result) => result.map_err(TaskError::Failed),
                Err(_) => Err(TaskError::Abandoned),
            }
        }
        .boxed()
        .shared();

        Self { shared, token }
    }

    /// Requests cancellation.
    ///
    /// Has no effect on a task that already settled.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns `true` once [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Returns the settled result without waiting, if the task has been
    /// driven to completion.
    pub fn peek(&self) -> Option<Result<T, TaskError<E>>> {
        self.shared.peek().cloned()
    }
}

impl<T, E> IntoFuture for Task<T, E>
where
    T: Clone,
    E: Clone,
{
    type Output = Result<T, TaskError<E>>;
    type IntoFuture = SharedOutput<T, E>;

    fn into_future(self) -> Self::IntoFuture {
        self.shared
    }
}

/// The settling side of a [`Task`].
///
/// Cloning a deferred yields another handle to the same settlement slot.
pub struct Deferred<T, E> {
    sender: Arc<Mutex<Option<oneshot::Sender<Result<T, E>>>>>,
    token: CancellationToken,
}

impl<T, E> Clone for Deferred<T, E> {
    fn clone(&self) -> Self {
        Self {
            sender: Arc::clone(&self.sender),
            token: self.token.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Deferred<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("settled", &self.is_settled())
            .finish()
    }
}

impl<T, E> Deferred<T, E> {
    /// Settles the task with a value. Returns `false` if it had already
    /// settled or was cancelled.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Settles the task with an error. Returns `false` if it had already
    /// settled or was cancelled.
    pub fn reject(&self, error: E) -> bool {
        self.settle(Err(error))
    }

    /// Settles the task with a result. Only the first settlement counts.
    pub fn settle(&self, result: Result<T, E>) -> bool {
        if self.token.is_cancelled() {
            return false;
        }

        let sender = match self.sender.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        match sender {
            Some(sender) => sender.send(result).is_ok(),
            None => false,
        }
    }

    /// Returns `true` once the task has been settled or cancelled.
    pub fn is_settled(&self) -> bool {
        if self.token.is_cancelled() {
            return true;
        }
        match self.sender.lock() {
            Ok(slot) => slot.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }
}

/// Creates a settling handle and the task it settles.
pub fn deferred<T, E>() -> (Deferred<T, E>, Task<T, E>)
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    let (sender, receiver) = oneshot::channel::<Result<T, E>>();
    let token = CancellationToken::new();
    let cancelled = token.clone();

    let shared = async move {
        tokio::select! {
            biased;
            _ = cancelled.cancelled() => Err(TaskError::Cancelled),
            settled = receiver => match settled {
                Ok(result) => result.map_err(TaskError::Failed),
                Err(_) => Err(TaskError::Abandoned),
            },
        }
    }
    .boxed()
    .shared();

    let handle = Deferred {
        sender: Arc::new(Mutex::new(Some(sender))),
        token: token.clone(),
    };

    (handle, Task { shared, token })
}
