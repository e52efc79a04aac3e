//! The provider-independent tunnel lifecycle.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::StreamExt;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::download;
use super::process::{self, OutputLine, TunnelProcess};
use super::{
    JobStatus, Platform, TunnelConfig, TunnelError, TunnelEvent, TunnelProvider, TunnelResult,
    TunnelState,
};
use crate::deferred::{Task, TaskError};
use crate::environment::EnvironmentDescriptor;

const EVENT_CAPACITY: usize = 1024;

/// Start and stop attempts, shared by every caller that asks while one is
/// in flight.
type Lifecycle = Task<(), TunnelError>;

/// Watches a running process; settles with its exit code.
type Monitor = Task<Option<i32>, TunnelError>;

struct Inner {
    state: TunnelState,
    starting: Option<Lifecycle>,
    stopping: Option<Lifecycle>,
    monitor: Option<Monitor>,
}

struct Shared<P> {
    provider: P,
    config: TunnelConfig,
    directory: PathBuf,
    /// Owns `directory` when none was configured; removed on drop.
    _scratch: Option<TempDir>,
    platform: Platform,
    client: reqwest::Client,
    inner: Mutex<Inner>,
    events: broadcast::Sender<TunnelEvent>,
}

/// Downloads, launches, monitors and stops one tunnel process.
///
/// Cloning yields another handle to the same tunnel.
///
/// # Example
///
/// ```no_run
/// use gauntlet::tunnel::{Tunnel, TunnelConfig};
/// use gauntlet::tunnel::selenium::SeleniumProvider;
///
/// # async fn run() -> Result<(), gauntlet::tunnel::TunnelError> {
/// let tunnel = Tunnel::new(SeleniumProvider::default(), TunnelConfig::default())?;
/// tunnel.download(false).await?;
/// tunnel.start().await?;
/// println!("WebDriver at {}", tunnel.config().url());
/// tunnel.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct Tunnel<P> {
    shared: Arc<Shared<P>>,
}

impl<P> Clone for Tunnel<P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

enum StopStep {
    Done,
    CancelStart(Lifecycle),
    Await(Lifecycle),
}

impl<P: TunnelProvider> Tunnel<P> {
    pub fn new(provider: P, config: TunnelConfig) -> TunnelResult<Self> {
        Self::for_platform(provider, config, Platform::current())
    }

    /// Creates a tunnel that installs binaries for `platform` instead of the
    /// host platform.
    ///
    /// Without a configured directory the tunnel installs into a fresh
    /// directory of its own, deleted once the last handle is dropped.
    pub fn for_platform(provider: P, config: TunnelConfig, platform: Platform) -> TunnelResult<Self> {
        let (directory, scratch) = match &config.directory {
            Some(directory) => (directory.clone(), None),
            None => {
                let scratch = tempfile::Builder::new()
                    .prefix(&format!("gauntlet-{}-{}-", provider.name(), provider.version()))
                    .tempdir()
                    .map_err(|e| TunnelError::Io(format!("Failed to create tunnel directory: {}", e)))?;
                (scratch.path().to_path_buf(), Some(scratch))
            }
        };
        let client = reqwest::Client::builder()
            .user_agent(concat!("gauntlet/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            shared: Arc::new(Shared {
                provider,
                config,
                directory,
                _scratch: scratch,
                platform,
                client,
                inner: Mutex::new(Inner {
                    state: TunnelState::Stopped,
                    starting: None,
                    stopping: None,
                    monitor: None,
                }),
                events,
            }),
        })
    }

    pub fn provider(&self) -> &P {
        &self.shared.provider
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.shared.config
    }

    pub fn directory(&self) -> &Path {
        &self.shared.directory
    }

    pub fn platform(&self) -> &Platform {
        &self.shared.platform
    }

    pub fn state(&self) -> TunnelState {
        self.shared.lock().state
    }

    /// Receives state changes, download progress, process output and exits.
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.shared.events.subscribe()
    }

    /// Returns `true` if every artifact for this platform is installed.
    pub fn is_downloaded(&self) -> bool {
        match self.shared.provider.artifacts(&self.shared.platform) {
            Ok(artifacts) => download::is_installed(&artifacts, &self.shared.directory),
            Err(_) => false,
        }
    }

    /// Installs the provider's artifacts. Does nothing if they are already
    /// installed, unless `force` is set.
    pub async fn download(&self, force: bool) -> TunnelResult<()> {
        let shared = &self.shared;
        let artifacts = shared.provider.artifacts(&shared.platform)?;

        if !force && download::is_installed(&artifacts, &shared.directory) {
            debug!(
                "{} {} already downloaded in {}",
                shared.provider.name(),
                shared.provider.version(),
                shared.directory.display()
            );
            return Ok(());
        }

        info!(
            "Downloading {} {} for {} into {}",
            shared.provider.name(),
            shared.provider.version(),
            shared.platform,
            shared.directory.display()
        );
        download::install_all(&shared.client, &artifacts, &shared.directory, &shared.events).await
    }

    /// Launches the tunnel and waits until it reports that it is ready.
    ///
    /// While a start is in flight (or has completed), every caller awaits
    /// the same attempt. Fails fast while the tunnel is stopping.
    pub async fn start(&self) -> TunnelResult<()> {
        let task = {
            let mut inner = self.shared.lock();
            match inner.state {
                TunnelState::Stopping => {
                    return Err(TunnelError::InvalidState {
                        operation: "start",
                        state: TunnelState::Stopping,
                    });
                }
                TunnelState::Starting | TunnelState::Running => match &inner.starting {
                    Some(task) => task.clone(),
                    None => return Ok(()),
                },
                TunnelState::Stopped => {
                    if !self.is_downloaded() {
                        return Err(TunnelError::NotDownloaded(self.shared.directory.clone()));
                    }
                    let shared = Arc::clone(&self.shared);
                    let task = Task::spawn(move |token| shared.launch(token));
                    inner.starting = Some(task.clone());
                    self.shared.set_state(&mut inner, TunnelState::Starting);
                    task
                }
            }
        };

        settle(task.await)
    }

    /// Stops the tunnel and waits for the process to exit.
    ///
    /// A start in flight is cancelled; its callers receive
    /// [`TunnelError::Cancelled`].
    pub async fn stop(&self) -> TunnelResult<()> {
        loop {
            let step = {
                let mut inner = self.shared.lock();
                match inner.state {
                    TunnelState::Stopped => StopStep::Done,
                    TunnelState::Starting => match inner.starting.clone() {
                        Some(task) => StopStep::CancelStart(task),
                        None => StopStep::Done,
                    },
                    TunnelState::Stopping => match inner.stopping.clone() {
                        Some(task) => StopStep::Await(task),
                        None => StopStep::Done,
                    },
                    TunnelState::Running => {
                        let monitor = inner.monitor.take();
                        let shared = Arc::clone(&self.shared);
                        let task = Task::spawn(move |_| shared.shutdown(monitor));
                        inner.stopping = Some(task.clone());
                        self.shared.set_state(&mut inner, TunnelState::Stopping);
                        StopStep::Await(task)
                    }
                }
            };

            match step {
                StopStep::Done => return Ok(()),
                StopStep::CancelStart(task) => {
                    task.cancel();
                    // The start may have won the race; loop to stop it.
                    let _ = task.await;
                }
                StopStep::Await(task) => return settle(task.await),
            }
        }
    }

    /// Environments the remote service offers.
    pub async fn environments(&self) -> TunnelResult<Vec<EnvironmentDescriptor>> {
        self.shared
            .provider
            .environments(&self.shared.config, &self.shared.client, &self.shared.platform)
            .await
    }

    /// Reports the final status of a remote session to the service.
    pub async fn send_job_state(
        &self,
        session_id: &str,
        status: JobStatus,
        reason: &str,
    ) -> TunnelResult<()> {
        self.shared
            .provider
            .send_job_state(
                &self.shared.config,
                &self.shared.client,
                session_id,
                status,
                reason,
            )
            .await
    }
}

impl<P: TunnelProvider> Shared<P> {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn emit(&self, event: TunnelEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&self, inner: &mut Inner, state: TunnelState) {
        if inner.state != state {
            debug!("{} tunnel: {} -> {}", self.provider.name(), inner.state, state);
            inner.state = state;
            self.emit(TunnelEvent::StateChanged(state));
        }
    }

    fn forward(&self, line: OutputLine) {
        if self.config.verbose {
            info!("[{}] {}", self.provider.name(), line.text());
        } else {
            debug!("[{}] {}", self.provider.name(), line.text());
        }
        self.emit(TunnelEvent::Output(line));
    }

    async fn launch(self: Arc<Self>, token: CancellationToken) -> TunnelResult<()> {
        let mut process = match self.spawn_until_ready(&token).await {
            Ok(process) => process,
            Err(error) => {
                warn!("{} tunnel failed to start: {}", self.provider.name(), error);
                self.start_ended();
                return Err(error);
            }
        };

        {
            let mut inner = self.lock();
            if !token.is_cancelled() {
                let shared = Arc::clone(&self);
                inner.monitor = Some(Task::spawn(move |stop| shared.monitor(process, stop)));
                self.set_state(&mut inner, TunnelState::Running);
                info!(
                    "{} tunnel running at {}",
                    self.provider.name(),
                    self.config.url()
                );
                return Ok(());
            }
        }

        process::terminate(&mut process.child, self.config.stop_grace).await;
        self.start_ended();
        Err(TunnelError::Cancelled)
    }

    fn start_ended(&self) {
        let mut inner = self.lock();
        inner.starting = None;
        self.set_state(&mut inner, TunnelState::Stopped);
    }

    async fn spawn_until_ready(&self, token: &CancellationToken) -> TunnelResult<TunnelProcess> {
        let command = self
            .provider
            .command(&self.config, &self.directory, &self.platform)?;
        info!("Starting {} tunnel: {}", self.provider.name(), command.display());
        self.emit(TunnelEvent::Status(format!(
            "Starting {} {}",
            self.provider.name(),
            self.provider.version()
        )));

        let mut process = process::spawn(&command)?;
        let deadline = tokio::time::sleep(self.config.startup_timeout);
        tokio::pin!(deadline);

        let outcome = loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break Err(TunnelError::Cancelled),
                _ = &mut deadline => {
                    break Err(TunnelError::StartupTimeout(self.config.startup_timeout));
                }
                line = process.lines.next() => match line {
                    Some(line) => {
                        let text = line.text().to_string();
                        self.forward(line);
                        if let Some(message) = self.provider.error_in(&text) {
                            break Err(TunnelError::Protocol(message));
                        }
                        if self.provider.is_ready(&text) {
                            break Ok(());
                        }
                    }
                    None => break Err(TunnelError::UnexpectedExit { code: None }),
                },
            }
        };

        match outcome {
            Ok(()) => Ok(process),
            Err(error) => {
                let code = process::terminate(&mut process.child, self.config.stop_grace).await;
                match error {
                    TunnelError::UnexpectedExit { .. } => Err(TunnelError::UnexpectedExit { code }),
                    other => Err(other),
                }
            }
        }
    }

    async fn monitor(
        self: Arc<Self>,
        process: TunnelProcess,
        stop: CancellationToken,
    ) -> TunnelResult<Option<i32>> {
        let TunnelProcess {
            mut child,
            mut lines,
        } = process;
        let mut open = true;

        let exited = loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break None,
                line = lines.next(), if open => match line {
                    Some(line) => self.forward(line),
                    None => open = false,
                },
                status = child.wait() => break Some(status.ok().and_then(|s| s.code())),
            }
        };

        let Some(code) = exited else {
            let code = process::terminate(&mut child, self.config.stop_grace).await;
            info!("{} tunnel stopped", self.provider.name());
            self.emit(TunnelEvent::Exited {
                code,
                unexpected: false,
            });
            return Ok(code);
        };

        let unexpected = {
            let mut inner = self.lock();
            if inner.state == TunnelState::Running {
                inner.monitor = None;
                inner.starting = None;
                self.set_state(&mut inner, TunnelState::Stopped);
                true
            } else {
                false
            }
        };
        if unexpected {
            warn!(
                "{} tunnel exited unexpectedly (exit code {:?})",
                self.provider.name(),
                code
            );
        }
        self.emit(TunnelEvent::Exited { code, unexpected });
        Ok(code)
    }

    async fn shutdown(self: Arc<Self>, monitor: Option<Monitor>) -> TunnelResult<()> {
        if let Some(monitor) = monitor {
            monitor.cancel();
            match monitor.await {
                Ok(code) => debug!("{} tunnel exit code {:?}", self.provider.name(), code),
                Err(error) => warn!("{} tunnel monitor failed: {}", self.provider.name(), error),
            }
        }

        let mut inner = self.lock();
        inner.starting = None;
        inner.stopping = None;
        self.set_state(&mut inner, TunnelState::Stopped);
        Ok(())
    }
}

fn settle(result: Result<(), TaskError<TunnelError>>) -> TunnelResult<()> {
    match result {
        Ok(()) => Ok(()),
        Err(TaskError::Failed(error)) => Err(error),
        Err(TaskError::Cancelled) => Err(TunnelError::Cancelled),
        Err(TaskError::Abandoned) => Err(TunnelError::Internal(
            "tunnel lifecycle task panicked".to_string(),
        )),
    }
}
