//! Lifecycle events and the hub that fans them out to reporters.
//!
//! Suites and tests never format output themselves. Each lifecycle step is
//! published as an [`Event`] carrying a snapshot, and every [`Reporter`]
//! registered on the [`Hub`] receives it in registration order.
//!
//! | Event | Snapshot | When |
//! |-------|----------|------|
//! | `SuiteStart` | [`SuiteReport`] | Before the suite's `before` hook |
//! | `SuiteEnd` | [`SuiteReport`] | After the suite's `after` hook |
//! | `TestStart` | [`TestReport`] | Before the body is invoked |
//! | `TestPass` / `TestFail` / `TestSkip` | [`TestReport`] | Once the outcome is known |
//! | `TestEnd` | [`TestReport`] | After the outcome event of a test that ran |
//!
//! A test skipped before it runs (grep, bail, preset skip, skipped suite)
//! only produces `TestSkip`.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::suite::{SuiteError, TestError};

/// Snapshot of a test at the time an event was emitted.
#[derive(Debug, Clone)]
pub struct TestReport {
    pub id: String,
    pub name: String,
    pub skipped: Option<String>,
    pub has_passed: Option<bool>,
    pub error: Option<TestError>,
    pub time_elapsed: Option<Duration>,
}

/// Snapshot of a suite at the time an event was emitted.
#[derive(Debug, Clone)]
pub struct SuiteReport {
    pub id: String,
    pub name: String,
    pub num_tests: usize,
    pub num_failed_tests: usize,
    pub num_skipped_tests: usize,
    pub skipped: Option<String>,
    pub error: Option<SuiteError>,
    pub time_elapsed: Option<Duration>,
}

#[derive(Debug, Clone)]
pub enum Event {
    SuiteStart(SuiteReport),
    SuiteEnd(SuiteReport),
    TestStart(TestReport),
    TestEnd(TestReport),
    TestPass(TestReport),
    TestFail(TestReport),
    TestSkip(TestReport),
}

/// Discriminant of an [`Event`], used for subscription filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SuiteStart,
    SuiteEnd,
    TestStart,
    TestEnd,
    TestPass,
    TestFail,
    TestSkip,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::SuiteStart(_) => EventKind::SuiteStart,
            Event::SuiteEnd(_) => EventKind::SuiteEnd,
            Event::TestStart(_) => EventKind::TestStart,
            Event::TestEnd(_) => EventKind::TestEnd,
            Event::TestPass(_) => EventKind::TestPass,
            Event::TestFail(_) => EventKind::TestFail,
            Event::TestSkip(_) => EventKind::TestSkip,
        }
    }

    /// Id of the suite or test the event is about.
    pub fn id(&self) -> &str {
        match self {
            Event::SuiteStart(suite) | Event::SuiteEnd(suite) => &suite.id,
            Event::TestStart(test)
            | Event::TestEnd(test)
            | Event::TestPass(test)
            | Event::TestFail(test)
            | Event::TestSkip(test) => &test.id,
        }
    }
}

/// A consumer of lifecycle events.
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn on_event(&self, event: &Event);
}

/// Adapts a plain closure into a [`Reporter`].
struct FnReporter<F>(F);

#[async_trait]
impl<F> Reporter for FnReporter<F>
where
    F: Fn(&Event) + Send + Sync,
{
    async fn on_event(&self, event: &Event) {
        (self.0)(event)
    }
}

struct Subscription {
    kinds: Option<Vec<EventKind>>,
    reporter: Arc<dyn Reporter>,
}

impl Subscription {
    fn wants(&self, kind: EventKind) -> bool {
        self.kinds
            .as_ref()
            .is_none_or(|kinds| kinds.contains(&kind))
    }
}

/// Typed subscriber registry.
#[derive(Default)]
pub struct Hub {
    subscriptions: Vec<Subscription>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes a reporter to every event.
    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.subscribe(None, Arc::new(reporter));
        self
    }

    /// Subscribes a closure to the given kinds of event.
    pub fn on<F>(mut self, kinds: &[EventKind], callback: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe(Some(kinds.to_vec()), Arc::new(FnReporter(callback)));
        self
    }

    pub fn subscribe(&mut self, kinds: Option<Vec<EventKind>>, reporter: Arc<dyn Reporter>) {
        self.subscriptions.push(Subscription { kinds, reporter });
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub async fn emit(&self, event: &Event) {
        let kind = event.kind();
        for subscription in &self.subscriptions {
            if subscription.wants(kind) {
                subscription.reporter.on_event(event).await;
            }
        }
    }
}

impl fmt::Debug for Hub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hub")
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

/// Writes lifecycle events to the `tracing` log.
pub struct LogReporter;

#[async_trait]
impl Reporter for LogReporter {
    async fn on_event(&self, event: &Event) {
        match event {
            Event::SuiteStart(suite) => debug!("suite start: {}", suite.id),
            Event::SuiteEnd(suite) => match &suite.error {
                Some(error) => warn!("suite {} failed: {}", suite.id, error),
                None => info!(
                    "suite {}: {} tests, {} failed, {} skipped",
                    suite.id, suite.num_tests, suite.num_failed_tests, suite.num_skipped_tests
                ),
            },
            Event::TestStart(test) => debug!("test start: {}", test.id),
            Event::TestEnd(_) => {}
            Event::TestPass(test) => info!("PASS {} ({:?})", test.id, test.time_elapsed.unwrap_or_default()),
            Event::TestFail(test) => match &test.error {
                Some(error) => warn!("FAIL {}: {}", test.id, error),
                None => warn!("FAIL {}", test.id),
            },
            Event::TestSkip(test) => info!(
                "SKIP {} ({})",
                test.id,
                test.skipped.as_deref().unwrap_or_default()
            ),
        }
    }
}

/// Prints one line per finished test to the terminal.
///
/// Failures and skips are always shown; passes only when `verbose`.
pub struct ConsoleReporter {
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    fn line(&self, event: &Event) -> Option<String> {
        match event {
            Event::TestPass(test) if self.verbose => Some(format!(
                "{} {} {}",
                console::style("PASS").green(),
                test.id,
                console::style(format!("({:?})", test.time_elapsed.unwrap_or_default())).dim()
            )),
            Event::TestFail(test) => {
                let mut line = format!("{} {}", console::style("FAIL").red(), test.id);
                if let Some(error) = &test.error {
                    line.push_str(&format!("\n    {}", console::style(error).dim()));
                }
                Some(line)
            }
            Event::TestSkip(test) => Some(format!(
                "{} {} {}",
                console::style("SKIP").yellow(),
                test.id,
                console::style(format!("({})", test.skipped.as_deref().unwrap_or_default())).dim()
            )),
            Event::SuiteEnd(suite) => suite.error.as_ref().map(|error| {
                format!(
                    "{} {}: {}",
                    console::style("ERR ").red().bold(),
                    suite.id,
                    error
                )
            }),
            _ => None,
        }
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_event(&self, event: &Event) {
        if let Some(line) = self.line(event) {
            println!("{}", line);
        }
    }
}

/// Records every event it receives. Clones share the same log.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().iter().map(Event::kind).collect()
    }
}

#[async_trait]
impl Reporter for EventLog {
    async fn on_event(&self, event: &Event) {
        match self.events.lock() {
            Ok(mut events) => events.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
    }
}
