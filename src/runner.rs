//! Running several root suites and summarising the outcome.
//!
//! Each root suite is usually bound to one environment (one remote
//! session), so roots are independent and may run concurrently. Children
//! inside a suite always run one after another.

use std::time::{Duration, Instant};

use futures::StreamExt;
use futures::stream;
use tracing::info;

use crate::suite::{RunContext, Suite, SuiteError};

/// Aggregated outcome of a run across all root suites.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Number of tests declared across all roots.
    pub total: usize,

    pub passed: usize,

    /// Tests whose body failed, timed out or panicked.
    pub failed: usize,

    pub skipped: usize,

    /// Tests that never ran because a hook aborted their suite.
    pub not_run: usize,

    /// Fatal hook failures, keyed by suite id.
    pub suite_errors: Vec<(String, SuiteError)>,

    /// Wall-clock duration of the entire run.
    pub duration: Duration,
}

impl RunSummary {
    /// Builds a summary from suites that have already run.
    pub fn from_suites(suites: &[Suite], duration: Duration) -> Self {
        let mut summary = Self {
            duration,
            ..Self::default()
        };

        for root in suites {
            summary.total += root.num_tests();
            summary.passed += root.num_passed_tests();
            summary.failed += root.num_failed_tests();
            summary.skipped += root.num_skipped_tests();
            for suite in root.suites() {
                if let Some(error) = &suite.error {
                    summary.suite_errors.push((suite.id(), error.clone()));
                }
            }
        }
        summary.not_run = summary.total - summary.passed - summary.failed - summary.skipped;
        summary
    }

    /// Returns `true` if no test failed and no suite hook failed.
    ///
    /// # Example
    ///
    /// ```
    /// use gauntlet::runner::RunSummary;
    /// use std::time::Duration;
    ///
    /// let summary = RunSummary {
    ///     total: 10,
    ///     passed: 8,
    ///     skipped: 2,
    ///     duration: Duration::from_secs(3),
    ///     ..RunSummary::default()
    /// };
    ///
    /// assert!(summary.success());
    /// assert_eq!(summary.exit_code(), 0);
    /// ```
    pub fn success(&self) -> bool {
        self.failed == 0 && self.suite_errors.is_empty()
    }

    /// Process exit code for this summary: 0 on success, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }

    /// Prints the totals and any fatal suite errors to the terminal.
    pub fn print(&self) {
        println!();
        println!("Test Results:");
        println!("  Total:   {}", self.total);
        println!("  Passed:  {}", console::style(self.passed).green());
        println!("  Failed:  {}", console::style(self.failed).red());
        println!("  Skipped: {}", console::style(self.skipped).yellow());
        if self.not_run > 0 {
            println!("  Not Run: {}", console::style(self.not_run).red().bold());
        }
        println!("  Duration: {:?}", self.duration);

        for (id, error) in &self.suite_errors {
            println!("  {} {}", console::style(id).bold(), console::style(error).dim());
        }

        println!();
        if self.success() {
            println!("{}", console::style("All tests passed!").green().bold());
        } else {
            println!("{}", console::style("Some tests failed.").red().bold());
        }
    }
}

/// Runs root suites, at most `max_concurrency` at a time, and summarises
/// them. Results stay on the suites themselves.
pub async fn run_all(suites: &mut [Suite], max_concurrency: usize, ctx: &RunContext) -> RunSummary {
    let start = Instant::now();
    let limit = max_concurrency.max(1);

    info!("Running {} root suites ({} at a time)", suites.len(), limit);

    stream::iter(suites.iter_mut())
        .map(|suite| suite.run(ctx))
        .buffer_unordered(limit)
        .collect::<Vec<()>>()
        .await;

    RunSummary::from_suites(suites, start.elapsed())
}
