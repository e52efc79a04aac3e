//! gauntlet: a hierarchical test runner with managed WebDriver tunnels.
//!
//! # Architecture
//!
//! - **Suite** ([`suite`]): a tree of suites and tests with before/after
//!   hooks, timeouts, skips and lifecycle events
//! - **Runner** ([`runner`]): runs root suites concurrently and summarises them
//! - **Report** ([`report`]): lifecycle events fanned out to reporters
//! - **Tunnel** ([`tunnel`]): downloads, starts, monitors and stops the
//!   process that connects tests to remote browsers
//! - **Deferred** ([`deferred`]): shareable, cancellable async results
//!
//! # Example
//!
//! ```
//! use gauntlet::report::Hub;
//! use gauntlet::suite::{Registry, RunContext, RunOptions, TestBody};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let mut registry = Registry::new();
//! registry.describe("math", |s| {
//!     s.it("adds", TestBody::sync(|_| {
//!         anyhow::ensure!(1 + 1 == 2);
//!         Ok(())
//!     }));
//! });
//!
//! let ctx = RunContext::new(RunOptions::default(), Hub::new());
//! let mut suites = registry.into_suites();
//! let summary = gauntlet::runner::run_all(&mut suites, 1, &ctx).await;
//!
//! assert_eq!(summary.passed, 1);
//! assert_eq!(summary.exit_code(), 0);
//! # }
//! ```

pub mod config;
pub mod deferred;
pub mod environment;
pub mod report;
pub mod runner;
pub mod suite;
pub mod tunnel;

pub use config::{Config, load_config};
pub use runner::{RunSummary, run_all};
pub use suite::{Registry, RunContext, RunOptions, Suite, Test, TestBody};
pub use tunnel::{Tunnel, TunnelError, TunnelProvider};
