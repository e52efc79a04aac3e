//! Declarative registration of suites.
//!
//! A [`Registry`] is an explicit, per-instance collection of root suites.
//! Nothing is registered globally, so independent registries (one per test
//! binary, one per environment) never see each other's suites.
//!
//! ```
//! use std::time::Duration;
//! use gauntlet::suite::{Hook, Registry, TestBody};
//!
//! let mut registry = Registry::new();
//! registry.describe("checkout", |s| {
//!     s.timeout(Duration::from_secs(10));
//!     s.before_each(Hook::sync(|_| Ok(())));
//!     s.it("adds an item", TestBody::sync(|_| Ok(())));
//!     s.describe("payment", |s| {
//!         s.it("accepts cards", TestBody::sync(|_| Ok(())));
//!         s.xit("accepts vouchers", "voucher service offline");
//!     });
//! });
//!
//! let suites = registry.into_suites();
//! assert_eq!(suites[0].num_tests(), 3);
//! assert_eq!(suites[0].tests().last().unwrap().id(), "checkout - payment - accepts vouchers");
//! ```

use std::time::Duration;

use super::body::{Hook, SharedRemote, TestBody};
use super::{Suite, Test};

/// Collects root suites.
#[derive(Debug, Default)]
pub struct Registry {
    roots: Vec<Suite>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a root suite.
    pub fn describe<F>(&mut self, name: impl Into<String>, define: F) -> &mut Self
    where
        F: FnOnce(&mut SuiteBuilder),
    {
        let mut builder = SuiteBuilder::new(name);
        define(&mut builder);
        self.roots.push(builder.finish());
        self
    }

    /// Declares one root suite per remote session, each built from the same
    /// definition. Tests in each root see that root's session.
    pub fn describe_each<F>(&mut self, name: &str, remotes: Vec<SharedRemote>, define: F) -> &mut Self
    where
        F: Fn(&mut SuiteBuilder),
    {
        for remote in remotes {
            let mut builder = SuiteBuilder::new(format!("{} [{}]", name, remote.session_id()));
            define(&mut builder);
            let mut suite = builder.finish();
            suite.set_remote(Some(remote));
            self.roots.push(suite);
        }
        self
    }

    /// Adds an already built root suite.
    pub fn add(&mut self, suite: Suite) -> &mut Self {
        self.roots.push(suite);
        self
    }

    pub fn suites(&self) -> &[Suite] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn into_suites(self) -> Vec<Suite> {
        self.roots
    }
}

/// Builder handed to `describe` closures.
#[derive(Debug)]
pub struct SuiteBuilder {
    suite: Suite,
}

impl SuiteBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            suite: Suite::new(name),
        }
    }

    /// Declares a nested suite.
    pub fn describe<F>(&mut self, name: impl Into<String>, define: F) -> &mut Self
    where
        F: FnOnce(&mut SuiteBuilder),
    {
        let mut builder = SuiteBuilder::new(name);
        define(&mut builder);
        self.suite.add_suite(builder.finish());
        self
    }

    /// Declares a nested suite whose children are all skipped.
    pub fn xdescribe<F>(&mut self, name: impl Into<String>, reason: &str, define: F) -> &mut Self
    where
        F: FnOnce(&mut SuiteBuilder),
    {
        let mut builder = SuiteBuilder::new(name);
        define(&mut builder);
        let mut suite = builder.finish();
        suite.skip(reason);
        self.suite.add_suite(suite);
        self
    }

    /// Declares a test.
    pub fn it(&mut self, name: impl Into<String>, body: TestBody) -> &mut Self {
        self.suite.add_test(Test::new(name, body));
        self
    }

    /// Declares a test that is reported as skipped and never run.
    pub fn xit(&mut self, name: impl Into<String>, reason: &str) -> &mut Self {
        let body = TestBody::sync(|_| Ok(()));
        self.suite.add_test(Test::new(name, body).with_skip(reason));
        self
    }

    /// Adds a fully configured test.
    pub fn test(&mut self, test: Test) -> &mut Self {
        self.suite.add_test(test);
        self
    }

    pub fn before(&mut self, hook: Hook) -> &mut Self {
        self.suite.before = Some(hook);
        self
    }

    pub fn before_each(&mut self, hook: Hook) -> &mut Self {
        self.suite.before_each = Some(hook);
        self
    }

    pub fn after_each(&mut self, hook: Hook) -> &mut Self {
        self.suite.after_each = Some(hook);
        self
    }

    pub fn after(&mut self, hook: Hook) -> &mut Self {
        self.suite.after = Some(hook);
        self
    }

    pub fn timeout(&mut self, timeout: Duration) -> &mut Self {
        self.suite.timeout = Some(timeout);
        self
    }

    fn finish(self) -> Suite {
        self.suite
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::suite::{RunContext, StaticSession};

    #[test]
    fn test_registries_are_isolated() {
        let mut first = Registry::new();
        first.describe("a", |s| {
            s.it("one", TestBody::sync(|_| Ok(())));
        });
        let second = Registry::new();

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[test]
    fn test_nested_describe_links_ids() {
        let mut registry = Registry::new();
        registry.describe("outer", |s| {
            s.describe("inner", |s| {
                s.it("leaf", TestBody::sync(|_| Ok(())));
            });
        });

        let suite = &registry.suites()[0];
        assert_eq!(suite.tests().next().unwrap().id(), "outer - inner - leaf");
    }

    #[tokio::test]
    async fn test_describe_each_binds_one_session_per_root() {
        let remotes: Vec<SharedRemote> = vec![
            Arc::new(StaticSession::new("chrome-1")),
            Arc::new(StaticSession::new("firefox-1")),
        ];
        let mut registry = Registry::new();
        registry.describe_each("smoke", remotes, |s| {
            s.it(
                "has session",
                TestBody::sync(|ctx| {
                    anyhow::ensure!(ctx.remote().is_some(), "missing session");
                    Ok(())
                }),
            );
        });

        let mut suites = registry.into_suites();
        assert_eq!(suites.len(), 2);
        assert_eq!(suites[1].name, "smoke [firefox-1]");

        let ctx = RunContext::default();
        for suite in &mut suites {
            suite.run(&ctx).await;
            assert_eq!(suite.num_passed_tests(), 1);
        }
    }

    #[tokio::test]
    async fn test_xdescribe_skips_whole_subtree() {
        let mut registry = Registry::new();
        registry.describe("root", |s| {
            s.xdescribe("disabled", "not ready", |s| {
                s.it("a", TestBody::sync(|_| anyhow::bail!("ran")));
                s.it("b", TestBody::sync(|_| anyhow::bail!("ran")));
            });
            s.it("c", TestBody::sync(|_| Ok(())));
        });

        let mut suites = registry.into_suites();
        suites[0].run(&RunContext::default()).await;

        assert_eq!(suites[0].num_skipped_tests(), 2);
        assert_eq!(suites[0].num_failed_tests(), 0);
        assert_eq!(suites[0].num_passed_tests(), 1);
    }
}
