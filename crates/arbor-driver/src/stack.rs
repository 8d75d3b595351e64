use std::sync::Arc;

use tracing::debug;

use crate::driver::{Driver, TreeMeta};
use crate::error::DriverResult;

/// Builds one driver on top of its downstream driver.
pub type DriverFactory =
    Box<dyn FnOnce(&TreeMeta, Arc<dyn Driver>) -> DriverResult<Arc<dyn Driver>> + Send>;

/// An ordered list of driver factories.
///
/// The first factory pushed builds the outermost driver, the one callers
/// submit to. The stack is consumed when a tree instance is built, so the
/// assembled chain is fixed for the lifetime of that instance.
#[derive(Default)]
pub struct DriverStack {
    factories: Vec<(String, DriverFactory)>,
}

impl DriverStack {
    /// An empty stack; building it returns the innermost driver unchanged.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a factory below every factory pushed so far.
    pub fn push(&mut self, label: impl Into<String>, factory: DriverFactory) -> &mut Self {
        self.factories.push((label.into(), factory));
        self
    }

    /// Builder-style [`push`](Self::push).
    pub fn with(mut self, label: impl Into<String>, factory: DriverFactory) -> Self {
        self.push(label, factory);
        self
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Labels from outermost to innermost.
    pub fn labels(&self) -> Vec<&str> {
        self.factories.iter().map(|(l, _)| l.as_str()).collect()
    }

    /// Compose every factory over `innermost` and return the outermost driver.
    pub fn build(self, meta: &TreeMeta, innermost: Arc<dyn Driver>) -> DriverResult<Arc<dyn Driver>> {
        let mut driver = innermost;
        for (label, factory) in self.factories.into_iter().rev() {
            debug!(tree = %meta.name, driver = %label, "building driver");
            driver = factory(meta, driver)?;
        }
        Ok(driver)
    }
}

impl std::fmt::Debug for DriverStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverStack")
            .field("drivers", &self.labels())
            .finish()
    }
}
