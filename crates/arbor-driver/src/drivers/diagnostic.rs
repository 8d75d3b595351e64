use std::sync::Arc;

use arbor_tree::{DiagnosticContext, Diagnostics, Update};
use arbor_types::Node;

use crate::driver::{Driver, TreeMeta};
use crate::error::DriverResult;
use crate::stack::DriverFactory;

/// Derives diagnostic attributes from an update.
pub type DiagnosticDeriver = Arc<dyn Fn(&Update) -> Diagnostics + Send + Sync>;

/// Runs each downstream call inside a [`DiagnosticScope`] derived from the
/// update, so commits and hooks downstream see the attributes.
///
/// [`DiagnosticScope`]: arbor_tree::DiagnosticScope
pub struct DiagnosticScopeDriver {
    downstream: Arc<dyn Driver>,
    derive: DiagnosticDeriver,
}

impl DiagnosticScopeDriver {
    pub fn new(downstream: Arc<dyn Driver>, derive: DiagnosticDeriver) -> Self {
        Self { downstream, derive }
    }

    /// Attributes `arbor.op` and `arbor.target`.
    pub fn default_deriver() -> DiagnosticDeriver {
        Arc::new(|update: &Update| {
            Diagnostics::new()
                .with("arbor.op", update.kind().as_str())
                .with("arbor.target", update.target().path().to_string())
        })
    }

    pub fn factory() -> DriverFactory {
        Self::factory_with(Self::default_deriver())
    }

    pub fn factory_with(derive: DiagnosticDeriver) -> DriverFactory {
        Box::new(move |_meta: &TreeMeta, downstream: Arc<dyn Driver>| {
            Ok(Arc::new(DiagnosticScopeDriver::new(downstream, derive)) as Arc<dyn Driver>)
        })
    }
}

impl Driver for DiagnosticScopeDriver {
    fn initial_root(&self) -> DriverResult<Node> {
        self.downstream.initial_root()
    }

    fn submit(&self, update: Update) -> DriverResult<()> {
        let _scope = DiagnosticContext::enter((self.derive)(&update));
        self.downstream.submit(update)
    }

    fn flush(&self) -> DriverResult<()> {
        let _scope = DiagnosticContext::enter(Diagnostics::new().with("arbor.op", "flush"));
        self.downstream.flush()
    }
}
