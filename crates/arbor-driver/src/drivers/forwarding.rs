use std::sync::Arc;

use arbor_tree::Update;
use arbor_types::Node;
use tracing::trace;

use crate::driver::{Driver, TreeMeta};
use crate::error::DriverResult;
use crate::stack::DriverFactory;

/// Passes every operation through unchanged, tracing it on the way.
pub struct ForwardingDriver {
    tree: String,
    downstream: Arc<dyn Driver>,
}

impl ForwardingDriver {
    pub fn new(tree: impl Into<String>, downstream: Arc<dyn Driver>) -> Self {
        Self {
            tree: tree.into(),
            downstream,
        }
    }

    pub fn factory() -> DriverFactory {
        Box::new(|meta: &TreeMeta, downstream: Arc<dyn Driver>| {
            Ok(Arc::new(ForwardingDriver::new(meta.name.clone(), downstream)) as Arc<dyn Driver>)
        })
    }
}

impl Driver for ForwardingDriver {
    fn initial_root(&self) -> DriverResult<Node> {
        trace!(tree = %self.tree, "initial_root");
        self.downstream.initial_root()
    }

    fn submit(&self, update: Update) -> DriverResult<()> {
        trace!(tree = %self.tree, kind = %update.kind(), target = %update.target().path(), "submit");
        self.downstream.submit(update)
    }

    fn flush(&self) -> DriverResult<()> {
        trace!(tree = %self.tree, "flush");
        self.downstream.flush()
    }
}
