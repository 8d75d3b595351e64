use std::sync::Arc;

use arbor_refs::Reference;
use arbor_tree::{StateTree, TreeId, Update};
use arbor_types::{Node, Schema};

use crate::error::DriverResult;

/// What a driver factory knows about the tree it is building for.
#[derive(Clone)]
pub struct TreeMeta {
    pub name: String,
    pub schema: Arc<Schema>,
    pub state: Arc<StateTree>,
}

impl TreeMeta {
    pub fn new(state: Arc<StateTree>) -> Self {
        Self {
            name: state.name().to_string(),
            schema: state.schema().clone(),
            state,
        }
    }

    pub fn tree_id(&self) -> TreeId {
        self.state.id()
    }
}

impl std::fmt::Debug for TreeMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeMeta")
            .field("name", &self.name)
            .field("tree", &self.state.id())
            .finish()
    }
}

/// One stage of the update pipeline.
///
/// Every update and flush of a tree instance enters at the outermost
/// driver and travels inward; the innermost driver commits to the local
/// [`StateTree`].
pub trait Driver: Send + Sync {
    /// The root to initialize the tree with. Called once, at construction.
    fn initial_root(&self) -> DriverResult<Node>;

    fn submit(&self, update: Update) -> DriverResult<()>;

    /// Block until every earlier submission has been fully applied.
    fn flush(&self) -> DriverResult<()>;

    fn submit_replacement(&self, target: Reference, value: Node) -> DriverResult<()> {
        self.submit(Update::Replace { target, value })
    }

    fn submit_conditional_replacement(
        &self,
        target: Reference,
        value: Node,
        precondition: Reference,
        expected: Node,
    ) -> DriverResult<()> {
        self.submit(Update::ConditionalReplace {
            target,
            value,
            precondition,
            expected,
        })
    }

    fn submit_creation(&self, target: Reference, value: Node) -> DriverResult<()> {
        self.submit(Update::Create { target, value })
    }

    fn submit_conditional_creation(&self, target: Reference, value: Node) -> DriverResult<()> {
        self.submit(Update::ConditionalCreate { target, value })
    }

    fn submit_deletion(&self, target: Reference) -> DriverResult<()> {
        self.submit(Update::Delete { target })
    }

    fn submit_conditional_deletion(
        &self,
        target: Reference,
        precondition: Reference,
        expected: Node,
    ) -> DriverResult<()> {
        self.submit(Update::ConditionalDelete {
            target,
            precondition,
            expected,
        })
    }
}
