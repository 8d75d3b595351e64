use std::sync::Arc;

use arbor_tree::{StateTree, Update};
use arbor_types::Node;

use crate::driver::Driver;
use crate::error::DriverResult;

/// Produces the root a fresh tree starts from.
pub type DefaultRoot = Arc<dyn Fn() -> Node + Send + Sync>;

/// The innermost driver: commits each update to the local [`StateTree`]
/// on the calling thread.
pub struct LocalDriver {
    state: Arc<StateTree>,
    default_root: DefaultRoot,
}

impl LocalDriver {
    pub fn new(state: Arc<StateTree>, default_root: DefaultRoot) -> Self {
        Self {
            state,
            default_root,
        }
    }

    pub fn state(&self) -> &Arc<StateTree> {
        &self.state
    }
}

impl Driver for LocalDriver {
    fn initial_root(&self) -> DriverResult<Node> {
        Ok((self.default_root)())
    }

    fn submit(&self, update: Update) -> DriverResult<()> {
        self.state.commit(&update)?;
        Ok(())
    }

    fn flush(&self) -> DriverResult<()> {
        // Commits are synchronous; nothing is ever pending here.
        Ok(())
    }
}
