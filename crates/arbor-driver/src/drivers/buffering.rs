use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};

use arbor_tree::Update;
use arbor_types::Node;
use tracing::debug;

use crate::driver::{Driver, TreeMeta};
use crate::error::DriverResult;
use crate::stack::DriverFactory;

/// Queues submissions and replays them in order on `flush`.
///
/// Submission never fails here; problems with a queued update surface from
/// the `flush` that replays it. Every queued update is replayed even if an
/// earlier one fails, and the first failure is returned.
///
/// One replay runs at a time. A `flush` that arrives while another thread is
/// replaying waits for that replay to finish, since the batch in flight may
/// hold updates submitted by the waiting thread.
pub struct BufferingDriver {
    downstream: Arc<dyn Driver>,
    queue: Mutex<Vec<Update>>,
    replaying: Mutex<Option<ThreadId>>,
    replayed: Condvar,
}

/// Releases the replay slot, waking waiting flushers.
struct ReplaySlot<'a> {
    driver: &'a BufferingDriver,
}

impl Drop for ReplaySlot<'_> {
    fn drop(&mut self) {
        *self.driver.replaying.lock().expect("lock poisoned") = None;
        self.driver.replayed.notify_all();
    }
}

impl BufferingDriver {
    pub fn new(downstream: Arc<dyn Driver>) -> Self {
        Self {
            downstream,
            queue: Mutex::new(Vec::new()),
            replaying: Mutex::new(None),
            replayed: Condvar::new(),
        }
    }

    pub fn factory() -> DriverFactory {
        Box::new(|_meta: &TreeMeta, downstream: Arc<dyn Driver>| {
            Ok(Arc::new(BufferingDriver::new(downstream)) as Arc<dyn Driver>)
        })
    }

    /// Number of submissions waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.queue.lock().expect("lock poisoned").len()
    }

    /// Wait for any replay on another thread, then claim the slot. Returns
    /// `None` when the calling thread already holds it.
    fn claim(&self) -> Option<ReplaySlot<'_>> {
        let me = thread::current().id();
        let mut owner = self.replaying.lock().expect("lock poisoned");
        if *owner == Some(me) {
            return None;
        }
        while owner.is_some() {
            owner = self.replayed.wait(owner).expect("lock poisoned");
        }
        *owner = Some(me);
        Some(ReplaySlot { driver: self })
    }

    fn replay(&self) -> DriverResult<()> {
        // Take the batch first so replayed updates (and hooks they trigger)
        // can submit again without blocking on the queue.
        let batch = std::mem::take(&mut *self.queue.lock().expect("lock poisoned"));
        debug!(count = batch.len(), "replaying buffered updates");
        let mut first_error = None;
        for update in batch {
            if let Err(e) = self.downstream.submit(update) {
                first_error.get_or_insert(e);
            }
        }
        let flushed = self.downstream.flush();
        match first_error {
            Some(e) => Err(e),
            None => flushed,
        }
    }
}

impl Driver for BufferingDriver {
    fn initial_root(&self) -> DriverResult<Node> {
        self.downstream.initial_root()
    }

    fn submit(&self, update: Update) -> DriverResult<()> {
        self.queue.lock().expect("lock poisoned").push(update);
        Ok(())
    }

    fn flush(&self) -> DriverResult<()> {
        // A flush from inside a replay (a hook, say) runs nested.
        let _slot = self.claim();
        self.replay()
    }
}
