//! The replicating durable driver.
//!
//! Writes go to the durable store as conditional writes against the
//! current durable document. Nothing is committed locally on the submit
//! path: a background listener follows the store's change feed and applies
//! every change, this instance's own included, to the drivers below in
//! revision order. `flush` waits until the listener has caught up with the
//! durable revision it observed on entry.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use arbor_driver::{Driver, DriverError, DriverFactory, DriverResult, TreeMeta};
use arbor_refs::Reference;
use arbor_tree::{
    apply, entry_at, Applied, DiagnosticContext, PreconditionPolicy, StateTree, Update,
    UpdateError,
};
use arbor_types::{Node, Schema};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::codec::Codec;
use crate::config::{MissingStatePolicy, ReplicaConfig, UnreachablePolicy};
use crate::error::StoreError;
use crate::listener;
use crate::store::{Change, ChangeEvent, ChangeOp, DurableDocument, DurableStore};

/// Name of the change-feed listener thread.
pub const LISTENER_THREAD: &str = "arbor-change-feed";

/// Lifecycle of a replicating driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaState {
    Uninitialized,
    Bootstrapping,
    Connected,
    Disconnected,
    Closed,
}

impl std::fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReplicaState::Uninitialized => "uninitialized",
            ReplicaState::Bootstrapping => "bootstrapping",
            ReplicaState::Connected => "connected",
            ReplicaState::Disconnected => "disconnected",
            ReplicaState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a replicating driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicaStatus {
    pub state: ReplicaState,
    /// Durable revision the local tree reflects.
    pub applied_revision: u64,
    pub last_error: Option<String>,
}

struct Status {
    state: ReplicaState,
    applied: u64,
    last_error: Option<String>,
}

/// What applying one change event did.
pub(crate) enum EventOutcome {
    Applied,
    Skipped,
    Reload,
}

pub(crate) struct Shared {
    pub(crate) tree: String,
    pub(crate) schema: Arc<Schema>,
    policy: PreconditionPolicy,
    pub(crate) state_tree: Arc<StateTree>,
    downstream: Arc<dyn Driver>,
    pub(crate) store: Arc<dyn DurableStore>,
    codec: Arc<dyn Codec>,
    pub(crate) config: ReplicaConfig,
    manifest: String,
    status: Mutex<Status>,
    changed: Condvar,
    pub(crate) reconnect: Notify,
    shutdown: watch::Sender<bool>,
    listener: Mutex<Option<JoinHandle<()>>>,
    listener_thread: OnceLock<ThreadId>,
}

impl Shared {
    fn lock_status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().expect("lock poisoned")
    }

    pub(crate) fn status(&self) -> ReplicaStatus {
        let status = self.lock_status();
        ReplicaStatus {
            state: status.state,
            applied_revision: status.applied,
            last_error: status.last_error.clone(),
        }
    }

    pub(crate) fn applied_revision(&self) -> u64 {
        self.lock_status().applied
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock_status().state == ReplicaState::Closed
    }

    fn transition(&self, status: &mut Status, to: ReplicaState) {
        if status.state != to {
            info!(tree = %self.tree, from = %status.state, to = %to, "replica state changed");
            status.state = to;
        }
    }

    fn set_state(&self, to: ReplicaState) {
        let mut status = self.lock_status();
        self.transition(&mut status, to);
        self.changed.notify_all();
    }

    fn connected_at(&self, revision: u64) {
        let mut status = self.lock_status();
        if status.state == ReplicaState::Closed {
            return;
        }
        status.applied = revision;
        status.last_error = None;
        self.transition(&mut status, ReplicaState::Connected);
        self.changed.notify_all();
    }

    /// Record a failure and, unless closed, become disconnected and wake the
    /// listener so it re-bootstraps.
    pub(crate) fn mark_disconnected(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut status = self.lock_status();
            if status.state == ReplicaState::Closed {
                return;
            }
            warn!(tree = %self.tree, reason = %reason, "replica disconnected");
            status.last_error = Some(reason);
            self.transition(&mut status, ReplicaState::Disconnected);
            self.changed.notify_all();
        }
        // The listener handles its own failures; waking it from there would
        // cut its backoff short.
        if !self.on_listener_thread() {
            self.reconnect.notify_one();
        }
    }

    /// Stop for good after an error that retrying cannot fix.
    pub(crate) fn fail(&self, error: &DriverError) {
        let mut status = self.lock_status();
        status.last_error = Some(error.to_string());
        self.transition(&mut status, ReplicaState::Closed);
        self.changed.notify_all();
    }

    fn on_listener_thread(&self) -> bool {
        self.listener_thread.get() == Some(&std::thread::current().id())
    }

    // -----------------------------------------------------------------------
    // Encoding
    // -----------------------------------------------------------------------

    fn decode_document(&self, document: &DurableDocument) -> DriverResult<Node> {
        if document.manifest != self.manifest {
            return Err(DriverError::ManifestMismatch {
                expected: self.manifest.clone(),
                found: document.manifest.clone(),
            });
        }
        Ok(self
            .codec
            .decode(&self.schema, &self.schema.root, &document.root)?)
    }

    fn encode_document(&self, root: &Node, revision: u64) -> DriverResult<DurableDocument> {
        Ok(DurableDocument {
            collection: self.config.collection.clone(),
            revision,
            manifest: self.manifest.clone(),
            root: self.codec.encode(&self.schema, &self.schema.root, root)?,
        })
    }

    fn store_error(&self, err: StoreError) -> DriverError {
        if let StoreError::Unavailable { reason } = &err {
            self.mark_disconnected(reason.clone());
        }
        err.into()
    }

    // -----------------------------------------------------------------------
    // Bootstrap
    // -----------------------------------------------------------------------

    /// Load or seed the durable document and produce the initial root.
    fn bootstrap(&self) -> DriverResult<Node> {
        self.set_state(ReplicaState::Bootstrapping);
        let collection = &self.config.collection;
        let result = match self.store.load(collection) {
            Ok(Some(document)) => self
                .decode_document(&document)
                .map(|root| (root, Some(document.revision))),
            Ok(None) => match self.config.bootstrap.missing {
                MissingStatePolicy::Fail => Err(DriverError::NoDurableState {
                    collection: collection.clone(),
                }),
                MissingStatePolicy::Seed => self.seed_default(),
            },
            Err(StoreError::Unavailable { reason }) => match self.config.bootstrap.unreachable {
                UnreachablePolicy::Fail => Err(DriverError::Unreachable { reason }),
                UnreachablePolicy::StartWithDefault => {
                    warn!(tree = %self.tree, reason = %reason, "store unreachable, starting from default root");
                    self.downstream.initial_root().map(|root| (root, None))
                }
            },
            Err(e) => Err(e.into()),
        };

        match result {
            Ok((root, Some(revision))) => {
                info!(tree = %self.tree, collection = %collection, revision, "bootstrapped from durable state");
                self.connected_at(revision);
                Ok(root)
            }
            Ok((root, None)) => {
                self.mark_disconnected("store unreachable at bootstrap");
                Ok(root)
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    fn seed_default(&self) -> DriverResult<(Node, Option<u64>)> {
        let root = self.downstream.initial_root()?;
        let stored = self
            .store
            .seed(self.encode_document(&root, 0)?)
            .map_err(DriverError::from)?;
        // Another instance may have seeded first; its document wins.
        let root = self.decode_document(&stored)?;
        info!(tree = %self.tree, collection = %self.config.collection, "seeded durable state");
        Ok((root, Some(stored.revision)))
    }

    /// Replace the local root with the store's current document. Runs on the
    /// listener thread.
    pub(crate) fn reload(&self) -> DriverResult<()> {
        let collection = &self.config.collection;
        let document = match self.store.load(collection).map_err(DriverError::from)? {
            Some(document) => document,
            None => match self.config.bootstrap.missing {
                MissingStatePolicy::Fail => {
                    return Err(DriverError::NoDurableState {
                        collection: collection.clone(),
                    })
                }
                MissingStatePolicy::Seed => {
                    let local = self.state_tree.snapshot()?;
                    self.store
                        .seed(self.encode_document(&local.root, 0)?)
                        .map_err(DriverError::from)?
                }
            },
        };
        let root = self.decode_document(&document)?;
        {
            let _scope = DiagnosticContext::install(
                arbor_tree::Diagnostics::new().with("arbor.op", "reload"),
            );
            self.downstream.submit(Update::Replace {
                target: Reference::root(&self.schema),
                value: root,
            })?;
        }
        info!(tree = %self.tree, revision = document.revision, "reloaded durable state");
        self.connected_at(document.revision);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Change application
    // -----------------------------------------------------------------------

    /// Apply one change from the feed to the drivers below.
    pub(crate) fn apply_event(&self, event: ChangeEvent) -> EventOutcome {
        let applied = self.applied_revision();
        if event.revision <= applied {
            debug!(tree = %self.tree, revision = event.revision, applied, "skipping applied change");
            return EventOutcome::Skipped;
        }
        if event.revision != applied + 1 {
            warn!(tree = %self.tree, revision = event.revision, applied, "gap in change feed");
            return EventOutcome::Reload;
        }

        let result = self.event_update(&event).and_then(|update| {
            let _scope = DiagnosticContext::install(event.diagnostics.clone());
            self.downstream.submit(update)
        });
        match result {
            Ok(()) => {
                debug!(tree = %self.tree, revision = event.revision, path = %event.op.path(), "applied change");
                let mut status = self.lock_status();
                status.applied = event.revision;
                self.changed.notify_all();
                EventOutcome::Applied
            }
            Err(e) => {
                warn!(tree = %self.tree, revision = event.revision, error = %e, "change did not apply, reloading");
                EventOutcome::Reload
            }
        }
    }

    fn event_update(&self, event: &ChangeEvent) -> DriverResult<Update> {
        let path = event.op.path().clone();
        let target = Reference::from_path(&self.schema, path).map_err(UpdateError::from)?;
        Ok(match &event.op {
            ChangeOp::Replace { payload, .. } => {
                let value = self.codec.decode(&self.schema, target.target(), payload)?;
                Update::Replace { target, value }
            }
            ChangeOp::Delete { .. } => Update::Delete { target },
        })
    }

    // -----------------------------------------------------------------------
    // Submit and flush
    // -----------------------------------------------------------------------

    fn ensure_connected(&self) -> DriverResult<()> {
        let status = self.lock_status();
        match status.state {
            ReplicaState::Connected => Ok(()),
            ReplicaState::Closed => Err(DriverError::Closed),
            other => Err(DriverError::Disconnected {
                reason: status
                    .last_error
                    .clone()
                    .unwrap_or_else(|| format!("replica is {other}")),
            }),
        }
    }

    /// Apply `update` to the durable document with a conditional write,
    /// retrying against fresh state while other writers win.
    fn write(&self, update: &Update) -> DriverResult<()> {
        self.ensure_connected()?;
        let collection = &self.config.collection;
        let path = update.target().path();
        let attempts = self.config.max_write_attempts.max(1);

        for attempt in 1..=attempts {
            let document = self
                .store
                .load(collection)
                .map_err(|e| self.store_error(e))?
                .ok_or_else(|| DriverError::NoDurableState {
                    collection: collection.clone(),
                })?;
            let root = self.decode_document(&document)?;
            let next = match apply(&self.schema, &self.policy, &root, update)? {
                Applied::Changed(next) => next,
                Applied::Unchanged => return Ok(()),
            };

            let op = match entry_at(&next, path)? {
                Some(value) => ChangeOp::Replace {
                    path: path.clone(),
                    payload: self
                        .codec
                        .encode(&self.schema, update.target().target(), &value)?,
                },
                None => ChangeOp::Delete { path: path.clone() },
            };
            let change = Change {
                op,
                diagnostics: DiagnosticContext::current(),
            };
            let replacement = self.encode_document(&next, document.revision + 1)?;
            match self
                .store
                .compare_and_swap(document.revision, replacement, change)
            {
                Ok(event) => {
                    debug!(tree = %self.tree, path = %path, revision = event.revision, attempt, "durable write");
                    return Ok(());
                }
                Err(StoreError::RevisionMismatch { expected, actual }) => {
                    debug!(tree = %self.tree, path = %path, expected, actual, attempt, "write lost a race, retrying");
                }
                Err(e) => return Err(self.store_error(e)),
            }
        }
        Err(DriverError::Conflict {
            path: path.to_string(),
            attempts,
        })
    }

    /// Wait until the local tree reflects the durable revision read on entry.
    fn flush(&self) -> DriverResult<()> {
        if self.on_listener_thread() {
            // Changes are applied on this thread, in order; waiting here
            // would wait on ourselves.
            return self.downstream.flush();
        }
        self.ensure_connected()?;
        let target = self
            .store
            .current_revision(&self.config.collection)
            .map_err(|e| self.store_error(e))?
            .ok_or_else(|| DriverError::NoDurableState {
                collection: self.config.collection.clone(),
            })?;

        let timeout = self.config.flush_timeout();
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut status = self.lock_status();
        while status.applied < target {
            match status.state {
                ReplicaState::Closed => return Err(DriverError::Closed),
                ReplicaState::Connected => {}
                _ => {
                    return Err(DriverError::Disconnected {
                        reason: status
                            .last_error
                            .clone()
                            .unwrap_or_else(|| "flush interrupted".into()),
                    })
                }
            }
            status = match deadline {
                None => self.changed.wait(status).expect("lock poisoned"),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(DriverError::FlushTimeout(timeout.unwrap_or_default()));
                    }
                    self.changed
                        .wait_timeout(status, deadline - now)
                        .expect("lock poisoned")
                        .0
                }
            };
        }
        drop(status);
        self.downstream.flush()
    }

    // -----------------------------------------------------------------------
    // Listener lifecycle
    // -----------------------------------------------------------------------

    fn start_listener(self: &Arc<Self>) -> DriverResult<()> {
        let mut slot = self.listener.lock().expect("lock poisoned");
        if slot.is_some() {
            return Ok(());
        }
        let shared = self.clone();
        let shutdown = self.shutdown.subscribe();
        let handle = std::thread::Builder::new()
            .name(LISTENER_THREAD.into())
            .spawn(move || listener::run(shared, shutdown))
            .map_err(|e| DriverError::Backend(format!("cannot start listener: {e}")))?;
        let _ = self.listener_thread.set(handle.thread().id());
        *slot = Some(handle);
        Ok(())
    }

    /// Shut down: fail pending flushes, stop the listener and wait for it.
    pub(crate) fn close(&self) {
        self.set_state(ReplicaState::Closed);
        let _ = self.shutdown.send(true);
        self.reconnect.notify_one();
        let handle = self.listener.lock().expect("lock poisoned").take();
        if let Some(handle) = handle {
            if self.on_listener_thread() {
                return;
            }
            if handle.join().is_err() {
                warn!(tree = %self.tree, "change-feed listener panicked");
            }
        }
    }
}

/// Driver that keeps a tree in sync with a [`DurableStore`].
pub struct ReplicatingDriver {
    shared: Arc<Shared>,
}

impl ReplicatingDriver {
    pub fn new(
        meta: &TreeMeta,
        downstream: Arc<dyn Driver>,
        store: Arc<dyn DurableStore>,
        codec: Arc<dyn Codec>,
        config: ReplicaConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                tree: meta.name.clone(),
                manifest: meta.schema.fingerprint(),
                schema: meta.schema.clone(),
                policy: meta.state.policy().clone(),
                state_tree: meta.state.clone(),
                downstream,
                store,
                codec,
                config,
                status: Mutex::new(Status {
                    state: ReplicaState::Uninitialized,
                    applied: 0,
                    last_error: None,
                }),
                changed: Condvar::new(),
                reconnect: Notify::new(),
                shutdown,
                listener: Mutex::new(None),
                listener_thread: OnceLock::new(),
            }),
        }
    }

    pub fn factory(
        store: Arc<dyn DurableStore>,
        codec: Arc<dyn Codec>,
        config: ReplicaConfig,
    ) -> DriverFactory {
        Self::factory_with_handle(store, codec, config).0
    }

    /// Like [`factory`](Self::factory), plus a handle to the driver it builds.
    pub fn factory_with_handle(
        store: Arc<dyn DurableStore>,
        codec: Arc<dyn Codec>,
        config: ReplicaConfig,
    ) -> (DriverFactory, ReplicaHandle) {
        let handle = ReplicaHandle::default();
        let slot = handle.slot.clone();
        let factory: DriverFactory = Box::new(move |meta: &TreeMeta, downstream: Arc<dyn Driver>| {
            let driver = ReplicatingDriver::new(meta, downstream, store, codec, config);
            let _ = slot.set(driver.shared.clone());
            Ok(Arc::new(driver) as Arc<dyn Driver>)
        });
        (factory, handle)
    }

    pub fn handle(&self) -> ReplicaHandle {
        let handle = ReplicaHandle::default();
        let _ = handle.slot.set(self.shared.clone());
        handle
    }

    pub fn status(&self) -> ReplicaStatus {
        self.shared.status()
    }

    pub fn close(&self) {
        self.shared.close();
    }
}

impl Driver for ReplicatingDriver {
    fn initial_root(&self) -> DriverResult<Node> {
        let root = self.shared.bootstrap()?;
        self.shared.start_listener()?;
        Ok(root)
    }

    fn submit(&self, update: Update) -> DriverResult<()> {
        self.shared.write(&update)
    }

    fn flush(&self) -> DriverResult<()> {
        self.shared.flush()
    }
}

impl Drop for ReplicatingDriver {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// Observes and controls a [`ReplicatingDriver`] from outside the stack.
#[derive(Clone, Default)]
pub struct ReplicaHandle {
    slot: Arc<OnceLock<Arc<Shared>>>,
}

impl ReplicaHandle {
    /// `None` until the driver has been built.
    pub fn status(&self) -> Option<ReplicaStatus> {
        self.slot.get().map(|s| s.status())
    }

    pub fn state(&self) -> Option<ReplicaState> {
        self.status().map(|s| s.state)
    }

    pub fn applied_revision(&self) -> Option<u64> {
        self.slot.get().map(|s| s.applied_revision())
    }

    /// Ask the listener to re-bootstrap from the store now.
    pub fn request_reconnect(&self) {
        if let Some(shared) = self.slot.get() {
            shared.reconnect.notify_one();
        }
    }

    pub fn close(&self) {
        if let Some(shared) = self.slot.get() {
            shared.close();
        }
    }

    /// Block until the driver reaches `state` or `timeout` elapses.
    pub fn wait_for(&self, state: ReplicaState, timeout: Duration) -> bool {
        let Some(shared) = self.slot.get() else {
            return false;
        };
        let deadline = Instant::now() + timeout;
        let mut status = shared.lock_status();
        while status.state != state {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            status = shared
                .changed
                .wait_timeout(status, deadline - now)
                .expect("lock poisoned")
                .0;
        }
        true
    }
}

impl std::fmt::Debug for ReplicaHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaHandle")
            .field("status", &self.status())
            .finish()
    }
}
