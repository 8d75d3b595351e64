use std::collections::{HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use arbor_refs::{resolve_path, BindingEnvironment, Reference};
use arbor_tree::{Commit, CommitObserver, DiagnosticContext, Diagnostics, Snapshot, StateTree};
use arbor_types::{Identifier, Node, Path, Segment};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{HookError, Result};

/// Capacity of the failure broadcast channel.
const FAILURE_CHANNEL_CAPACITY: usize = 256;

/// Identifies one registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HookHandle(u64);

impl HookHandle {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for HookHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "hook-{}", self.0)
    }
}

/// What a hook callback is told about one firing.
#[derive(Clone, Debug)]
pub struct HookContext {
    /// The name the hook was registered under.
    pub hook: String,
    /// The concrete instance of the hook's scope that changed.
    pub reference: Reference,
    /// The snapshot the hook's read session is pinned to.
    pub snapshot: Arc<Snapshot>,
    /// Attributes in force when the update was submitted.
    pub diagnostics: Diagnostics,
}

impl HookContext {
    pub fn revision(&self) -> u64 {
        self.snapshot.revision
    }

    /// The value at [`reference`](Self::reference) in the pinned snapshot.
    pub fn value(&self) -> Result<Node> {
        Ok(arbor_refs::resolve(&self.reference, &self.snapshot.root)?)
    }

    /// Resolve any other reference against the pinned snapshot.
    pub fn resolve(&self, reference: &Reference) -> Result<Node> {
        Ok(arbor_refs::resolve(reference, &self.snapshot.root)?)
    }
}

/// A hook that returned an error or panicked.
#[derive(Clone, Debug)]
pub struct HookFailure {
    pub handle: HookHandle,
    pub hook: String,
    pub reference: Reference,
    pub revision: u64,
    pub error: HookError,
}

type Callback = Arc<dyn Fn(&HookContext) -> Result<()> + Send + Sync>;

struct Registration {
    handle: HookHandle,
    name: String,
    scope: Reference,
    callback: Callback,
}

struct Invocation {
    handle: HookHandle,
    reference: Reference,
    snapshot: Arc<Snapshot>,
    diagnostics: Diagnostics,
}

/// Fires registered callbacks after committed changes.
///
/// Invocations are queued under the tree's commit lock, so their order
/// follows the commit order, and within one commit the registration order.
/// A single drainer runs them after the lock is released; a callback may
/// therefore commit further updates, whose invocations queue behind the
/// current ones.
pub struct HookDispatcher {
    state: Weak<StateTree>,
    registrations: RwLock<Vec<Registration>>,
    queue: Mutex<VecDeque<Invocation>>,
    draining: AtomicBool,
    next_handle: AtomicU64,
    failures: broadcast::Sender<HookFailure>,
}

impl HookDispatcher {
    /// Create a dispatcher and attach it to `state` as a commit observer.
    pub fn attach(state: &Arc<StateTree>) -> Arc<Self> {
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        let dispatcher = Arc::new(Self {
            state: Arc::downgrade(state),
            registrations: RwLock::new(Vec::new()),
            queue: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            next_handle: AtomicU64::new(1),
            failures,
        });
        state.add_observer(dispatcher.clone());
        dispatcher
    }

    /// Register `callback` for changes overlapping `scope`.
    ///
    /// The hook fires once right away for every instance of `scope` present
    /// in the current state. No commit can interleave between registration
    /// and those initial firings being queued.
    pub fn register<F>(&self, name: impl Into<String>, scope: Reference, callback: F) -> HookHandle
    where
        F: Fn(&HookContext) -> Result<()> + Send + Sync + 'static,
    {
        let handle = HookHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let registration = Registration {
            handle,
            name: name.into(),
            scope,
            callback: Arc::new(callback),
        };
        debug!(hook = %registration.name, %handle, scope = %registration.scope.path(), "registering hook");

        let Some(state) = self.state.upgrade() else {
            self.push_registration(registration);
            return handle;
        };
        let mut pending = Some(registration);
        let queued = state.with_commit_lock(|snapshot| {
            let Some(registration) = pending.take() else {
                return;
            };
            let invocations = present_instances(&registration.scope, &snapshot.root)
                .into_iter()
                .map(|reference| Invocation {
                    handle,
                    reference,
                    snapshot: snapshot.clone(),
                    diagnostics: DiagnosticContext::current(),
                })
                .collect::<Vec<_>>();
            self.push_registration(registration);
            self.queue.lock().expect("lock poisoned").extend(invocations);
        });
        if queued.is_err() {
            // Not initialized yet: nothing is present to fire for.
            if let Some(registration) = pending.take() {
                self.push_registration(registration);
            }
        }
        handle
    }

    fn push_registration(&self, registration: Registration) {
        self.registrations
            .write()
            .expect("lock poisoned")
            .push(registration);
    }

    /// Remove a registration. Queued invocations of it are dropped.
    /// Returns `false` if the handle was not registered.
    pub fn deregister(&self, handle: HookHandle) -> bool {
        let mut registrations = self.registrations.write().expect("lock poisoned");
        let before = registrations.len();
        registrations.retain(|r| r.handle != handle);
        before != registrations.len()
    }

    /// Subscribe to hook failures.
    pub fn failures(&self) -> broadcast::Receiver<HookFailure> {
        self.failures.subscribe()
    }

    pub fn len(&self) -> usize {
        self.registrations.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of invocations waiting to run.
    pub fn pending(&self) -> usize {
        self.queue.lock().expect("lock poisoned").len()
    }

    /// Run queued invocations until the queue is empty. Only one thread
    /// drains at a time; a nested or concurrent call returns immediately and
    /// leaves its work to the active drainer.
    fn drain(&self) {
        loop {
            if self
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            loop {
                let next = self.queue.lock().expect("lock poisoned").pop_front();
                match next {
                    Some(invocation) => self.run(invocation),
                    None => break,
                }
            }
            self.draining.store(false, Ordering::Release);
            // Work queued between the last pop and the release would be stranded.
            if self.queue.lock().expect("lock poisoned").is_empty() {
                return;
            }
        }
    }

    fn run(&self, invocation: Invocation) {
        let found = self
            .registrations
            .read()
            .expect("lock poisoned")
            .iter()
            .find(|r| r.handle == invocation.handle)
            .map(|r| (r.name.clone(), r.callback.clone()));
        let Some((name, callback)) = found else {
            return;
        };
        let Some(state) = self.state.upgrade() else {
            return;
        };

        let context = HookContext {
            hook: name,
            reference: invocation.reference,
            snapshot: invocation.snapshot,
            diagnostics: invocation.diagnostics,
        };
        let outcome = {
            let _session = state.pinned_session(context.snapshot.clone());
            let _scope = DiagnosticContext::install(context.diagnostics.clone());
            catch_unwind(AssertUnwindSafe(|| callback(&context)))
        };
        let error = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e,
            Err(panic) => HookError::Panicked(panic_message(panic.as_ref())),
        };
        warn!(
            hook = %context.hook,
            handle = %invocation.handle,
            reference = %context.reference.path(),
            revision = context.snapshot.revision,
            error = %error,
            "hook failed"
        );
        let _ = self.failures.send(HookFailure {
            handle: invocation.handle,
            hook: context.hook,
            reference: context.reference,
            revision: context.snapshot.revision,
            error,
        });
    }
}

impl CommitObserver for HookDispatcher {
    fn observe(&self, commit: &Commit) {
        let registrations = self.registrations.read().expect("lock poisoned");
        let mut queue = self.queue.lock().expect("lock poisoned");
        for registration in registrations.iter() {
            for reference in changed_instances(&registration.scope, commit) {
                queue.push_back(Invocation {
                    handle: registration.handle,
                    reference,
                    snapshot: commit.new.clone(),
                    diagnostics: commit.diagnostics.clone(),
                });
            }
        }
    }

    fn settle(&self) {
        self.drain();
    }
}

impl std::fmt::Debug for HookDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookDispatcher")
            .field("hooks", &self.len())
            .field("pending", &self.pending())
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".into()
    }
}

/// Whether a hook scope and a changed path overlap.
///
/// They overlap when one is a prefix of the other position by position, a
/// parameter matching any literal.
pub fn overlaps(scope: &Path, changed: &Path) -> bool {
    scope
        .segments()
        .iter()
        .zip(changed.segments())
        .all(|(a, b)| match (a, b) {
            (Segment::Literal(x), Segment::Literal(y)) => x == y,
            _ => true,
        })
}

/// Concrete instances of `scope` affected by `commit`.
fn changed_instances(scope: &Reference, commit: &Commit) -> Vec<Reference> {
    if !overlaps(scope.path(), &commit.target) {
        return Vec::new();
    }
    let Some(env) = BindingEnvironment::from_instance(scope.path(), &commit.target) else {
        return Vec::new();
    };
    enumerate(scope, env, &[&commit.new.root, &commit.old.root])
}

/// Concrete instances of `scope` that resolve in `root`.
fn present_instances(scope: &Reference, root: &Node) -> Vec<Reference> {
    enumerate(scope, BindingEnvironment::new(), &[root])
        .into_iter()
        .filter(|r| resolve_path(root, r.path()).is_ok())
        .collect()
}

/// Bind the parameters `env` leaves open to every key found at that
/// position in any of `roots`.
fn enumerate(scope: &Reference, env: BindingEnvironment, roots: &[&Node]) -> Vec<Reference> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    expand(scope, env, roots, &mut out, &mut seen);
    out
}

fn expand(
    scope: &Reference,
    env: BindingEnvironment,
    roots: &[&Node],
    out: &mut Vec<Reference>,
    seen: &mut HashSet<Path>,
) {
    let bound = env.apply(scope.path());
    let open = bound
        .segments()
        .iter()
        .position(Segment::is_param);
    let Some(index) = open else {
        if seen.insert(bound.clone()) {
            out.push(scope.bind(&env));
        }
        return;
    };
    let Some(name) = bound.segments()[index].as_param() else {
        return;
    };
    let container = bound.truncated(index);
    for id in keys_at(&container, roots) {
        expand(scope, env.clone().with(name, id), roots, out, seen);
    }
}

/// Keys of the container at `path` in each root, first root first.
fn keys_at(path: &Path, roots: &[&Node]) -> Vec<Identifier> {
    let mut keys = Vec::new();
    let mut seen = HashSet::new();
    for root in roots {
        let Ok(node) = resolve_path(root, path) else {
            continue;
        };
        let ids: Vec<Identifier> = match &node {
            Node::Catalog(c) => c.ids().cloned().collect(),
            Node::Listing(l) => l.ids().cloned().collect(),
            Node::SideTable(t) => t.ids().cloned().collect(),
            _ => Vec::new(),
        };
        for id in ids {
            if seen.insert(id.clone()) {
                keys.push(id);
            }
        }
    }
    keys
}
