//! The change-feed listener.
//!
//! One thread per replicating driver. It waits for the tree to be
//! initialized, then follows the durable store's change feed from the last
//! applied revision. A gap, an expired token, or a failed change makes it
//! re-bootstrap from the stored document; an unreachable store makes it
//! retry with exponential backoff until it reconnects or the driver closes.

use std::sync::Arc;
use std::time::Duration;

use arbor_driver::DriverError;
use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::driver::{EventOutcome, ReplicaState, Shared};
use crate::error::StoreError;

/// Exponential backoff with jitter.
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.initial;
    }

    /// The next delay: the current step plus up to half of it again.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        let spread = (base.as_millis() as u64) / 2;
        let jitter = if spread == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=spread)
        };
        (base + Duration::from_millis(jitter)).min(self.max)
    }
}

/// Thread entry point.
pub(crate) fn run(shared: Arc<Shared>, shutdown: watch::Receiver<bool>) {
    let poll = shared.config.listener_poll();
    while !shared.state_tree.wait_until_initialized(poll) {
        if *shutdown.borrow() || shared.is_closed() {
            return;
        }
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let err = DriverError::Backend(format!("cannot start listener runtime: {e}"));
            error!(tree = %shared.tree, error = %err, "change-feed listener failed");
            shared.fail(&err);
            return;
        }
    };
    runtime.block_on(follow(shared.clone(), shutdown));
    debug!(tree = %shared.tree, "change-feed listener stopped");
}

async fn follow(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut backoff = Backoff::new(shared.config.initial_backoff(), shared.config.max_backoff());
    let mut needs_reload = shared.status().state != ReplicaState::Connected;
    let collection = shared.config.collection.clone();

    loop {
        if *shutdown.borrow() || shared.is_closed() {
            return;
        }

        if needs_reload {
            match shared.reload() {
                Ok(()) => {
                    needs_reload = false;
                    backoff.reset();
                }
                Err(e @ DriverError::ManifestMismatch { .. }) => {
                    error!(tree = %shared.tree, error = %e, "durable state has an incompatible schema");
                    shared.fail(&e);
                    return;
                }
                Err(e) => {
                    shared.mark_disconnected(e.to_string());
                    let delay = backoff.next_delay();
                    debug!(tree = %shared.tree, delay_ms = delay.as_millis() as u64, "retrying bootstrap");
                    if !pause(&shared, &mut shutdown, delay).await {
                        return;
                    }
                    continue;
                }
            }
        }

        let mut stream = match shared.store.watch(&collection, shared.applied_revision()) {
            Ok(stream) => stream,
            Err(StoreError::TokenExpired { token }) => {
                warn!(tree = %shared.tree, token, "resume token expired, reloading");
                needs_reload = true;
                continue;
            }
            Err(e) => {
                shared.mark_disconnected(e.to_string());
                needs_reload = true;
                if !pause(&shared, &mut shutdown, backoff.next_delay()).await {
                    return;
                }
                continue;
            }
        };
        info!(tree = %shared.tree, position = stream.position(), "following change feed");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                _ = shared.reconnect.notified() => {
                    debug!(tree = %shared.tree, "reconnect requested");
                    needs_reload = true;
                    break;
                }
                next = stream.next() => match next {
                    Ok(event) => match shared.apply_event(event) {
                        EventOutcome::Applied | EventOutcome::Skipped => {}
                        EventOutcome::Reload => {
                            needs_reload = true;
                            break;
                        }
                    },
                    Err(StoreError::TokenExpired { token }) => {
                        warn!(tree = %shared.tree, token, "change feed lagged, reloading");
                        needs_reload = true;
                        break;
                    }
                    Err(e) => {
                        shared.mark_disconnected(e.to_string());
                        needs_reload = true;
                        break;
                    }
                },
            }
        }
    }
}

/// Sleep for `delay` unless a reconnect is requested first. Returns false
/// once shutdown has been signalled.
async fn pause(shared: &Shared, shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shared.reconnect.notified() => true,
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}
