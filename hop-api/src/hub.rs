//! Status broadcast hub
//!
//! The hub holds the most recent [`StatusSnapshot`] and the set of registered
//! observers. Transitions replace the snapshot and wake a single delivery
//! task; that task pushes the latest snapshot to every observer in one pass
//! and prunes the ones that could not be reached.
//!
//! Transitions arriving while a pass is running coalesce: the next pass
//! delivers only the newest snapshot. Each snapshot carries a sequence
//! number and an observer never receives a snapshot older than (or equal
//! to) one it already got, so a registration racing with a pass sees the
//! current state exactly once and never goes backwards.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::DeliveryError;
use crate::status::StatusSnapshot;

static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of an observer handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

impl ObserverId {
    /// Allocate a process-unique id
    pub fn next() -> Self {
        Self(NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer#{}", self.0)
    }
}

/// A remote client receiving status pushes
#[async_trait::async_trait]
pub trait StatusObserver: Send + Sync {
    fn id(&self) -> ObserverId;

    /// Deliver one snapshot; an error means the observer is unreachable
    async fn on_status(&self, status: &StatusSnapshot) -> Result<(), DeliveryError>;
}

/// Snapshot tagged with its position in the transition sequence
#[derive(Debug)]
struct Versioned {
    seq: u64,
    status: StatusSnapshot,
}

struct Registration {
    key: u64,
    observer: Arc<dyn StatusObserver>,
    /// Sequence number of the newest snapshot this observer has taken
    delivered: tokio::sync::Mutex<u64>,
}

impl Registration {
    /// Deliver unless the observer already has this snapshot or a newer one
    async fn deliver(&self, snapshot: &Versioned, timeout: Duration) -> Result<(), DeliveryError> {
        let mut delivered = self.delivered.lock().await;
        if *delivered >= snapshot.seq {
            return Ok(());
        }

        match tokio::time::timeout(timeout, self.observer.on_status(&snapshot.status)).await {
            Ok(Ok(())) => {
                *delivered = snapshot.seq;
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DeliveryError::Timeout),
        }
    }
}

/// Tells the delivery task whether the hub still exists
#[derive(Debug, Clone)]
struct Liveness(Arc<AtomicBool>);

impl Liveness {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    fn is_alive(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn invalidate(&self) {
        self.0.store(false, Ordering::Release);
    }
}

struct HubState {
    snapshot: Arc<Versioned>,
    registrations: Vec<Arc<Registration>>,
    next_key: u64,
    /// Wakes the delivery task; `None` once the hub is shut down
    wake: Option<watch::Sender<Arc<Versioned>>>,
}

struct Shared {
    state: Mutex<HubState>,
    delivery_timeout: Duration,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn prune(&self, dead: &[u64]) {
        if dead.is_empty() {
            return;
        }
        self.lock()
            .registrations
            .retain(|registration| !dead.contains(&registration.key));
    }

    /// One broadcast pass over a point-in-time copy of the registry
    async fn broadcast(&self, snapshot: &Versioned) {
        let targets = self.lock().registrations.clone();
        if targets.is_empty() {
            return;
        }

        let results = join_all(targets.iter().map(|registration| async move {
            let result = registration.deliver(snapshot, self.delivery_timeout).await;
            (registration, result)
        }))
        .await;

        let dead: Vec<u64> = results
            .into_iter()
            .filter_map(|(registration, result)| match result {
                Ok(()) => None,
                Err(e) => {
                    log::debug!("Dropping {}: {}", registration.observer.id(), e);
                    Some(registration.key)
                }
            })
            .collect();

        self.prune(&dead);
    }
}

/// Holder of the status snapshot and the observer registry
pub struct StatusHub {
    shared: Arc<Shared>,
    liveness: Liveness,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StatusHub {
    /// Create the hub and spawn its delivery task
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(delivery_timeout: Duration) -> Self {
        let initial = Arc::new(Versioned {
            seq: 0,
            status: StatusSnapshot::initial(),
        });
        let (wake, mut rx) = watch::channel(initial.clone());

        let shared = Arc::new(Shared {
            state: Mutex::new(HubState {
                snapshot: initial,
                registrations: Vec::new(),
                next_key: 0,
                wake: Some(wake),
            }),
            delivery_timeout,
        });

        let liveness = Liveness::new();
        let task = {
            let shared = shared.clone();
            let liveness = liveness.clone();
            tokio::spawn(async move {
                while rx.changed().await.is_ok() {
                    if !liveness.is_alive() {
                        break;
                    }
                    let snapshot = rx.borrow_and_update().clone();
                    shared.broadcast(&snapshot).await;
                }
                log::debug!("Status delivery task finished");
            })
        };

        Self {
            shared,
            liveness,
            task: Mutex::new(Some(task)),
        }
    }

    /// The current snapshot
    pub fn snapshot(&self) -> StatusSnapshot {
        self.shared.lock().snapshot.status.clone()
    }

    pub fn is_connected_or_connecting(&self) -> bool {
        self.shared.lock().snapshot.status.level.is_connected_or_connecting()
    }

    /// Number of live registrations
    pub fn observer_count(&self) -> usize {
        self.shared.lock().registrations.len()
    }

    /// Replace the snapshot and schedule a broadcast; never blocks on observers
    pub fn on_transition(&self, status: StatusSnapshot) {
        let mut state = self.shared.lock();
        let snapshot = Arc::new(Versioned {
            seq: state.snapshot.seq + 1,
            status,
        });
        state.snapshot = snapshot.clone();
        if let Some(wake) = &state.wake {
            wake.send_replace(snapshot);
        }
    }

    /// Register an observer and hand it the current snapshot
    ///
    /// Registering the same observer twice creates two registrations.
    /// An observer that fails its first delivery is dropped again.
    /// Returns `false` without registering once the hub is shut down.
    pub async fn register(&self, observer: Arc<dyn StatusObserver>) -> bool {
        let (registration, snapshot) = {
            let mut state = self.shared.lock();
            if state.wake.is_none() {
                log::debug!("Hub is shut down, not registering {}", observer.id());
                return false;
            }
            let registration = Arc::new(Registration {
                key: state.next_key,
                observer,
                delivered: tokio::sync::Mutex::new(0),
            });
            state.next_key += 1;
            state.registrations.push(registration.clone());
            (registration, state.snapshot.clone())
        };

        if let Err(e) = registration
            .deliver(&snapshot, self.shared.delivery_timeout)
            .await
        {
            log::debug!("Dropping {}: {}", registration.observer.id(), e);
            self.shared.prune(&[registration.key]);
        }
        true
    }

    /// Remove every registration of `id`; returns whether any existed
    pub fn unregister(&self, id: ObserverId) -> bool {
        let mut state = self.shared.lock();
        let before = state.registrations.len();
        state
            .registrations
            .retain(|registration| registration.observer.id() != id);
        state.registrations.len() != before
    }

    /// Drop every observer and stop the delivery task
    pub fn shutdown(&self) {
        self.liveness.invalidate();
        {
            let mut state = self.shared.lock();
            state.registrations.clear();
            state.wake = None;
        }
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}

impl Drop for StatusHub {
    fn drop(&mut self) {
        self.shutdown();
    }
}
