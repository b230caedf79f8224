//! The reconciliation framework loop.
//!
//! Owns the engine set and is the only mutator of it. Add/remove requests
//! enqueue onto concurrent queues and are acknowledged at the next loop
//! tick, after the indexes have been rebuilt to reflect them. Each tick
//! triggers every engine once, fans emitted events out to subscribers, and
//! sleeps `active_timeout_ms` while any engine has pending actions,
//! `idle_timeout_ms` otherwise.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use flotilla_types::{InvalidInput, ReconcilerConfig};

use crate::engine::{EngineRef, ReconciliationEngine};
use crate::error::{ReconcileError, ReconcileResult};
use crate::event::ReconcilerEvent;
use crate::holder::EntityHolder;
use crate::index::{Comparator, IndexSet};

/// Builds an engine from a bootstrap holder when an add request is
/// admitted.
pub type EngineFactory<E> =
    Box<dyn Fn(EntityHolder<E>) -> ReconciliationEngine<E> + Send + 'static>;

struct AddRequest<E> {
    bootstrap: EntityHolder<E>,
    responder: oneshot::Sender<ReconcileResult<EngineRef<E>>>,
}

struct RemoveRequest {
    root_id: String,
    responder: oneshot::Sender<ReconcileResult<()>>,
}

struct IndexState<E> {
    refs: HashMap<String, EngineRef<E>>,
    roots: Vec<EntityHolder<E>>,
    index_set: IndexSet<E>,
}

struct Shared<E> {
    runnable: AtomicBool,
    add_queue: Mutex<VecDeque<AddRequest<E>>>,
    remove_queue: Mutex<VecDeque<RemoveRequest>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ReconcilerEvent>>>,
    indexes: RwLock<IndexState<E>>,
    wake: Notify,
}

/// Owns a set of reconciliation engines and drives them from one loop.
pub struct ReconciliationFramework<E> {
    shared: Arc<Shared<E>>,
    config: ReconcilerConfig,
    factory: Mutex<Option<EngineFactory<E>>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<E: Clone + Send + Sync + 'static> ReconciliationFramework<E> {
    /// Requires `0 < active_timeout_ms <= idle_timeout_ms`.
    pub fn new(
        config: ReconcilerConfig,
        factory: EngineFactory<E>,
        index_comparators: HashMap<String, Comparator<E>>,
    ) -> Result<Self, InvalidInput> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                runnable: AtomicBool::new(true),
                add_queue: Mutex::new(VecDeque::new()),
                remove_queue: Mutex::new(VecDeque::new()),
                subscribers: Mutex::new(Vec::new()),
                indexes: RwLock::new(IndexState {
                    refs: HashMap::new(),
                    roots: Vec::new(),
                    index_set: IndexSet::new(index_comparators),
                }),
                wake: Notify::new(),
            }),
            config,
            factory: Mutex::new(Some(factory)),
            loop_handle: Mutex::new(None),
        })
    }

    /// Spawn the framework loop. Must be called exactly once, from within
    /// a tokio runtime.
    pub fn start(&self) -> ReconcileResult<()> {
        let factory = self
            .factory
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| ReconcileError::Internal("framework already started".into()))?;
        let shared = self.shared.clone();
        let config = self.config.clone();
        let handle = tokio::spawn(run_loop(shared, factory, config));
        *self.loop_handle.lock().unwrap() = Some(handle);
        info!("reconciliation framework started");
        Ok(())
    }

    /// Enqueue creation of a new engine; resolves once the engine is
    /// admitted into the set at the next loop tick.
    pub async fn new_engine(&self, bootstrap: EntityHolder<E>) -> ReconcileResult<EngineRef<E>> {
        if !self.shared.runnable.load(Ordering::SeqCst) {
            return Err(ReconcileError::ShutdownInProgress);
        }
        let (tx, rx) = oneshot::channel();
        self.shared.add_queue.lock().unwrap().push_back(AddRequest {
            bootstrap,
            responder: tx,
        });
        self.shared.wake.notify_one();
        rx.await
            .map_err(|_| ReconcileError::ShutdownInProgress)?
    }

    /// Enqueue removal; the loop shuts the engine down and removes it from
    /// the indexes before acknowledging.
    pub async fn remove_engine(&self, root_id: &str) -> ReconcileResult<()> {
        if !self.shared.runnable.load(Ordering::SeqCst) {
            return Err(ReconcileError::ShutdownInProgress);
        }
        let (tx, rx) = oneshot::channel();
        self.shared
            .remove_queue
            .lock()
            .unwrap()
            .push_back(RemoveRequest {
                root_id: root_id.to_string(),
                responder: tx,
            });
        self.shared.wake.notify_one();
        rx.await
            .map_err(|_| ReconcileError::ShutdownInProgress)?
    }

    /// Subscribe to the merged event stream of all current and future
    /// engines. Events emitted before subscription are not replayed.
    pub fn events(&self) -> mpsc::UnboundedReceiver<ReconcilerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.subscribers.lock().unwrap().push(tx);
        rx
    }

    pub fn find_engine_by_root_id(&self, root_id: &str) -> Option<EngineRef<E>> {
        let indexes = self.shared.indexes.read().unwrap();
        indexes.refs.get(root_id).cloned()
    }

    /// Find the engine owning a child entity, together with the child's
    /// reference view.
    pub fn find_engine_by_child_id(
        &self,
        child_id: &str,
    ) -> Option<(EngineRef<E>, EntityHolder<E>)> {
        let indexes = self.shared.indexes.read().unwrap();
        for root in &indexes.roots {
            if let Some(child) = root.child(child_id) {
                let engine = indexes.refs.get(root.id())?.clone();
                return Some((engine, child.clone()));
            }
        }
        None
    }

    /// Root reference views ordered by a registered criterion.
    pub fn ordered_view(&self, criterion: &str) -> Vec<EntityHolder<E>> {
        let indexes = self.shared.indexes.read().unwrap();
        indexes.index_set.ordered(criterion)
    }

    /// Stop the loop: no new add/remove requests are accepted, existing
    /// engines are drained with a cancellation error. Returns whether the
    /// loop finished within `timeout_ms`.
    pub async fn stop(&self, timeout_ms: u64) -> bool {
        self.shared.runnable.store(false, Ordering::SeqCst);
        self.shared.wake.notify_one();
        let handle = self.loop_handle.lock().unwrap().take();
        match handle {
            Some(handle) => tokio::time::timeout(Duration::from_millis(timeout_ms), handle)
                .await
                .is_ok(),
            None => true,
        }
    }
}

async fn run_loop<E: Clone + Send + Sync + 'static>(
    shared: Arc<Shared<E>>,
    factory: EngineFactory<E>,
    config: ReconcilerConfig,
) {
    let mut engines: Vec<ReconciliationEngine<E>> = Vec::new();

    loop {
        let now_ms = epoch_ms();
        let runnable = shared.runnable.load(Ordering::SeqCst);

        let adds: Vec<AddRequest<E>> = shared.add_queue.lock().unwrap().drain(..).collect();
        let removes: Vec<RemoveRequest> = shared.remove_queue.lock().unwrap().drain(..).collect();

        if !runnable {
            for add in adds {
                let _ = add.responder.send(Err(ReconcileError::ShutdownInProgress));
            }
            let mut final_events = Vec::new();
            for engine in &mut engines {
                engine.shutdown(now_ms);
                final_events.extend(engine.drain_events());
            }
            fan_out(&shared, final_events);
            for remove in removes {
                let _ = remove.responder.send(Ok(()));
            }
            engines.clear();
            rebuild_indexes(&shared, &engines);
            // Dropping the senders completes every subscriber's stream.
            shared.subscribers.lock().unwrap().clear();
            info!("reconciliation framework stopped");
            return;
        }

        let set_changed = !adds.is_empty() || !removes.is_empty();
        let mut add_acks = Vec::new();
        for add in adds {
            let engine = factory(add.bootstrap);
            debug!(root_id = %engine.root_id(), "engine admitted");
            add_acks.push((engine.handle(), add.responder));
            engines.push(engine);
        }

        let mut remove_acks = Vec::new();
        let mut removed_events = Vec::new();
        for remove in removes {
            match engines.iter().position(|e| e.root_id() == remove.root_id) {
                Some(pos) => {
                    let mut engine = engines.remove(pos);
                    engine.shutdown(now_ms);
                    removed_events.extend(engine.drain_events());
                    debug!(root_id = %remove.root_id, "engine removed");
                    remove_acks.push((remove.responder, Ok(())));
                }
                None => remove_acks.push((
                    remove.responder,
                    Err(ReconcileError::EngineNotFound(remove.root_id)),
                )),
            }
        }

        // Indexes reflect the set change before the waiters observe it.
        if set_changed {
            rebuild_indexes(&shared, &engines);
        }
        for (engine_ref, responder) in add_acks {
            let _ = responder.send(Ok(engine_ref));
        }
        for (responder, result) in remove_acks {
            let _ = responder.send(result);
        }

        // Trigger every engine; an engine's failure never stops the loop.
        let mut model_updates = false;
        let mut pending_actions = false;
        let mut events = removed_events;
        for engine in &mut engines {
            match engine.trigger_events(now_ms) {
                Ok(status) => {
                    model_updates |= status.has_model_updates;
                    pending_actions |= status.running_change_actions;
                }
                Err(e) => {
                    warn!(root_id = %engine.root_id(), error = %e, "engine trigger failed");
                }
            }
            events.extend(engine.drain_events());
        }
        fan_out(&shared, events);

        if model_updates {
            rebuild_indexes(&shared, &engines);
        }

        let delay_ms = if pending_actions {
            config.active_timeout_ms
        } else {
            config.idle_timeout_ms
        };
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
            _ = shared.wake.notified() => {}
        }
    }
}

fn rebuild_indexes<E: Clone + Send + Sync + 'static>(
    shared: &Shared<E>,
    engines: &[ReconciliationEngine<E>],
) {
    let roots: Vec<EntityHolder<E>> = engines.iter().map(|e| e.reference_view().clone()).collect();
    let refs: HashMap<String, EngineRef<E>> = engines
        .iter()
        .map(|e| (e.root_id().to_string(), e.handle()))
        .collect();
    let mut indexes = shared.indexes.write().unwrap();
    indexes.index_set = indexes.index_set.apply(&roots);
    indexes.roots = roots;
    indexes.refs = refs;
}

/// Forward events to every subscriber, pruning closed channels. Sends on
/// unbounded channels never block, so no lock is held across user code.
fn fan_out<E>(shared: &Shared<E>, events: Vec<ReconcilerEvent>) {
    if events.is_empty() {
        return;
    }
    let mut subscribers = shared.subscribers.lock().unwrap();
    subscribers.retain(|tx| {
        for event in &events {
            if tx.send(event.clone()).is_err() {
                return false;
            }
        }
        true
    });
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
