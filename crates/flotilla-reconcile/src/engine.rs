//! The per-root-entity reconciliation engine.
//!
//! An engine owns three model trees and processes one change action at a
//! time. External change requests enqueue from any thread through an
//! [`EngineRef`]; the framework loop is the only caller of
//! [`ReconciliationEngine::trigger_events`], so model mutation is strictly
//! serial and per-engine event order is total.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::action::{ChangeAction, ModelSnapshot, Reconciler};
use crate::error::{ReconcileError, ReconcileResult};
use crate::event::{EventKind, ModelKind, ReconcilerEvent};
use crate::holder::EntityHolder;
use crate::update::{self, ModelUpdateAction};

/// What a trigger accomplished, aggregated by the framework to pick its
/// loop pacing.
#[derive(Debug, Clone, Copy, Default)]
pub struct TriggerStatus {
    pub has_model_updates: bool,
    pub running_change_actions: bool,
}

struct PendingChange<E> {
    action: Arc<dyn ChangeAction<E>>,
    result_tx: Option<oneshot::Sender<ReconcileResult<()>>>,
}

type SharedQueue<E> = Arc<Mutex<VecDeque<PendingChange<E>>>>;

struct InFlight<E> {
    summary: String,
    compensating: Vec<ModelUpdateAction<E>>,
    result_tx: Option<oneshot::Sender<ReconcileResult<()>>>,
    rx: oneshot::Receiver<ReconcileResult<Vec<ModelUpdateAction<E>>>>,
}

/// Thread-safe handle for enqueueing change requests against one engine.
pub struct EngineRef<E> {
    root_id: String,
    external: SharedQueue<E>,
    shut_down: Arc<AtomicBool>,
}

impl<E> std::fmt::Debug for EngineRef<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRef")
            .field("root_id", &self.root_id)
            .field("shut_down", &self.shut_down.load(std::sync::atomic::Ordering::Relaxed))
            .finish()
    }
}

impl<E> Clone for EngineRef<E> {
    fn clone(&self) -> Self {
        Self {
            root_id: self.root_id.clone(),
            external: self.external.clone(),
            shut_down: self.shut_down.clone(),
        }
    }
}

impl<E> EngineRef<E> {
    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    /// Enqueue an external change request. The returned receiver resolves
    /// when the action completes (or fails, or is cancelled by shutdown).
    pub fn change_reference_model(
        &self,
        action: Arc<dyn ChangeAction<E>>,
    ) -> oneshot::Receiver<ReconcileResult<()>> {
        let (tx, rx) = oneshot::channel();
        if self.shut_down.load(Ordering::SeqCst) {
            let _ = tx.send(Err(ReconcileError::ShutdownInProgress));
            return rx;
        }
        self.external.lock().unwrap().push_back(PendingChange {
            action,
            result_tx: Some(tx),
        });
        rx
    }
}

/// One root entity's three-model state machine.
pub struct ReconciliationEngine<E> {
    root_id: String,
    reference: EntityHolder<E>,
    running: EntityHolder<E>,
    store: EntityHolder<E>,
    external: SharedQueue<E>,
    shut_down: Arc<AtomicBool>,
    reconciler: Option<Arc<dyn Reconciler<E>>>,
    in_flight: Option<InFlight<E>>,
    events: VecDeque<ReconcilerEvent>,
    last_event_ts: u64,
}

impl<E: Clone + Send + Sync + 'static> ReconciliationEngine<E> {
    /// Bootstrap an engine; all three models start from the bootstrap
    /// holder (loaded from the store at startup).
    pub fn new(bootstrap: EntityHolder<E>) -> Self {
        Self {
            root_id: bootstrap.id().to_string(),
            reference: bootstrap.clone(),
            running: bootstrap.clone(),
            store: bootstrap,
            external: Arc::new(Mutex::new(VecDeque::new())),
            shut_down: Arc::new(AtomicBool::new(false)),
            reconciler: None,
            in_flight: None,
            events: VecDeque::new(),
            last_event_ts: 0,
        }
    }

    pub fn with_reconciler(mut self, reconciler: Arc<dyn Reconciler<E>>) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    pub fn handle(&self) -> EngineRef<E> {
        EngineRef {
            root_id: self.root_id.clone(),
            external: self.external.clone(),
            shut_down: self.shut_down.clone(),
        }
    }

    pub fn reference_view(&self) -> &EntityHolder<E> {
        &self.reference
    }

    pub fn running_view(&self) -> &EntityHolder<E> {
        &self.running
    }

    pub fn store_view(&self) -> &EntityHolder<E> {
        &self.store
    }

    fn snapshot(&self) -> ModelSnapshot<E> {
        ModelSnapshot {
            reference: self.reference.clone(),
            running: self.running.clone(),
            store: self.store.clone(),
        }
    }

    /// Events emitted since the last drain, in order.
    pub fn drain_events(&mut self) -> Vec<ReconcilerEvent> {
        self.events.drain(..).collect()
    }

    pub fn has_pending_work(&self) -> bool {
        self.in_flight.is_some() || !self.external.lock().unwrap().is_empty()
    }

    /// One trigger cycle: collect the completed action (if any) and apply
    /// its update group, then start the next action. Must be called from
    /// within a tokio runtime.
    pub fn trigger_events(&mut self, now_ms: u64) -> ReconcileResult<TriggerStatus> {
        let mut has_model_updates = false;

        // Step 1: apply updates from an action that completed since the
        // last trigger.
        if let Some(mut in_flight) = self.in_flight.take() {
            match in_flight.rx.try_recv() {
                Ok(Ok(updates)) => match self.apply_group(&updates) {
                    Ok(()) => {
                        has_model_updates = !updates.is_empty();
                        for update in &updates {
                            self.emit(
                                now_ms,
                                EventKind::ModelUpdate,
                                Some(update.target),
                                update.summary.clone(),
                                None,
                            );
                        }
                        self.emit(
                            now_ms,
                            EventKind::ChangeCompleted,
                            None,
                            in_flight.summary,
                            None,
                        );
                        if let Some(tx) = in_flight.result_tx {
                            let _ = tx.send(Ok(()));
                        }
                    }
                    Err(e) => {
                        has_model_updates = self.fail_action(
                            now_ms,
                            in_flight.summary,
                            in_flight.compensating,
                            in_flight.result_tx,
                            e,
                        );
                    }
                },
                Ok(Err(e)) => {
                    has_model_updates = self.fail_action(
                        now_ms,
                        in_flight.summary,
                        in_flight.compensating,
                        in_flight.result_tx,
                        e,
                    );
                }
                Err(oneshot::error::TryRecvError::Empty) => {
                    self.in_flight = Some(in_flight);
                }
                Err(oneshot::error::TryRecvError::Closed) => {
                    has_model_updates = self.fail_action(
                        now_ms,
                        in_flight.summary,
                        in_flight.compensating,
                        in_flight.result_tx,
                        ReconcileError::Internal("change action task dropped".into()),
                    );
                }
            }
        }

        // Step 2: start the next action if none is running. External
        // requests first; otherwise derive one reconciler action from the
        // model diff.
        if self.in_flight.is_none() && !self.shut_down.load(Ordering::SeqCst) {
            let next = {
                let mut queue = self.external.lock().unwrap();
                queue.pop_front()
            };
            let next = match next {
                Some(pending) => Some((pending.action, pending.result_tx)),
                None => self.reconciler.as_ref().and_then(|reconciler| {
                    let snapshot = self.snapshot();
                    reconciler
                        .resolve(&snapshot, now_ms)
                        .into_iter()
                        .next()
                        .map(|action| (Arc::from(action), None))
                }),
            };
            if let Some((action, result_tx)) = next {
                self.start_action(now_ms, action, result_tx);
            }
        }

        let running_change_actions = self.has_pending_work();
        Ok(TriggerStatus {
            has_model_updates,
            running_change_actions,
        })
    }

    fn start_action(
        &mut self,
        now_ms: u64,
        action: Arc<dyn ChangeAction<E>>,
        result_tx: Option<oneshot::Sender<ReconcileResult<()>>>,
    ) {
        let snapshot = self.snapshot();
        let summary = action.summary();
        let compensating = action.compensating_updates(&snapshot);
        let future = action.apply(&snapshot);

        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let _ = tx.send(future.await);
        });

        debug!(root_id = %self.root_id, %summary, "change action started");
        self.emit(now_ms, EventKind::ChangeStarted, None, summary.clone(), None);
        self.in_flight = Some(InFlight {
            summary,
            compensating,
            result_tx,
            rx,
        });
    }

    /// Apply a group of deltas atomically: all or nothing.
    fn apply_group(&mut self, updates: &[ModelUpdateAction<E>]) -> ReconcileResult<()> {
        let before = (
            self.reference.clone(),
            self.running.clone(),
            self.store.clone(),
        );
        for action in updates {
            let tree = match action.target {
                ModelKind::Reference => &self.reference,
                ModelKind::Running => &self.running,
                ModelKind::Store => &self.store,
            };
            match update::apply(tree, &action.op) {
                Ok(updated) => match action.target {
                    ModelKind::Reference => self.reference = updated,
                    ModelKind::Running => self.running = updated,
                    ModelKind::Store => self.store = updated,
                },
                Err(e) => {
                    (self.reference, self.running, self.store) = before;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Handle a failed action: apply its compensating updates, emit the
    /// failure event, answer the caller. Returns whether models changed.
    fn fail_action(
        &mut self,
        now_ms: u64,
        summary: String,
        compensating: Vec<ModelUpdateAction<E>>,
        result_tx: Option<oneshot::Sender<ReconcileResult<()>>>,
        error: ReconcileError,
    ) -> bool {
        warn!(root_id = %self.root_id, %summary, %error, "change action failed");
        let mut changed = false;
        if !compensating.is_empty() {
            match self.apply_group(&compensating) {
                Ok(()) => {
                    changed = true;
                    for update in &compensating {
                        self.emit(
                            now_ms,
                            EventKind::ModelUpdate,
                            Some(update.target),
                            update.summary.clone(),
                            None,
                        );
                    }
                }
                Err(e) => {
                    warn!(root_id = %self.root_id, %e, "compensating update failed");
                }
            }
        }
        self.emit(
            now_ms,
            EventKind::ChangeFailed,
            None,
            summary,
            Some(error.to_string()),
        );
        if let Some(tx) = result_tx {
            let _ = tx.send(Err(error));
        }
        changed
    }

    /// Fail queued and in-flight actions with a cancellation error. The
    /// framework drops the engine afterwards, which ends its event stream.
    pub fn shutdown(&mut self, now_ms: u64) {
        self.shut_down.store(true, Ordering::SeqCst);
        if let Some(in_flight) = self.in_flight.take() {
            self.emit(
                now_ms,
                EventKind::ChangeFailed,
                None,
                in_flight.summary,
                Some(ReconcileError::Cancelled.to_string()),
            );
            if let Some(tx) = in_flight.result_tx {
                let _ = tx.send(Err(ReconcileError::Cancelled));
            }
        }
        let drained: Vec<PendingChange<E>> = {
            let mut queue = self.external.lock().unwrap();
            queue.drain(..).collect()
        };
        for pending in drained {
            self.emit(
                now_ms,
                EventKind::ChangeFailed,
                None,
                pending.action.summary(),
                Some(ReconcileError::Cancelled.to_string()),
            );
            if let Some(tx) = pending.result_tx {
                let _ = tx.send(Err(ReconcileError::Cancelled));
            }
        }
        debug!(root_id = %self.root_id, "engine shut down");
    }

    fn emit(
        &mut self,
        now_ms: u64,
        kind: EventKind,
        model: Option<ModelKind>,
        summary: String,
        error: Option<String>,
    ) {
        // Per-engine timestamps never go backwards.
        let ts = now_ms.max(self.last_event_ts);
        self.last_event_ts = ts;
        let mut event = ReconcilerEvent::new(ts, self.root_id.clone(), kind, summary);
        event.model = model;
        event.error = error;
        self.events.push_back(event);
    }
}
