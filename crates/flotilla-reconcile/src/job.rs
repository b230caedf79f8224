//! Job-domain entities, change actions, and the difference resolver.
//!
//! A root holder carries a [`JobEntity::Job`]; its children are the job's
//! tasks. The actions here cover the core lifecycle: submitting a task,
//! marking it launched after placement (with the durable write inline),
//! persisting a finish observed from the cluster, and cleaning up
//! acknowledged finished tasks.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use flotilla_store::JobStore;
use flotilla_types::{Task, TaskId, TaskState};

use crate::action::{ActionFuture, ChangeAction, ModelSnapshot, Reconciler};
use crate::error::{ReconcileError, ReconcileResult};
use crate::event::ModelKind;
use crate::holder::{EntityHolder, RetryPolicy, Retryer, TagValue};
use crate::update::{ModelUpdateAction, UpdateOp};

/// Reason recorded when a launch's store write does not acknowledge.
pub const STORE_TIMEOUT_KILL_REASON: &str = "store update timeout";

/// Payload of a holder in a job engine's trees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobEntity {
    Job { id: String },
    Task(Task),
}

impl JobEntity {
    pub fn as_task(&self) -> Option<&Task> {
        match self {
            JobEntity::Task(task) => Some(task),
            JobEntity::Job { .. } => None,
        }
    }
}

/// Root holder for a fresh job.
pub fn job_root(job_id: impl Into<String>) -> EntityHolder<JobEntity> {
    let id = job_id.into();
    EntityHolder::new(id.clone(), JobEntity::Job { id })
}

fn task_holder(task: Task) -> EntityHolder<JobEntity> {
    EntityHolder::new(task.id.clone(), JobEntity::Task(task))
}

fn reference_task(
    models: &ModelSnapshot<JobEntity>,
    task_id: &str,
) -> ReconcileResult<Task> {
    models
        .reference
        .child(task_id)
        .and_then(|holder| holder.entity().as_task())
        .cloned()
        .ok_or_else(|| {
            ReconcileError::Internal(format!(
                "task {task_id} not found in reference model of {}",
                models.reference.id()
            ))
        })
}

async fn write_with_timeout(
    future: flotilla_store::StoreFuture<()>,
    timeout_ms: u64,
) -> ReconcileResult<()> {
    match tokio::time::timeout(Duration::from_millis(timeout_ms), future).await {
        Ok(result) => result.map_err(ReconcileError::from),
        Err(_) => Err(ReconcileError::StoreTimeout {
            elapsed_ms: timeout_ms,
        }),
    }
}

// ── External change actions ─────────────────────────────────────────

/// Admit a new task into the job: persist it, then add it to Reference
/// and Store in the `Queued` state.
pub struct SubmitTaskAction {
    pub task: Task,
    pub store: Arc<dyn JobStore>,
    pub store_timeout_ms: u64,
}

impl ChangeAction<JobEntity> for SubmitTaskAction {
    fn summary(&self) -> String {
        format!("submit task {}", self.task.id)
    }

    fn compensating_updates(
        &self,
        _models: &ModelSnapshot<JobEntity>,
    ) -> Vec<ModelUpdateAction<JobEntity>> {
        vec![ModelUpdateAction::new(
            ModelKind::Reference,
            UpdateOp::RemoveChild {
                id: self.task.id.clone(),
            },
            format!("revert submit of {}", self.task.id),
        )]
    }

    fn apply(&self, _models: &ModelSnapshot<JobEntity>) -> ActionFuture<JobEntity> {
        let queued = self.task.clone().with_state(TaskState::Queued);
        let store = self.store.clone();
        let timeout_ms = self.store_timeout_ms;
        Box::pin(async move {
            write_with_timeout(store.store_task(&queued), timeout_ms).await?;
            Ok(vec![
                ModelUpdateAction::new(
                    ModelKind::Reference,
                    UpdateOp::AddChild(task_holder(queued.clone())),
                    format!("task {} queued", queued.id),
                ),
                ModelUpdateAction::new(
                    ModelKind::Store,
                    UpdateOp::AddChild(task_holder(queued.clone())),
                    format!("task {} persisted", queued.id),
                ),
            ])
        })
    }
}

/// Record a placement decision: the task moves to `Launched` on the given
/// agent, with the durable write inline. The Store delta is produced only
/// after the store driver acknowledges; on timeout the action fails and
/// the compensating update marks the task for kill.
pub struct LaunchTaskAction {
    pub task_id: TaskId,
    pub agent_host: String,
    pub store: Arc<dyn JobStore>,
    pub store_timeout_ms: u64,
}

impl ChangeAction<JobEntity> for LaunchTaskAction {
    fn summary(&self) -> String {
        format!("launch task {} on {}", self.task_id, self.agent_host)
    }

    fn compensating_updates(
        &self,
        models: &ModelSnapshot<JobEntity>,
    ) -> Vec<ModelUpdateAction<JobEntity>> {
        let Ok(task) = reference_task(models, &self.task_id) else {
            return Vec::new();
        };
        let broken = task
            .with_state(TaskState::KillInitiated)
            .with_context("kill-reason", STORE_TIMEOUT_KILL_REASON);
        vec![
            ModelUpdateAction::new(
                ModelKind::Reference,
                UpdateOp::UpdateEntity {
                    id: self.task_id.clone(),
                    entity: JobEntity::Task(broken),
                },
                format!("task {} marked for kill", self.task_id),
            ),
            ModelUpdateAction::new(
                ModelKind::Reference,
                UpdateOp::SetTag {
                    key: format!("kill:{}", self.task_id),
                    value: TagValue::Text(STORE_TIMEOUT_KILL_REASON.into()),
                },
                format!("kill reason recorded for {}", self.task_id),
            ),
        ]
    }

    fn apply(&self, models: &ModelSnapshot<JobEntity>) -> ActionFuture<JobEntity> {
        let task = match reference_task(models, &self.task_id) {
            Ok(task) => task,
            Err(e) => return Box::pin(async move { Err(e) }),
        };
        let store = self.store.clone();
        let timeout_ms = self.store_timeout_ms;
        let agent_host = self.agent_host.clone();
        Box::pin(async move {
            if !task.state.can_transition_to(TaskState::Launched) {
                return Err(ReconcileError::Internal(format!(
                    "task {} cannot move from {:?} to Launched",
                    task.id, task.state
                )));
            }
            let launched = task
                .with_state(TaskState::Launched)
                .with_context("agent.host", agent_host);
            write_with_timeout(store.store_task(&launched), timeout_ms).await?;
            Ok(vec![
                ModelUpdateAction::new(
                    ModelKind::Reference,
                    UpdateOp::UpdateEntity {
                        id: launched.id.clone(),
                        entity: JobEntity::Task(launched.clone()),
                    },
                    format!("task {} launched", launched.id),
                ),
                ModelUpdateAction::new(
                    ModelKind::Running,
                    UpdateOp::AddChild(task_holder(launched.clone())),
                    format!("task {} launch tracked", launched.id),
                ),
                ModelUpdateAction::new(
                    ModelKind::Store,
                    UpdateOp::AddChild(task_holder(launched.clone())),
                    format!("task {} launch persisted", launched.id),
                ),
            ])
        })
    }
}

// ── Reconciler actions ──────────────────────────────────────────────

/// Copy a reference task the cluster does not know about yet into the
/// Running model (the launch handed to the cluster is now tracked).
struct TrackInRunningAction {
    task: Task,
}

impl ChangeAction<JobEntity> for TrackInRunningAction {
    fn summary(&self) -> String {
        format!("launch task {}", self.task.id)
    }

    fn apply(&self, _models: &ModelSnapshot<JobEntity>) -> ActionFuture<JobEntity> {
        let task = self.task.clone();
        Box::pin(async move {
            Ok(vec![ModelUpdateAction::new(
                ModelKind::Running,
                UpdateOp::AddChild(task_holder(task.clone())),
                format!("task {} tracked in running", task.id),
            )])
        })
    }
}

/// Persist a finish the cluster reported, then reflect it in Store.
pub struct PersistFinishAction {
    pub task: Task,
    pub store: Arc<dyn JobStore>,
    pub store_timeout_ms: u64,
    retry: Retryer,
    now_ms: u64,
}

impl PersistFinishAction {
    pub fn new(
        task: Task,
        store: Arc<dyn JobStore>,
        store_timeout_ms: u64,
        retry: Retryer,
        now_ms: u64,
    ) -> Self {
        Self {
            task,
            store,
            store_timeout_ms,
            retry,
            now_ms,
        }
    }
}

impl ChangeAction<JobEntity> for PersistFinishAction {
    fn summary(&self) -> String {
        format!("persist finish of {}", self.task.id)
    }

    fn compensating_updates(
        &self,
        _models: &ModelSnapshot<JobEntity>,
    ) -> Vec<ModelUpdateAction<JobEntity>> {
        // Pacing for the next attempt lives on the root holder; the engine
        // itself never retries, it just re-diffs.
        vec![ModelUpdateAction::new(
            ModelKind::Reference,
            UpdateOp::SetTag {
                key: retry_tag_key(&self.task.id),
                value: TagValue::Retry(self.retry.record_failure(self.now_ms)),
            },
            format!("retry recorded for {}", self.task.id),
        )]
    }

    fn apply(&self, _models: &ModelSnapshot<JobEntity>) -> ActionFuture<JobEntity> {
        let task = self.task.clone();
        let store = self.store.clone();
        let timeout_ms = self.store_timeout_ms;
        Box::pin(async move {
            write_with_timeout(store.store_task(&task), timeout_ms).await?;
            Ok(vec![
                ModelUpdateAction::new(
                    ModelKind::Store,
                    UpdateOp::AddChild(task_holder(task.clone())),
                    format!("finish of {} persisted", task.id),
                ),
                ModelUpdateAction::new(
                    ModelKind::Reference,
                    UpdateOp::RemoveTag {
                        key: retry_tag_key(&task.id),
                    },
                    format!("retry cleared for {}", task.id),
                ),
            ])
        })
    }
}

/// Remove a finished, store-acknowledged task from every model and from
/// the store driver.
struct CleanupTaskAction {
    task_id: TaskId,
    store: Arc<dyn JobStore>,
    store_timeout_ms: u64,
}

impl ChangeAction<JobEntity> for CleanupTaskAction {
    fn summary(&self) -> String {
        format!("remove finished task {}", self.task_id)
    }

    fn apply(&self, _models: &ModelSnapshot<JobEntity>) -> ActionFuture<JobEntity> {
        let task_id = self.task_id.clone();
        let store = self.store.clone();
        let timeout_ms = self.store_timeout_ms;
        Box::pin(async move {
            write_with_timeout(store.remove_task(&task_id), timeout_ms).await?;
            let removal = |target| {
                ModelUpdateAction::new(
                    target,
                    UpdateOp::RemoveChild {
                        id: task_id.clone(),
                    },
                    format!("task {task_id} removed"),
                )
            };
            Ok(vec![
                removal(ModelKind::Reference),
                removal(ModelKind::Running),
                removal(ModelKind::Store),
            ])
        })
    }
}

fn retry_tag_key(task_id: &str) -> String {
    format!("retry:{task_id}")
}

// ── Difference resolver ─────────────────────────────────────────────

/// Diffs Running against Reference (and Store against Running) and
/// synthesizes the next reconciler action. Items whose retry tag is not
/// yet due are skipped.
pub struct JobReconciler {
    store: Arc<dyn JobStore>,
    store_timeout_ms: u64,
    retry_policy: RetryPolicy,
}

impl JobReconciler {
    pub fn new(store: Arc<dyn JobStore>, store_timeout_ms: u64, retry_policy: RetryPolicy) -> Self {
        Self {
            store,
            store_timeout_ms,
            retry_policy,
        }
    }

    fn retry_for(&self, models: &ModelSnapshot<JobEntity>, task_id: &str) -> Retryer {
        match models.reference.tag(&retry_tag_key(task_id)) {
            Some(TagValue::Retry(retryer)) => retryer.clone(),
            _ => Retryer::new(self.retry_policy.clone()),
        }
    }

    fn retry_due(&self, models: &ModelSnapshot<JobEntity>, task_id: &str, now_ms: u64) -> bool {
        match models.reference.tag(&retry_tag_key(task_id)) {
            Some(TagValue::Retry(retryer)) => retryer.is_due(now_ms),
            _ => true,
        }
    }
}

impl Reconciler<JobEntity> for JobReconciler {
    fn resolve(
        &self,
        models: &ModelSnapshot<JobEntity>,
        now_ms: u64,
    ) -> Vec<Box<dyn ChangeAction<JobEntity>>> {
        let mut actions: Vec<Box<dyn ChangeAction<JobEntity>>> = Vec::new();

        // Running finishes not yet in Store: persist them first.
        for child in models.running.children() {
            let Some(task) = child.entity().as_task() else {
                continue;
            };
            if task.state != TaskState::Finished {
                continue;
            }
            let stored_finished = models
                .store
                .child(&task.id)
                .and_then(|h| h.entity().as_task())
                .is_some_and(|t| t.state == TaskState::Finished);
            if stored_finished {
                // Acknowledged by the store: the task can go away.
                actions.push(Box::new(CleanupTaskAction {
                    task_id: task.id.clone(),
                    store: self.store.clone(),
                    store_timeout_ms: self.store_timeout_ms,
                }));
            } else if self.retry_due(models, &task.id, now_ms) {
                actions.push(Box::new(PersistFinishAction::new(
                    task.clone(),
                    self.store.clone(),
                    self.store_timeout_ms,
                    self.retry_for(models, &task.id),
                    now_ms,
                )));
            } else {
                debug!(task_id = %task.id, "persist retry not due yet");
            }
        }

        // Reference tasks the cluster does not track yet.
        for child in models.reference.children() {
            let Some(task) = child.entity().as_task() else {
                continue;
            };
            if task.state == TaskState::Launched && !models.running.has_child(&task.id) {
                actions.push(Box::new(TrackInRunningAction { task: task.clone() }));
            }
        }

        actions
    }
}
