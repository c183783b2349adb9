use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;

use crate::api::{RemoteBackend, TaskStatus};
use crate::error::{PipelineError, Result};
use crate::materialize::materialize;
use crate::status::{Phase, StatusStore, WorkItem, WorkStatus};
use crate::{logi, logok, logw};

/// One planned unit of work for a phase run: what to submit and where the
/// artifact belongs once the task completes.
#[derive(Debug, Clone)]
pub struct WorkPlan {
    pub key: String,
    pub phase: Phase,
    pub request: serde_json::Value,
    pub output_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub poll_interval: Duration,
    pub max_wait: Duration,
    pub concurrency: usize,
    pub force: bool,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PhaseSummary {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Failed keys with their causes, for operator triage.
    pub failures: Vec<(String, String)>,
}

enum ItemOutcome {
    Completed,
    Failed(String),
    /// The store itself failed; continuing would risk losing records.
    Fatal(PipelineError),
}

/// Run one phase over the planned items: skip completed ones, submit or
/// resume the rest under bounded concurrency, poll to a terminal state,
/// materialize artifacts, and record every transition in the store.
pub async fn run_phase(
    backend: Arc<dyn RemoteBackend>,
    store: Arc<Mutex<StatusStore>>,
    plans: Vec<WorkPlan>,
    opts: DriverOptions,
) -> Result<PhaseSummary> {
    let mut summary = PhaseSummary::default();

    let mut to_run: Vec<WorkPlan> = Vec::new();
    {
        let guard = store.lock().await;
        for plan in plans {
            if !opts.force && guard.get(&plan.key).is_some_and(WorkItem::is_completed) {
                logi(format!("Skipping {} (already completed)", plan.key));
                summary.skipped += 1;
                continue;
            }
            to_run.push(plan);
        }
    }

    if to_run.is_empty() {
        return Ok(summary);
    }

    let semaphore = Arc::new(Semaphore::new(opts.concurrency.max(1)));
    let mut tasks: JoinSet<(String, ItemOutcome)> = JoinSet::new();
    // Task id -> plan identity, so a panicked worker can still be tied back
    // to its item.
    let mut spawned: HashMap<tokio::task::Id, (String, Phase)> = HashMap::new();

    for plan in to_run {
        // Acquiring before spawning keeps submissions in enumeration order.
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };
        let backend = Arc::clone(&backend);
        let task_store = Arc::clone(&store);
        let opts = opts.clone();
        let identity = (plan.key.clone(), plan.phase);
        let handle = tasks.spawn(async move {
            let key = plan.key.clone();
            let outcome = run_item(backend, task_store, plan, &opts).await;
            drop(permit);
            (key, outcome)
        });
        spawned.insert(handle.id(), identity);
    }

    while let Some(joined) = tasks.join_next().await {
        let (key, outcome) = match joined {
            Ok(pair) => pair,
            Err(err) => {
                let (key, phase) = spawned
                    .get(&err.id())
                    .cloned()
                    .unwrap_or_else(|| ("unknown".to_string(), Phase::Shots));
                let cause = format!("worker task panicked: {err}");
                logw(format!("{key}: {cause}"));
                let mut guard = store.lock().await;
                let mut item = guard.get(&key).cloned().unwrap_or_else(|| {
                    WorkItem::new(key.clone(), phase, serde_json::Value::Null)
                });
                item.status = WorkStatus::Failed;
                item.error = Some(cause.clone());
                if let Err(err) = guard.upsert(item) {
                    tasks.abort_all();
                    return Err(err);
                }
                drop(guard);
                summary.failed += 1;
                summary.failures.push((key, cause));
                continue;
            }
        };
        match outcome {
            ItemOutcome::Completed => summary.completed += 1,
            ItemOutcome::Failed(cause) => {
                summary.failed += 1;
                summary.failures.push((key, cause));
            }
            ItemOutcome::Fatal(err) => {
                tasks.abort_all();
                return Err(err);
            }
        }
    }

    Ok(summary)
}

async fn run_item(
    backend: Arc<dyn RemoteBackend>,
    store: Arc<Mutex<StatusStore>>,
    plan: WorkPlan,
    opts: &DriverOptions,
) -> ItemOutcome {
    // Pick up the persisted record, or start fresh. A forced run resets the
    // item to pending; otherwise a retained task id from an interrupted run
    // is kept as a resume hint.
    let mut item = {
        let guard = store.lock().await;
        match guard.get(&plan.key) {
            Some(existing) if !opts.force => existing.clone(),
            _ => WorkItem::new(plan.key.clone(), plan.phase, plan.request.clone()),
        }
    };
    if opts.force {
        item.status = WorkStatus::Pending;
        item.task_id = None;
        item.error = None;
    }
    item.request = plan.request.clone();

    // Resume: if a prior run got as far as submitting, poll the recorded
    // task id instead of creating a duplicate remote task. Only an id that
    // turns out stale falls back to a fresh submission.
    let mut resumed = false;
    if item.status == WorkStatus::Submitted {
        if let Some(task_id) = item.task_id.clone() {
            match backend.poll(&task_id).await {
                Ok(_) => {
                    logi(format!("{}: resuming task {task_id}", plan.key));
                    resumed = true;
                }
                Err(err) => {
                    logw(format!(
                        "{}: recorded task {task_id} unusable ({err}); resubmitting",
                        plan.key
                    ));
                    item.task_id = None;
                }
            }
        }
    }

    if !resumed {
        item.attempts += 1;
        match backend.submit(&plan.request).await {
            Ok(task_id) => {
                logi(format!("{}: submitted -> {task_id}", plan.key));
                item.task_id = Some(task_id);
                item.status = WorkStatus::Submitted;
                item.error = None;
                // Persisted before the first poll so a crash from here on
                // resumes by polling, not by resubmitting.
                if let Err(err) = upsert(&store, item.clone()).await {
                    return ItemOutcome::Fatal(err);
                }
            }
            Err(err) => {
                return fail(&store, item, format!("submit failed: {err}")).await;
            }
        }
    }

    let task_id = match item.task_id.clone() {
        Some(id) => id,
        None => return fail(&store, item, "no task id after submission".to_string()).await,
    };

    let status = match poll_until_done(backend.as_ref(), &task_id, opts).await {
        Ok(status) => status,
        Err(err) => return fail(&store, item, err.to_string()).await,
    };

    if !status.is_success() {
        let cause = status
            .error
            .unwrap_or_else(|| "remote task failed without error message".to_string());
        return fail(&store, item, cause).await;
    }

    let Some(result_url) = status.result_url else {
        return fail(
            &store,
            item,
            "remote task completed without a result URL".to_string(),
        )
        .await;
    };

    match materialize(backend.as_ref(), &result_url, &plan.output_path).await {
        Ok(written) => {
            item.status = WorkStatus::Completed;
            item.record_url(&result_url);
            item.output_path = Some(written.clone());
            item.error = None;
            logok(format!("{}: completed -> {}", plan.key, written.display()));
            match upsert(&store, item).await {
                Ok(()) => ItemOutcome::Completed,
                Err(err) => ItemOutcome::Fatal(err),
            }
        }
        Err(err) => fail(&store, item, err.to_string()).await,
    }
}

/// Poll with a fixed delay until the task is terminal or the wall-clock
/// budget is spent.
async fn poll_until_done(
    backend: &dyn RemoteBackend,
    task_id: &str,
    opts: &DriverOptions,
) -> Result<TaskStatus> {
    let mut waited = Duration::ZERO;
    loop {
        let status = backend.poll(task_id).await?;
        if status.is_done() {
            return Ok(status);
        }
        if waited >= opts.max_wait {
            return Err(PipelineError::Timeout {
                task_id: task_id.to_string(),
                waited_secs: waited.as_secs(),
                last_status: status.state.as_str().to_string(),
            });
        }
        tokio::time::sleep(opts.poll_interval).await;
        waited += opts.poll_interval;
    }
}

async fn upsert(store: &Mutex<StatusStore>, item: WorkItem) -> Result<()> {
    store.lock().await.upsert(item)
}

async fn fail(store: &Mutex<StatusStore>, mut item: WorkItem, cause: String) -> ItemOutcome {
    logw(format!("{}: {cause}", item.key));
    item.status = WorkStatus::Failed;
    item.error = Some(cause.clone());
    match upsert(store, item).await {
        Ok(()) => ItemOutcome::Failed(cause),
        Err(err) => ItemOutcome::Fatal(err),
    }
}
