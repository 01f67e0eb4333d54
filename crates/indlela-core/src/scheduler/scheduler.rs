//! Priority-aware task scheduler with per-queue concurrency caps.
//!
//! Many producers submit; one scheduler owns dispatch. A task stays pending
//! until both the total concurrency limit and its type queue cap admit it.
//! Within a queue, higher priority dispatches first, ties broken FIFO by
//! submission order. Cancellation is cooperative and timeouts arm when a
//! task starts running.

use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::SchedulerLimitsConfig;
use crate::error::{ErrorCode, Result, WireError};
use crate::scheduler::task::{
    Priority, TaskEvent, TaskEventKind, TaskId, TaskOutcome, TaskSpec, TaskStatus, TaskType,
    TaskValue,
};

/// Concurrency limits enforced by the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerLimits {
    pub max_total_concurrent: usize,
    pub per_type: BTreeMap<TaskType, usize>,
}

impl Default for SchedulerLimits {
    fn default() -> Self {
        Self {
            max_total_concurrent: 8,
            per_type: TaskType::all()
                .iter()
                .map(|t| (*t, t.default_cap()))
                .collect(),
        }
    }
}

impl SchedulerLimits {
    pub fn cap(&self, task_type: TaskType) -> usize {
        self.per_type
            .get(&task_type)
            .copied()
            .unwrap_or_else(|| task_type.default_cap())
    }
}

impl From<&SchedulerLimitsConfig> for SchedulerLimits {
    fn from(config: &SchedulerLimitsConfig) -> Self {
        let per_type = [
            (TaskType::Llm, config.llm),
            (TaskType::Ocr, config.ocr),
            (TaskType::Stt, config.stt),
            (TaskType::Tts, config.tts),
            (TaskType::Embedding, config.embedding),
            (TaskType::Download, config.download),
            (TaskType::Verify, config.verify),
        ]
        .into_iter()
        .collect();
        Self {
            max_total_concurrent: config.max_total_concurrent.max(1),
            per_type,
        }
    }
}

/// Read-consistent statistics snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    pub total_submitted: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_cancelled: u64,
    pub total_timeout: u64,
    pub running: usize,
    pub pending: usize,
}

/// Handle returned to the submitter.
#[derive(Debug)]
pub struct TaskTicket {
    pub task_id: TaskId,
    /// Resolves once with the terminal outcome.
    pub completion: oneshot::Receiver<TaskOutcome>,
}

type TaskWork =
    Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<TaskValue>> + Send + 'static>;

struct PendingTask {
    spec: TaskSpec,
    work: TaskWork,
    completion: oneshot::Sender<TaskOutcome>,
}

struct RunningTask {
    task_type: TaskType,
    cancellable: bool,
    cancel: CancellationToken,
    cancel_requested: bool,
}

/// Heap entry: higher priority first, then earlier submission.
#[derive(Debug, Clone, PartialEq, Eq)]
struct QueuedTask {
    priority: Priority,
    seq: u64,
    task_id: TaskId,
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match self.priority.cmp(&other.priority) {
            std::cmp::Ordering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}

struct SchedulerState {
    limits: SchedulerLimits,
    pending: HashMap<TaskId, PendingTask>,
    queues: BTreeMap<TaskType, BinaryHeap<QueuedTask>>,
    running: HashMap<TaskId, RunningTask>,
    statuses: HashMap<TaskId, TaskStatus>,
    running_per_type: BTreeMap<TaskType, usize>,
    total_running: usize,
    stats: SchedulerStats,
    next_seq: u64,
}

/// The scheduler. Cheap to clone; all clones share one dispatch state.
#[derive(Clone)]
pub struct TaskScheduler {
    state: Arc<Mutex<SchedulerState>>,
    events: broadcast::Sender<TaskEvent>,
}

impl TaskScheduler {
    pub fn new(limits: SchedulerLimits) -> Self {
        let (events, _) = broadcast::channel(256);
        let queues = TaskType::all()
            .iter()
            .map(|t| (*t, BinaryHeap::new()))
            .collect();
        Self {
            state: Arc::new(Mutex::new(SchedulerState {
                limits,
                pending: HashMap::new(),
                queues,
                running: HashMap::new(),
                statuses: HashMap::new(),
                running_per_type: BTreeMap::new(),
                total_running: 0,
                stats: SchedulerStats::default(),
                next_seq: 0,
            })),
            events,
        }
    }

    /// Subscribe to the lifecycle event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Current statistics snapshot.
    pub fn stats(&self) -> SchedulerStats {
        let state = self.state.lock().unwrap();
        let mut stats = state.stats;
        stats.running = state.total_running;
        stats.pending = state.pending.len();
        stats
    }

    /// Status of a known task.
    pub fn status(&self, task_id: &str) -> Option<TaskStatus> {
        self.state.lock().unwrap().statuses.get(task_id).copied()
    }

    /// Submit a task. The work closure receives the cancellation token the
    /// scheduler will trip on cancel or timeout.
    pub fn submit<F>(&self, spec: TaskSpec, work: F) -> TaskTicket
    where
        F: FnOnce(CancellationToken) -> BoxFuture<'static, Result<TaskValue>> + Send + 'static,
    {
        let task_id = Uuid::new_v4().to_string();
        let (completion_tx, completion_rx) = oneshot::channel();

        {
            let mut state = self.state.lock().unwrap();
            let seq = state.next_seq;
            state.next_seq += 1;
            state
                .queues
                .get_mut(&spec.task_type)
                .expect("queue exists for every task type")
                .push(QueuedTask {
                    priority: spec.priority,
                    seq,
                    task_id: task_id.clone(),
                });
            state.statuses.insert(task_id.clone(), TaskStatus::Pending);
            state.stats.total_submitted += 1;
            state.pending.insert(
                task_id.clone(),
                PendingTask {
                    spec,
                    work: Box::new(work),
                    completion: completion_tx,
                },
            );
        }

        debug!(task_id = %task_id, "task submitted");
        self.emit(TaskEvent::now(TaskEventKind::Submitted, task_id.clone()));
        self.pump();

        TaskTicket {
            task_id,
            completion: completion_rx,
        }
    }

    /// Request cancellation.
    ///
    /// Pending tasks are cancelled immediately and never run. Running tasks
    /// are signalled and report `cancelled` once the thunk acknowledges.
    /// Returns false for unknown tasks and non-cancellable running tasks.
    pub fn cancel(&self, task_id: &str) -> bool {
        let (event, outcome) = {
            let mut state = self.state.lock().unwrap();

            if let Some(pending) = state.pending.remove(task_id) {
                if let Some(queue) = state.queues.get_mut(&pending.spec.task_type) {
                    queue.retain(|q| q.task_id != task_id);
                }
                state
                    .statuses
                    .insert(task_id.to_string(), TaskStatus::Cancelled);
                state.stats.total_cancelled += 1;
                (
                    Some(TaskEvent::now(
                        TaskEventKind::Cancelled,
                        task_id.to_string(),
                    )),
                    Some((pending.completion, task_id.to_string())),
                )
            } else if let Some(running) = state.running.get_mut(task_id) {
                if !running.cancellable {
                    return false;
                }
                running.cancel_requested = true;
                running.cancel.cancel();
                (None, None)
            } else {
                return false;
            }
        };

        if let Some((completion, task_id)) = outcome {
            let _ = completion.send(TaskOutcome {
                task_id: task_id.clone(),
                status: TaskStatus::Cancelled,
                value: None,
                error: Some(crate::Error::TaskCancelled.to_wire()),
            });
        }
        if let Some(event) = event {
            self.emit(event);
        }
        true
    }

    /// Cancel everything and drop pending work.
    pub fn shutdown(&self) {
        let ids: Vec<TaskId> = {
            let state = self.state.lock().unwrap();
            state
                .pending
                .keys()
                .chain(state.running.keys())
                .cloned()
                .collect()
        };
        for id in ids {
            self.cancel(&id);
        }
    }

    fn emit(&self, event: TaskEvent) {
        let _ = self.events.send(event);
    }

    /// Dispatch every task both limits admit.
    fn pump(&self) {
        loop {
            let dispatch = {
                let mut state = self.state.lock().unwrap();
                if state.total_running >= state.limits.max_total_concurrent {
                    None
                } else {
                    let mut found: Option<TaskId> = None;
                    for task_type in TaskType::all() {
                        let cap = state.limits.cap(*task_type);
                        let used = state
                            .running_per_type
                            .get(task_type)
                            .copied()
                            .unwrap_or(0);
                        if used >= cap {
                            continue;
                        }
                        if let Some(queue) = state.queues.get_mut(task_type) {
                            if let Some(entry) = queue.pop() {
                                found = Some(entry.task_id);
                                break;
                            }
                        }
                    }
                    match found {
                        Some(task_id) => state.pending.remove(&task_id).map(|p| (task_id, p)),
                        None => None,
                    }
                }
            };

            let Some((task_id, pending)) = dispatch else {
                return;
            };
            self.start(task_id, pending);
        }
    }

    fn start(&self, task_id: TaskId, pending: PendingTask) {
        let cancel = CancellationToken::new();
        let timeout = pending.spec.timeout;
        let task_type = pending.spec.task_type;

        {
            let mut state = self.state.lock().unwrap();
            state.running.insert(
                task_id.clone(),
                RunningTask {
                    task_type,
                    cancellable: pending.spec.cancellable,
                    cancel: cancel.clone(),
                    cancel_requested: false,
                },
            );
            state.statuses.insert(task_id.clone(), TaskStatus::Running);
            *state.running_per_type.entry(task_type).or_insert(0) += 1;
            state.total_running += 1;
        }
        self.emit(TaskEvent::now(TaskEventKind::Started, task_id.clone()));
        debug!(task_id = %task_id, ?task_type, "task started");

        let scheduler = self.clone();
        let completion = pending.completion;
        let work = pending.work;
        tokio::spawn(async move {
            let mut fut = (work)(cancel.clone());
            let result = run_with_timeout(&mut fut, timeout).await;
            scheduler.finish(task_id, result, completion);
        });
    }

    fn finish(
        &self,
        task_id: TaskId,
        result: RunResult,
        completion: oneshot::Sender<TaskOutcome>,
    ) {
        let (status, value, error) = {
            let mut state = self.state.lock().unwrap();
            let running = state
                .running
                .remove(&task_id)
                .expect("finishing task was running");
            *state
                .running_per_type
                .get_mut(&running.task_type)
                .expect("running count exists") -= 1;
            state.total_running -= 1;

            let (status, value, error) = match result {
                RunResult::TimedOut(after) => {
                    // Fire the same cooperative signal an explicit cancel would.
                    running.cancel.cancel();
                    (
                        TaskStatus::Timeout,
                        None,
                        Some(crate::Error::TaskTimeout(after).to_wire()),
                    )
                }
                RunResult::Done(Ok(value)) => (TaskStatus::Completed, Some(value), None),
                RunResult::Done(Err(err)) => {
                    let wire = err.to_wire();
                    if wire.code == ErrorCode::TaskCancelled || running.cancel_requested {
                        (TaskStatus::Cancelled, None, Some(wire))
                    } else {
                        (TaskStatus::Failed, None, Some(wire))
                    }
                }
            };

            match status {
                TaskStatus::Completed => state.stats.total_completed += 1,
                TaskStatus::Failed => state.stats.total_failed += 1,
                TaskStatus::Cancelled => state.stats.total_cancelled += 1,
                TaskStatus::Timeout => state.stats.total_timeout += 1,
                _ => unreachable!("terminal status expected"),
            }
            state.statuses.insert(task_id.clone(), status);
            (status, value, error)
        };

        let kind = match status {
            TaskStatus::Completed => TaskEventKind::Completed,
            TaskStatus::Failed => TaskEventKind::Failed,
            TaskStatus::Cancelled => TaskEventKind::Cancelled,
            TaskStatus::Timeout => TaskEventKind::Timeout,
            _ => unreachable!(),
        };
        let mut event = TaskEvent::now(kind, task_id.clone());
        event.error = error.clone();
        if status == TaskStatus::Failed {
            warn!(task_id = %task_id, error = ?error, "task failed");
        }
        self.emit(event);

        let _ = completion.send(TaskOutcome {
            task_id,
            status,
            value,
            error,
        });

        self.pump();
    }
}

enum RunResult {
    Done(Result<TaskValue>),
    TimedOut(Duration),
}

async fn run_with_timeout(
    fut: &mut BoxFuture<'static, Result<TaskValue>>,
    timeout: Option<Duration>,
) -> RunResult {
    match timeout {
        None => RunResult::Done(fut.await),
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => RunResult::Done(result),
            // The unfinished future is dropped with the worker scope.
            Err(_) => RunResult::TimedOut(limit),
        },
    }
}
