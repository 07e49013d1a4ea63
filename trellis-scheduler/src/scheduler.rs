//! The dispatcher: a single task draining a min-heap of firing times.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use trellis_events::{types, Event, EventBus};
use trellis_core::Error;

use crate::task::{Schedule, TaskContext, TaskInfo, TaskSpec, TaskStatus};

/// Min-heap key: firing time, ties broken by task id.
#[derive(Debug, Clone, PartialEq, Eq)]
struct HeapEntry {
    at: Instant,
    id: String,
    epoch: u64,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so the BinaryHeap max-heap behaves as a min-heap.
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct TaskRecord {
    spec: TaskSpec,
    status: TaskStatus,
    run_count: u64,
    failure_count: u64,
    /// Bumped whenever queued heap entries must be invalidated.
    epoch: u64,
    in_flight: bool,
    next_run_at: Option<Instant>,
    next_run_wall: Option<DateTime<Utc>>,
    last_run_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TaskRecord {
    fn info(&self, id: &str) -> TaskInfo {
        TaskInfo {
            id: id.to_string(),
            name: self.spec.name.clone(),
            schedule: self.spec.schedule.describe(),
            status: self.status,
            run_count: self.run_count,
            failure_count: self.failure_count,
            max_runs: self.spec.max_runs,
            next_run_at: self.next_run_wall,
            last_run_at: self.last_run_at,
            created_at: self.created_at,
        }
    }
}

struct SchedulerInner {
    tasks: Mutex<HashMap<String, TaskRecord>>,
    heap: Mutex<BinaryHeap<HeapEntry>>,
    notify: Notify,
    bus: EventBus,
    /// Stops the dispatcher; queued firings cease immediately.
    dispatch_cancel: CancellationToken,
    /// Cancels in-flight handlers; fired only when the drain deadline lapses.
    work_cancel: CancellationToken,
    default_timeout: Option<Duration>,
    in_flight: AtomicUsize,
}

/// Cron/interval/once task engine. One dispatcher task sleeps until the
/// heap head and launches due handlers on the runtime; at most one
/// execution of a task is live at a time.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(bus: EventBus) -> Self {
        Self::with_default_timeout(bus, None)
    }

    pub fn with_default_timeout(bus: EventBus, default_timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                tasks: Mutex::new(HashMap::new()),
                heap: Mutex::new(BinaryHeap::new()),
                notify: Notify::new(),
                bus,
                dispatch_cancel: CancellationToken::new(),
                work_cancel: CancellationToken::new(),
                default_timeout,
                in_flight: AtomicUsize::new(0),
            }),
        }
    }

    /// Spawn the dispatcher loop.
    pub fn start(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                let head = {
                    let heap = inner.heap.lock().expect("scheduler heap lock poisoned");
                    heap.peek().cloned()
                };
                match head {
                    None => {
                        tokio::select! {
                            _ = inner.dispatch_cancel.cancelled() => break,
                            _ = inner.notify.notified() => {}
                        }
                    }
                    Some(entry) => {
                        tokio::select! {
                            _ = inner.dispatch_cancel.cancelled() => break,
                            // A schedule/cancel may have changed the head.
                            _ = inner.notify.notified() => {}
                            _ = tokio::time::sleep_until(entry.at) => {
                                Self::fire_due(&inner);
                            }
                        }
                    }
                }
            }
        });
    }

    /// Register and enqueue a task, returning its id.
    pub fn schedule(&self, spec: TaskSpec) -> Result<String, Error> {
        if self.inner.dispatch_cancel.is_cancelled() {
            return Err(Error::unavailable("scheduler is stopped"));
        }
        let id = uuid::Uuid::new_v4().to_string();
        let delay = spec.schedule.initial_delay();
        let at = Instant::now() + delay;
        let wall = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();

        {
            let mut tasks = self.inner.tasks.lock().expect("scheduler task lock poisoned");
            tasks.insert(
                id.clone(),
                TaskRecord {
                    spec,
                    status: TaskStatus::Pending,
                    run_count: 0,
                    failure_count: 0,
                    epoch: 0,
                    in_flight: false,
                    next_run_at: Some(at),
                    next_run_wall: Some(wall),
                    last_run_at: None,
                    created_at: Utc::now(),
                },
            );
        }
        self.push_entry(HeapEntry {
            at,
            id: id.clone(),
            epoch: 0,
        });
        self.publish(types::TASK_SCHEDULED, &id, 0, None);
        Ok(id)
    }

    pub fn cancel(&self, id: &str) -> Result<(), Error> {
        let run_count = {
            let mut tasks = self.inner.tasks.lock().expect("scheduler task lock poisoned");
            let record = tasks
                .get_mut(id)
                .ok_or_else(|| Error::not_found(format!("no task '{id}'")))?;
            if matches!(
                record.status,
                TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Canceled
            ) {
                return Err(Error::conflict(format!(
                    "task '{id}' already terminal"
                )));
            }
            record.status = TaskStatus::Canceled;
            record.epoch += 1;
            record.next_run_at = None;
            record.next_run_wall = None;
            record.run_count
        };
        self.inner.notify.notify_one();
        self.publish(types::TASK_CANCELED, id, run_count, None);
        Ok(())
    }

    pub fn pause(&self, id: &str) -> Result<(), Error> {
        {
            let mut tasks = self.inner.tasks.lock().expect("scheduler task lock poisoned");
            let record = tasks
                .get_mut(id)
                .ok_or_else(|| Error::not_found(format!("no task '{id}'")))?;
            if record.status != TaskStatus::Pending {
                return Err(Error::conflict(format!(
                    "task '{id}' is not pending"
                )));
            }
            record.status = TaskStatus::Paused;
            record.epoch += 1;
            record.next_run_at = None;
            record.next_run_wall = None;
        }
        self.inner.notify.notify_one();
        self.publish("scheduler.task.paused", id, 0, None);
        Ok(())
    }

    pub fn resume(&self, id: &str) -> Result<(), Error> {
        let entry = {
            let mut tasks = self.inner.tasks.lock().expect("scheduler task lock poisoned");
            let record = tasks
                .get_mut(id)
                .ok_or_else(|| Error::not_found(format!("no task '{id}'")))?;
            if record.status != TaskStatus::Paused {
                return Err(Error::conflict(format!("task '{id}' is not paused")));
            }
            record.status = TaskStatus::Pending;
            let delay = record.spec.schedule.initial_delay();
            let at = Instant::now() + delay;
            record.next_run_at = Some(at);
            record.next_run_wall =
                Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
            HeapEntry {
                at,
                id: id.to_string(),
                epoch: record.epoch,
            }
        };
        self.push_entry(entry);
        self.publish("scheduler.task.resumed", id, 0, None);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<TaskInfo> {
        let tasks = self.inner.tasks.lock().expect("scheduler task lock poisoned");
        tasks.get(id).map(|r| r.info(id))
    }

    pub fn list(&self) -> Vec<TaskInfo> {
        let tasks = self.inner.tasks.lock().expect("scheduler task lock poisoned");
        let mut out: Vec<TaskInfo> = tasks.iter().map(|(id, r)| r.info(id)).collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    /// Stop dispatching and wait for in-flight handlers up to `drain`.
    /// Returns `false` when handlers had to be cancelled.
    pub async fn shutdown(&self, drain: Duration) -> bool {
        self.inner.dispatch_cancel.cancel();
        let deadline = Instant::now() + drain;
        while self.inner.in_flight.load(Ordering::Acquire) > 0 {
            if Instant::now() >= deadline {
                tracing::warn!("scheduler drain deadline exceeded, cancelling tasks");
                self.inner.work_cancel.cancel();
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    fn push_entry(&self, entry: HeapEntry) {
        {
            let mut heap = self.inner.heap.lock().expect("scheduler heap lock poisoned");
            heap.push(entry);
        }
        self.inner.notify.notify_one();
    }

    fn publish(&self, event_type: &str, task_id: &str, run_count: u64, error: Option<&str>) {
        Self::publish_on(&self.inner.bus, event_type, task_id, run_count, error);
    }

    fn publish_on(
        bus: &EventBus,
        event_type: &str,
        task_id: &str,
        run_count: u64,
        error: Option<&str>,
    ) {
        let mut payload = serde_json::json!({
            "task_id": task_id,
            "run_count": run_count,
        });
        if let Some(error) = error {
            payload["last_error"] = serde_json::Value::String(error.to_string());
        }
        bus.publish(Event::new(event_type, "scheduler").with_payload(payload));
    }

    /// Pop and launch every due entry.
    fn fire_due(inner: &Arc<SchedulerInner>) {
        loop {
            let entry = {
                let mut heap = inner.heap.lock().expect("scheduler heap lock poisoned");
                let due = heap
                    .peek()
                    .is_some_and(|head| head.at <= Instant::now());
                if due {
                    heap.pop()
                } else {
                    None
                }
            };
            let Some(entry) = entry else { break };
            Self::fire_one(inner, entry);
        }
    }

    fn fire_one(inner: &Arc<SchedulerInner>, entry: HeapEntry) {
        let now = Instant::now();
        enum Fired {
            Overrun { requeue: Option<HeapEntry>, run_count: u64 },
            Launch {
                handler: crate::task::TaskHandler,
                ctx: TaskContext,
                timeout: Option<Duration>,
                run_ordinal: u64,
                requeue: Option<HeapEntry>,
            },
        }

        let fired = {
            let mut tasks = inner.tasks.lock().expect("scheduler task lock poisoned");
            let Some(record) = tasks.get_mut(&entry.id) else {
                return;
            };
            // Stale entries (canceled, paused, rescheduled) fall out here.
            // A Running record is not stale: that is the overrun case.
            if record.epoch != entry.epoch
                || !matches!(record.status, TaskStatus::Pending | TaskStatus::Running)
            {
                return;
            }

            // Next occurrence is fixed at fire time: start-to-start, with
            // late wakes collapsed to a single firing rescheduled from now.
            let next = match &record.spec.schedule {
                Schedule::Once(_) => None,
                Schedule::Interval(every) => {
                    let ideal = entry.at + *every;
                    Some(if ideal <= now { now + *every } else { ideal })
                }
                Schedule::Cron { .. } => record.spec.schedule.next_delay().map(|d| now + d),
            };
            match next {
                Some(at) => {
                    record.next_run_at = Some(at);
                    record.next_run_wall = Some(
                        Utc::now()
                            + chrono::Duration::from_std(at.saturating_duration_since(now))
                                .unwrap_or_default(),
                    );
                }
                None => {
                    record.next_run_at = None;
                    record.next_run_wall = None;
                }
            }
            let requeue = next.map(|at| HeapEntry {
                at,
                id: entry.id.clone(),
                epoch: record.epoch,
            });

            if record.in_flight {
                // Previous execution still live: drop this tick.
                Fired::Overrun {
                    requeue,
                    run_count: record.run_count,
                }
            } else {
                record.status = TaskStatus::Running;
                record.in_flight = true;
                record.last_run_at = Some(Utc::now());
                Fired::Launch {
                    handler: record.spec.handler.clone(),
                    ctx: TaskContext {
                        task_id: entry.id.clone(),
                        run: record.run_count + 1,
                        cancel: inner.work_cancel.child_token(),
                    },
                    timeout: record.spec.timeout.or(inner.default_timeout),
                    run_ordinal: record.run_count,
                    requeue,
                }
            }
        };

        let (handler, ctx, timeout, run_ordinal) = match fired {
            Fired::Overrun { requeue, run_count } => {
                Self::publish_on(&inner.bus, types::TASK_OVERRUN, &entry.id, run_count, None);
                if let Some(requeue) = requeue {
                    let mut heap = inner.heap.lock().expect("scheduler heap lock poisoned");
                    heap.push(requeue);
                }
                return;
            }
            Fired::Launch {
                handler,
                ctx,
                timeout,
                run_ordinal,
                requeue,
            } => {
                if let Some(requeue) = requeue {
                    let mut heap = inner.heap.lock().expect("scheduler heap lock poisoned");
                    heap.push(requeue);
                }
                (handler, ctx, timeout, run_ordinal)
            }
        };

        Self::publish_on(&inner.bus, types::TASK_STARTED, &entry.id, run_ordinal, None);

        let inner = inner.clone();
        let id = entry.id;
        inner.in_flight.fetch_add(1, Ordering::AcqRel);
        let inner_for_task = inner.clone();
        tokio::spawn(async move {
            let work = AssertUnwindSafe(handler(ctx)).catch_unwind();
            let outcome: Result<(), String> = match timeout {
                Some(t) => match tokio::time::timeout(t, work).await {
                    Err(_) => Err("task timed out".to_string()),
                    Ok(Err(_)) => Err("task panicked".to_string()),
                    Ok(Ok(Err(e))) => Err(e.to_string()),
                    Ok(Ok(Ok(()))) => Ok(()),
                },
                None => match work.await {
                    Err(_) => Err("task panicked".to_string()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Ok(Ok(())) => Ok(()),
                },
            };
            Self::finish(&inner_for_task, &id, outcome);
            inner_for_task.in_flight.fetch_sub(1, Ordering::AcqRel);
        });
    }

    fn finish(inner: &Arc<SchedulerInner>, id: &str, outcome: Result<(), String>) {
        let mut tasks = inner.tasks.lock().expect("scheduler task lock poisoned");
        let Some(record) = tasks.get_mut(id) else { return };
        record.in_flight = false;
        if record.status == TaskStatus::Canceled {
            return;
        }

        match outcome {
            Ok(()) => {
                record.run_count += 1;
                let run_count = record.run_count;
                let done = matches!(record.spec.schedule, Schedule::Once(_))
                    || record.spec.max_runs.is_some_and(|max| run_count >= max);
                if done {
                    record.status = TaskStatus::Completed;
                    record.epoch += 1;
                    record.next_run_at = None;
                    record.next_run_wall = None;
                } else {
                    record.status = TaskStatus::Pending;
                }
                drop(tasks);
                Self::publish_on(&inner.bus, types::TASK_COMPLETED, id, run_count, None);
            }
            Err(error) => {
                record.failure_count += 1;
                let run_count = record.run_count;
                let terminal = matches!(record.spec.schedule, Schedule::Once(_))
                    || record
                        .spec
                        .max_failures
                        .is_some_and(|max| record.failure_count >= max);
                if terminal {
                    record.status = TaskStatus::Failed;
                    record.epoch += 1;
                    record.next_run_at = None;
                    record.next_run_wall = None;
                } else {
                    // Failure is not terminal: the task stays scheduled.
                    record.status = TaskStatus::Pending;
                }
                drop(tasks);
                tracing::warn!(task_id = id, error = %error, "scheduled task failed");
                Self::publish_on(&inner.bus, types::TASK_FAILED, id, run_count, Some(&error));
            }
        }
        inner.notify.notify_one();
    }
}
