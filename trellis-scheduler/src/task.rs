//! Task model: schedules, specs, and the public task view.

use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use trellis_core::config::parse_duration;
use trellis_core::Error;

/// When a task fires.
#[derive(Clone)]
pub enum Schedule {
    /// Standard cron expression (5 or 6 fields).
    Cron { expr: String, parsed: Box<cron::Schedule> },
    /// Start-to-start fixed interval.
    Interval(Duration),
    /// Fires once after the delay, then completes.
    Once(Duration),
}

impl std::fmt::Debug for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Schedule::Cron { expr, .. } => write!(f, "Cron({expr})"),
            Schedule::Interval(d) => write!(f, "Interval({d:?})"),
            Schedule::Once(d) => write!(f, "Once({d:?})"),
        }
    }
}

impl Schedule {
    /// Parse a cron expression. Accepts the 5-field form (minutes first),
    /// the 6-field form (seconds first), and `@every <duration>` which
    /// degrades to a fixed interval.
    pub fn cron(expr: &str) -> Result<Self, Error> {
        let expr = expr.trim();
        if let Some(rest) = expr.strip_prefix("@every ") {
            let interval = parse_duration(rest)
                .ok_or_else(|| Error::invalid_argument(format!("bad @every duration: {rest}")))?;
            return Ok(Schedule::Interval(interval));
        }
        let normalized = match expr.split_whitespace().count() {
            5 => format!("0 {expr}"),
            6 | 7 => expr.to_string(),
            n => {
                return Err(Error::invalid_argument(format!(
                    "cron expression has {n} fields, expected 5 or 6: {expr}"
                )))
            }
        };
        let parsed = cron::Schedule::from_str(&normalized)
            .map_err(|e| Error::invalid_argument(format!("bad cron expression '{expr}': {e}")))?;
        Ok(Schedule::Cron {
            expr: expr.to_string(),
            parsed: Box::new(parsed),
        })
    }

    pub fn interval(every: Duration) -> Self {
        Schedule::Interval(every)
    }

    pub fn once_after(delay: Duration) -> Self {
        Schedule::Once(delay)
    }

    /// Delay from now until the first firing.
    pub fn initial_delay(&self) -> Duration {
        match self {
            Schedule::Cron { parsed, .. } => next_cron_delay(parsed),
            Schedule::Interval(every) => *every,
            Schedule::Once(delay) => *delay,
        }
    }

    /// Delay from now until the firing after the current one, or `None`
    /// when the schedule is exhausted.
    pub fn next_delay(&self) -> Option<Duration> {
        match self {
            Schedule::Cron { parsed, .. } => Some(next_cron_delay(parsed)),
            Schedule::Interval(every) => Some(*every),
            Schedule::Once(_) => None,
        }
    }

    /// Human-readable form for task listings.
    pub fn describe(&self) -> String {
        match self {
            Schedule::Cron { expr, .. } => format!("cron: {expr}"),
            Schedule::Interval(every) => format!("every {}ms", every.as_millis()),
            Schedule::Once(delay) => format!("once after {}ms", delay.as_millis()),
        }
    }
}

fn next_cron_delay(parsed: &cron::Schedule) -> Duration {
    let now = Utc::now();
    match parsed.after(&now).next() {
        Some(at) => (at - now).to_std().unwrap_or(Duration::ZERO),
        // A finished schedule (e.g. a fixed past date) never fires again;
        // park it far in the future and let max_runs/cancel clean up.
        None => Duration::from_secs(u32::MAX as u64),
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
    Paused,
}

/// Context handed to every task execution: a fresh cancellation scope and
/// the run ordinal.
#[derive(Clone)]
pub struct TaskContext {
    pub task_id: String,
    pub run: u64,
    pub cancel: CancellationToken,
}

pub(crate) type TaskHandler = Arc<
    dyn Fn(TaskContext) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send>> + Send + Sync,
>;

/// Definition of a task to schedule.
#[derive(Clone)]
pub struct TaskSpec {
    pub name: String,
    pub schedule: Schedule,
    pub(crate) handler: TaskHandler,
    /// Complete the task after this many successful runs.
    pub max_runs: Option<u64>,
    /// Fail the task terminally after this many failures.
    pub max_failures: Option<u64>,
    /// Per-execution timeout; falls back to the scheduler default.
    pub timeout: Option<Duration>,
}

impl TaskSpec {
    pub fn new<F, Fut>(name: impl Into<String>, schedule: Schedule, handler: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        Self {
            name: name.into(),
            schedule,
            handler: Arc::new(move |ctx| Box::pin(handler(ctx))),
            max_runs: None,
            max_failures: None,
            timeout: None,
        }
    }

    pub fn with_max_runs(mut self, max_runs: u64) -> Self {
        self.max_runs = Some(max_runs);
        self
    }

    pub fn with_max_failures(mut self, max_failures: u64) -> Self {
        self.max_failures = Some(max_failures);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Public snapshot of one task.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskInfo {
    pub id: String,
    pub name: String,
    pub schedule: String,
    pub status: TaskStatus,
    pub run_count: u64,
    pub failure_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_runs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
