use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use trellis_events::{types, Event, EventBus};
use trellis_scheduler::{Schedule, Scheduler, TaskSpec, TaskStatus};

fn collect(bus: &EventBus, pattern: &str) -> mpsc::UnboundedReceiver<Event> {
    let (tx, rx) = mpsc::unbounded_channel();
    bus.subscribe(pattern, move |e| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(e);
        }
    });
    rx
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

fn started_scheduler() -> (Scheduler, EventBus) {
    let bus = EventBus::new();
    let scheduler = Scheduler::new(bus.clone());
    scheduler.start();
    (scheduler, bus)
}

// A 250ms interval task with max_runs = 4 runs exactly four times, ends
// completed, and publishes four completion events with run counts 1..4.
#[tokio::test(start_paused = true)]
async fn interval_task_completes_after_max_runs() {
    let (scheduler, bus) = started_scheduler();
    let mut completed = collect(&bus, types::TASK_COMPLETED);
    let counter = Arc::new(AtomicU64::new(0));

    let counter_in_task = counter.clone();
    let id = scheduler
        .schedule(
            TaskSpec::new(
                "count-up",
                Schedule::interval(Duration::from_millis(250)),
                move |_ctx| {
                    let counter = counter_in_task.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
            )
            .with_max_runs(4),
        )
        .unwrap();

    for expected_run in 1..=4u64 {
        let event = next_event(&mut completed).await;
        assert_eq!(event.payload["task_id"], id.as_str());
        assert_eq!(event.payload["run_count"], expected_run);
    }

    // Give the final completion a moment to settle, then confirm terminal
    // state and that no fifth run sneaks in.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 4);
    let info = scheduler.get(&id).unwrap();
    assert_eq!(info.status, TaskStatus::Completed);
    assert_eq!(info.run_count, 4);
    assert!(completed.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn once_task_fires_once_and_completes() {
    let (scheduler, bus) = started_scheduler();
    let mut completed = collect(&bus, types::TASK_COMPLETED);

    let id = scheduler
        .schedule(TaskSpec::new(
            "one-shot",
            Schedule::once_after(Duration::from_millis(50)),
            |_ctx| async { Ok(()) },
        ))
        .unwrap();

    let event = next_event(&mut completed).await;
    assert_eq!(event.payload["run_count"], 1);
    assert_eq!(scheduler.get(&id).unwrap().status, TaskStatus::Completed);
}

// A handler slower than the interval never runs concurrently with itself;
// the skipped ticks surface as overrun events.
#[tokio::test(start_paused = true)]
async fn slow_handler_drops_ticks_instead_of_overlapping() {
    let (scheduler, bus) = started_scheduler();
    let mut overruns = collect(&bus, types::TASK_OVERRUN);
    let live = Arc::new(AtomicUsize::new(0));
    let max_live = Arc::new(AtomicUsize::new(0));

    let live_in_task = live.clone();
    let max_in_task = max_live.clone();
    scheduler
        .schedule(
            TaskSpec::new(
                "slow",
                Schedule::interval(Duration::from_millis(100)),
                move |_ctx| {
                    let live = live_in_task.clone();
                    let max_live = max_in_task.clone();
                    async move {
                        let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                        max_live.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(250)).await;
                        live.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
            )
            .with_max_runs(3),
        )
        .unwrap();

    let event = next_event(&mut overruns).await;
    assert_eq!(event.event_type, types::TASK_OVERRUN);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(max_live.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn failures_requeue_until_max_failures() {
    let (scheduler, bus) = started_scheduler();
    let mut failed = collect(&bus, types::TASK_FAILED);

    let id = scheduler
        .schedule(
            TaskSpec::new(
                "flaky",
                Schedule::interval(Duration::from_millis(100)),
                |_ctx| async { panic!("boom") },
            )
            .with_max_failures(2),
        )
        .unwrap();

    let first = next_event(&mut failed).await;
    assert_eq!(first.payload["last_error"], "task panicked");
    // After the first failure the task is pending again, not terminal.
    tokio::time::sleep(Duration::from_millis(10)).await;
    let mid = scheduler.get(&id).unwrap();
    assert!(matches!(mid.status, TaskStatus::Pending | TaskStatus::Running));

    next_event(&mut failed).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let info = scheduler.get(&id).unwrap();
    assert_eq!(info.status, TaskStatus::Failed);
    assert_eq!(info.failure_count, 2);
}

#[tokio::test(start_paused = true)]
async fn cancel_prevents_further_runs() {
    let (scheduler, bus) = started_scheduler();
    let mut canceled = collect(&bus, types::TASK_CANCELED);
    let runs = Arc::new(AtomicU64::new(0));

    let runs_in_task = runs.clone();
    let id = scheduler
        .schedule(TaskSpec::new(
            "doomed",
            Schedule::interval(Duration::from_secs(5)),
            move |_ctx| {
                let runs = runs_in_task.clone();
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        ))
        .unwrap();

    scheduler.cancel(&id).unwrap();
    next_event(&mut canceled).await;
    assert_eq!(scheduler.get(&id).unwrap().status, TaskStatus::Canceled);

    tokio::time::sleep(Duration::from_secs(12)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    // Terminal tasks refuse further control operations.
    assert!(scheduler.cancel(&id).is_err());
    assert!(scheduler.pause(&id).is_err());
}

#[tokio::test(start_paused = true)]
async fn pause_parks_and_resume_requeues() {
    let (scheduler, _bus) = started_scheduler();
    let runs = Arc::new(AtomicU64::new(0));

    let runs_in_task = runs.clone();
    let id = scheduler
        .schedule(TaskSpec::new(
            "pausable",
            Schedule::interval(Duration::from_millis(200)),
            move |_ctx| {
                let runs = runs_in_task.clone();
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        ))
        .unwrap();

    scheduler.pause(&id).unwrap();
    assert_eq!(scheduler.get(&id).unwrap().status, TaskStatus::Paused);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    scheduler.resume(&id).unwrap();
    tokio::time::sleep(Duration::from_millis(450)).await;
    assert!(runs.load(Ordering::SeqCst) >= 1);
}

#[tokio::test(start_paused = true)]
async fn per_task_timeout_fails_slow_runs() {
    let (scheduler, bus) = started_scheduler();
    let mut failed = collect(&bus, types::TASK_FAILED);

    scheduler
        .schedule(
            TaskSpec::new(
                "sluggish",
                Schedule::once_after(Duration::from_millis(10)),
                |_ctx| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                },
            )
            .with_timeout(Duration::from_millis(100)),
        )
        .unwrap();

    let event = next_event(&mut failed).await;
    assert_eq!(event.payload["last_error"], "task timed out");
}

#[tokio::test(start_paused = true)]
async fn shutdown_drains_in_flight_work() {
    let (scheduler, bus) = started_scheduler();
    let mut started = collect(&bus, types::TASK_STARTED);
    let finished = Arc::new(AtomicU64::new(0));

    let finished_in_task = finished.clone();
    scheduler
        .schedule(TaskSpec::new(
            "drainable",
            Schedule::once_after(Duration::from_millis(10)),
            move |_ctx| {
                let finished = finished_in_task.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        ))
        .unwrap();

    next_event(&mut started).await;
    assert!(scheduler.shutdown(Duration::from_secs(5)).await);
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    // A stopped scheduler refuses new work.
    assert!(scheduler
        .schedule(TaskSpec::new(
            "late",
            Schedule::once_after(Duration::ZERO),
            |_ctx| async { Ok(()) },
        ))
        .is_err());
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_when_drain_lapses() {
    let (scheduler, bus) = started_scheduler();
    let mut started = collect(&bus, types::TASK_STARTED);

    scheduler
        .schedule(TaskSpec::new(
            "stuck",
            Schedule::once_after(Duration::from_millis(10)),
            |ctx| async move {
                ctx.cancel.cancelled().await;
                Err(trellis_core::Error::canceled("aborted"))
            },
        ))
        .unwrap();

    next_event(&mut started).await;
    assert!(!scheduler.shutdown(Duration::from_millis(50)).await);
}

#[tokio::test(start_paused = true)]
async fn list_reports_schedule_descriptions() {
    let (scheduler, _bus) = started_scheduler();
    scheduler
        .schedule(TaskSpec::new(
            "a",
            Schedule::interval(Duration::from_secs(30)),
            |_ctx| async { Ok(()) },
        ))
        .unwrap();
    scheduler
        .schedule(TaskSpec::new(
            "b",
            Schedule::cron("*/5 * * * *").unwrap(),
            |_ctx| async { Ok(()) },
        ))
        .unwrap();

    let tasks = scheduler.list();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].schedule, "every 30000ms");
    assert_eq!(tasks[1].schedule, "cron: */5 * * * *");
}
