// End-to-end scenarios: full engine ticks against real store backends,
// covering overlap protection, single-server arbitration, crash recovery
// through TTL expiry, and fleet coordination over a shared directory.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use common::clock::ManualClock;
use common::errors::TaskError;
use common::executor::CommandTask;
use common::lock::mutex_name;
use common::scheduler::{SchedulerConfig, SchedulerEngine, TaskOutcome, TaskRegistry};
use common::store::{FileStore, KeyValueStore, MemoryStore};
use common::task::{ScheduledTask, Task};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Task that records each execution and holds the tick for `hold`.
struct SleepingTask {
    name: String,
    runs: Arc<AtomicUsize>,
    hold: Duration,
}

#[async_trait]
impl Task for SleepingTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self) -> Result<(), TaskError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if !self.hold.is_zero() {
            tokio::time::sleep(self.hold).await;
        }
        Ok(())
    }
}

fn sleeping_factory(
    name: &'static str,
    runs: Arc<AtomicUsize>,
    hold: Duration,
    without_overlapping_minutes: Option<u64>,
    on_one_server: bool,
) -> impl Fn(Arc<dyn KeyValueStore>) -> Result<ScheduledTask, common::errors::ScheduleError>
       + Send
       + Sync
       + 'static {
    move |store| {
        let task = SleepingTask {
            name: name.to_string(),
            runs: runs.clone(),
            hold,
        };
        let mut builder = ScheduledTask::builder(Box::new(task)).timezone(chrono_tz::UTC);
        if let Some(minutes) = without_overlapping_minutes {
            builder = builder.without_overlapping_for(minutes);
        }
        if on_one_server {
            builder = builder.on_one_server();
        }
        builder.build(store)
    }
}

fn at_minute(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 15, hour, minute, 0).unwrap()
}

fn pinned_engine(
    clock: Arc<ManualClock>,
    store: Arc<dyn KeyValueStore>,
    registry: TaskRegistry,
) -> SchedulerEngine {
    SchedulerEngine::with_clock(SchedulerConfig::default(), store, registry, clock)
}

/// An overlap-protected task with a slow body: a second tick landing while
/// the first run is in flight must skip, and a tick after completion must
/// run again.
#[tokio::test]
async fn test_overlapping_tick_skips_while_run_is_in_flight() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let runs = Arc::new(AtomicUsize::new(0));

    let build_engine = |runs: Arc<AtomicUsize>| {
        let mut registry = TaskRegistry::new();
        registry.register(sleeping_factory(
            "slow-report",
            runs,
            Duration::from_millis(400),
            Some(5),
            false,
        ));
        // Default expression, so the task is due on every tick regardless
        // of when this test runs.
        SchedulerEngine::new(SchedulerConfig::default(), store.clone(), registry)
    };

    let first_engine = Arc::new(build_engine(runs.clone()));
    let second_engine = build_engine(runs.clone());

    let first = {
        let engine = first_engine.clone();
        tokio::spawn(async move { engine.tick().await })
    };
    // Let the first tick claim the mutex and start sleeping.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second_reports = second_engine.tick().await;
    assert!(matches!(
        second_reports[0].outcome,
        TaskOutcome::SkippedOverlapping
    ));

    let first_reports = first.await.unwrap();
    assert!(matches!(first_reports[0].outcome, TaskOutcome::Completed));
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // The mutex was released on completion, so a later tick runs again.
    let third_reports = second_engine.tick().await;
    assert!(matches!(third_reports[0].outcome, TaskOutcome::Completed));
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

/// Two engines sharing one store tick at the same minute; a single-server
/// task runs on exactly one of them and the loser names the right reason.
#[tokio::test]
async fn test_single_server_task_runs_on_exactly_one_engine() {
    let clock = Arc::new(ManualClock::new(at_minute(10, 30)));
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::with_clock(clock.clone()));
    let runs = Arc::new(AtomicUsize::new(0));

    let engines: Vec<SchedulerEngine> = (0..2)
        .map(|_| {
            let mut registry = TaskRegistry::new();
            registry.register(sleeping_factory(
                "fleet-report",
                runs.clone(),
                Duration::ZERO,
                None,
                true,
            ));
            pinned_engine(clock.clone(), store.clone(), registry)
        })
        .collect();

    let (a, b) = futures::join!(engines[0].tick(), engines[1].tick());

    let outcomes = [&a[0].outcome, &b[0].outcome];
    let completed = outcomes
        .iter()
        .filter(|o| matches!(o, TaskOutcome::Completed))
        .count();
    let skipped = outcomes
        .iter()
        .filter(|o| matches!(o, TaskOutcome::SkippedOnOtherServer))
        .count();

    assert_eq!(completed, 1);
    assert_eq!(skipped, 1);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // The next minute is a fresh claim; either engine may win it again.
    clock.set(at_minute(10, 31));
    let next = engines[0].tick().await;
    assert!(matches!(next[0].outcome, TaskOutcome::Completed));
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

/// Crash simulation: a mutex left behind by a dead process blocks runs only
/// until its TTL lapses, then the task is schedulable again.
#[tokio::test]
async fn test_abandoned_mutex_expires_and_unblocks_the_task() {
    let clock = Arc::new(ManualClock::new(at_minute(3, 0)));
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let runs = Arc::new(AtomicUsize::new(0));

    let mut registry = TaskRegistry::new();
    registry.register(sleeping_factory(
        "nightly-cleanup",
        runs.clone(),
        Duration::ZERO,
        Some(5),
        false,
    ));
    let engine = pinned_engine(clock.clone(), store.clone(), registry);

    // A crashed host acquired the mutex and never released it.
    store
        .set(
            &mutex_name("nightly-cleanup"),
            true,
            Duration::from_secs(5 * 60),
        )
        .await
        .unwrap();

    let blocked = engine.tick().await;
    assert!(matches!(blocked[0].outcome, TaskOutcome::SkippedOverlapping));
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    // One second short of the TTL the mutex still blocks.
    clock.advance(chrono::Duration::seconds(5 * 60 - 1));
    let still_blocked = engine.tick().await;
    assert!(matches!(
        still_blocked[0].outcome,
        TaskOutcome::SkippedOverlapping
    ));

    clock.advance(chrono::Duration::seconds(2));
    let recovered = engine.tick().await;
    assert!(matches!(recovered[0].outcome, TaskOutcome::Completed));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

/// Two engines coordinating through file stores over one shared directory,
/// the way a fleet on a network filesystem would.
#[tokio::test]
async fn test_file_store_coordinates_two_engines_across_a_directory() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(at_minute(7, 15)));
    let runs = Arc::new(AtomicUsize::new(0));

    let mut engines = Vec::new();
    for _ in 0..2 {
        let store: Arc<dyn KeyValueStore> = Arc::new(
            FileStore::with_clock(dir.path(), clock.clone())
                .await
                .unwrap(),
        );
        let mut registry = TaskRegistry::new();
        registry.register(sleeping_factory(
            "shared-dir-report",
            runs.clone(),
            Duration::ZERO,
            Some(5),
            true,
        ));
        engines.push(pinned_engine(clock.clone(), store, registry));
    }

    let (a, b) = futures::join!(engines[0].tick(), engines[1].tick());

    let outcomes = [&a[0].outcome, &b[0].outcome];
    let completed = outcomes
        .iter()
        .filter(|o| matches!(o, TaskOutcome::Completed))
        .count();
    assert_eq!(completed, 1);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // Completion released the overlap mutex in the shared directory; the
    // next minute runs again through the other engine's store handle.
    clock.set(at_minute(7, 16));
    let next = engines[1].tick().await;
    assert!(matches!(next[0].outcome, TaskOutcome::Completed));
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

/// Configured command tasks flow through the whole pipeline: a passing
/// command completes, a failing one is contained and reported.
#[tokio::test]
async fn test_command_tasks_complete_and_fail_independently() {
    let clock = Arc::new(ManualClock::new(at_minute(12, 0)));
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::with_clock(clock.clone()));

    let mut registry = TaskRegistry::new();
    registry.register(|store: Arc<dyn KeyValueStore>| {
        ScheduledTask::builder(Box::new(CommandTask::new("passing", "true")))
            .every_minute()
            .timezone(chrono_tz::UTC)
            .without_overlapping()
            .build(store)
    });
    registry.register(|store: Arc<dyn KeyValueStore>| {
        ScheduledTask::builder(Box::new(CommandTask::new("failing", "exit 1")))
            .every_minute()
            .timezone(chrono_tz::UTC)
            .without_overlapping()
            .build(store)
    });

    let engine = pinned_engine(clock.clone(), store.clone(), registry);
    let reports = engine.tick().await;

    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].name, "passing");
    assert!(matches!(reports[0].outcome, TaskOutcome::Completed));
    assert_eq!(reports[1].name, "failing");
    assert!(matches!(reports[1].outcome, TaskOutcome::Failed { .. }));

    // Failure released the failing task's mutex just like success did.
    assert!(!store.exists(&mutex_name("failing")).await.unwrap());
    assert!(!store.exists(&mutex_name("passing")).await.unwrap());

    clock.set(at_minute(12, 1));
    let again = engine.tick().await;
    assert!(matches!(again[0].outcome, TaskOutcome::Completed));
    assert!(matches!(again[1].outcome, TaskOutcome::Failed { .. }));
}

/// The interval loop ticks repeatedly until stopped.
#[tokio::test]
async fn test_engine_loop_ticks_until_stopped() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let runs = Arc::new(AtomicUsize::new(0));

    let mut registry = TaskRegistry::new();
    registry.register(sleeping_factory(
        "heartbeat",
        runs.clone(),
        Duration::ZERO,
        None,
        false,
    ));

    let config = SchedulerConfig {
        tick_interval_seconds: 1,
    };
    let engine = Arc::new(SchedulerEngine::new(config, store, registry));

    let looping = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.start().await })
    };

    tokio::time::sleep(Duration::from_millis(2500)).await;
    engine.stop().await;
    looping.await.unwrap();

    // Ticks fired at 0s, 1s, and 2s; the default expression is due on
    // every one of them.
    assert!(runs.load(Ordering::SeqCst) >= 2);
}
