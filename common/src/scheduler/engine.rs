// Scheduler engine: the once-a-minute tick that dispatches due tasks
//
// Each tick walks the registry in order and pushes every task through the
// same pipeline: due check, filters, overlap pre-check, single-server
// arbitration, then the run itself. A failing task never stops the tick;
// its outcome is recorded and the walk continues.

use crate::clock::{Clock, SystemClock};
use crate::errors::{StoreError, TaskError};
use crate::scheduler::registry::TaskRegistry;
use crate::store::KeyValueStore;
use crate::task::{RunOutcome, ScheduledTask};
use crate::telemetry;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument};

/// Per-minute server claims expire on their own after one minute, so a
/// claim never outlives the minute it arbitrates.
pub const SERVER_LOCK_TTL: Duration = Duration::from_secs(60);

/// Configuration for the scheduler engine.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Seconds between ticks. One minute matches cron's resolution; shorter
    /// intervals only make sense in tests.
    pub tick_interval_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_seconds: 60,
        }
    }
}

/// What a tick decided for one task.
#[derive(Debug)]
pub enum TaskOutcome {
    /// The recurrence does not fire inside this tick's minute.
    NotDue,
    Completed,
    Failed { error: TaskError },
    /// A previous run still holds the overlap mutex.
    SkippedOverlapping,
    /// Another host claimed this task's minute first.
    SkippedOnOtherServer,
    SkippedByFilter,
    /// The store could not be reached; constrained tasks fail closed.
    StoreUnavailable { error: StoreError },
}

/// One task's outcome within a tick.
#[derive(Debug)]
pub struct TaskReport {
    pub name: String,
    pub outcome: TaskOutcome,
}

/// Drives the tick loop against a task registry and a shared store.
pub struct SchedulerEngine {
    config: SchedulerConfig,
    store: Arc<dyn KeyValueStore>,
    registry: TaskRegistry,
    clock: Arc<dyn Clock>,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

fn server_minute_key(mutex_key: &str, tick_start: DateTime<Utc>) -> String {
    format!("{}{}", mutex_key, tick_start.format("%H%M"))
}

impl SchedulerEngine {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn KeyValueStore>,
        registry: TaskRegistry,
    ) -> Self {
        Self::with_clock(config, store, registry, Arc::new(SystemClock))
    }

    /// Engine with an injected clock, so tests can pin the minute a tick
    /// evaluates against.
    pub fn with_clock(
        config: SchedulerConfig,
        store: Arc<dyn KeyValueStore>,
        registry: TaskRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (shutdown_tx, _shutdown_rx) = tokio::sync::broadcast::channel(1);
        Self {
            config,
            store,
            registry,
            clock,
            shutdown_tx,
        }
    }

    pub fn shutdown_receiver(&self) -> tokio::sync::broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Evaluate every registered task once against the current minute.
    pub async fn tick(&self) -> Vec<TaskReport> {
        let tick_start = self.clock.now_utc();
        let started = Instant::now();
        debug!(at = %tick_start, tasks = self.registry.len(), "tick started");

        let mut reports = Vec::with_capacity(self.registry.len());
        for factory in self.registry.factories() {
            let task = match factory(self.store.clone()) {
                Ok(task) => task,
                Err(e) => {
                    error!(error = %e, "failed to construct task, skipping it this tick");
                    continue;
                }
            };

            let outcome = self.process_task(&task, tick_start).await;
            self.record_outcome(task.name(), &outcome);
            reports.push(TaskReport {
                name: task.name().to_string(),
                outcome,
            });
        }

        telemetry::record_tick_duration(started.elapsed());
        reports
    }

    /// Decide whether `task` runs this tick, honoring its constraints.
    ///
    /// Constrained tasks fail closed: when the store cannot answer, the
    /// task is skipped rather than run without proof of exclusivity.
    #[instrument(skip(self, task), fields(task = %task.name()))]
    async fn process_task(&self, task: &ScheduledTask, tick_start: DateTime<Utc>) -> TaskOutcome {
        if !task.is_due(tick_start) {
            return TaskOutcome::NotDue;
        }

        if !task.filters_pass() {
            return TaskOutcome::SkippedByFilter;
        }

        match task.is_overlapping().await {
            Ok(false) => {}
            Ok(true) => return TaskOutcome::SkippedOverlapping,
            Err(error) => return TaskOutcome::StoreUnavailable { error },
        }

        if task.on_one_server() {
            match self.server_should_run(task, tick_start).await {
                Ok(true) => {}
                Ok(false) => return TaskOutcome::SkippedOnOtherServer,
                Err(error) => return TaskOutcome::StoreUnavailable { error },
            }
        }

        info!(task = %task.name(), at = %tick_start, "task run starting");
        match task.run().await {
            Ok(RunOutcome::Completed) => TaskOutcome::Completed,
            Ok(RunOutcome::Failed(error)) => TaskOutcome::Failed { error },
            Ok(RunOutcome::SkippedOverlapping) => TaskOutcome::SkippedOverlapping,
            Err(error) => TaskOutcome::StoreUnavailable { error },
        }
    }

    /// Claim this task's current minute. The first host whose claim lands
    /// owns the minute; everyone else skips. The key repeats daily but the
    /// one-minute TTL retires it long before it could collide.
    async fn server_should_run(
        &self,
        task: &ScheduledTask,
        tick_start: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let key = server_minute_key(task.mutex_key(), tick_start);
        self.store.set_if_absent(&key, true, SERVER_LOCK_TTL).await
    }

    fn record_outcome(&self, name: &str, outcome: &TaskOutcome) {
        match outcome {
            TaskOutcome::NotDue => {
                debug!(task = %name, "not due this minute");
            }
            TaskOutcome::Completed => {
                info!(task = %name, "task completed");
                telemetry::record_task_run(name);
            }
            TaskOutcome::Failed { error } => {
                error!(task = %name, error = %error, "task failed");
                telemetry::record_task_run(name);
                telemetry::record_task_failure(name);
            }
            TaskOutcome::SkippedOverlapping => {
                info!(task = %name, "skipped, previous run still in flight");
                telemetry::record_task_skip(name, "overlapping");
            }
            TaskOutcome::SkippedOnOtherServer => {
                info!(task = %name, "skipped, another server claimed this minute");
                telemetry::record_task_skip(name, "other_server");
            }
            TaskOutcome::SkippedByFilter => {
                debug!(task = %name, "skipped by filter");
                telemetry::record_task_skip(name, "filter");
            }
            TaskOutcome::StoreUnavailable { error } => {
                error!(task = %name, error = %error, "store unavailable, task not dispatched");
                telemetry::record_store_error();
            }
        }
    }

    /// Run the tick loop until a shutdown signal arrives. Ticks run to
    /// completion back to back when a previous tick overruns; they are
    /// never fired in a catch-up burst.
    #[instrument(skip(self))]
    pub async fn start(&self) {
        info!(
            tick_interval_seconds = self.config.tick_interval_seconds,
            tasks = self.registry.len(),
            "starting scheduler engine"
        );

        let mut tick_interval = interval(Duration::from_secs(self.config.tick_interval_seconds));
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown_rx = self.shutdown_receiver();

        loop {
            tokio::select! {
                _ = tick_interval.tick() => {
                    self.tick().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received, stopping scheduler");
                    break;
                }
            }
        }

        info!("scheduler engine stopped");
    }

    /// Signal the tick loop to stop, then give the in-flight tick a moment
    /// to finish.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        info!("stopping scheduler engine");
        let _ = self.shutdown_tx.send(());
        sleep(Duration::from_secs(2)).await;
    }
}
