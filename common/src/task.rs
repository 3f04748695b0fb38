// Task model: what to run, when it recurs, and which constraints apply

use crate::errors::{ScheduleError, StoreError, TaskError};
use crate::lock::{OverlapGuard, TaskMutex};
use crate::schedule::Recurrence;
use crate::store::KeyValueStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Overlap mutexes outlive a crashed run for at most a day by default.
pub const DEFAULT_MUTEX_EXPIRY_MINUTES: u64 = 1440;

/// The work a scheduled task performs.
#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self) -> Result<(), TaskError>;
}

/// Environment check consulted at dispatch time. Filters must hold,
/// rejects must not.
pub type Predicate = Box<dyn Fn() -> bool + Send + Sync>;

/// What happened when a due task was handed to `run`.
#[derive(Debug)]
pub enum RunOutcome {
    Completed,
    Failed(TaskError),
    /// A previous run still holds the overlap mutex.
    SkippedOverlapping,
}

/// A task bound to its recurrence, filters, and coordination constraints.
pub struct ScheduledTask {
    task: Box<dyn Task>,
    recurrence: Recurrence,
    filters: Vec<Predicate>,
    rejects: Vec<Predicate>,
    without_overlapping: bool,
    on_one_server: bool,
    expires_after: Duration,
    mutex: TaskMutex,
}

impl ScheduledTask {
    pub fn builder(task: Box<dyn Task>) -> ScheduledTaskBuilder {
        ScheduledTaskBuilder::new(task)
    }

    pub fn name(&self) -> &str {
        self.task.name()
    }

    pub fn recurrence(&self) -> &Recurrence {
        &self.recurrence
    }

    /// Store key of this task's overlap mutex. Also the stem of its
    /// per-minute server arbitration keys.
    pub fn mutex_key(&self) -> &str {
        self.mutex.key()
    }

    pub fn without_overlapping(&self) -> bool {
        self.without_overlapping
    }

    pub fn on_one_server(&self) -> bool {
        self.on_one_server
    }

    pub fn expires_after(&self) -> Duration {
        self.expires_after
    }

    /// Whether the recurrence fires within the minute containing `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.recurrence.is_due(now)
    }

    /// Runs every filter, then every reject, stopping at the first veto.
    pub fn filters_pass(&self) -> bool {
        for filter in &self.filters {
            if !filter() {
                return false;
            }
        }
        for reject in &self.rejects {
            if reject() {
                return false;
            }
        }
        true
    }

    /// Whether a previous run of this task still holds the overlap mutex.
    /// Always `false` for tasks that allow overlap.
    pub async fn is_overlapping(&self) -> Result<bool, StoreError> {
        if !self.without_overlapping {
            return Ok(false);
        }
        self.mutex.exists().await
    }

    /// Execute the task, claiming the overlap mutex first when the task
    /// forbids overlap. Store failures abort before execution, so a task
    /// that cannot prove exclusivity never runs.
    pub async fn run(&self) -> Result<RunOutcome, StoreError> {
        if !self.without_overlapping {
            return Ok(self.execute_outcome().await);
        }

        let guard = match self.mutex.acquire().await? {
            Some(guard) => guard,
            None => return Ok(RunOutcome::SkippedOverlapping),
        };

        let outcome = self.execute_outcome().await;
        self.release(guard).await;
        Ok(outcome)
    }

    async fn execute_outcome(&self) -> RunOutcome {
        match self.task.execute().await {
            Ok(()) => RunOutcome::Completed,
            Err(e) => RunOutcome::Failed(e),
        }
    }

    async fn release(&self, guard: OverlapGuard) {
        if let Err(e) = guard.release().await {
            warn!(
                task = %self.name(),
                error = %e,
                "failed to release overlap mutex; ttl will reclaim it"
            );
        }
    }

    /// Force-release this task's overlap mutex.
    pub async fn clear_mutex(&self) -> Result<(), StoreError> {
        self.mutex.remove().await
    }
}

/// Fluent construction of a [`ScheduledTask`], mirroring how recurring jobs
/// are declared: pick a cadence, add environment filters, then opt into the
/// overlap and single-server constraints.
pub struct ScheduledTaskBuilder {
    task: Box<dyn Task>,
    expression: String,
    timezone: Option<Tz>,
    filters: Vec<Predicate>,
    rejects: Vec<Predicate>,
    without_overlapping: bool,
    on_one_server: bool,
    expires_after: Duration,
}

impl ScheduledTaskBuilder {
    pub fn new(task: Box<dyn Task>) -> Self {
        Self {
            task,
            expression: crate::schedule::DEFAULT_EXPRESSION.to_string(),
            timezone: None,
            filters: Vec::new(),
            rejects: Vec::new(),
            without_overlapping: false,
            on_one_server: false,
            expires_after: Duration::from_secs(DEFAULT_MUTEX_EXPIRY_MINUTES * 60),
        }
    }

    /// Set the cron expression directly. Five- and six-field forms are
    /// accepted; parsing happens in [`build`](Self::build).
    pub fn cron(mut self, expression: &str) -> Self {
        self.expression = expression.to_string();
        self
    }

    /// Evaluate the recurrence in this timezone instead of the host's.
    pub fn timezone(mut self, tz: Tz) -> Self {
        self.timezone = Some(tz);
        self
    }

    /// Only dispatch when `predicate` returns true.
    pub fn when<F>(mut self, predicate: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.filters.push(Box::new(predicate));
        self
    }

    /// Skip dispatch when `predicate` returns true.
    pub fn skip<F>(mut self, predicate: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.rejects.push(Box::new(predicate));
        self
    }

    /// Never start a run while a previous run is still in flight.
    pub fn without_overlapping(self) -> Self {
        self.without_overlapping_for(DEFAULT_MUTEX_EXPIRY_MINUTES)
    }

    /// Like [`without_overlapping`](Self::without_overlapping) with a custom
    /// mutex TTL, for tasks whose runs can legitimately exceed a day.
    pub fn without_overlapping_for(mut self, minutes: u64) -> Self {
        self.without_overlapping = true;
        self.expires_after = Duration::from_secs(minutes * 60);
        self
    }

    /// In a fleet of schedulers, let only one host dispatch each due minute.
    pub fn on_one_server(mut self) -> Self {
        self.on_one_server = true;
        self
    }

    pub fn every_minute(self) -> Self {
        self.cron("0 * * * * *")
    }

    pub fn every_five_minutes(self) -> Self {
        self.cron("0 */5 * * * *")
    }

    pub fn every_ten_minutes(self) -> Self {
        self.cron("0 */10 * * * *")
    }

    pub fn every_thirty_minutes(self) -> Self {
        self.cron("0 */30 * * * *")
    }

    pub fn hourly(self) -> Self {
        self.cron("0 0 * * * *")
    }

    pub fn hourly_at(self, minute: u32) -> Self {
        self.cron(&format!("0 {} * * * *", minute))
    }

    pub fn daily(self) -> Self {
        self.cron("0 0 0 * * *")
    }

    pub fn daily_at(self, hour: u32, minute: u32) -> Self {
        self.cron(&format!("0 {} {} * * *", minute, hour))
    }

    pub fn weekly(self) -> Self {
        self.cron("0 0 0 * * Sun")
    }

    pub fn monthly(self) -> Self {
        self.cron("0 0 0 1 * *")
    }

    /// Parse the recurrence and bind the task to the shared store.
    pub fn build(self, store: Arc<dyn KeyValueStore>) -> Result<ScheduledTask, ScheduleError> {
        let recurrence = Recurrence::parse(&self.expression, self.timezone)?;
        let mutex = TaskMutex::new(store, self.task.name(), self.expires_after);
        Ok(ScheduledTask {
            task: self.task,
            recurrence,
            filters: self.filters,
            rejects: self.rejects,
            without_overlapping: self.without_overlapping,
            on_one_server: self.on_one_server,
            expires_after: self.expires_after,
            mutex,
        })
    }
}
