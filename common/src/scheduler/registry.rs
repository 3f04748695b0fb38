// Task registry: the set of recurring tasks a scheduler dispatches

use crate::errors::ScheduleError;
use crate::store::KeyValueStore;
use crate::task::ScheduledTask;
use std::sync::Arc;

/// Builds one task bound to the shared store. Factories run once per tick,
/// so filter closures observe the environment at dispatch time rather than
/// at registration time.
pub type TaskFactory =
    Box<dyn Fn(Arc<dyn KeyValueStore>) -> Result<ScheduledTask, ScheduleError> + Send + Sync>;

/// Ordered collection of task factories. Registration order is dispatch
/// order within a tick.
#[derive(Default)]
pub struct TaskRegistry {
    factories: Vec<TaskFactory>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, factory: F)
    where
        F: Fn(Arc<dyn KeyValueStore>) -> Result<ScheduledTask, ScheduleError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.push(Box::new(factory));
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    pub fn factories(&self) -> &[TaskFactory] {
        &self.factories
    }

    /// Build every task once and return their names. Called at startup so a
    /// bad cron expression fails the process instead of the first tick.
    pub fn validate(&self, store: &Arc<dyn KeyValueStore>) -> Result<Vec<String>, ScheduleError> {
        let mut names = Vec::with_capacity(self.factories.len());
        for factory in &self.factories {
            let task = factory(store.clone())?;
            names.push(task.name().to_string());
        }
        Ok(names)
    }
}
