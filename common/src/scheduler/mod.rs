// Scheduler module: task registry, tick pipeline, and fleet coordination

pub mod engine;
pub mod registry;

pub use engine::{SchedulerConfig, SchedulerEngine, TaskOutcome, TaskReport, SERVER_LOCK_TTL};
pub use registry::{TaskFactory, TaskRegistry};
