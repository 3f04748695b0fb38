// Common library for the recurring task scheduler

pub mod clock;
pub mod config;
pub mod errors;
pub mod executor;
pub mod lock;
pub mod schedule;
pub mod scheduler;
pub mod store;
pub mod task;
pub mod telemetry;
