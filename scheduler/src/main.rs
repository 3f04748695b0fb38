// Scheduler binary entry point

use chrono::Utc;
use common::config::{LogFormat, Settings, StoreSettings, TaskSettings};
use common::errors::ScheduleError;
use common::executor::CommandTask;
use common::schedule::parse_timezone;
use common::scheduler::{SchedulerConfig, SchedulerEngine, TaskRegistry};
use common::store::{FileStore, KeyValueStore, MemoryStore, RedisStore};
use common::task::ScheduledTask;
use common::telemetry;
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let once = std::env::args().any(|arg| arg == "--once");

    let settings = Settings::load()?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.log_format == LogFormat::Json,
    )?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting cronlock scheduler"
    );

    settings.validate().map_err(|e| {
        error!(error = %e, "invalid configuration");
        anyhow::anyhow!(e)
    })?;

    if let Some(port) = settings.observability.metrics_port {
        telemetry::init_metrics(port)?;
    }

    let store = build_store(&settings.store).await?;
    let registry = build_registry(&settings.tasks);

    if registry.is_empty() {
        warn!("no tasks enabled; the scheduler will tick but do nothing");
    }

    // Construct every task once so a bad cron expression or timezone fails
    // the process now instead of the first tick.
    let now = Utc::now();
    for factory in registry.factories() {
        let task = factory(store.clone()).map_err(|e| {
            error!(error = %e, "invalid task definition");
            e
        })?;
        match task.recurrence().next_fire_utc(now) {
            Some(next) => info!(
                task = %task.name(),
                cron = %task.recurrence().expression(),
                next_run = %next,
                "task registered"
            ),
            None => warn!(
                task = %task.name(),
                cron = %task.recurrence().expression(),
                "task registered but its schedule never fires"
            ),
        }
    }

    let config = SchedulerConfig {
        tick_interval_seconds: settings.scheduler.tick_interval_seconds,
    };
    let engine = Arc::new(SchedulerEngine::new(config, store, registry));

    if once {
        let reports = engine.tick().await;
        info!(evaluated = reports.len(), "single tick complete");
        return Ok(());
    }

    let engine_for_shutdown = engine.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for shutdown signal");
            return;
        }
        info!("received ctrl-c, initiating graceful shutdown");
        engine_for_shutdown.stop().await;
    });

    engine.start().await;
    info!("scheduler stopped");
    Ok(())
}

async fn build_store(settings: &StoreSettings) -> anyhow::Result<Arc<dyn KeyValueStore>> {
    match settings {
        StoreSettings::Memory => {
            info!("using in-process memory store; coordination is limited to this host");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreSettings::File { path } => {
            info!(path = %path.display(), "using file store");
            Ok(Arc::new(FileStore::new(path.clone()).await?))
        }
        StoreSettings::Redis { url, key_prefix } => {
            let store = RedisStore::connect(url, key_prefix).await?;
            store.health_check().await?;
            info!(url = %url, "using redis store");
            Ok(Arc::new(store))
        }
    }
}

fn build_registry(tasks: &[TaskSettings]) -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    for task in tasks {
        if !task.enabled {
            info!(task = %task.name, "task disabled, not registering");
            continue;
        }
        let spec = task.clone();
        registry.register(move |store| build_task(&spec, store));
    }
    registry
}

fn build_task(
    spec: &TaskSettings,
    store: Arc<dyn KeyValueStore>,
) -> Result<ScheduledTask, ScheduleError> {
    let command = CommandTask::new(spec.name.as_str(), spec.command.as_str());
    let mut builder = ScheduledTask::builder(Box::new(command)).cron(&spec.cron);

    if let Some(name) = &spec.timezone {
        builder = builder.timezone(parse_timezone(name)?);
    }
    if spec.without_overlapping {
        builder = builder.without_overlapping_for(spec.expires_after_minutes);
    }
    if spec.on_one_server {
        builder = builder.on_one_server();
    }

    builder.build(store)
}
