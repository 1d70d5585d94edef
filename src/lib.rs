pub mod core;
pub mod providers;
pub mod scheduler;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::core::config::AppConfig;
use crate::core::notify::{ConsoleNotifier, format_conversion};
use crate::core::rates::RateCache;
use crate::core::resolve::QueryResolver;
use crate::providers::cbr::CbrRateSource;
use crate::scheduler::{CONVERSION_CALLBACK, NotificationScheduler};
use crate::store::disk::DiskJobStore;
use crate::store::{CallbackRegistry, JobStore};

pub enum AppCommand {
    Convert {
        query: String,
    },
    Subscribe {
        subscriber: String,
        chat: String,
        plan: String,
        query: String,
    },
    Unsubscribe {
        subscriber: String,
    },
    Serve,
}

pub async fn run_command(command: AppCommand, config_path: Option<&str>) -> Result<()> {
    let config = match config_path {
        Some(path) => AppConfig::load_from_path(path)?,
        None => AppConfig::load()?,
    };
    debug!("Loaded config: {config:#?}");

    let source = Arc::new(CbrRateSource::new(
        &config.source.base_url,
        Duration::from_secs(config.source.timeout_secs),
        config.source.retries,
    ));
    let rates = Arc::new(RateCache::new(
        source,
        chrono::Duration::hours(config.freshness_hours),
    ));
    let resolver = Arc::new(QueryResolver::new(rates));

    match command {
        AppCommand::Convert { query } => {
            let conversions = resolver.resolve(&query).await?;
            for conversion in &conversions {
                println!("{}", format_conversion(conversion));
            }
            Ok(())
        }
        AppCommand::Subscribe {
            subscriber,
            chat,
            plan,
            query,
        } => {
            let scheduler = build_scheduler(&config, resolver)?;
            scheduler.subscribe(&subscriber, &chat, &query, &plan).await?;
            info!("Subscription stored; it fires whenever `kurs serve` is running");
            Ok(())
        }
        AppCommand::Unsubscribe { subscriber } => {
            let scheduler = build_scheduler(&config, resolver)?;
            scheduler.unsubscribe(&subscriber).await?;
            Ok(())
        }
        AppCommand::Serve => {
            let scheduler = Arc::new(build_scheduler(&config, resolver)?);
            let restored = scheduler.rehydrate().await?;
            info!("Serving {restored} rehydrated subscriptions; press ctrl-c to stop");

            let runner = tokio::spawn(Arc::clone(&scheduler).run());
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for shutdown signal")?;
            scheduler.shutdown();
            runner.await.context("Scheduler dispatcher panicked")?;
            Ok(())
        }
    }
}

fn build_scheduler(
    config: &AppConfig,
    resolver: Arc<QueryResolver>,
) -> Result<NotificationScheduler> {
    let jobs_path = config.default_data_path()?.join("jobs");
    let store: Arc<dyn JobStore> = Arc::new(DiskJobStore::open(&jobs_path)?);

    let callbacks = Arc::new(CallbackRegistry::new());
    callbacks.register(CONVERSION_CALLBACK, Arc::new(ConsoleNotifier));

    Ok(NotificationScheduler::new(resolver, store, callbacks))
}
