mod accounting;
mod aggregator;
mod data;
mod error;
mod geo;
mod handlers;
mod models;
mod pool;
mod state;

use anyhow::Context as _;
use std::sync::Arc;
use tera::Tera;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::accounting::MemoryAccounting;
use crate::aggregator::FlowAggregator;
use crate::data::{load_flow_snapshots, Replay};
use crate::geo::{GeoCache, IpApiProvider};
use crate::handlers::create_router;
use crate::pool::FlowPool;
use crate::state::{AppState, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowviz=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    info!(
        "aggregation window {:?}, granularity {:?}",
        config.window(),
        config.granularity()
    );

    let accounting = Arc::new(MemoryAccounting::new());
    let replay = if config.flow_data_path.exists() {
        match load_flow_snapshots(&config.flow_data_path) {
            Ok(snapshots) => Some(Replay::new(snapshots)),
            Err(e) => {
                warn!(
                    "could not replay {}: {}",
                    config.flow_data_path.display(),
                    e
                );
                None
            }
        }
    } else {
        None
    };

    let tera = Tera::new("templates/**/*.html").context("parsing templates")?;
    let pool = Arc::new(FlowPool::default());
    let aggregator = FlowAggregator::new(accounting.clone(), pool);
    let provider = IpApiProvider::new(&config.geoip_base_url, config.geoip_timeout)
        .context("building geoip client")?;

    let scheduler = JobScheduler::new().await?;
    let prune_accounting = accounting.clone();
    let retention = config.history_retention;
    let prune_job = Job::new_async(config.prune_cron.as_str(), move |_uuid, _lock| {
        let accounting = prune_accounting.clone();
        Box::pin(async move {
            let removed = accounting.prune(retention);
            if removed > 0 {
                info!("pruned {} expired accounting windows", removed);
            }
        })
    })?;
    scheduler.add(prune_job).await?;

    if let Some(replay) = replay {
        replay.tick(&accounting);
        let flows = replay.flows();
        let replay = Arc::new(replay);
        let replay_accounting = accounting.clone();
        let replay_job = Job::new_repeated_async(config.replay_interval, move |_uuid, _lock| {
            let replay = replay.clone();
            let accounting = replay_accounting.clone();
            Box::pin(async move {
                replay.tick(&accounting);
            })
        })?;
        scheduler.add(replay_job).await?;
        info!(
            "replaying {} flows from {} every {:?}",
            flows,
            config.flow_data_path.display(),
            config.replay_interval
        );
    }
    scheduler.start().await?;

    let bind_address = config.bind_address.clone();
    let state = Arc::new(AppState::new(
        config,
        tera,
        accounting,
        aggregator,
        GeoCache::new(provider),
    ));
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("binding {}", bind_address))?;
    info!("Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
