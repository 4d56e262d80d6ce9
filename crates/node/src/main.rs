//! farm-node: entry point for a replicated key/value farm.
//!
//! Loads config, opens one storage engine per replica (WAL-backed when a
//! data directory is configured), wires the data farm, its counter farm
//! and the expiry sweeper, then runs until Ctrl+C.

use farm_config::{FarmConfig, NodeConfig};
use farm_kv::{
    CounterFarm, ExpiryIndex, Farm, ReadStrategy, Replica, Sweeper, Tactic, TaskPool,
};
use farm_kv::local::LocalReplica;
use farm_metrics::FarmMetrics;
use farm_storage::{FsyncPolicy, StorageEngine};
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    farm_metrics::init_tracing();

    // Load config: first CLI arg is the YAML config path
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());

    let config = farm_config::load_from_file(std::path::Path::new(&config_path))
        .unwrap_or_else(|e| {
            tracing::warn!("failed to load config from {}: {}, using defaults", config_path, e);
            NodeConfig::default()
        });
    config.validate()?;

    let metrics = Arc::new(FarmMetrics::new()?);
    let (pool, mut background_errors) =
        TaskPool::new(config.farm.max_background_tasks, metrics.clone());
    let pool = Arc::new(pool);

    let tactic = tactic(&config.farm)?;
    let strategy = strategy(&config.farm);
    let repair_timeout = Duration::from_millis(config.farm.repair_timeout_ms);

    let mut farm = Farm::new(
        "data",
        open_replicas(&config, "replica")?,
        tactic.clone(),
        strategy,
        pool.clone(),
        metrics.clone(),
    )
    .with_repair_timeout(repair_timeout);

    if config.farm.counter {
        // Mirrors follow writes the data farm already admitted.
        let counter = Farm::new(
            "counter",
            open_replicas(&config, "counter")?,
            tactic.unmetered(),
            strategy,
            pool.clone(),
            metrics.clone(),
        )
        .with_repair_timeout(repair_timeout);
        farm = farm.with_counter(Arc::new(CounterFarm::new(counter)));
    }

    let index = Arc::new(ExpiryIndex::new(Duration::from_millis(config.sweeper.window_ms)));
    if config.sweeper.enabled {
        farm = farm.with_expiry_index(index.clone());
    }
    let farm = Arc::new(farm);

    if config.sweeper.enabled {
        let sweeper = Sweeper::new(farm.clone(), index, pool.clone(), metrics.clone())
            .with_full_sweep_every(config.sweeper.full_sweep_every);
        Arc::new(sweeper).spawn();
    }

    // Background failures are already logged and counted by the pool;
    // surface them once more with the task that raised them.
    let token = pool.token();
    pool.spawn_service(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                report = background_errors.recv() => match report {
                    Some(report) => tracing::debug!(task = report.task, "background error: {}", report.error),
                    None => break,
                },
            }
        }
    });

    tracing::info!(
        replicas = config.replicas,
        strategy = ?strategy,
        counter = config.farm.counter,
        "farm {} ready",
        farm.name()
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("received Ctrl+C, shutting down");

    pool.shutdown().await;
    let mut closing = farm.replicas().await.to_vec();
    if let Some(counter) = farm.counter() {
        closing.extend(counter.farm().replicas().await.iter().cloned());
    }
    for replica in closing {
        if let Err(e) = replica.close().await {
            tracing::warn!("failed to close {}: {}", replica.name(), e);
        }
    }
    tracing::debug!("final metrics:\n{}", metrics.encode()?);
    Ok(())
}

fn tactic(config: &FarmConfig) -> Result<Tactic, Box<dyn std::error::Error>> {
    Ok(match config.tactic.as_str() {
        "blocking" => Tactic::Blocking,
        "rate_limited" => {
            let per_second = NonZeroU32::new(config.rate_limit_per_sec)
                .ok_or("rate_limit_per_sec must be > 0")?;
            let burst = NonZeroU32::new(config.rate_limit_burst)
                .ok_or("rate_limit_burst must be > 0")?;
            Tactic::rate_limited(per_second, burst)
        }
        _ => Tactic::NonBlocking,
    })
}

fn strategy(config: &FarmConfig) -> ReadStrategy {
    match config.strategy.as_str() {
        "read_one" => ReadStrategy::ReadOne,
        "read_all" => ReadStrategy::ReadAll,
        _ => ReadStrategy::ReadQuorum(config.quorum),
    }
}

/// Open `config.replicas` engines named `{prefix}-{i}`.
fn open_replicas(
    config: &NodeConfig,
    prefix: &str,
) -> Result<Vec<Arc<dyn Replica>>, Box<dyn std::error::Error>> {
    let fsync = FsyncPolicy::from_str_config(&config.storage.fsync);
    let mut replicas: Vec<Arc<dyn Replica>> = Vec::with_capacity(config.replicas);
    for i in 0..config.replicas {
        let name = format!("{prefix}-{i}");
        let engine = match &config.storage.data_dir {
            Some(dir) => StorageEngine::open(&dir.join(&name), config.storage.shards, fsync)?,
            None => StorageEngine::in_memory(config.storage.shards),
        };
        replicas.push(Arc::new(LocalReplica::new(name, engine)));
    }
    Ok(replicas)
}
