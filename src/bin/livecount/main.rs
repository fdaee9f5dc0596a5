use livecount::{
    admin,
    app::{self, AppData, RuntimeData},
    config::Config,
    control, health,
    queue::{TaskQueue, WorkerPool},
    redis::RedisCache,
    store::JsonStore,
    Coordinator,
};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let (config, fallback) = match Config::from_path() {
        Ok(config) => (config, None),
        Err(err) => (Config::default(), Some(err)),
    };

    let level = config
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();

    if let Some(err) = fallback {
        tracing::warn!("{err:#}, using default settings");
    }

    run(config).await
}

async fn run(config: Config) -> anyhow::Result<()> {
    let cache = RedisCache::connect(&config.redis_addr, config.cache_prefix.clone()).await?;
    let store = JsonStore::open(&config.store_path)?;
    let (queue, receiver) = TaskQueue::new(&config.queue.name);
    let counter =
        Coordinator::new(cache, store, queue.clone()).with_marker_ttl(config.dirty_marker_ttl());

    let pool = WorkerPool::spawn(
        receiver,
        counter.flush_worker(),
        config.queue.workers,
        config.queue.retry_policy(),
    );

    let listener = health::bind_healthcheck_listener(config.health_check_port).await?;
    let health = health::spawn_healthcheck_listener(listener);

    let listener = control::bind_control_listener(config.control_port).await?;
    let control = control::spawn_control_listener(listener, counter.clone());

    let data: AppData = RuntimeData::builder()
        .counter(counter)
        .queue(queue)
        .build()
        .into();

    let (tx, rx) = watch::channel(false);
    let sweep = config
        .writeback_interval()
        .map(|interval| app::spawn_writeback_sweep(data.clone(), interval, rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("quitting livecount");

    control.abort();
    tx.send(true).ok();
    if let Some(sweep) = sweep {
        sweep.await.ok();
    }
    // every accepted flush runs before the workers stop
    pool.shutdown().await;

    // persist whatever is still only cached
    let report = admin::writeback_all(&data.counter, None, false).await?;
    tracing::info!("final writeback: {} flushed, {} missing", report.flushed, report.missing);

    health.abort();
    Ok(())
}
