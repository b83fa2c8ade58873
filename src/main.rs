use neploy::access_log::RequestLogger;
use neploy::api::{ControlApi, Services};
use neploy::cache::{CacheLayer, ResponseCache};
use neploy::config::Config;
use neploy::db::Database;
use neploy::engine::{ContainerEngine, DockerEngine};
use neploy::gateway::GatewayService;
use neploy::healthcheck::{HealthCheckConfig, HealthChecker};
use neploy::lifecycle::LifecycleService;
use neploy::metrics::{Aggregator, MetricsCollector};
use neploy::notify::{HubSettings, NotificationHub};
use neploy::pipeline::{Pipeline, PipelineSettings};
use neploy::pool::{ConnectionPool, PoolConfig};
use neploy::router::Router;
use neploy::server::Server;
use neploy::worker::WorkerHandle;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("neploy=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("neploy.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %config_path.display(), "Configuration loaded");

    for dir in [&config.storage.upload_root, &config.storage.data_dir] {
        std::fs::create_dir_all(dir)
            .map_err(|e| anyhow::anyhow!("Failed to create directory '{}': {}", dir.display(), e))?;
    }
    if let Some(parent) = config.storage.database.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db = Database::open(&config.storage.database)?;
    info!(path = %config.storage.database.display(), "Database opened");

    let collector = Arc::new(MetricsCollector::open(config.metrics_log_path()).map_err(|e| {
        anyhow::anyhow!(
            "Failed to open metrics log '{}': {}",
            config.metrics_log_path().display(),
            e
        )
    })?);

    let engine: Arc<dyn ContainerEngine> =
        Arc::new(DockerEngine::connect(config.docker.host.as_deref(), &config.docker.cli).await?);

    let pool_config = PoolConfig::from(&config.server);
    info!(
        max_idle = pool_config.max_idle_per_host,
        idle_timeout_secs = pool_config.idle_timeout.as_secs(),
        "Connection pool configured"
    );
    let pool = Arc::new(ConnectionPool::new(pool_config));
    let router = Arc::new(Router::new(pool, config.server.request_timeout()));
    let hub = Arc::new(NotificationHub::new(HubSettings::from(&config.deploy)));

    let gateways = GatewayService::new(db.clone(), Arc::clone(&router));
    gateways.restore_routes()?;

    let services = Arc::new(Services {
        db: db.clone(),
        hub: Arc::clone(&hub),
        collector: Arc::clone(&collector),
        pipeline: Pipeline::new(
            db.clone(),
            Arc::clone(&engine),
            Arc::clone(&router),
            Arc::clone(&hub),
            PipelineSettings::from(&config),
        ),
        lifecycle: LifecycleService::new(db.clone(), Arc::clone(&engine), Arc::clone(&router)),
        gateways,
    });

    // Background workers
    let cache = Arc::new(ResponseCache::new(&config.cache));
    let workers = vec![
        WorkerHandle::spawn("metrics-aggregator", {
            let aggregator = Aggregator::new(
                Arc::clone(&collector),
                db.clone(),
                config.metrics.application_id.clone(),
            );
            move |rx| aggregator.run(rx)
        }),
        WorkerHandle::spawn("health-checker", {
            let checker = HealthChecker::new(db.clone(), HealthCheckConfig::from(&config.gateway));
            move |rx| checker.run(rx)
        }),
        WorkerHandle::spawn("cache-sweeper", {
            let cache = Arc::clone(&cache);
            move |rx| cache.run_sweeper(rx)
        }),
    ];

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let gateway_addr: SocketAddr =
        format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let gateway_handler = RequestLogger::new(
        Arc::clone(&collector),
        CacheLayer::new(cache, Arc::clone(&router)),
    );
    let gateway_server = Server::bind("gateway", gateway_addr, Arc::new(gateway_handler)).await?;
    let gateway_rx = shutdown_rx.clone();
    let gateway_handle = tokio::spawn(async move {
        if let Err(e) = gateway_server.run(gateway_rx).await {
            error!(error = %e, "Gateway server error");
        }
    });

    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
        token
    });
    let api_addr: SocketAddr =
        format!("{}:{}", config.server.bind, config.server.api_port).parse()?;
    let api_server = Server::bind(
        "api",
        api_addr,
        Arc::new(
            ControlApi::new(services, admin_token)
                .with_max_upload_bytes(config.server.max_upload_bytes()),
        ),
    )
    .await?;
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api_server.run(shutdown_rx).await {
            error!(error = %e, "API server error");
        }
    });

    info!(
        gateway = %gateway_addr,
        api = %api_addr,
        routes = router.route_count(),
        "Neploy started"
    );

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    for worker in workers {
        let name = worker.name();
        worker.stop().await;
        info!(worker = name, "Worker stopped");
    }

    // Wait for servers to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = gateway_handle.await;
        let _ = api_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}
