use axum::routing::get;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use image_gen_queue::{
    app_state::{AppState, QueueDirectory},
    config::AppConfig,
    db,
    models::model_config::ModelRegistry,
    routes,
    services::{
        credentials::{CredentialRotator, PgCredentialStore},
        credits::PgCreditLedger,
        inference::{Dispatcher, HttpInferenceClient},
        kv::{FileKvStore, KvStore, RedisKvStore},
        queue::QueueServices,
        storage::{PgResultTable, R2Client, ResultSink},
    },
};

const IDLE_EVICTION_INTERVAL: Duration = Duration::from_secs(600);

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing image-gen-queue server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    // Register application metrics
    metrics::describe_counter!("generation_jobs_total", "Generation jobs admitted");
    metrics::describe_counter!("generation_jobs_completed", "Generation jobs completed");
    metrics::describe_counter!("generation_jobs_failed", "Generation jobs that failed");
    metrics::describe_counter!("generation_jobs_cancelled", "Generation jobs cancelled");
    metrics::describe_counter!("generation_retries_total", "Upstream retries across all jobs");
    metrics::describe_gauge!("generation_queue_depth", "Pending jobs across all open queues");
    metrics::describe_histogram!(
        "generation_processing_seconds",
        "Time from job start to terminal state"
    );

    // Initialize database connection pool
    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Run database migrations
    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Load model registry
    let registry = match &config.model_registry_path {
        Some(path) => ModelRegistry::load(path).await,
        None => ModelRegistry::builtin(),
    }
    .expect("Failed to load model registry");
    tracing::info!(models = registry.len(), "Model registry loaded");

    // Initialize R2 storage client
    tracing::info!("Initializing R2 storage client");
    let r2_client = R2Client::new(
        &config.r2_bucket,
        &config.r2_endpoint,
        &config.r2_access_key,
        &config.r2_secret_key,
    )
    .expect("Failed to initialize R2 client");

    // Initialize queue state store
    let kv: Arc<dyn KvStore> = match &config.redis_url {
        Some(url) => {
            tracing::info!("Persisting queue state in Redis");
            Arc::new(RedisKvStore::new(url).expect("Failed to initialize Redis client"))
        }
        None => {
            tracing::info!(dir = %config.state_dir, "Persisting queue state on disk");
            Arc::new(
                FileKvStore::open(&config.state_dir)
                    .await
                    .expect("Failed to open queue state directory"),
            )
        }
    };

    // Initialize inference client
    let inference = HttpInferenceClient::new().expect("Failed to initialize inference client");
    let results = Arc::new(PgResultTable::new(db_pool.clone()));

    let services = QueueServices {
        registry: Arc::new(registry),
        ledger: Arc::new(PgCreditLedger::new(db_pool.clone())),
        credentials: CredentialRotator::new(Arc::new(PgCredentialStore::new(db_pool.clone()))),
        dispatcher: Arc::new(Dispatcher::new(Arc::new(inference))),
        sink: Arc::new(ResultSink::new(Arc::new(r2_client), results.clone())),
        kv,
    };

    // Resume queues left with work by the previous run
    let queues = QueueDirectory::new(services, config.job_timeout());
    queues
        .resume_persisted()
        .await
        .expect("Failed to resume persisted queues");

    // Create shared application state
    let state = AppState::new(db_pool, queues, results, &config.jwt_secret);

    // Periodically drop idle per-user queues
    let directory = state.queues.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(IDLE_EVICTION_INTERVAL);
        loop {
            ticker.tick().await;
            directory.evict_idle().await;
        }
    });

    // Build API routes
    let app = routes::api_router(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(64 * 1024)); // 64 KB limit

    tracing::info!("Starting image-gen-queue on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app).await.expect("Server error");
}
