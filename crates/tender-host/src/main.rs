//! tender-host: runs the import pipeline, the analysis worker, the result
//! listeners and the vectorization scheduler in one process.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use tender_bus::{BrokerConnector, EventBusConfig, TaskDispatcher};
use tender_core::{
    AnalysisRepository, NoticeRepository, QueryVectorRepository, QueueKind, SessionHub,
    UserNotifier,
};
use tender_db::{Database, MemoryDatabase};
use tender_ingest::{
    FolderImporter, ImportQueue, ImportWorker, IngestConfig, JsonNotificationParser,
    NoticeIngestor, ZipExtractor,
};
use tender_jobs::{
    AnalysisEngineConfig, AnalysisResultListener, AnalysisService, AnalysisWorker,
    NoticeVectorizer, NotificationRelay, OpenAiAnalysisEngine, QueryVectorConfig,
    QueryVectorService, VectorResultListener, VectorizerConfig, WorkerConfig,
};

/// Storage handles shared by every component.
struct Repositories {
    notices: Arc<dyn NoticeRepository>,
    analyses: Arc<dyn AnalysisRepository>,
    query_vectors: Arc<dyn QueryVectorRepository>,
}

async fn open_repositories() -> anyhow::Result<Repositories> {
    match std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()) {
        Some(url) => {
            info!("Connecting to database...");
            let pool_config = tender_db::PoolConfig::from_env();
            let db = Database::connect_with_config(&url, pool_config).await?;
            info!("Database connected");

            info!("Running database migrations...");
            db.migrate().await?;
            info!("Database migrations complete");

            Ok(Repositories {
                notices: Arc::new(db.notices.clone()),
                analyses: Arc::new(db.analyses.clone()),
                query_vectors: Arc::new(db.query_vectors.clone()),
            })
        }
        None => {
            warn!("DATABASE_URL not set, using in-memory storage");
            let db = MemoryDatabase::new();
            Ok(Repositories {
                notices: Arc::new(db.clone()),
                analyses: Arc::new(db.clone()),
                query_vectors: Arc::new(db),
            })
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
    //   RUST_LOG    - standard env filter (default: "tender=debug,info")
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "tender=debug,info".into());

    let registry = tracing_subscriber::registry().with(env_filter);

    let _file_guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("tender-host.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );

    let repos = open_repositories().await?;
    let cancel = CancellationToken::new();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // Broker. Deliveries must stay invisible for as long as an analysis may run.
    let engine_config = AnalysisEngineConfig::from_env();
    let bus_config = EventBusConfig::from_env()
        .with_min_ack_wait(Duration::from_secs(engine_config.timeout_seconds));
    let connector: Arc<dyn BrokerConnector> = bus_config.connector();
    let dispatcher = Arc::new(
        TaskDispatcher::from_config(connector.clone(), &bus_config).with_cancellation(cancel.clone()),
    );
    for kind in QueueKind::ALL {
        match dispatcher.queues().get(kind) {
            Some(name) => info!(queue = kind.as_str(), name, "Queue configured"),
            None => info!(queue = kind.as_str(), "Queue not configured"),
        }
    }

    let hub = SessionHub::default();
    let notifier: Arc<dyn UserNotifier> = Arc::new(hub.clone());

    // Import pipeline
    let ingest_config = IngestConfig::from_env();
    let ingestor = Arc::new(
        NoticeIngestor::new(repos.notices.clone(), Arc::new(JsonNotificationParser::new()))
            .with_policy(ingest_config.activation_policy),
    );
    let importer = Arc::new(
        FolderImporter::new(repos.notices.clone(), ingestor)
            .with_extension(ingest_config.file_extension.clone())
            .with_source(ingest_config.source.clone()),
    );
    let import_queue = ImportQueue::new(
        ingest_config.queue_capacity,
        &ingest_config.upload_cache_dir,
    )?;
    let import_worker = ImportWorker::new(
        Arc::new(ZipExtractor::new()),
        importer.clone(),
        &ingest_config.work_dir,
    );
    tasks.push(tokio::spawn(
        import_worker.run(import_queue.dequeue()?, cancel.clone()),
    ));
    info!(
        capacity = import_queue.capacity(),
        storage_dir = %import_queue.storage_dir().display(),
        "Import worker started"
    );

    if let Some(dir) = ingest_config.startup_import_dir.clone() {
        let importer = importer.clone();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            match importer.import(&dir, &cancel).await {
                Ok(summary) => info!(
                    directory = %dir.display(),
                    files = summary.files,
                    processed = summary.processed,
                    duplicates = summary.duplicates,
                    skipped = summary.skipped,
                    errors = summary.errors,
                    "Startup import finished"
                ),
                Err(e) => error!(
                    directory = %dir.display(),
                    error = %e,
                    "Startup import failed"
                ),
            }
        }));
    }

    // Task workers and listeners
    let worker_config = WorkerConfig::from_env();
    let query_vectors = Arc::new(QueryVectorService::new(
        repos.query_vectors.clone(),
        dispatcher.clone(),
        QueryVectorConfig::from_env(),
    ));

    if worker_config.enabled {
        let engine = Arc::new(OpenAiAnalysisEngine::new(engine_config)?);
        let analysis = Arc::new(
            AnalysisService::new(
                repos.analyses.clone(),
                repos.notices.clone(),
                engine,
                dispatcher.clone(),
            )
            .with_stuck_timeout(worker_config.stuck_timeout()),
        );

        if let Some(queue) = dispatcher.queues().get(QueueKind::AnalysisRequest) {
            let consumer =
                AnalysisWorker::new(analysis).consumer(connector.clone(), queue, &worker_config);
            tasks.push(tokio::spawn(consumer.run(cancel.clone())));
            info!(queue, "Analysis worker started");
        } else {
            info!("Analysis request queue not configured, analysis worker disabled");
        }

        if let Some(queue) = dispatcher.queues().get(QueueKind::AnalysisResult) {
            let relay = NotificationRelay::new(repos.analyses.clone(), notifier.clone());
            let consumer = AnalysisResultListener::new(relay).consumer(
                connector.clone(),
                queue,
                &worker_config,
            );
            tasks.push(tokio::spawn(consumer.run(cancel.clone())));
            info!(queue, "Analysis result listener started");
        }

        if let Some(queue) = dispatcher.queues().get(QueueKind::VectorResult) {
            let consumer = VectorResultListener::new(
                repos.notices.clone(),
                query_vectors.clone(),
                notifier.clone(),
            )
            .consumer(connector.clone(), queue, &worker_config);
            tasks.push(tokio::spawn(consumer.run(cancel.clone())));
            info!(queue, "Vector result listener started");
        }
    } else {
        info!("Task workers disabled");
    }

    // Vectorization scheduler
    let vectorizer = NoticeVectorizer::new(
        repos.notices.clone(),
        dispatcher.clone(),
        VectorizerConfig::from_env(),
    );
    tasks.push(tokio::spawn(vectorizer.run(cancel.clone())));

    info!(tasks = tasks.len(), "tender-host running, press Ctrl+C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown requested");
    cancel.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "Background task ended abnormally");
        }
    }
    dispatcher.close().await;
    info!(pending_query_vectors = query_vectors.pending_count(), "tender-host stopped");
    Ok(())
}
