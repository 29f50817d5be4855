use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use rehostd::config::Settings;
use rehostd::database;
use rehostd::delivery::{
    DeliveryDispatcher, DeliveryTransport, HttpDeliveryTransport, ResultRouter,
};
use rehostd::locator::HttpLocatorClient;
use rehostd::logging;
use rehostd::pipeline::{
    ConcurrencyGovernor, JobQueue, ProgressNotifier, SqlxFingerprintStore, SqlxJobStore, WorkerPool,
};
use rehostd::transcode::FfmpegTranscoder;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::from_env()?;

    tokio::fs::create_dir_all(&settings.download_dir).await?;
    let _log_guard = logging::init_logging(&settings.log_dir)?;

    info!("rehostd starting");

    let pool = database::init_pool(&settings.database_url).await?;
    database::run_schema(&pool).await?;

    let queue = Arc::new(JobQueue::new(
        Arc::new(SqlxJobStore::new(pool.clone())),
        settings.queue.clone(),
    ));
    let fingerprints = Arc::new(SqlxFingerprintStore::new(pool.clone()));

    let governor = Arc::new(ConcurrencyGovernor::new(settings.governor.clone()));
    let locator = Arc::new(HttpLocatorClient::new(settings.locator_api_url.clone()));
    let transcoder = Arc::new(FfmpegTranscoder::new(settings.ffmpeg_path.clone()));

    let transport: Arc<dyn DeliveryTransport> = Arc::new(HttpDeliveryTransport::new(
        settings.delivery_api_url.clone(),
        settings.canonical_identity.clone(),
    ));
    let dispatcher = Arc::new(DeliveryDispatcher::new(
        &settings.delivery_identities,
        transport.clone(),
        settings.dispatcher.clone(),
    ));
    let router = Arc::new(ResultRouter::new(
        transport,
        settings.canonical_identity.clone(),
    ));
    let notifier = Arc::new(ProgressNotifier::new(settings.notifier.clone()));

    let pool_handle = Arc::new(WorkerPool::new(
        queue.clone(),
        fingerprints,
        governor.clone(),
        locator,
        transcoder,
        dispatcher,
        router,
        notifier,
        settings.worker.clone(),
        settings.download_dir.clone(),
    ));

    let shutdown = CancellationToken::new();
    governor.clone().start(shutdown.clone());
    logging::start_retention_cleanup(settings.log_dir.clone(), shutdown.clone());
    let mut workers = pool_handle.spawn(shutdown.clone());

    info!(
        workers = settings.governor.max_workers,
        credentials = settings.delivery_identities.len(),
        "rehostd running"
    );

    shutdown_signal().await;
    info!("Shutdown signal received, draining workers");
    shutdown.cancel();

    while let Some(result) = workers.join_next().await {
        if let Err(e) = result {
            error!("Worker task panicked: {e}");
        }
    }

    info!("rehostd stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
