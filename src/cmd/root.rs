//! Daemon startup wiring

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use imageci::build::BuildScheduler;
use imageci::config::Configuration;
use imageci::docker::ContainerController;
use imageci::events::EventBus;
use imageci::loopdev::LoopDeviceAllocator;
use imageci::orchestrator::{FixedHourTrigger, ReleaseOrchestrator};
use imageci::persist::BranchState;
use imageci::router::{self, AppState};
use imageci::s3::{BlobUploader, S3Client};
use imageci::service;

/// Run the daemon until a shutdown signal arrives.
pub async fn run(config: Configuration) -> Result<()> {
    let config = Arc::new(config);

    info!("  repository: {} ({})", config.git.repo, config.repo_service);
    info!("  boards: {}", config.boards.join(", "));
    info!("  output directory: {}", config.dirs.output.display());

    let state = Arc::new(BranchState::load(&config.dirs.persist)?);
    let events = EventBus::new();
    let loop_devs = Arc::new(LoopDeviceAllocator::new(
        config.loop_dev_range[0],
        config.loop_dev_range[1],
    ));
    let docker = Arc::new(ContainerController::new(&config, events.clone())?);
    let scheduler = Arc::new(BuildScheduler::new(
        config.clone(),
        events,
        docker.clone(),
        loop_devs,
    ));
    let repo_service = service::create(&config, scheduler.clone())?;

    let uploader: Option<Arc<dyn BlobUploader>> = if config.s3.enabled() {
        info!("  mirroring artifacts to s3://{}", config.s3.bucket);
        Some(Arc::new(S3Client::new(&config.s3, config.upload_request_timeout)?))
    } else {
        None
    };

    let orchestrator = Arc::new(ReleaseOrchestrator::new(
        config.clone(),
        scheduler.clone(),
        repo_service.clone(),
        state.clone(),
        uploader,
    ));

    let shutdown = CancellationToken::new();
    docker.spawn_loops(shutdown.clone());
    scheduler.spawn(shutdown.clone());
    orchestrator.spawn(shutdown.clone());
    FixedHourTrigger::new(config.clone(), state, orchestrator.clone()).spawn(shutdown.clone());

    let app = router::build_router(AppState {
        config: config.clone(),
        orchestrator,
        service: repo_service,
        docker,
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.web.port));
    info!("starting web server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install CTRL+C handler");
            warn!("received shutdown signal");
            shutdown.cancel();
        })
        .await?;

    info!("daemon stopped");
    Ok(())
}
