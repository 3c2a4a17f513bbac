use craftgate::api::ApiServer;
use craftgate::archive::ArchiveService;
use craftgate::config::Config;
use craftgate::controller::WorkloadController;
use craftgate::docker::DockerEngine;
use craftgate::events::EventBus;
use craftgate::jobs::JobManager;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("craftgate=debug".parse()?),
        )
        .init();

    // `craftgate [regenerate] [config.toml]`
    let mut args = std::env::args().skip(1).peekable();
    let regenerate = args.peek().map(|a| a == "regenerate").unwrap_or(false);
    if regenerate {
        args.next();
    }
    let config_path = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("craftgate.toml"));

    let mut config = Config::load_or_default(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    config.apply_env_overrides();
    config.validate()?;

    // Archive tools run with the server directory as cwd
    if config.paths.data_dir.is_relative() {
        config.paths.data_dir = std::env::current_dir()?.join(&config.paths.data_dir);
    }

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let engine = Arc::new(
        DockerEngine::new(config.docker.host.as_deref(), config.docker.pull_policy.clone()).await?,
    );
    let events = EventBus::new(config.server.event_buffer);
    let controller = WorkloadController::new(&config, engine, events.clone());

    if regenerate {
        let count = controller.regenerate_all().await?;
        info!(count, "Regenerated container definitions");
        return Ok(());
    }

    controller.initialize().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let jobs = JobManager::new(events);
    let archives = ArchiveService::new(controller.artifacts().clone(), jobs);

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", config.server.bind, e))?;
    let api = ApiServer::new(bind_addr, Arc::clone(&controller), archives, shutdown_rx);

    let api_handle = tokio::spawn(async move {
        if let Err(e) = api.run().await {
            error!(error = %e, "API server error");
        }
    });

    wait_for_shutdown().await?;

    // Signal shutdown
    let _ = shutdown_tx.send(true);
    if let Err(e) = api_handle.await {
        warn!(error = %e, "API server task ended abnormally");
    }

    // Game servers are left running; they are independent containers
    info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
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

    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting server manager");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        data_dir = %config.paths.data_dir.display(),
        host_data_dir = %config.paths.host_data_dir().display(),
        "Server configuration"
    );
    match config.domain.mc_domain() {
        Some(mc_domain) => info!(
            mc_domain = %mc_domain,
            network = %config.docker.network,
            router = %config.router.container,
            "Routing configuration"
        ),
        None => warn!("BASE_DOMAIN is not set; servers cannot be created or started until it is"),
    }
    info!(
        stop_timeout_secs = config.lifecycle.stop_timeout_secs,
        restart_wait_secs = config.lifecycle.restart_wait_secs,
        "Lifecycle settings"
    );
}
