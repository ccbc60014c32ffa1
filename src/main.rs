use std::sync::Arc;

use clap::{Parser, Subcommand};
use stateful_provisioner::cluster;
use stateful_provisioner::config::Config;
use stateful_provisioner::controller::{Controller, ControllerSettings, TypeRegistry};
use stateful_provisioner::http;
use stateful_provisioner::store::{self, PgStore};
use stateful_provisioner::{telemetry, Error};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller (default)
    Run(Box<Config>),
    /// Show version information
    Version,
    /// Validate the configuration and print it with secrets redacted
    CheckConfig(Box<Config>),
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Some(Commands::Version) => {
            println!("provisioner-controller v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::CheckConfig(config)) => {
            config.validate()?;
            println!("{}", config.summary());
            Ok(())
        }
        Some(Commands::Run(config)) => run_controller(*config).await,
        None => run_controller(Config::from_env()?).await,
    }
}

async fn run_controller(config: Config) -> Result<(), Error> {
    config.validate()?;
    telemetry::init_tracing(&config.logging)?;

    info!(
        "Starting provisioner-controller v{}",
        env!("CARGO_PKG_VERSION")
    );

    let pool = store::connect(&config.database).await?;
    let store = Arc::new(PgStore::new(pool));
    let cluster = Arc::new(cluster::connect(&config.cluster.connection()).await?);
    let registry = Arc::new(TypeRegistry::load(config.resource_types_file.as_deref())?);
    info!(
        "Supported resource types: {}",
        registry.names().collect::<Vec<_>>().join(", ")
    );

    // Bind before starting the controller so a taken port fails startup
    let endpoints = &config.endpoints;
    let mut listeners = Vec::new();
    if endpoints.health_enabled {
        let listener = http::bind("health", endpoints.health_port).await?;
        listeners.push(("health", listener, http::health_router()));
    }
    if endpoints.metrics_enabled {
        let listener = http::bind("metrics", endpoints.metrics_port).await?;
        listeners.push(("metrics", listener, http::metrics_router()));
    }

    let controller = Controller::new(
        ControllerSettings::from_config(&config),
        store,
        cluster,
        registry,
    );
    controller.start().await?;

    let shutdown = CancellationToken::new();
    let servers: Vec<JoinHandle<()>> = listeners
        .into_iter()
        .map(|(name, listener, app)| {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = http::serve(name, listener, app, shutdown).await {
                    error!("{} server failed: {}", name, e);
                }
            })
        })
        .collect();

    wait_for_signal().await;
    info!("Shutdown signal received");

    controller.stop().await;
    shutdown.cancel();
    for server in servers {
        if let Err(e) = server.await {
            error!("HTTP server task panicked: {}", e);
        }
    }

    info!("provisioner-controller exited cleanly");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
