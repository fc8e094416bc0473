//! tcp-harness binary: `serve` runs the stub server, `swarm` drives
//! virtual users against it and prints a summary.

use tcp_harness::config::{Config, Mode, ServerConfig, SwarmConfig};
use tcp_harness::server::StubServer;
use tcp_harness::{swarm, telemetry};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    telemetry::init_from_env();

    let result = match config.mode {
        Mode::Serve(server) => run_server(server).await,
        Mode::Swarm(swarm) => run_swarm(swarm).await,
    };

    telemetry::shutdown();
    result
}

/// Run the stub server until Ctrl-C
async fn run_server(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        host = %config.host,
        port = config.port,
        latency = ?config.latency,
        seed = ?config.seed,
        "Starting stub server"
    );

    let server = StubServer::bind(config).await?;
    server
        .serve(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

/// Run the swarm and print the summary
async fn run_swarm(config: SwarmConfig) -> Result<(), Box<dyn std::error::Error>> {
    let summary = tokio::select! {
        summary = swarm::run(config, None) => summary?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            return Ok(());
        }
    };

    println!("{summary}");
    Ok(())
}
