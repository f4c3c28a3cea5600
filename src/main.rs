use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use portico::config::{self, Config};
use portico::route::RouteTable;
use portico::server::{Gateway, GatewayServer};

const EXIT_CODES_HELP: &str = "\
Exit codes:
   1 - Configuration path not provided
   2 - Configuration file either not found or cannot be read
   3 - Configuration file cannot be parsed or is invalid
   4 - Server directory is either not valid or not a directory
   5 - Not all proxy/plugin URL prefixes are unique
";

/// A small webserver that serves a local directory and routes configured
/// URL prefixes to reverse proxies or plugin programs.
#[derive(Parser, Debug)]
#[command(name = "portico", version, about, after_help = EXIT_CODES_HELP)]
struct Args {
    /// Path to the gateway configuration (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory served by the webserver for unrouted paths
    #[arg(long, default_value = ".")]
    server_dir: PathBuf,

    /// Port the webserver is listening on
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Enable debug logging on stdout
    #[arg(long)]
    debug_mode: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let directive = if args.debug_mode {
        "portico=debug"
    } else {
        "portico=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(directive.parse().expect("valid log directive")),
        )
        .init();

    let Some(config_path) = args.config else {
        error!("Please provide a configuration path");
        process::exit(config::EXIT_CONFIG_PATH);
    };

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            process::exit(e.exit_code());
        }
    };

    let server_dir = match config::resolve_server_dir(&args.server_dir) {
        Ok(dir) => dir,
        Err(e) => {
            error!(error = %e, "Invalid server directory");
            process::exit(e.exit_code());
        }
    };

    let routes = config.build_routes()?;
    log_routes(&routes);

    let gateway = Arc::new(Gateway {
        routes,
        server_dir: server_dir.clone(),
        port: args.port,
    });

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let bind_addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let server = GatewayServer::new(bind_addr, Arc::clone(&gateway), shutdown_rx);

    info!(dir = %server_dir.display(), port = args.port, "Serving");
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

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
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown; the server drains in-flight requests with a bound.
    let _ = shutdown_tx.send(true);
    let _ = server_handle.await;

    info!("Shutdown complete");
    Ok(())
}

fn log_routes(routes: &RouteTable) {
    info!("Configured routes:");
    for (prefix, route) in routes.iter() {
        info!(" - {} => {}", prefix, route.target());
    }
}
