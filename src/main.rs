//! Dev Hub terminal relay
//!
//! `serve` runs the relay: one interactive process per project, bridged to a
//! WebSocket client and kept alive across short disconnects. `attach`
//! connects the local terminal to it.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use devhub_term::client::{self, SessionOptions, SessionState};
use devhub_term::config::RelayConfig;
use devhub_term::server::WebSocketServer;

/// Dev Hub terminal relay
///
/// Interactive terminal sessions over WebSocket
#[derive(Parser, Debug)]
#[command(name = "devhub-term")]
#[command(version, about, long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay
    Serve {
        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Bind address
        #[arg(long)]
        bind: Option<String>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Accepted token; repeat for several. Replaces tokens from the file
        #[arg(long = "token")]
        tokens: Vec<String>,

        /// Directory whose subdirectories are projects
        #[arg(long)]
        projects_root: Option<PathBuf>,

        /// Program to run in each project
        #[arg(long)]
        shell: Option<String>,
    },

    /// Attach this terminal to a project's session
    Attach {
        /// Relay socket endpoint
        #[arg(long, default_value = "ws://127.0.0.1:3002/ws")]
        url: String,

        /// Project to attach to
        #[arg(long)]
        project: String,

        /// Authentication token
        #[arg(long, env = "DEVHUB_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    // The attach view owns stdout, so it only logs problems
    let default_level = match (&args.command, args.verbose) {
        (_, true) => "debug",
        (Command::Attach { .. }, false) => "warn",
        (Command::Serve { .. }, false) => "info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    match args.command {
        Command::Serve {
            config,
            bind,
            port,
            tokens,
            projects_root,
            shell,
        } => {
            let mut relay_config = match config {
                Some(path) => RelayConfig::load(&path)?,
                None => RelayConfig::default(),
            };
            if let Some(bind) = bind {
                relay_config.server.bind = bind;
            }
            if let Some(port) = port {
                relay_config.server.port = port;
            }
            if !tokens.is_empty() {
                relay_config.auth.tokens = tokens;
            }
            if projects_root.is_some() {
                relay_config.projects_root = projects_root;
            }
            if let Some(shell) = shell {
                relay_config.session.command = shell;
            }

            serve(relay_config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Attach {
            url,
            project,
            token,
        } => {
            let state = client::attach::run(SessionOptions {
                endpoint: url,
                project_id: project,
                token,
            })
            .await?;

            Ok(if state == SessionState::Errored {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }
    }
}

async fn serve(config: RelayConfig) -> anyhow::Result<()> {
    info!("Dev Hub terminal relay v{}", env!("CARGO_PKG_VERSION"));
    let server = Arc::new(WebSocketServer::from_config(&config));
    let settings = server.relay().settings();
    info!(
        "Sessions run {} (idle window {:?})",
        settings.command,
        settings.idle_timeout()
    );
    let server_handle = Arc::clone(&server);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    server.run().await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
