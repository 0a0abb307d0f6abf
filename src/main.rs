use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::anyhow;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use voxhost::{
    ServerConfig, create_app,
    protocol::{check_file, export_contract},
    state::AppState,
};

/// voxhost - self-hosted speech and LLM inference server
#[derive(Parser, Debug)]
#[command(name = "voxhost")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Subcommand to run (defaults to `serve`)
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the WebSocket server
    Serve,

    /// Work with the realtime message contract
    Contract {
        #[command(subcommand)]
        action: ContractAction,
    },
}

#[derive(Subcommand, Debug)]
enum ContractAction {
    /// Write the contract document as JSON
    Export {
        /// Output file path (prints to stdout if not specified)
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
    },

    /// Validate sample payload files against the contract
    Check {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Contract { action }) => return run_contract(action),
        Some(Commands::Serve) | None => {}
    }

    // Load configuration from file or environment
    let config = if let Some(config_path) = cli.config {
        info!(path = %config_path.display(), "Loading configuration");
        ServerConfig::from_file(&config_path).map_err(|e| anyhow!(e.to_string()))?
    } else {
        ServerConfig::from_env().map_err(|e| anyhow!(e.to_string()))?
    };

    if !config.accepts_connections() {
        warn!(
            host = %config.host,
            "No auth token set for a non-loopback bind; every connection will be refused"
        );
    }

    let address = config.address();
    let load_models = config.load_models_on_start;
    let app_state = AppState::new(config);

    if load_models {
        let manager = app_state.manager.clone();
        tokio::spawn(async move {
            manager.load_initial().await;
        });
    }

    let app = create_app(app_state);

    let socket_addr: SocketAddr = address
        .parse()
        .map_err(|e| anyhow!("Invalid server address '{}': {}", address, e))?;

    let listener = TcpListener::bind(&socket_addr).await?;
    info!(address = %socket_addr, "Server listening on ws://{}/ws", socket_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(ExitCode::SUCCESS)
}

fn run_contract(action: ContractAction) -> anyhow::Result<ExitCode> {
    match action {
        ContractAction::Export { output } => {
            if let Some(output_path) = output {
                export_contract(&output_path).map_err(|e| {
                    anyhow!("Failed to write to {}: {}", output_path.display(), e)
                })?;
                println!("Contract written to {}", output_path.display());
            } else {
                let document = voxhost::protocol::contract_document();
                println!("{}", serde_json::to_string_pretty(&document)?);
            }
            Ok(ExitCode::SUCCESS)
        }
        ContractAction::Check { files } => {
            let mut failures = 0usize;
            for path in &files {
                match check_file(path) {
                    Ok(count) => println!("ok   {} ({} messages)", path.display(), count),
                    Err(e) => {
                        failures += 1;
                        error!(error = %e, "Contract check failed");
                        println!("FAIL {e}");
                    }
                }
            }
            if failures > 0 {
                println!("{failures} of {} files failed", files.len());
                Ok(ExitCode::FAILURE)
            } else {
                Ok(ExitCode::SUCCESS)
            }
        }
    }
}
