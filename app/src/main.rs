use app::{envelope, ExecutionMode, Kernel};
use clap::{Parser, Subcommand};
use ko_config::Config;
use ko_core::telemetry;
use ko_manager::Quality;
use std::process;

#[derive(Parser)]
#[command(name = "kompost")]
#[command(about = "kompost video-processing server kernel")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the kernel and wait for the MCP transport (default)
    Start,
    /// One-shot zombie-process scan, printed as JSON
    ScanZombies,
    /// Estimate processing time for a description
    Estimate {
        description: String,
        #[arg(long, default_value = "standard")]
        quality: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    telemetry::init_tracing("development", "kompost");

    // Load configuration - exit with non-zero if invalid
    let config = match Config::load() {
        Ok(config) => {
            tracing::debug!(?config, "Configuration loaded successfully");
            config
        }
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let kernel = match Kernel::new(config) {
        Ok(kernel) => kernel,
        Err(e) => {
            tracing::error!("Failed to initialize kernel: {}", e);
            process::exit(1);
        }
    };

    match cli.command.unwrap_or(Commands::Start) {
        Commands::Start => {
            tracing::info!("kompost kernel ready; tool surface awaiting transport");
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                process::exit(1);
            }
            tracing::info!("Shutting down");
            let summary = kernel.cleanup_partial_operations().await;
            tracing::info!(
                removed = summary.removed_files.len(),
                "Shutdown cleanup finished"
            );
        }
        Commands::ScanZombies => {
            let records = kernel.scan_zombie_processes();
            match serde_json::to_string_pretty(&records) {
                Ok(json) => println!("{}", json),
                Err(e) => {
                    tracing::error!("Failed to serialize scan: {}", e);
                    process::exit(1);
                }
            }
        }
        Commands::Estimate {
            description,
            quality,
        } => {
            let quality = match quality.as_str() {
                "draft" => Quality::Draft,
                "high" => Quality::High,
                _ => Quality::Standard,
            };
            let estimate =
                kernel.estimate_processing_time(&description, ExecutionMode::Full, quality);
            println!("{}", envelope(Ok(estimate)));
        }
    }
}
