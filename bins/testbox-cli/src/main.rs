mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "testbox-cli")]
#[command(about = "Testbox CLI - Run submissions and manage custom images against the local Docker daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a submission described by a POST /run JSON body
    Run {
        /// Path to the request JSON ("-" reads stdin)
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Build a named custom image with libraries baked in
    BuildImage {
        /// Image name (e.g., team-numpy)
        #[arg(short, long)]
        name: String,

        /// Library requirement, repeatable (e.g., --lib numpy --lib "pandas>=2")
        #[arg(short, long = "lib")]
        libs: Vec<String>,
    },

    /// Remove a custom image
    RemoveImage {
        #[arg(short, long)]
        name: String,
    },

    /// Show the lifecycle state of a custom image
    ImageStatus {
        #[arg(short, long)]
        name: String,
    },

    /// Remove abandoned run containers once
    Reap,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { file } => {
            commands::run_submission(&file).await?;
        }
        Commands::BuildImage { name, libs } => {
            commands::build_image(&name, &libs).await?;
        }
        Commands::RemoveImage { name } => {
            commands::remove_image(&name).await?;
        }
        Commands::ImageStatus { name } => {
            commands::image_status(&name).await?;
        }
        Commands::Reap => {
            commands::reap().await?;
        }
    }

    Ok(())
}
