//! Scrap Weight Estimator CLI
//!
//! A command-line tool for requesting weight estimates and inspecting
//! backend performance, health and training-data collection.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{health, predict, stats};
use std::path::PathBuf;

/// Scrap Weight Estimator CLI
#[derive(Parser)]
#[command(name = "westimate")]
#[command(author, version, about = "CLI for the Scrap Weight Estimator", long_about = None)]
pub struct Cli {
    /// API endpoint URL (can also be set via WESTIMATE_API_URL env var)
    #[arg(long, env = "WESTIMATE_API_URL")]
    pub api_url: Option<String>,

    /// Output format
    #[arg(long, short)]
    pub format: Option<output::OutputFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Estimate the weight of scrap in a raw RGB image
    Predict {
        /// File holding row-major 8-bit pixels
        #[arg(long)]
        raw: PathBuf,

        /// Image width in pixels
        #[arg(long)]
        width: u32,

        /// Image height in pixels
        #[arg(long)]
        height: u32,

        /// Bytes per pixel (1, 3 or 4)
        #[arg(long, default_value_t = 3)]
        channels: u8,

        /// Material (steel, aluminum, copper, brass, mixed_scrap)
        #[arg(long, short)]
        material: Option<String>,

        /// Manual weight estimate in pounds
        #[arg(long)]
        manual: Option<f64>,

        /// Report accelerated compute support
        #[arg(long)]
        accelerated: bool,
    },

    /// Show per-backend performance and ensemble weights
    Stats,

    /// Show training-data collection statistics
    Collection,

    /// Show service and backend health
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load()?;

    let format = config.resolve_format(cli.format);
    let client = client::ApiClient::new(&config.resolve_api_url(cli.api_url))?;

    // Execute command
    match cli.command {
        Commands::Predict {
            raw,
            width,
            height,
            channels,
            material,
            manual,
            accelerated,
        } => {
            let args = predict::PredictArgs {
                raw: &raw,
                width,
                height,
                channels,
                material: material.or(config.default_material.clone()),
                manual,
                accelerated,
            };
            predict::predict(&client, args, format).await?;
        }
        Commands::Stats => stats::show_stats(&client, format).await?,
        Commands::Collection => stats::show_collection(&client, format).await?,
        Commands::Health => health::show_health(&client, format).await?,
    }

    Ok(())
}
