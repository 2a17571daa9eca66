//! Performance and collection statistics commands

use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;

use crate::client::{ApiClient, CollectionStatistics, PerformanceStats};
use crate::output::{
    color_confidence, color_status, format_confidence, format_duration_ms, format_timestamp,
    format_unix, print_json, print_table, print_warning, OutputFormat,
};

/// Row for the backend performance table
#[derive(Tabled)]
struct BackendRow {
    #[tabled(rename = "Backend")]
    backend: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Weight")]
    weight: String,
    #[tabled(rename = "Predictions")]
    predictions: u64,
    #[tabled(rename = "Success")]
    success_rate: String,
    #[tabled(rename = "Confidence")]
    confidence: String,
    #[tabled(rename = "Avg Time")]
    avg_time: String,
    #[tabled(rename = "Last Probe")]
    last_probe: String,
}

/// Row for the per-material record table
#[derive(Tabled)]
struct MaterialRow {
    #[tabled(rename = "Material")]
    material: String,
    #[tabled(rename = "Records")]
    records: u64,
}

/// Show per-backend performance and current weights
pub async fn show_stats(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let stats: PerformanceStats = client.stats().await?;

    match format {
        OutputFormat::Json => print_json(&stats)?,
        OutputFormat::Table => {
            println!("{}", "Ensemble Performance".bold());
            println!("{}", "=".repeat(60));
            println!("Total predictions: {}", stats.total_predictions);
            println!(
                "Healthy backends:  {}/{}",
                stats.healthy_backends,
                stats.backends.len()
            );
            println!(
                "Avg confidence:    {}",
                color_confidence(stats.overall_average_confidence)
            );
            println!(
                "Avg backend time:  {}",
                format_duration_ms(stats.overall_average_processing_time_ms)
            );
            println!();

            let rows = stats
                .backends
                .iter()
                .map(|(name, b)| BackendRow {
                    backend: name.clone(),
                    status: color_status(if b.is_healthy { "healthy" } else { "unhealthy" }),
                    weight: format_confidence(b.current_weight),
                    predictions: b.prediction_count,
                    success_rate: format_confidence(b.success_rate),
                    confidence: color_confidence(b.average_confidence),
                    avg_time: format_duration_ms(b.average_processing_time_ms),
                    last_probe: format_unix(b.last_health_check),
                })
                .collect();
            print_table::<BackendRow>(rows);
        }
    }

    Ok(())
}

/// Show learning-record collection statistics
pub async fn show_collection(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let stats: CollectionStatistics = client.collection().await?;

    match format {
        OutputFormat::Json => print_json(&stats)?,
        OutputFormat::Table => {
            println!("{}", "Training Data Collection".bold());
            println!("{}", "=".repeat(50));
            println!("Total records:    {}", stats.total_records);
            println!("Fallback records: {}", stats.fallback_records);
            println!("Manual records:   {}", stats.manual_records);
            println!("Avg confidence:   {}", color_confidence(stats.average_confidence));
            println!(
                "Last record:      {}",
                stats
                    .last_record_at
                    .as_deref()
                    .map(format_timestamp)
                    .unwrap_or_else(|| "never".to_string())
            );
            if stats.dropped_records > 0 {
                print_warning(&format!(
                    "{} records were dropped before reaching storage",
                    stats.dropped_records
                ));
            }
            println!();

            let rows = stats
                .records_by_material
                .iter()
                .map(|(material, records)| MaterialRow {
                    material: material.clone(),
                    records: *records,
                })
                .collect();
            print_table::<MaterialRow>(rows);
        }
    }

    Ok(())
}
