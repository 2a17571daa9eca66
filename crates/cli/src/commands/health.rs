//! Service health command

use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;

use crate::client::{ApiClient, HealthReport};
use crate::output::{
    color_confidence, color_status, format_confidence, format_unix, print_json, print_success,
    print_table, print_warning, OutputFormat,
};

#[derive(Tabled)]
struct BackendHealthRow {
    #[tabled(rename = "Backend")]
    backend: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Predictions")]
    predictions: u64,
    #[tabled(rename = "Success")]
    success_rate: String,
    #[tabled(rename = "Confidence")]
    confidence: String,
    #[tabled(rename = "Last Probe")]
    last_probe: String,
}

/// Show overall, component and backend health
pub async fn show_health(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let report: HealthReport = client.health().await?;

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => {
            println!("{}", "Estimator Health".bold());
            println!("{}", "=".repeat(50));
            println!("Status: {}", color_status(&report.status));
            println!();

            for (name, component) in &report.components {
                match &component.message {
                    Some(message) => {
                        print_warning(&format!("{} {}: {}", name, color_status(&component.status), message))
                    }
                    None => print_success(&format!("{} {}", name, color_status(&component.status))),
                }
            }
            if !report.components.is_empty() {
                println!();
            }

            let rows = report
                .backends
                .iter()
                .map(|(name, b)| BackendHealthRow {
                    backend: name.clone(),
                    status: color_status(&b.status),
                    predictions: b.prediction_count,
                    success_rate: format_confidence(b.success_rate),
                    confidence: color_confidence(b.average_confidence),
                    last_probe: format_unix(b.last_health_check),
                })
                .collect();
            print_table::<BackendHealthRow>(rows);
        }
    }

    Ok(())
}
