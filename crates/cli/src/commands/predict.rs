//! Prediction command

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use colored::Colorize;
use std::path::Path;

use crate::client::{ApiClient, PredictRequest, WeightEstimate};
use crate::output::{
    color_confidence, color_status, format_weight, print_info, print_json, print_warning,
    OutputFormat,
};

/// Raw pixel upload parameters
pub struct PredictArgs<'a> {
    pub raw: &'a Path,
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub material: Option<String>,
    pub manual: Option<f64>,
    pub accelerated: bool,
}

/// Build the request body from a raw pixel file
pub fn build_request(args: &PredictArgs<'_>, pixels: &[u8]) -> PredictRequest {
    PredictRequest {
        width: args.width,
        height: args.height,
        channels: args.channels,
        pixels: STANDARD.encode(pixels),
        material: args.material.clone(),
        manual_estimate: args.manual,
        accelerated: args.accelerated,
    }
}

/// Byte length of a `width x height x channels` buffer, `None` on overflow
pub fn expected_len(width: u32, height: u32, channels: u8) -> Option<usize> {
    (width as usize)
        .checked_mul(height as usize)?
        .checked_mul(channels as usize)
}

/// Upload a raw image and print the estimate
pub async fn predict(client: &ApiClient, args: PredictArgs<'_>, format: OutputFormat) -> Result<()> {
    let pixels = tokio::fs::read(args.raw)
        .await
        .with_context(|| format!("Failed to read {}", args.raw.display()))?;

    match expected_len(args.width, args.height, args.channels) {
        Some(expected) if pixels.len() != expected => print_warning(&format!(
            "{} holds {} bytes, expected {} for {}x{}x{}",
            args.raw.display(),
            pixels.len(),
            expected,
            args.width,
            args.height,
            args.channels
        )),
        Some(_) => {}
        None => print_warning(&format!(
            "{}x{}x{} does not describe an addressable image",
            args.width, args.height, args.channels
        )),
    }
    if args.material.is_none() {
        print_info("No material given, the service will use manual mode");
    }

    let estimate = client.predict(&build_request(&args, &pixels)).await?;

    match format {
        OutputFormat::Json => print_json(&estimate)?,
        OutputFormat::Table => print_estimate(&estimate),
    }

    Ok(())
}

fn print_estimate(estimate: &WeightEstimate) {
    println!("{}", "Weight Estimate".bold());
    println!("{}", "=".repeat(50));
    println!("Weight:     {}", format_weight(estimate.estimated_weight).cyan().bold());
    println!("Confidence: {}", color_confidence(estimate.confidence));
    println!("Method:     {}", color_status(&estimate.method));
    println!("Models:     {}", estimate.model_count);
    if estimate.is_fallback {
        print_warning("Built from fallback output only");
    }

    if !estimate.factors.is_empty() {
        println!("\n{}", "Factors".bold());
        for factor in &estimate.factors {
            println!("  • {}", factor);
        }
    }

    if !estimate.suggestions.is_empty() {
        println!("\n{}", "Suggestions".bold());
        for suggestion in &estimate.suggestions {
            println!("  → {}", suggestion);
        }
    }
}
