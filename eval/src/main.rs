// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Evaluation pipeline CLI for ChEBI class prediction models
//!
//! Usage:
//!   eval-pipeline --synthetic --seed 42
//!   eval-pipeline --data-dir data/chebi_v200 --checkpoint best.json --reference-classes data/chebi_v148/processed/classes.txt

use anyhow::Result;
use chebai_eval::metrics::{ReportFormat, ZeroSupportPolicy};
use chebai_eval::model::Device;
use chebai_eval::pipeline::{EvaluationConfig, EvaluationPipeline};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "eval-pipeline")]
#[command(about = "Evaluate multi-label ChEBI class prediction models")]
#[command(version)]
struct Args {
    /// JSON config file; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Evaluate a generated dataset and checkpoint
    #[arg(long)]
    synthetic: bool,

    /// Random seed for the synthetic dataset
    #[arg(short, long)]
    seed: Option<u64>,

    /// Dataset root containing processed/
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Model checkpoint
    #[arg(short = 'm', long)]
    checkpoint: Option<PathBuf>,

    /// Processed file to evaluate instead of test.json
    #[arg(long)]
    file_name: Option<String>,

    /// Class file of the evaluated dataset
    #[arg(long)]
    classes: Option<PathBuf>,

    /// Class file of another dataset version; only shared classes are scored
    #[arg(short, long)]
    reference_classes: Option<PathBuf>,

    /// Compute device (cpu, cuda, cuda:N)
    #[arg(long)]
    device: Option<Device>,

    /// Examples per batch
    #[arg(short, long)]
    batch_size: Option<usize>,

    /// Persist batch predictions here and reload them
    #[arg(long)]
    buffer_dir: Option<PathBuf>,

    /// Probability threshold for a positive prediction
    #[arg(short, long)]
    threshold: Option<f32>,

    /// Treatment of classes with no labels and no predictions (exclude, zero)
    #[arg(long)]
    zero_support: Option<ZeroSupportPolicy>,

    /// Number of best classes to list (0 disables the ranking)
    #[arg(short = 'k', long)]
    top_k: Option<usize>,

    /// Subclass edges as child,parent CSV
    #[arg(long)]
    hierarchy: Option<PathBuf>,

    /// Disjointness axioms as left,right CSV
    #[arg(long)]
    disjointness: Option<PathBuf>,

    /// Output directory for results
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Console report format (text, markdown, json)
    #[arg(short, long)]
    format: Option<ReportFormat>,

    /// Files to save (json, markdown, both, none)
    #[arg(long, default_value = "both")]
    save: String,

    /// Hide the progress bar
    #[arg(long)]
    no_progress: bool,
}

impl Args {
    fn into_config(self) -> Result<EvaluationConfig> {
        let mut config = match &self.config {
            Some(path) => EvaluationConfig::from_file(path)?,
            None => EvaluationConfig::default(),
        };

        config.synthetic |= self.synthetic;
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if self.data_dir.is_some() {
            config.data_dir = self.data_dir;
        }
        if self.checkpoint.is_some() {
            config.checkpoint = self.checkpoint;
        }
        if self.file_name.is_some() {
            config.file_name = self.file_name;
        }
        if self.classes.is_some() {
            config.classes = self.classes;
        }
        if self.reference_classes.is_some() {
            config.reference_classes = self.reference_classes;
        }
        if let Some(device) = self.device {
            config.device = device;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if self.buffer_dir.is_some() {
            config.buffer_dir = self.buffer_dir;
        }
        if let Some(threshold) = self.threshold {
            config.threshold = threshold;
        }
        if let Some(policy) = self.zero_support {
            config.zero_support = policy;
        }
        if let Some(k) = self.top_k {
            config.top_k = (k > 0).then_some(k);
        }
        if self.hierarchy.is_some() {
            config.hierarchy = self.hierarchy;
        }
        if self.disjointness.is_some() {
            config.disjointness = self.disjointness;
        }
        if let Some(output) = self.output {
            config.output_dir = output;
        }
        if let Some(format) = self.format {
            config.format = format;
        }
        if self.no_progress {
            config.show_progress = false;
        }

        Ok(config)
    }
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let save = args.save.clone();
    let config = args.into_config()?;

    tracing::info!("ChEBI Class Prediction Evaluation Pipeline");
    tracing::info!("==========================================");
    tracing::info!("Device: {}", config.device);
    tracing::info!("Batch size: {}", config.batch_size);
    if let Some(ref reference) = config.reference_classes {
        tracing::info!("Reference classes: {}", reference.display());
    }

    let pipeline = EvaluationPipeline::new(config.clone());
    let results = pipeline.run()?;

    println!("\n{}", "=".repeat(70));
    println!("EVALUATION SUMMARY");
    println!("{}", "=".repeat(70));
    println!("{}", results.report.render(config.format)?);

    if let Some(ref consistency) = results.consistency {
        println!("{}", consistency.format());
    }

    // Save outputs
    if save != "none" {
        std::fs::create_dir_all(&config.output_dir)?;
    }

    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let label = if config.synthetic { "synthetic" } else { "chebi" };

    if save == "json" || save == "both" {
        let json_path = config.output_dir.join(format!("eval_{}_{}.json", label, timestamp));
        EvaluationPipeline::save_results(&results, &json_path)?;
        println!("\nJSON results saved to: {}", json_path.display());
    }

    if save == "markdown" || save == "both" {
        let report = EvaluationPipeline::generate_report(&results);
        let md_path = config.output_dir.join(format!("eval_{}_{}.md", label, timestamp));
        std::fs::write(&md_path, report)?;
        println!("Markdown report saved to: {}", md_path.display());
    }

    println!("\nEvaluation complete!");

    Ok(())
}
