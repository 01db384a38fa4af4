// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Metrics report from a persisted evaluation buffer
//!
//! Rebuilds the prediction and label tensors written by
//! `eval-pipeline --buffer-dir` and reports on them without rerunning the model.

use anyhow::{bail, Result};
use chebai_eval::inference::load_buffer;
use chebai_eval::metrics::{MetricsOptions, MetricsReport, MultilabelMetrics, ReportFormat, ZeroSupportPolicy};
use chebai_eval::vocab::{align_files, ClassVocabulary};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "buffer-report")]
#[command(about = "Report metrics from an evaluation buffer directory")]
#[command(version)]
struct Args {
    /// Buffer directory with predsNNNNN.json / labelsNNNNN.json
    #[arg(short, long)]
    buffer_dir: PathBuf,

    /// Class file naming the buffer's columns
    #[arg(short, long)]
    classes: Option<PathBuf>,

    /// With --classes, the buffer already holds only the classes shared with this file
    #[arg(short, long, requires = "classes")]
    reference_classes: Option<PathBuf>,

    /// Probability threshold for a positive prediction
    #[arg(short, long, default_value_t = 0.5)]
    threshold: f32,

    /// Treatment of classes with no labels and no predictions (exclude, zero)
    #[arg(long, default_value = "exclude")]
    zero_support: ZeroSupportPolicy,

    /// Number of best classes to list (0 disables the ranking)
    #[arg(short = 'k', long, default_value_t = 10)]
    top_k: usize,

    /// Report format (text, markdown, json)
    #[arg(short, long, default_value = "text")]
    format: ReportFormat,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let tensors = load_buffer(&args.buffer_dir)?;

    let names = match (&args.classes, &args.reference_classes) {
        (Some(classes), Some(reference)) => {
            let (_, _, alignment) = align_files(classes, reference)?;
            Some(alignment.common)
        }
        (Some(classes), None) => Some(ClassVocabulary::load(classes)?.classes().to_vec()),
        _ => None,
    };

    if let Some(ref names) = names {
        if names.len() != tensors.cols() {
            bail!(
                "Class file names {} classes but the buffer holds {} columns",
                names.len(),
                tensors.cols()
            );
        }
    }

    let options = MetricsOptions {
        threshold: args.threshold,
        zero_support: args.zero_support,
    };
    let metrics = MultilabelMetrics::compute(&tensors.predictions, &tensors.labels, names.as_deref(), options)?;
    let report = MetricsReport::new(metrics, (args.top_k > 0).then_some(args.top_k));

    println!("{}", report.render(args.format)?);

    Ok(())
}
