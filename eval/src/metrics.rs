// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Evaluation metrics for multi-label classification
//!
//! Every class is scored as its own binary problem:
//! - Per-class confusion counts (TP, FP, FN, TN)
//! - Precision, Recall, F1-Score, Specificity, Balanced Accuracy
//! - Macro averages (unweighted mean over classes)
//! - Micro averages (from globally summed counts)
//! - Per-class F1 ranking and the list of classes the model never gets right

use crate::tensor::Matrix;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Confusion counts for one class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    /// True Positives (class predicted and present)
    pub tp: usize,
    /// True Negatives (class neither predicted nor present)
    pub tn: usize,
    /// False Positives (class predicted but absent)
    pub fp: usize,
    /// False Negatives (class present but not predicted)
    pub fn_: usize,
}

impl ConfusionMatrix {
    /// Count one column of thresholded predictions against its labels
    pub fn from_column(predictions: impl Iterator<Item = bool>, labels: impl Iterator<Item = bool>) -> Self {
        let mut matrix = Self::default();

        for (pred, truth) in predictions.zip(labels) {
            match (pred, truth) {
                (true, true) => matrix.tp += 1,
                (false, false) => matrix.tn += 1,
                (true, false) => matrix.fp += 1,
                (false, true) => matrix.fn_ += 1,
            }
        }

        matrix
    }

    /// Element-wise sum, used for micro averaging
    pub fn merge(&mut self, other: &ConfusionMatrix) {
        self.tp += other.tp;
        self.tn += other.tn;
        self.fp += other.fp;
        self.fn_ += other.fn_;
    }

    /// Total number of samples
    pub fn total(&self) -> usize {
        self.tp + self.tn + self.fp + self.fn_
    }

    /// Number of actual positives
    pub fn support(&self) -> usize {
        self.tp + self.fn_
    }

    /// Number of predicted positives
    pub fn predicted(&self) -> usize {
        self.tp + self.fp
    }

    /// Neither present in the labels nor ever predicted
    pub fn is_empty_class(&self) -> bool {
        self.tp + self.fp + self.fn_ == 0
    }

    /// Precision: TP / (TP + FP)
    pub fn precision(&self) -> f64 {
        let denom = self.tp + self.fp;
        if denom == 0 {
            return 0.0;
        }
        self.tp as f64 / denom as f64
    }

    /// Recall (Sensitivity): TP / (TP + FN)
    pub fn recall(&self) -> f64 {
        let denom = self.tp + self.fn_;
        if denom == 0 {
            return 0.0;
        }
        self.tp as f64 / denom as f64
    }

    /// Specificity: TN / (TN + FP)
    pub fn specificity(&self) -> f64 {
        let denom = self.tn + self.fp;
        if denom == 0 {
            return 0.0;
        }
        self.tn as f64 / denom as f64
    }

    /// F1 Score: 2 * (Precision * Recall) / (Precision + Recall)
    pub fn f1_score(&self) -> f64 {
        let precision = self.precision();
        let recall = self.recall();
        let denom = precision + recall;
        if denom == 0.0 {
            return 0.0;
        }
        2.0 * precision * recall / denom
    }

    /// Balanced Accuracy: (Sensitivity + Specificity) / 2
    pub fn balanced_accuracy(&self) -> f64 {
        (self.recall() + self.specificity()) / 2.0
    }
}

/// How classes with no labels and no predictions enter macro averages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZeroSupportPolicy {
    /// Leave them out of the mean
    #[default]
    Exclude,
    /// Score them as 0
    CountAsZero,
}

impl std::str::FromStr for ZeroSupportPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "exclude" => Ok(Self::Exclude),
            "zero" | "count-as-zero" | "count_as_zero" => Ok(Self::CountAsZero),
            other => bail!("Unknown zero-support policy '{}' (expected exclude or zero)", other),
        }
    }
}

/// Parameters of a metrics computation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricsOptions {
    /// A probability at or above this counts as a positive prediction
    pub threshold: f32,
    pub zero_support: ZeroSupportPolicy,
}

impl Default for MetricsOptions {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            zero_support: ZeroSupportPolicy::Exclude,
        }
    }
}

/// Scores of a single class
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassMetrics {
    /// Column index in the evaluated tensors
    pub index: usize,
    pub name: String,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub balanced_accuracy: f64,
    pub support: usize,
    pub confusion: ConfusionMatrix,
}

/// One averaged set of scores
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AveragedMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub balanced_accuracy: f64,
}

/// Multi-label evaluation result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultilabelMetrics {
    pub options: MetricsOptions,
    pub num_examples: usize,
    pub num_classes: usize,
    /// Classes that took part in macro averaging
    pub macro_classes: usize,
    pub macro_avg: AveragedMetrics,
    pub micro_avg: AveragedMetrics,
    pub per_class: Vec<ClassMetrics>,
}

impl MultilabelMetrics {
    /// Score an (examples x classes) prediction matrix against its labels
    pub fn compute(
        predictions: &Matrix<f32>,
        labels: &Matrix<u8>,
        class_names: Option<&[String]>,
        options: MetricsOptions,
    ) -> Result<Self> {
        if predictions.rows() != labels.rows() || predictions.cols() != labels.cols() {
            bail!(
                "Predictions are {}x{} but labels are {}x{}",
                predictions.rows(),
                predictions.cols(),
                labels.rows(),
                labels.cols()
            );
        }
        let num_classes = predictions.cols();
        if let Some(names) = class_names {
            if names.len() != num_classes {
                bail!("{} class names for {} columns", names.len(), num_classes);
            }
        }

        let per_class: Vec<ClassMetrics> = (0..num_classes)
            .map(|c| {
                let confusion = ConfusionMatrix::from_column(
                    predictions.column(c).map(|p| p >= options.threshold),
                    labels.column(c).map(|l| l != 0),
                );
                ClassMetrics {
                    index: c,
                    name: class_names.map_or_else(|| c.to_string(), |names| names[c].clone()),
                    precision: confusion.precision(),
                    recall: confusion.recall(),
                    f1_score: confusion.f1_score(),
                    balanced_accuracy: confusion.balanced_accuracy(),
                    support: confusion.support(),
                    confusion,
                }
            })
            .collect();

        let averaged: Vec<&ClassMetrics> = per_class
            .iter()
            .filter(|m| match options.zero_support {
                ZeroSupportPolicy::Exclude => !m.confusion.is_empty_class(),
                ZeroSupportPolicy::CountAsZero => true,
            })
            .collect();

        let macro_avg = if averaged.is_empty() {
            AveragedMetrics::default()
        } else {
            let n = averaged.len() as f64;
            AveragedMetrics {
                precision: averaged.iter().map(|m| m.precision).sum::<f64>() / n,
                recall: averaged.iter().map(|m| m.recall).sum::<f64>() / n,
                f1_score: averaged.iter().map(|m| m.f1_score).sum::<f64>() / n,
                balanced_accuracy: averaged.iter().map(|m| m.balanced_accuracy).sum::<f64>() / n,
            }
        };

        let mut global = ConfusionMatrix::default();
        for m in &per_class {
            global.merge(&m.confusion);
        }
        let micro_avg = AveragedMetrics {
            precision: global.precision(),
            recall: global.recall(),
            f1_score: global.f1_score(),
            balanced_accuracy: global.balanced_accuracy(),
        };

        Ok(Self {
            options,
            num_examples: predictions.rows(),
            num_classes,
            macro_classes: averaged.len(),
            macro_avg,
            micro_avg,
            per_class,
        })
    }

    /// The `k` best classes by F1, ties broken by column order
    pub fn top_k(&self, k: usize) -> Vec<&ClassMetrics> {
        let mut ranked: Vec<&ClassMetrics> = self.per_class.iter().collect();
        ranked.sort_by(|a, b| {
            b.f1_score
                .partial_cmp(&a.f1_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.index.cmp(&b.index))
        });
        ranked.truncate(k);
        ranked
    }

    /// Classes present in the labels whose F1 is exactly zero
    pub fn zero_f1_classes(&self) -> Vec<&ClassMetrics> {
        self.per_class
            .iter()
            .filter(|m| m.support > 0 && m.f1_score == 0.0)
            .collect()
    }
}

/// Rendering style of a report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportFormat {
    #[default]
    Text,
    Markdown,
    Json,
}

impl std::str::FromStr for ReportFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "text" | "human" => Ok(Self::Text),
            "markdown" | "md" => Ok(Self::Markdown),
            "json" => Ok(Self::Json),
            other => bail!("Unknown report format '{}' (expected text, markdown or json)", other),
        }
    }
}

/// Metrics plus the rankings shown to a reader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsReport {
    pub metrics: MultilabelMetrics,
    pub top_classes: Vec<ClassMetrics>,
    pub zero_f1_classes: Vec<ClassMetrics>,
}

impl MetricsReport {
    pub fn new(metrics: MultilabelMetrics, top_k: Option<usize>) -> Self {
        let top_classes = top_k
            .map(|k| metrics.top_k(k).into_iter().cloned().collect())
            .unwrap_or_default();
        let zero_f1_classes = metrics.zero_f1_classes().into_iter().cloned().collect();
        Self {
            metrics,
            top_classes,
            zero_f1_classes,
        }
    }

    pub fn render(&self, format: ReportFormat) -> Result<String> {
        Ok(match format {
            ReportFormat::Text => self.format(),
            ReportFormat::Markdown => self.to_markdown(),
            ReportFormat::Json => serde_json::to_string_pretty(self)?,
        })
    }

    /// Format as a human-readable string
    pub fn format(&self) -> String {
        let m = &self.metrics;
        let mut output = format!(
            r#"Multi-label Classification Report
=================================
Examples:          {}
Classes:           {} ({} in macro average, threshold {:.2})

                   Macro     Micro
F1 Score:          {:.4}    {:.4}
Precision:         {:.4}    {:.4}
Recall:            {:.4}    {:.4}
Balanced Accuracy: {:.4}    {:.4}
"#,
            m.num_examples,
            m.num_classes,
            m.macro_classes,
            m.options.threshold,
            m.macro_avg.f1_score,
            m.micro_avg.f1_score,
            m.macro_avg.precision,
            m.micro_avg.precision,
            m.macro_avg.recall,
            m.micro_avg.recall,
            m.macro_avg.balanced_accuracy,
            m.micro_avg.balanced_accuracy,
        );

        if !self.top_classes.is_empty() {
            output.push_str(&format!("\nTop {} classes by F1:\n", self.top_classes.len()));
            for class in &self.top_classes {
                output.push_str(&format!("  {}\n", class));
            }
        }

        output.push_str(&format!(
            "\nClasses with F1 = 0 despite positive labels: {}\n",
            self.zero_f1_classes.len()
        ));
        for class in &self.zero_f1_classes {
            output.push_str(&format!("  {}\n", class));
        }

        output
    }

    /// Format as Markdown tables
    pub fn to_markdown(&self) -> String {
        let m = &self.metrics;
        let mut report = String::new();

        report.push_str(&format!(
            "- **Examples:** {}\n- **Classes:** {} ({} in macro average)\n- **Threshold:** {:.2}\n\n",
            m.num_examples, m.num_classes, m.macro_classes, m.options.threshold
        ));

        report.push_str("| Metric | Macro | Micro |\n");
        report.push_str("|--------|-------|-------|\n");
        let rows = [
            ("F1 Score", m.macro_avg.f1_score, m.micro_avg.f1_score),
            ("Precision", m.macro_avg.precision, m.micro_avg.precision),
            ("Recall", m.macro_avg.recall, m.micro_avg.recall),
            ("Balanced Accuracy", m.macro_avg.balanced_accuracy, m.micro_avg.balanced_accuracy),
        ];
        for (name, macro_value, micro_value) in rows {
            report.push_str(&format!("| {} | {:.4} | {:.4} |\n", name, macro_value, micro_value));
        }

        if !self.top_classes.is_empty() {
            report.push_str(&format!("\n### Top {} Classes\n\n", self.top_classes.len()));
            report.push_str("| Rank | Class | F1 | Precision | Recall | Support |\n");
            report.push_str("|------|-------|----|-----------|--------|---------|\n");
            for (rank, class) in self.top_classes.iter().enumerate() {
                report.push_str(&format!(
                    "| {} | {} | {:.4} | {:.4} | {:.4} | {} |\n",
                    rank + 1,
                    class.name,
                    class.f1_score,
                    class.precision,
                    class.recall,
                    class.support
                ));
            }
        }

        report.push_str(&format!(
            "\n### Classes with F1 = 0 ({})\n\n",
            self.zero_f1_classes.len()
        ));
        if self.zero_f1_classes.is_empty() {
            report.push_str("None.\n");
        } else {
            for class in &self.zero_f1_classes {
                report.push_str(&format!("- {} (support {})\n", class.name, class.support));
            }
        }

        report
    }
}

impl fmt::Display for ClassMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: F1={:.4} P={:.4} R={:.4} (n={})",
            self.name, self.f1_score, self.precision, self.recall, self.support
        )
    }
}
