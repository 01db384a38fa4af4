// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Reproducible evaluation pipeline for ChEBI class prediction
//!
//! Orchestrates:
//! - Class vocabulary loading and cross-version alignment
//! - Checkpoint loading
//! - Batched inference (in memory or through a buffer directory)
//! - Metrics computation and ontology consistency checks
//! - Results serialization

use crate::consistency::{ClassHierarchy, ConsistencyReport, DisjointnessAxioms};
use crate::data::{ProcessedDataModule, SyntheticChemData, SyntheticConfig};
use crate::inference::{EvaluatedTensors, InferenceOptions, InferenceRunner, SinkConfig};
use crate::metrics::{MetricsOptions, MetricsReport, MultilabelMetrics, ReportFormat, ZeroSupportPolicy};
use crate::model::{Device, LinearModel};
use crate::vocab::{align, ClassMask, ClassVocabulary};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Configuration for the evaluation pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Random seed for the synthetic dataset
    pub seed: u64,
    /// Evaluate a generated dataset instead of files on disk
    pub synthetic: bool,
    /// Dataset root holding `processed/`
    pub data_dir: Option<PathBuf>,
    /// Model checkpoint
    pub checkpoint: Option<PathBuf>,
    /// Processed file to evaluate instead of `test.json`
    pub file_name: Option<String>,
    /// Class file of the evaluated dataset (defaults to `processed/classes.txt`)
    pub classes: Option<PathBuf>,
    /// Class file of another dataset version; restricts scoring to shared classes
    pub reference_classes: Option<PathBuf>,
    pub device: Device,
    pub batch_size: usize,
    /// Persist batch results here instead of keeping them in memory
    pub buffer_dir: Option<PathBuf>,
    pub threshold: f32,
    pub zero_support: ZeroSupportPolicy,
    /// Number of best classes to list (none = skip the ranking)
    pub top_k: Option<usize>,
    /// Subclass edges (`child,parent`) for consistency checks
    pub hierarchy: Option<PathBuf>,
    /// Disjointness axioms (`left,right`), used together with `hierarchy`
    pub disjointness: Option<PathBuf>,
    /// Output directory for results
    pub output_dir: PathBuf,
    pub format: ReportFormat,
    pub show_progress: bool,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            synthetic: false,
            data_dir: None,
            checkpoint: None,
            file_name: None,
            classes: None,
            reference_classes: None,
            device: Device::Cpu,
            batch_size: 1,
            buffer_dir: None,
            threshold: 0.5,
            zero_support: ZeroSupportPolicy::Exclude,
            top_k: Some(10),
            hierarchy: None,
            disjointness: None,
            output_dir: PathBuf::from("eval/results"),
            format: ReportFormat::Text,
            show_progress: true,
        }
    }
}

impl EvaluationConfig {
    /// Load a JSON config file; missing keys take their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    fn sink(&self) -> SinkConfig {
        match &self.buffer_dir {
            Some(dir) => SinkConfig::Buffer(dir.clone()),
            None => SinkConfig::Memory,
        }
    }

    fn metrics_options(&self) -> MetricsOptions {
        MetricsOptions {
            threshold: self.threshold,
            zero_support: self.zero_support,
        }
    }
}

/// SHA-256 of an input file, recorded for reproducibility
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileFingerprint {
    pub path: String,
    pub sha256: String,
}

impl FileFingerprint {
    pub fn of(path: &Path) -> Result<Self> {
        let mut file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 8192];

        loop {
            let bytes_read = file.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(Self {
            path: path.display().to_string(),
            sha256: hex::encode(hasher.finalize()),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VocabularyInfo {
    pub classes: usize,
    pub reference_classes: Option<usize>,
    /// Columns that were scored
    pub evaluated_classes: usize,
}

/// Complete evaluation results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResults {
    pub config: EvaluationConfig,
    pub vocabulary: VocabularyInfo,
    pub inputs: Vec<FileFingerprint>,
    pub report: MetricsReport,
    pub consistency: Option<ConsistencyReport>,
    pub timestamp: DateTime<Utc>,
    pub version: String,
}

/// Main evaluation pipeline
pub struct EvaluationPipeline {
    config: EvaluationConfig,
}

impl EvaluationPipeline {
    pub fn new(config: EvaluationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EvaluationConfig {
        &self.config
    }

    fn runner(&self) -> InferenceRunner {
        InferenceRunner::new(InferenceOptions {
            device: self.config.device,
            batch_size: self.config.batch_size,
            file_name: self.config.file_name.clone(),
            show_progress: self.config.show_progress,
        })
    }

    /// Reference alignment: mask over our columns plus the names it keeps
    fn class_selection(&self, vocabulary: &ClassVocabulary, inputs: &mut Vec<FileFingerprint>) -> Result<(Option<ClassMask>, Vec<String>, Option<usize>)> {
        match &self.config.reference_classes {
            Some(path) => {
                let reference = ClassVocabulary::load(path)?;
                inputs.push(FileFingerprint::of(path)?);
                let alignment = align(vocabulary, &reference);
                if alignment.common.is_empty() {
                    tracing::warn!("No classes shared with {}", path.display());
                }
                let names = alignment.mask_a.select_names(vocabulary)?;
                Ok((Some(alignment.mask_a), names, Some(reference.len())))
            }
            None => Ok((None, vocabulary.classes().to_vec(), None)),
        }
    }

    /// Run inference and return the tensors plus the names of their columns
    fn infer(&self, inputs: &mut Vec<FileFingerprint>) -> Result<(EvaluatedTensors, Vec<String>, VocabularyInfo)> {
        let runner = self.runner();
        let sink = self.config.sink();

        if self.config.synthetic {
            tracing::info!("Generating synthetic dataset with seed {}", self.config.seed);
            let data = SyntheticChemData::generate(&SyntheticConfig {
                seed: self.config.seed,
                ..Default::default()
            });
            let (mask, names, reference) = self.class_selection(&data.vocabulary, inputs)?;
            let model = LinearModel::new(data.checkpoint.clone())?;
            let tensors = runner.evaluate(&model, &data, mask.as_ref(), &sink)?;
            let info = VocabularyInfo {
                classes: data.vocabulary.len(),
                reference_classes: reference,
                evaluated_classes: names.len(),
            };
            return Ok((tensors, names, info));
        }

        let Some(data_dir) = &self.config.data_dir else {
            bail!("No data directory given (use --data-dir or --synthetic)");
        };
        let Some(checkpoint) = &self.config.checkpoint else {
            bail!("No checkpoint given (use --checkpoint)");
        };

        let data = ProcessedDataModule::new(data_dir);
        let classes_path = self.config.classes.clone().unwrap_or_else(|| data.classes_file());
        let vocabulary = ClassVocabulary::load(&classes_path)?;
        inputs.push(FileFingerprint::of(&classes_path)?);
        inputs.push(FileFingerprint::of(checkpoint)?);

        let (mask, names, reference) = self.class_selection(&vocabulary, inputs)?;
        let model = LinearModel::load(checkpoint)?;
        let tensors = runner.evaluate(&model, &data, mask.as_ref(), &sink)?;
        let info = VocabularyInfo {
            classes: vocabulary.len(),
            reference_classes: reference,
            evaluated_classes: names.len(),
        };
        Ok((tensors, names, info))
    }

    /// Run the full evaluation pipeline
    pub fn run(&self) -> Result<EvaluationResults> {
        let mut inputs = Vec::new();
        let (tensors, names, vocabulary) = self.infer(&mut inputs)?;

        if names.len() != tensors.cols() {
            bail!(
                "Class vocabulary selects {} classes but the model produced {} columns",
                names.len(),
                tensors.cols()
            );
        }

        let metrics = MultilabelMetrics::compute(
            &tensors.predictions,
            &tensors.labels,
            Some(names.as_slice()),
            self.config.metrics_options(),
        )?;

        tracing::info!(
            "Macro-F1: {:.4}, Micro-F1: {:.4} over {} examples",
            metrics.macro_avg.f1_score,
            metrics.micro_avg.f1_score,
            metrics.num_examples
        );

        let consistency = match &self.config.hierarchy {
            Some(path) => {
                let hierarchy = ClassHierarchy::load_csv(path)?;
                let disjointness = self
                    .config
                    .disjointness
                    .as_deref()
                    .map(DisjointnessAxioms::load_csv)
                    .transpose()?;
                Some(ConsistencyReport::compute(
                    &tensors.predictions,
                    &names,
                    &hierarchy,
                    disjointness.as_ref(),
                    self.config.threshold,
                )?)
            }
            None => {
                if self.config.disjointness.is_some() {
                    tracing::warn!("Disjointness axioms need a hierarchy file; skipping consistency check");
                }
                None
            }
        };

        Ok(EvaluationResults {
            config: self.config.clone(),
            vocabulary,
            inputs,
            report: MetricsReport::new(metrics, self.config.top_k),
            consistency,
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    /// Save results to JSON file
    pub fn save_results(results: &EvaluationResults, output_path: &Path) -> Result<()> {
        std::fs::create_dir_all(output_path.parent().unwrap_or(Path::new(".")))?;
        let json = serde_json::to_string_pretty(results)?;
        std::fs::write(output_path, json)?;
        tracing::info!("Results saved to {}", output_path.display());
        Ok(())
    }

    /// Generate a markdown report
    pub fn generate_report(results: &EvaluationResults) -> String {
        let mut report = String::new();

        report.push_str("# ChEBI Class Prediction Evaluation Report\n\n");
        report.push_str(&format!("**Generated:** {}\n\n", results.timestamp.format("%Y-%m-%d %H:%M:%S UTC")));
        report.push_str(&format!("**Version:** {}\n\n", results.version));

        report.push_str("## Classes\n\n");
        report.push_str(&format!("- **Vocabulary:** {}\n", results.vocabulary.classes));
        if let Some(reference) = results.vocabulary.reference_classes {
            report.push_str(&format!("- **Reference vocabulary:** {}\n", reference));
        }
        report.push_str(&format!("- **Evaluated:** {}\n", results.vocabulary.evaluated_classes));
        report.push_str(&format!("- **Device:** {}\n\n", results.config.device));

        if !results.inputs.is_empty() {
            report.push_str("## Inputs\n\n");
            report.push_str("| File | SHA-256 |\n");
            report.push_str("|------|---------|\n");
            for input in &results.inputs {
                report.push_str(&format!("| {} | `{}` |\n", input.path, input.sha256));
            }
            report.push('\n');
        }

        report.push_str("## Metrics\n\n");
        report.push_str(&results.report.to_markdown());

        if let Some(ref consistency) = results.consistency {
            report.push_str("\n## Ontology Consistency\n\n");
            report.push_str(&format!("```\n{}```\n", consistency.format()));
        }

        report.push_str("\n## Configuration\n\n");
        report.push_str(&format!("```json\n{}\n```\n", serde_json::to_string_pretty(&results.config).unwrap_or_default()));

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn synthetic_config() -> EvaluationConfig {
        EvaluationConfig {
            synthetic: true,
            show_progress: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_pipeline_synthetic() {
        let results = EvaluationPipeline::new(synthetic_config()).run().expect("Pipeline should succeed");
        let metrics = &results.report.metrics;

        assert_eq!(metrics.num_examples, 200);
        assert_eq!(metrics.num_classes, 24);
        assert!(metrics.macro_avg.f1_score >= 0.0 && metrics.macro_avg.f1_score <= 1.0);
        // Labels come from the same checkpoint with 5% noise
        assert!(metrics.micro_avg.f1_score > 0.6);
        assert_eq!(results.report.top_classes.len(), 10);
    }

    #[test]
    fn test_pipeline_from_disk_with_reference() {
        let dir = tempfile::tempdir().unwrap();
        let data = SyntheticChemData::generate(&SyntheticConfig { num_examples: 30, ..Default::default() });
        let module = data.write_to(dir.path()).unwrap();

        // Older snapshot: the first 20 classes plus two it alone has
        let reference = dir.path().join("classes_v148.txt");
        let mut file = File::create(&reference).unwrap();
        for class in data.vocabulary.classes().iter().take(20) {
            writeln!(file, "{}", class).unwrap();
        }
        writeln!(file, "99999\n99998").unwrap();

        let config = EvaluationConfig {
            data_dir: Some(dir.path().to_path_buf()),
            checkpoint: Some(dir.path().join("checkpoint.json")),
            reference_classes: Some(reference),
            buffer_dir: Some(dir.path().join("buffer")),
            batch_size: 4,
            show_progress: false,
            ..Default::default()
        };

        let results = EvaluationPipeline::new(config).run().unwrap();

        assert_eq!(results.vocabulary.classes, 24);
        assert_eq!(results.vocabulary.reference_classes, Some(22));
        assert_eq!(results.vocabulary.evaluated_classes, 20);
        assert_eq!(results.report.metrics.num_classes, 20);
        assert_eq!(results.report.metrics.num_examples, 30);
        assert_eq!(results.inputs.len(), 3);
        assert!(results.inputs.iter().all(|f| f.sha256.len() == 64));
        assert!(module.classes_file().exists());
        assert!(dir.path().join("buffer").join("preds00007.json").exists());
    }

    #[test]
    fn test_missing_checkpoint_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = EvaluationConfig {
            data_dir: Some(dir.path().to_path_buf()),
            show_progress: false,
            ..Default::default()
        };
        assert!(EvaluationPipeline::new(config).run().is_err());
    }

    #[test]
    fn test_config_file_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"synthetic": true, "device": "cuda:1", "zero_support": "count_as_zero"}}"#).unwrap();

        let config = EvaluationConfig::from_file(file.path()).unwrap();

        assert!(config.synthetic);
        assert_eq!(config.device, Device::Cuda(1));
        assert_eq!(config.zero_support, ZeroSupportPolicy::CountAsZero);
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.top_k, Some(10));
    }

    #[test]
    fn test_generate_report() {
        let results = EvaluationPipeline::new(synthetic_config()).run().unwrap();
        let report = EvaluationPipeline::generate_report(&results);

        assert!(report.contains("ChEBI Class Prediction Evaluation Report"));
        assert!(report.contains("| F1 Score |"));
        assert!(report.contains("## Configuration"));
    }

    #[test]
    fn test_save_results_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let results = EvaluationPipeline::new(synthetic_config()).run().unwrap();
        let path = dir.path().join("out").join("results.json");

        EvaluationPipeline::save_results(&results, &path).unwrap();
        let loaded: EvaluationResults = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();

        assert_eq!(loaded.report.metrics.num_examples, results.report.metrics.num_examples);
    }
}
