// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Batched inference over a processed split
//!
//! The runner reads the example list of a data module, feeds it through a
//! model batch by batch and hands every batch of predictions to a sink. The
//! memory sink keeps the rows; the buffer sink writes one file pair per batch
//! and reloads them at the end, so a later process can reuse the buffer
//! without running the model again.

use crate::data::{Collator, DataModule};
use crate::model::{BatchPredictions, ChemModel, Device};
use crate::tensor::Matrix;
use crate::vocab::ClassMask;
use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Batch type produced by a data module's collator
pub type CollatedBatch<D> = <<D as DataModule>::Collator as Collator>::Batch;

/// Accumulated predictions (probabilities) and labels (0/1), row i = example i
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatedTensors {
    pub predictions: Matrix<f32>,
    pub labels: Matrix<u8>,
}

impl EvaluatedTensors {
    pub fn empty(cols: usize) -> Self {
        Self {
            predictions: Matrix::with_cols(cols),
            labels: Matrix::with_cols(cols),
        }
    }

    pub fn rows(&self) -> usize {
        self.predictions.rows()
    }

    pub fn cols(&self) -> usize {
        self.predictions.cols()
    }

    fn append(&mut self, batch: &BatchPredictions) -> Result<()> {
        self.predictions.append(&batch.predictions)?;
        self.labels.append(&batch.labels)?;
        Ok(())
    }
}

/// Where batch results go
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkConfig {
    /// Keep everything in memory
    #[default]
    Memory,
    /// Persist each batch under this directory, then reload
    Buffer(PathBuf),
}

/// Receives batch results in batch-index order
pub trait PredictionSink {
    fn accept(&mut self, batch_idx: usize, batch: BatchPredictions) -> Result<()>;

    fn finish(self) -> Result<EvaluatedTensors>;
}

/// Concatenates batches in memory
#[derive(Debug)]
pub struct MemorySink {
    tensors: EvaluatedTensors,
}

impl MemorySink {
    pub fn new(cols: usize) -> Self {
        Self {
            tensors: EvaluatedTensors::empty(cols),
        }
    }
}

impl PredictionSink for MemorySink {
    fn accept(&mut self, _batch_idx: usize, batch: BatchPredictions) -> Result<()> {
        self.tensors.append(&batch)
    }

    fn finish(self) -> Result<EvaluatedTensors> {
        Ok(self.tensors)
    }
}

const PREDS_PREFIX: &str = "preds";
const LABELS_PREFIX: &str = "labels";
/// Written last; a buffer without it was never finished
const MANIFEST_FILE: &str = "complete.json";
const INDEX_DIGITS: usize = 5;

fn buffer_file(dir: &Path, prefix: &str, batch_idx: usize) -> PathBuf {
    dir.join(format!("{}{:05}.json", prefix, batch_idx))
}

/// Batch indices of the `<prefix>NNNNN.json` files in a directory
fn buffer_indices(dir: &Path, prefix: &str) -> Result<BTreeSet<usize>> {
    let mut indices = BTreeSet::new();
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read buffer directory: {}", dir.display()))?;
    for entry in entries {
        let name = entry?.file_name();
        let name = name.to_string_lossy();
        let Some(digits) = name.strip_prefix(prefix).and_then(|rest| rest.strip_suffix(".json")) else {
            continue;
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        if digits.len() != INDEX_DIGITS {
            bail!(
                "Unexpected batch file {} in {} (indices have {} digits)",
                name,
                dir.display(),
                INDEX_DIGITS
            );
        }
        indices.insert(digits.parse::<usize>()?);
    }
    Ok(indices)
}

/// Marks a buffer whose writer finished every batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferManifest {
    pub batches: usize,
    pub rows: usize,
    pub cols: usize,
}

impl BufferManifest {
    fn path(dir: &Path) -> PathBuf {
        dir.join(MANIFEST_FILE)
    }

    fn write(&self, dir: &Path) -> Result<()> {
        let path = Self::path(dir);
        std::fs::write(&path, serde_json::to_vec_pretty(self)?)
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    fn read(dir: &Path) -> Result<Self> {
        let path = Self::path(dir);
        if !path.exists() {
            bail!(
                "Buffer {} has no {}; the run that wrote it did not finish",
                dir.display(),
                MANIFEST_FILE
            );
        }
        read_json(&path)
    }
}

/// Writes `predsNNNNN.json` / `labelsNNNNN.json` per batch
#[derive(Debug)]
pub struct BufferSink {
    dir: PathBuf,
    cols: usize,
    written: usize,
    rows: usize,
}

impl BufferSink {
    /// Open a buffer directory; it must not already hold batch files
    pub fn create(dir: &Path, cols: usize) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create buffer directory: {}", dir.display()))?;
        let existing = buffer_indices(dir, PREDS_PREFIX)?.len() + buffer_indices(dir, LABELS_PREFIX)?.len();
        if existing > 0 || BufferManifest::path(dir).exists() {
            bail!(
                "Buffer directory {} already holds {} batch files; use an empty directory",
                dir.display(),
                existing
            );
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            cols,
            written: 0,
            rows: 0,
        })
    }
}

impl PredictionSink for BufferSink {
    fn accept(&mut self, batch_idx: usize, batch: BatchPredictions) -> Result<()> {
        let preds_path = buffer_file(&self.dir, PREDS_PREFIX, batch_idx);
        let labels_path = buffer_file(&self.dir, LABELS_PREFIX, batch_idx);
        std::fs::write(&preds_path, serde_json::to_vec(&batch.predictions)?)
            .with_context(|| format!("Failed to write {}", preds_path.display()))?;
        std::fs::write(&labels_path, serde_json::to_vec(&batch.labels)?)
            .with_context(|| format!("Failed to write {}", labels_path.display()))?;
        self.written += 1;
        self.rows += batch.predictions.rows();
        Ok(())
    }

    fn finish(self) -> Result<EvaluatedTensors> {
        BufferManifest {
            batches: self.written,
            rows: self.rows,
            cols: self.cols,
        }
        .write(&self.dir)?;
        tracing::info!("Wrote {} batches to {}", self.written, self.dir.display());
        load_buffer(&self.dir)
    }
}

/// Rebuild the prediction and label tensors from a finished buffer directory
pub fn load_buffer(dir: &Path) -> Result<EvaluatedTensors> {
    let manifest = BufferManifest::read(dir)?;
    let preds = buffer_indices(dir, PREDS_PREFIX)?;
    let labels = buffer_indices(dir, LABELS_PREFIX)?;

    if let Some(idx) = preds.symmetric_difference(&labels).next() {
        bail!("Batch {} in {} is missing its predictions or labels file", idx, dir.display());
    }
    if let Some((expected, found)) = preds.iter().enumerate().find(|(i, idx)| *i != **idx) {
        bail!("Buffer {} has a gap: expected batch {}, found {}", dir.display(), expected, found);
    }
    if preds.len() != manifest.batches {
        bail!(
            "Buffer {} holds {} batches but its manifest records {}",
            dir.display(),
            preds.len(),
            manifest.batches
        );
    }

    let mut tensors = EvaluatedTensors::empty(manifest.cols);
    for idx in &preds {
        let batch = BatchPredictions {
            predictions: read_json(&buffer_file(dir, PREDS_PREFIX, *idx))?,
            labels: read_json(&buffer_file(dir, LABELS_PREFIX, *idx))?,
        };
        batch.predictions.validate().with_context(|| format!("Corrupt predictions in batch {}", idx))?;
        batch.labels.validate().with_context(|| format!("Corrupt labels in batch {}", idx))?;
        if batch.predictions.rows() != batch.labels.rows() || batch.predictions.cols() != batch.labels.cols() {
            bail!(
                "Batch {} predictions are {}x{} but labels are {}x{}",
                idx,
                batch.predictions.rows(),
                batch.predictions.cols(),
                batch.labels.rows(),
                batch.labels.cols()
            );
        }
        tensors
            .append(&batch)
            .with_context(|| format!("Batch {} does not match earlier batches", idx))?;
    }

    if tensors.rows() != manifest.rows || tensors.cols() != manifest.cols {
        bail!(
            "Buffer {} holds {}x{} values but its manifest records {}x{}",
            dir.display(),
            tensors.rows(),
            tensors.cols(),
            manifest.rows,
            manifest.cols
        );
    }

    tracing::info!(
        "Loaded {} batches ({} rows x {} classes) from {}",
        preds.len(),
        tensors.rows(),
        tensors.cols(),
        dir.display()
    );
    Ok(tensors)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Settings for one inference run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceOptions {
    pub device: Device,
    pub batch_size: usize,
    /// Processed file to evaluate instead of the data module's test split
    pub file_name: Option<String>,
    pub show_progress: bool,
}

impl Default for InferenceOptions {
    fn default() -> Self {
        Self {
            device: Device::Cpu,
            batch_size: 1,
            file_name: None,
            show_progress: true,
        }
    }
}

/// Drives a model over a data module's examples
#[derive(Debug, Clone, Default)]
pub struct InferenceRunner {
    options: InferenceOptions,
}

impl InferenceRunner {
    pub fn new(options: InferenceOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &InferenceOptions {
        &self.options
    }

    /// Run inference, optionally restricted to the columns selected by `mask`
    pub fn evaluate<D, M>(&self, model: &M, data: &D, mask: Option<&ClassMask>, sink: &SinkConfig) -> Result<EvaluatedTensors>
    where
        D: DataModule,
        M: ChemModel<CollatedBatch<D>>,
    {
        if let Some(mask) = mask {
            if mask.len() != model.num_classes() {
                bail!(
                    "Class mask covers {} classes but the model predicts {}",
                    mask.len(),
                    model.num_classes()
                );
            }
        }
        let cols = mask.map_or(model.num_classes(), ClassMask::popcount);

        match sink {
            SinkConfig::Memory => self.run_into(model, data, mask, MemorySink::new(cols)),
            SinkConfig::Buffer(dir) => self.run_into(model, data, mask, BufferSink::create(dir, cols)?),
        }
    }

    /// Run inference and feed every batch into `sink`
    pub fn run_into<D, M, S>(&self, model: &M, data: &D, mask: Option<&ClassMask>, mut sink: S) -> Result<EvaluatedTensors>
    where
        D: DataModule,
        M: ChemModel<CollatedBatch<D>>,
        S: PredictionSink,
    {
        if self.options.batch_size == 0 {
            bail!("Batch size must be at least 1");
        }

        let examples = data.load_examples(self.options.file_name.as_deref())?;
        let collator = data.collator();

        tracing::info!(
            "Running inference on {} examples (device={}, batch_size={}, masked={})",
            examples.len(),
            self.options.device,
            self.options.batch_size,
            mask.is_some()
        );

        let pb = if self.options.show_progress {
            ProgressBar::new(examples.len() as u64)
        } else {
            ProgressBar::hidden()
        };
        pb.set_style(
            ProgressStyle::with_template("{spinner:.green} Inference: [{wide_bar:.cyan/blue}] {pos}/{len} ({eta})")?
                .progress_chars("#>-"),
        );

        for (batch_idx, chunk) in examples.chunks(self.options.batch_size).enumerate() {
            let first = batch_idx * self.options.batch_size;
            let batch = collator
                .collate(chunk)
                .with_context(|| format!("Failed to collate example {}", first))?;
            let processed = model
                .process_batch(batch, self.options.device)
                .with_context(|| format!("Failed to process example {}", first))?;
            let output = model
                .forward(&processed)
                .with_context(|| format!("Forward pass failed at example {}", first))?;
            let mut result = model
                .predictions_and_labels(&processed, output)
                .with_context(|| format!("Failed to extract predictions at example {}", first))?;

            if result.predictions.rows() != chunk.len() || result.labels.rows() != chunk.len() {
                bail!(
                    "Batch {} returned {} prediction rows and {} label rows for {} examples",
                    batch_idx,
                    result.predictions.rows(),
                    result.labels.rows(),
                    chunk.len()
                );
            }

            if let Some(mask) = mask {
                result = mask_batch(mask, &result)?;
            }

            sink.accept(batch_idx, result)?;
            pb.inc(chunk.len() as u64);
        }

        pb.finish_and_clear();
        let tensors = sink.finish()?;
        tracing::info!("Inference complete: {} rows x {} classes", tensors.rows(), tensors.cols());
        Ok(tensors)
    }
}

/// Restrict both tensors of a batch to the masked columns
pub fn mask_batch(mask: &ClassMask, batch: &BatchPredictions) -> Result<BatchPredictions> {
    let cols = mask.popcount();
    let mut predictions = Matrix::with_cols(cols);
    let mut labels = Matrix::with_cols(cols);
    for (p, l) in batch.predictions.iter_rows().zip(batch.labels.iter_rows()) {
        predictions.push_row(&mask.apply(p)?)?;
        labels.push_row(&mask.apply(l)?)?;
    }
    Ok(BatchPredictions { predictions, labels })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{SyntheticChemData, SyntheticConfig};
    use crate::model::LinearModel;

    fn synthetic(n: usize) -> SyntheticChemData {
        SyntheticChemData::generate(&SyntheticConfig {
            num_examples: n,
            num_classes: 6,
            ..Default::default()
        })
    }

    fn assert_same(a: &EvaluatedTensors, b: &EvaluatedTensors) {
        assert_eq!(a.labels, b.labels);
        assert_eq!(a.predictions.cols(), b.predictions.cols());
        for (x, y) in a.predictions.as_slice().iter().zip(b.predictions.as_slice()) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    fn runner(batch_size: usize) -> InferenceRunner {
        InferenceRunner::new(InferenceOptions {
            batch_size,
            show_progress: false,
            ..Default::default()
        })
    }

    #[test]
    fn test_rows_match_examples() {
        let data = synthetic(13);
        let model = LinearModel::new(data.checkpoint.clone()).unwrap();

        let out = runner(1).evaluate(&model, &data, None, &SinkConfig::Memory).unwrap();

        assert_eq!(out.rows(), 13);
        assert_eq!(out.cols(), 6);
        for (i, example) in data.examples.iter().enumerate() {
            let expected: Vec<u8> = example.labels.iter().map(|l| u8::from(*l)).collect();
            assert_eq!(out.labels.row(i), expected.as_slice());
        }
    }

    #[test]
    fn test_batch_size_does_not_change_result() {
        let data = synthetic(11);
        let model = LinearModel::new(data.checkpoint.clone()).unwrap();

        let single = runner(1).evaluate(&model, &data, None, &SinkConfig::Memory).unwrap();
        let batched = runner(4).evaluate(&model, &data, None, &SinkConfig::Memory).unwrap();

        assert_eq!(single, batched);
    }

    #[test]
    fn test_mask_restricts_columns() {
        let data = synthetic(7);
        let model = LinearModel::new(data.checkpoint.clone()).unwrap();
        let mask = ClassMask::new(vec![true, false, true, false, false, true]);

        let full = runner(2).evaluate(&model, &data, None, &SinkConfig::Memory).unwrap();
        let masked = runner(2).evaluate(&model, &data, Some(&mask), &SinkConfig::Memory).unwrap();

        assert_eq!(masked.rows(), 7);
        assert_eq!(masked.cols(), 3);
        assert_eq!(masked.predictions.row(3), mask.apply(full.predictions.row(3)).unwrap().as_slice());
    }

    #[test]
    fn test_mask_width_mismatch_is_fatal() {
        let data = synthetic(3);
        let model = LinearModel::new(data.checkpoint.clone()).unwrap();
        let mask = ClassMask::all(5);

        assert!(runner(1).evaluate(&model, &data, Some(&mask), &SinkConfig::Memory).is_err());
    }

    #[test]
    fn test_buffer_sink_matches_memory() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = dir.path().join("buffer");
        let data = synthetic(9);
        let model = LinearModel::new(data.checkpoint.clone()).unwrap();

        let memory = runner(2).evaluate(&model, &data, None, &SinkConfig::Memory).unwrap();
        let buffered = runner(2)
            .evaluate(&model, &data, None, &SinkConfig::Buffer(buffer.clone()))
            .unwrap();

        assert_same(&memory, &buffered);
        assert!(buffer.join("preds00004.json").exists());
        assert_same(&load_buffer(&buffer).unwrap(), &memory);
    }

    #[test]
    fn test_buffer_refuses_stale_directory() {
        let dir = tempfile::tempdir().unwrap();
        let data = synthetic(2);
        let model = LinearModel::new(data.checkpoint.clone()).unwrap();
        let sink = SinkConfig::Buffer(dir.path().to_path_buf());

        runner(1).evaluate(&model, &data, None, &sink).unwrap();
        assert!(runner(1).evaluate(&model, &data, None, &sink).is_err());
    }

    fn write_batch(dir: &Path, idx: usize) {
        let m = Matrix::from_rows(&[vec![0.5f32]]).unwrap();
        let l = Matrix::from_rows(&[vec![1u8]]).unwrap();
        std::fs::write(buffer_file(dir, PREDS_PREFIX, idx), serde_json::to_vec(&m).unwrap()).unwrap();
        std::fs::write(buffer_file(dir, LABELS_PREFIX, idx), serde_json::to_vec(&l).unwrap()).unwrap();
    }

    fn write_manifest(dir: &Path, batches: usize, rows: usize) {
        BufferManifest { batches, rows, cols: 1 }.write(dir).unwrap();
    }

    #[test]
    fn test_load_buffer_detects_missing_partner_and_gaps() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_buffer(dir.path()).is_err());

        write_batch(dir.path(), 0);
        write_manifest(dir.path(), 1, 1);
        assert_eq!(load_buffer(dir.path()).unwrap().rows(), 1);

        std::fs::remove_file(buffer_file(dir.path(), LABELS_PREFIX, 0)).unwrap();
        assert!(load_buffer(dir.path()).is_err());

        write_batch(dir.path(), 0);
        write_batch(dir.path(), 2);
        write_manifest(dir.path(), 2, 2);
        assert!(load_buffer(dir.path()).is_err());
    }

    #[test]
    fn test_load_buffer_checks_manifest_counts() {
        let dir = tempfile::tempdir().unwrap();
        write_batch(dir.path(), 0);
        write_batch(dir.path(), 1);

        write_manifest(dir.path(), 3, 3);
        assert!(load_buffer(dir.path()).is_err());

        write_manifest(dir.path(), 2, 5);
        assert!(load_buffer(dir.path()).is_err());

        write_manifest(dir.path(), 2, 2);
        assert_eq!(load_buffer(dir.path()).unwrap().rows(), 2);
    }

    #[test]
    fn test_load_buffer_rejects_unpadded_index() {
        let dir = tempfile::tempdir().unwrap();
        write_batch(dir.path(), 0);
        write_batch(dir.path(), 1);
        write_manifest(dir.path(), 2, 2);
        assert!(load_buffer(dir.path()).is_ok());

        std::fs::copy(buffer_file(dir.path(), PREDS_PREFIX, 1), dir.path().join("preds1.json")).unwrap();
        let err = load_buffer(dir.path()).unwrap_err();
        assert!(err.to_string().contains("preds1.json"));
    }

    #[test]
    fn test_aborted_run_leaves_unreadable_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let mut data = synthetic(6);
        data.examples[3].features.push(10_000);
        let model = LinearModel::new(data.checkpoint.clone()).unwrap();

        let result = runner(1).evaluate(&model, &data, None, &SinkConfig::Buffer(dir.path().to_path_buf()));

        assert!(result.is_err());
        assert!(buffer_file(dir.path(), PREDS_PREFIX, 2).exists());
        let err = load_buffer(dir.path()).unwrap_err();
        assert!(err.to_string().contains("did not finish"));
    }

    #[test]
    fn test_empty_mask_keeps_every_row() {
        let dir = tempfile::tempdir().unwrap();
        let data = synthetic(7);
        let model = LinearModel::new(data.checkpoint.clone()).unwrap();
        let mask = ClassMask::new(vec![false; 6]);

        let memory = runner(2).evaluate(&model, &data, Some(&mask), &SinkConfig::Memory).unwrap();
        assert_eq!(memory.rows(), 7);
        assert_eq!(memory.cols(), 0);

        let buffered = runner(2)
            .evaluate(&model, &data, Some(&mask), &SinkConfig::Buffer(dir.path().join("buffer")))
            .unwrap();
        assert_eq!(buffered.rows(), 7);
    }

    #[test]
    fn test_failing_example_aborts_run() {
        let mut data = synthetic(5);
        data.examples[3].features.push(10_000);
        let model = LinearModel::new(data.checkpoint.clone()).unwrap();

        let err = runner(1).evaluate(&model, &data, None, &SinkConfig::Memory).unwrap_err();
        assert!(format!("{:#}", err).contains("example 3"));
    }
}
