// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Model capability used by the inference runner
//!
//! The runner only needs three things from a trained classifier: move a
//! collated batch onto a device, run a forward pass, and split the result
//! into prediction and label rows. Anything that can do that can be
//! evaluated, whatever its architecture or checkpoint format.

use crate::reader::{TokenBatch, EMBEDDING_OFFSET};
use crate::tensor::Matrix;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Compute device a batch is processed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Device {
    #[default]
    Cpu,
    Cuda(usize),
}

impl FromStr for Device {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_lowercase();
        match s.as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" | "gpu" => Ok(Device::Cuda(0)),
            other => match other.strip_prefix("cuda:") {
                Some(idx) => {
                    let idx = idx.parse().with_context(|| format!("Invalid CUDA device index: {}", idx))?;
                    Ok(Device::Cuda(idx))
                }
                None => bail!("Unknown device '{}' (expected cpu, cuda or cuda:N)", other),
            },
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(idx) => write!(f, "cuda:{}", idx),
        }
    }
}

impl TryFrom<String> for Device {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Device> for String {
    fn from(device: Device) -> Self {
        device.to_string()
    }
}

/// Predictions and ground truth for one batch, one row per example
#[derive(Debug, Clone, PartialEq)]
pub struct BatchPredictions {
    pub predictions: Matrix<f32>,
    pub labels: Matrix<u8>,
}

/// A trained multi-label classifier over batches of type `B`
pub trait ChemModel<B> {
    /// Batch after device placement and model-specific preprocessing
    type Processed;
    /// Raw forward-pass result
    type Output;

    fn process_batch(&self, batch: B, device: Device) -> Result<Self::Processed>;

    fn forward(&self, processed: &Self::Processed) -> Result<Self::Output>;

    /// Split a forward pass into prediction probabilities and 0/1 labels
    fn predictions_and_labels(&self, processed: &Self::Processed, output: Self::Output) -> Result<BatchPredictions>;

    /// Width of a prediction row
    fn num_classes(&self) -> usize;
}

/// Bag-of-tokens logistic classifier stored as JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearCheckpoint {
    pub num_classes: usize,
    /// Number of token ids, special tokens included
    pub vocab_size: usize,
    /// `num_classes` rows of `vocab_size` weights
    pub weights: Vec<Vec<f32>>,
    pub bias: Vec<f32>,
}

impl LinearCheckpoint {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read checkpoint: {}", path.display()))?;
        let checkpoint: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse checkpoint: {}", path.display()))?;
        checkpoint
            .validate()
            .with_context(|| format!("Invalid checkpoint: {}", path.display()))?;
        Ok(checkpoint)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string(self)?;
        std::fs::write(path, json).with_context(|| format!("Failed to write checkpoint: {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.weights.len() != self.num_classes {
            bail!("{} weight rows for {} classes", self.weights.len(), self.num_classes);
        }
        if self.bias.len() != self.num_classes {
            bail!("{} bias terms for {} classes", self.bias.len(), self.num_classes);
        }
        if let Some((class, row)) = self.weights.iter().enumerate().find(|(_, r)| r.len() != self.vocab_size) {
            bail!("Weight row {} has {} entries, vocab size is {}", class, row.len(), self.vocab_size);
        }
        Ok(())
    }

    /// Class probabilities for one token sequence
    ///
    /// Special tokens (below `EMBEDDING_OFFSET`) and ids outside the
    /// vocabulary do not contribute.
    pub fn probabilities(&self, tokens: &[u32]) -> Vec<f32> {
        let real: Vec<usize> = tokens
            .iter()
            .filter(|t| **t >= EMBEDDING_OFFSET && (**t as usize) < self.vocab_size)
            .map(|t| *t as usize)
            .collect();
        let scale = if real.is_empty() { 0.0 } else { 1.0 / real.len() as f32 };

        self.weights
            .iter()
            .zip(&self.bias)
            .map(|(row, bias)| {
                let logit = bias + scale * real.iter().map(|t| row[*t]).sum::<f32>();
                sigmoid(logit)
            })
            .collect()
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Inference wrapper around a [`LinearCheckpoint`]
#[derive(Debug, Clone)]
pub struct LinearModel {
    checkpoint: LinearCheckpoint,
}

impl LinearModel {
    pub fn new(checkpoint: LinearCheckpoint) -> Result<Self> {
        checkpoint.validate()?;
        Ok(Self { checkpoint })
    }

    pub fn load(path: &Path) -> Result<Self> {
        tracing::info!("Loading checkpoint from {}", path.display());
        Ok(Self {
            checkpoint: LinearCheckpoint::load(path)?,
        })
    }
}

impl ChemModel<TokenBatch> for LinearModel {
    type Processed = TokenBatch;
    type Output = Vec<Vec<f32>>;

    fn process_batch(&self, batch: TokenBatch, device: Device) -> Result<TokenBatch> {
        if device != Device::Cpu {
            bail!("Linear checkpoints only run on cpu, requested {}", device);
        }
        if let Some(tok) = batch.tokens.iter().flatten().find(|t| **t as usize >= self.checkpoint.vocab_size) {
            bail!("Token id {} is outside the checkpoint vocabulary ({})", tok, self.checkpoint.vocab_size);
        }
        Ok(batch)
    }

    fn forward(&self, processed: &TokenBatch) -> Result<Vec<Vec<f32>>> {
        Ok(processed
            .tokens
            .iter()
            .zip(&processed.lengths)
            .map(|(row, len)| self.checkpoint.probabilities(&row[..*len]))
            .collect())
    }

    fn predictions_and_labels(&self, processed: &TokenBatch, output: Vec<Vec<f32>>) -> Result<BatchPredictions> {
        let predictions = Matrix::from_rows(&output)?;
        let label_rows: Vec<Vec<u8>> = processed
            .labels
            .iter()
            .map(|row| row.iter().map(|l| u8::from(*l)).collect())
            .collect();
        let labels = Matrix::from_rows(&label_rows)?;

        if labels.cols() != predictions.cols() {
            bail!(
                "Model predicts {} classes but examples carry {} labels",
                predictions.cols(),
                labels.cols()
            );
        }
        Ok(BatchPredictions { predictions, labels })
    }

    fn num_classes(&self) -> usize {
        self.checkpoint.num_classes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Collator;
    use crate::reader::{EncodedExample, TokenCollator, CLS_TOKEN};

    fn checkpoint() -> LinearCheckpoint {
        // Two classes over tokens 10 and 11
        let mut w0 = vec![0.0; 12];
        let mut w1 = vec![0.0; 12];
        w0[10] = 6.0;
        w1[11] = 6.0;
        LinearCheckpoint {
            num_classes: 2,
            vocab_size: 12,
            weights: vec![w0, w1],
            bias: vec![-3.0, -3.0],
        }
    }

    #[test]
    fn test_device_parsing() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("CUDA:1".parse::<Device>().unwrap(), Device::Cuda(1));
        assert_eq!("cuda".parse::<Device>().unwrap(), Device::Cuda(0));
        assert!("tpu".parse::<Device>().is_err());
        assert_eq!(Device::Cuda(2).to_string(), "cuda:2");
    }

    #[test]
    fn test_special_tokens_are_ignored() {
        let cp = checkpoint();
        let with_special = cp.probabilities(&[CLS_TOKEN, 10, 0, 0]);
        let plain = cp.probabilities(&[10]);
        assert_eq!(with_special, plain);
        assert!(plain[0] > 0.9);
        assert!(plain[1] < 0.1);
    }

    #[test]
    fn test_full_batch_flow() {
        let model = LinearModel::new(checkpoint()).unwrap();
        let examples = vec![
            EncodedExample { ident: None, features: vec![10], labels: vec![true, false] },
            EncodedExample { ident: None, features: vec![11, 11], labels: vec![false, true] },
        ];
        let batch = TokenCollator.collate(&examples).unwrap();

        let processed = model.process_batch(batch, Device::Cpu).unwrap();
        let output = model.forward(&processed).unwrap();
        let out = model.predictions_and_labels(&processed, output).unwrap();

        assert_eq!(out.predictions.rows(), 2);
        assert_eq!(out.labels.row(1), &[0, 1]);
        assert!(out.predictions.row(1)[1] > 0.9);
    }

    #[test]
    fn test_rejects_gpu_and_unknown_tokens() {
        let model = LinearModel::new(checkpoint()).unwrap();
        let batch = TokenCollator
            .collate(&[EncodedExample { ident: None, features: vec![99], labels: vec![true, true] }])
            .unwrap();

        assert!(model.process_batch(batch.clone(), Device::Cuda(0)).is_err());
        assert!(model.process_batch(batch, Device::Cpu).is_err());
    }

    #[test]
    fn test_load_validates_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        let mut cp = checkpoint();
        cp.bias.pop();
        cp.save(&path).unwrap();

        assert!(LinearCheckpoint::load(&path).is_err());
        assert!(LinearCheckpoint::load(&dir.path().join("missing.json")).is_err());
    }
}
