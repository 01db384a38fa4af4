// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Data module capability and its implementations
//!
//! A data module knows where its processed split files live and how to turn
//! a slice of examples into a model batch. The processed files themselves are
//! produced by the dataset preparation pipeline; this crate only reads them.

use crate::model::LinearCheckpoint;
use crate::reader::{EncodedExample, TokenCollator, EMBEDDING_OFFSET};
use crate::vocab::ClassVocabulary;
use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// File name of the registered test split
pub const TEST_SPLIT_FILE: &str = "test.json";

/// Turns examples into a model-ready batch
pub trait Collator {
    type Example;
    type Batch;

    fn collate(&self, examples: &[Self::Example]) -> Result<Self::Batch>;
}

/// Dataset handle used by the inference runner
pub trait DataModule {
    type Example: DeserializeOwned;
    type Collator: Collator<Example = Self::Example>;

    /// Location of a processed split file
    fn processed_file_path(&self, file_name: &str) -> PathBuf;

    /// The split evaluated when no file name is given
    fn default_file_name(&self) -> &str {
        TEST_SPLIT_FILE
    }

    fn collator(&self) -> Self::Collator;

    /// Read the serialized example list of a split
    fn load_examples(&self, file_name: Option<&str>) -> Result<Vec<Self::Example>> {
        let name = file_name.unwrap_or_else(|| self.default_file_name());
        let path = self.processed_file_path(name);
        read_example_file(&path)
    }
}

/// Read a JSON array of examples
pub fn read_example_file<E: DeserializeOwned>(path: &Path) -> Result<Vec<E>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open processed examples: {}", path.display()))?;
    let examples: Vec<E> = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse processed examples: {}", path.display()))?;
    tracing::info!("Loaded {} examples from {}", examples.len(), path.display());
    Ok(examples)
}

/// Write a JSON array of examples
pub fn write_example_file<E: Serialize>(path: &Path, examples: &[E]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string(examples)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write examples: {}", path.display()))?;
    Ok(())
}

/// Data module backed by `<root>/processed/<split file>`
#[derive(Debug, Clone)]
pub struct ProcessedDataModule {
    root: PathBuf,
}

impl ProcessedDataModule {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.root.join("processed")
    }

    /// The `classes.txt` stored next to the processed splits
    pub fn classes_file(&self) -> PathBuf {
        self.processed_dir().join("classes.txt")
    }
}

impl DataModule for ProcessedDataModule {
    type Example = EncodedExample;
    type Collator = TokenCollator;

    fn processed_file_path(&self, file_name: &str) -> PathBuf {
        self.processed_dir().join(file_name)
    }

    fn collator(&self) -> TokenCollator {
        TokenCollator
    }
}

/// Parameters of a generated dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntheticConfig {
    pub num_examples: usize,
    pub num_classes: usize,
    pub num_tokens: usize,
    /// Probability of flipping each generated label
    pub label_noise: f64,
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            num_examples: 200,
            num_classes: 24,
            num_tokens: 40,
            label_noise: 0.05,
            seed: 42,
        }
    }
}

/// Seeded in-memory dataset with a matching checkpoint, for dry runs
#[derive(Debug, Clone)]
pub struct SyntheticChemData {
    pub vocabulary: ClassVocabulary,
    pub examples: Vec<EncodedExample>,
    pub checkpoint: LinearCheckpoint,
}

impl SyntheticChemData {
    pub fn generate(config: &SyntheticConfig) -> Self {
        use rand::{Rng, SeedableRng};
        use rand_chacha::ChaCha8Rng;

        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);

        let vocabulary = ClassVocabulary::new(
            (0..config.num_classes).map(|i| (22_000 + i * 37).to_string()).collect(),
        );

        let width = EMBEDDING_OFFSET as usize + config.num_tokens;
        let weights: Vec<Vec<f32>> = (0..config.num_classes)
            .map(|_| {
                (0..width)
                    .map(|tok| {
                        if tok < EMBEDDING_OFFSET as usize {
                            0.0
                        } else {
                            rng.gen_range(-4.0f32..4.0)
                        }
                    })
                    .collect()
            })
            .collect();
        let bias: Vec<f32> = (0..config.num_classes).map(|_| rng.gen_range(-1.5f32..0.5)).collect();

        let checkpoint = LinearCheckpoint {
            num_classes: config.num_classes,
            vocab_size: width,
            weights,
            bias,
        };

        let examples = (0..config.num_examples)
            .map(|i| {
                let len = rng.gen_range(4..16);
                let features: Vec<u32> = (0..len)
                    .map(|_| EMBEDDING_OFFSET + rng.gen_range(0..config.num_tokens as u32))
                    .collect();
                let probs = checkpoint.probabilities(&features);
                let labels = probs
                    .iter()
                    .map(|p| {
                        let label = *p >= 0.5;
                        if rng.gen_bool(config.label_noise) {
                            !label
                        } else {
                            label
                        }
                    })
                    .collect();
                EncodedExample {
                    ident: Some(format!("synthetic_{}", i)),
                    features,
                    labels,
                }
            })
            .collect();

        Self {
            vocabulary,
            examples,
            checkpoint,
        }
    }

    /// Persist as a processed data directory plus checkpoint and class file
    pub fn write_to(&self, root: &Path) -> Result<ProcessedDataModule> {
        let module = ProcessedDataModule::new(root);
        write_example_file(&module.processed_file_path(TEST_SPLIT_FILE), &self.examples)?;
        std::fs::write(module.classes_file(), self.vocabulary.classes().join("\n"))?;
        self.checkpoint.save(&root.join("checkpoint.json"))?;
        Ok(module)
    }
}

impl DataModule for SyntheticChemData {
    type Example = EncodedExample;
    type Collator = TokenCollator;

    fn processed_file_path(&self, file_name: &str) -> PathBuf {
        PathBuf::from("<synthetic>").join(file_name)
    }

    fn collator(&self) -> TokenCollator {
        TokenCollator
    }

    fn load_examples(&self, file_name: Option<&str>) -> Result<Vec<EncodedExample>> {
        if let Some(name) = file_name.filter(|name| *name != TEST_SPLIT_FILE) {
            bail!("Synthetic data has only the {} split, cannot load {}", TEST_SPLIT_FILE, name);
        }
        tracing::info!("Using {} synthetic examples", self.examples.len());
        Ok(self.examples.clone())
    }
}
