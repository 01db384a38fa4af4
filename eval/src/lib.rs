// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Evaluation harness for ChEBI multi-label class prediction models
//!
//! This crate provides:
//! - Class vocabulary alignment across ChEBI snapshots (common-class masks)
//! - Data module and model capabilities with a token collator and linear checkpoint
//! - Batched inference with in-memory or on-disk (buffer directory) accumulation
//! - Multi-label metrics (macro/micro F1, precision, recall, balanced accuracy)
//! - Ontology consistency checks (implication and disjointness violations)
//! - Reproducible evaluation pipeline with seeded synthetic data

pub mod consistency;
pub mod data;
pub mod inference;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod reader;
pub mod tensor;
pub mod vocab;

pub use consistency::{ClassHierarchy, ConsistencyReport, DisjointnessAxioms};
pub use data::{Collator, DataModule, ProcessedDataModule, SyntheticChemData, SyntheticConfig};
pub use inference::{load_buffer, BufferManifest, EvaluatedTensors, InferenceOptions, InferenceRunner, SinkConfig};
pub use metrics::{ConfusionMatrix, MetricsOptions, MetricsReport, MultilabelMetrics, ReportFormat, ZeroSupportPolicy};
pub use model::{ChemModel, Device, LinearCheckpoint, LinearModel};
pub use pipeline::{EvaluationConfig, EvaluationPipeline, EvaluationResults};
pub use reader::{EncodedExample, ReaderConstants, TokenCollator};
pub use tensor::Matrix;
pub use vocab::{align, ClassMask, ClassVocabulary, VocabularyAlignment};
