// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Token reader constants and the padding collator
//!
//! Encoded molecules are sequences of token ids. Ids below `EMBEDDING_OFFSET`
//! are reserved for special tokens; real vocabulary entries start at the
//! offset. CI exports these values as JSON and checks them against the
//! expected table whenever this module changes.

use crate::data::Collator;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub const EMBEDDING_OFFSET: u32 = 10;
pub const CLS_TOKEN: u32 = 2;
pub const PADDING_TOKEN_INDEX: u32 = 0;
pub const MASK_TOKEN_INDEX: u32 = 1;

/// The reserved token table, as exported for CI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderConstants {
    #[serde(rename = "EMBEDDING_OFFSET")]
    pub embedding_offset: u32,
    #[serde(rename = "CLS_TOKEN")]
    pub cls_token: u32,
    #[serde(rename = "PADDING_TOKEN_INDEX")]
    pub padding_token_index: u32,
    #[serde(rename = "MASK_TOKEN_INDEX")]
    pub mask_token_index: u32,
}

impl ReaderConstants {
    /// The values compiled into this crate
    pub fn current() -> Self {
        Self {
            embedding_offset: EMBEDDING_OFFSET,
            cls_token: CLS_TOKEN,
            padding_token_index: PADDING_TOKEN_INDEX,
            mask_token_index: MASK_TOKEN_INDEX,
        }
    }

    /// Write the constants as a JSON object
    pub fn export(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write constants file: {}", path.display()))?;
        Ok(())
    }
}

/// Expected values of every exported constant
pub const EXPECTED_CONSTANTS: &[(&str, i64)] = &[
    ("EMBEDDING_OFFSET", 10),
    ("CLS_TOKEN", 2),
    ("PADDING_TOKEN_INDEX", 0),
    ("MASK_TOKEN_INDEX", 1),
];

/// One failed constant check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstantMismatch {
    pub name: String,
    pub expected: i64,
    pub actual: Option<i64>,
}

impl std::fmt::Display for ConstantMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.actual {
            Some(actual) => write!(f, "{}: expected {}, found {}", self.name, self.expected, actual),
            None => write!(f, "{}: expected {}, found nothing", self.name, self.expected),
        }
    }
}

/// Compare a parsed constants object against the expected table
///
/// Non-integer values count as missing.
pub fn verify_constants(actual: &BTreeMap<String, serde_json::Value>) -> Vec<ConstantMismatch> {
    EXPECTED_CONSTANTS
        .iter()
        .filter_map(|(name, expected)| {
            let value = actual.get(*name).and_then(serde_json::Value::as_i64);
            if value == Some(*expected) {
                None
            } else {
                Some(ConstantMismatch {
                    name: name.to_string(),
                    expected: *expected,
                    actual: value,
                })
            }
        })
        .collect()
}

/// Read a constants file and verify it
pub fn verify_constants_file(path: &Path) -> Result<Vec<ConstantMismatch>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read constants file: {}", path.display()))?;
    let parsed: BTreeMap<String, serde_json::Value> = serde_json::from_str(&content)
        .with_context(|| format!("Constants file is not a JSON object: {}", path.display()))?;
    Ok(verify_constants(&parsed))
}

/// A pre-encoded evaluation record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedExample {
    /// Source identifier (e.g. a ChEBI id or SMILES string)
    #[serde(default)]
    pub ident: Option<String>,
    /// Token ids, already shifted by `EMBEDDING_OFFSET`
    pub features: Vec<u32>,
    /// Ground truth, one entry per class
    pub labels: Vec<bool>,
}

/// A padded batch of encoded examples
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBatch {
    /// `[CLS] tokens... [PAD]...`, one row per example, all the same length
    pub tokens: Vec<Vec<u32>>,
    /// Number of non-padding positions per row
    pub lengths: Vec<usize>,
    pub labels: Vec<Vec<bool>>,
    pub idents: Vec<Option<String>>,
}

impl TokenBatch {
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Prepends the CLS token and right-pads every sequence to the batch maximum
#[derive(Debug, Clone, Default)]
pub struct TokenCollator;

impl Collator for TokenCollator {
    type Example = EncodedExample;
    type Batch = TokenBatch;

    fn collate(&self, examples: &[EncodedExample]) -> Result<TokenBatch> {
        if examples.is_empty() {
            bail!("Cannot collate an empty batch");
        }

        let n_labels = examples[0].labels.len();
        if let Some((idx, bad)) = examples.iter().enumerate().find(|(_, e)| e.labels.len() != n_labels) {
            bail!("Example {} in batch has {} labels, expected {}", idx, bad.labels.len(), n_labels);
        }

        let lengths: Vec<usize> = examples.iter().map(|e| e.features.len() + 1).collect();
        let width = lengths.iter().copied().max().unwrap_or(1);

        let tokens = examples
            .iter()
            .map(|e| {
                let mut row = Vec::with_capacity(width);
                row.push(CLS_TOKEN);
                row.extend_from_slice(&e.features);
                row.resize(width, PADDING_TOKEN_INDEX);
                row
            })
            .collect();

        Ok(TokenBatch {
            tokens,
            lengths,
            labels: examples.iter().map(|e| e.labels.clone()).collect(),
            idents: examples.iter().map(|e| e.ident.clone()).collect(),
        })
    }
}
