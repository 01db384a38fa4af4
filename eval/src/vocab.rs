// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Class vocabularies and common-class alignment between dataset versions
//!
//! Each ChEBI snapshot ships a `classes.txt` listing one class identifier per
//! line. The line position is the column index of that class in prediction
//! and label tensors, so two snapshots can only be compared after restricting
//! both to the classes they share.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Ordered list of class identifiers for one dataset version
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassVocabulary {
    classes: Vec<String>,
}

impl ClassVocabulary {
    pub fn new(classes: Vec<String>) -> Self {
        Self { classes }
    }

    /// Read a newline-delimited class file
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open class vocabulary: {}", path.display()))?;
        let reader = BufReader::new(file);
        let mut classes = Vec::new();

        for (idx, line) in reader.lines().enumerate() {
            let line = line.with_context(|| format!("Failed to read line {} in {}", idx, path.display()))?;
            let ident = line.trim();
            if ident.is_empty() {
                continue;
            }
            classes.push(ident.to_string());
        }

        tracing::debug!("Loaded {} classes from {}", classes.len(), path.display());
        Ok(Self { classes })
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn contains(&self, ident: &str) -> bool {
        self.classes.iter().any(|c| c == ident)
    }

    /// Column index of a class, if present
    pub fn position(&self, ident: &str) -> Option<usize> {
        self.classes.iter().position(|c| c == ident)
    }
}

/// Boolean column selector, one entry per class of a vocabulary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassMask {
    keep: Vec<bool>,
}

impl ClassMask {
    pub fn new(keep: Vec<bool>) -> Self {
        Self { keep }
    }

    /// Mask that keeps every column
    pub fn all(len: usize) -> Self {
        Self { keep: vec![true; len] }
    }

    pub fn len(&self) -> usize {
        self.keep.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keep.is_empty()
    }

    /// Number of selected columns
    pub fn popcount(&self) -> usize {
        self.keep.iter().filter(|k| **k).count()
    }

    pub fn as_slice(&self) -> &[bool] {
        &self.keep
    }

    /// Keep the masked positions of `values`, in order
    pub fn apply<T: Copy>(&self, values: &[T]) -> Result<Vec<T>> {
        if values.len() != self.keep.len() {
            bail!(
                "Mask covers {} classes but the row has {} columns",
                self.keep.len(),
                values.len()
            );
        }
        Ok(values
            .iter()
            .zip(&self.keep)
            .filter(|(_, keep)| **keep)
            .map(|(v, _)| *v)
            .collect())
    }

    /// Class names of the selected columns
    pub fn select_names(&self, vocabulary: &ClassVocabulary) -> Result<Vec<String>> {
        if vocabulary.len() != self.keep.len() {
            bail!(
                "Mask covers {} classes but the vocabulary has {}",
                self.keep.len(),
                vocabulary.len()
            );
        }
        Ok(vocabulary
            .classes()
            .iter()
            .zip(&self.keep)
            .filter(|(_, keep)| **keep)
            .map(|(name, _)| name.clone())
            .collect())
    }
}

/// Result of aligning two vocabularies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VocabularyAlignment {
    /// Classes of A that also occur in B, in A's order
    pub common: Vec<String>,
    pub mask_a: ClassMask,
    pub mask_b: ClassMask,
}

/// Intersect two vocabularies, keeping A's order
pub fn align(a: &ClassVocabulary, b: &ClassVocabulary) -> VocabularyAlignment {
    let in_b: HashSet<&str> = b.classes().iter().map(String::as_str).collect();
    let common: Vec<String> = a
        .classes()
        .iter()
        .filter(|c| in_b.contains(c.as_str()))
        .cloned()
        .collect();

    let common_set: HashSet<&str> = common.iter().map(String::as_str).collect();
    let mask_of = |v: &ClassVocabulary| {
        ClassMask::new(v.classes().iter().map(|c| common_set.contains(c.as_str())).collect())
    };

    let alignment = VocabularyAlignment {
        mask_a: mask_of(a),
        mask_b: mask_of(b),
        common,
    };

    tracing::info!(
        "Aligned vocabularies: {} x {} classes, {} in common",
        a.len(),
        b.len(),
        alignment.common.len()
    );

    alignment
}

/// Load both class files and align them
pub fn align_files(path_a: &Path, path_b: &Path) -> Result<(ClassVocabulary, ClassVocabulary, VocabularyAlignment)> {
    let a = ClassVocabulary::load(path_a)?;
    let b = ClassVocabulary::load(path_b)?;
    let alignment = align(&a, &b);
    Ok((a, b, alignment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;

    fn vocab(ids: &[&str]) -> ClassVocabulary {
        ClassVocabulary::new(ids.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_align_preserves_first_order() {
        let a = vocab(&["10", "20", "30", "40"]);
        let b = vocab(&["40", "99", "20"]);

        let alignment = align(&a, &b);

        assert_eq!(alignment.common, vec!["20", "40"]);
        assert_eq!(alignment.mask_a.as_slice(), &[false, true, false, true]);
        assert_eq!(alignment.mask_b.as_slice(), &[true, false, true]);
    }

    #[test]
    fn test_chebi_version_sizes() {
        // 854 classes in the newer snapshot, 709 in the older, 701 shared
        let a: Vec<String> = (0..854).map(|i| format!("CHEBI:{}", 1000 + i)).collect();
        let mut b: Vec<String> = a.iter().rev().take(701).cloned().collect();
        b.extend((0..8).map(|i| format!("CHEBI:{}", 90000 + i)));

        let alignment = align(&ClassVocabulary::new(a), &ClassVocabulary::new(b));

        assert_eq!(alignment.common.len(), 701);
        assert_eq!(alignment.mask_a.len(), 854);
        assert_eq!(alignment.mask_b.len(), 709);
        assert_eq!(alignment.mask_a.popcount(), 701);
        assert_eq!(alignment.mask_b.popcount(), 701);
    }

    #[test]
    fn test_load_skips_blank_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "22723\n 33659 \n\n24431").unwrap();

        let v = ClassVocabulary::load(file.path()).unwrap();

        assert_eq!(v.classes(), &["22723", "33659", "24431"]);
        assert_eq!(v.position("24431"), Some(2));
    }

    #[test]
    fn test_load_missing_file_names_path() {
        let err = ClassVocabulary::load(Path::new("/nonexistent/classes.txt")).unwrap_err();
        assert!(format!("{:#}", err).contains("/nonexistent/classes.txt"));
    }

    #[test]
    fn test_mask_apply_and_names() {
        let mask = ClassMask::new(vec![true, false, true]);
        assert_eq!(mask.apply(&[0.9f32, 0.1, 0.4]).unwrap(), vec![0.9, 0.4]);
        assert!(mask.apply(&[1u8, 0]).is_err());

        let names = mask.select_names(&vocab(&["a", "b", "c"])).unwrap();
        assert_eq!(names, vec!["a", "c"]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_common_is_subset_and_counts_match(
            a in prop::collection::hash_set(0u32..60, 0..40),
            b in prop::collection::hash_set(0u32..60, 0..40)
        ) {
            let va = ClassVocabulary::new(a.iter().map(|x| x.to_string()).collect());
            let vb = ClassVocabulary::new(b.iter().map(|x| x.to_string()).collect());
            let alignment = align(&va, &vb);

            for c in &alignment.common {
                prop_assert!(va.contains(c));
                prop_assert!(vb.contains(c));
            }
            prop_assert_eq!(alignment.mask_a.popcount(), alignment.common.len());
            prop_assert_eq!(alignment.mask_b.popcount(), alignment.common.len());
        }

        #[test]
        fn prop_masking_is_idempotent(
            values in prop::collection::vec(0.0f32..1.0, 1..30),
            seed in prop::collection::vec(any::<bool>(), 30)
        ) {
            let mask = ClassMask::new(seed[..values.len()].to_vec());
            let once = mask.apply(&values).unwrap();
            let again = ClassMask::all(once.len()).apply(&once).unwrap();
            prop_assert_eq!(once.len(), mask.popcount());
            prop_assert_eq!(once, again);
        }
    }
}
