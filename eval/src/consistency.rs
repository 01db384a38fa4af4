// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Ontology consistency of predictions
//!
//! ChEBI classes form a subclass hierarchy and carry disjointness axioms, so
//! some prediction rows are logically impossible:
//! - a class predicted while one of its superclasses is not (implication)
//! - two disjoint classes predicted together (disjointness)
//!
//! Violations are counted on thresholded predictions; the fuzzy strengths use
//! the Reichenbach implication `a * (1 - b)` and the product t-norm `a * b`.

use crate::tensor::Matrix;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::File;
use std::path::Path;

/// Disaccharide vs. disaccharide derivative; the axiom contradicts the hierarchy
const IGNORED_DISJOINTNESS: (&str, &str) = ("36233", "63353");

/// Direct subclass edges of the ontology
#[derive(Debug, Clone, Default)]
pub struct ClassHierarchy {
    parents: HashMap<String, Vec<String>>,
    children: HashMap<String, Vec<String>>,
}

impl ClassHierarchy {
    /// Build from `(child, parent)` pairs
    pub fn from_edges<I, S>(edges: I) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        let mut hierarchy = Self::default();
        for (child, parent) in edges {
            let (child, parent) = (child.into(), parent.into());
            hierarchy.parents.entry(child.clone()).or_default().push(parent.clone());
            hierarchy.children.entry(parent).or_default().push(child);
        }
        hierarchy
    }

    /// Read a headerless `child,parent` CSV file
    pub fn load_csv(path: &Path) -> Result<Self> {
        let pairs = read_pairs(path)?;
        tracing::info!("Loaded {} subclass edges from {}", pairs.len(), path.display());
        Ok(Self::from_edges(pairs))
    }

    fn closure(edges: &HashMap<String, Vec<String>>, start: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack: Vec<&str> = vec![start];
        while let Some(node) = stack.pop() {
            for next in edges.get(node).into_iter().flatten() {
                if seen.insert(next.clone()) {
                    stack.push(next);
                }
            }
        }
        seen.remove(start);
        seen
    }

    /// All direct and indirect superclasses
    pub fn ancestors(&self, class: &str) -> HashSet<String> {
        Self::closure(&self.parents, class)
    }

    /// All direct and indirect subclasses
    pub fn descendants(&self, class: &str) -> HashSet<String> {
        Self::closure(&self.children, class)
    }

    /// Column pairs `(sub, super)` for every implication within `classes`
    pub fn implication_pairs(&self, classes: &[String]) -> Vec<(usize, usize)> {
        let index = column_index(classes);
        let mut pairs = BTreeSet::new();
        for (i, class) in classes.iter().enumerate() {
            for ancestor in self.ancestors(class) {
                if let Some(&j) = index.get(ancestor.as_str()) {
                    pairs.insert((i, j));
                }
            }
        }
        pairs.into_iter().collect()
    }
}

/// Pairs of classes that can never apply to the same molecule
#[derive(Debug, Clone, Default)]
pub struct DisjointnessAxioms {
    pairs: Vec<(String, String)>,
}

impl DisjointnessAxioms {
    pub fn new(pairs: Vec<(String, String)>) -> Self {
        Self { pairs }
    }

    /// Read a headerless `left,right` CSV file
    pub fn load_csv(path: &Path) -> Result<Self> {
        let pairs = read_pairs(path)?;
        tracing::info!("Loaded {} disjointness axioms from {}", pairs.len(), path.display());
        Ok(Self { pairs })
    }

    /// Column pairs `(low, high)` implied by the axioms, subclasses of each side included
    pub fn disjoint_pairs(&self, hierarchy: &ClassHierarchy, classes: &[String]) -> Vec<(usize, usize)> {
        let index = column_index(classes);
        let expand = |class: &str| -> Vec<usize> {
            let mut members = hierarchy.descendants(class);
            members.insert(class.to_string());
            members.iter().filter_map(|c| index.get(c.as_str()).copied()).collect()
        };

        let mut pairs = BTreeSet::new();
        for (left, right) in &self.pairs {
            if (left.as_str(), right.as_str()) == IGNORED_DISJOINTNESS {
                continue;
            }
            let right_cols = expand(right);
            for l in expand(left) {
                for r in &right_cols {
                    // disjointness is symmetric; store each column pair once
                    if l != *r {
                        pairs.insert((l.min(*r), l.max(*r)));
                    }
                }
            }
        }
        pairs.into_iter().collect()
    }
}

fn read_pairs(path: &Path) -> Result<Vec<(String, String)>> {
    let file = File::open(path).with_context(|| format!("Failed to open pair file: {}", path.display()))?;
    let mut reader = csv::ReaderBuilder::new().has_headers(false).from_reader(file);

    let mut pairs = Vec::new();
    for (idx, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("Failed to read record {} in {}", idx, path.display()))?;
        match (record.get(0), record.get(1)) {
            (Some(a), Some(b)) => pairs.push((a.trim().to_string(), b.trim().to_string())),
            _ => bail!("Record {} in {} does not hold two identifiers", idx, path.display()),
        }
    }
    Ok(pairs)
}

fn column_index(classes: &[String]) -> HashMap<&str, usize> {
    classes.iter().enumerate().map(|(i, c)| (c.as_str(), i)).collect()
}

/// Logical consistency of a prediction matrix
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub threshold: f32,
    pub implication_pairs: usize,
    pub disjoint_pairs: usize,
    pub implication_violations: usize,
    pub disjoint_violations: usize,
    /// Rows with at least one violation of either kind
    pub inconsistent_examples: usize,
    pub num_examples: usize,
    pub mean_implication_strength: f64,
    pub mean_disjoint_strength: f64,
}

impl ConsistencyReport {
    pub fn compute(
        predictions: &Matrix<f32>,
        classes: &[String],
        hierarchy: &ClassHierarchy,
        disjointness: Option<&DisjointnessAxioms>,
        threshold: f32,
    ) -> Result<Self> {
        if classes.len() != predictions.cols() {
            bail!("{} class names for {} prediction columns", classes.len(), predictions.cols());
        }

        let implications = hierarchy.implication_pairs(classes);
        let disjoint = disjointness
            .map(|d| d.disjoint_pairs(hierarchy, classes))
            .unwrap_or_default();

        let mut report = Self {
            threshold,
            implication_pairs: implications.len(),
            disjoint_pairs: disjoint.len(),
            num_examples: predictions.rows(),
            ..Default::default()
        };
        let mut impl_strength = 0.0;
        let mut disj_strength = 0.0;

        for row in predictions.iter_rows() {
            let mut violated = false;
            for &(sub, sup) in &implications {
                let (a, b) = (row[sub], row[sup]);
                impl_strength += f64::from(a * (1.0 - b));
                if a >= threshold && b < threshold {
                    report.implication_violations += 1;
                    violated = true;
                }
            }
            for &(l, r) in &disjoint {
                let (a, b) = (row[l], row[r]);
                disj_strength += f64::from(a * b);
                if a >= threshold && b >= threshold {
                    report.disjoint_violations += 1;
                    violated = true;
                }
            }
            if violated {
                report.inconsistent_examples += 1;
            }
        }

        let rows = predictions.rows() as f64;
        if !implications.is_empty() && rows > 0.0 {
            report.mean_implication_strength = impl_strength / (rows * implications.len() as f64);
        }
        if !disjoint.is_empty() && rows > 0.0 {
            report.mean_disjoint_strength = disj_strength / (rows * disjoint.len() as f64);
        }

        tracing::info!(
            "Consistency: {} implication and {} disjointness violations in {}/{} examples",
            report.implication_violations,
            report.disjoint_violations,
            report.inconsistent_examples,
            report.num_examples
        );

        Ok(report)
    }

    pub fn format(&self) -> String {
        format!(
            r#"Ontology Consistency
====================
Implication pairs:      {}
Disjoint pairs:         {}
Implication violations: {} (mean strength {:.4})
Disjoint violations:    {} (mean strength {:.4})
Inconsistent examples:  {}/{}
"#,
            self.implication_pairs,
            self.disjoint_pairs,
            self.implication_violations,
            self.mean_implication_strength,
            self.disjoint_violations,
            self.mean_disjoint_strength,
            self.inconsistent_examples,
            self.num_examples,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // A -> B -> C, D -> C, B disjoint D
    fn hierarchy() -> ClassHierarchy {
        ClassHierarchy::from_edges(vec![("A", "B"), ("B", "C"), ("D", "C")])
    }

    fn names() -> Vec<String> {
        ["A", "B", "C", "D"].iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_transitive_implications() {
        let pairs = hierarchy().implication_pairs(&names());
        assert_eq!(pairs, vec![(0, 1), (0, 2), (1, 2), (3, 2)]);
    }

    #[test]
    fn test_disjointness_expands_to_subclasses() {
        let axioms = DisjointnessAxioms::new(vec![("B".into(), "D".into())]);
        let pairs = axioms.disjoint_pairs(&hierarchy(), &names());
        assert_eq!(pairs, vec![(0, 3), (1, 3)]);
    }

    #[test]
    fn test_symmetric_axioms_count_once() {
        let axioms = DisjointnessAxioms::new(vec![("B".into(), "D".into()), ("D".into(), "B".into())]);
        assert_eq!(axioms.disjoint_pairs(&hierarchy(), &names()), vec![(0, 3), (1, 3)]);

        let preds = Matrix::from_rows(&[vec![0.1f32, 0.8, 0.9, 0.7]]).unwrap();
        let report = ConsistencyReport::compute(&preds, &names(), &hierarchy(), Some(&axioms), 0.5).unwrap();
        assert_eq!(report.disjoint_violations, 1);
    }

    #[test]
    fn test_ignored_axiom() {
        let h = ClassHierarchy::default();
        let classes = vec!["36233".to_string(), "63353".to_string()];
        let axioms = DisjointnessAxioms::new(vec![("36233".into(), "63353".into())]);
        assert!(axioms.disjoint_pairs(&h, &classes).is_empty());
    }

    #[test]
    fn test_counts_violations() {
        let axioms = DisjointnessAxioms::new(vec![("B".into(), "D".into())]);
        let preds = Matrix::from_rows(&[
            // consistent
            vec![0.1f32, 0.3, 0.7, 0.4],
            // B and D together
            vec![0.1, 0.8, 0.9, 0.7],
            // A without B
            vec![0.9, 0.2, 0.9, 0.1],
        ])
        .unwrap();

        let report = ConsistencyReport::compute(&preds, &names(), &hierarchy(), Some(&axioms), 0.5).unwrap();

        assert_eq!(report.implication_violations, 1);
        assert_eq!(report.disjoint_violations, 1);
        assert_eq!(report.inconsistent_examples, 2);
        assert!(report.mean_implication_strength > 0.0);
        assert!(report.format().contains("Inconsistent examples:  2/3"));
    }

    #[test]
    fn test_load_csv_pairs() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "A,B\nB,C").unwrap();

        let h = ClassHierarchy::load_csv(file.path()).unwrap();
        assert!(h.ancestors("A").contains("C"));
        assert!(h.descendants("C").contains("A"));
    }

    #[test]
    fn test_column_mismatch() {
        let preds = Matrix::from_rows(&[vec![0.1f32, 0.2]]).unwrap();
        assert!(ConsistencyReport::compute(&preds, &names(), &hierarchy(), None, 0.5).is_err());
    }
}
