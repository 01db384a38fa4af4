// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Dense row-major matrices for predictions and labels
//!
//! Rows are examples, columns are classes. Matrices are grown one row at a
//! time during inference and consumed once by the metrics reporter.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Row-major two-dimensional array with a fixed column count
///
/// The row count is stored rather than derived, so a matrix with zero
/// columns still knows how many examples it holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix<T> {
    rows: usize,
    cols: usize,
    data: Vec<T>,
}

impl<T: Copy> Matrix<T> {
    /// Empty matrix with `cols` columns and no rows
    pub fn with_cols(cols: usize) -> Self {
        Self { rows: 0, cols, data: Vec::new() }
    }

    /// Build from a flat buffer; its length must be a multiple of `cols`
    pub fn from_flat(cols: usize, data: Vec<T>) -> Result<Self> {
        let rows = if cols == 0 { 0 } else { data.len() / cols };
        let matrix = Self { rows, cols, data };
        matrix.validate()?;
        Ok(matrix)
    }

    /// Build from a list of rows, all of the same width
    pub fn from_rows(rows: &[Vec<T>]) -> Result<Self> {
        let cols = rows.first().map_or(0, Vec::len);
        let mut matrix = Self::with_cols(cols);
        for row in rows {
            matrix.push_row(row)?;
        }
        Ok(matrix)
    }

    /// Append one row
    pub fn push_row(&mut self, row: &[T]) -> Result<()> {
        if row.len() != self.cols {
            bail!("Row has {} columns, matrix has {}", row.len(), self.cols);
        }
        self.data.extend_from_slice(row);
        self.rows += 1;
        Ok(())
    }

    /// Append every row of `other`
    pub fn append(&mut self, other: &Matrix<T>) -> Result<()> {
        if other.rows == 0 {
            return Ok(());
        }
        if self.rows == 0 && self.cols != other.cols {
            // An empty accumulator adopts the width of the first real block
            self.cols = other.cols;
        }
        if other.cols != self.cols {
            bail!("Cannot append a {}-column block to a {}-column matrix", other.cols, self.cols);
        }
        self.data.extend_from_slice(&other.data);
        self.rows += other.rows;
        Ok(())
    }

    /// Concatenate blocks along the row axis
    pub fn concat(blocks: &[Matrix<T>]) -> Result<Self> {
        let cols = blocks.first().map_or(0, |b| b.cols);
        let mut out = Self::with_cols(cols);
        for block in blocks {
            out.append(block)?;
        }
        Ok(out)
    }

    /// Check that the flat buffer holds exactly `rows x cols` values (deserialized matrices skip this)
    pub fn validate(&self) -> Result<()> {
        if self.rows.checked_mul(self.cols) != Some(self.data.len()) {
            bail!(
                "Buffer of {} values does not match {} rows of {} columns",
                self.data.len(),
                self.rows,
                self.cols
            );
        }
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn row(&self, index: usize) -> &[T] {
        &self.data[index * self.cols..(index + 1) * self.cols]
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[T]> {
        (0..self.rows).map(move |i| self.row(i))
    }

    /// Values of one column, top to bottom
    pub fn column(&self, index: usize) -> impl Iterator<Item = T> + '_ {
        self.iter_rows().map(move |row| row[index])
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_read_rows() {
        let mut m = Matrix::with_cols(3);
        m.push_row(&[1, 2, 3]).unwrap();
        m.push_row(&[4, 5, 6]).unwrap();

        assert_eq!(m.rows(), 2);
        assert_eq!(m.row(1), &[4, 5, 6]);
        assert_eq!(m.column(2).collect::<Vec<_>>(), vec![3, 6]);
    }

    #[test]
    fn test_push_rejects_wrong_width() {
        let mut m: Matrix<u8> = Matrix::with_cols(2);
        assert!(m.push_row(&[1, 0, 1]).is_err());
        assert_eq!(m.rows(), 0);
    }

    #[test]
    fn test_concat_blocks() {
        let a = Matrix::from_rows(&[vec![0.1f32, 0.2]]).unwrap();
        let b = Matrix::from_rows(&[vec![0.3f32, 0.4], vec![0.5, 0.6]]).unwrap();
        let c = Matrix::concat(&[a, b]).unwrap();

        assert_eq!(c.rows(), 3);
        assert_eq!(c.row(2), &[0.5, 0.6]);
    }

    #[test]
    fn test_concat_rejects_mismatched_widths() {
        let a = Matrix::from_rows(&[vec![1u8, 0]]).unwrap();
        let b = Matrix::from_rows(&[vec![1u8, 0, 1]]).unwrap();
        assert!(Matrix::concat(&[a, b]).is_err());
    }

    #[test]
    fn test_zero_width_rows_are_counted() {
        let mut m: Matrix<f32> = Matrix::with_cols(0);
        m.push_row(&[]).unwrap();
        m.push_row(&[]).unwrap();

        let mut acc: Matrix<f32> = Matrix::with_cols(0);
        acc.append(&m).unwrap();
        acc.append(&m).unwrap();

        assert_eq!(acc.rows(), 4);
        assert_eq!(acc.iter_rows().count(), 4);
        assert!(acc.validate().is_ok());

        let json = serde_json::to_string(&acc).unwrap();
        let back: Matrix<f32> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.rows(), 4);
    }

    #[test]
    fn test_validate_rejects_wrong_row_count() {
        let bad: Matrix<u8> = serde_json::from_str(r#"{"rows":3,"cols":2,"data":[1,0,1,0]}"#).unwrap();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_from_flat_validates_length() {
        assert!(Matrix::from_flat(3, vec![1u8; 7]).is_err());
        assert_eq!(Matrix::from_flat(3, vec![1u8; 6]).unwrap().rows(), 2);
    }
}
