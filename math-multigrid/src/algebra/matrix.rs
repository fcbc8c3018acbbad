//! Sparse block matrix stored as one row list per vector
//!
//! Row `i` holds the entries `(i, j)` of all connections of vector `i`. The
//! diagonal entry is always the first one in its row. A connection between
//! `i` and `j` is the pair of directed entries `(i, j)` and `(j, i)`.
//!
//! Entry values are raw component storage addressed through a
//! [`MatDesc`](crate::descriptor::MatDesc).

use crate::descriptor::MatDesc;

/// One directed matrix entry.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixEntry {
    col: usize,
    pub(crate) values: Vec<f64>,
}

impl MatrixEntry {
    pub(crate) fn new(col: usize, width: usize) -> Self {
        Self {
            col,
            values: vec![0.0; width],
        }
    }

    /// Destination vector of the entry
    #[inline]
    pub fn col(&self) -> usize {
        self.col
    }

    /// Raw component storage
    #[inline]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Mutable raw component storage
    #[inline]
    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }
}

/// Row lists of a level matrix.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SparseBlockMatrix {
    rows: Vec<Vec<MatrixEntry>>,
}

impl SparseBlockMatrix {
    /// Matrix with `n` rows, each holding only its diagonal entry
    pub fn with_diagonal(n: usize, width: usize) -> Self {
        Self {
            rows: (0..n).map(|i| vec![MatrixEntry::new(i, width)]).collect(),
        }
    }

    /// Number of rows
    #[inline]
    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Total number of stored entries
    pub fn nnz(&self) -> usize {
        self.rows.iter().map(Vec::len).sum()
    }

    pub(crate) fn push_row(&mut self, width: usize) -> usize {
        let i = self.rows.len();
        self.rows.push(vec![MatrixEntry::new(i, width)]);
        i
    }

    /// Entries of row `i`, diagonal first
    #[inline]
    pub fn row(&self, i: usize) -> &[MatrixEntry] {
        &self.rows[i]
    }

    /// Mutable entries of row `i`
    #[inline]
    pub fn row_mut(&mut self, i: usize) -> &mut [MatrixEntry] {
        &mut self.rows[i]
    }

    /// Diagonal entry of row `i`
    #[inline]
    pub fn diagonal(&self, i: usize) -> &MatrixEntry {
        &self.rows[i][0]
    }

    /// Mutable diagonal entry of row `i`
    #[inline]
    pub fn diagonal_mut(&mut self, i: usize) -> &mut MatrixEntry {
        &mut self.rows[i][0]
    }

    /// Entry `(i, j)` if the connection exists
    pub fn entry(&self, i: usize, j: usize) -> Option<&MatrixEntry> {
        self.rows[i].iter().find(|e| e.col == j)
    }

    /// Mutable entry `(i, j)` if the connection exists
    pub fn entry_mut(&mut self, i: usize, j: usize) -> Option<&mut MatrixEntry> {
        self.rows[i].iter_mut().find(|e| e.col == j)
    }

    /// Position of entry `(i, j)` inside row `i`
    pub fn position(&self, i: usize, j: usize) -> Option<usize> {
        self.rows[i].iter().position(|e| e.col == j)
    }

    /// Entry `(i, j)`, inserted with `width` zeroed components when missing
    pub fn ensure_entry(&mut self, i: usize, j: usize, width: usize) -> &mut MatrixEntry {
        let pos = match self.position(i, j) {
            Some(pos) => pos,
            None => {
                self.rows[i].push(MatrixEntry::new(j, width));
                self.rows[i].len() - 1
            }
        };
        &mut self.rows[i][pos]
    }

    /// Remove entry `(i, j)`; the diagonal is never removed
    pub fn remove_entry(&mut self, i: usize, j: usize) -> bool {
        if i == j {
            return false;
        }
        match self.position(i, j) {
            Some(pos) => {
                self.rows[i].remove(pos);
                true
            }
            None => false,
        }
    }

    /// Column indices of row `i` below the diagonal, ascending
    pub fn lower_cols(&self, i: usize) -> Vec<usize> {
        let mut cols: Vec<usize> = self.rows[i].iter().map(|e| e.col).filter(|&j| j < i).collect();
        cols.sort_unstable();
        cols
    }

    pub(crate) fn grow_entries(&mut self, width: impl Fn(usize, usize) -> usize) {
        for (i, row) in self.rows.iter_mut().enumerate() {
            for e in row.iter_mut() {
                let w = width(i, e.col);
                if e.values.len() < w {
                    e.values.resize(w, 0.0);
                }
            }
        }
    }
}

/// Owned copy of a level matrix in compact layout.
///
/// Temporary matrices (consistent copies, factorizations) live here instead
/// of in the grid storage, so they are released when the owner drops them.
#[derive(Debug, Clone)]
pub struct LevelMatrix {
    /// Row lists in compact layout
    pub matrix: SparseBlockMatrix,
    /// Descriptor addressing `matrix`
    pub desc: MatDesc,
}

impl LevelMatrix {
    /// Coefficient block `(i, j)` as a row-major slice
    pub fn block(&self, i: usize, j: usize) -> Option<&[f64]> {
        self.matrix.entry(i, j).map(|e| e.values())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagonal_first_and_entry_lookup() {
        let mut m = SparseBlockMatrix::with_diagonal(3, 1);
        m.ensure_entry(0, 2, 1).values_mut()[0] = -1.0;
        m.ensure_entry(0, 1, 1).values_mut()[0] = -2.0;
        assert_eq!(m.diagonal(0).col(), 0);
        assert_eq!(m.row(0).len(), 3);
        assert_eq!(m.entry(0, 2).unwrap().values()[0], -1.0);
        assert!(m.entry(1, 0).is_none());
        assert_eq!(m.lower_cols(0), Vec::<usize>::new());

        m.ensure_entry(2, 1, 1);
        m.ensure_entry(2, 0, 1);
        assert_eq!(m.lower_cols(2), vec![0, 1]);
        assert_eq!(m.nnz(), 7);

        assert!(!m.remove_entry(1, 1));
        assert!(m.remove_entry(2, 0));
        assert_eq!(m.nnz(), 6);
    }
}
