//! Link weight storage.
//!
//! Links are cells of a square matrix over a partition's element space:
//! row = target slot element, column = source gate element, weight 0 means
//! "no link". Two backings implement the same contract: a per-row sparse
//! layout for the common mostly-empty nets, and a row-major dense layout
//! for small, heavily connected ones. The backing is chosen when the
//! partition is created and kept for its lifetime.

#[cfg(feature = "parallel")]
use rayon::prelude::*;
#[cfg(feature = "simd")]
use wide::f32x4;

use crate::error::NetResult;

/// Weights smaller than this are treated as removed by decay operators.
pub const DECAY_EPSILON: f32 = 1e-5;

#[derive(Debug, Clone, PartialEq)]
pub struct SparseWeights {
    dim: usize,
    /// Per-row cells, sorted by column.
    rows: Vec<Vec<(u32, f32)>>,
    /// Per-column row occupancy, sorted; doubles as the out-degree index.
    cols: Vec<Vec<u32>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DenseWeights {
    dim: usize,
    /// Row-major, stride `dim`.
    w: Vec<f32>,
    /// Per-column nonzero count.
    col_nnz: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WeightMatrix {
    Sparse(SparseWeights),
    Dense(DenseWeights),
}

impl WeightMatrix {
    pub fn new(dim: usize, sparse: bool) -> NetResult<Self> {
        if sparse {
            let mut rows = Vec::new();
            try_grow(&mut rows, dim, Vec::new())?;
            let mut cols = Vec::new();
            try_grow(&mut cols, dim, Vec::new())?;
            Ok(WeightMatrix::Sparse(SparseWeights { dim, rows, cols }))
        } else {
            let mut w = Vec::new();
            try_grow(&mut w, dim.checked_mul(dim).unwrap_or(usize::MAX), 0.0)?;
            let mut col_nnz = Vec::new();
            try_grow(&mut col_nnz, dim, 0)?;
            Ok(WeightMatrix::Dense(DenseWeights { dim, w, col_nnz }))
        }
    }

    pub fn dim(&self) -> usize {
        match self {
            WeightMatrix::Sparse(m) => m.dim,
            WeightMatrix::Dense(m) => m.dim,
        }
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, WeightMatrix::Sparse(_))
    }

    pub fn get(&self, row: usize, col: usize) -> f32 {
        match self {
            WeightMatrix::Sparse(m) => {
                let cells = &m.rows[row];
                match cells.binary_search_by_key(&(col as u32), |&(c, _)| c) {
                    Ok(i) => cells[i].1,
                    Err(_) => 0.0,
                }
            }
            WeightMatrix::Dense(m) => m.w[row * m.dim + col],
        }
    }

    /// Writes one cell; weight 0 removes it.
    pub fn set(&mut self, row: usize, col: usize, weight: f32) {
        match self {
            WeightMatrix::Sparse(m) => {
                let cells = &mut m.rows[row];
                match cells.binary_search_by_key(&(col as u32), |&(c, _)| c) {
                    Ok(i) => {
                        if weight == 0.0 {
                            cells.remove(i);
                            let occ = &mut m.cols[col];
                            if let Ok(j) = occ.binary_search(&(row as u32)) {
                                occ.remove(j);
                            }
                        } else {
                            cells[i].1 = weight;
                        }
                    }
                    Err(i) => {
                        if weight != 0.0 {
                            cells.insert(i, (col as u32, weight));
                            let occ = &mut m.cols[col];
                            if let Err(j) = occ.binary_search(&(row as u32)) {
                                occ.insert(j, row as u32);
                            }
                        }
                    }
                }
            }
            WeightMatrix::Dense(m) => {
                let cell = &mut m.w[row * m.dim + col];
                let was = *cell != 0.0;
                let is = weight != 0.0;
                *cell = weight;
                if was != is {
                    if is {
                        m.col_nnz[col] += 1;
                    } else {
                        m.col_nnz[col] -= 1;
                    }
                }
            }
        }
    }

    /// Grows the matrix to `new_dim` x `new_dim`, preserving all cells.
    pub fn grow(&mut self, new_dim: usize) -> NetResult<()> {
        if new_dim <= self.dim() {
            return Ok(());
        }
        match self {
            WeightMatrix::Sparse(m) => {
                try_grow(&mut m.rows, new_dim, Vec::new())?;
                try_grow(&mut m.cols, new_dim, Vec::new())?;
                m.dim = new_dim;
            }
            WeightMatrix::Dense(m) => {
                let mut w = Vec::new();
                try_grow(&mut w, new_dim.checked_mul(new_dim).unwrap_or(usize::MAX), 0.0)?;
                try_grow(&mut m.col_nnz, new_dim, 0)?;
                for row in 0..m.dim {
                    w[row * new_dim..row * new_dim + m.dim]
                        .copy_from_slice(&m.w[row * m.dim..(row + 1) * m.dim]);
                }
                m.w = w;
                m.dim = new_dim;
            }
        }
        Ok(())
    }

    /// Removes every cell of `row` (all incoming links of a slot element).
    pub fn clear_row(&mut self, row: usize) {
        match self {
            WeightMatrix::Sparse(m) => {
                for (col, _) in std::mem::take(&mut m.rows[row]) {
                    let occ = &mut m.cols[col as usize];
                    if let Ok(j) = occ.binary_search(&(row as u32)) {
                        occ.remove(j);
                    }
                }
            }
            WeightMatrix::Dense(m) => {
                for col in 0..m.dim {
                    let cell = &mut m.w[row * m.dim + col];
                    if *cell != 0.0 {
                        *cell = 0.0;
                        m.col_nnz[col] -= 1;
                    }
                }
            }
        }
    }

    /// Removes every cell of `col` (all outgoing links of a gate element).
    pub fn clear_col(&mut self, col: usize) {
        match self {
            WeightMatrix::Sparse(m) => {
                for row in std::mem::take(&mut m.cols[col]) {
                    let cells = &mut m.rows[row as usize];
                    if let Ok(i) = cells.binary_search_by_key(&(col as u32), |&(c, _)| c) {
                        cells.remove(i);
                    }
                }
            }
            WeightMatrix::Dense(m) => {
                for row in 0..m.dim {
                    let cell = &mut m.w[row * m.dim + col];
                    if *cell != 0.0 {
                        *cell = 0.0;
                    }
                }
                m.col_nnz[col] = 0;
            }
        }
    }

    /// Nonzero cells of `row` as `(col, weight)`, ascending by column.
    pub fn row_nonzero(&self, row: usize) -> Vec<(usize, f32)> {
        match self {
            WeightMatrix::Sparse(m) => m.rows[row]
                .iter()
                .map(|&(c, w)| (c as usize, w))
                .collect(),
            WeightMatrix::Dense(m) => (0..m.dim)
                .filter_map(|c| {
                    let w = m.w[row * m.dim + c];
                    (w != 0.0).then_some((c, w))
                })
                .collect(),
        }
    }

    /// Nonzero cells of `col` as `(row, weight)`, ascending by row.
    pub fn col_nonzero(&self, col: usize) -> Vec<(usize, f32)> {
        match self {
            WeightMatrix::Sparse(m) => m.cols[col]
                .iter()
                .filter_map(|&r| {
                    let cells = &m.rows[r as usize];
                    cells
                        .binary_search_by_key(&(col as u32), |&(c, _)| c)
                        .ok()
                        .map(|i| (r as usize, cells[i].1))
                })
                .collect(),
            WeightMatrix::Dense(m) => (0..m.dim)
                .filter_map(|r| {
                    let w = m.w[r * m.dim + col];
                    (w != 0.0).then_some((r, w))
                })
                .collect(),
        }
    }

    /// Number of links leaving the gate element `col`.
    pub fn out_degree(&self, col: usize) -> usize {
        match self {
            WeightMatrix::Sparse(m) => m.cols[col].len(),
            WeightMatrix::Dense(m) => m.col_nnz[col] as usize,
        }
    }

    pub fn nonzero_count(&self) -> usize {
        match self {
            WeightMatrix::Sparse(m) => m.rows.iter().map(Vec::len).sum(),
            WeightMatrix::Dense(m) => m.w.iter().filter(|&&w| w != 0.0).count(),
        }
    }

    /// Applies `f` to every nonzero cell of `col`; a result of 0 removes
    /// the cell.
    pub fn update_col(&mut self, col: usize, mut f: impl FnMut(f32) -> f32) {
        match self {
            WeightMatrix::Sparse(m) => {
                let occupied = m.cols[col].clone();
                for row in occupied {
                    let cells = &mut m.rows[row as usize];
                    if let Ok(i) = cells.binary_search_by_key(&(col as u32), |&(c, _)| c) {
                        let updated = f(cells[i].1);
                        if updated == 0.0 {
                            cells.remove(i);
                            let occ = &mut m.cols[col];
                            if let Ok(j) = occ.binary_search(&row) {
                                occ.remove(j);
                            }
                        } else {
                            cells[i].1 = updated;
                        }
                    }
                }
            }
            WeightMatrix::Dense(m) => {
                for row in 0..m.dim {
                    let cell = &mut m.w[row * m.dim + col];
                    if *cell != 0.0 {
                        let updated = f(*cell);
                        if updated == 0.0 {
                            m.col_nnz[col] -= 1;
                        }
                        *cell = updated;
                    }
                }
            }
        }
    }

    /// Dense block `out[i * cols.len() + j] = w[rows[i], cols[j]]`.
    pub fn get_block(&self, rows: &[usize], cols: &[usize]) -> Vec<f32> {
        let mut out = Vec::with_capacity(rows.len() * cols.len());
        for &r in rows {
            for &c in cols {
                out.push(self.get(r, c));
            }
        }
        out
    }

    /// Writes a dense block produced by [`get_block`](Self::get_block);
    /// zeros remove cells.
    pub fn set_block(&mut self, rows: &[usize], cols: &[usize], block: &[f32]) {
        debug_assert_eq!(block.len(), rows.len() * cols.len());
        for (i, &r) in rows.iter().enumerate() {
            for (j, &c) in cols.iter().enumerate() {
                self.set(r, c, block[i * cols.len() + j]);
            }
        }
    }

    /// All nonzero cells as `(row, col, weight)`, row-major.
    pub fn nonzero_triplets(&self) -> Vec<(u32, u32, f32)> {
        match self {
            WeightMatrix::Sparse(m) => {
                let mut out = Vec::with_capacity(self.nonzero_count());
                for (row, cells) in m.rows.iter().enumerate() {
                    for &(col, w) in cells {
                        out.push((row as u32, col, w));
                    }
                }
                out
            }
            WeightMatrix::Dense(m) => {
                let mut out = Vec::new();
                for row in 0..m.dim {
                    for col in 0..m.dim {
                        let w = m.w[row * m.dim + col];
                        if w != 0.0 {
                            out.push((row as u32, col as u32, w));
                        }
                    }
                }
                out
            }
        }
    }

    /// Computes `a_in[row] = sum over cols of w[row, col] * a_eff[col]`.
    ///
    /// `a_eff` and `a_in` must both have length `dim`.
    pub fn propagate(&self, a_eff: &[f32], a_in: &mut [f32]) {
        debug_assert_eq!(a_eff.len(), self.dim());
        debug_assert_eq!(a_in.len(), self.dim());
        match self {
            WeightMatrix::Sparse(m) => m.propagate(a_eff, a_in),
            WeightMatrix::Dense(m) => m.propagate(a_eff, a_in),
        }
    }
}

impl SparseWeights {
    #[cfg(not(feature = "parallel"))]
    fn propagate(&self, a_eff: &[f32], a_in: &mut [f32]) {
        for (out, cells) in a_in.iter_mut().zip(self.rows.iter()) {
            *out = cells
                .iter()
                .map(|&(c, w)| w * a_eff[c as usize])
                .sum();
        }
    }

    #[cfg(feature = "parallel")]
    fn propagate(&self, a_eff: &[f32], a_in: &mut [f32]) {
        a_in.par_iter_mut()
            .zip(self.rows.par_iter())
            .for_each(|(out, cells)| {
                *out = cells
                    .iter()
                    .map(|&(c, w)| w * a_eff[c as usize])
                    .sum();
            });
    }
}

impl DenseWeights {
    #[cfg(not(feature = "parallel"))]
    fn propagate(&self, a_eff: &[f32], a_in: &mut [f32]) {
        for (row, out) in a_in.iter_mut().enumerate() {
            *out = dot(&self.w[row * self.dim..(row + 1) * self.dim], a_eff);
        }
    }

    #[cfg(feature = "parallel")]
    fn propagate(&self, a_eff: &[f32], a_in: &mut [f32]) {
        let w = &self.w;
        let dim = self.dim;
        a_in.par_iter_mut().enumerate().for_each(|(row, out)| {
            *out = dot(&w[row * dim..(row + 1) * dim], a_eff);
        });
    }
}

#[cfg(not(feature = "simd"))]
fn dot(row: &[f32], a: &[f32]) -> f32 {
    row.iter().zip(a.iter()).map(|(&w, &v)| w * v).sum()
}

#[cfg(feature = "simd")]
fn dot(row: &[f32], a: &[f32]) -> f32 {
    let n = row.len();
    let simd_end = n - (n % 4);
    let mut acc = f32x4::splat(0.0);
    for i in (0..simd_end).step_by(4) {
        let w = f32x4::from([row[i], row[i + 1], row[i + 2], row[i + 3]]);
        let v = f32x4::from([a[i], a[i + 1], a[i + 2], a[i + 3]]);
        acc += w * v;
    }
    let mut total = acc.reduce_add();
    for i in simd_end..n {
        total += row[i] * a[i];
    }
    total
}

/// Fallible grow-to-length for backing arrays; never shrinks.
pub(crate) fn try_grow<T: Clone>(v: &mut Vec<T>, new_len: usize, fill: T) -> NetResult<()> {
    if new_len > v.len() {
        v.try_reserve(new_len - v.len())?;
        v.resize(new_len, fill);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetError;

    fn both(dim: usize) -> [WeightMatrix; 2] {
        [
            WeightMatrix::new(dim, true).unwrap(),
            WeightMatrix::new(dim, false).unwrap(),
        ]
    }

    #[test]
    fn set_get_remove_roundtrip() {
        for mut m in both(6) {
            m.set(2, 4, 0.5);
            m.set(2, 1, -0.25);
            assert_eq!(m.get(2, 4), 0.5);
            assert_eq!(m.get(2, 1), -0.25);
            assert_eq!(m.get(4, 2), 0.0);
            assert_eq!(m.nonzero_count(), 2);

            m.set(2, 4, 0.0);
            assert_eq!(m.get(2, 4), 0.0);
            assert_eq!(m.nonzero_count(), 1);
            assert_eq!(m.out_degree(4), 0);
            assert_eq!(m.out_degree(1), 1);
        }
    }

    #[test]
    fn row_and_col_enumeration_are_sorted() {
        for mut m in both(8) {
            m.set(3, 7, 0.7);
            m.set(3, 0, 0.1);
            m.set(5, 0, 0.9);
            assert_eq!(m.row_nonzero(3), vec![(0, 0.1), (7, 0.7)]);
            assert_eq!(m.col_nonzero(0), vec![(3, 0.1), (5, 0.9)]);
            assert_eq!(m.out_degree(0), 2);
        }
    }

    #[test]
    fn clear_row_and_col_drop_all_cells() {
        for mut m in both(5) {
            m.set(1, 2, 0.5);
            m.set(1, 3, 0.5);
            m.set(4, 2, 0.5);
            m.clear_row(1);
            assert!(m.row_nonzero(1).is_empty());
            assert_eq!(m.out_degree(2), 1);
            m.clear_col(2);
            assert_eq!(m.get(4, 2), 0.0);
            assert_eq!(m.nonzero_count(), 0);
        }
    }

    #[test]
    fn grow_preserves_cells_and_degrees() {
        for mut m in both(4) {
            m.set(1, 3, 0.5);
            m.set(3, 0, -0.5);
            m.grow(9).unwrap();
            assert_eq!(m.dim(), 9);
            assert_eq!(m.get(1, 3), 0.5);
            assert_eq!(m.get(3, 0), -0.5);
            assert_eq!(m.out_degree(3), 1);
            m.set(8, 8, 1.0);
            assert_eq!(m.get(8, 8), 1.0);
        }
    }

    #[test]
    fn oversized_grow_fails_cleanly_on_both_backings() {
        for mut m in both(8) {
            m.set(2, 5, 0.25);
            let err = m.grow(usize::MAX / 2).unwrap_err();
            assert!(matches!(err, NetError::Capacity(_)));
            assert_eq!(m.dim(), 8);
            assert_eq!(m.get(2, 5), 0.25);
            m.set(3, 5, 0.5);
            assert_eq!(m.out_degree(5), 2);
        }
    }

    #[test]
    fn propagate_matches_by_hand_result() {
        for mut m in both(4) {
            // a_in[2] = 0.5 * a[0] + 2.0 * a[1]
            m.set(2, 0, 0.5);
            m.set(2, 1, 2.0);
            let a = [1.0, 0.25, 0.0, 0.0];
            let mut a_in = [9.0; 4];
            m.propagate(&a, &mut a_in);
            assert_eq!(a_in, [0.0, 0.0, 1.0, 0.0]);
        }
    }

    #[test]
    fn sparse_and_dense_agree_on_random_fill() {
        let dim = 17;
        let mut sparse = WeightMatrix::new(dim, true).unwrap();
        let mut dense = WeightMatrix::new(dim, false).unwrap();
        // Cheap deterministic scatter.
        let mut x = 9_u32;
        for _ in 0..120 {
            x = x.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let row = (x >> 8) as usize % dim;
            let col = (x >> 16) as usize % dim;
            let w = ((x % 19) as f32 - 9.0) / 7.0;
            sparse.set(row, col, w);
            dense.set(row, col, w);
        }
        let a: Vec<f32> = (0..dim).map(|i| (i as f32 * 0.3).sin()).collect();
        let mut out_sparse = vec![0.0; dim];
        let mut out_dense = vec![0.0; dim];
        sparse.propagate(&a, &mut out_sparse);
        dense.propagate(&a, &mut out_dense);
        for (s, d) in out_sparse.iter().zip(out_dense.iter()) {
            assert!((s - d).abs() < 1e-5, "sparse {s} != dense {d}");
        }
        assert_eq!(sparse.nonzero_count(), dense.nonzero_count());
        for col in 0..dim {
            assert_eq!(sparse.out_degree(col), dense.out_degree(col));
        }
    }

    #[test]
    fn block_read_write_roundtrip() {
        for mut m in both(6) {
            let rows = [4usize, 1];
            let cols = [0usize, 5, 2];
            let block = [0.1, 0.2, 0.3, 0.0, -0.4, 0.0];
            m.set_block(&rows, &cols, &block);
            assert_eq!(m.get(4, 5), 0.2);
            assert_eq!(m.get(1, 5), -0.4);
            assert_eq!(m.get_block(&rows, &cols), block.to_vec());
            assert_eq!(m.nonzero_count(), 4);
        }
    }

    #[test]
    fn update_col_scales_and_removes() {
        for mut m in both(4) {
            m.set(0, 1, 0.8);
            m.set(2, 1, DECAY_EPSILON / 2.0);
            m.set(3, 2, 0.5);
            m.update_col(1, |w| {
                let decayed = w * 0.5;
                if decayed < DECAY_EPSILON {
                    0.0
                } else {
                    decayed
                }
            });
            assert_eq!(m.get(0, 1), 0.4);
            assert_eq!(m.get(2, 1), 0.0);
            assert_eq!(m.get(3, 2), 0.5);
            assert_eq!(m.out_degree(1), 1);
        }
    }

    #[test]
    fn triplets_enumerate_row_major() {
        for mut m in both(5) {
            m.set(3, 1, 0.3);
            m.set(0, 4, 0.9);
            m.set(3, 0, 0.1);
            assert_eq!(
                m.nonzero_triplets(),
                vec![(0, 4, 0.9), (3, 0, 0.1), (3, 1, 0.3)]
            );
        }
    }
}
