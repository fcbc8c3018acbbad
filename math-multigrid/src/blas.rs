//! Level BLAS on descriptors
//!
//! All routines work on the vectors of one level and address components
//! through descriptors. Scalar descriptors take the single-offset path;
//! everything else resolves the offsets per geometric type.

use crate::algebra::{SparseBlockMatrix, Vector};
use crate::descriptor::{MAX_BLOCK_SIZE, MatDesc, VecDesc, check_vec_mat_vec, check_vec_vec};
use crate::error::{MgError, Result};

/// `x = value` on every component
pub fn set(vectors: &mut [Vector], x: &VecDesc, value: f64) {
    if let Some(c) = x.scalar_comp() {
        for v in vectors.iter_mut().filter(|v| x.defines(v.gtype())) {
            v.values[c] = value;
        }
        return;
    }
    for v in vectors.iter_mut() {
        for &c in x.components(v.gtype()) {
            v.values[c] = value;
        }
    }
}

fn binary(
    vectors: &mut [Vector],
    dest: &VecDesc,
    src: &VecDesc,
    op: impl Fn(f64, f64) -> f64,
) -> Result<()> {
    check_vec_vec(dest, src)?;
    if let (Some(d), Some(s)) = (dest.scalar_comp(), src.scalar_comp()) {
        for v in vectors.iter_mut().filter(|v| dest.defines(v.gtype())) {
            v.values[d] = op(v.values[d], v.values[s]);
        }
        return Ok(());
    }
    for v in vectors.iter_mut() {
        let t = v.gtype();
        for (&d, &s) in dest.components(t).iter().zip(src.components(t)) {
            v.values[d] = op(v.values[d], v.values[s]);
        }
    }
    Ok(())
}

/// `dest = src`
pub fn copy(vectors: &mut [Vector], dest: &VecDesc, src: &VecDesc) -> Result<()> {
    binary(vectors, dest, src, |_, s| s)
}

/// `dest += src`
pub fn add(vectors: &mut [Vector], dest: &VecDesc, src: &VecDesc) -> Result<()> {
    binary(vectors, dest, src, |d, s| d + s)
}

/// `dest -= src`
pub fn sub(vectors: &mut [Vector], dest: &VecDesc, src: &VecDesc) -> Result<()> {
    binary(vectors, dest, src, |d, s| d - s)
}

/// `dest += alpha * src`
pub fn axpy(vectors: &mut [Vector], dest: &VecDesc, alpha: f64, src: &VecDesc) -> Result<()> {
    binary(vectors, dest, src, |d, s| d + alpha * s)
}

/// Multiply component `k` of `x` by `factors[k]`
pub fn scale_components(vectors: &mut [Vector], x: &VecDesc, factors: &[f64]) {
    for v in vectors.iter_mut() {
        for (&c, &f) in x.components(v.gtype()).iter().zip(factors) {
            v.values[c] *= f;
        }
    }
}

/// Zero the locked components of `x`
pub fn clear_skip(vectors: &mut [Vector], x: &VecDesc) {
    for v in vectors.iter_mut() {
        let skip = v.skip();
        if skip.is_empty() {
            continue;
        }
        let comps: Vec<usize> = x.components(v.gtype()).to_vec();
        for (k, c) in comps.into_iter().enumerate() {
            if skip.is_locked(k) {
                v.values[c] = 0.0;
            }
        }
    }
}

/// Local `(x, y)` over master replicas
pub fn dot(vectors: &[Vector], x: &VecDesc, y: &VecDesc) -> Result<f64> {
    check_vec_vec(x, y)?;
    let mut sum = 0.0;
    for v in vectors.iter().filter(|v| v.is_master()) {
        let t = v.gtype();
        for (&a, &b) in x.components(t).iter().zip(y.components(t)) {
            sum += v.values[a] * v.values[b];
        }
    }
    Ok(sum)
}

/// Local squared Euclidean norm over master replicas
pub fn norm_sqr(vectors: &[Vector], x: &VecDesc) -> f64 {
    vectors
        .iter()
        .filter(|v| v.is_master())
        .flat_map(|v| x.components(v.gtype()).iter().map(move |&c| v.values[c]))
        .map(|a| a * a)
        .sum()
}

/// Local Euclidean norm over master replicas
pub fn norm(vectors: &[Vector], x: &VecDesc) -> f64 {
    norm_sqr(vectors, x).sqrt()
}

/// Local maximum norm over master replicas
pub fn norm_inf(vectors: &[Vector], x: &VecDesc) -> f64 {
    vectors
        .iter()
        .filter(|v| v.is_master())
        .flat_map(|v| x.components(v.gtype()).iter().map(move |&c| v.values[c]))
        .fold(0.0, |m, a| m.max(a.abs()))
}

/// `(A x)_i` for row `i`, added into `acc`
pub(crate) fn row_product(
    vectors: &[Vector],
    matrix: &SparseBlockMatrix,
    a: &MatDesc,
    x: &VecDesc,
    i: usize,
    acc: &mut [f64],
) {
    let rt = vectors[i].gtype();
    let mut xj = [0.0; MAX_BLOCK_SIZE];
    for e in matrix.row(i) {
        let vj = &vectors[e.col()];
        let Some(b) = a.block(rt, vj.gtype()) else {
            continue;
        };
        for (k, &c) in x.components(vj.gtype()).iter().enumerate() {
            xj[k] = vj.values[c];
        }
        for (r, out) in acc.iter_mut().enumerate().take(b.rows()) {
            for (col, xv) in xj.iter().enumerate().take(b.cols()) {
                *out += e.values[b.offset(r, col)] * xv;
            }
        }
    }
}

fn apply(
    vectors: &mut [Vector],
    dest: &VecDesc,
    matrix: &SparseBlockMatrix,
    a: &MatDesc,
    x: &VecDesc,
    sign: f64,
    overwrite: bool,
) -> Result<()> {
    check_vec_mat_vec(dest, a, x)?;
    if let (Some(d), Some(m), Some(s)) = (dest.scalar_comp(), a.scalar_comp(), x.scalar_comp()) {
        for i in 0..vectors.len() {
            if !dest.defines(vectors[i].gtype()) {
                continue;
            }
            let mut sum = 0.0;
            for e in matrix.row(i) {
                if x.defines(vectors[e.col()].gtype()) {
                    sum += e.values[m] * vectors[e.col()].values[s];
                }
            }
            let v = &mut vectors[i];
            v.values[d] = if overwrite { sign * sum } else { v.values[d] + sign * sum };
        }
        return Ok(());
    }
    let mut acc = [0.0; MAX_BLOCK_SIZE];
    for i in 0..vectors.len() {
        let n = dest.ncomp(vectors[i].gtype());
        if n == 0 {
            continue;
        }
        acc[..n].fill(0.0);
        row_product(vectors, matrix, a, x, i, &mut acc);
        let v = &mut vectors[i];
        let comps: Vec<usize> = dest.components(v.gtype()).to_vec();
        for (k, c) in comps.into_iter().enumerate() {
            v.values[c] = if overwrite {
                sign * acc[k]
            } else {
                v.values[c] + sign * acc[k]
            };
        }
    }
    Ok(())
}

/// `dest = A x`
pub fn matmul(
    vectors: &mut [Vector],
    dest: &VecDesc,
    matrix: &SparseBlockMatrix,
    a: &MatDesc,
    x: &VecDesc,
) -> Result<()> {
    apply(vectors, dest, matrix, a, x, 1.0, true)
}

/// `dest += A x`
pub fn matmul_add(
    vectors: &mut [Vector],
    dest: &VecDesc,
    matrix: &SparseBlockMatrix,
    a: &MatDesc,
    x: &VecDesc,
) -> Result<()> {
    apply(vectors, dest, matrix, a, x, 1.0, false)
}

/// `dest -= A x`
pub fn matmul_minus(
    vectors: &mut [Vector],
    dest: &VecDesc,
    matrix: &SparseBlockMatrix,
    a: &MatDesc,
    x: &VecDesc,
) -> Result<()> {
    apply(vectors, dest, matrix, a, x, -1.0, false)
}

/// `A = value` on every coefficient the descriptor addresses
pub fn mat_set(vectors: &[Vector], matrix: &mut SparseBlockMatrix, a: &MatDesc, value: f64) {
    for (i, v) in vectors.iter().enumerate() {
        let rt = v.gtype();
        for e in matrix.row_mut(i) {
            let Some(b) = a.block(rt, vectors[e.col()].gtype()) else {
                continue;
            };
            for &c in b.components() {
                e.values[c] = value;
            }
        }
    }
}

/// `dest = src` for two matrix descriptors of the same shape
pub fn mat_copy(
    vectors: &[Vector],
    matrix: &mut SparseBlockMatrix,
    dest: &MatDesc,
    src: &MatDesc,
) -> Result<()> {
    for (rt, ct, d) in dest.defined_blocks() {
        let same = src
            .block(rt, ct)
            .is_some_and(|s| s.rows() == d.rows() && s.cols() == d.cols());
        if !same {
            return Err(MgError::MatrixShapeMismatch {
                matrix: src.name().to_string(),
                row_type: rt,
                col_type: ct,
                rows: src.block(rt, ct).map_or(0, |s| s.rows()),
                cols: src.block(rt, ct).map_or(0, |s| s.cols()),
                expected_rows: d.rows(),
                expected_cols: d.cols(),
            });
        }
    }
    for (i, v) in vectors.iter().enumerate() {
        let rt = v.gtype();
        for e in matrix.row_mut(i) {
            let ct = vectors[e.col()].gtype();
            let (Some(d), Some(s)) = (dest.block(rt, ct), src.block(rt, ct)) else {
                continue;
            };
            for (&dc, &sc) in d.components().iter().zip(s.components()) {
                e.values[dc] = e.values[sc];
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{GeomType, MatBlock, NUM_GEOM_TYPES};
    use approx::assert_relative_eq;

    fn chain(n: usize, width: usize) -> (Vec<Vector>, SparseBlockMatrix) {
        let vectors = (0..n)
            .map(|i| Vector::new(GeomType::Node, i, i as u64, width))
            .collect();
        let mut m = SparseBlockMatrix::with_diagonal(n, width * width);
        for i in 1..n {
            m.ensure_entry(i, i - 1, width * width);
            m.ensure_entry(i - 1, i, width * width);
        }
        (vectors, m)
    }

    #[test]
    fn test_scalar_matmul_minus() {
        let (mut vectors, mut m) = chain(3, 2);
        let a = MatDesc::scalar("A", &[GeomType::Node], 0);
        for i in 0..3 {
            m.diagonal_mut(i).values_mut()[0] = 2.0;
            for e in m.row_mut(i).iter_mut().skip(1) {
                e.values_mut()[0] = -1.0;
            }
        }
        let x = VecDesc::scalar("x", &[GeomType::Node], 0);
        let b = VecDesc::scalar("b", &[GeomType::Node], 1);
        set(&mut vectors, &x, 1.0);
        set(&mut vectors, &b, 1.0);
        matmul_minus(&mut vectors, &b, &m, &a, &x).unwrap();
        let got: Vec<f64> = vectors.iter().map(|v| v.value(1)).collect();
        assert_eq!(got, vec![0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_block_matmul_matches_scalar_path() {
        let (mut vectors, mut m) = chain(2, 4);
        let mut blocks: [[Option<MatBlock>; NUM_GEOM_TYPES]; NUM_GEOM_TYPES] = Default::default();
        blocks[0][0] = Some(MatBlock::compact(2, 2));
        let a = MatDesc::new("A", blocks);
        m.diagonal_mut(0).values_mut()[..4].copy_from_slice(&[2.0, 1.0, 0.0, 3.0]);
        m.entry_mut(0, 1).unwrap().values_mut()[..4].copy_from_slice(&[-1.0, 0.0, 0.0, -1.0]);
        let x = VecDesc::new("x", [vec![0, 1], vec![], vec![], vec![]]);
        let y = VecDesc::new("y", [vec![2, 3], vec![], vec![], vec![]]);
        vectors[0].put(&x, &[1.0, 2.0]);
        vectors[1].put(&x, &[3.0, 4.0]);
        matmul(&mut vectors, &y, &m, &a, &x).unwrap();
        // [2 1; 0 3] (1, 2) - (3, 4)
        assert_eq!(vectors[0].get(&y), vec![1.0, 2.0]);
    }

    #[test]
    fn test_dot_counts_masters_only() {
        let (mut vectors, _) = chain(3, 1);
        let x = VecDesc::scalar("x", &[GeomType::Node], 0);
        set(&mut vectors, &x, 2.0);
        vectors[2].set_priority(crate::algebra::Priority::Border);
        assert_relative_eq!(dot(&vectors, &x, &x).unwrap(), 8.0);
        assert_relative_eq!(norm(&vectors, &x), 8.0_f64.sqrt());
        assert_relative_eq!(norm_inf(&vectors, &x), 2.0);
    }

    #[test]
    fn test_clear_skip_and_scale() {
        let (mut vectors, _) = chain(1, 3);
        let x = VecDesc::new("x", [vec![0, 1, 2], vec![], vec![], vec![]]);
        vectors[0].put(&x, &[1.0, 2.0, 3.0]);
        scale_components(&mut vectors, &x, &[1.0, 0.5, 2.0]);
        assert_eq!(vectors[0].get(&x), vec![1.0, 1.0, 6.0]);
        vectors[0].set_skip(crate::algebra::SkipMask::from_components(&[1]));
        clear_skip(&mut vectors, &x);
        assert_eq!(vectors[0].get(&x), vec![1.0, 0.0, 6.0]);
    }

    #[test]
    fn test_copy_rejects_mismatch() {
        let (mut vectors, _) = chain(1, 3);
        let x = VecDesc::new("x", [vec![0, 1], vec![], vec![], vec![]]);
        let y = VecDesc::new("y", [vec![2], vec![], vec![], vec![]]);
        assert!(copy(&mut vectors, &y, &x).is_err());
    }

    #[test]
    fn test_matrix_set_and_copy() {
        let (vectors, mut m) = chain(2, 2);
        let a = MatDesc::scalar("A", &[GeomType::Node], 0);
        let b = MatDesc::scalar("B", &[GeomType::Node], 3);
        mat_set(&vectors, &mut m, &a, 3.0);
        mat_copy(&vectors, &mut m, &b, &a).unwrap();
        for i in 0..2 {
            for e in m.row(i) {
                assert_eq!(e.values()[0], 3.0);
                assert_eq!(e.values()[3], 3.0);
                assert_eq!(e.values()[1], 0.0);
            }
        }
    }
}
