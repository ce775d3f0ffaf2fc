//! Symmetric eigen-decomposition used by the PCA step.
//!
//! Small matrices go through cyclic Jacobi rotations. Larger covariance matrices use
//! a bounded number of block power steps followed by one Rayleigh-Ritz step, so only
//! the leading eigenpairs are computed. With a flat spectrum the result captures
//! close to the optimal variance rather than exact eigenvectors.

use ndarray::{s, Array1, Array2, ArrayView1, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const JACOBI_MAX_SWEEPS: usize = 100;
const DIRECT_LIMIT: usize = 96;
const OVERSAMPLE: usize = 8;
const SUBSPACE_MAX_ITERS: usize = 32;
const SUBSPACE_TOL: f64 = 1e-8;
const BASIS_SEED: u64 = 0x5eed_cafe;

/// Leading eigenpairs of a symmetric matrix.
#[derive(Debug, Clone)]
pub(crate) struct EigenPairs {
    /// Eigenvalues in descending order.
    pub values: Array1<f64>,
    /// Unit eigenvectors as columns, matching `values`.
    pub vectors: Array2<f64>,
}

/// Full eigen-decomposition of a symmetric matrix, sorted by descending eigenvalue.
pub(crate) fn symmetric_eigen(matrix: &Array2<f64>) -> EigenPairs {
    let n = matrix.nrows();
    let mut a = matrix.clone();
    let mut v = Array2::<f64>::eye(n);

    let scale: f64 = a.iter().map(|x| x * x).sum::<f64>().max(f64::MIN_POSITIVE);
    for _ in 0..JACOBI_MAX_SWEEPS {
        let off: f64 = (0..n)
            .flat_map(|p| (p + 1..n).map(move |q| (p, q)))
            .map(|(p, q)| a[[p, q]] * a[[p, q]])
            .sum();
        if off <= scale * 1e-30 {
            break;
        }
        for p in 0..n {
            for q in p + 1..n {
                let apq = a[[p, q]];
                if apq == 0.0 {
                    continue;
                }
                let theta = (a[[q, q]] - a[[p, p]]) / (2.0 * apq);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;
                for k in 0..n {
                    let akp = a[[k, p]];
                    let akq = a[[k, q]];
                    a[[k, p]] = c * akp - s * akq;
                    a[[k, q]] = s * akp + c * akq;
                }
                for k in 0..n {
                    let apk = a[[p, k]];
                    let aqk = a[[q, k]];
                    a[[p, k]] = c * apk - s * aqk;
                    a[[q, k]] = s * apk + c * aqk;
                }
                for k in 0..n {
                    let vkp = v[[k, p]];
                    let vkq = v[[k, q]];
                    v[[k, p]] = c * vkp - s * vkq;
                    v[[k, q]] = s * vkp + c * vkq;
                }
            }
        }
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| a[[j, j]].total_cmp(&a[[i, i]]));
    let values = Array1::from_iter(order.iter().map(|&i| a[[i, i]]));
    let vectors = v.select(Axis(1), &order);
    EigenPairs { values, vectors }
}

/// The `k` largest eigenpairs of a symmetric positive semi-definite matrix.
///
/// Eigenvectors are sign-normalized so that each one's largest-magnitude entry is
/// positive, which makes projections reproducible across runs.
pub(crate) fn top_eigenpairs(matrix: &Array2<f64>, k: usize) -> EigenPairs {
    let n = matrix.nrows();
    let k = k.min(n);
    let mut pairs = if n <= DIRECT_LIMIT || 2 * k >= n {
        symmetric_eigen(matrix)
    } else {
        subspace_iteration(matrix, k)
    };
    pairs.values = pairs.values.slice(s![..k]).to_owned();
    pairs.vectors = pairs.vectors.slice(s![.., ..k]).to_owned();
    for mut column in pairs.vectors.columns_mut() {
        let pivot = column
            .iter()
            .copied()
            .fold(0.0f64, |best, x| if x.abs() > best.abs() { x } else { best });
        if pivot < 0.0 {
            column.mapv_inplace(|x| -x);
        }
    }
    pairs
}

fn subspace_iteration(matrix: &Array2<f64>, k: usize) -> EigenPairs {
    let n = matrix.nrows();
    let p = (k + OVERSAMPLE).min(n);
    let mut rng = ChaCha8Rng::seed_from_u64(BASIS_SEED);
    // basis vectors are rows, so Gram-Schmidt walks contiguous memory
    let mut basis = Array2::from_shape_fn((p, n), |_| rng.random::<f64>() - 0.5);
    orthonormalize(&mut basis, &mut rng);

    // captured variance; stops early once the block stops gaining
    let mut previous: Option<f64> = None;
    for _ in 0..SUBSPACE_MAX_ITERS {
        let image = basis.dot(matrix);
        let trace: f64 = basis
            .rows()
            .into_iter()
            .zip(image.rows())
            .map(|(b, a)| b.dot(&a))
            .sum();
        if previous.is_some_and(|prev| (trace - prev).abs() <= SUBSPACE_TOL * trace.abs()) {
            break;
        }
        previous = Some(trace);
        basis = image;
        orthonormalize(&mut basis, &mut rng);
    }

    let mut projected = basis.dot(matrix).dot(&basis.t());
    symmetrize(&mut projected);
    let ritz = symmetric_eigen(&projected);
    EigenPairs {
        values: ritz.values,
        vectors: basis.t().dot(&ritz.vectors),
    }
}

fn symmetrize(matrix: &mut Array2<f64>) {
    let n = matrix.nrows();
    for i in 0..n {
        for j in i + 1..n {
            let mean = 0.5 * (matrix[[i, j]] + matrix[[j, i]]);
            matrix[[i, j]] = mean;
            matrix[[j, i]] = mean;
        }
    }
}

/// Modified Gram-Schmidt over rows, with re-orthogonalization. Rows that collapse
/// (the input was rank deficient) are replaced by fresh random directions.
fn orthonormalize(basis: &mut Array2<f64>, rng: &mut ChaCha8Rng) {
    for j in 0..basis.nrows() {
        let (done, mut rest) = basis.view_mut().split_at(Axis(0), j);
        let mut row = rest.row_mut(0);
        let mut attempts = 0;
        loop {
            let original = norm(row.view());
            for _ in 0..2 {
                for prev in done.rows() {
                    let dot = prev.dot(&row);
                    row.scaled_add(-dot, &prev);
                }
            }
            let remaining = norm(row.view());
            if remaining > 1e-10 * original.max(1.0) || attempts >= 8 {
                if remaining > 0.0 {
                    row.mapv_inplace(|x| x / remaining);
                }
                break;
            }
            attempts += 1;
            for x in row.iter_mut() {
                *x = rng.random::<f64>() - 0.5;
            }
        }
    }
}

fn norm(v: ArrayView1<'_, f64>) -> f64 {
    v.dot(&v).sqrt()
}
