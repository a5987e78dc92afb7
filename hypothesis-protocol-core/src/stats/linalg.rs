//! Dense matrix helpers for model fitting, on top of `nalgebra`.
//!
//! Every matrix inverted here is symmetric positive definite (Gram
//! matrices, information matrices, marginal covariances), so inversion
//! goes through a Cholesky factorisation with a relative pivot check.

use nalgebra::{DMatrix, DVector};

use crate::error::AnalysisError;

/// Build a matrix from row vectors; all rows must share one length.
pub fn from_rows(rows: &[Vec<f64>]) -> DMatrix<f64> {
    let cols = rows.first().map_or(0, Vec::len);
    DMatrix::from_fn(rows.len(), cols, |i, j| rows[i][j])
}

/// `m * v` for a plain slice.
pub fn mul_vec(m: &DMatrix<f64>, v: &[f64]) -> Vec<f64> {
    (m * DVector::from_column_slice(v)).as_slice().to_vec()
}

/// `Xᵀ W X` for a diagonal weight vector (`None` means unit weights).
pub fn weighted_gram(x: &DMatrix<f64>, weights: Option<&[f64]>) -> DMatrix<f64> {
    match weights {
        None => x.tr_mul(x),
        Some(w) => {
            let wx = DMatrix::from_fn(x.nrows(), x.ncols(), |i, j| w[i] * x[(i, j)]);
            x.tr_mul(&wx)
        }
    }
}

/// `Xᵀ W y`.
pub fn weighted_xty(x: &DMatrix<f64>, y: &[f64], weights: Option<&[f64]>) -> DVector<f64> {
    let wy = DVector::from_iterator(
        y.len(),
        y.iter()
            .enumerate()
            .map(|(i, v)| weights.map_or(1.0, |w| w[i]) * v),
    );
    x.tr_mul(&wy)
}

/// Inverse and log-determinant of a symmetric positive definite matrix.
///
/// # Errors
///
/// Returns [`AnalysisError::SingularMatrix`] when the factorisation fails
/// or a squared Cholesky pivot falls below a tolerance relative to the
/// largest diagonal entry.
pub fn spd_inverse_with_log_det(m: &DMatrix<f64>) -> Result<(DMatrix<f64>, f64), AnalysisError> {
    if !m.is_square() {
        return Err(AnalysisError::Computation(format!(
            "cannot invert a {}x{} matrix",
            m.nrows(),
            m.ncols()
        )));
    }
    let n = m.nrows();
    let scale = m.diagonal().iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
    if scale == 0.0 || !scale.is_finite() {
        return Err(AnalysisError::SingularMatrix(
            "matrix is zero or non-finite".to_string(),
        ));
    }
    let tol = scale * 1e-12 * n as f64;

    let cholesky = m.clone().cholesky().ok_or_else(|| {
        AnalysisError::SingularMatrix("matrix is not positive definite".to_string())
    })?;
    let mut log_det = 0.0;
    for (i, d) in cholesky.l_dirty().diagonal().iter().enumerate() {
        if d.is_nan() || d * d <= tol {
            return Err(AnalysisError::SingularMatrix(format!(
                "pivot {} is numerically zero",
                i
            )));
        }
        log_det += 2.0 * d.ln();
    }
    Ok((cholesky.inverse(), log_det))
}

pub fn spd_inverse(m: &DMatrix<f64>) -> Result<DMatrix<f64>, AnalysisError> {
    Ok(spd_inverse_with_log_det(m)?.0)
}

pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inverse_and_log_det() {
        let m = from_rows(&[
            vec![4.0, 2.0, 0.6],
            vec![2.0, 5.0, 1.0],
            vec![0.6, 1.0, 3.0],
        ]);
        let (inv, log_det) = spd_inverse_with_log_det(&m).unwrap();
        let product = &m * &inv;
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((product[(i, j)] - expected).abs() < 1e-10);
            }
        }
        // det = 4(15-1) - 2(6-0.6) + 0.6(2-3) = 56 - 10.8 - 0.6 = 44.6
        assert!((log_det - 44.6_f64.ln()).abs() < 1e-10);
    }

    #[test]
    fn test_singular_matrix() {
        let m = from_rows(&[vec![1.0, 2.0], vec![2.0, 4.0]]);
        assert!(matches!(
            spd_inverse(&m),
            Err(AnalysisError::SingularMatrix(_))
        ));
        let zero = DMatrix::<f64>::zeros(2, 2);
        assert!(matches!(
            spd_inverse(&zero),
            Err(AnalysisError::SingularMatrix(_))
        ));
    }

    #[test]
    fn test_weighted_gram_matches_product() {
        let x = from_rows(&[vec![1.0, 2.0], vec![1.0, 3.0], vec![1.0, 5.0]]);
        assert_eq!(weighted_gram(&x, None), x.transpose() * &x);
        assert_eq!(
            weighted_xty(&x, &[1.0, 1.0, 1.0], None).as_slice(),
            &[3.0, 10.0]
        );
        let weighted = weighted_gram(&x, Some(&[2.0, 0.0, 1.0]));
        assert_eq!(weighted[(0, 0)], 3.0);
        assert_eq!(weighted[(1, 1)], 2.0 * 4.0 + 25.0);
        assert_eq!(mul_vec(&x, &[1.0, 1.0]), vec![3.0, 4.0, 6.0]);
    }
}
