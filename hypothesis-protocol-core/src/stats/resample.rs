//! Fixed-seed resampling so bootstrap results are reproducible.

use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};

use super::descriptive::quantile_sorted;

pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Resample `x` with replacement.
pub fn bootstrap_sample(x: &[f64], rng: &mut StdRng) -> Vec<f64> {
    (0..x.len()).map(|_| x[rng.gen_range(0..x.len())]).collect()
}

/// Indices `0..n` resampled with replacement.
pub fn bootstrap_indices(n: usize, rng: &mut StdRng) -> Vec<usize> {
    (0..n).map(|_| rng.gen_range(0..n)).collect()
}

/// A deterministic subsample of `size` values without replacement,
/// keeping the original order.
pub fn subsample(x: &[f64], size: usize, seed: u64) -> Vec<f64> {
    if size >= x.len() {
        return x.to_vec();
    }
    let mut rng = seeded_rng(seed);
    let mut picked = index::sample(&mut rng, x.len(), size).into_vec();
    picked.sort_unstable();
    picked.into_iter().map(|i| x[i]).collect()
}

/// Bootstrap distribution of a two-sample statistic.
pub fn bootstrap_two_sample<F>(
    a: &[f64],
    b: &[f64],
    resamples: usize,
    seed: u64,
    statistic: F,
) -> Vec<f64>
where
    F: Fn(&[f64], &[f64]) -> f64,
{
    let mut rng = seeded_rng(seed);
    (0..resamples)
        .map(|_| {
            let ra = bootstrap_sample(a, &mut rng);
            let rb = bootstrap_sample(b, &mut rng);
            statistic(&ra, &rb)
        })
        .filter(|v| v.is_finite())
        .collect()
}

/// Percentile interval of a bootstrap distribution.
pub fn percentile_interval(mut values: Vec<f64>, confidence_level: f64) -> Option<(f64, f64)> {
    values.retain(|v| v.is_finite());
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let tail = (1.0 - confidence_level) / 2.0;
    Some((
        quantile_sorted(&values, tail),
        quantile_sorted(&values, 1.0 - tail),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::mean;

    #[test]
    fn test_subsample_is_deterministic() {
        let x: Vec<f64> = (0..100).map(f64::from).collect();
        let a = subsample(&x, 10, 42);
        let b = subsample(&x, 10, 42);
        assert_eq!(a, b);
        assert_eq!(a.len(), 10);
        assert!(a.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(subsample(&x, 500, 42).len(), 100);
    }

    #[test]
    fn test_bootstrap_is_deterministic() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0];
        let b = [3.0, 4.0, 5.0, 6.0, 7.0];
        let d1 = bootstrap_two_sample(&a, &b, 200, 7, |x, y| mean(x) - mean(y));
        let d2 = bootstrap_two_sample(&a, &b, 200, 7, |x, y| mean(x) - mean(y));
        assert_eq!(d1, d2);
        let (lo, hi) = percentile_interval(d1, 0.95).unwrap();
        assert!(lo <= hi);
        assert!(lo < 0.0 && hi > -4.0);
    }

    #[test]
    fn test_percentile_interval_empty() {
        assert!(percentile_interval(vec![f64::NAN], 0.95).is_none());
    }
}
