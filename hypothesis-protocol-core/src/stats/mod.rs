//! Numerical building blocks shared by the assumption checks and executors.

pub mod descriptive;
pub mod distributions;
pub mod linalg;
pub mod resample;
pub mod tukey;

pub use descriptive::{mean, median, quantile, rank, std_dev, tie_counts, variance};
pub use distributions::Alternative;
