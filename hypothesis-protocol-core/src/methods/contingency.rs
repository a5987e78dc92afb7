//! Chi-square test of independence and Fisher's exact test.
//!
//! A 2×2 table whose smallest expected count is below
//! [`FISHER_SWITCH_EXPECTED`] is always tested with Fisher's exact test,
//! even when chi-square was requested.

use std::collections::BTreeMap;

use serde_json::json;
use statrs::function::factorial::ln_binomial;
use tracing::info;

use super::ExecutionContext;
use crate::dataset::compare_labels;
use crate::error::AnalysisError;
use crate::options::{CommonOptions, ContingencyOptions};
use crate::registry::{MethodId, RoleName};
use crate::result::{json_number, AnalysisResult};
use crate::stats::distributions::{chi2_sf, clamp_p, z_critical, Alternative};

/// Expected count below which a 2×2 table switches to Fisher's exact test.
pub const FISHER_SWITCH_EXPECTED: f64 = 5.0;

/// Observed counts with row and column labels.
#[derive(Debug, Clone, PartialEq)]
pub struct ContingencyTable {
    pub rows: Vec<String>,
    pub columns: Vec<String>,
    pub counts: Vec<Vec<f64>>,
}

impl ContingencyTable {
    /// Cross-tabulate label pairs `(row, column)`.
    pub fn from_pairs(pairs: &[(String, String)]) -> Self {
        let mut cells: BTreeMap<(String, String), f64> = BTreeMap::new();
        let mut rows: Vec<String> = Vec::new();
        let mut columns: Vec<String> = Vec::new();
        for (r, c) in pairs {
            *cells.entry((r.clone(), c.clone())).or_insert(0.0) += 1.0;
            rows.push(r.clone());
            columns.push(c.clone());
        }
        for labels in [&mut rows, &mut columns] {
            labels.sort_by(|a, b| compare_labels(a, b));
            labels.dedup();
        }
        let counts = rows
            .iter()
            .map(|r| {
                columns
                    .iter()
                    .map(|c| cells.get(&(r.clone(), c.clone())).copied().unwrap_or(0.0))
                    .collect()
            })
            .collect();
        Self {
            rows,
            columns,
            counts,
        }
    }

    pub fn from_counts(counts: Vec<Vec<f64>>) -> Self {
        let rows = (0..counts.len()).map(|i| format!("r{}", i + 1)).collect();
        let columns = (0..counts.first().map(Vec::len).unwrap_or(0))
            .map(|j| format!("c{}", j + 1))
            .collect();
        Self {
            rows,
            columns,
            counts,
        }
    }

    pub fn total(&self) -> f64 {
        self.counts.iter().flatten().sum()
    }

    pub fn is_2x2(&self) -> bool {
        self.rows.len() == 2 && self.columns.len() == 2
    }

    /// Expected counts under independence.
    pub fn expected(&self) -> Vec<Vec<f64>> {
        let total = self.total();
        let row_sums: Vec<f64> = self.counts.iter().map(|r| r.iter().sum()).collect();
        let col_sums: Vec<f64> = (0..self.columns.len())
            .map(|j| self.counts.iter().map(|r| r[j]).sum())
            .collect();
        row_sums
            .iter()
            .map(|rs| col_sums.iter().map(|cs| rs * cs / total).collect())
            .collect()
    }

    pub fn min_expected(&self) -> f64 {
        self.expected()
            .iter()
            .flatten()
            .copied()
            .fold(f64::INFINITY, f64::min)
    }
}

/// Pearson chi-square: `(statistic, dof, p, yates_applied)`.
pub fn chi_square(
    table: &ContingencyTable,
    yates: bool,
) -> Result<(f64, f64, f64, bool), AnalysisError> {
    let expected = table.expected();
    let dof = ((table.rows.len() - 1) * (table.columns.len() - 1)) as f64;
    let apply_yates = yates && dof == 1.0;
    let mut stat = 0.0;
    for (observed_row, expected_row) in table.counts.iter().zip(&expected) {
        for (o, e) in observed_row.iter().zip(expected_row) {
            if *e == 0.0 {
                return Err(AnalysisError::ZeroVariance(
                    "an entire row or column of the table is empty".to_string(),
                ));
            }
            let mut diff = (o - e).abs();
            if apply_yates {
                diff -= diff.min(0.5);
            }
            stat += diff * diff / e;
        }
    }
    Ok((stat, dof, chi2_sf(stat, dof)?, apply_yates))
}

/// Fisher's exact test on a 2×2 table `[[a, b], [c, d]]`.
pub fn fisher_exact(table: &ContingencyTable, alternative: Alternative) -> Result<f64, AnalysisError> {
    if !table.is_2x2() {
        return Err(AnalysisError::InvalidOption(format!(
            "Fisher's exact test needs a 2x2 table, got {}x{}",
            table.rows.len(),
            table.columns.len()
        )));
    }
    let cell = |i: usize, j: usize| table.counts[i][j].round() as u64;
    let (a, b, c, d) = (cell(0, 0), cell(0, 1), cell(1, 0), cell(1, 1));
    let n = a + b + c + d;
    let row1 = a + b;
    let col1 = a + c;
    let lo = (row1 + col1).saturating_sub(n);
    let hi = row1.min(col1);
    let ln_total = ln_binomial(n, row1);
    let prob = |x: u64| (ln_binomial(col1, x) + ln_binomial(n - col1, row1 - x) - ln_total).exp();

    let p = match alternative {
        Alternative::Greater => (a..=hi).map(prob).sum(),
        Alternative::Less => (lo..=a).map(prob).sum(),
        Alternative::TwoSided => {
            let observed = prob(a);
            (lo..=hi)
                .map(prob)
                .filter(|p| *p <= observed * (1.0 + 1e-7))
                .sum()
        }
    };
    Ok(clamp_p(p))
}

/// Sample odds ratio with a Woolf (log) interval; zero cells get +0.5.
pub fn odds_ratio(table: &ContingencyTable, confidence_level: f64) -> (f64, f64, f64) {
    let mut cells = [
        table.counts[0][0],
        table.counts[0][1],
        table.counts[1][0],
        table.counts[1][1],
    ];
    if cells.iter().any(|c| *c == 0.0) {
        for c in &mut cells {
            *c += 0.5;
        }
    }
    let [a, b, c, d] = cells;
    let ratio = a * d / (b * c);
    let se = (1.0 / a + 1.0 / b + 1.0 / c + 1.0 / d).sqrt();
    let z = z_critical(confidence_level);
    (ratio, (ratio.ln() - z * se).exp(), (ratio.ln() + z * se).exp())
}

fn cramers_v(table: &ContingencyTable) -> Result<f64, AnalysisError> {
    let (chi2, _, _, _) = chi_square(table, false)?;
    let k = table.rows.len().min(table.columns.len()) as f64;
    Ok((chi2 / (table.total() * (k - 1.0))).sqrt())
}

/// Execute a contingency-table method.
pub fn execute(
    method: MethodId,
    ctx: &ExecutionContext<'_>,
    options: &ContingencyOptions,
) -> Result<AnalysisResult, AnalysisError> {
    let alpha = options.alpha(ctx.defaults);
    let level = options.confidence_level(ctx.defaults);
    let row_name = ctx.roles.require(RoleName::Target)?;
    let col_name = ctx.roles.require(RoleName::Group)?;
    let table = ContingencyTable::from_pairs(&ctx.dataset.category_pairs(row_name, col_name)?);
    let found = table.rows.len().min(table.columns.len());
    if found < 2 {
        return Err(AnalysisError::InsufficientGroups { found, required: 2 });
    }

    let expected = table.expected();
    let min_expected = table.min_expected();
    let mut warnings = Vec::new();
    let use_fisher = match method {
        MethodId::FisherExact => true,
        MethodId::ChiSquare if table.is_2x2() && min_expected < FISHER_SWITCH_EXPECTED => {
            info!(min_expected, "switching chi-square to Fisher's exact test");
            warnings.push(format!(
                "Switched to Fisher's exact test: minimum expected count {:.2} is below {}",
                min_expected, FISHER_SWITCH_EXPECTED
            ));
            true
        }
        MethodId::ChiSquare => false,
        other => {
            return Err(AnalysisError::InvalidOption(format!(
                "{} is not a contingency-table method",
                other
            )))
        }
    };

    let mut result = if use_fisher {
        let p = fisher_exact(&table, options.alternative)?;
        let (ratio, lo, hi) = odds_ratio(&table, level);
        AnalysisResult::new(MethodId::FisherExact, MethodId::FisherExact.display_name())
            .with_test(ratio, p, alpha)
            .with_effect_size("odds_ratio", ratio, Some((Some(lo), Some(hi))))
            .with_extra("alternative", options.alternative.as_str())
    } else {
        let (stat, dof, p, yates_applied) = chi_square(&table, options.yates)?;
        let v = cramers_v(&table)?;
        let cells = expected.iter().flatten().count() as f64;
        let sparse = expected.iter().flatten().filter(|e| **e < 5.0).count() as f64;
        if sparse / cells > 0.2 {
            warnings.push(format!(
                "{:.0}% of cells have an expected count below 5; the chi-square approximation may be unreliable",
                100.0 * sparse / cells
            ));
        }
        let mut result = AnalysisResult::new(method, method.display_name())
            .with_test(stat, p, alpha)
            .with_effect_size("cramers_v", v, None)
            .with_extra("dof", json_number(dof))
            .with_extra("yates_correction", yates_applied);
        if table.is_2x2() {
            let (ratio, lo, hi) = odds_ratio(&table, level);
            result = result.with_extra(
                "odds_ratio",
                json!({"value": json_number(ratio), "ci_low": json_number(lo), "ci_high": json_number(hi)}),
            );
        }
        result
    };

    result.groups = table.columns.clone();
    result.plot_data = table
        .rows
        .iter()
        .enumerate()
        .flat_map(|(i, r)| {
            table.columns.iter().enumerate().map(move |(j, c)| (i, j, r, c))
        })
        .map(|(i, j, r, c)| {
            json!({
                "row": r,
                "column": c,
                "count": table.counts[i][j],
                "expected": json_number(expected[i][j]),
            })
        })
        .collect();
    result = result
        .with_extra("rows", json!(table.rows))
        .with_extra("columns", json!(table.columns))
        .with_extra("observed", json!(table.counts))
        .with_extra(
            "expected",
            json!(expected
                .iter()
                .map(|r| r.iter().map(|e| json_number(*e)).collect::<Vec<_>>())
                .collect::<Vec<_>>()),
        )
        .with_extra("min_expected", json_number(min_expected));
    result.warnings.extend(warnings);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Column, Dataset};
    use crate::options::AnalysisDefaults;
    use crate::registry::ColumnRoles;

    #[test]
    fn test_fisher_reference() {
        // scipy.stats.fisher_exact([[8, 2], [1, 5]]) -> p = 0.0349650
        let table = ContingencyTable::from_counts(vec![vec![8.0, 2.0], vec![1.0, 5.0]]);
        let p = fisher_exact(&table, Alternative::TwoSided).unwrap();
        assert!((p - 0.034965).abs() < 1e-5);
        let greater = fisher_exact(&table, Alternative::Greater).unwrap();
        assert!((greater - 0.0244755).abs() < 1e-5);
    }

    #[test]
    fn test_chi_square_with_yates() {
        // scipy.stats.chi2_contingency([[10, 20], [20, 10]]) -> 5.4, p = 0.0201
        let table = ContingencyTable::from_counts(vec![vec![10.0, 20.0], vec![20.0, 10.0]]);
        let (stat, dof, p, yates) = chi_square(&table, true).unwrap();
        assert!((stat - 5.4).abs() < 1e-9);
        assert_eq!(dof, 1.0);
        assert!(yates);
        assert!((p - 0.0201).abs() < 1e-3);
        let (uncorrected, _, _, _) = chi_square(&table, false).unwrap();
        assert!((uncorrected - 6.6667).abs() < 1e-3);
    }

    fn dataset(counts: [[usize; 2]; 2]) -> Dataset {
        let mut rows = Vec::new();
        let mut cols = Vec::new();
        for (i, r) in ["x", "y"].iter().enumerate() {
            for (j, c) in ["p", "q"].iter().enumerate() {
                for _ in 0..counts[i][j] {
                    rows.push(*r);
                    cols.push(*c);
                }
            }
        }
        Dataset::new("table")
            .with_column("outcome", Column::categorical(rows))
            .unwrap()
            .with_column("arm", Column::categorical(cols))
            .unwrap()
    }

    fn run(ds: &Dataset) -> AnalysisResult {
        let roles = ColumnRoles::grouped("outcome", "arm");
        let defaults = AnalysisDefaults::default();
        let ctx = ExecutionContext {
            dataset: ds,
            roles: &roles,
            defaults: &defaults,
        };
        execute(MethodId::ChiSquare, &ctx, &ContingencyOptions::default()).unwrap()
    }

    #[test]
    fn test_small_table_switches_to_fisher() {
        let result = run(&dataset([[2, 3], [1, 4]]));
        assert_eq!(result.method_id, MethodId::FisherExact);
        assert!(result.warnings.iter().any(|w| w.contains("Fisher")));
    }

    #[test]
    fn test_large_table_stays_chi_square() {
        let result = run(&dataset([[20, 30], [25, 15]]));
        assert_eq!(result.method_id, MethodId::ChiSquare);
        assert!(result.warnings.is_empty());
        assert!(result.extra.contains_key("odds_ratio"));
    }
}
