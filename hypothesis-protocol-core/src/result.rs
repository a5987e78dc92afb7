//! Standardized result records and the sanitization pass.
//!
//! Results are built once by an executor and only read afterwards. The
//! final [`AnalysisResult::sanitized`] call guarantees every number is finite
//! or `null`, p-values lie in `[0, 1]` and confidence bounds are ordered.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::assumptions::{AssumptionCheck, AssumptionReport};
use crate::registry::MethodId;
use crate::stats::descriptive::{mean, quantile_sorted, sorted, std_dev};
use crate::stats::distributions::t_critical;

/// Summary statistics of one group, used for plotting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupStats {
    pub mean: Option<f64>,
    pub sd: Option<f64>,
    pub sem: Option<f64>,
    pub ci_low: Option<f64>,
    pub ci_high: Option<f64>,
    pub median: Option<f64>,
    pub q1: Option<f64>,
    pub q3: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub count: usize,
}

impl GroupStats {
    /// Statistics of `sample` with a t-based CI of the mean.
    pub fn from_sample(sample: &[f64], confidence_level: f64) -> Self {
        let n = sample.len();
        if n == 0 {
            return Self::default();
        }
        let v = sorted(sample);
        let m = mean(sample);
        let sd = std_dev(sample);
        let sem = sd / (n as f64).sqrt();
        let (ci_low, ci_high) = if n >= 2 {
            match t_critical(confidence_level, (n - 1) as f64) {
                Ok(crit) => (Some(m - crit * sem), Some(m + crit * sem)),
                Err(_) => (None, None),
            }
        } else {
            (None, None)
        };
        Self {
            mean: Some(m),
            sd: Some(sd),
            sem: Some(sem),
            ci_low,
            ci_high,
            median: Some(quantile_sorted(&v, 0.5)),
            q1: Some(quantile_sorted(&v, 0.25)),
            q3: Some(quantile_sorted(&v, 0.75)),
            min: v.first().copied(),
            max: v.last().copied(),
            count: n,
        }
        .sanitized()
    }

    fn sanitized(self) -> Self {
        let (ci_low, ci_high) = ordered(finite(self.ci_low), finite(self.ci_high));
        Self {
            mean: finite(self.mean),
            sd: finite(self.sd),
            sem: finite(self.sem),
            ci_low,
            ci_high,
            median: finite(self.median),
            q1: finite(self.q1),
            q3: finite(self.q3),
            min: finite(self.min),
            max: finite(self.max),
            count: self.count,
        }
    }
}

/// One pairwise follow-up comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostHocComparison {
    pub group_a: String,
    pub group_b: String,
    /// Difference of means (or medians for rank tests), `a - b`.
    pub diff: Option<f64>,
    pub raw_p: Option<f64>,
    /// Adjusted p-value; never below `raw_p`.
    pub p_value: Option<f64>,
    pub significant: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci_low: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci_high: Option<f64>,
}

impl PostHocComparison {
    fn sanitized(self) -> Self {
        let raw_p = probability(self.raw_p);
        let mut p_value = probability(self.p_value);
        if let (Some(raw), Some(adj)) = (raw_p, p_value) {
            p_value = Some(adj.max(raw));
        }
        let (ci_low, ci_high) = ordered(finite(self.ci_low), finite(self.ci_high));
        Self {
            diff: finite(self.diff),
            raw_p,
            p_value,
            ci_low,
            ci_high,
            ..self
        }
    }
}

/// Standardized output of every executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub method_id: MethodId,
    pub method_name: String,
    pub stat_value: Option<f64>,
    pub p_value: Option<f64>,
    pub significant: bool,
    pub effect_size: Option<f64>,
    pub effect_size_name: Option<String>,
    pub effect_size_ci_low: Option<f64>,
    pub effect_size_ci_high: Option<f64>,
    pub groups: Vec<String>,
    pub plot_data: Vec<Value>,
    pub plot_stats: BTreeMap<String, GroupStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assumptions: Option<AssumptionReport>,
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_hoc: Option<Vec<PostHocComparison>>,
    pub extra: Map<String, Value>,
}

impl AnalysisResult {
    /// Start a result for `method_id` with every optional field empty.
    pub fn new(method_id: MethodId, method_name: impl Into<String>) -> Self {
        Self {
            method_id,
            method_name: method_name.into(),
            stat_value: None,
            p_value: None,
            significant: false,
            effect_size: None,
            effect_size_name: None,
            effect_size_ci_low: None,
            effect_size_ci_high: None,
            groups: Vec::new(),
            plot_data: Vec::new(),
            plot_stats: BTreeMap::new(),
            assumptions: None,
            warnings: Vec::new(),
            post_hoc: None,
            extra: Map::new(),
        }
    }

    /// Set the test statistic and p-value; significance uses `alpha`.
    pub fn with_test(mut self, stat_value: f64, p_value: f64, alpha: f64) -> Self {
        self.stat_value = Some(stat_value);
        self.p_value = Some(p_value);
        self.significant = p_value.is_finite() && p_value < alpha;
        self
    }

    pub fn with_effect_size(
        mut self,
        name: impl Into<String>,
        value: f64,
        ci: Option<(Option<f64>, Option<f64>)>,
    ) -> Self {
        self.effect_size = Some(value);
        self.effect_size_name = Some(name.into());
        if let Some((low, high)) = ci {
            self.effect_size_ci_low = low;
            self.effect_size_ci_high = high;
        }
        self
    }

    pub fn with_groups(mut self, groups: &[(String, Vec<f64>)], confidence_level: f64) -> Self {
        self.groups = groups.iter().map(|(l, _)| l.clone()).collect();
        self.plot_stats = groups
            .iter()
            .map(|(l, s)| (l.clone(), GroupStats::from_sample(s, confidence_level)))
            .collect();
        self.plot_data = groups
            .iter()
            .flat_map(|(l, s)| {
                s.iter()
                    .map(move |v| serde_json::json!({ "group": l, "value": v }))
            })
            .collect();
        self
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// The JSON-safe form of this result.
    ///
    /// Non-finite numbers become `None`, probabilities are clamped into
    /// `[0, 1]`, confidence bounds are put in order, adjusted post-hoc
    /// p-values are raised to at least their raw value, and free-form
    /// fields are rebuilt without NaN or infinities.
    pub fn sanitized(self) -> Self {
        let (effect_size_ci_low, effect_size_ci_high) = ordered(
            finite(self.effect_size_ci_low),
            finite(self.effect_size_ci_high),
        );
        let p_value = probability(self.p_value);
        Self {
            stat_value: finite(self.stat_value),
            significant: self.significant && p_value.is_some(),
            p_value,
            effect_size: finite(self.effect_size),
            effect_size_ci_low,
            effect_size_ci_high,
            plot_data: self.plot_data.into_iter().map(sanitize_value).collect(),
            plot_stats: self
                .plot_stats
                .into_iter()
                .map(|(k, v)| (k, v.sanitized()))
                .collect(),
            assumptions: self.assumptions.map(sanitize_report),
            post_hoc: self
                .post_hoc
                .map(|rows| rows.into_iter().map(PostHocComparison::sanitized).collect()),
            extra: match sanitize_value(Value::Object(self.extra)) {
                Value::Object(map) => map,
                _ => Map::new(),
            },
            ..self
        }
    }
}

fn sanitize_check(check: AssumptionCheck) -> AssumptionCheck {
    AssumptionCheck {
        statistic: finite(check.statistic),
        p_value: probability(check.p_value),
        ..check
    }
}

fn sanitize_report(report: AssumptionReport) -> AssumptionReport {
    AssumptionReport {
        normality: report
            .normality
            .into_iter()
            .map(|mut g| {
                g.check = sanitize_check(g.check);
                g
            })
            .collect(),
        homogeneity: report.homogeneity.map(sanitize_check),
    }
}

/// `Some(x)` only for finite `x`.
pub fn finite(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

fn probability(value: Option<f64>) -> Option<f64> {
    finite(value).map(|p| p.clamp(0.0, 1.0))
}

fn ordered(low: Option<f64>, high: Option<f64>) -> (Option<f64>, Option<f64>) {
    match (low, high) {
        (Some(l), Some(h)) if l > h => (Some(h), Some(l)),
        other => other,
    }
}

/// A JSON number, or `null` for NaN and infinities.
pub fn json_number(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Recursively replace any number that is not a finite `f64` with `null`.
pub fn sanitize_value(value: Value) -> Value {
    match value {
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.is_finite() => Value::Number(n),
            _ => Value::Null,
        },
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_value).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, sanitize_value(v)))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_group_stats() {
        let stats = GroupStats::from_sample(&[1.0, 2.0, 3.0, 4.0, 5.0], 0.95);
        assert_eq!(stats.count, 5);
        assert_eq!(stats.mean, Some(3.0));
        assert_eq!(stats.median, Some(3.0));
        assert_eq!(stats.q1, Some(2.0));
        assert_eq!(stats.q3, Some(4.0));
        assert_eq!(stats.min, Some(1.0));
        assert_eq!(stats.max, Some(5.0));
        assert!(stats.ci_low.unwrap() < 3.0 && stats.ci_high.unwrap() > 3.0);
    }

    #[test]
    fn test_group_stats_single_value_has_null_spread() {
        let stats = GroupStats::from_sample(&[7.0], 0.95);
        assert_eq!(stats.mean, Some(7.0));
        assert_eq!(stats.sd, None);
        assert_eq!(stats.ci_low, None);
    }

    #[test]
    fn test_sanitized_replaces_non_finite() {
        let mut result = AnalysisResult::new(MethodId::TTestInd, "t")
            .with_test(f64::NAN, 1.2, 0.05)
            .with_effect_size("d", f64::INFINITY, Some((Some(0.9), Some(0.1))))
            .with_extra("nested", json!({"a": [1.0, 2.0]}));
        result.extra.insert("b".into(), json_number(f64::NAN));
        let clean = result.sanitized();
        assert_eq!(clean.stat_value, None);
        assert_eq!(clean.p_value, Some(1.0));
        assert_eq!(clean.effect_size, None);
        assert_eq!(clean.effect_size_ci_low, Some(0.1));
        assert_eq!(clean.effect_size_ci_high, Some(0.9));
        assert_eq!(clean.extra["b"], Value::Null);
        let text = serde_json::to_string(&clean).unwrap();
        assert!(!text.contains("NaN"));
        assert!(!text.contains("inf"));
    }

    #[test]
    fn test_sanitized_post_hoc_adjusted_not_below_raw() {
        let mut result = AnalysisResult::new(MethodId::Anova, "ANOVA");
        result.post_hoc = Some(vec![PostHocComparison {
            group_a: "a".into(),
            group_b: "b".into(),
            diff: Some(1.0),
            raw_p: Some(0.04),
            p_value: Some(0.03),
            significant: true,
            ci_low: None,
            ci_high: None,
        }]);
        let clean = result.sanitized();
        let row = &clean.post_hoc.unwrap()[0];
        assert_eq!(row.p_value, Some(0.04));
    }

    #[test]
    fn test_with_groups_builds_plot_data() {
        let groups = vec![
            ("a".to_string(), vec![1.0, 2.0]),
            ("b".to_string(), vec![3.0]),
        ];
        let result = AnalysisResult::new(MethodId::Descriptive, "d").with_groups(&groups, 0.95);
        assert_eq!(result.groups, vec!["a", "b"]);
        assert_eq!(result.plot_data.len(), 3);
        assert_eq!(result.plot_data[2], json!({"group": "b", "value": 3.0}));
        assert_eq!(result.plot_stats["a"].count, 2);
    }
}
