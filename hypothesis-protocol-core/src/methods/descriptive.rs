//! Summary statistics with no inferential test.

use serde_json::json;

use super::ExecutionContext;
use crate::error::AnalysisError;
use crate::options::{CommonOptions, DescriptiveOptions};
use crate::registry::{MethodId, RoleName};
use crate::result::{AnalysisResult, GroupStats};

pub fn execute(ctx: &ExecutionContext<'_>, options: &DescriptiveOptions) -> Result<AnalysisResult, AnalysisError> {
    let level = options.confidence_level(ctx.defaults);
    let target = ctx.roles.require(RoleName::Target)?;
    let groups: Vec<(String, Vec<f64>)> = match ctx.roles.group.as_deref() {
        Some(group) => ctx.dataset.grouped_numeric(target, group)?.groups,
        None => vec![(target.to_string(), ctx.dataset.clean_numeric(target)?)],
    };
    let all: Vec<f64> = groups.iter().flat_map(|(_, s)| s.iter().copied()).collect();
    if all.is_empty() {
        return Err(AnalysisError::InsufficientData(format!(
            "'{}' has no valid observations",
            target
        )));
    }
    let overall = GroupStats::from_sample(&all, level);

    let mut result = AnalysisResult::new(MethodId::Descriptive, MethodId::Descriptive.display_name())
        .with_groups(&groups, level)
        .with_extra("n", all.len())
        .with_extra("n_missing", ctx.dataset.n_rows() - all.len())
        .with_extra("overall", json!(overall));
    for (label, sample) in &groups {
        if sample.len() < 2 {
            result.warn(format!(
                "Group '{}' has {} observation(s); spread is undefined",
                label,
                sample.len()
            ));
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Column, Dataset};
    use crate::options::AnalysisDefaults;
    use crate::registry::ColumnRoles;

    #[test]
    fn test_grouped_summary() {
        let ds = Dataset::new("d")
            .with_column(
                "y",
                Column::Numeric(vec![Some(1.0), Some(2.0), Some(3.0), None, Some(10.0)]),
            )
            .unwrap()
            .with_column("g", Column::categorical(["a", "a", "a", "b", "b"]))
            .unwrap();
        let roles = ColumnRoles::grouped("y", "g");
        let defaults = AnalysisDefaults::default();
        let ctx = ExecutionContext {
            dataset: &ds,
            roles: &roles,
            defaults: &defaults,
        };
        let result = execute(&ctx, &DescriptiveOptions::default()).unwrap();
        assert!(result.p_value.is_none());
        assert!(result.stat_value.is_none());
        assert_eq!(result.groups, vec!["a", "b"]);
        assert_eq!(result.plot_stats["a"].mean, Some(2.0));
        assert_eq!(result.plot_stats["b"].count, 1);
        assert_eq!(result.extra["n_missing"], 1);
        assert_eq!(result.warnings.len(), 1);
    }
}
