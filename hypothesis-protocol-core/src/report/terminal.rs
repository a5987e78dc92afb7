use std::io::{self, Write};

use colored::Colorize;

use super::{Outcome, ReportError, Reporter, StepSummary};

/// A reporter that prints a run summary table to the terminal.
#[derive(Debug, Clone, Default)]
pub struct TerminalReporter {
    /// Whether to use colors in output (defaults to true).
    use_colors: bool,
    /// Write to stderr instead of stdout.
    stderr: bool,
}

impl TerminalReporter {
    /// Create a new terminal reporter with default settings.
    pub fn new() -> Self {
        Self {
            use_colors: true,
            stderr: false,
        }
    }

    /// Create a terminal reporter with color output disabled.
    pub fn without_colors() -> Self {
        Self {
            use_colors: false,
            stderr: false,
        }
    }

    /// Send the table to stderr, leaving stdout free for machine output.
    pub fn on_stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    fn format_p_value(p: Option<f64>) -> String {
        match p {
            None => "-".to_string(),
            Some(p) if p < 0.0001 => "<0.0001".to_string(),
            Some(p) => format!("{:.4}", p),
        }
    }

    fn format_effect(step: &StepSummary) -> String {
        match (step.effect_size, step.effect_size_name.as_deref()) {
            (Some(value), Some(name)) => format!("{}={:.3}", name, value),
            (Some(value), None) => format!("{:.3}", value),
            _ => "-".to_string(),
        }
    }

    fn outcome_text(outcome: &Outcome) -> &'static str {
        match outcome {
            Outcome::Significant => "significant",
            Outcome::NotSignificant => "n.s.",
            Outcome::Descriptive => "descriptive",
            Outcome::Failed(_) => "failed",
        }
    }

    /// Format the result column with appropriate coloring.
    fn format_outcome(&self, outcome: &Outcome) -> String {
        let text = Self::outcome_text(outcome);
        if !self.use_colors {
            return text.to_string();
        }
        match outcome {
            Outcome::Significant => text.green().bold().to_string(),
            Outcome::NotSignificant => text.yellow().to_string(),
            Outcome::Descriptive => text.normal().to_string(),
            Outcome::Failed(_) => text.red().bold().to_string(),
        }
    }

    fn truncate(name: &str, width: usize) -> String {
        if name.chars().count() > width {
            let kept: String = name.chars().take(width - 3).collect();
            format!("{}...", kept)
        } else {
            name.to_string()
        }
    }

    fn print_header(&self, writer: &mut impl Write, title: &str) -> io::Result<()> {
        writeln!(writer)?;
        if self.use_colors {
            writeln!(writer, "{}", title.bold())?;
        } else {
            writeln!(writer, "{}", title)?;
        }
        let header = format!(
            "{:<36} {:<22} {:>10} {:>24} {:>14}",
            "Step", "Method", "p-value", "Effect", "Result"
        );
        if self.use_colors {
            writeln!(writer, "{}", header.bold())?;
        } else {
            writeln!(writer, "{}", header)?;
        }
        writeln!(writer, "{}", "-".repeat(110))?;
        Ok(())
    }

    fn print_row(&self, writer: &mut impl Write, step: &StepSummary) -> io::Result<()> {
        let method = step.method.as_deref().unwrap_or("-");
        let result = self.format_outcome(&step.outcome);
        // Colored strings carry escape codes, so pad by visible width.
        let result_padding = 14_usize.saturating_sub(Self::outcome_text(&step.outcome).len());

        writeln!(
            writer,
            "{:<36} {:<22} {:>10} {:>24} {:>width_result$}{}",
            Self::truncate(&step.name, 36),
            Self::truncate(method, 22),
            Self::format_p_value(step.p_value),
            Self::truncate(&Self::format_effect(step), 24),
            "",
            result,
            width_result = result_padding,
        )?;
        if let Outcome::Failed(message) = &step.outcome {
            let line = format!("    {}", message);
            if self.use_colors {
                writeln!(writer, "{}", line.red())?;
            } else {
                writeln!(writer, "{}", line)?;
            }
        }
        Ok(())
    }

    fn print_summary(&self, writer: &mut impl Write, steps: &[StepSummary]) -> io::Result<()> {
        let count = |f: fn(&Outcome) -> bool| steps.iter().filter(|s| f(&s.outcome)).count();
        let significant = count(|o| matches!(o, Outcome::Significant));
        let not_significant = count(|o| matches!(o, Outcome::NotSignificant));
        let descriptive = count(|o| matches!(o, Outcome::Descriptive));
        let failed = count(|o| matches!(o, Outcome::Failed(_)));

        writeln!(writer, "{}", "-".repeat(110))?;
        let summary_label = "Summary:";
        if self.use_colors {
            write!(writer, "{} ", summary_label.bold())?;
        } else {
            write!(writer, "{} ", summary_label)?;
        }

        let significant_text = format!("{} significant", significant);
        let ns_text = format!("{} not significant", not_significant);
        let descriptive_text = format!("{} descriptive", descriptive);
        let failed_text = format!("{} failed", failed);
        if self.use_colors {
            writeln!(
                writer,
                "{}, {}, {}, {}",
                significant_text.green(),
                ns_text.yellow(),
                descriptive_text,
                failed_text.red()
            )?;
        } else {
            writeln!(
                writer,
                "{}, {}, {}, {}",
                significant_text, ns_text, descriptive_text, failed_text
            )?;
        }
        writeln!(writer)?;
        Ok(())
    }

    fn write_report(
        &self,
        writer: &mut impl Write,
        title: &str,
        steps: &[StepSummary],
    ) -> io::Result<()> {
        self.print_header(writer, title)?;
        for step in steps {
            self.print_row(writer, step)?;
        }
        self.print_summary(writer, steps)
    }
}

impl Reporter for TerminalReporter {
    fn report(&self, title: &str, steps: &[StepSummary]) -> Result<(), ReportError> {
        if self.stderr {
            self.write_report(&mut io::stderr().lock(), title, steps)?;
        } else {
            self.write_report(&mut io::stdout().lock(), title, steps)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str, p_value: Option<f64>, outcome: Outcome) -> StepSummary {
        StepSummary {
            name: name.to_string(),
            method: Some("t_test_ind".to_string()),
            p_value,
            effect_size: Some(0.8),
            effect_size_name: Some("cohens_d".to_string()),
            outcome,
        }
    }

    #[test]
    fn test_format_p_value() {
        assert_eq!(TerminalReporter::format_p_value(None), "-");
        assert_eq!(TerminalReporter::format_p_value(Some(0.00001)), "<0.0001");
        assert_eq!(TerminalReporter::format_p_value(Some(0.04321)), "0.0432");
    }

    #[test]
    fn test_format_effect() {
        let s = step("a", Some(0.01), Outcome::Significant);
        assert_eq!(TerminalReporter::format_effect(&s), "cohens_d=0.800");
    }

    #[test]
    fn test_truncate_long_names() {
        let name = "x".repeat(50);
        let short = TerminalReporter::truncate(&name, 36);
        assert_eq!(short.len(), 36);
        assert!(short.ends_with("..."));
    }

    #[test]
    fn test_report_to_buffer() {
        let reporter = TerminalReporter::without_colors();
        let steps = vec![
            step("compare_weight", Some(0.001), Outcome::Significant),
            step("compare_height", Some(0.4), Outcome::NotSignificant),
            step("summary", None, Outcome::Descriptive),
            step(
                "broken",
                None,
                Outcome::Failed("Column not found: bmi".to_string()),
            ),
        ];

        let mut buffer = Vec::new();
        reporter.write_report(&mut buffer, "trial", &steps).unwrap();

        let output = String::from_utf8(buffer).unwrap();
        assert!(output.contains("trial"));
        assert!(output.contains("compare_weight"));
        assert!(output.contains("Column not found: bmi"));
        assert!(output.contains("1 significant"));
        assert!(output.contains("1 not significant"));
        assert!(output.contains("1 descriptive"));
        assert!(output.contains("1 failed"));
    }
}
