//! Command-line interface for hypothesis-protocol.

use crate::config::Config;
use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "hypothesis-protocol")]
#[command(about = "Run an ordered statistical analysis protocol against a dataset")]
#[command(version)]
pub struct Cli {
    /// Dataset JSON file ({"id", "columns", "types"?})
    #[arg(short, long)]
    pub dataset: PathBuf,

    /// Protocol JSON file ({"name", "steps"})
    #[arg(short, long)]
    pub protocol: PathBuf,

    /// Path to config file (defaults to .hypothesis-protocol.toml when present)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Write the run record here instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Do not persist the run record to the runs directory
    #[arg(long)]
    pub no_store: bool,

    /// Disable colored summary output
    #[arg(long)]
    pub no_color: bool,

    /// Significance level
    #[arg(long)]
    pub alpha: Option<f64>,

    /// Confidence level for intervals (0.0-1.0)
    #[arg(long)]
    pub confidence_level: Option<f64>,

    /// Seed for bootstrap resampling
    #[arg(long)]
    pub seed: Option<u64>,

    /// Number of pool workers
    #[arg(long)]
    pub workers: Option<usize>,

    /// Per-call pool timeout in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Directory for persisted run records
    #[arg(long)]
    pub runs_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Apply CLI overrides to the configuration.
    ///
    /// Only values given on the command line replace config file values.
    pub fn apply_to_config(&self, config: &mut Config) {
        if let Some(alpha) = self.alpha {
            config.analysis.alpha = alpha;
        }

        if let Some(confidence_level) = self.confidence_level {
            config.analysis.confidence_level = confidence_level;
        }

        if let Some(seed) = self.seed {
            config.analysis.seed = seed;
        }

        if let Some(workers) = self.workers {
            config.pool.workers = workers;
        }

        if let Some(timeout_ms) = self.timeout_ms {
            config.pool.timeout_ms = timeout_ms;
        }

        if let Some(runs_dir) = &self.runs_dir {
            config.storage.runs_dir = runs_dir.clone();
        }

        if self.verbose {
            config.logging.level = "debug".to_string();
        }
    }

    pub fn config_path(&self) -> Option<&std::path::Path> {
        self.config.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_minimal() {
        let cli = Cli::parse_from([
            "hypothesis-protocol",
            "--dataset",
            "data.json",
            "--protocol",
            "protocol.json",
        ]);

        assert_eq!(cli.dataset, PathBuf::from("data.json"));
        assert_eq!(cli.protocol, PathBuf::from("protocol.json"));
        assert!(cli.config.is_none());
        assert!(cli.output.is_none());
        assert!(!cli.no_store);
        assert!(!cli.no_color);
        assert!(!cli.verbose);
        assert_eq!(cli.alpha, None);
    }

    #[test]
    fn test_cli_parse_full() {
        let cli = Cli::parse_from([
            "hypothesis-protocol",
            "-d",
            "data.json",
            "-p",
            "protocol.json",
            "--config",
            "custom.toml",
            "-o",
            "out.json",
            "--no-store",
            "--no-color",
            "--alpha",
            "0.01",
            "--confidence-level",
            "0.99",
            "--seed",
            "7",
            "--workers",
            "4",
            "--timeout-ms",
            "1000",
            "--runs-dir",
            "/tmp/runs",
            "-v",
        ]);

        assert_eq!(cli.config_path(), Some(std::path::Path::new("custom.toml")));
        assert_eq!(cli.output, Some(PathBuf::from("out.json")));
        assert!(cli.no_store);
        assert!(cli.no_color);
        assert_eq!(cli.alpha, Some(0.01));
        assert_eq!(cli.seed, Some(7));
        assert_eq!(cli.workers, Some(4));
        assert!(cli.verbose);
    }

    #[test]
    fn test_cli_requires_inputs() {
        assert!(Cli::try_parse_from(["hypothesis-protocol", "--dataset", "d.json"]).is_err());
    }

    #[test]
    fn test_apply_to_config_with_overrides() {
        let cli = Cli::parse_from([
            "hypothesis-protocol",
            "-d",
            "d.json",
            "-p",
            "p.json",
            "--confidence-level",
            "0.9",
            "--workers",
            "3",
            "--runs-dir",
            "elsewhere",
            "--verbose",
        ]);

        let mut config = Config::default();
        cli.apply_to_config(&mut config);

        assert_eq!(config.analysis.confidence_level, 0.9);
        assert_eq!(config.pool.workers, 3);
        assert_eq!(config.storage.runs_dir, PathBuf::from("elsewhere"));
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.analysis.alpha, 0.05);
    }

    #[test]
    fn test_apply_to_config_without_overrides() {
        let cli = Cli::parse_from(["hypothesis-protocol", "-d", "d.json", "-p", "p.json"]);

        let mut config = Config::default();
        cli.apply_to_config(&mut config);

        assert_eq!(config.analysis, Config::default().analysis);
        assert_eq!(config.pool.workers, 2);
        assert_eq!(config.logging.level, "info");
    }
}
