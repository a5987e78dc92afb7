//! Configuration loading for hypothesis-protocol.
//!
//! Supports loading configuration from TOML files, with sensible defaults
//! for all settings.

use anyhow::{Context, Result};
use hypothesis_protocol_core::{AnalysisDefaults, MethodId, MethodRegistry};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for hypothesis-protocol.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Process-wide statistical defaults.
    pub analysis: AnalysisDefaults,
    /// Worker pool sizing and timeouts.
    pub pool: PoolConfig,
    /// Where run records are written.
    pub storage: StorageConfig,
    /// Method registry settings.
    pub methods: MethodsConfig,
    pub logging: LoggingConfig,
}

/// Configuration for the analysis worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// Per-call timeout in milliseconds.
    pub timeout_ms: u64,
    /// Consecutive failures after which the pool is rebuilt.
    pub max_consecutive_failures: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding `<dataset_id>/<run_id>.json` records.
    pub runs_dir: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MethodsConfig {
    /// Method ids registered as disabled.
    pub disabled: Vec<MethodId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            timeout_ms: 300_000, // 5 minutes
            max_consecutive_failures: 3,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            runs_dir: PathBuf::from("runs"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl PoolConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl MethodsConfig {
    /// Build the registry with the configured methods disabled.
    pub fn registry(&self) -> MethodRegistry {
        MethodRegistry::with_disabled(&self.disabled)
    }
}

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = ".hypothesis-protocol.toml";

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// analysis defaults are out of range.
    pub fn load(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default file (`.hypothesis-protocol.toml`) or use defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file exists but cannot be parsed.
    pub fn load_or_default() -> Result<Config> {
        let path = Path::new(DEFAULT_CONFIG_FILE);

        if path.exists() {
            Self::load(path)
        } else {
            Ok(Config::default())
        }
    }

    /// Load from `path` when given, otherwise fall back to [`Config::load_or_default`].
    pub fn load_from(path: Option<&Path>) -> Result<Config> {
        match path {
            Some(p) => Self::load(p),
            None => Self::load_or_default(),
        }
    }

    /// Check values that TOML alone cannot constrain.
    pub fn validate(&self) -> Result<()> {
        self.analysis
            .validate()
            .context("Invalid [analysis] settings")?;
        if self.pool.workers == 0 {
            anyhow::bail!("[pool] workers must be at least 1");
        }
        if self.pool.timeout_ms == 0 {
            anyhow::bail!("[pool] timeout_ms must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.analysis.alpha, 0.05);
        assert_eq!(config.analysis.confidence_level, 0.95);
        assert_eq!(config.analysis.bootstrap_resamples, 5000);
        assert_eq!(config.analysis.seed, 42);
        assert_eq!(config.analysis.post_hoc_correction, "holm");
        assert_eq!(config.analysis.batch_correction, "fdr_bh");
        assert_eq!(config.pool.workers, 2);
        assert_eq!(config.pool.timeout_ms, 300_000);
        assert_eq!(config.pool.max_consecutive_failures, 3);
        assert_eq!(config.storage.runs_dir, PathBuf::from("runs"));
        assert!(config.methods.disabled.is_empty());
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
    }

    #[test]
    fn test_load_partial_config() {
        let toml_content = r#"
[analysis]
confidence_level = 0.99

[pool]
workers = 4
"#;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.analysis.confidence_level, 0.99);
        assert_eq!(config.pool.workers, 4);

        assert_eq!(config.analysis.alpha, 0.05);
        assert_eq!(config.pool.timeout_ms, 300_000);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_full_config() {
        let toml_content = r#"
[analysis]
alpha = 0.01
confidence_level = 0.9
bootstrap_resamples = 2000
seed = 7
post_hoc_correction = "bonferroni"
batch_correction = "fdr_by"

[pool]
workers = 1
timeout_ms = 1000
max_consecutive_failures = 5

[storage]
runs_dir = "/var/lib/hp/runs"

[methods]
disabled = ["mixed_effects", "cox_regression"]

[logging]
level = "debug"
json = true
"#;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.analysis.alpha, 0.01);
        assert_eq!(config.analysis.bootstrap_resamples, 2000);
        assert_eq!(config.analysis.seed, 7);
        assert_eq!(config.analysis.post_hoc_correction, "bonferroni");
        assert_eq!(config.pool.timeout(), Duration::from_secs(1));
        assert_eq!(config.pool.max_consecutive_failures, 5);
        assert_eq!(config.storage.runs_dir, PathBuf::from("/var/lib/hp/runs"));
        assert_eq!(
            config.methods.disabled,
            vec![MethodId::MixedEffects, MethodId::CoxRegression]
        );
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);

        let registry = config.methods.registry();
        assert!(registry.require_enabled(MethodId::MixedEffects).is_err());
        assert!(registry.require_enabled(MethodId::TTestInd).is_ok());
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_invalid_toml() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"this is not valid toml {{{{").unwrap();

        let result = Config::load(file.path());
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_method_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"[methods]\ndisabled = [\"astrology\"]\n").unwrap();

        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn test_out_of_range_alpha_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"[analysis]\nalpha = 1.5\n").unwrap();

        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = Config::default();
        config.pool.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.analysis, parsed.analysis);
        assert_eq!(config.pool.workers, parsed.pool.workers);
        assert_eq!(config.storage.runs_dir, parsed.storage.runs_dir);
    }
}
