use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sieve_classifier::{Classifier, ClassifierError, RuleLibrary, WaterfallConfig};
use sieve_normalizer::{NormalizationRule, Normalizer, RuleLibraryIssue};
use sieve_types::{LogLevel, SourceFilter};

/// Bounded exponential backoff for transient store errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Total attempts per store call, including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 25,
            max_backoff_ms: 2_000,
        }
    }
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NormalizerConfig {
    /// Replaces the built-in ordered rule list when set.
    pub rules: Option<Vec<NormalizationRule>>,
}

/// Settings for a grouping pass, loaded from TOML. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GrouperConfig {
    pub batch_size: usize,
    pub sample_cap: usize,
    /// Source levels read by a pass. Empty reads every level.
    pub levels: Vec<LogLevel>,
    pub max_records_per_pass: Option<usize>,
    pub retry: RetryConfig,
    pub normalizer: NormalizerConfig,
    pub waterfall: WaterfallConfig,
    pub rule_library: RuleLibrary,
}

impl Default for GrouperConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            sample_cap: 50,
            levels: vec![LogLevel::Error, LogLevel::Fatal],
            max_records_per_pass: None,
            retry: RetryConfig::default(),
            normalizer: NormalizerConfig::default(),
            waterfall: WaterfallConfig::default(),
            rule_library: RuleLibrary::default(),
        }
    }
}

impl GrouperConfig {
    /// Reads, parses and validates a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read grouper config {}", path.display()))?;
        let config = Self::from_toml_str(&raw)
            .with_context(|| format!("load grouper config {}", path.display()))?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).context("parse grouper config TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Validates batch sizing, retry backoff and the waterfall definition.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            bail!("batch_size must be greater than 0");
        }
        if self.sample_cap == 0 {
            bail!("sample_cap must be greater than 0");
        }
        if self.max_records_per_pass == Some(0) {
            bail!("max_records_per_pass must be greater than 0 when set");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be greater than 0");
        }
        if self.retry.initial_backoff_ms == 0 {
            bail!("retry.initial_backoff_ms must be greater than 0");
        }
        if self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            bail!("retry.max_backoff_ms must be >= retry.initial_backoff_ms");
        }
        self.waterfall
            .validate()
            .context("invalid waterfall configuration")?;
        Ok(())
    }

    pub fn source_filter(&self) -> SourceFilter {
        SourceFilter {
            levels: (!self.levels.is_empty()).then(|| self.levels.clone()),
        }
    }

    /// Compiles the normalizer and classifier. Unusable normalizer or custom
    /// rules are skipped and returned as issues.
    pub fn build_classifier(
        &self,
    ) -> Result<(Classifier, Vec<RuleLibraryIssue>), ClassifierError> {
        let (normalizer, mut issues) = match &self.normalizer.rules {
            Some(rules) => Normalizer::compile(rules),
            None => (Normalizer::default(), Vec::new()),
        };
        let (classifier, library_issues) =
            Classifier::new(normalizer, &self.waterfall, &self.rule_library)?;
        issues.extend(library_issues);
        Ok((classifier, issues))
    }
}
