//! Deterministic rewriting of log text that masks volatile substrings
//! (dates, ids, addresses, paths) so equivalent errors compare equal.

mod rules;

use std::borrow::Cow;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub use rules::{builtin_rules, NormalizationRule, VALUE_GROUP};

/// Upper bound on rewrite passes when searching for a fixpoint.
pub const MAX_PASSES: usize = 4;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("rule '{rule}' has an invalid pattern: {source}")]
    InvalidPattern {
        rule: String,
        #[source]
        source: regex::Error,
    },
    #[error("rule '{rule}' lists keep values but has no `value` capture group")]
    MissingValueGroup { rule: String },
    #[error("rule has an empty name")]
    EmptyName,
}

/// Where a skipped rule came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSource {
    Normalizer,
    RuleLibrary,
}

/// A configured rule that could not be used and was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleLibraryIssue {
    pub source: IssueSource,
    pub rule: String,
    pub reason: String,
}

impl RuleLibraryIssue {
    pub fn new(source: IssueSource, rule: impl Into<String>, reason: impl ToString) -> Self {
        Self {
            source,
            rule: rule.into(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    name: String,
    regex: Regex,
    replacement: String,
    keep: Vec<String>,
    terminated_by: String,
}

impl CompiledRule {
    fn compile(rule: &NormalizationRule) -> Result<Self, RuleError> {
        if rule.name.trim().is_empty() {
            return Err(RuleError::EmptyName);
        }
        let regex = Regex::new(&rule.pattern).map_err(|source| RuleError::InvalidPattern {
            rule: rule.name.clone(),
            source,
        })?;
        let has_value_group = regex
            .capture_names()
            .any(|name| name == Some(VALUE_GROUP));
        if !rule.keep.is_empty() && !has_value_group {
            return Err(RuleError::MissingValueGroup {
                rule: rule.name.clone(),
            });
        }
        Ok(Self {
            name: rule.name.clone(),
            regex,
            replacement: rule.replacement.clone(),
            keep: rule.keep.clone(),
            terminated_by: rule.terminated_by.clone(),
        })
    }

    fn apply<'t>(&self, text: &'t str) -> Cow<'t, str> {
        if self.keep.is_empty() && self.terminated_by.is_empty() {
            return self.regex.replace_all(text, self.replacement.as_str());
        }

        self.regex.replace_all(text, |caps: &Captures<'_>| {
            let Some(whole) = caps.get(0) else {
                return String::new();
            };
            if !self.is_terminated(text, whole.end()) || self.is_kept(caps) {
                return whole.as_str().to_string();
            }
            let mut expanded = String::new();
            caps.expand(&self.replacement, &mut expanded);
            expanded
        })
    }

    fn is_terminated(&self, text: &str, end: usize) -> bool {
        if self.terminated_by.is_empty() {
            return true;
        }
        match text[end..].chars().next() {
            None => true,
            Some(next) => self.terminated_by.contains(next),
        }
    }

    fn is_kept(&self, caps: &Captures<'_>) -> bool {
        caps.name(VALUE_GROUP)
            .is_some_and(|value| self.keep.iter().any(|keep| keep == value.as_str()))
    }
}

/// An ordered, compiled rule list.
#[derive(Debug, Clone)]
pub struct Normalizer {
    rules: Vec<CompiledRule>,
}

impl Normalizer {
    /// Compiles `rules`, skipping and reporting any that are unusable.
    pub fn compile(rules: &[NormalizationRule]) -> (Self, Vec<RuleLibraryIssue>) {
        let mut compiled = Vec::with_capacity(rules.len());
        let mut issues = Vec::new();
        for rule in rules {
            match CompiledRule::compile(rule) {
                Ok(rule) => compiled.push(rule),
                Err(error) => {
                    warn!(rule = %rule.name, %error, "skipping normalization rule");
                    issues.push(RuleLibraryIssue::new(
                        IssueSource::Normalizer,
                        rule.name.clone(),
                        error,
                    ));
                }
            }
        }
        (Self { rules: compiled }, issues)
    }

    /// Compiles `rules`, failing on the first unusable one.
    pub fn try_compile(rules: &[NormalizationRule]) -> Result<Self, RuleError> {
        let rules = rules
            .iter()
            .map(CompiledRule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// Shared normalizer over [`builtin_rules`].
    pub fn builtin() -> &'static Normalizer {
        static BUILTIN: OnceLock<Normalizer> = OnceLock::new();
        BUILTIN.get_or_init(Normalizer::default)
    }

    pub fn rule_names(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|rule| rule.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rewrites `text` until it stops changing or [`MAX_PASSES`] is reached.
    pub fn normalize(&self, text: &str) -> String {
        let mut current = text.to_string();
        for _ in 0..MAX_PASSES {
            let next = self.apply_once(&current);
            if next == current {
                break;
            }
            current = next;
        }
        current
    }

    pub fn normalize_opt(&self, text: Option<&str>) -> String {
        text.map(|text| self.normalize(text)).unwrap_or_default()
    }

    fn apply_once(&self, text: &str) -> String {
        self.rules
            .iter()
            .fold(text.to_string(), |acc, rule| rule.apply(&acc).into_owned())
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        let (normalizer, _issues) = Self::compile(&builtin_rules());
        normalizer
    }
}

/// Normalizes `text` with the built-in rules.
pub fn normalize(text: &str) -> String {
    Normalizer::builtin().normalize(text)
}

/// Normalizes optional text; absent input yields an empty string.
pub fn normalize_opt(text: Option<&str>) -> String {
    Normalizer::builtin().normalize_opt(text)
}
