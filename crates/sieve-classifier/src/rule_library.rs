use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use sieve_normalizer::{IssueSource, RuleLibraryIssue};
use tracing::warn;

use crate::waterfall::RecordField;

/// Operator-maintained rule evaluated after the configured levels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomRule {
    pub name: String,
    /// Case-insensitive regular expression.
    pub pattern: String,
    #[serde(default)]
    pub field: RecordField,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl CustomRule {
    pub fn new(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
            field: RecordField::Message,
            enabled: true,
        }
    }
}

/// Ordered, versioned set of custom rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleLibrary {
    pub version: u32,
    pub rules: Vec<CustomRule>,
}

#[derive(Debug, Clone)]
pub(crate) struct CompiledCustomRule {
    pub(crate) name: String,
    pub(crate) field: RecordField,
    pub(crate) regex: Regex,
}

impl RuleLibrary {
    /// Compiles enabled rules in order; rules with bad patterns or blank names
    /// are skipped and reported.
    pub(crate) fn compile(&self) -> (Vec<CompiledCustomRule>, Vec<RuleLibraryIssue>) {
        let mut compiled = Vec::new();
        let mut issues = Vec::new();
        for rule in self.rules.iter().filter(|rule| rule.enabled) {
            if rule.name.trim().is_empty() {
                issues.push(RuleLibraryIssue::new(
                    IssueSource::RuleLibrary,
                    rule.name.clone(),
                    "rule has an empty name",
                ));
                continue;
            }
            match RegexBuilder::new(&rule.pattern)
                .case_insensitive(true)
                .build()
            {
                Ok(regex) => compiled.push(CompiledCustomRule {
                    name: rule.name.clone(),
                    field: rule.field,
                    regex,
                }),
                Err(error) => {
                    warn!(
                        rule = %rule.name,
                        version = self.version,
                        %error,
                        "skipping custom rule"
                    );
                    issues.push(RuleLibraryIssue::new(
                        IssueSource::RuleLibrary,
                        rule.name.clone(),
                        error,
                    ));
                }
            }
        }
        (compiled, issues)
    }
}
