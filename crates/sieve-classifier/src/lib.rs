//! Waterfall classification of log records into error groups.
//!
//! A record is tested against the configured levels in order, then against
//! the operator rule library, and finally lands in the `Unclassified` fallback.
//! The first match wins, so every record receives exactly one level.

mod fingerprint;
mod rule_library;
mod waterfall;

use sieve_normalizer::{Normalizer, RuleLibraryIssue};
use sieve_types::{ClassificationLevel, LogRecord};
use thiserror::Error;

pub use fingerprint::{fingerprint, FIELD_SEPARATOR};
pub use rule_library::{CustomRule, RuleLibrary};
pub use sieve_normalizer::IssueSource;
pub use waterfall::{FallbackDefinition, LevelDefinition, RecordField, Template, WaterfallConfig};

use rule_library::CompiledCustomRule;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassifierError {
    #[error("signature template '{template}' references unknown field '{placeholder}'")]
    UnknownPlaceholder {
        template: String,
        placeholder: String,
    },
    #[error("level {level} cannot be configured in the waterfall")]
    ReservedLevel { level: ClassificationLevel },
    #[error("level {level} is configured more than once")]
    DuplicateLevel { level: ClassificationLevel },
    #[error("level {level} has no fingerprint fields")]
    EmptyFingerprint { level: ClassificationLevel },
}

/// Result of classifying one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub level: ClassificationLevel,
    pub signature: String,
    pub fingerprint_input: Vec<String>,
}

impl Classification {
    pub fn fingerprint(&self) -> String {
        fingerprint(self.level, &self.fingerprint_input)
    }
}

/// Field values of one record, with blank values treated as absent.
struct ResolvedRecord<'a> {
    record: &'a LogRecord,
    normalized_message: String,
}

impl<'a> ResolvedRecord<'a> {
    fn new(record: &'a LogRecord, normalizer: &Normalizer) -> Self {
        Self {
            record,
            normalized_message: normalizer.normalize_opt(present(record.message.as_deref())),
        }
    }

    fn get(&self, field: RecordField) -> Option<&str> {
        let raw = match field {
            RecordField::Message => self.record.message.as_deref(),
            RecordField::NormalizedMessage => Some(self.normalized_message.as_str()),
            RecordField::LoggerName => self.record.logger_name.as_deref(),
            RecordField::ExceptionClass => self.record.exception_class.as_deref(),
            RecordField::RuleName => self.record.rule.as_ref().map(|rule| rule.name.as_str()),
            RecordField::RuleType => self
                .record
                .rule
                .as_ref()
                .map(|rule| rule.rule_type.as_str()),
        };
        present(raw)
    }

    fn has_all(&self, fields: &[RecordField]) -> bool {
        fields.iter().all(|field| self.get(*field).is_some())
    }

    fn values(&self, fields: &[RecordField]) -> Vec<String> {
        fields
            .iter()
            .map(|field| self.get(*field).unwrap_or_default().to_string())
            .collect()
    }

    fn render(&self, template: &Template) -> String {
        template.render(|field| self.get(field))
    }
}

fn present(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

#[derive(Debug, Clone)]
struct CompiledLevel {
    level: ClassificationLevel,
    required: Vec<RecordField>,
    fingerprint_fields: Vec<RecordField>,
    template: Template,
}

#[derive(Debug, Clone)]
struct CompiledFallback {
    fingerprint_fields: Vec<RecordField>,
    template: Template,
    empty_signature: String,
}

/// Compiled waterfall: configured levels, custom rules, fallback.
#[derive(Debug, Clone)]
pub struct Classifier {
    normalizer: Normalizer,
    levels: Vec<CompiledLevel>,
    custom_rules: Vec<CompiledCustomRule>,
    fallback: CompiledFallback,
}

impl Classifier {
    /// Builds a classifier. Invalid waterfall configuration is an error;
    /// unusable custom rules are skipped and returned as issues.
    pub fn new(
        normalizer: Normalizer,
        waterfall: &WaterfallConfig,
        library: &RuleLibrary,
    ) -> Result<(Self, Vec<RuleLibraryIssue>), ClassifierError> {
        waterfall.validate()?;
        let levels = waterfall
            .levels
            .iter()
            .map(|definition| {
                Ok(CompiledLevel {
                    level: definition.level,
                    required: definition.required.clone(),
                    fingerprint_fields: definition.fingerprint_fields.clone(),
                    template: Template::parse(&definition.signature_template)?,
                })
            })
            .collect::<Result<Vec<_>, ClassifierError>>()?;
        let fallback = CompiledFallback {
            fingerprint_fields: waterfall.fallback.fingerprint_fields.clone(),
            template: Template::parse(&waterfall.fallback.signature_template)?,
            empty_signature: waterfall.fallback.empty_signature.clone(),
        };
        let (custom_rules, issues) = library.compile();

        Ok((
            Self {
                normalizer,
                levels,
                custom_rules,
                fallback,
            },
            issues,
        ))
    }

    /// Built-in normalizer rules, default waterfall, no custom rules.
    pub fn with_defaults() -> Result<Self, ClassifierError> {
        let (classifier, _issues) = Self::new(
            Normalizer::default(),
            &WaterfallConfig::default(),
            &RuleLibrary::default(),
        )?;
        Ok(classifier)
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    pub fn custom_rule_count(&self) -> usize {
        self.custom_rules.len()
    }

    /// Assigns exactly one level. Never fails: records missing every
    /// classification field fall through to `Unclassified`.
    pub fn classify(&self, record: &LogRecord) -> Classification {
        let resolved = ResolvedRecord::new(record, &self.normalizer);

        if let Some(level) = self
            .levels
            .iter()
            .find(|level| resolved.has_all(&level.required))
        {
            return Classification {
                level: level.level,
                signature: resolved.render(&level.template),
                fingerprint_input: resolved.values(&level.fingerprint_fields),
            };
        }

        if let Some(rule) = self.custom_rules.iter().find(|rule| {
            resolved
                .get(rule.field)
                .is_some_and(|value| rule.regex.is_match(value))
        }) {
            return Classification {
                level: ClassificationLevel::Custom,
                signature: rule.name.clone(),
                fingerprint_input: vec![rule.name.clone()],
            };
        }

        let signature = resolved.render(&self.fallback.template);
        let signature = if signature.trim().is_empty() {
            self.fallback.empty_signature.clone()
        } else {
            signature
        };
        Classification {
            level: ClassificationLevel::Unclassified,
            signature,
            fingerprint_input: resolved.values(&self.fallback.fingerprint_fields),
        }
    }
}
