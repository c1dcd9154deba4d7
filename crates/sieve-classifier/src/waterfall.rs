use serde::{Deserialize, Serialize};
use sieve_types::ClassificationLevel;

use crate::ClassifierError;

/// Record attribute a level can require, hash or render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecordField {
    #[default]
    Message,
    NormalizedMessage,
    LoggerName,
    ExceptionClass,
    RuleName,
    RuleType,
}

impl RecordField {
    pub const ALL: [Self; 6] = [
        Self::Message,
        Self::NormalizedMessage,
        Self::LoggerName,
        Self::ExceptionClass,
        Self::RuleName,
        Self::RuleType,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::NormalizedMessage => "normalized_message",
            Self::LoggerName => "logger_name",
            Self::ExceptionClass => "exception_class",
            Self::RuleName => "rule_name",
            Self::RuleType => "rule_type",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|field| field.as_str() == value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(RecordField),
}

/// Signature template with `{field}` placeholders, validated on parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(template: &str) -> Result<Self, ClassifierError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            literal.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let Some(close) = after.find('}') else {
                literal.push_str(&rest[open..]);
                rest = "";
                break;
            };
            let name = &after[..close];
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_lowercase() || c == '_') {
                literal.push('{');
                rest = after;
                continue;
            }
            let field =
                RecordField::parse(name).ok_or_else(|| ClassifierError::UnknownPlaceholder {
                    template: template.to_string(),
                    placeholder: name.to_string(),
                })?;
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Field(field));
            rest = &after[close + 1..];
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Ok(Self { segments })
    }

    /// Renders the template; absent fields render as empty text.
    pub fn render<'a>(&self, lookup: impl Fn(RecordField) -> Option<&'a str>) -> String {
        let mut rendered = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => rendered.push_str(text),
                Segment::Field(field) => rendered.push_str(lookup(*field).unwrap_or_default()),
            }
        }
        rendered
    }
}

/// One configured waterfall level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelDefinition {
    pub level: ClassificationLevel,
    /// Fields that must all be present for the level to match.
    pub required: Vec<RecordField>,
    /// Hashed in this order.
    pub fingerprint_fields: Vec<RecordField>,
    pub signature_template: String,
}

impl LevelDefinition {
    pub fn rule_failure() -> Self {
        Self {
            level: ClassificationLevel::RuleFailure,
            required: vec![
                RecordField::ExceptionClass,
                RecordField::RuleName,
                RecordField::RuleType,
            ],
            fingerprint_fields: vec![
                RecordField::ExceptionClass,
                RecordField::RuleName,
                RecordField::RuleType,
            ],
            signature_template: "{exception_class} | {rule_name} | {rule_type}".to_string(),
        }
    }

    pub fn logger_pattern() -> Self {
        Self {
            level: ClassificationLevel::LoggerPattern,
            required: vec![RecordField::LoggerName, RecordField::Message],
            fingerprint_fields: vec![RecordField::NormalizedMessage, RecordField::LoggerName],
            signature_template: "{normalized_message} | {logger_name}".to_string(),
        }
    }
}

/// Level assigned when nothing else matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackDefinition {
    pub fingerprint_fields: Vec<RecordField>,
    pub signature_template: String,
    /// Signature used when the template renders blank.
    #[serde(default = "default_empty_signature")]
    pub empty_signature: String,
}

fn default_empty_signature() -> String {
    "Unknown".to_string()
}

impl Default for FallbackDefinition {
    fn default() -> Self {
        Self {
            fingerprint_fields: vec![RecordField::NormalizedMessage],
            signature_template: "{normalized_message}".to_string(),
            empty_signature: default_empty_signature(),
        }
    }
}

/// Ordered level list plus the fallback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaterfallConfig {
    pub levels: Vec<LevelDefinition>,
    pub fallback: FallbackDefinition,
}

impl Default for WaterfallConfig {
    fn default() -> Self {
        Self {
            levels: vec![
                LevelDefinition::rule_failure(),
                LevelDefinition::logger_pattern(),
            ],
            fallback: FallbackDefinition::default(),
        }
    }
}

impl WaterfallConfig {
    pub fn validate(&self) -> Result<(), ClassifierError> {
        let mut seen = Vec::with_capacity(self.levels.len());
        for definition in &self.levels {
            if matches!(
                definition.level,
                ClassificationLevel::Custom | ClassificationLevel::Unclassified
            ) {
                return Err(ClassifierError::ReservedLevel {
                    level: definition.level,
                });
            }
            if seen.contains(&definition.level) {
                return Err(ClassifierError::DuplicateLevel {
                    level: definition.level,
                });
            }
            seen.push(definition.level);
            if definition.fingerprint_fields.is_empty() {
                return Err(ClassifierError::EmptyFingerprint {
                    level: definition.level,
                });
            }
            Template::parse(&definition.signature_template)?;
        }
        if self.fallback.fingerprint_fields.is_empty() {
            return Err(ClassifierError::EmptyFingerprint {
                level: ClassificationLevel::Unclassified,
            });
        }
        Template::parse(&self.fallback.signature_template)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{LevelDefinition, RecordField, Template, WaterfallConfig};
    use crate::ClassifierError;
    use sieve_types::ClassificationLevel;

    #[test]
    fn template_renders_fields_and_literals() {
        let template = Template::parse("{exception_class} | {rule_name}").expect("template");
        let rendered = template.render(|field| match field {
            RecordField::ExceptionClass => Some("NullPointerException"),
            RecordField::RuleName => Some("CalculateTax"),
            _ => None,
        });
        assert_eq!(rendered, "NullPointerException | CalculateTax");

        let literal = Template::parse("{ not a field } {x").expect("literal braces");
        assert_eq!(literal.render(|_| None), "{ not a field } {x");
    }

    #[test]
    fn template_rejects_unknown_placeholders() {
        let error = Template::parse("{exception} | {rule_name}").expect_err("unknown field");
        assert!(matches!(
            error,
            ClassifierError::UnknownPlaceholder { ref placeholder, .. } if placeholder == "exception"
        ));
    }

    #[test]
    fn validate_rejects_reserved_and_duplicate_levels() {
        assert!(WaterfallConfig::default().validate().is_ok());

        let mut config = WaterfallConfig::default();
        config.levels.push(LevelDefinition {
            level: ClassificationLevel::Unclassified,
            ..LevelDefinition::logger_pattern()
        });
        assert!(matches!(
            config.validate(),
            Err(ClassifierError::ReservedLevel { .. })
        ));

        let mut config = WaterfallConfig::default();
        config.levels.push(LevelDefinition::rule_failure());
        assert!(matches!(
            config.validate(),
            Err(ClassifierError::DuplicateLevel { .. })
        ));

        let mut config = WaterfallConfig::default();
        config.fallback.fingerprint_fields.clear();
        assert!(matches!(
            config.validate(),
            Err(ClassifierError::EmptyFingerprint {
                level: ClassificationLevel::Unclassified
            })
        ));
    }
}
