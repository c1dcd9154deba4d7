use serde::{Deserialize, Serialize};

/// Name of the capture group that `keep` values are compared against.
pub const VALUE_GROUP: &str = "value";

/// One ordered substitution applied by the normalizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizationRule {
    pub name: String,
    pub pattern: String,
    pub replacement: String,
    /// Literal values of the `value` capture that are left untouched.
    #[serde(default)]
    pub keep: Vec<String>,
    /// Characters one of which must follow a match. End of text always qualifies.
    /// Empty means the match is not constrained.
    #[serde(default)]
    pub terminated_by: String,
}

impl NormalizationRule {
    pub fn new(
        name: impl Into<String>,
        pattern: impl Into<String>,
        replacement: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
            replacement: replacement.into(),
            keep: Vec::new(),
            terminated_by: String::new(),
        }
    }

    pub fn keeping<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keep = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn terminated_by(mut self, terminators: impl Into<String>) -> Self {
        self.terminated_by = terminators.into();
        self
    }
}

/// Built-in rule list. Order is significant: dates run before the numeric id
/// rules, paths before URL values, and object references before hex literals.
pub fn builtin_rules() -> Vec<NormalizationRule> {
    vec![
        NormalizationRule::new("paren_index", r"\((\d+)\)", "(*)"),
        NormalizationRule::new("bracket_index", r"\[(\d+)\]", "[*]"),
        NormalizationRule::new(
            "http_date",
            r"(?:Mon|Tue|Wed|Thu|Fri|Sat|Sun),\s+\d{1,2}\s+(?:Jan|Feb|Mar|Apr|May|Jun|Jul|Aug|Sep|Oct|Nov|Dec)\s+\d{4}\s+\d{2}:\d{2}:\d{2}\s+(?:GMT|UTC|EST|EDT|PST|PDT|[A-Z]{2,4})\b",
            "[DATE]",
        ),
        NormalizationRule::new(
            "iso_datetime",
            r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:\d{2})?",
            "[DATE]",
        ),
        NormalizationRule::new("iso_date", r"\d{4}-\d{2}-\d{2}", "[DATE]"),
        NormalizationRule::new("slash_date", r"\d{2}/\d{2}/\d{4}", "[DATE]"),
        NormalizationRule::new(
            "uuid",
            r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}",
            "[UUID]",
        ),
        NormalizationRule::new(
            "json_id",
            r#""id"\s*:\s*"[A-Za-z0-9]{10,}""#,
            r#""id":"[JSON_ID]""#,
        ),
        NormalizationRule::new("case_id", r"[A-Z]+-\d+", "[CASE_ID]"),
        NormalizationRule::new("long_number", r"\b\d{6,}\b", "[ID]"),
        NormalizationRule::new(
            "email",
            r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b",
            "[EMAIL]",
        ),
        NormalizationRule::new(
            "ipv4",
            r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b",
            "[IP]",
        ),
        NormalizationRule::new("windows_path", r#"[A-Za-z]:\\[^\s<>"|?*]+"#, "[FILE_PATH]"),
        NormalizationRule::new(
            "unix_path",
            r#"(^|[^\w:/])/[^\s<>"|?*/][^\s<>"|?*]+"#,
            "${1}[FILE_PATH]",
        ),
        NormalizationRule::new(
            "url_session_id",
            r"/[A-Za-z0-9_-]{15,}\*/",
            "/[SESSION_ID]*/",
        ),
        NormalizationRule::new(
            "url_hex_param",
            r"([?&])([a-zA-Z_]+)=[A-Fa-f0-9]{20,}",
            "${1}${2}=[HEX_ID]",
        ),
        NormalizationRule::new(
            "url_long_param",
            r"([?&])([a-zA-Z_]+)=[A-Za-z0-9]{15,}",
            "${1}${2}=[LONG_ID]",
        ),
        NormalizationRule::new(
            "url_numeric_param",
            r"([?&])([a-zA-Z_]+)=\d{5,}",
            "${1}${2}=[NUM_PARAM]",
        ),
        NormalizationRule::new(
            "url_encoded_param",
            r"([?&])([a-zA-Z_]+)=%[0-9A-Fa-f]{2,}[^\s&]*",
            "${1}${2}=[ENCODED_PARAM]",
        ),
        NormalizationRule::new(
            "url_query_value",
            r"([?&])([a-zA-Z_]+)=(?P<value>[A-Za-z0-9_-]+)",
            "${1}${2}=[QUERY_VALUE]",
        )
        .keeping(["true", "false", "1", "0", "yes", "no"])
        .terminated_by("& \t\r\n"),
        NormalizationRule::new(
            "url_query_string",
            r"(https?://[^\s?]+)\?[^\s]+",
            "${1}?[QUERY_PARAMS]",
        ),
        NormalizationRule::new(
            "object_ref",
            r"[A-Za-z0-9_$\[\];.]+@[0-9a-fA-F]{4,}\b",
            "[OBJECT_REF]",
        ),
        NormalizationRule::new("hex_literal", r"\b0x[0-9a-fA-F]+\b", "[HEX]"),
    ]
}
