//! Completeness and consistency scoring for extracted records.
//!
//! A [`QualitySchema`] lists the fields a record is expected to carry, each
//! with a weight and a validation rule. [`QualityAnalyzer::score`] turns a
//! record into a [`QualityReport`]:
//!
//! - completeness: weighted share of fields that are present and not placeholders
//! - consistency: weighted share of present fields passing their rule
//! - overall: `w * completeness + (1 - w) * consistency`
//!
//! Scoring is pure. The same record and schema always produce the same report.

use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

use regex::{Regex, RegexSet, RegexSetBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppError;
use crate::models::Record;

/// Content scrapers commonly pick up instead of real data.
const DEFAULT_PLACEHOLDER_PATTERNS: &[&str] = &[
    r"^lorem\s+ipsum",
    r"^(placeholder|dummy\s+text)$",
    r"^(see|show|read)\s+more$",
    r"^(click\s+to\s+expand|view\s+full\s+profile)$",
    r"^(loading|error|failed\s+to\s+load)(\.\.\.|…)?$",
    r"^(test|sample|example|demo)(\s+(user|name|profile|person|account))?\s*\d*$",
    r"^(name|user|person|individual)\s*\d*$",
    r"^(n/?a|none|null|undefined|-+)$",
];

static DEFAULT_PLACEHOLDERS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSetBuilder::new(DEFAULT_PLACEHOLDER_PATTERNS)
        .case_insensitive(true)
        .build()
        .expect("built-in placeholder patterns are valid")
});

static PERSON_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\p{L}[\p{L}\s\-'.]*$").expect("valid regex"));

static LOCATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\p{L}[\p{L}\s\-,.'()]*$").expect("valid regex"));

fn default_weight() -> f64 {
    1.0
}

fn default_completeness_weight() -> f64 {
    0.5
}

/// Expected shape of a text field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shape {
    /// Letters, spaces, hyphens, apostrophes and dots; no digits.
    PersonName,
    /// Letters with common separators, e.g. "Milan, Lombardy, Italy".
    Location,
    /// Absolute http(s) URL with a host.
    Url,
    Numeric,
}

/// Validation rule for one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum FieldRule {
    /// Any non-empty value passes.
    NonEmpty,
    Text {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_chars: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_chars: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_words: Option<usize>,
    },
    Shaped {
        shape: Shape,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_chars: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_chars: Option<usize>,
    },
    List {
        #[serde(default)]
        min_items: usize,
    },
}

/// One expected field of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(flatten)]
    pub rule: FieldRule,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, weight: f64, rule: FieldRule) -> Self {
        Self {
            name: name.into(),
            weight,
            rule,
        }
    }
}

/// The fields a record is scored against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualitySchema {
    pub name: String,
    /// Weight of completeness in the overall score; consistency gets the rest.
    #[serde(default = "default_completeness_weight")]
    pub completeness_weight: f64,
    pub fields: Vec<FieldSpec>,
}

impl QualitySchema {
    /// Built-in schema for a professional profile.
    pub fn profile() -> Self {
        let text = |min, max, words| FieldRule::Text {
            min_chars: Some(min),
            max_chars: Some(max),
            min_words: Some(words),
        };
        let shaped = |shape, min, max| FieldRule::Shaped {
            shape,
            min_chars: Some(min),
            max_chars: Some(max),
        };
        let list = FieldRule::List { min_items: 1 };

        Self {
            name: "profile".to_string(),
            completeness_weight: default_completeness_weight(),
            fields: vec![
                FieldSpec::new("name", 0.25, shaped(Shape::PersonName, 2, 100)),
                FieldSpec::new("headline", 0.20, text(5, 220, 2)),
                FieldSpec::new("location", 0.10, shaped(Shape::Location, 2, 100)),
                FieldSpec::new("about", 0.15, text(10, 2600, 5)),
                FieldSpec::new("experience", 0.15, list.clone()),
                FieldSpec::new("education", 0.10, list.clone()),
                FieldSpec::new("skills", 0.05, list),
            ],
        }
    }

    pub fn from_json(json: &str) -> Result<Self, AppError> {
        let schema: Self = serde_json::from_str(json)
            .map_err(|e| AppError::Schema(format!("Invalid quality schema: {e}")))?;
        schema.validate()?;
        Ok(schema)
    }

    pub fn load(path: &Path) -> Result<Self, AppError> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            AppError::Schema(format!("Cannot read schema {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    /// Reject schemas that cannot produce meaningful scores.
    pub fn validate(&self) -> Result<(), AppError> {
        let mut issues = Vec::new();

        if self.fields.is_empty() {
            issues.push("schema has no fields".to_string());
        }
        if !(0.0..=1.0).contains(&self.completeness_weight) {
            issues.push(format!(
                "completeness_weight must be within [0, 1], got {}",
                self.completeness_weight
            ));
        }

        let mut seen = HashSet::new();
        for field in &self.fields {
            if field.name.trim().is_empty() {
                issues.push("field name must not be empty".to_string());
            }
            if !seen.insert(field.name.as_str()) {
                issues.push(format!("duplicate field '{}'", field.name));
            }
            if !field.weight.is_finite() || field.weight < 0.0 {
                issues.push(format!(
                    "field '{}' has invalid weight {}",
                    field.name, field.weight
                ));
            }
            let bounds = match &field.rule {
                FieldRule::Text {
                    min_chars,
                    max_chars,
                    ..
                }
                | FieldRule::Shaped {
                    min_chars,
                    max_chars,
                    ..
                } => (*min_chars).zip(*max_chars),
                _ => None,
            };
            if let Some((min, max)) = bounds
                && min > max
            {
                issues.push(format!(
                    "field '{}' has min_chars {min} > max_chars {max}",
                    field.name
                ));
            }
        }

        if !self.fields.is_empty() && self.total_weight() <= 0.0 {
            issues.push("total field weight must be positive".to_string());
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(AppError::Schema(issues.join("; ")))
        }
    }

    fn total_weight(&self) -> f64 {
        self.fields.iter().map(|f| f.weight.max(0.0)).sum()
    }
}

/// What went wrong with a field, in decreasing priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Missing,
    SuspiciousPlaceholder,
    MalformedShape,
    OutOfRange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityIssue {
    pub field: String,
    pub kind: IssueKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldQuality {
    pub name: String,
    /// The record holds a non-empty value for this field.
    pub present: bool,
    pub placeholder: bool,
    /// Present, not a placeholder, and passing the field's rule.
    pub valid: bool,
}

/// Result of scoring one record. Scores are in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub fields: Vec<FieldQuality>,
    pub completeness_score: f64,
    pub consistency_score: f64,
    pub overall_score: f64,
    pub issues: Vec<QualityIssue>,
    /// Extraction hints derived from `issues`, most urgent first.
    #[serde(default)]
    pub suggestions: Vec<String>,
}

impl QualityReport {
    pub fn passes(&self, min_quality: f64) -> bool {
        self.overall_score >= min_quality
    }

    pub fn missing_fields(&self) -> Vec<&str> {
        self.issues
            .iter()
            .filter(|i| i.kind == IssueKind::Missing)
            .map(|i| i.field.as_str())
            .collect()
    }

    pub fn issue_for(&self, field: &str) -> Option<IssueKind> {
        self.issues.iter().find(|i| i.field == field).map(|i| i.kind)
    }
}

/// Scores records against a [`QualitySchema`].
#[derive(Debug, Clone)]
pub struct QualityAnalyzer {
    placeholders: RegexSet,
}

impl Default for QualityAnalyzer {
    fn default() -> Self {
        Self {
            placeholders: DEFAULT_PLACEHOLDERS.clone(),
        }
    }
}

impl QualityAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the built-in placeholder patterns (matched case-insensitively
    /// against trimmed values).
    pub fn with_placeholder_patterns<I, S>(patterns: I) -> Result<Self, AppError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let placeholders = RegexSetBuilder::new(patterns)
            .case_insensitive(true)
            .build()
            .map_err(|e| AppError::Schema(format!("Invalid placeholder pattern: {e}")))?;
        Ok(Self { placeholders })
    }

    pub fn score(&self, record: &Record, schema: &QualitySchema) -> QualityReport {
        let mut fields = Vec::with_capacity(schema.fields.len());
        let mut issues = Vec::new();

        let total_weight = schema.total_weight();
        let mut complete_weight = 0.0;
        let mut present_weight = 0.0;
        let mut valid_weight = 0.0;

        for spec in &schema.fields {
            let weight = spec.weight.max(0.0);
            let value = record.get(&spec.name).filter(|v| is_present(v));

            let (present, placeholder, issue) = match value {
                None => (false, false, Some(IssueKind::Missing)),
                Some(value) if self.is_placeholder(value) => {
                    (true, true, Some(IssueKind::SuspiciousPlaceholder))
                }
                Some(value) => (true, false, check_rule(&spec.rule, value)),
            };
            let valid = present && issue.is_none();

            if present {
                present_weight += weight;
                if !placeholder {
                    complete_weight += weight;
                }
                if valid {
                    valid_weight += weight;
                }
            }
            if let Some(kind) = issue {
                issues.push(QualityIssue {
                    field: spec.name.clone(),
                    kind,
                });
            }
            fields.push(FieldQuality {
                name: spec.name.clone(),
                present,
                placeholder,
                valid,
            });
        }

        let completeness_score = ratio(complete_weight, total_weight);
        let consistency_score = ratio(valid_weight, present_weight);
        let w = schema.completeness_weight.clamp(0.0, 1.0);
        let overall_score = w * completeness_score + (1.0 - w) * consistency_score;

        let suggestions = suggestions_for(&issues, completeness_score);
        QualityReport {
            fields,
            completeness_score,
            consistency_score,
            overall_score,
            issues,
            suggestions,
        }
    }

    fn is_placeholder(&self, value: &Value) -> bool {
        match value {
            Value::String(s) => self.placeholders.is_match(s.trim()),
            // A list counts only when every entry is filler.
            Value::Array(items) => {
                !items.is_empty()
                    && items.iter().all(|item| match item {
                        Value::String(s) => self.placeholders.is_match(s.trim()),
                        _ => false,
                    })
            }
            _ => false,
        }
    }
}

/// Below this completeness the whole record is suspect, not just some fields.
const LOW_COMPLETENESS: f64 = 0.6;

fn suggestions_for(issues: &[QualityIssue], completeness: f64) -> Vec<String> {
    let fields_with = |kind: IssueKind| {
        issues
            .iter()
            .filter(|i| i.kind == kind)
            .map(|i| i.field.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };

    let mut suggestions = Vec::new();
    let mut push = |kind: IssueKind, prefix: &str| {
        let fields = fields_with(kind);
        if !fields.is_empty() {
            suggestions.push(format!("{prefix}: {fields}"));
        }
    };
    push(IssueKind::Missing, "Improve extraction for missing fields");
    push(
        IssueKind::SuspiciousPlaceholder,
        "Review extraction for fields holding placeholder text",
    );
    push(
        IssueKind::MalformedShape,
        "Add format validation for malformed fields",
    );
    push(IssueKind::OutOfRange, "Check length limits for out-of-range fields");

    if !issues.is_empty() && completeness < LOW_COMPLETENESS {
        suggestions.push(
            "Record looks incomplete; check page load timing or the extractor mapping".to_string(),
        );
    }
    suggestions
}

fn ratio(part: f64, whole: f64) -> f64 {
    if whole > 0.0 {
        (part / whole).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Bool(_) | Value::Number(_) => true,
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn out_of_range(text: &str, min_chars: Option<usize>, max_chars: Option<usize>) -> bool {
    let chars = text.chars().count();
    min_chars.is_some_and(|min| chars < min) || max_chars.is_some_and(|max| chars > max)
}

fn matches_shape(shape: Shape, value: &Value, text: &str) -> bool {
    match shape {
        Shape::PersonName => PERSON_NAME.is_match(text),
        Shape::Location => LOCATION.is_match(text),
        Shape::Url => url::Url::parse(text)
            .map(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some())
            .unwrap_or(false),
        Shape::Numeric => value.is_number() || text.replace(',', "").parse::<f64>().is_ok(),
    }
}

/// First rule violation for a present, non-placeholder value.
fn check_rule(rule: &FieldRule, value: &Value) -> Option<IssueKind> {
    match rule {
        FieldRule::NonEmpty => None,
        FieldRule::Text {
            min_chars,
            max_chars,
            min_words,
        } => {
            let Some(text) = scalar_text(value) else {
                return Some(IssueKind::MalformedShape);
            };
            let too_few_words =
                min_words.is_some_and(|min| text.split_whitespace().count() < min);
            (out_of_range(&text, *min_chars, *max_chars) || too_few_words)
                .then_some(IssueKind::OutOfRange)
        }
        FieldRule::Shaped {
            shape,
            min_chars,
            max_chars,
        } => {
            let Some(text) = scalar_text(value) else {
                return Some(IssueKind::MalformedShape);
            };
            if !matches_shape(*shape, value, &text) {
                Some(IssueKind::MalformedShape)
            } else if out_of_range(&text, *min_chars, *max_chars) {
                Some(IssueKind::OutOfRange)
            } else {
                None
            }
        }
        FieldRule::List { min_items } => match value {
            Value::Array(items) if items.len() >= *min_items => None,
            Value::Array(_) => Some(IssueKind::OutOfRange),
            _ => Some(IssueKind::MalformedShape),
        },
    }
}
