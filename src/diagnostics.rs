use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::SourceId;
use crate::error::KiraError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Reject,
    Warn,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Reject => write!(f, "reject"),
            Severity::Warn => write!(f, "warn"),
        }
    }
}

/// Non-fatal error classes. Everything here is recorded, never raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DiagnosticClass {
    FetchUnavailable,
    ParseError,
    AmbiguousIdentity,
    UnknownField,
    ValidationFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DiagnosticRecord {
    pub class: DiagnosticClass,
    pub row_key: String,
    pub rule_violated: String,
    pub severity: Severity,
    pub detail: String,
}

impl DiagnosticRecord {
    pub fn fetch_unavailable(source: SourceId, reason: &str) -> Self {
        Self {
            class: DiagnosticClass::FetchUnavailable,
            row_key: format!("source:{source}"),
            rule_violated: "source-available".to_string(),
            severity: Severity::Warn,
            detail: reason.to_string(),
        }
    }

    /// A dropped raw record or artifact.
    pub fn parse_error(source: SourceId, error: &KiraError) -> Self {
        let (row_key, detail) = match error {
            KiraError::Parse { locator, message } => (locator.clone(), message.clone()),
            other => (format!("source:{source}"), other.to_string()),
        };
        Self {
            class: DiagnosticClass::ParseError,
            row_key: format!("{source}:{row_key}"),
            rule_violated: "record-parseable".to_string(),
            severity: Severity::Reject,
            detail,
        }
    }

    pub fn ambiguous_identity(key: &str, candidates: &[String]) -> Self {
        Self {
            class: DiagnosticClass::AmbiguousIdentity,
            row_key: key.to_string(),
            rule_violated: "unambiguous-identity".to_string(),
            severity: Severity::Warn,
            detail: format!("fuzzy-matches multiple subjects: {}", candidates.join(", ")),
        }
    }

    pub fn unknown_field(row_key: &str, column: &str, locator: &str) -> Self {
        Self {
            class: DiagnosticClass::UnknownField,
            row_key: row_key.to_string(),
            rule_violated: "declared-field".to_string(),
            severity: Severity::Reject,
            detail: format!("{column} is not in the output schema ({locator})"),
        }
    }

    pub fn validation(row_key: &str, rule: &str, severity: Severity, detail: String) -> Self {
        Self {
            class: DiagnosticClass::ValidationFailure,
            row_key: row_key.to_string(),
            rule_violated: rule.to_string(),
            severity,
            detail,
        }
    }
}
