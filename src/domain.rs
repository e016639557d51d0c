use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::KiraError;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum SourceId {
    Tcga,
    Geo,
    Cptac,
    Tcia,
    Pride,
    Nhanes,
}

impl SourceId {
    pub const ALL: [SourceId; 6] = [
        SourceId::Tcga,
        SourceId::Geo,
        SourceId::Cptac,
        SourceId::Tcia,
        SourceId::Pride,
        SourceId::Nhanes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceId::Tcga => "tcga",
            SourceId::Geo => "geo",
            SourceId::Cptac => "cptac",
            SourceId::Tcia => "tcia",
            SourceId::Pride => "pride",
            SourceId::Nhanes => "nhanes",
        }
    }

    /// Modalities a source can contribute to.
    pub fn modalities(&self) -> &'static [Modality] {
        match self {
            SourceId::Tcga => &[Modality::Genomic, Modality::Transcriptomic],
            SourceId::Geo => &[Modality::Transcriptomic],
            SourceId::Cptac => &[Modality::Proteomic],
            SourceId::Tcia => &[Modality::Imaging],
            SourceId::Pride => &[Modality::Proteomic],
            SourceId::Nhanes => &[Modality::Survey],
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SourceId {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tcga" => Ok(SourceId::Tcga),
            "geo" => Ok(SourceId::Geo),
            "cptac" => Ok(SourceId::Cptac),
            "tcia" => Ok(SourceId::Tcia),
            "pride" => Ok(SourceId::Pride),
            "nhanes" => Ok(SourceId::Nhanes),
            _ => Err(KiraError::InvalidSourceId(value.to_string())),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Genomic,
    Transcriptomic,
    Proteomic,
    Imaging,
    Survey,
}

impl Modality {
    pub const ALL: [Modality; 5] = [
        Modality::Genomic,
        Modality::Transcriptomic,
        Modality::Proteomic,
        Modality::Imaging,
        Modality::Survey,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Genomic => "genomic",
            Modality::Transcriptomic => "transcriptomic",
            Modality::Proteomic => "proteomic",
            Modality::Imaging => "imaging",
            Modality::Survey => "survey",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Modality {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "genomic" => Ok(Modality::Genomic),
            "transcriptomic" => Ok(Modality::Transcriptomic),
            "proteomic" => Ok(Modality::Proteomic),
            "imaging" => Ok(Modality::Imaging),
            "survey" => Ok(Modality::Survey),
            _ => Err(KiraError::InvalidModality(value.to_string())),
        }
    }
}

/// Typed scalar carried by an observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Boolean(bool),
    Integer(i64),
    Number(f64),
    Text(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(value) => Some(*value as f64),
            Value::Number(value) => Some(*value),
            Value::Boolean(_) | Value::Text(_) => None,
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Boolean(_) => ValueKind::Boolean,
            Value::Integer(_) => ValueKind::Integer,
            Value::Number(_) => ValueKind::Number,
            Value::Text(_) => ValueKind::Text,
        }
    }

    /// Stable textual form used for equality of conflicting values and for output.
    pub fn render(&self) -> String {
        match self {
            Value::Boolean(value) => value.to_string(),
            Value::Integer(value) => value.to_string(),
            Value::Number(value) => format_number(*value),
            Value::Text(value) => value.clone(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

fn format_number(value: f64) -> String {
    if value == 0.0 {
        // collapse -0.0
        return "0".to_string();
    }
    let rounded = (value * 1e6).round() / 1e6;
    format!("{rounded}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Boolean,
    Integer,
    Number,
    Text,
}

impl ValueKind {
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value.kind()) {
            (ValueKind::Number, ValueKind::Integer) => true,
            (expected, actual) => *expected == actual,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub source_id: SourceId,
    pub raw_locator: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalObservation {
    pub source_id: SourceId,
    pub subject_key_candidates: BTreeSet<String>,
    pub modality: Modality,
    pub field_name: String,
    pub value: Value,
    pub unit: Option<String>,
    pub provenance: Provenance,
}

impl CanonicalObservation {
    /// Field name namespaced by modality, as used for output columns.
    pub fn column(&self) -> String {
        format!("{}.{}", self.modality, self.field_name)
    }
}

/// Order matters: a subject takes the weakest method among the links that formed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionMethod {
    Fuzzy,
    Crosswalk,
    Exact,
}

impl fmt::Display for ResolutionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionMethod::Fuzzy => write!(f, "fuzzy"),
            ResolutionMethod::Crosswalk => write!(f, "crosswalk"),
            ResolutionMethod::Exact => write!(f, "exact"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalSubject {
    pub canonical_id: String,
    pub member_keys: BTreeSet<String>,
    pub resolution_method: ResolutionMethod,
    pub confidence: f64,
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_source_id() {
        let id: SourceId = " TCGA ".parse().unwrap();
        assert_eq!(id, SourceId::Tcga);
        let err = "gdc".parse::<SourceId>().unwrap_err();
        assert_matches!(err, KiraError::InvalidSourceId(_));
    }

    #[test]
    fn modality_order_matches_column_grouping() {
        let mut modalities = vec![Modality::Survey, Modality::Genomic, Modality::Imaging];
        modalities.sort();
        assert_eq!(
            modalities,
            vec![Modality::Genomic, Modality::Imaging, Modality::Survey]
        );
    }

    #[test]
    fn number_rendering_is_stable() {
        assert_eq!(Value::Number(61.0).render(), "61");
        assert_eq!(Value::Number(-0.0).render(), "0");
        assert_eq!(Value::Number(0.1 + 0.2).render(), "0.3");
        assert_eq!(Value::Integer(12).render(), "12");
    }

    #[test]
    fn number_kind_accepts_integers() {
        assert!(ValueKind::Number.accepts(&Value::Integer(3)));
        assert!(!ValueKind::Integer.accepts(&Value::Number(3.5)));
        assert!(!ValueKind::Text.accepts(&Value::Boolean(true)));
    }

    #[test]
    fn weakest_method_orders_first() {
        assert!(ResolutionMethod::Fuzzy < ResolutionMethod::Crosswalk);
        assert!(ResolutionMethod::Crosswalk < ResolutionMethod::Exact);
    }
}
