//! Rule table over merged rows. Rules only read rows; they never edit them.

use std::collections::BTreeSet;

use tracing::{info, warn};

use crate::diagnostics::{DiagnosticRecord, Severity};
use crate::domain::ResolutionMethod;
use crate::error::KiraError;
use crate::identity::IdentityResolution;
use crate::merge::{MULTI_VALUED_FLAG, MergedRow};
use crate::schema::Schema;

pub trait ValidationRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn severity(&self) -> Severity;
    /// One detail string per violation; empty when the row passes.
    fn check(&self, row: &MergedRow, schema: &Schema) -> Vec<String>;
}

pub struct RequiredModality;

impl ValidationRule for RequiredModality {
    fn name(&self) -> &'static str {
        "required-modality"
    }

    fn severity(&self) -> Severity {
        Severity::Reject
    }

    fn check(&self, row: &MergedRow, schema: &Schema) -> Vec<String> {
        if row.populated_modalities(schema).is_empty() {
            vec!["no modality has any reported field".to_string()]
        } else {
            Vec::new()
        }
    }
}

pub struct ValueRange;

impl ValidationRule for ValueRange {
    fn name(&self) -> &'static str {
        "value-range"
    }

    fn severity(&self) -> Severity {
        Severity::Reject
    }

    fn check(&self, row: &MergedRow, schema: &Schema) -> Vec<String> {
        let mut violations = Vec::new();
        for spec in schema.fields() {
            let Some((low, high)) = spec.range else {
                continue;
            };
            let column = spec.column();
            let Some(cell) = row.cell(&column) else {
                continue;
            };
            for value in cell.values() {
                if let Some(number) = value.as_f64() {
                    if number < low || number > high {
                        violations.push(format!("{column}={} outside [{low}, {high}]", value.render()));
                    }
                }
            }
        }
        violations
    }
}

pub struct UnitConsistency;

impl ValidationRule for UnitConsistency {
    fn name(&self) -> &'static str {
        "unit-consistency"
    }

    fn severity(&self) -> Severity {
        Severity::Reject
    }

    fn check(&self, row: &MergedRow, schema: &Schema) -> Vec<String> {
        let mut violations = Vec::new();
        for spec in schema.fields() {
            let column = spec.column();
            let units: BTreeSet<Option<&str>> = row.selected_units(&column).collect();
            for unit in units {
                if unit != spec.unit {
                    violations.push(format!(
                        "{column} reported in {} but declared in {}",
                        unit.unwrap_or("no unit"),
                        spec.unit.unwrap_or("no unit")
                    ));
                }
            }
        }
        violations
    }
}

pub struct ValueKindMatch;

impl ValidationRule for ValueKindMatch {
    fn name(&self) -> &'static str {
        "value-kind"
    }

    fn severity(&self) -> Severity {
        Severity::Reject
    }

    fn check(&self, row: &MergedRow, schema: &Schema) -> Vec<String> {
        let mut violations = Vec::new();
        for spec in schema.fields() {
            let column = spec.column();
            let Some(cell) = row.cell(&column) else {
                continue;
            };
            for value in cell.values() {
                if !spec.kind.accepts(value) {
                    violations.push(format!(
                        "{column} expects {:?}, got {:?}",
                        spec.kind,
                        value.kind()
                    ));
                }
            }
        }
        violations
    }
}

pub struct MultiValuedField;

impl ValidationRule for MultiValuedField {
    fn name(&self) -> &'static str {
        MULTI_VALUED_FLAG
    }

    fn severity(&self) -> Severity {
        Severity::Warn
    }

    fn check(&self, row: &MergedRow, _schema: &Schema) -> Vec<String> {
        if !row.flags.contains(MULTI_VALUED_FLAG) {
            return Vec::new();
        }
        row.cells
            .iter()
            .filter(|(_, cell)| matches!(cell, crate::merge::Cell::Multi(_)))
            .map(|(column, cell)| format!("{column} kept conflicting values {}", cell.render()))
            .collect()
    }
}

pub struct LowConfidenceIdentity;

impl ValidationRule for LowConfidenceIdentity {
    fn name(&self) -> &'static str {
        "low-confidence-identity"
    }

    fn severity(&self) -> Severity {
        Severity::Warn
    }

    fn check(&self, row: &MergedRow, _schema: &Schema) -> Vec<String> {
        if row.resolution_method == ResolutionMethod::Fuzzy {
            vec![format!("subject linked by fuzzy match (confidence {:.3})", row.confidence)]
        } else {
            Vec::new()
        }
    }
}

#[derive(Debug, Default)]
pub struct ValidationOutcome {
    pub accepted: Vec<MergedRow>,
    pub rejected: Vec<MergedRow>,
    pub diagnostics: Vec<DiagnosticRecord>,
}

pub struct Validator {
    rules: Vec<Box<dyn ValidationRule>>,
}

impl Default for Validator {
    fn default() -> Self {
        Self::standard()
    }
}

impl Validator {
    pub fn standard() -> Self {
        Self {
            rules: vec![
                Box::new(RequiredModality),
                Box::new(ValueRange),
                Box::new(UnitConsistency),
                Box::new(ValueKindMatch),
                Box::new(MultiValuedField),
                Box::new(LowConfidenceIdentity),
            ],
        }
    }

    pub fn with_rule(mut self, rule: Box<dyn ValidationRule>) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|rule| rule.name()).collect()
    }

    /// Splits rows into accepted and rejected. A duplicate or unknown canonical
    /// id means identity resolution or merging is unsound and aborts the run.
    pub fn validate(
        &self,
        rows: Vec<MergedRow>,
        resolution: &IdentityResolution,
        schema: &Schema,
    ) -> Result<ValidationOutcome, KiraError> {
        let mut seen = BTreeSet::new();
        for row in &rows {
            if !seen.insert(row.canonical_id.as_str()) {
                return Err(KiraError::InternalConsistency(format!(
                    "canonical id {} appears in more than one row",
                    row.canonical_id
                )));
            }
            if !resolution.contains(&row.canonical_id) {
                return Err(KiraError::InternalConsistency(format!(
                    "row {} does not belong to a resolved subject",
                    row.canonical_id
                )));
            }
        }

        let mut outcome = ValidationOutcome::default();
        for row in rows {
            let mut rejected = false;
            for rule in &self.rules {
                for detail in rule.check(&row, schema) {
                    if rule.severity() == Severity::Reject {
                        rejected = true;
                    }
                    outcome.diagnostics.push(DiagnosticRecord::validation(
                        &row.canonical_id,
                        rule.name(),
                        rule.severity(),
                        detail,
                    ));
                }
            }
            if rejected {
                warn!(row = %row.canonical_id, "row rejected");
                outcome.rejected.push(row);
            } else {
                outcome.accepted.push(row);
            }
        }
        info!(
            accepted = outcome.accepted.len(),
            rejected = outcome.rejected.len(),
            diagnostics = outcome.diagnostics.len(),
            "validation complete"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use assert_matches::assert_matches;
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::config::RunConfig;
    use crate::domain::{CanonicalObservation, Modality, Provenance, SourceId, Value};
    use crate::identity::resolve;
    use crate::merge::Merger;

    fn obs(key: &str, modality: Modality, field: &str, value: Value, unit: Option<&str>) -> CanonicalObservation {
        CanonicalObservation {
            source_id: SourceId::Tcga,
            subject_key_candidates: BTreeSet::from([key.to_string()]),
            modality,
            field_name: field.to_string(),
            value,
            unit: unit.map(str::to_string),
            provenance: Provenance {
                source_id: SourceId::Tcga,
                raw_locator: "clinical.csv:2".to_string(),
                fetched_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            },
        }
    }

    fn run(observations: &[CanonicalObservation]) -> Result<ValidationOutcome, KiraError> {
        let config = RunConfig::default();
        let schema = Schema::standard();
        let resolution = resolve(observations, &[], &config).unwrap();
        let unavailable = BTreeSet::new();
        let merged = Merger::new(&schema, &config.priority, &unavailable)
            .merge(observations, &resolution)
            .unwrap();
        Validator::standard().validate(merged.rows, &resolution, &schema)
    }

    #[test]
    fn clean_row_is_accepted() {
        let outcome = run(&[obs(
            "P1",
            Modality::Genomic,
            "age_at_diagnosis",
            Value::Number(61.0),
            Some("years"),
        )])
        .unwrap();
        assert_eq!(outcome.accepted.len(), 1);
        assert!(outcome.diagnostics.is_empty());
    }

    #[test]
    fn out_of_range_value_rejects_row() {
        let outcome = run(&[
            obs("P1", Modality::Genomic, "age_at_diagnosis", Value::Number(400.0), Some("years")),
            obs("P2", Modality::Genomic, "age_at_diagnosis", Value::Number(40.0), Some("years")),
        ])
        .unwrap();
        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].canonical_id, "P1");
        assert_eq!(outcome.diagnostics[0].rule_violated, "value-range");
    }

    #[test]
    fn unconverted_unit_rejects_row() {
        let outcome = run(&[obs(
            "P1",
            Modality::Genomic,
            "age_at_diagnosis",
            Value::Number(61.0),
            Some("days"),
        )])
        .unwrap();
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.diagnostics[0].rule_violated, "unit-consistency");
    }

    #[test]
    fn wrong_kind_rejects_row() {
        let outcome = run(&[obs(
            "P1",
            Modality::Imaging,
            "image_count",
            Value::Text("many".to_string()),
            Some("images"),
        )])
        .unwrap();
        assert_eq!(outcome.rejected.len(), 1);
        assert!(outcome
            .diagnostics
            .iter()
            .any(|record| record.rule_violated == "value-kind"));
    }

    #[test]
    fn row_with_only_undeclared_fields_fails_required_modality() {
        let outcome = run(&[obs("P1", Modality::Genomic, "shoe_size", Value::Integer(9), None)]).unwrap();
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.diagnostics[0].rule_violated, "required-modality");
    }

    #[test]
    fn conflicting_values_warn_but_keep_row() {
        let outcome = run(&[
            obs("P1", Modality::Genomic, "gender", Value::Text("male".into()), None),
            obs("P1", Modality::Genomic, "gender", Value::Text("female".into()), None),
        ])
        .unwrap();
        assert_eq!(outcome.accepted.len(), 1);
        assert!(outcome.rejected.is_empty());
        let warning = outcome
            .diagnostics
            .iter()
            .find(|record| record.rule_violated == MULTI_VALUED_FLAG)
            .unwrap();
        assert_eq!(warning.severity, Severity::Warn);
        assert_eq!(warning.row_key, "P1");
    }

    #[test]
    fn fuzzy_linked_subject_warns_but_keeps_row() {
        let mut imaging = obs("C3L_00104", Modality::Imaging, "scan_modality", Value::Text("MR".into()), None);
        imaging.source_id = SourceId::Tcia;
        imaging.provenance.source_id = SourceId::Tcia;
        let outcome = run(&[
            obs("C3L-00104", Modality::Genomic, "gender", Value::Text("male".into()), None),
            imaging,
        ])
        .unwrap();
        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(outcome.accepted[0].resolution_method, ResolutionMethod::Fuzzy);
        let warning = outcome
            .diagnostics
            .iter()
            .find(|record| record.rule_violated == "low-confidence-identity")
            .unwrap();
        assert_eq!(warning.severity, Severity::Warn);
    }

    #[test]
    fn duplicate_rows_are_fatal() {
        let config = RunConfig::default();
        let schema = Schema::standard();
        let observations = [obs("P1", Modality::Genomic, "gender", Value::Text("male".into()), None)];
        let resolution = resolve(&observations, &[], &config).unwrap();
        let row = MergedRow {
            canonical_id: "P1".to_string(),
            resolution_method: ResolutionMethod::Exact,
            confidence: 1.0,
            cells: BTreeMap::new(),
            provenance: BTreeMap::new(),
            flags: BTreeSet::new(),
        };
        let err = Validator::standard()
            .validate(vec![row.clone(), row], &resolution, &schema)
            .unwrap_err();
        assert_matches!(err, KiraError::InternalConsistency(_));
    }

    #[test]
    fn unknown_subject_is_fatal() {
        let config = RunConfig::default();
        let schema = Schema::standard();
        let resolution = resolve(&[], &[], &config).unwrap();
        let row = MergedRow {
            canonical_id: "GHOST".to_string(),
            resolution_method: ResolutionMethod::Exact,
            confidence: 1.0,
            cells: BTreeMap::new(),
            provenance: BTreeMap::new(),
            flags: BTreeSet::new(),
        };
        let err = Validator::standard()
            .validate(vec![row], &resolution, &schema)
            .unwrap_err();
        assert_matches!(err, KiraError::InternalConsistency(_));
    }
}
