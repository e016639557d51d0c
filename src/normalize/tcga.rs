use std::collections::BTreeSet;

use csv::StringRecord;

use crate::domain::{Modality, SourceId, Value};
use crate::normalize::{
    FieldMapping, ObservationDraft, RawKind, RawRecord, SourceNormalizer, UnitConversion,
    first_header, map_columns, normalize_key, parse_number, tracked_symbol,
};
use crate::schema::{UNIT_LOG2, UNIT_YEARS};

const UNIT_DAYS: &str = "days";
const UNIT_FPKM: &str = "FPKM";

const CLINICAL_KEYS: &[&str] = &["patient_id", "submitter_id", "case_id"];
const SAMPLE_KEYS: &[&str] = &["sample_id", "patient_id", "submitter_id"];

const CLINICAL_FIELDS: &[FieldMapping] = &[
    FieldMapping {
        column: "age_at_diagnosis",
        modality: Modality::Genomic,
        field: "age_at_diagnosis",
        kind: RawKind::Number,
        raw_unit: Some(UNIT_DAYS),
        unit: Some(UNIT_YEARS),
    },
    FieldMapping {
        column: "age",
        modality: Modality::Genomic,
        field: "age_at_diagnosis",
        kind: RawKind::Number,
        raw_unit: Some(UNIT_DAYS),
        unit: Some(UNIT_YEARS),
    },
    FieldMapping {
        column: "gender",
        modality: Modality::Genomic,
        field: "gender",
        kind: RawKind::Label,
        raw_unit: None,
        unit: None,
    },
    FieldMapping {
        column: "project_id",
        modality: Modality::Genomic,
        field: "project",
        kind: RawKind::Upper,
        raw_unit: None,
        unit: None,
    },
];

/// Mutation columns; values go through `mutation_status`.
const MUTATION_COLUMNS: &[(&str, &str)] = &[
    ("IDH1", "idh1_status"),
    ("TP53", "tp53_status"),
    ("EGFR", "egfr_status"),
    ("ATRX", "atrx_status"),
];

const CONVERSIONS: &[UnitConversion] = &[
    UnitConversion {
        from: UNIT_DAYS,
        to: UNIT_YEARS,
        apply: days_to_years,
    },
    UnitConversion {
        from: UNIT_FPKM,
        to: UNIT_LOG2,
        apply: fpkm_to_log2,
    },
];

fn days_to_years(days: f64) -> Result<f64, String> {
    if days < 0.0 {
        return Err(format!("negative age in days: {days}"));
    }
    Ok(days / 365.25)
}

fn fpkm_to_log2(fpkm: f64) -> Result<f64, String> {
    if fpkm < 0.0 {
        return Err(format!("negative FPKM: {fpkm}"));
    }
    Ok((fpkm + 1.0).log2())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcgaPlan {
    Clinical { key: &'static str },
    Genomic { key: &'static str },
    Expression { key: &'static str },
}

/// GDC case exports for TCGA-GBM/LGG: clinical, mutation and expression tables.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcgaNormalizer;

impl SourceNormalizer for TcgaNormalizer {
    type Plan = TcgaPlan;

    fn source_id(&self) -> SourceId {
        SourceId::Tcga
    }

    fn plan(&self, artifact: &str, headers: &StringRecord) -> Result<Option<TcgaPlan>, String> {
        let missing_key =
            |keys: &[&str]| format!("no subject key column (expected one of {})", keys.join(", "));
        if artifact.contains("clinical") {
            let key = first_header(headers, CLINICAL_KEYS).ok_or_else(|| missing_key(CLINICAL_KEYS))?;
            return Ok(Some(TcgaPlan::Clinical { key }));
        }
        if artifact.contains("genomic") || artifact.contains("mutation") {
            let key = first_header(headers, SAMPLE_KEYS).ok_or_else(|| missing_key(SAMPLE_KEYS))?;
            return Ok(Some(TcgaPlan::Genomic { key }));
        }
        if artifact.contains("expr") {
            let key = first_header(headers, SAMPLE_KEYS).ok_or_else(|| missing_key(SAMPLE_KEYS))?;
            return Ok(Some(TcgaPlan::Expression { key }));
        }
        Ok(None)
    }

    fn normalize_record(
        &self,
        plan: &TcgaPlan,
        record: &RawRecord<'_>,
    ) -> Result<Vec<ObservationDraft>, String> {
        match *plan {
            TcgaPlan::Clinical { key } => {
                let keys = subject_keys(record, key)?;
                map_columns(record, &keys, CLINICAL_FIELDS, CONVERSIONS)
            }
            TcgaPlan::Genomic { key } => {
                let keys = subject_keys(record, key)?;
                let mut drafts = Vec::new();
                for (column, field) in MUTATION_COLUMNS {
                    if let Some(raw) = record.get(column) {
                        drafts.push(text_draft(&keys, field, mutation_status(raw), column));
                    }
                }
                if let Some(raw) = record.get("MGMT") {
                    drafts.push(text_draft(
                        &keys,
                        "mgmt_methylation",
                        methylation_status(raw),
                        "MGMT",
                    ));
                }
                Ok(drafts)
            }
            TcgaPlan::Expression { key } => {
                let keys = subject_keys(record, key)?;
                let mut drafts = Vec::new();
                let mut seen = BTreeSet::new();
                for (index, header) in record.headers().iter().enumerate() {
                    if header.eq_ignore_ascii_case(key) {
                        continue;
                    }
                    let Some(stem) = tracked_symbol(header) else {
                        continue;
                    };
                    let Some(raw) = record.at(index) else {
                        continue;
                    };
                    if !seen.insert(stem) {
                        continue;
                    }
                    let fpkm = parse_number(header, raw)?;
                    let log2 = fpkm_to_log2(fpkm).map_err(|err| format!("{header}: {err}"))?;
                    drafts.push(ObservationDraft {
                        keys: keys.clone(),
                        modality: Modality::Transcriptomic,
                        field: format!("{stem}_expression"),
                        value: Value::Number(log2),
                        unit: Some(UNIT_LOG2.to_string()),
                        column: Some(header.to_string()),
                    });
                }
                Ok(drafts)
            }
        }
    }
}

fn subject_keys(record: &RawRecord<'_>, column: &str) -> Result<BTreeSet<String>, String> {
    let raw = record.require(column)?;
    Ok(BTreeSet::from([normalize_key(raw)]))
}

fn text_draft(keys: &BTreeSet<String>, field: &str, value: String, column: &str) -> ObservationDraft {
    ObservationDraft {
        keys: keys.clone(),
        modality: Modality::Genomic,
        field: field.to_string(),
        value: Value::Text(value),
        unit: None,
        column: Some(column.to_string()),
    }
}

fn mutation_status(raw: &str) -> String {
    match raw.trim().to_ascii_lowercase().as_str() {
        "wt" | "wildtype" | "wild-type" | "wild type" | "0" | "false" | "no" => {
            "wildtype".to_string()
        }
        "mut" | "mutant" | "mutated" | "mutation" | "1" | "true" | "yes" => "mutant".to_string(),
        other => other.to_string(),
    }
}

fn methylation_status(raw: &str) -> String {
    match raw.trim().to_ascii_lowercase().as_str() {
        "methylated" | "m" | "1" | "true" | "yes" => "methylated".to_string(),
        "unmethylated" | "u" | "0" | "false" | "no" => "unmethylated".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::error::KiraError;
    use crate::normalize::test_support::{entry_with, field};

    #[test]
    fn clinical_age_converted_from_days() {
        let dir = tempfile::tempdir().unwrap();
        let entry = entry_with(
            &dir,
            SourceId::Tcga,
            &[(
                "clinical_gbm_lgg.csv",
                "patient_id,age,gender,project_id\ntcga-02-0001,21915,Female,TCGA-GBM\n",
            )],
        );
        let results: Vec<_> = TcgaNormalizer.normalize(&entry).collect();
        assert_eq!(results.len(), 1);
        let observations = results.into_iter().next().unwrap().unwrap();
        let age = field(&observations, "TCGA-02-0001", "age_at_diagnosis").unwrap();
        assert_eq!(age.value.render(), "60");
        assert_eq!(age.unit.as_deref(), Some("years"));
        let gender = field(&observations, "TCGA-02-0001", "gender").unwrap();
        assert_eq!(gender.value, Value::Text("female".to_string()));
        assert_eq!(age.provenance.raw_locator, "clinical_gbm_lgg.csv:2:age");
    }

    #[test]
    fn record_without_key_fails_alone() {
        let dir = tempfile::tempdir().unwrap();
        let entry = entry_with(
            &dir,
            SourceId::Tcga,
            &[(
                "clinical_gbm_lgg.csv",
                "patient_id,age,gender\n,100,male\nTCGA-02-0003,200,male\n",
            )],
        );
        let results: Vec<_> = TcgaNormalizer.normalize(&entry).collect();
        assert_eq!(results.len(), 2);
        assert_matches!(&results[0], Err(KiraError::Parse { .. }));
        assert!(results[1].is_ok());
    }

    #[test]
    fn genomic_statuses_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let entry = entry_with(
            &dir,
            SourceId::Tcga,
            &[(
                "genomic_gbm_lgg.csv",
                "patient_id,IDH1,TP53,MGMT\nTCGA-02-0001,WT,Mutated,M\n",
            )],
        );
        let observations: Vec<_> = TcgaNormalizer
            .normalize(&entry)
            .flat_map(|result| result.unwrap())
            .collect();
        assert_eq!(
            field(&observations, "TCGA-02-0001", "idh1_status").unwrap().value,
            Value::Text("wildtype".to_string())
        );
        assert_eq!(
            field(&observations, "TCGA-02-0001", "tp53_status").unwrap().value,
            Value::Text("mutant".to_string())
        );
        assert_eq!(
            field(&observations, "TCGA-02-0001", "mgmt_methylation").unwrap().value,
            Value::Text("methylated".to_string())
        );
    }

    #[test]
    fn expression_uses_sample_barcode_and_log2() {
        let dir = tempfile::tempdir().unwrap();
        let entry = entry_with(
            &dir,
            SourceId::Tcga,
            &[(
                "tcga_expr_fpkm.csv",
                "sample_id,TP53,VEGFA,GAPDH\nTCGA-02-0001-01A,3,NA,900\n",
            )],
        );
        let observations: Vec<_> = TcgaNormalizer
            .normalize(&entry)
            .flat_map(|result| result.unwrap())
            .collect();
        assert_eq!(observations.len(), 1);
        let tp53 = field(&observations, "TCGA-02-0001-01A", "tp53_expression").unwrap();
        assert_eq!(tp53.value, Value::Number(2.0));
        assert_eq!(tp53.modality, Modality::Transcriptomic);
    }

    #[test]
    fn unrelated_artifacts_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let entry = entry_with(&dir, SourceId::Tcga, &[("readme.txt", "notes\nnothing\n")]);
        assert_eq!(TcgaNormalizer.normalize(&entry).count(), 0);
    }

    #[test]
    fn normalization_is_restartable() {
        let dir = tempfile::tempdir().unwrap();
        let entry = entry_with(
            &dir,
            SourceId::Tcga,
            &[(
                "clinical_gbm_lgg.csv",
                "patient_id,age\nTCGA-02-0001,100\nTCGA-02-0002,200\n",
            )],
        );
        let first: Vec<_> = TcgaNormalizer.normalize(&entry).map(Result::unwrap).collect();
        let second: Vec<_> = TcgaNormalizer.normalize(&entry).map(Result::unwrap).collect();
        assert_eq!(first, second);
    }
}
