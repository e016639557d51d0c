use std::collections::BTreeSet;

use csv::StringRecord;

use crate::domain::{Modality, SourceId, Value};
use crate::normalize::{
    ObservationDraft, RawRecord, SourceNormalizer, first_header, header_index, normalize_key,
    parse_number, tracked_symbol,
};
use crate::schema::UNIT_LOG2;

const ACCESSION: &str = "geo_accession";
const HISTOLOGY_COLUMNS: &[&str] = &[
    "characteristics_ch1.0.Histopathological diagnostic",
    "histopathological diagnostic",
    "histology",
    "characteristics_ch1",
];
const GENE_COLUMNS: &[&str] = &["gene", "gene_symbol", "IDENTIFIER", "ID_REF"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeoPlan {
    /// One row per GSM sample.
    Phenotype {
        patient: Option<&'static str>,
        histology: Option<&'static str>,
    },
    /// Gene-by-sample pivot; `samples` are the GSM column indices.
    Expression { samples: Vec<usize> },
}

/// GEO series tables (GSE4290, GSE16011, GSE50161) exported as phenotype and
/// expression pivots.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeoNormalizer;

impl SourceNormalizer for GeoNormalizer {
    type Plan = GeoPlan;

    fn source_id(&self) -> SourceId {
        SourceId::Geo
    }

    fn plan(&self, artifact: &str, headers: &StringRecord) -> Result<Option<GeoPlan>, String> {
        if artifact.contains("pheno") || header_index(headers, ACCESSION).is_some() {
            if header_index(headers, ACCESSION).is_none() {
                return Err(format!("phenotype table lacks {ACCESSION}"));
            }
            return Ok(Some(GeoPlan::Phenotype {
                patient: first_header(headers, &["patient_id"]),
                histology: first_header(headers, HISTOLOGY_COLUMNS),
            }));
        }
        if artifact.contains("expr") {
            let label = headers.get(0).unwrap_or_default();
            if !GENE_COLUMNS
                .iter()
                .any(|column| label.eq_ignore_ascii_case(column))
            {
                return Err(format!(
                    "expression pivot must start with a gene column, found {label:?}"
                ));
            }
            let samples: Vec<usize> = headers
                .iter()
                .enumerate()
                .skip(1)
                .filter(|(_, header)| is_sample_accession(header))
                .map(|(index, _)| index)
                .collect();
            if samples.is_empty() {
                return Err("expression pivot has no GSM sample columns".to_string());
            }
            return Ok(Some(GeoPlan::Expression { samples }));
        }
        Ok(None)
    }

    fn normalize_record(
        &self,
        plan: &GeoPlan,
        record: &RawRecord<'_>,
    ) -> Result<Vec<ObservationDraft>, String> {
        match plan {
            GeoPlan::Phenotype { patient, histology } => {
                let accession = record.require(ACCESSION)?;
                let mut keys = BTreeSet::from([normalize_key(accession)]);
                if let Some(patient) = patient.and_then(|column| record.get(column)) {
                    keys.insert(normalize_key(patient));
                }
                let mut drafts = Vec::new();
                if let Some(column) = histology {
                    if let Some(raw) = record.get(column) {
                        drafts.push(ObservationDraft {
                            keys,
                            modality: Modality::Transcriptomic,
                            field: "histology".to_string(),
                            value: Value::Text(histology_label(raw)),
                            unit: None,
                            column: Some(column.to_string()),
                        });
                    }
                }
                Ok(drafts)
            }
            GeoPlan::Expression { samples } => {
                let Some(label) = record.at(0) else {
                    return Err("expression row has no gene label".to_string());
                };
                let Some(stem) = tracked_symbol(label) else {
                    return Ok(Vec::new());
                };
                let mut drafts = Vec::new();
                for &index in samples {
                    let Some(raw) = record.at(index) else {
                        continue;
                    };
                    let sample = record.headers().get(index).unwrap_or_default();
                    let value = parse_number(sample, raw)?;
                    drafts.push(ObservationDraft {
                        keys: BTreeSet::from([normalize_key(sample)]),
                        modality: Modality::Transcriptomic,
                        field: format!("{stem}_expression"),
                        value: Value::Number(value),
                        unit: Some(UNIT_LOG2.to_string()),
                        column: Some(sample.to_string()),
                    });
                }
                Ok(drafts)
            }
        }
    }
}

fn is_sample_accession(header: &str) -> bool {
    let header = header.trim();
    header.len() > 3
        && header[..3].eq_ignore_ascii_case("GSM")
        && header[3..].chars().all(|ch| ch.is_ascii_digit())
}

/// GEO characteristics are often `key: value`; keep the value, upper-cased.
fn histology_label(raw: &str) -> String {
    let value = raw.rsplit_once(':').map(|(_, value)| value).unwrap_or(raw);
    value.trim().to_uppercase()
}
