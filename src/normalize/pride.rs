use std::collections::BTreeSet;

use csv::StringRecord;

use crate::domain::{Modality, SourceId, Value};
use crate::normalize::{
    ObservationDraft, RawRecord, SourceNormalizer, TRACKED_PROTEINS, header_index, normalize_key,
    parse_number, tracked_symbol,
};
use crate::schema::UNIT_LOG2;

const REQUIRED: &[&str] = &["sample_id", "protein", "intensity"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PridePlan {
    has_scale: bool,
}

/// Long-format PRIDE quantification exports: one protein intensity per row.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrideNormalizer;

impl SourceNormalizer for PrideNormalizer {
    type Plan = PridePlan;

    fn source_id(&self) -> SourceId {
        SourceId::Pride
    }

    fn plan(&self, artifact: &str, headers: &StringRecord) -> Result<Option<PridePlan>, String> {
        if artifact.contains("projects_meta") || header_index(headers, "sample_id").is_none() {
            return Ok(None);
        }
        let missing: Vec<&str> = REQUIRED
            .iter()
            .copied()
            .filter(|column| header_index(headers, column).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(format!("quantification table lacks {}", missing.join(", ")));
        }
        Ok(Some(PridePlan {
            has_scale: header_index(headers, "scale").is_some(),
        }))
    }

    fn normalize_record(
        &self,
        plan: &PridePlan,
        record: &RawRecord<'_>,
    ) -> Result<Vec<ObservationDraft>, String> {
        let keys = BTreeSet::from([normalize_key(record.require("sample_id")?)]);
        let protein = record.require("protein")?;
        let Some(stem) = tracked_symbol(protein).filter(|stem| TRACKED_PROTEINS.contains(stem))
        else {
            return Ok(Vec::new());
        };
        let Some(raw) = record.get("intensity") else {
            return Ok(Vec::new());
        };
        let intensity = parse_number("intensity", raw)?;
        let scale = if plan.has_scale {
            record.get("scale").unwrap_or("log2")
        } else {
            "log2"
        };
        Ok(vec![ObservationDraft {
            keys,
            modality: Modality::Proteomic,
            field: format!("{stem}_abundance"),
            value: Value::Number(to_log2(intensity, scale)?),
            unit: Some(UNIT_LOG2.to_string()),
            column: Some("intensity".to_string()),
        }])
    }
}

fn to_log2(value: f64, scale: &str) -> Result<f64, String> {
    match scale.trim().to_ascii_lowercase().as_str() {
        "log2" => Ok(value),
        "log10" => Ok(value * std::f64::consts::LOG2_10),
        "linear" | "raw" => {
            if value <= 0.0 {
                return Err(format!("intensity: non-positive linear value {value}"));
            }
            Ok(value.log2())
        }
        other => Err(format!("scale: unsupported intensity scale {other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::test_support::{entry_with, field};

    #[test]
    fn long_format_rows_become_abundances() {
        let dir = tempfile::tempdir().unwrap();
        let entry = entry_with(
            &dir,
            SourceId::Pride,
            &[
                ("pride_projects_meta.csv", "accession,title\nPXD000001,glioma\n"),
                (
                    "PXD000001_quant.tsv",
                    "sample_id\tprotein\tintensity\tscale\nGBM-07\tEGFR\t16\tlinear\nGBM-07\tACTB\t10\tlog2\nGBM-08\tTP53\t1\tlog10\n",
                ),
            ],
        );
        let results: Vec<_> = PrideNormalizer.normalize(&entry).collect();
        assert_eq!(results.len(), 3);
        let observations: Vec<_> = results.into_iter().flat_map(Result::unwrap).collect();
        assert_eq!(observations.len(), 2);
        assert_eq!(
            field(&observations, "GBM-07", "egfr_abundance").unwrap().value,
            Value::Number(4.0)
        );
        let tp53 = field(&observations, "GBM-08", "tp53_abundance").unwrap();
        assert!(matches!(tp53.value, Value::Number(v) if (v - 3.321928).abs() < 1e-6));
    }

    #[test]
    fn unknown_scale_fails_record() {
        assert!(to_log2(1.0, "ppm").is_err());
        assert!(to_log2(0.0, "linear").is_err());
    }

    #[test]
    fn quant_table_without_intensity_is_artifact_error() {
        let dir = tempfile::tempdir().unwrap();
        let entry = entry_with(&dir, SourceId::Pride, &[("q.csv", "sample_id,protein\nA,TP53\n")]);
        let results: Vec<_> = PrideNormalizer.normalize(&entry).collect();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
    }
}
