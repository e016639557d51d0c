use std::collections::BTreeSet;

use chrono::NaiveDate;
use csv::StringRecord;

use crate::domain::{Modality, SourceId, Value};
use crate::normalize::{
    ObservationDraft, RawRecord, SourceNormalizer, header_index, normalize_key, parse_integer,
    parse_number,
};
use crate::schema::{UNIT_FRACTION, UNIT_IMAGES};

const KEY: &str = "PatientID";
const RATIO_COLUMNS: &[&str] = &["tumor_ratio", "necrosis_ratio", "inflammation"];
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y%m%d", "%Y/%m/%d", "%m/%d/%Y"];

/// TCIA series metadata. One row per series; several series per patient are
/// reduced by the merger.
#[derive(Debug, Clone, Copy, Default)]
pub struct TciaNormalizer;

impl SourceNormalizer for TciaNormalizer {
    type Plan = ();

    fn source_id(&self) -> SourceId {
        SourceId::Tcia
    }

    fn plan(&self, artifact: &str, headers: &StringRecord) -> Result<Option<()>, String> {
        if !artifact.contains("series") && header_index(headers, "SeriesInstanceUID").is_none() {
            return Ok(None);
        }
        header_index(headers, KEY)
            .map(|_| Some(()))
            .ok_or_else(|| format!("series table lacks {KEY}"))
    }

    fn normalize_record(
        &self,
        _plan: &(),
        record: &RawRecord<'_>,
    ) -> Result<Vec<ObservationDraft>, String> {
        let keys = BTreeSet::from([normalize_key(record.require(KEY)?)]);
        let draft = |field: &str, value: Value, unit: Option<&str>, column: &str| ObservationDraft {
            keys: keys.clone(),
            modality: Modality::Imaging,
            field: field.to_string(),
            value,
            unit: unit.map(str::to_string),
            column: Some(column.to_string()),
        };

        let mut drafts = Vec::new();
        if let Some(raw) = record.get("Modality") {
            drafts.push(draft(
                "scan_modality",
                Value::Text(raw.trim().to_uppercase()),
                None,
                "Modality",
            ));
        }
        if let Some(raw) = record.get("SeriesDate") {
            drafts.push(draft(
                "series_date",
                Value::Text(series_date(raw)?),
                None,
                "SeriesDate",
            ));
        }
        if let Some(raw) = record.get("ImageCount") {
            drafts.push(draft(
                "image_count",
                Value::Integer(parse_integer("ImageCount", raw)?),
                Some(UNIT_IMAGES),
                "ImageCount",
            ));
        }
        for &column in RATIO_COLUMNS {
            if let Some(raw) = record.get(column) {
                let value = as_fraction(parse_number(column, raw)?);
                drafts.push(draft(column, Value::Number(value), Some(UNIT_FRACTION), column));
            }
        }
        Ok(drafts)
    }
}

/// Ratios reported as percentages (above 1) are scaled to fractions.
fn as_fraction(value: f64) -> f64 {
    if value > 1.0 { value / 100.0 } else { value }
}

fn series_date(raw: &str) -> Result<String, String> {
    let raw = raw.trim();
    let date_part = raw.split(['T', ' ']).next().unwrap_or(raw);
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(date_part, format).ok())
        .map(|date| date.format("%Y-%m-%d").to_string())
        .ok_or_else(|| format!("SeriesDate: unrecognized date {raw:?}"))
}
