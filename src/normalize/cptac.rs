use std::collections::BTreeSet;

use csv::StringRecord;

use crate::domain::{Modality, SourceId, Value};
use crate::normalize::{
    ObservationDraft, RawRecord, SourceNormalizer, TRACKED_PROTEINS, first_header, normalize_key,
    parse_number, tracked_symbol,
};
use crate::schema::UNIT_LOG2;

const KEY_COLUMNS: &[&str] = &["patient_id", "case_id", "participant"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CptacPlan {
    key: &'static str,
    /// (column index, protein stem); first matching column per protein.
    proteins: Vec<(usize, &'static str)>,
}

/// CPTAC proteome tables: one row per patient, log2 ratio columns per protein.
#[derive(Debug, Clone, Copy, Default)]
pub struct CptacNormalizer;

impl SourceNormalizer for CptacNormalizer {
    type Plan = CptacPlan;

    fn source_id(&self) -> SourceId {
        SourceId::Cptac
    }

    fn plan(&self, artifact: &str, headers: &StringRecord) -> Result<Option<CptacPlan>, String> {
        if !artifact.contains("proteom") {
            return Ok(None);
        }
        let key = first_header(headers, KEY_COLUMNS)
            .ok_or_else(|| format!("no subject key column (expected one of {})", KEY_COLUMNS.join(", ")))?;
        let mut seen = BTreeSet::new();
        let proteins = headers
            .iter()
            .enumerate()
            .filter(|(_, header)| !header.eq_ignore_ascii_case(key))
            .filter_map(|(index, header)| {
                let stem = tracked_symbol(header)?;
                TRACKED_PROTEINS.contains(&stem).then_some((index, stem))
            })
            .filter(|(_, stem)| seen.insert(*stem))
            .collect();
        Ok(Some(CptacPlan { key, proteins }))
    }

    fn normalize_record(
        &self,
        plan: &CptacPlan,
        record: &RawRecord<'_>,
    ) -> Result<Vec<ObservationDraft>, String> {
        let keys = BTreeSet::from([normalize_key(record.require(plan.key)?)]);
        let mut drafts = Vec::with_capacity(plan.proteins.len());
        for &(index, stem) in &plan.proteins {
            let Some(raw) = record.at(index) else {
                continue;
            };
            let column = record.headers().get(index).unwrap_or_default();
            drafts.push(ObservationDraft {
                keys: keys.clone(),
                modality: Modality::Proteomic,
                field: format!("{stem}_abundance"),
                value: Value::Number(parse_number(column, raw)?),
                unit: Some(UNIT_LOG2.to_string()),
                column: Some(column.to_string()),
            });
        }
        Ok(drafts)
    }
}
