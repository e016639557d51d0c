use std::collections::BTreeSet;
use std::sync::LazyLock;

use csv::StringRecord;
use regex::Regex;

use crate::domain::{Modality, SourceId};
use crate::normalize::{
    FieldMapping, ObservationDraft, RawKind, RawRecord, SourceNormalizer, UnitConversion,
    header_index, map_columns, parse_number,
};
use crate::schema::{
    UNIT_CM, UNIT_G_PER_DL, UNIT_KG, UNIT_MILLION_PER_UL, UNIT_THOUSAND_PER_UL, UNIT_YEARS,
};

const KEY: &str = "SEQN";
const UNIT_G_PER_L: &str = "g/L";
const GENDER_CODES: &[(&str, &str)] = &[("1", "male"), ("2", "female")];

const fn survey(
    column: &'static str,
    field: &'static str,
    raw_unit: &'static str,
    unit: &'static str,
) -> FieldMapping {
    FieldMapping {
        column,
        modality: Modality::Survey,
        field,
        kind: RawKind::Number,
        raw_unit: Some(raw_unit),
        unit: Some(unit),
    }
}

const FIELDS: &[FieldMapping] = &[
    survey("RIDAGEYR", "age", UNIT_YEARS, UNIT_YEARS),
    FieldMapping {
        column: "RIAGENDR",
        modality: Modality::Survey,
        field: "gender",
        kind: RawKind::Coded(GENDER_CODES),
        raw_unit: None,
        unit: None,
    },
    survey("BMXWT", "weight", UNIT_KG, UNIT_KG),
    survey("BMXHT", "height", UNIT_CM, UNIT_CM),
    survey("LBXWBCSI", "wbc", UNIT_THOUSAND_PER_UL, UNIT_THOUSAND_PER_UL),
    survey("LBXRBCSI", "rbc", UNIT_MILLION_PER_UL, UNIT_MILLION_PER_UL),
    survey("LBXHGB", "hemoglobin", UNIT_G_PER_DL, UNIT_G_PER_DL),
    survey("LBDHGBSI", "hemoglobin", UNIT_G_PER_L, UNIT_G_PER_DL),
];

const CONVERSIONS: &[UnitConversion] = &[UnitConversion {
    from: UNIT_G_PER_L,
    to: UNIT_G_PER_DL,
    apply: grams_per_litre_to_decilitre,
}];

static CYCLE_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]+_([a-z])\.(csv|tsv|txt)$").expect("hardcoded regex"));

fn grams_per_litre_to_decilitre(value: f64) -> Result<f64, String> {
    Ok(value / 10.0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NhanesPlan {
    cycle: Option<String>,
}

/// NHANES component files (DEMO, BMX, CBC) converted from XPT to CSV.
/// Respondents are namespaced by survey cycle so SEQNs never collide across
/// cycles or with clinical keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct NhanesNormalizer;

/// Survey cycle letter from names like `demo_j.csv`.
fn cycle_of(artifact: &str) -> Option<String> {
    CYCLE_SUFFIX
        .captures(artifact)
        .and_then(|captures| captures.get(1))
        .map(|cycle| cycle.as_str().to_ascii_uppercase())
}

impl SourceNormalizer for NhanesNormalizer {
    type Plan = NhanesPlan;

    fn source_id(&self) -> SourceId {
        SourceId::Nhanes
    }

    fn plan(&self, artifact: &str, headers: &StringRecord) -> Result<Option<NhanesPlan>, String> {
        if header_index(headers, KEY).is_none() {
            return Err(format!("survey table lacks {KEY}"));
        }
        Ok(Some(NhanesPlan {
            cycle: cycle_of(artifact),
        }))
    }

    fn normalize_record(
        &self,
        plan: &NhanesPlan,
        record: &RawRecord<'_>,
    ) -> Result<Vec<ObservationDraft>, String> {
        let seqn = parse_number(KEY, record.require(KEY)?)?;
        if seqn.fract() != 0.0 || seqn < 0.0 {
            return Err(format!("{KEY}: not a respondent number: {seqn}"));
        }
        let key = match &plan.cycle {
            Some(cycle) => format!("NHANES-{cycle}-{}", seqn as u64),
            None => format!("NHANES-{}", seqn as u64),
        };
        map_columns(record, &BTreeSet::from([key]), FIELDS, CONVERSIONS)
    }
}
