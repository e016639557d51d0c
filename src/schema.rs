//! The fixed output schema: every declared field per modality with its canonical
//! unit, value kind and plausible range. Column order derives from this table
//! alone, never from which sources populated a run.

use serde::Serialize;

use crate::domain::{Modality, ValueKind};

pub const UNIT_YEARS: &str = "years";
pub const UNIT_LOG2: &str = "log2";
pub const UNIT_FRACTION: &str = "fraction";
pub const UNIT_IMAGES: &str = "images";
pub const UNIT_KG: &str = "kg";
pub const UNIT_CM: &str = "cm";
pub const UNIT_THOUSAND_PER_UL: &str = "1000 cells/uL";
pub const UNIT_MILLION_PER_UL: &str = "million cells/uL";
pub const UNIT_G_PER_DL: &str = "g/dL";

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FieldSpec {
    pub modality: Modality,
    pub name: &'static str,
    pub kind: ValueKind,
    pub unit: Option<&'static str>,
    pub range: Option<(f64, f64)>,
}

impl FieldSpec {
    pub fn column(&self) -> String {
        format!("{}.{}", self.modality, self.name)
    }
}

const fn text(modality: Modality, name: &'static str) -> FieldSpec {
    FieldSpec {
        modality,
        name,
        kind: ValueKind::Text,
        unit: None,
        range: None,
    }
}

const fn number(
    modality: Modality,
    name: &'static str,
    unit: &'static str,
    min: f64,
    max: f64,
) -> FieldSpec {
    FieldSpec {
        modality,
        name,
        kind: ValueKind::Number,
        unit: Some(unit),
        range: Some((min, max)),
    }
}

const FIELDS: &[FieldSpec] = &[
    number(Modality::Genomic, "age_at_diagnosis", UNIT_YEARS, 0.0, 120.0),
    text(Modality::Genomic, "gender"),
    text(Modality::Genomic, "project"),
    text(Modality::Genomic, "idh1_status"),
    text(Modality::Genomic, "tp53_status"),
    text(Modality::Genomic, "egfr_status"),
    text(Modality::Genomic, "atrx_status"),
    text(Modality::Genomic, "mgmt_methylation"),
    text(Modality::Transcriptomic, "histology"),
    number(Modality::Transcriptomic, "tp53_expression", UNIT_LOG2, -30.0, 30.0),
    number(Modality::Transcriptomic, "vegfa_expression", UNIT_LOG2, -30.0, 30.0),
    number(Modality::Transcriptomic, "il6_expression", UNIT_LOG2, -30.0, 30.0),
    number(Modality::Transcriptomic, "egfr_expression", UNIT_LOG2, -30.0, 30.0),
    number(Modality::Transcriptomic, "mgmt_expression", UNIT_LOG2, -30.0, 30.0),
    number(Modality::Transcriptomic, "pten_expression", UNIT_LOG2, -30.0, 30.0),
    number(Modality::Proteomic, "tp53_abundance", UNIT_LOG2, -60.0, 60.0),
    number(Modality::Proteomic, "vegfa_abundance", UNIT_LOG2, -60.0, 60.0),
    number(Modality::Proteomic, "il6_abundance", UNIT_LOG2, -60.0, 60.0),
    number(Modality::Proteomic, "egfr_abundance", UNIT_LOG2, -60.0, 60.0),
    text(Modality::Imaging, "scan_modality"),
    text(Modality::Imaging, "series_date"),
    FieldSpec {
        modality: Modality::Imaging,
        name: "image_count",
        kind: ValueKind::Integer,
        unit: Some(UNIT_IMAGES),
        range: Some((0.0, 100_000.0)),
    },
    number(Modality::Imaging, "tumor_ratio", UNIT_FRACTION, 0.0, 1.0),
    number(Modality::Imaging, "necrosis_ratio", UNIT_FRACTION, 0.0, 1.0),
    number(Modality::Imaging, "inflammation", UNIT_FRACTION, 0.0, 1.0),
    number(Modality::Survey, "age", UNIT_YEARS, 0.0, 120.0),
    text(Modality::Survey, "gender"),
    number(Modality::Survey, "weight", UNIT_KG, 1.0, 400.0),
    number(Modality::Survey, "height", UNIT_CM, 30.0, 250.0),
    number(Modality::Survey, "wbc", UNIT_THOUSAND_PER_UL, 0.0, 100.0),
    number(Modality::Survey, "rbc", UNIT_MILLION_PER_UL, 0.0, 10.0),
    number(Modality::Survey, "hemoglobin", UNIT_G_PER_DL, 1.0, 25.0),
];

#[derive(Debug, Clone)]
pub struct Schema {
    fields: Vec<FieldSpec>,
}

impl Default for Schema {
    fn default() -> Self {
        Self::standard()
    }
}

impl Schema {
    /// Fields sorted by modality, then alphabetically by name.
    pub fn standard() -> Self {
        let mut fields = FIELDS.to_vec();
        fields.sort_by(|a, b| (a.modality, a.name).cmp(&(b.modality, b.name)));
        Self { fields }
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn get(&self, modality: Modality, name: &str) -> Option<&FieldSpec> {
        self.fields
            .iter()
            .find(|field| field.modality == modality && field.name == name)
    }

    pub fn by_column(&self, column: &str) -> Option<&FieldSpec> {
        let (modality, name) = column.split_once('.')?;
        let modality = modality.parse::<Modality>().ok()?;
        self.get(modality, name)
    }

    pub fn fields_for(&self, modality: Modality) -> impl Iterator<Item = &FieldSpec> {
        self.fields
            .iter()
            .filter(move |field| field.modality == modality)
    }

    pub fn columns(&self) -> Vec<String> {
        self.fields.iter().map(FieldSpec::column).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn columns_grouped_by_modality_then_alphabetical() {
        let columns = Schema::standard().columns();
        let genomic: Vec<_> = columns
            .iter()
            .take_while(|c| c.starts_with("genomic."))
            .collect();
        let mut sorted = genomic.clone();
        sorted.sort();
        assert_eq!(genomic, sorted);
        assert_eq!(columns.first().unwrap(), "genomic.age_at_diagnosis");
        assert_eq!(columns.last().unwrap(), "survey.weight");
        let first_survey = columns.iter().position(|c| c.starts_with("survey.")).unwrap();
        let last_imaging = columns.iter().rposition(|c| c.starts_with("imaging.")).unwrap();
        assert!(last_imaging < first_survey);
    }

    #[test]
    fn lookup_by_column() {
        let schema = Schema::standard();
        let field = schema.by_column("survey.hemoglobin").unwrap();
        assert_eq!(field.unit, Some(UNIT_G_PER_DL));
        assert!(schema.by_column("survey.unknown").is_none());
        assert!(schema.by_column("nonsense").is_none());
    }

    #[test]
    fn column_names_are_unique() {
        let mut columns = Schema::standard().columns();
        let total = columns.len();
        columns.dedup();
        assert_eq!(columns.len(), total);
    }
}
