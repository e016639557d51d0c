//! Joins observations into one wide row per canonical subject.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::SourcePriority;
use crate::diagnostics::DiagnosticRecord;
use crate::domain::{CanonicalObservation, Modality, ResolutionMethod, SourceId, Value};
use crate::error::KiraError;
use crate::identity::IdentityResolution;
use crate::schema::Schema;

pub const MULTI_VALUED_FLAG: &str = "multi-valued-field";
pub const MISSING_MARKER: &str = "NA";
pub const MULTI_SEPARATOR: &str = "|";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingReason {
    /// No source reported anything for the subject in this modality.
    ModalityAbsent,
    /// Every source of this modality was unavailable for the run.
    SourceUnavailable,
    /// The modality is populated but this field was not reported.
    NotReported,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Cell {
    Value(Value),
    Multi(Vec<Value>),
    Missing(MissingReason),
}

impl Cell {
    pub fn render(&self) -> String {
        match self {
            Cell::Value(value) => value.render(),
            Cell::Multi(values) => values
                .iter()
                .map(Value::render)
                .collect::<Vec<_>>()
                .join(MULTI_SEPARATOR),
            Cell::Missing(_) => MISSING_MARKER.to_string(),
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Cell::Missing(_))
    }

    pub fn values(&self) -> &[Value] {
        match self {
            Cell::Value(value) => std::slice::from_ref(value),
            Cell::Multi(values) => values,
            Cell::Missing(_) => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Contribution {
    pub source_id: SourceId,
    pub value: Value,
    pub unit: Option<String>,
    pub raw_locator: String,
    pub fetched_at: DateTime<Utc>,
    pub selected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedRow {
    pub canonical_id: String,
    pub resolution_method: ResolutionMethod,
    pub confidence: f64,
    pub cells: BTreeMap<String, Cell>,
    pub provenance: BTreeMap<String, Vec<Contribution>>,
    pub flags: BTreeSet<String>,
}

impl MergedRow {
    pub fn cell(&self, column: &str) -> Option<&Cell> {
        self.cells.get(column)
    }

    /// Units of the contributions that produced a cell's value.
    pub fn selected_units(&self, column: &str) -> impl Iterator<Item = Option<&str>> {
        self.provenance
            .get(column)
            .into_iter()
            .flatten()
            .filter(|contribution| contribution.selected)
            .map(|contribution| contribution.unit.as_deref())
    }

    pub fn populated_modalities(&self, schema: &Schema) -> BTreeSet<Modality> {
        schema
            .fields()
            .iter()
            .filter(|spec| {
                self.cells
                    .get(&spec.column())
                    .is_some_and(|cell| !cell.is_missing())
            })
            .map(|spec| spec.modality)
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct MergeOutcome {
    pub rows: Vec<MergedRow>,
    pub diagnostics: Vec<DiagnosticRecord>,
}

pub struct Merger<'a> {
    schema: &'a Schema,
    priority: &'a SourcePriority,
    unavailable: &'a BTreeSet<SourceId>,
}

impl<'a> Merger<'a> {
    pub fn new(
        schema: &'a Schema,
        priority: &'a SourcePriority,
        unavailable: &'a BTreeSet<SourceId>,
    ) -> Self {
        Self {
            schema,
            priority,
            unavailable,
        }
    }

    /// Groups observations by subject and field, resolves conflicts and fills
    /// every declared column.
    pub fn merge(
        &self,
        observations: &[CanonicalObservation],
        resolution: &IdentityResolution,
    ) -> Result<MergeOutcome, KiraError> {
        let mut grouped: BTreeMap<&str, BTreeMap<String, Vec<&CanonicalObservation>>> =
            BTreeMap::new();
        let mut diagnostics = Vec::new();

        for observation in observations {
            let subject = resolution.subject_of(observation).ok_or_else(|| {
                KiraError::InternalConsistency(format!(
                    "observation {} has no resolved subject",
                    observation.provenance.raw_locator
                ))
            })?;
            let fields = grouped.entry(subject.canonical_id.as_str()).or_default();
            let column = observation.column();
            if self
                .schema
                .get(observation.modality, &observation.field_name)
                .is_none()
            {
                debug!(subject = %subject.canonical_id, column = %column, "undeclared field");
                diagnostics.push(DiagnosticRecord::unknown_field(
                    &subject.canonical_id,
                    &column,
                    &format!(
                        "{}:{}",
                        observation.source_id, observation.provenance.raw_locator
                    ),
                ));
                continue;
            }
            fields.entry(column).or_default().push(observation);
        }

        let mut rows = Vec::with_capacity(grouped.len());
        for (canonical_id, fields) in grouped {
            let subject = resolution.subject(canonical_id).ok_or_else(|| {
                KiraError::InternalConsistency(format!("unknown subject {canonical_id}"))
            })?;
            rows.push(self.merge_subject(
                canonical_id,
                subject.resolution_method,
                subject.confidence,
                fields,
            ));
        }

        info!(
            rows = rows.len(),
            flagged = rows
                .iter()
                .filter(|row| row.flags.contains(MULTI_VALUED_FLAG))
                .count(),
            unknown_fields = diagnostics.len(),
            "merge complete"
        );
        Ok(MergeOutcome { rows, diagnostics })
    }

    fn merge_subject(
        &self,
        canonical_id: &str,
        resolution_method: ResolutionMethod,
        confidence: f64,
        fields: BTreeMap<String, Vec<&CanonicalObservation>>,
    ) -> MergedRow {
        let mut row = MergedRow {
            canonical_id: canonical_id.to_string(),
            resolution_method,
            confidence,
            cells: BTreeMap::new(),
            provenance: BTreeMap::new(),
            flags: BTreeSet::new(),
        };

        let populated: BTreeSet<Modality> = fields
            .values()
            .flatten()
            .map(|observation| observation.modality)
            .collect();

        for (column, observations) in fields {
            let modality = observations[0].modality;
            let (cell, contributions) = self.resolve_conflict(&column, modality, observations);
            if matches!(cell, Cell::Multi(_)) {
                row.flags.insert(MULTI_VALUED_FLAG.to_string());
            }
            row.cells.insert(column.clone(), cell);
            row.provenance.insert(column, contributions);
        }

        for spec in self.schema.fields() {
            let column = spec.column();
            if row.cells.contains_key(&column) {
                continue;
            }
            let reason = if populated.contains(&spec.modality) {
                MissingReason::NotReported
            } else if self.modality_unavailable(spec.modality) {
                MissingReason::SourceUnavailable
            } else {
                MissingReason::ModalityAbsent
            };
            row.cells.insert(column, Cell::Missing(reason));
        }
        row
    }

    /// Priority rank, then latest fetch, then every remaining distinct value.
    fn resolve_conflict(
        &self,
        column: &str,
        modality: Modality,
        mut observations: Vec<&CanonicalObservation>,
    ) -> (Cell, Vec<Contribution>) {
        observations.sort_by(|a, b| {
            (a.source_id, &a.provenance.raw_locator).cmp(&(b.source_id, &b.provenance.raw_locator))
        });
        let rank = |source: SourceId| self.priority.rank(column, modality, source);
        let best_rank = observations
            .iter()
            .map(|obs| rank(obs.source_id))
            .min()
            .unwrap_or(0);
        let latest = observations
            .iter()
            .filter(|obs| rank(obs.source_id) == best_rank)
            .map(|obs| obs.provenance.fetched_at)
            .max();

        let mut selected_values: Vec<Value> = Vec::new();
        let contributions = observations
            .iter()
            .map(|obs| {
                let selected =
                    rank(obs.source_id) == best_rank && Some(obs.provenance.fetched_at) == latest;
                if selected && !selected_values.contains(&obs.value) {
                    selected_values.push(obs.value.clone());
                }
                Contribution {
                    source_id: obs.source_id,
                    value: obs.value.clone(),
                    unit: obs.unit.clone(),
                    raw_locator: obs.provenance.raw_locator.clone(),
                    fetched_at: obs.provenance.fetched_at,
                    selected,
                }
            })
            .collect();

        let cell = if selected_values.len() == 1 {
            Cell::Value(selected_values.remove(0))
        } else {
            selected_values.sort_by_key(Value::render);
            Cell::Multi(selected_values)
        };
        (cell, contributions)
    }

    fn modality_unavailable(&self, modality: Modality) -> bool {
        let mut providers = SourceId::ALL
            .iter()
            .filter(|source| source.modalities().contains(&modality))
            .peekable();
        providers.peek().is_some() && providers.all(|source| self.unavailable.contains(source))
    }
}
