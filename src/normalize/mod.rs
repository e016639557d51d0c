//! Source normalizers: each turns one repository's cached raw artifacts into
//! `CanonicalObservation`s. Raw rows never leave this module.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;

use chrono::{DateTime, Utc};
use csv::{StringRecord, StringRecordsIntoIter};
use tracing::debug;

use crate::domain::{CanonicalObservation, Modality, Provenance, SourceId, Value};
use crate::error::KiraError;
use crate::fs_util::{artifact_name, locator_name, tabular_reader};
use crate::store::ManifestEntry;

pub mod cptac;
pub mod geo;
pub mod nhanes;
pub mod pride;
pub mod tcga;
pub mod tcia;

pub use cptac::CptacNormalizer;
pub use geo::GeoNormalizer;
pub use nhanes::NhanesNormalizer;
pub use pride::PrideNormalizer;
pub use tcga::TcgaNormalizer;
pub use tcia::TciaNormalizer;

/// Outcome for one raw record: its observations, or the reason it was dropped.
pub type RecordResult = Result<Vec<CanonicalObservation>, KiraError>;

/// One row of a raw artifact, with case-insensitive column access.
pub struct RawRecord<'a> {
    pub artifact: &'a str,
    pub line: u64,
    headers: &'a StringRecord,
    record: &'a StringRecord,
}

impl<'a> RawRecord<'a> {
    pub fn new(
        artifact: &'a str,
        line: u64,
        headers: &'a StringRecord,
        record: &'a StringRecord,
    ) -> Self {
        Self {
            artifact,
            line,
            headers,
            record,
        }
    }

    pub fn headers(&self) -> &StringRecord {
        self.headers
    }

    pub fn at(&self, index: usize) -> Option<&'a str> {
        self.record.get(index).filter(|value| !is_missing(value))
    }

    /// Present, non-missing value of `column`.
    pub fn get(&self, column: &str) -> Option<&'a str> {
        let index = header_index(self.headers, column)?;
        self.at(index)
    }

    pub fn require(&self, column: &str) -> Result<&'a str, String> {
        self.get(column)
            .ok_or_else(|| format!("required field {column} is missing"))
    }
}

pub fn header_index(headers: &StringRecord, column: &str) -> Option<usize> {
    headers
        .iter()
        .position(|header| header.eq_ignore_ascii_case(column))
}

pub fn first_header<'h>(headers: &StringRecord, candidates: &[&'h str]) -> Option<&'h str> {
    candidates
        .iter()
        .copied()
        .find(|candidate| header_index(headers, candidate).is_some())
}

/// Blank cells and the usual NA spellings count as absent.
pub fn is_missing(value: &str) -> bool {
    let value = value.trim();
    value.is_empty()
        || ["na", "nan", "null", "none", "--", "n/a", "'--"]
            .iter()
            .any(|marker| value.eq_ignore_ascii_case(marker))
}

pub fn normalize_key(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

/// Observation before provenance is attached by the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationDraft {
    pub keys: BTreeSet<String>,
    pub modality: Modality,
    pub field: String,
    pub value: Value,
    pub unit: Option<String>,
    pub column: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawKind {
    Number,
    Integer,
    /// Free text, trimmed and lower-cased.
    Label,
    /// Free text, trimmed and upper-cased.
    Upper,
    /// Text kept as reported.
    Verbatim,
    /// Coded categorical value, e.g. NHANES `RIAGENDR`.
    Coded(&'static [(&'static str, &'static str)]),
}

/// Raw column -> canonical field, with the unit the raw column is reported in.
#[derive(Debug, Clone, Copy)]
pub struct FieldMapping {
    pub column: &'static str,
    pub modality: Modality,
    pub field: &'static str,
    pub kind: RawKind,
    pub raw_unit: Option<&'static str>,
    pub unit: Option<&'static str>,
}

#[derive(Debug, Clone, Copy)]
pub struct UnitConversion {
    pub from: &'static str,
    pub to: &'static str,
    pub apply: fn(f64) -> Result<f64, String>,
}

/// Converts `value` from `from` to `to`. Without a table entry the value keeps
/// its raw unit so the validator can flag it.
pub fn convert(
    conversions: &[UnitConversion],
    value: f64,
    from: &str,
    to: &str,
) -> Result<(f64, String), String> {
    if from == to {
        return Ok((value, to.to_string()));
    }
    match conversions
        .iter()
        .find(|conversion| conversion.from == from && conversion.to == to)
    {
        Some(conversion) => Ok(((conversion.apply)(value)?, to.to_string())),
        None => Ok((value, from.to_string())),
    }
}

pub fn parse_number(column: &str, raw: &str) -> Result<f64, String> {
    let value = raw
        .trim()
        .parse::<f64>()
        .map_err(|_| format!("{column}: expected a number, got {raw:?}"))?;
    if !value.is_finite() {
        return Err(format!("{column}: non-finite value {raw:?}"));
    }
    Ok(value)
}

pub fn parse_integer(column: &str, raw: &str) -> Result<i64, String> {
    let value = parse_number(column, raw)?;
    if value.fract() != 0.0 {
        return Err(format!("{column}: expected an integer, got {raw:?}"));
    }
    Ok(value as i64)
}

/// Applies a wide-format mapping table to one record. The first present column
/// wins when several columns map to the same field.
pub fn map_columns(
    record: &RawRecord<'_>,
    keys: &BTreeSet<String>,
    mappings: &[FieldMapping],
    conversions: &[UnitConversion],
) -> Result<Vec<ObservationDraft>, String> {
    let mut emitted = BTreeSet::new();
    let mut drafts = Vec::new();
    for mapping in mappings {
        if emitted.contains(&(mapping.modality, mapping.field)) {
            continue;
        }
        let Some(raw) = record.get(mapping.column) else {
            continue;
        };
        let (value, unit) = match mapping.kind {
            RawKind::Number => {
                let number = parse_number(mapping.column, raw)?;
                match (mapping.raw_unit, mapping.unit) {
                    (Some(from), Some(to)) => {
                        let (number, unit) = convert(conversions, number, from, to)
                            .map_err(|err| format!("{}: {err}", mapping.column))?;
                        (Value::Number(number), Some(unit))
                    }
                    (from, to) => (Value::Number(number), from.or(to).map(str::to_string)),
                }
            }
            RawKind::Integer => (
                Value::Integer(parse_integer(mapping.column, raw)?),
                mapping.unit.map(str::to_string),
            ),
            RawKind::Label => (Value::Text(raw.trim().to_lowercase()), None),
            RawKind::Upper => (Value::Text(raw.trim().to_uppercase()), None),
            RawKind::Verbatim => (Value::Text(raw.trim().to_string()), None),
            RawKind::Coded(codes) => {
                let code = raw.trim().trim_end_matches(".0");
                let label = codes
                    .iter()
                    .find(|(candidate, _)| *candidate == code)
                    .map(|(_, label)| *label)
                    .ok_or_else(|| format!("{}: unknown code {raw:?}", mapping.column))?;
                (Value::Text(label.to_string()), None)
            }
        };
        emitted.insert((mapping.modality, mapping.field));
        drafts.push(ObservationDraft {
            keys: keys.clone(),
            modality: mapping.modality,
            field: mapping.field.to_string(),
            value,
            unit,
            column: Some(mapping.column.to_string()),
        });
    }
    Ok(drafts)
}

/// Gene and protein symbols tracked across transcriptomic and proteomic sources.
pub const TRACKED_SYMBOLS: &[(&str, &str)] = &[
    ("TP53", "tp53"),
    ("P53", "tp53"),
    ("VEGFA", "vegfa"),
    ("IL6", "il6"),
    ("EGFR", "egfr"),
    ("MGMT", "mgmt"),
    ("PTEN", "pten"),
];

/// Proteins declared in the proteomic schema.
pub const TRACKED_PROTEINS: &[&str] = &["tp53", "vegfa", "il6", "egfr"];

/// Matches a gene/protein label by token, so `TP53_NP_000537` maps to `tp53`
/// while `IL6R` does not map to `il6`.
pub fn tracked_symbol(label: &str) -> Option<&'static str> {
    label
        .split(|ch: char| !ch.is_ascii_alphanumeric())
        .filter(|token| !token.is_empty())
        .find_map(|token| {
            TRACKED_SYMBOLS
                .iter()
                .find(|(symbol, _)| token.eq_ignore_ascii_case(symbol))
                .map(|(_, stem)| *stem)
        })
}

/// Per-source parsing rules. Implementors only see one artifact header and one
/// record at a time; the shared stream handles files, errors and provenance.
pub trait SourceNormalizer: Send + Sync {
    type Plan: Send;

    fn source_id(&self) -> SourceId;

    /// Chooses how to read an artifact from its lower-cased name and header.
    /// `Ok(None)` skips artifacts that carry no subject-level data.
    fn plan(&self, artifact: &str, headers: &StringRecord) -> Result<Option<Self::Plan>, String>;

    fn normalize_record(
        &self,
        plan: &Self::Plan,
        record: &RawRecord<'_>,
    ) -> Result<Vec<ObservationDraft>, String>;

    fn normalize<'a>(&'a self, entry: &'a ManifestEntry) -> ObservationStream<'a, Self>
    where
        Self: Sized,
    {
        ObservationStream::new(self, entry)
    }
}

struct OpenArtifact<P> {
    locator: String,
    plan: P,
    headers: StringRecord,
    records: StringRecordsIntoIter<Box<dyn Read + Send>>,
}

/// Lazy record-by-record sequence over a manifest entry's artifacts. Calling
/// `normalize` again restarts from the first artifact.
pub struct ObservationStream<'a, N: SourceNormalizer> {
    normalizer: &'a N,
    entry: &'a ManifestEntry,
    next_artifact: usize,
    current: Option<OpenArtifact<N::Plan>>,
}

impl<'a, N: SourceNormalizer> ObservationStream<'a, N> {
    fn new(normalizer: &'a N, entry: &'a ManifestEntry) -> Self {
        Self {
            normalizer,
            entry,
            next_artifact: 0,
            current: None,
        }
    }

    fn open_next(&mut self) -> Option<Result<(), KiraError>> {
        let path = self.entry.artifact_paths.get(self.next_artifact)?;
        self.next_artifact += 1;
        let locator = locator_name(path).to_string();
        let mut reader = match tabular_reader(path) {
            Ok(reader) => reader,
            Err(err) => return Some(Err(err)),
        };
        let headers = match reader.headers() {
            Ok(headers) => headers.clone(),
            Err(err) => {
                return Some(Err(KiraError::parse(
                    &locator,
                    format!("unreadable header: {err}"),
                )));
            }
        };
        match self.normalizer.plan(&artifact_name(path), &headers) {
            Ok(Some(plan)) => {
                debug!(source = %self.normalizer.source_id(), artifact = %locator, "normalizing artifact");
                self.current = Some(OpenArtifact {
                    locator,
                    plan,
                    headers,
                    records: reader.into_records(),
                });
                Some(Ok(()))
            }
            Ok(None) => {
                debug!(source = %self.normalizer.source_id(), artifact = %locator, "artifact carries no subject data, skipped");
                Some(Ok(()))
            }
            Err(message) => Some(Err(KiraError::parse(&locator, message))),
        }
    }

    fn finish(&self, record: &RawRecord<'_>, drafts: Vec<ObservationDraft>) -> RecordResult {
        let source_id = self.normalizer.source_id();
        let fetched_at: DateTime<Utc> = self.entry.fetched_at;
        drafts
            .into_iter()
            .map(|draft| {
                if draft.keys.is_empty() {
                    return Err(KiraError::parse(
                        format!("{}:{}", record.artifact, record.line),
                        "record has no subject key",
                    ));
                }
                let raw_locator = match &draft.column {
                    Some(column) => format!("{}:{}:{}", record.artifact, record.line, column),
                    None => format!("{}:{}", record.artifact, record.line),
                };
                Ok(CanonicalObservation {
                    source_id,
                    subject_key_candidates: draft.keys,
                    modality: draft.modality,
                    field_name: draft.field,
                    value: draft.value,
                    unit: draft.unit,
                    provenance: Provenance {
                        source_id,
                        raw_locator,
                        fetched_at,
                    },
                })
            })
            .collect()
    }
}

impl<N: SourceNormalizer> Iterator for ObservationStream<'_, N> {
    type Item = RecordResult;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let Some(current) = self.current.as_mut() else {
                match self.open_next()? {
                    Ok(()) => continue,
                    Err(err) => return Some(Err(err)),
                }
            };
            match current.records.next() {
                Some(Ok(row)) => {
                    let line = row.position().map(|pos| pos.line()).unwrap_or(0);
                    let current = self.current.as_ref()?;
                    let raw = RawRecord::new(&current.locator, line, &current.headers, &row);
                    let result = match self.normalizer.normalize_record(&current.plan, &raw) {
                        Ok(drafts) => self.finish(&raw, drafts),
                        Err(message) => {
                            Err(KiraError::parse(format!("{}:{line}", current.locator), message))
                        }
                    };
                    return Some(result);
                }
                Some(Err(err)) => {
                    let locator = current.locator.clone();
                    let position = err
                        .position()
                        .map(|pos| format!("{locator}:{}", pos.line()))
                        .unwrap_or_else(|| locator.clone());
                    if err.is_io_error() {
                        self.current = None;
                    }
                    return Some(Err(KiraError::parse(position, err.to_string())));
                }
                None => self.current = None,
            }
        }
    }
}

/// Object-safe view of a normalizer so the pipeline can hold all six.
pub trait Normalize: Send + Sync {
    fn source(&self) -> SourceId;
    fn records<'a>(&'a self, entry: &'a ManifestEntry) -> Box<dyn Iterator<Item = RecordResult> + 'a>;
}

impl<N> Normalize for N
where
    N: SourceNormalizer,
    N::Plan: 'static,
{
    fn source(&self) -> SourceId {
        self.source_id()
    }

    fn records<'a>(&'a self, entry: &'a ManifestEntry) -> Box<dyn Iterator<Item = RecordResult> + 'a> {
        Box::new(self.normalize(entry))
    }
}

pub struct NormalizerRegistry {
    normalizers: BTreeMap<SourceId, Box<dyn Normalize>>,
}

impl Default for NormalizerRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl NormalizerRegistry {
    pub fn standard() -> Self {
        let mut registry = Self {
            normalizers: BTreeMap::new(),
        };
        registry.register(Box::new(TcgaNormalizer));
        registry.register(Box::new(GeoNormalizer));
        registry.register(Box::new(CptacNormalizer));
        registry.register(Box::new(TciaNormalizer));
        registry.register(Box::new(PrideNormalizer));
        registry.register(Box::new(NhanesNormalizer));
        registry
    }

    pub fn register(&mut self, normalizer: Box<dyn Normalize>) {
        self.normalizers.insert(normalizer.source(), normalizer);
    }

    pub fn get(&self, source: SourceId) -> Option<&dyn Normalize> {
        self.normalizers.get(&source).map(|normalizer| normalizer.as_ref())
    }

    pub fn sources(&self) -> Vec<SourceId> {
        self.normalizers.keys().copied().collect()
    }
}

/// Outcome of normalizing one source to completion.
#[derive(Debug, Default)]
pub struct SourceBatch {
    pub observations: Vec<CanonicalObservation>,
    pub errors: Vec<KiraError>,
    pub records: usize,
}

pub fn collect_source(normalizer: &dyn Normalize, entry: &ManifestEntry) -> SourceBatch {
    let mut batch = SourceBatch::default();
    for result in normalizer.records(entry) {
        batch.records += 1;
        match result {
            Ok(mut observations) => batch.observations.append(&mut observations),
            Err(err) => batch.errors.push(err),
        }
    }
    batch
}
