//! Output artifacts: the harmonized table, the diagnostics report and the
//! optional provenance sidecar. Every file is written atomically.

use std::collections::BTreeMap;

use camino::Utf8Path;
use serde::Serialize;
use tracing::info;

use crate::diagnostics::{DiagnosticClass, DiagnosticRecord, Severity};
use crate::domain::{SourceId, Value};
use crate::error::KiraError;
use crate::merge::{Contribution, MISSING_MARKER, MergedRow};
use crate::scale::ColumnScale;
use crate::schema::Schema;
use crate::store::write_bytes_atomic;

pub const LEADING_COLUMNS: [&str; 3] = ["canonical_id", "resolution_method", "confidence"];

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReportSummary {
    pub sources_available: Vec<SourceId>,
    pub sources_unavailable: Vec<SourceId>,
    pub observations: usize,
    pub subjects: usize,
    pub rows_merged: usize,
    pub rows_accepted: usize,
    pub rows_rejected: usize,
    pub diagnostics_by_class: BTreeMap<DiagnosticClass, usize>,
    pub diagnostics_by_severity: BTreeMap<Severity, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticsReport {
    pub schema_version: u32,
    pub summary: ReportSummary,
    pub scaling: Vec<ColumnScale>,
    pub diagnostics: Vec<DiagnosticRecord>,
    pub rejected_rows: Vec<MergedRow>,
}

impl DiagnosticsReport {
    /// Sorts diagnostics and rejected rows so the report is byte-stable.
    pub fn new(
        schema_version: u32,
        mut summary: ReportSummary,
        scaling: Vec<ColumnScale>,
        mut diagnostics: Vec<DiagnosticRecord>,
        mut rejected_rows: Vec<MergedRow>,
    ) -> Self {
        diagnostics.sort();
        rejected_rows.sort_by(|a, b| a.canonical_id.cmp(&b.canonical_id));
        summary.diagnostics_by_class.clear();
        summary.diagnostics_by_severity.clear();
        for record in &diagnostics {
            *summary.diagnostics_by_class.entry(record.class).or_default() += 1;
            *summary
                .diagnostics_by_severity
                .entry(record.severity)
                .or_default() += 1;
        }
        summary.rows_rejected = rejected_rows.len();
        Self {
            schema_version,
            summary,
            scaling,
            diagnostics,
            rejected_rows,
        }
    }
}

pub fn header(schema: &Schema) -> Vec<String> {
    LEADING_COLUMNS
        .iter()
        .map(|column| column.to_string())
        .chain(schema.columns())
        .collect()
}

/// Renders accepted rows as CSV in fixed column order.
pub fn render_table(schema: &Schema, rows: &[MergedRow]) -> Result<Vec<u8>, KiraError> {
    let columns = schema.columns();
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(header(schema))
        .map_err(|err| KiraError::Serialization(err.to_string()))?;
    for row in rows {
        let mut record = Vec::with_capacity(columns.len() + LEADING_COLUMNS.len());
        record.push(row.canonical_id.clone());
        record.push(row.resolution_method.to_string());
        record.push(Value::Number(row.confidence).render());
        for column in &columns {
            record.push(
                row.cell(column)
                    .map(|cell| cell.render())
                    .unwrap_or_else(|| MISSING_MARKER.to_string()),
            );
        }
        writer
            .write_record(&record)
            .map_err(|err| KiraError::Serialization(err.to_string()))?;
    }
    writer
        .into_inner()
        .map_err(|err| KiraError::Serialization(err.to_string()))
}

pub fn write_table(path: &Utf8Path, schema: &Schema, rows: &[MergedRow]) -> Result<(), KiraError> {
    let content = render_table(schema, rows)?;
    write_bytes_atomic(path, &content)?;
    info!(path = %path, rows = rows.len(), "table written");
    Ok(())
}

pub fn write_report(path: &Utf8Path, report: &DiagnosticsReport) -> Result<(), KiraError> {
    write_json(path, report)?;
    info!(path = %path, diagnostics = report.diagnostics.len(), "diagnostics report written");
    Ok(())
}

/// Per-cell contributions for every accepted row, keyed by canonical id.
pub fn write_provenance(path: &Utf8Path, rows: &[MergedRow]) -> Result<(), KiraError> {
    let provenance: BTreeMap<&str, &BTreeMap<String, Vec<Contribution>>> = rows
        .iter()
        .map(|row| (row.canonical_id.as_str(), &row.provenance))
        .collect();
    write_json(path, &provenance)?;
    info!(path = %path, rows = rows.len(), "provenance sidecar written");
    Ok(())
}

fn write_json<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), KiraError> {
    let mut content =
        serde_json::to_vec_pretty(value).map_err(|err| KiraError::Serialization(err.to_string()))?;
    content.push(b'\n');
    write_bytes_atomic(path, &content)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use camino::Utf8PathBuf;

    use super::*;
    use crate::domain::ResolutionMethod;
    use crate::merge::{Cell, MissingReason};

    fn row(id: &str) -> MergedRow {
        let schema = Schema::standard();
        let mut cells: BTreeMap<String, Cell> = schema
            .columns()
            .into_iter()
            .map(|column| (column, Cell::Missing(MissingReason::ModalityAbsent)))
            .collect();
        cells.insert(
            "genomic.gender".to_string(),
            Cell::Value(Value::Text("female".to_string())),
        );
        cells.insert(
            "imaging.scan_modality".to_string(),
            Cell::Multi(vec![
                Value::Text("CT".to_string()),
                Value::Text("MR".to_string()),
            ]),
        );
        MergedRow {
            canonical_id: id.to_string(),
            resolution_method: ResolutionMethod::Fuzzy,
            confidence: 0.9375,
            cells,
            provenance: BTreeMap::new(),
            flags: BTreeSet::new(),
        }
    }

    #[test]
    fn table_has_fixed_column_order() {
        let schema = Schema::standard();
        let bytes = render_table(&schema, &[row("P1")]).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let mut lines = text.lines();
        let header_line = lines.next().unwrap();
        assert!(header_line.starts_with("canonical_id,resolution_method,confidence,genomic."));
        let columns: Vec<&str> = header_line.split(',').collect();
        assert_eq!(columns.len(), 3 + schema.fields().len());
        let data: Vec<&str> = lines.next().unwrap().split(',').collect();
        assert_eq!(&data[..3], &["P1", "fuzzy", "0.9375"]);
        let gender = columns.iter().position(|c| *c == "genomic.gender").unwrap();
        assert_eq!(data[gender], "female");
        let modality = columns.iter().position(|c| *c == "imaging.scan_modality").unwrap();
        assert_eq!(data[modality], "CT|MR");
        let age = columns.iter().position(|c| *c == "survey.age").unwrap();
        assert_eq!(data[age], "NA");
    }

    #[test]
    fn report_is_sorted_and_counted() {
        let diagnostics = vec![
            DiagnosticRecord::validation("B", "value-range", Severity::Reject, "x".to_string()),
            DiagnosticRecord::fetch_unavailable(SourceId::Pride, "not listed"),
        ];
        let report = DiagnosticsReport::new(
            1,
            ReportSummary::default(),
            Vec::new(),
            diagnostics,
            vec![row("Z"), row("A")],
        );
        assert_eq!(report.diagnostics[0].class, DiagnosticClass::FetchUnavailable);
        assert_eq!(report.rejected_rows[0].canonical_id, "A");
        assert_eq!(report.summary.rows_rejected, 2);
        assert_eq!(report.summary.diagnostics_by_severity[&Severity::Warn], 1);
    }

    #[test]
    fn writes_are_atomic_and_repeatable() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("out/table.csv")).unwrap();
        let schema = Schema::standard();
        write_table(&path, &schema, &[row("P1")]).unwrap();
        let first = std::fs::read(path.as_std_path()).unwrap();
        write_table(&path, &schema, &[row("P1")]).unwrap();
        let second = std::fs::read(path.as_std_path()).unwrap();
        assert_eq!(first, second);
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("out"))
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().starts_with("kira-be-write"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
