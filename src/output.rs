use std::io::{self, Write};

use serde::Serialize;

use crate::pipeline::{ProgressEvent, ProgressSink, RunSummary};
use crate::schema::Schema;
use crate::store::Manifest;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Human,
    Json,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaColumn {
    pub column: String,
    pub kind: String,
    pub unit: Option<String>,
    pub range: Option<(f64, f64)>,
}

pub fn schema_columns(schema: &Schema) -> Vec<SchemaColumn> {
    schema
        .fields()
        .iter()
        .map(|spec| SchemaColumn {
            column: spec.column(),
            kind: format!("{:?}", spec.kind).to_lowercase(),
            unit: spec.unit.map(str::to_string),
            range: spec.range,
        })
        .collect()
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_run(summary: &RunSummary) -> io::Result<()> {
        Self::print_json(summary)
    }

    pub fn print_manifest(manifest: &Manifest) -> io::Result<()> {
        Self::print_json(manifest)
    }

    pub fn print_schema(columns: &[SchemaColumn]) -> io::Result<()> {
        Self::print_json(&columns)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// Progress stays off stdout in JSON mode so the document is parseable.
impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Stage lines on stderr for interactive runs.
pub struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn event(&self, event: ProgressEvent) {
        let elapsed = event
            .elapsed
            .map(|elapsed| format!(" ({:.1}s)", elapsed.as_secs_f64()))
            .unwrap_or_default();
        eprintln!("[{}] {}{elapsed}", event.stage, event.message);
    }
}
