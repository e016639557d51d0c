//! The staged run: normalize (parallel) -> resolve -> merge -> validate ->
//! scale -> write.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::RunConfig;
use crate::crosswalk::CrosswalkTable;
use crate::diagnostics::{DiagnosticRecord, Severity};
use crate::domain::{CanonicalObservation, SourceId};
use crate::error::KiraError;
use crate::identity::resolve;
use crate::merge::Merger;
use crate::normalize::{Normalize, NormalizerRegistry, SourceBatch, collect_source};
use crate::scale::robust_scale;
use crate::schema::Schema;
use crate::store::{ArtifactStore, Availability, ManifestEntry};
use crate::validate::Validator;
use crate::writer::{DiagnosticsReport, ReportSummary, write_provenance, write_report, write_table};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Load,
    Normalize,
    Resolve,
    Merge,
    Validate,
    Scale,
    Write,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Load => "load",
            Stage::Normalize => "normalize",
            Stage::Resolve => "resolve",
            Stage::Merge => "merge",
            Stage::Validate => "validate",
            Stage::Scale => "scale",
            Stage::Write => "write",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Discards progress.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn event(&self, _event: ProgressEvent) {}
}

/// Shared flag checked between stages.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub output: Utf8PathBuf,
    pub diagnostics: Utf8PathBuf,
    pub provenance: Option<Utf8PathBuf>,
    pub sources_available: Vec<SourceId>,
    pub sources_unavailable: Vec<SourceId>,
    pub observations: usize,
    pub subjects: usize,
    pub rows_accepted: usize,
    pub rows_rejected: usize,
    pub diagnostics_total: usize,
    pub warnings: usize,
}

pub struct Pipeline {
    config: RunConfig,
    schema: Schema,
    registry: NormalizerRegistry,
    validator: Validator,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            schema: Schema::standard(),
            registry: NormalizerRegistry::standard(),
            validator: Validator::standard(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_registry(mut self, registry: NormalizerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    fn checkpoint(&self, stage: Stage, sink: &dyn ProgressSink, started: Instant) -> Result<(), KiraError> {
        if self.cancel.is_cancelled() {
            warn!(%stage, "run cancelled");
            return Err(KiraError::Cancelled(stage.to_string()));
        }
        sink.event(ProgressEvent {
            stage,
            message: format!("stage={stage}"),
            elapsed: Some(started.elapsed()),
        });
        Ok(())
    }

    pub fn run(&self, store: &ArtifactStore, sink: &dyn ProgressSink) -> Result<RunSummary, KiraError> {
        let started = Instant::now();
        self.checkpoint(Stage::Load, sink, started)?;
        let crosswalks = CrosswalkTable::load_all(&self.config.crosswalks)?;

        let mut diagnostics = Vec::new();
        let mut jobs: Vec<(SourceId, &dyn Normalize, &ManifestEntry)> = Vec::new();
        let mut unavailable = BTreeSet::new();
        for source in SourceId::ALL {
            let availability = match (store.availability(source), self.registry.get(source)) {
                (Availability::Available(entry), Some(normalizer)) => Ok((normalizer, entry)),
                (Availability::Available(_), None) => Err("no normalizer registered".to_string()),
                (Availability::Unavailable(reason), _) => Err(reason),
            };
            match availability {
                Ok((normalizer, entry)) => jobs.push((source, normalizer, entry)),
                Err(reason) => {
                    warn!(%source, %reason, "source unavailable");
                    diagnostics.push(DiagnosticRecord::fetch_unavailable(source, &reason));
                    unavailable.insert(source);
                }
            }
        }
        if self.config.strict_source_requirement && !unavailable.is_empty() {
            let missing: Vec<&str> = unavailable.iter().map(|source| source.as_str()).collect();
            return Err(KiraError::StrictSourceMissing(missing.join(", ")));
        }

        self.checkpoint(Stage::Normalize, sink, started)?;
        let batches = normalize_parallel(&jobs)?;
        let mut observations: Vec<CanonicalObservation> = Vec::new();
        for (source, batch) in batches {
            info!(
                %source,
                records = batch.records,
                observations = batch.observations.len(),
                errors = batch.errors.len(),
                "source normalized"
            );
            diagnostics.extend(
                batch
                    .errors
                    .iter()
                    .map(|error| DiagnosticRecord::parse_error(source, error)),
            );
            observations.extend(batch.observations);
        }

        self.checkpoint(Stage::Resolve, sink, started)?;
        let resolution = resolve(&observations, &crosswalks, &self.config)?;
        diagnostics.extend(resolution.ambiguities.iter().cloned());

        self.checkpoint(Stage::Merge, sink, started)?;
        let merged = Merger::new(&self.schema, &self.config.priority, &unavailable)
            .merge(&observations, &resolution)?;
        let rows_merged = merged.rows.len();
        diagnostics.extend(merged.diagnostics);

        self.checkpoint(Stage::Validate, sink, started)?;
        let validated = self
            .validator
            .validate(merged.rows, &resolution, &self.schema)?;
        diagnostics.extend(validated.diagnostics);
        let mut accepted = validated.accepted;

        self.checkpoint(Stage::Scale, sink, started)?;
        let scaling = robust_scale(&mut accepted, &self.config.scaling);

        self.checkpoint(Stage::Write, sink, started)?;
        let sources_available: Vec<SourceId> = jobs.iter().map(|(source, _, _)| *source).collect();
        let sources_unavailable: Vec<SourceId> = unavailable.into_iter().collect();
        let summary = ReportSummary {
            sources_available: sources_available.clone(),
            sources_unavailable: sources_unavailable.clone(),
            observations: observations.len(),
            subjects: resolution.subjects().len(),
            rows_merged,
            rows_accepted: accepted.len(),
            ..ReportSummary::default()
        };
        let report = DiagnosticsReport::new(
            self.config.schema_version,
            summary,
            scaling,
            diagnostics,
            validated.rejected,
        );

        let paths = &self.config.paths;
        write_table(&paths.output, &self.schema, &accepted)?;
        write_report(&paths.diagnostics, &report)?;
        let provenance = if self.config.emit_provenance {
            let path = self.config.provenance_path();
            write_provenance(&path, &accepted)?;
            Some(path)
        } else {
            None
        };

        let warnings = report
            .diagnostics
            .iter()
            .filter(|record| record.severity == Severity::Warn)
            .count();
        let summary = RunSummary {
            output: paths.output.clone(),
            diagnostics: paths.diagnostics.clone(),
            provenance,
            sources_available,
            sources_unavailable,
            observations: observations.len(),
            subjects: resolution.subjects().len(),
            rows_accepted: accepted.len(),
            rows_rejected: report.rejected_rows.len(),
            diagnostics_total: report.diagnostics.len(),
            warnings,
        };
        info!(
            accepted = summary.rows_accepted,
            rejected = summary.rows_rejected,
            diagnostics = summary.diagnostics_total,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "run complete"
        );
        sink.event(ProgressEvent {
            stage: Stage::Write,
            message: format!(
                "done; accepted={} rejected={} diagnostics={}",
                summary.rows_accepted, summary.rows_rejected, summary.diagnostics_total
            ),
            elapsed: Some(started.elapsed()),
        });
        Ok(summary)
    }
}

/// One scoped thread per available source. Joining every thread is the
/// barrier before identity resolution; batches come back in source order.
fn normalize_parallel(
    jobs: &[(SourceId, &dyn Normalize, &ManifestEntry)],
) -> Result<Vec<(SourceId, SourceBatch)>, KiraError> {
    thread::scope(|scope| {
        let handles: Vec<_> = jobs
            .iter()
            .map(|&(source, normalizer, entry)| {
                (source, scope.spawn(move || collect_source(normalizer, entry)))
            })
            .collect();
        handles
            .into_iter()
            .map(|(source, handle)| {
                handle
                    .join()
                    .map(|batch| (source, batch))
                    .map_err(|_| KiraError::NormalizerPanic(source.to_string()))
            })
            .collect()
    })
}
