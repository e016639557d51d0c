use std::collections::BTreeMap;
use std::fs;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};
use serde_json::Value as Json;

use kira_brain_etl::config::{CrosswalkSpec, OutputPaths, RunConfig};
use kira_brain_etl::domain::SourceId;
use kira_brain_etl::error::KiraError;
use kira_brain_etl::pipeline::{NoProgress, Pipeline};
use kira_brain_etl::store::ArtifactStore;

struct Fixture {
    _dir: tempfile::TempDir,
    root: Utf8PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        Self { _dir: dir, root }
    }

    fn file(&self, relative: &str, content: &str) -> Utf8PathBuf {
        let path = self.root.join(relative);
        fs::create_dir_all(path.parent().unwrap().as_std_path()).unwrap();
        fs::write(path.as_std_path(), content).unwrap();
        path
    }

    /// Writes `manifest.json` listing `sources`; unlisted sources are unavailable.
    fn manifest(&self, sources: &[(&str, &[&str])]) -> Utf8PathBuf {
        let entries: Vec<Json> = sources
            .iter()
            .map(|(source, paths)| {
                serde_json::json!({
                    "source_id": source,
                    "artifact_paths": paths,
                    "fetched_at": "2024-05-01T00:00:00Z",
                    "available": true,
                })
            })
            .collect();
        let manifest = serde_json::json!({ "sources": entries });
        self.file("manifest.json", &serde_json::to_string_pretty(&manifest).unwrap())
    }

    fn config(&self, out: &str) -> RunConfig {
        RunConfig {
            paths: OutputPaths {
                manifest: self.root.join("manifest.json"),
                output: self.root.join(format!("{out}/table.csv")),
                diagnostics: self.root.join(format!("{out}/report.json")),
            },
            ..RunConfig::default()
        }
    }
}

fn read_table(path: &Utf8Path) -> Vec<BTreeMap<String, String>> {
    let mut reader = csv::Reader::from_path(path.as_std_path()).unwrap();
    let headers = reader.headers().unwrap().clone();
    reader
        .records()
        .map(|record| {
            let record = record.unwrap();
            headers
                .iter()
                .zip(record.iter())
                .map(|(header, value)| (header.to_string(), value.to_string()))
                .collect()
        })
        .collect()
}

fn read_json(path: &Utf8Path) -> Json {
    serde_json::from_str(&fs::read_to_string(path.as_std_path()).unwrap()).unwrap()
}

fn proteomic_fixture() -> Fixture {
    let fixture = Fixture::new();
    fixture.file("CPTAC/cptac_proteomics.csv", "patient_id,TP53\nS001,1.5\n");
    fixture.file(
        "EXTERNAL/pride/PXD000001_quant.csv",
        "sample_id,protein,intensity\nTCGA-S001,TP53,2.5\n",
    );
    fixture.file("xwalk/cptac_pride.csv", "from_key,to_key\nS001,TCGA-S001\n");
    fixture.manifest(&[
        ("cptac", &["CPTAC/cptac_proteomics.csv"]),
        ("pride", &["EXTERNAL/pride/PXD000001_quant.csv"]),
    ]);
    fixture
}

#[test]
fn crosswalk_links_subject_and_priority_picks_value() {
    let fixture = proteomic_fixture();
    let config = RunConfig {
        crosswalks: vec![CrosswalkSpec {
            path: fixture.root.join("xwalk/cptac_pride.csv"),
            from_source: SourceId::Cptac,
            to_source: SourceId::Pride,
        }],
        emit_provenance: true,
        ..fixture.config("out")
    };
    let store = ArtifactStore::open(&config.paths.manifest).unwrap();
    let summary = Pipeline::new(config).run(&store, &NoProgress).unwrap();
    assert_eq!(summary.subjects, 1);
    assert_eq!(summary.rows_accepted, 1);

    let rows = read_table(&summary.output);
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row["canonical_id"], "S001");
    assert_eq!(row["resolution_method"], "crosswalk");
    assert_eq!(row["confidence"], "1");
    assert_eq!(row["proteomic.tp53_abundance"], "1.5");

    let provenance = read_json(summary.provenance.as_ref().unwrap());
    let contributions = provenance["S001"]["proteomic.tp53_abundance"]
        .as_array()
        .unwrap();
    assert_eq!(contributions.len(), 2);
    let by_source: BTreeMap<&str, &Json> = contributions
        .iter()
        .map(|entry| (entry["source_id"].as_str().unwrap(), entry))
        .collect();
    assert_eq!(by_source["cptac"]["selected"], Json::Bool(true));
    assert_eq!(by_source["pride"]["selected"], Json::Bool(false));
    assert_eq!(by_source["pride"]["value"], serde_json::json!(2.5));
}

#[test]
fn without_crosswalk_dissimilar_keys_stay_apart() {
    let fixture = proteomic_fixture();
    let config = fixture.config("out");
    let store = ArtifactStore::open(&config.paths.manifest).unwrap();
    let summary = Pipeline::new(config).run(&store, &NoProgress).unwrap();
    assert_eq!(summary.subjects, 2);
    let rows = read_table(&summary.output);
    let ids: Vec<&str> = rows.iter().map(|row| row["canonical_id"].as_str()).collect();
    assert_eq!(ids, vec!["S001", "TCGA-S001"]);
    assert!(rows.iter().all(|row| row["resolution_method"] == "exact"));
}

#[test]
fn unavailable_source_is_reported_once_and_its_fields_are_missing() {
    let fixture = Fixture::new();
    fixture.file(
        "TCGA/clinical_gbm.csv",
        "patient_id,age,gender\nTCGA-02-0001,21915,female\nTCGA-02-0002,18262,male\n",
    );
    fixture.manifest(&[("tcga", &["TCGA/clinical_gbm.csv"])]);
    let config = fixture.config("out");
    let store = ArtifactStore::open(&config.paths.manifest).unwrap();
    let summary = Pipeline::new(config).run(&store, &NoProgress).unwrap();
    assert_eq!(summary.rows_accepted, 2);
    assert!(summary.sources_unavailable.contains(&SourceId::Tcia));

    let rows = read_table(&summary.output);
    for row in &rows {
        for (column, value) in row {
            if column.starts_with("imaging.") {
                assert_eq!(value, "NA", "{column} should be missing");
            }
        }
    }

    let report = read_json(&summary.diagnostics);
    let tcia: Vec<&Json> = report["diagnostics"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|record| record["class"] == "FetchUnavailable" && record["row_key"] == "source:tcia")
        .collect();
    assert_eq!(tcia.len(), 1);
    assert_eq!(report["summary"]["diagnostics_by_class"]["FetchUnavailable"], 5);
}

#[test]
fn strict_mode_fails_when_a_source_is_missing() {
    let fixture = proteomic_fixture();
    let config = RunConfig {
        strict_source_requirement: true,
        ..fixture.config("out")
    };
    let store = ArtifactStore::open(&config.paths.manifest).unwrap();
    let err = Pipeline::new(config).run(&store, &NoProgress).unwrap_err();
    assert_matches!(err, KiraError::StrictSourceMissing(missing) if missing.contains("geo"));
    assert!(!fixture.root.join("out/table.csv").exists());
}

#[test]
fn repeated_runs_are_byte_identical() {
    let fixture = proteomic_fixture();
    fixture.file(
        "TCGA/clinical_gbm.csv",
        "patient_id,age,gender\nTCGA-02-0001,21915,female\n",
    );
    fixture.manifest(&[
        ("tcga", &["TCGA/clinical_gbm.csv"]),
        ("cptac", &["CPTAC/cptac_proteomics.csv"]),
        ("pride", &["EXTERNAL/pride/PXD000001_quant.csv"]),
    ]);

    let first = fixture.config("first");
    let second = fixture.config("second");
    let store = ArtifactStore::open(&first.paths.manifest).unwrap();
    Pipeline::new(first.clone()).run(&store, &NoProgress).unwrap();
    Pipeline::new(second.clone()).run(&store, &NoProgress).unwrap();

    let read = |path: &Utf8Path| fs::read(path.as_std_path()).unwrap();
    assert_eq!(read(&first.paths.output), read(&second.paths.output));
    assert_eq!(read(&first.paths.diagnostics), read(&second.paths.diagnostics));
}

#[test]
fn every_record_is_accounted_for() {
    let fixture = Fixture::new();
    fixture.file(
        "TCGA/clinical_gbm.csv",
        "patient_id,age,gender\nTCGA-02-0001,21915,female\nTCGA-02-0002,not-a-number,male\nTCGA-02-0003,80000,male\n",
    );
    fixture.manifest(&[("tcga", &["TCGA/clinical_gbm.csv"])]);
    let config = fixture.config("out");
    let store = ArtifactStore::open(&config.paths.manifest).unwrap();
    let summary = Pipeline::new(config).run(&store, &NoProgress).unwrap();

    let rows = read_table(&summary.output);
    let ids: Vec<&str> = rows.iter().map(|row| row["canonical_id"].as_str()).collect();
    assert_eq!(ids, vec!["TCGA-02-0001"]);

    let report = read_json(&summary.diagnostics);
    let diagnostics = report["diagnostics"].as_array().unwrap();
    assert!(
        diagnostics
            .iter()
            .any(|record| record["class"] == "ParseError"
                && record["row_key"].as_str().unwrap().contains("clinical_gbm.csv"))
    );
    assert!(
        diagnostics
            .iter()
            .any(|record| record["class"] == "ValidationFailure"
                && record["row_key"] == "TCGA-02-0003"
                && record["rule_violated"] == "value-range")
    );
    let rejected = report["rejected_rows"].as_array().unwrap();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0]["canonical_id"], "TCGA-02-0003");
}

#[test]
fn near_miss_keys_on_one_subject_are_reported_ambiguous() {
    let fixture = Fixture::new();
    fixture.file(
        "TCGA/clinical_gbm.csv",
        "patient_id,age,gender\nSUBJ-000100,21915,female\n",
    );
    fixture.file("CPTAC/cptac_proteomics.csv", "patient_id,TP53\nSUBJ-000100,1.5\n");
    fixture.file(
        "TCIA/tcia_series.csv",
        "PatientID,SeriesInstanceUID,Modality\nSUBJ-000101,1.2.3.1,MR\nSUBJ-000102,1.2.3.2,CT\n",
    );
    fixture.manifest(&[
        ("tcga", &["TCGA/clinical_gbm.csv"]),
        ("cptac", &["CPTAC/cptac_proteomics.csv"]),
        ("tcia", &["TCIA/tcia_series.csv"]),
    ]);
    let config = fixture.config("out");
    let store = ArtifactStore::open(&config.paths.manifest).unwrap();
    let summary = Pipeline::new(config).run(&store, &NoProgress).unwrap();
    assert_eq!(summary.subjects, 3);

    let rows = read_table(&summary.output);
    let ids: Vec<&str> = rows.iter().map(|row| row["canonical_id"].as_str()).collect();
    assert_eq!(ids, vec!["SUBJ-000100", "SUBJ-000101", "SUBJ-000102"]);
    assert!(rows.iter().all(|row| row["resolution_method"] == "exact"));

    let report = read_json(&summary.diagnostics);
    assert_eq!(report["summary"]["diagnostics_by_class"]["AmbiguousIdentity"], 1);
    let ambiguous: Vec<&Json> = report["diagnostics"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|record| record["class"] == "AmbiguousIdentity")
        .collect();
    assert_eq!(ambiguous.len(), 1);
    assert_eq!(ambiguous[0]["row_key"], "SUBJ-000100");
    assert_eq!(ambiguous[0]["severity"], "warn");
}
