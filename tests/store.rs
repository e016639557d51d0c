use std::fs;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use kira_brain_etl::domain::SourceId;
use kira_brain_etl::error::KiraError;
use kira_brain_etl::store::{ArtifactStore, Availability, MANIFEST_FILE, source_dir};

fn data_root(dir: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
}

#[test]
fn layout_dirs() {
    assert_eq!(source_dir(SourceId::Tcga), "TCGA");
    assert_eq!(source_dir(SourceId::Pride), "EXTERNAL/pride");
    assert_eq!(source_dir(SourceId::Nhanes), "EXTERNAL/nhanes");
}

#[test]
fn scan_write_and_open() {
    let dir = tempfile::tempdir().unwrap();
    let root = data_root(&dir);
    fs::create_dir_all(root.join("TCGA/gdc").as_std_path()).unwrap();
    fs::write(root.join("TCGA/gdc/clinical_gbm.csv").as_std_path(), "patient_id\nTCGA-02-0001\n")
        .unwrap();
    fs::write(root.join("TCGA/README.md").as_std_path(), "notes").unwrap();
    fs::create_dir_all(root.join("EXTERNAL/nhanes").as_std_path()).unwrap();
    fs::write(root.join("EXTERNAL/nhanes/demo_j.csv").as_std_path(), "SEQN\n1\n").unwrap();

    let manifest = ArtifactStore::scan(&root).unwrap();
    assert_eq!(manifest.sources.len(), SourceId::ALL.len());
    let tcga = manifest
        .sources
        .iter()
        .find(|entry| entry.source_id == SourceId::Tcga)
        .unwrap();
    assert!(tcga.available);
    assert_eq!(tcga.artifact_paths, vec![Utf8PathBuf::from("TCGA/gdc/clinical_gbm.csv")]);
    let geo = manifest
        .sources
        .iter()
        .find(|entry| entry.source_id == SourceId::Geo)
        .unwrap();
    assert!(!geo.available);

    let path = root.join(MANIFEST_FILE);
    ArtifactStore::write_manifest(&path, &manifest).unwrap();
    let store = ArtifactStore::open(&path).unwrap();
    assert_eq!(store.root(), root.as_path());
    assert_matches!(store.availability(SourceId::Nhanes), Availability::Available(_));
    assert_matches!(store.availability(SourceId::Geo), Availability::Unavailable(_));
}

#[test]
fn open_missing_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let path = data_root(&dir).join(MANIFEST_FILE);
    assert_matches!(ArtifactStore::open(&path), Err(KiraError::ManifestRead(_)));
}

#[test]
fn open_rejects_unknown_source() {
    let dir = tempfile::tempdir().unwrap();
    let path = data_root(&dir).join(MANIFEST_FILE);
    fs::write(
        path.as_std_path(),
        r#"{"sources": [{"source_id": "ukbiobank", "artifact_paths": [], "fetched_at": "2024-05-01T00:00:00Z", "available": true}]}"#,
    )
    .unwrap();
    assert_matches!(ArtifactStore::open(&path), Err(KiraError::ManifestParse(_)));
}
