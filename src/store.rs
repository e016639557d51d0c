use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::Builder;

use crate::domain::SourceId;
use crate::error::KiraError;

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub sources: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub source_id: SourceId,
    pub artifact_paths: Vec<Utf8PathBuf>,
    pub fetched_at: DateTime<Utc>,
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Availability<'a> {
    Available(&'a ManifestEntry),
    Unavailable(String),
}

/// Read-only view over the cached raw artifacts of one run.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: Utf8PathBuf,
    entries: Vec<ManifestEntry>,
}

impl ArtifactStore {
    pub fn open(manifest_path: &Utf8Path) -> Result<Self, KiraError> {
        let content = fs::read_to_string(manifest_path.as_std_path())
            .map_err(|_| KiraError::ManifestRead(manifest_path.as_std_path().to_path_buf()))?;
        let manifest: Manifest = serde_json::from_str(&content)
            .map_err(|err| KiraError::ManifestParse(err.to_string()))?;
        let root = manifest_path
            .parent()
            .map(Utf8Path::to_path_buf)
            .unwrap_or_default();
        Self::from_manifest(root, manifest)
    }

    /// Relative artifact paths resolve against `root`.
    pub fn from_manifest(root: Utf8PathBuf, manifest: Manifest) -> Result<Self, KiraError> {
        let mut seen = BTreeSet::new();
        let mut entries = Vec::with_capacity(manifest.sources.len());
        for mut entry in manifest.sources {
            if !seen.insert(entry.source_id) {
                return Err(KiraError::ManifestParse(format!(
                    "source {} listed more than once",
                    entry.source_id
                )));
            }
            entry.artifact_paths = entry
                .artifact_paths
                .into_iter()
                .map(|path| if path.is_absolute() { path } else { root.join(path) })
                .collect();
            entries.push(entry);
        }
        entries.sort_by_key(|entry| entry.source_id);
        Ok(Self { root, entries })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn entry(&self, source: SourceId) -> Option<&ManifestEntry> {
        self.entries.iter().find(|entry| entry.source_id == source)
    }

    pub fn availability(&self, source: SourceId) -> Availability<'_> {
        let Some(entry) = self.entry(source) else {
            return Availability::Unavailable("not listed in manifest".to_string());
        };
        if !entry.available {
            return Availability::Unavailable("marked unavailable by fetch".to_string());
        }
        if entry.artifact_paths.is_empty() {
            return Availability::Unavailable("no artifacts recorded".to_string());
        }
        if entry
            .artifact_paths
            .iter()
            .all(|path| !path.as_std_path().exists())
        {
            return Availability::Unavailable("no recorded artifact exists on disk".to_string());
        }
        Availability::Available(entry)
    }

    /// Builds a manifest from the conventional cache layout under `data_root`.
    /// Paths are recorded relative to `data_root`.
    pub fn scan(data_root: &Utf8Path) -> Result<Manifest, KiraError> {
        let mut sources = Vec::new();
        for source in SourceId::ALL {
            let dir = data_root.join(source_dir(source));
            let mut artifact_paths = Vec::new();
            let mut newest: Option<DateTime<Utc>> = None;
            if dir.as_std_path().is_dir() {
                let mut files = walk_dir(dir.as_std_path())?
                    .into_iter()
                    .filter(|path| path.is_file() && is_tabular(path))
                    .collect::<Vec<_>>();
                files.sort();
                for file in files {
                    let modified = fs::metadata(&file)
                        .and_then(|meta| meta.modified())
                        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
                    let modified = DateTime::<Utc>::from(modified);
                    newest = Some(newest.map_or(modified, |current| current.max(modified)));
                    let relative = match file.strip_prefix(data_root.as_std_path()) {
                        Ok(relative) => relative.to_path_buf(),
                        Err(_) => file.clone(),
                    };
                    let relative = Utf8PathBuf::from_path_buf(relative).map_err(|_| {
                        KiraError::Filesystem("non-utf8 artifact path".to_string())
                    })?;
                    artifact_paths.push(relative);
                }
            }
            sources.push(ManifestEntry {
                source_id: source,
                available: !artifact_paths.is_empty(),
                artifact_paths,
                fetched_at: newest.unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
            });
        }
        Ok(Manifest { sources })
    }

    pub fn write_manifest(path: &Utf8Path, manifest: &Manifest) -> Result<(), KiraError> {
        let content = serde_json::to_vec_pretty(manifest)
            .map_err(|err| KiraError::Serialization(err.to_string()))?;
        write_bytes_atomic(path, &content)
    }
}

pub fn source_dir(source: SourceId) -> &'static str {
    match source {
        SourceId::Tcga => "TCGA",
        SourceId::Geo => "GEO",
        SourceId::Cptac => "CPTAC",
        SourceId::Tcia => "TCIA",
        SourceId::Pride => "EXTERNAL/pride",
        SourceId::Nhanes => "EXTERNAL/nhanes",
    }
}

pub fn ensure_output_dir(path: &Utf8Path) -> Result<(), KiraError> {
    if let Some(parent) = path.parent() {
        if !parent.as_str().is_empty() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        }
    }
    Ok(())
}

/// Writes through a temp file in the destination directory, then renames.
pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), KiraError> {
    ensure_output_dir(path)?;
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or(Utf8Path::new("."));
    let temp = Builder::new()
        .prefix("kira-be-write")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    fs::write(temp.path(), content).map_err(|err| KiraError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    Ok(())
}

fn is_tabular(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    let name = name.strip_suffix(".gz").unwrap_or(&name);
    name.ends_with(".csv") || name.ends_with(".tsv") || name.ends_with(".txt")
}

fn walk_dir(root: &Path) -> Result<Vec<PathBuf>, KiraError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries = fs::read_dir(&path).map_err(|err| KiraError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| KiraError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    Ok(items)
}
