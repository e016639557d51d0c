//! Static key equivalences between sources.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use camino::Utf8Path;
use csv::{ReaderBuilder, Trim};
use regex::Regex;
use tracing::debug;

use crate::config::CrosswalkSpec;
use crate::domain::SourceId;
use crate::error::KiraError;
use crate::normalize::{is_missing, normalize_key};

/// Label used for links derived from TCGA barcode structure.
pub const TCGA_BARCODE_ORIGIN: &str = "tcga-barcode";

/// TCGA sample/aliquot barcode; group 1 is the patient barcode.
static TCGA_SAMPLE_BARCODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(TCGA-[A-Z0-9]{2}-[A-Z0-9]{4})-[0-9]{2}[A-Z]?(-.*)?$").expect("hardcoded regex")
});

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CrosswalkLink {
    pub from_key: String,
    pub to_key: String,
}

/// Key links between two sources. A link applies only when `from_key` was
/// reported by `from_source` and `to_key` by `to_source`; the derived TCGA
/// barcode table is exempt.
#[derive(Debug, Clone, PartialEq)]
pub struct CrosswalkTable {
    pub origin: String,
    pub from_source: SourceId,
    pub to_source: SourceId,
    pub links: Vec<CrosswalkLink>,
}

impl CrosswalkTable {
    /// Reads a `from_key,to_key` CSV. Keys are normalized like subject keys.
    pub fn load(spec: &CrosswalkSpec) -> Result<Self, KiraError> {
        let links = read_links(&spec.path)?;
        debug!(
            path = %spec.path,
            from = %spec.from_source,
            to = %spec.to_source,
            links = links.len(),
            "crosswalk loaded"
        );
        Ok(Self {
            origin: spec.path.to_string(),
            from_source: spec.from_source,
            to_source: spec.to_source,
            links,
        })
    }

    pub fn load_all(specs: &[CrosswalkSpec]) -> Result<Vec<Self>, KiraError> {
        specs.iter().map(Self::load).collect()
    }

    /// Links every TCGA sample barcode in `keys` to its patient barcode.
    pub fn tcga_barcodes<'k>(keys: impl IntoIterator<Item = &'k str>) -> Self {
        let links: BTreeSet<CrosswalkLink> = keys
            .into_iter()
            .filter_map(|key| {
                let patient = TCGA_SAMPLE_BARCODE.captures(key)?.get(1)?.as_str();
                Some(CrosswalkLink {
                    from_key: key.to_string(),
                    to_key: patient.to_string(),
                })
            })
            .collect();
        Self {
            origin: TCGA_BARCODE_ORIGIN.to_string(),
            from_source: SourceId::Tcga,
            to_source: SourceId::Tcga,
            links: links.into_iter().collect(),
        }
    }
}

fn read_links(path: &Utf8Path) -> Result<Vec<CrosswalkLink>, KiraError> {
    let fail = |message: String| KiraError::Crosswalk {
        path: path.to_string(),
        message,
    };
    let mut reader = ReaderBuilder::new()
        .trim(Trim::All)
        .from_path(path.as_std_path())
        .map_err(|err| fail(err.to_string()))?;
    let headers = reader.headers().map_err(|err| fail(err.to_string()))?.clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|header| header.eq_ignore_ascii_case(name))
            .ok_or_else(|| fail(format!("missing {name} column")))
    };
    let (from, to) = (column("from_key")?, column("to_key")?);

    let mut links = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| fail(err.to_string()))?;
        match (record.get(from), record.get(to)) {
            (Some(from_key), Some(to_key)) if !is_missing(from_key) && !is_missing(to_key) => {
                links.push(CrosswalkLink {
                    from_key: normalize_key(from_key),
                    to_key: normalize_key(to_key),
                });
            }
            _ => {
                let line = record.position().map(|pos| pos.line()).unwrap_or(0);
                debug!(path = %path, line, "crosswalk row without both keys skipped");
            }
        }
    }
    links.sort();
    links.dedup();
    Ok(links)
}
