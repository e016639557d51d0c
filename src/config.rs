use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::domain::{Modality, SourceId};
use crate::error::KiraError;

pub const DEFAULT_CONFIG_FILE: &str = "kira-be.json";
pub const DEFAULT_FUZZY_THRESHOLD: f64 = 0.9;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub strict_source_requirement: Option<bool>,
    #[serde(default)]
    pub fuzzy_match_threshold: Option<f64>,
    #[serde(default)]
    pub source_priority_order: Option<Vec<String>>,
    #[serde(default)]
    pub modality_priority: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub field_priority: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub fuzzy_modality_pairs: Option<Vec<ModalityPairEntry>>,
    #[serde(default)]
    pub crosswalks: Vec<CrosswalkEntry>,
    #[serde(default)]
    pub manifest: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub diagnostics: Option<String>,
    #[serde(default)]
    pub emit_provenance: Option<bool>,
    #[serde(default)]
    pub scaling: Option<ScalingEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ModalityPairEntry {
    Shorthand(String),
    Detailed(ModalityPairObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ModalityPairObject {
    pub left: String,
    pub right: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CrosswalkEntry {
    pub path: String,
    pub from_source: String,
    pub to_source: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ScalingEntry {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub fields: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CrosswalkSpec {
    pub path: Utf8PathBuf,
    pub from_source: SourceId,
    pub to_source: SourceId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScalingConfig {
    pub enabled: bool,
    pub fields: Vec<String>,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            fields: default_scaled_fields(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputPaths {
    pub manifest: Utf8PathBuf,
    pub output: Utf8PathBuf,
    pub diagnostics: Utf8PathBuf,
}

impl Default for OutputPaths {
    fn default() -> Self {
        Self {
            manifest: Utf8PathBuf::from("data/manifest.json"),
            output: Utf8PathBuf::from("results/brain_cancer_etl.csv"),
            diagnostics: Utf8PathBuf::from("results/brain_cancer_etl.diagnostics.json"),
        }
    }
}

/// Conflict-resolution ranking. Lower rank wins; unlisted sources tie last.
#[derive(Debug, Clone, PartialEq)]
pub struct SourcePriority {
    pub global: Vec<SourceId>,
    pub by_modality: BTreeMap<Modality, Vec<SourceId>>,
    pub by_field: BTreeMap<String, Vec<SourceId>>,
}

impl Default for SourcePriority {
    fn default() -> Self {
        Self {
            global: default_source_priority(),
            by_modality: BTreeMap::new(),
            by_field: BTreeMap::new(),
        }
    }
}

impl SourcePriority {
    pub fn order_for(&self, column: &str, modality: Modality) -> &[SourceId] {
        self.by_field
            .get(column)
            .or_else(|| self.by_modality.get(&modality))
            .unwrap_or(&self.global)
    }

    pub fn rank(&self, column: &str, modality: Modality, source: SourceId) -> usize {
        let order = self.order_for(column, modality);
        order
            .iter()
            .position(|candidate| *candidate == source)
            .unwrap_or(order.len())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub schema_version: u32,
    pub strict_source_requirement: bool,
    pub fuzzy_match_threshold: f64,
    pub priority: SourcePriority,
    pub fuzzy_modality_pairs: BTreeSet<(Modality, Modality)>,
    pub crosswalks: Vec<CrosswalkSpec>,
    pub paths: OutputPaths,
    pub emit_provenance: bool,
    pub scaling: ScalingConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            schema_version: 1,
            strict_source_requirement: false,
            fuzzy_match_threshold: DEFAULT_FUZZY_THRESHOLD,
            priority: SourcePriority::default(),
            fuzzy_modality_pairs: default_fuzzy_pairs(),
            crosswalks: Vec::new(),
            paths: OutputPaths::default(),
            emit_provenance: false,
            scaling: ScalingConfig::default(),
        }
    }
}

impl RunConfig {
    pub fn allows_fuzzy(&self, left: Modality, right: Modality) -> bool {
        self.fuzzy_modality_pairs.contains(&ordered_pair(left, right))
    }

    pub fn provenance_path(&self) -> Utf8PathBuf {
        self.paths.output.with_extension("provenance.json")
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads `kira-be.json` (or `path`). Without an explicit path a missing
    /// default file falls back to built-in defaults.
    pub fn resolve(path: Option<&str>) -> Result<RunConfig, KiraError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            tracing::debug!("no {DEFAULT_CONFIG_FILE} found, using defaults");
            return Ok(RunConfig::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| KiraError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| KiraError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<RunConfig, KiraError> {
        let defaults = RunConfig::default();
        let schema_version = config.schema_version.unwrap_or(1);

        let fuzzy_match_threshold = config
            .fuzzy_match_threshold
            .unwrap_or(DEFAULT_FUZZY_THRESHOLD);
        if !(fuzzy_match_threshold > 0.0 && fuzzy_match_threshold <= 1.0) {
            return Err(KiraError::InvalidConfig(format!(
                "fuzzy_match_threshold must be in (0, 1], got {fuzzy_match_threshold}"
            )));
        }

        let global = match config.source_priority_order {
            Some(order) => parse_source_order("source_priority_order", &order)?,
            None => default_source_priority(),
        };

        let by_modality = config
            .modality_priority
            .iter()
            .map(|(modality, order)| {
                Ok((
                    modality.parse::<Modality>()?,
                    parse_source_order(modality, order)?,
                ))
            })
            .collect::<Result<BTreeMap<_, _>, KiraError>>()?;

        let by_field = config
            .field_priority
            .iter()
            .map(|(column, order)| {
                let valid_column = column
                    .split_once('.')
                    .map(|(modality, name)| modality.parse::<Modality>().is_ok() && !name.is_empty())
                    .unwrap_or(false);
                if !valid_column {
                    return Err(KiraError::InvalidConfig(format!(
                        "field_priority key must be <modality>.<field>, got {column}"
                    )));
                }
                Ok((column.clone(), parse_source_order(column, order)?))
            })
            .collect::<Result<BTreeMap<_, _>, KiraError>>()?;

        let fuzzy_modality_pairs = match config.fuzzy_modality_pairs {
            Some(entries) => entries
                .into_iter()
                .map(|entry| {
                    let (left, right) = match entry {
                        ModalityPairEntry::Shorthand(value) => {
                            let (left, right) = value.split_once(':').ok_or_else(|| {
                                KiraError::InvalidConfig(format!(
                                    "modality pair must be <left>:<right>, got {value}"
                                ))
                            })?;
                            (left.parse::<Modality>()?, right.parse::<Modality>()?)
                        }
                        ModalityPairEntry::Detailed(obj) => {
                            (obj.left.parse::<Modality>()?, obj.right.parse::<Modality>()?)
                        }
                    };
                    Ok(ordered_pair(left, right))
                })
                .collect::<Result<BTreeSet<_>, KiraError>>()?,
            None => default_fuzzy_pairs(),
        };

        let crosswalks = config
            .crosswalks
            .into_iter()
            .map(|entry| {
                Ok(CrosswalkSpec {
                    path: Utf8PathBuf::from(entry.path),
                    from_source: entry.from_source.parse()?,
                    to_source: entry.to_source.parse()?,
                })
            })
            .collect::<Result<Vec<_>, KiraError>>()?;

        let paths = OutputPaths {
            manifest: config
                .manifest
                .map(Utf8PathBuf::from)
                .unwrap_or(defaults.paths.manifest),
            output: config
                .output
                .map(Utf8PathBuf::from)
                .unwrap_or(defaults.paths.output),
            diagnostics: config
                .diagnostics
                .map(Utf8PathBuf::from)
                .unwrap_or(defaults.paths.diagnostics),
        };

        let scaling = match config.scaling {
            Some(entry) => ScalingConfig {
                enabled: entry.enabled,
                fields: entry.fields.unwrap_or_else(default_scaled_fields),
            },
            None => ScalingConfig::default(),
        };

        Ok(RunConfig {
            schema_version,
            strict_source_requirement: config.strict_source_requirement.unwrap_or(false),
            fuzzy_match_threshold,
            priority: SourcePriority {
                global,
                by_modality,
                by_field,
            },
            fuzzy_modality_pairs,
            crosswalks,
            paths,
            emit_provenance: config.emit_provenance.unwrap_or(false),
            scaling,
        })
    }
}

fn parse_source_order(context: &str, order: &[String]) -> Result<Vec<SourceId>, KiraError> {
    let mut seen = BTreeSet::new();
    let mut parsed = Vec::with_capacity(order.len());
    for value in order {
        let id: SourceId = value.parse()?;
        if !seen.insert(id) {
            return Err(KiraError::InvalidConfig(format!(
                "{context}: source {id} listed twice"
            )));
        }
        parsed.push(id);
    }
    Ok(parsed)
}

fn ordered_pair(left: Modality, right: Modality) -> (Modality, Modality) {
    if left <= right {
        (left, right)
    } else {
        (right, left)
    }
}

pub fn default_source_priority() -> Vec<SourceId> {
    vec![
        SourceId::Tcga,
        SourceId::Cptac,
        SourceId::Geo,
        SourceId::Tcia,
        SourceId::Pride,
        SourceId::Nhanes,
    ]
}

/// Survey respondents are never linked to tumour cohorts by similarity.
pub fn default_fuzzy_pairs() -> BTreeSet<(Modality, Modality)> {
    let clinical = [
        Modality::Genomic,
        Modality::Transcriptomic,
        Modality::Proteomic,
        Modality::Imaging,
    ];
    let mut pairs = BTreeSet::new();
    for (i, left) in clinical.iter().enumerate() {
        for right in &clinical[i + 1..] {
            pairs.insert(ordered_pair(*left, *right));
        }
    }
    pairs
}

pub fn default_scaled_fields() -> Vec<String> {
    [
        "genomic.age_at_diagnosis",
        "proteomic.tp53_abundance",
        "proteomic.vegfa_abundance",
        "proteomic.il6_abundance",
        "imaging.tumor_ratio",
        "imaging.necrosis_ratio",
        "imaging.inflammation",
        "survey.wbc",
        "survey.rbc",
        "survey.hemoglobin",
    ]
    .iter()
    .map(|field| field.to_string())
    .collect()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn defaults_from_empty_config() {
        let resolved = ConfigLoader::resolve_config(Config::default()).unwrap();
        assert_eq!(resolved, RunConfig::default());
        assert!(!resolved.strict_source_requirement);
        assert_eq!(resolved.fuzzy_match_threshold, 0.9);
        assert!(resolved.allows_fuzzy(Modality::Imaging, Modality::Genomic));
        assert!(!resolved.allows_fuzzy(Modality::Survey, Modality::Genomic));
    }

    #[test]
    fn rejects_duplicate_priority() {
        let config = Config {
            source_priority_order: Some(vec!["tcga".to_string(), "TCGA".to_string()]),
            ..Config::default()
        };
        let err = ConfigLoader::resolve_config(config).unwrap_err();
        assert_matches!(err, KiraError::InvalidConfig(_));
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let config = Config {
            fuzzy_match_threshold: Some(1.5),
            ..Config::default()
        };
        assert_matches!(
            ConfigLoader::resolve_config(config),
            Err(KiraError::InvalidConfig(_))
        );
    }

    #[test]
    fn field_priority_overrides_modality_and_global() {
        let config: Config = serde_json::from_str(
            r#"{
                "source_priority_order": ["geo", "tcga"],
                "modality_priority": {"proteomic": ["pride", "cptac"]},
                "field_priority": {"proteomic.tp53_abundance": ["cptac"]}
            }"#,
        )
        .unwrap();
        let resolved = ConfigLoader::resolve_config(config).unwrap();
        let priority = &resolved.priority;
        assert_eq!(
            priority.rank("transcriptomic.histology", Modality::Transcriptomic, SourceId::Geo),
            0
        );
        assert_eq!(
            priority.rank("proteomic.il6_abundance", Modality::Proteomic, SourceId::Pride),
            0
        );
        assert_eq!(
            priority.rank("proteomic.tp53_abundance", Modality::Proteomic, SourceId::Cptac),
            0
        );
        assert_eq!(
            priority.rank("proteomic.tp53_abundance", Modality::Proteomic, SourceId::Pride),
            1
        );
    }

    #[test]
    fn parses_modality_pair_shorthand() {
        let config: Config =
            serde_json::from_str(r#"{"fuzzy_modality_pairs": ["imaging:genomic"]}"#).unwrap();
        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.fuzzy_modality_pairs.len(), 1);
        assert!(resolved.allows_fuzzy(Modality::Genomic, Modality::Imaging));
        assert!(!resolved.allows_fuzzy(Modality::Genomic, Modality::Proteomic));
    }
}
