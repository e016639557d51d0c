use std::fs::File;
use std::io::{BufReader, Read};

use camino::Utf8Path;
use csv::{ReaderBuilder, Trim};
use flate2::read::GzDecoder;

use crate::error::KiraError;

/// File name with any trailing `.gz` removed, lower-cased for pattern checks.
pub fn artifact_name(path: &Utf8Path) -> String {
    let name = path.file_name().unwrap_or(path.as_str()).to_ascii_lowercase();
    name.strip_suffix(".gz").unwrap_or(&name).to_string()
}

/// Name used in raw locators; keeps the original casing.
pub fn locator_name(path: &Utf8Path) -> &str {
    path.file_name().unwrap_or(path.as_str())
}

pub fn is_gzip(path: &Utf8Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("gz"))
        .unwrap_or(false)
}

pub fn artifact_delimiter(path: &Utf8Path) -> u8 {
    let name = artifact_name(path);
    if name.ends_with(".tsv") || name.ends_with(".txt") {
        b'\t'
    } else {
        b','
    }
}

pub fn open_artifact(path: &Utf8Path) -> Result<Box<dyn Read + Send>, KiraError> {
    let file = File::open(path.as_std_path())
        .map_err(|err| KiraError::parse(locator_name(path), format!("open artifact: {err}")))?;
    let reader = BufReader::new(file);
    if is_gzip(path) {
        Ok(Box::new(GzDecoder::new(reader)))
    } else {
        Ok(Box::new(reader))
    }
}

pub fn tabular_reader(path: &Utf8Path) -> Result<csv::Reader<Box<dyn Read + Send>>, KiraError> {
    let source = open_artifact(path)?;
    Ok(ReaderBuilder::new()
        .delimiter(artifact_delimiter(path))
        .flexible(true)
        .trim(Trim::All)
        .from_reader(source))
}
