//! Optional robust scaling of numeric output columns.

use serde::Serialize;
use tracing::{debug, info};

use crate::config::ScalingConfig;
use crate::domain::Value;
use crate::merge::{Cell, MergedRow};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnScale {
    pub column: String,
    pub median: f64,
    pub iqr: f64,
    pub values: usize,
}

/// Replaces each numeric value `x` of the configured columns with
/// `(x - median) / IQR`. Missing cells are left missing.
pub fn robust_scale(rows: &mut [MergedRow], config: &ScalingConfig) -> Vec<ColumnScale> {
    if !config.enabled {
        return Vec::new();
    }
    let mut scales = Vec::new();
    for column in &config.fields {
        let mut values: Vec<f64> = rows
            .iter()
            .filter_map(|row| row.cell(column))
            .flat_map(Cell::values)
            .filter_map(Value::as_f64)
            .collect();
        if values.is_empty() {
            debug!(column = %column, "no values to scale");
            continue;
        }
        values.sort_by(f64::total_cmp);
        let median = quantile(&values, 0.5);
        let spread = quantile(&values, 0.75) - quantile(&values, 0.25);
        let iqr = if spread == 0.0 { 1.0 } else { spread };

        for row in rows.iter_mut() {
            let Some(cell) = row.cells.get_mut(column) else {
                continue;
            };
            match cell {
                Cell::Value(value) => scale_value(value, median, iqr),
                Cell::Multi(values) => values
                    .iter_mut()
                    .for_each(|value| scale_value(value, median, iqr)),
                Cell::Missing(_) => {}
            }
        }
        scales.push(ColumnScale {
            column: column.clone(),
            median,
            iqr,
            values: values.len(),
        });
    }
    info!(columns = scales.len(), "robust scaling applied");
    scales
}

fn scale_value(value: &mut Value, median: f64, iqr: f64) {
    if let Some(number) = value.as_f64() {
        *value = Value::Number((number - median) / iqr);
    }
}

/// Linear interpolation between closest ranks over sorted input.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let position = q * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let weight = position - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}
