//! # Feature Engineering
//!
//! Declarative feature generation over the training frame. Each generator
//! appends one column with a self-describing name:
//!
//! - indicator: `I(<base>)` flags from a predicate over the base feature,
//! - threshold: `I(<lower><=<base><=<upper>)` in-range flags,
//! - logarithm: `ln(<base>)` / `log10(<base>)` / `log2(<base>)`,
//! - change: the fixed column `unchanged_yn` comparing two paired features.
//!
//! Because the change column name is fixed, at most one change feature may
//! be requested per run; a second request is rejected before any data is
//! touched. The standard-deviation change method calibrates its tolerance on
//! a leading window of rows, which are then discarded from the usable data.
//!
//! The row-level operations live here too: equality filters that drop rows,
//! pruning of duplicate-merge collision columns, and manual feature
//! removals. Everything returns the names it touched so the orchestrator can
//! extend the processing log.

use log::{debug, info};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rows consumed to estimate the delta spread for an `sd` change feature.
pub const SD_BASELINE_ROWS: usize = 300;

/// Suffix appended by upstream merge tooling to deduplicate column names.
pub const COLLISION_SUFFIX: &str = ".1";

#[derive(Error, Debug)]
pub enum EngineerError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("The base column '{0}' required by an engineered feature was not found.")]
    BaseColumnMissing(String),
    #[error("The base column '{column}' is not numeric. (Found type: {found_type})")]
    BaseColumnType { column: String, found_type: String },
    #[error(
        "At most one change feature may be requested per run; the generated column name is fixed."
    )]
    MultipleChangeFeatures,
    #[error(
        "A standard-deviation change feature needs more than {window} rows; the matrix has {rows}."
    )]
    WindowExceedsRows { window: usize, rows: usize },
    #[error(
        "The leading window contains only {observed} usable delta values; at least 2 are needed to estimate a spread."
    )]
    DegenerateBaseline { observed: usize },
    #[error("The filter column '{0}' was not found.")]
    FilterColumnMissing(String),
}

/// One engineered feature request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FeatureSpec {
    Indicator {
        base: String,
        predicate: IndicatorPredicate,
    },
    Threshold {
        base: String,
        lower: f64,
        upper: f64,
    },
    Logarithm {
        base: String,
        log_base: LogBase,
    },
    Change {
        feature_old: String,
        feature_new: String,
        method: ChangeMethod,
        param: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum IndicatorPredicate {
    /// 1 when the base value is present at all.
    NonNull,
    /// 1 when the base value is strictly positive.
    Positive,
    GreaterThan(f64),
    EqualTo(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogBase {
    Natural,
    Ten,
    Two,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeMethod {
    /// Unchanged when `|new - old| <= param * |old|`.
    Percent,
    /// Unchanged when `|new - old| <= param * sd`, with `sd` estimated on
    /// the leading [`SD_BASELINE_ROWS`] rows, which are then discarded.
    StdDev,
}

/// Drops rows whose feature equals the given value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowFilter {
    pub feature: String,
    pub value: FilterValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterValue {
    Number(f64),
    Text(String),
    Null,
}

/// The engineered training frame plus its bookkeeping.
#[derive(Debug)]
pub struct EngineeredFrame {
    pub frame: DataFrame,
    /// Source-row positions, trimmed in step with any discarded rows.
    pub row_positions: Vec<usize>,
    pub added_features: Vec<String>,
}

/// Rejects catalogs that could not be applied, before any data is touched.
pub fn validate_feature_specs(specs: &[FeatureSpec]) -> Result<(), EngineerError> {
    let change_requests = specs
        .iter()
        .filter(|spec| matches!(spec, FeatureSpec::Change { .. }))
        .count();
    if change_requests > 1 {
        return Err(EngineerError::MultipleChangeFeatures);
    }
    Ok(())
}

/// Applies the feature catalog to the training frame.
pub fn add_features(
    frame: DataFrame,
    row_positions: Vec<usize>,
    specs: &[FeatureSpec],
) -> Result<EngineeredFrame, EngineerError> {
    validate_feature_specs(specs)?;

    let mut frame = frame;
    let mut row_positions = row_positions;
    let mut added_features = Vec::with_capacity(specs.len());
    for spec in specs {
        let name = match spec {
            FeatureSpec::Indicator { base, predicate } => {
                add_indicator(&mut frame, base, predicate)?
            }
            FeatureSpec::Threshold { base, lower, upper } => {
                add_threshold(&mut frame, base, *lower, *upper)?
            }
            FeatureSpec::Logarithm { base, log_base } => {
                add_logarithm(&mut frame, base, *log_base)?
            }
            FeatureSpec::Change {
                feature_old,
                feature_new,
                method,
                param,
            } => match method {
                ChangeMethod::Percent => {
                    add_percent_change(&mut frame, feature_old, feature_new, *param)?
                }
                ChangeMethod::StdDev => {
                    let (trimmed, positions, name) =
                        add_sd_change(frame, row_positions, feature_old, feature_new, *param)?;
                    frame = trimmed;
                    row_positions = positions;
                    name
                }
            },
        };
        added_features.push(name);
    }
    debug!("Added features: {added_features:?}");

    Ok(EngineeredFrame {
        frame,
        row_positions,
        added_features,
    })
}

fn base_values(frame: &DataFrame, base: &str) -> Result<Vec<Option<f64>>, EngineerError> {
    let column = frame
        .column(base)
        .map_err(|_| EngineerError::BaseColumnMissing(base.to_string()))?;
    let casted = column
        .cast(&DataType::Float64)
        .map_err(|_| EngineerError::BaseColumnType {
            column: base.to_string(),
            found_type: format!("{:?}", column.dtype()),
        })?;
    Ok(casted.f64()?.into_iter().collect())
}

fn add_indicator(
    frame: &mut DataFrame,
    base: &str,
    predicate: &IndicatorPredicate,
) -> Result<String, EngineerError> {
    let name = format!("I({base})");
    let flags: Vec<f64> = match predicate {
        IndicatorPredicate::NonNull => {
            let column = frame
                .column(base)
                .map_err(|_| EngineerError::BaseColumnMissing(base.to_string()))?;
            let mut flags = Vec::with_capacity(frame.height());
            for row in 0..frame.height() {
                let present = !matches!(column.get(row)?, AnyValue::Null);
                flags.push(present as u8 as f64);
            }
            flags
        }
        IndicatorPredicate::Positive => base_values(frame, base)?
            .into_iter()
            .map(|value| matches!(value, Some(v) if v > 0.0) as u8 as f64)
            .collect(),
        IndicatorPredicate::GreaterThan(threshold) => base_values(frame, base)?
            .into_iter()
            .map(|value| matches!(value, Some(v) if v > *threshold) as u8 as f64)
            .collect(),
        IndicatorPredicate::EqualTo(target) => base_values(frame, base)?
            .into_iter()
            .map(|value| matches!(value, Some(v) if v == *target) as u8 as f64)
            .collect(),
    };
    frame.with_column(Series::new(name.as_str().into(), flags))?;
    Ok(name)
}

fn add_threshold(
    frame: &mut DataFrame,
    base: &str,
    lower: f64,
    upper: f64,
) -> Result<String, EngineerError> {
    let name = format!("I({lower}<={base}<={upper})");
    let flags: Vec<Option<f64>> = base_values(frame, base)?
        .into_iter()
        .map(|value| value.map(|v| (lower <= v && v <= upper) as u8 as f64))
        .collect();
    frame.with_column(Series::new(name.as_str().into(), flags))?;
    Ok(name)
}

fn add_logarithm(
    frame: &mut DataFrame,
    base: &str,
    log_base: LogBase,
) -> Result<String, EngineerError> {
    let name = match log_base {
        LogBase::Natural => format!("ln({base})"),
        LogBase::Ten => format!("log10({base})"),
        LogBase::Two => format!("log2({base})"),
    };
    let values: Vec<Option<f64>> = base_values(frame, base)?
        .into_iter()
        .map(|value| {
            value.and_then(|v| {
                if v > 0.0 {
                    Some(match log_base {
                        LogBase::Natural => v.ln(),
                        LogBase::Ten => v.log10(),
                        LogBase::Two => v.log2(),
                    })
                } else {
                    None
                }
            })
        })
        .collect();
    frame.with_column(Series::new(name.as_str().into(), values))?;
    Ok(name)
}

fn paired_deltas(
    frame: &DataFrame,
    feature_old: &str,
    feature_new: &str,
) -> Result<Vec<Option<(f64, f64)>>, EngineerError> {
    let old = base_values(frame, feature_old)?;
    let new = base_values(frame, feature_new)?;
    Ok(old
        .into_iter()
        .zip(new)
        .map(|pair| match pair {
            (Some(old), Some(new)) => Some((old, new)),
            _ => None,
        })
        .collect())
}

fn add_percent_change(
    frame: &mut DataFrame,
    feature_old: &str,
    feature_new: &str,
    param: f64,
) -> Result<String, EngineerError> {
    let flags: Vec<Option<f64>> = paired_deltas(frame, feature_old, feature_new)?
        .into_iter()
        .map(|pair| {
            pair.map(|(old, new)| ((new - old).abs() <= param * old.abs()) as u8 as f64)
        })
        .collect();
    let name = "unchanged_yn".to_string();
    frame.with_column(Series::new(name.as_str().into(), flags))?;
    Ok(name)
}

fn add_sd_change(
    frame: DataFrame,
    row_positions: Vec<usize>,
    feature_old: &str,
    feature_new: &str,
    param: f64,
) -> Result<(DataFrame, Vec<usize>, String), EngineerError> {
    let rows = frame.height();
    if rows <= SD_BASELINE_ROWS {
        return Err(EngineerError::WindowExceedsRows {
            window: SD_BASELINE_ROWS,
            rows,
        });
    }

    let deltas: Vec<Option<f64>> = paired_deltas(&frame, feature_old, feature_new)?
        .into_iter()
        .map(|pair| pair.map(|(old, new)| new - old))
        .collect();

    let baseline: Vec<f64> = deltas[..SD_BASELINE_ROWS]
        .iter()
        .copied()
        .flatten()
        .collect();
    if baseline.len() < 2 {
        return Err(EngineerError::DegenerateBaseline {
            observed: baseline.len(),
        });
    }
    let mean = baseline.iter().sum::<f64>() / baseline.len() as f64;
    let variance = baseline
        .iter()
        .map(|delta| (delta - mean).powi(2))
        .sum::<f64>()
        / (baseline.len() - 1) as f64;
    let sd = variance.sqrt();
    info!(
        "Calibrated change tolerance on {} leading rows (sd {:.4}); discarding the window.",
        SD_BASELINE_ROWS, sd
    );

    let flags: Vec<Option<f64>> = deltas[SD_BASELINE_ROWS..]
        .iter()
        .map(|delta| delta.map(|d| (d.abs() <= param * sd) as u8 as f64))
        .collect();

    let mut trimmed = frame.slice(SD_BASELINE_ROWS as i64, rows - SD_BASELINE_ROWS);
    let name = "unchanged_yn".to_string();
    trimmed.with_column(Series::new(name.as_str().into(), flags))?;
    let mut row_positions = row_positions;
    let kept_positions = row_positions.split_off(SD_BASELINE_ROWS);

    Ok((trimmed, kept_positions, name))
}

/// Drops rows whose feature equals the filter value, keeping the row
/// bookkeeping in step.
pub fn filter_rows(
    frame: DataFrame,
    row_positions: Vec<usize>,
    filters: &[RowFilter],
) -> Result<(DataFrame, Vec<usize>), EngineerError> {
    let mut frame = frame;
    let mut row_positions = row_positions;
    for filter in filters {
        if !frame
            .get_column_names()
            .iter()
            .any(|name| name.as_str() == filter.feature)
        {
            return Err(EngineerError::FilterColumnMissing(filter.feature.clone()));
        }
        let column = frame.column(&filter.feature)?;
        let mut keep = Vec::with_capacity(frame.height());
        for row in 0..frame.height() {
            keep.push(!matches_filter(&column.get(row)?, &filter.value));
        }
        let mask: BooleanChunked = keep.iter().map(|&flag| Some(flag)).collect();
        let filtered = frame.filter(&mask)?;
        row_positions = row_positions
            .iter()
            .zip(&keep)
            .filter_map(|(&position, &kept)| kept.then_some(position))
            .collect();
        debug!(
            "Removed rows where {} equals '{:?}'; {} rows remain.",
            filter.feature,
            filter.value,
            filtered.height()
        );
        frame = filtered;
    }
    Ok((frame, row_positions))
}

fn matches_filter(value: &AnyValue, target: &FilterValue) -> bool {
    match target {
        FilterValue::Null => matches!(value, AnyValue::Null),
        FilterValue::Number(x) => match value {
            AnyValue::Float64(v) => v == x,
            AnyValue::Float32(v) => f64::from(*v) == *x,
            AnyValue::Int64(v) => *v as f64 == *x,
            AnyValue::Int32(v) => f64::from(*v) == *x,
            _ => false,
        },
        FilterValue::Text(t) => match value {
            AnyValue::String(s) => s == t,
            AnyValue::StringOwned(s) => s.as_str() == t,
            _ => false,
        },
    }
}

/// Drops every column carrying the duplicate-merge collision suffix.
pub fn prune_collision_columns(
    frame: DataFrame,
) -> Result<(DataFrame, Vec<String>), EngineerError> {
    let degenerate: Vec<String> = frame
        .get_column_names()
        .iter()
        .filter(|name| name.ends_with(COLLISION_SUFFIX))
        .map(|name| name.to_string())
        .collect();
    let mut frame = frame;
    for name in &degenerate {
        frame = frame.drop(name)?;
    }
    if !degenerate.is_empty() {
        info!("Pruned duplicate-merge collision columns: {degenerate:?}");
    }
    Ok((frame, degenerate))
}

/// Drops manually identified low-information features.
///
/// Names that are not present are skipped with a debug note instead of
/// failing the run.
pub fn remove_features(
    frame: DataFrame,
    features: &[String],
) -> Result<(DataFrame, Vec<String>), EngineerError> {
    let mut frame = frame;
    let mut removed = Vec::new();
    for name in features {
        let present = frame
            .get_column_names()
            .iter()
            .any(|column| column.as_str() == name.as_str());
        if present {
            frame = frame.drop(name)?;
            removed.push(name.clone());
        } else {
            debug!("Feature '{name}' requested for removal is not present; skipping.");
        }
    }
    Ok((frame, removed))
}
