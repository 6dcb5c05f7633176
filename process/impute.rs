//! # Missing-Value Imputation
//!
//! Fill statistics are computed on the training partition only and written
//! into an [`ImputationRecord`], an append-once log that is later replayed
//! verbatim onto the test partition. Test-side statistics are never
//! computed; a test-only null is filled with the training value recorded
//! for that feature.
//!
//! Two plans exist and are mutually exclusive by construction:
//!
//! - [`ImputationPlan::PerFeature`] (default) walks each feature, applying
//!   an override method where one is configured and the training mean
//!   otherwise. Features with no nulls still get their mean recorded so a
//!   test-only null has a fill to fall back on.
//! - [`ImputationPlan::WholeFrame`] computes training means for every
//!   numeric feature in one pass and applies them to both partitions
//!   immediately. Overrides do not exist in this plan.
//!
//! Fully null features cannot be filled and are dropped instead, with the
//! removal reported back for the processing log.

use std::collections::BTreeMap;

use log::debug;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImputeError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
}

/// How a single feature's nulls are filled under the per-feature plan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ImputationMethod {
    Mean,
    Median,
    /// Most frequent value; ties resolve to the smallest.
    Mode,
    Zero,
    Constant(f64),
}

/// The imputation strategy for a run. The variants are mutually exclusive;
/// there is no way to combine per-feature overrides with the whole-frame
/// pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ImputationPlan {
    PerFeature {
        overrides: BTreeMap<String, ImputationMethod>,
    },
    WholeFrame,
}

impl Default for ImputationPlan {
    fn default() -> Self {
        Self::PerFeature {
            overrides: BTreeMap::new(),
        }
    }
}

/// The fills applied to the training partition, keyed by feature name.
///
/// Entries are only written while the training partition is processed;
/// afterwards the record is read-only and is replayed onto the test
/// partition via [`apply_record`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImputationRecord {
    fills: BTreeMap<String, f64>,
}

impl ImputationRecord {
    fn insert(&mut self, feature: String, fill: f64) {
        self.fills.insert(feature, fill);
    }

    pub fn fill(&self, feature: &str) -> Option<f64> {
        self.fills.get(feature).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.fills.iter()
    }

    pub fn len(&self) -> usize {
        self.fills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fills.is_empty()
    }
}

/// Both partitions after imputation, plus the record and any dropped
/// features.
#[derive(Debug)]
pub struct ImputationOutcome {
    pub train: DataFrame,
    pub test: DataFrame,
    pub record: ImputationRecord,
    pub removed_features: Vec<String>,
}

/// Imputes the training partition per the plan.
///
/// Under the whole-frame plan the test partition is filled here as well;
/// under the per-feature plan it is returned untouched and the caller
/// replays the record once the test columns are aligned.
pub fn impute(
    plan: &ImputationPlan,
    train: DataFrame,
    test: DataFrame,
    grouping_column: &str,
    outcome_column: &str,
) -> Result<ImputationOutcome, ImputeError> {
    let (overrides, fill_test_now) = match plan {
        ImputationPlan::PerFeature { overrides } => (Some(overrides), false),
        ImputationPlan::WholeFrame => (None, true),
    };

    let mut train = train;
    let mut record = ImputationRecord::default();
    let mut removed_features = Vec::new();

    let names: Vec<String> = train
        .get_column_names()
        .iter()
        .map(|name| name.to_string())
        .collect();
    for name in &names {
        if name == grouping_column || name == outcome_column {
            continue;
        }
        let column = train.column(name)?;
        if !is_numeric(column.dtype()) {
            if column.null_count() > 0 {
                debug!(
                    "Feature '{name}' is not numeric ({:?}); leaving its nulls in place.",
                    column.dtype()
                );
            }
            continue;
        }
        let values: Vec<Option<f64>> = column.cast(&DataType::Float64)?.f64()?.into_iter().collect();
        let observed: Vec<f64> = values.iter().copied().flatten().collect();
        if observed.is_empty() {
            train = train.drop(name)?;
            removed_features.push(name.clone());
            debug!("Feature '{name}' is entirely null in the training partition; dropping it.");
            continue;
        }
        let method = overrides
            .and_then(|map| map.get(name))
            .copied()
            .unwrap_or(ImputationMethod::Mean);
        record.insert(name.clone(), resolve_fill(method, &observed));
    }

    let train = apply_record(&record, train)?;
    let test = if fill_test_now {
        apply_record(&record, test)?
    } else {
        test
    };

    Ok(ImputationOutcome {
        train,
        test,
        record,
        removed_features,
    })
}

/// Replays recorded fills onto a frame. Features absent from the frame are
/// skipped, as are features the record knows but the frame holds in a
/// non-numeric shape.
pub fn apply_record(
    record: &ImputationRecord,
    frame: DataFrame,
) -> Result<DataFrame, ImputeError> {
    let mut frame = frame;
    for (name, &fill) in record.iter() {
        let Ok(column) = frame.column(name) else {
            continue;
        };
        if column.null_count() == 0 {
            continue;
        }
        let Ok(casted) = column.cast(&DataType::Float64) else {
            debug!("Recorded fill for '{name}' does not apply; the column is not numeric.");
            continue;
        };
        let filled: Vec<f64> = casted
            .f64()?
            .into_iter()
            .map(|value| value.unwrap_or(fill))
            .collect();
        frame.with_column(Series::new(name.as_str().into(), filled))?;
    }
    Ok(frame)
}

/// Drops features that remain entirely null, regardless of dtype.
pub fn drop_all_null_columns(
    frame: DataFrame,
    skip: &[&str],
) -> Result<(DataFrame, Vec<String>), ImputeError> {
    let mut frame = frame;
    let doomed: Vec<String> = frame
        .get_columns()
        .iter()
        .filter(|column| {
            let name = column.name().as_str();
            !skip.contains(&name) && column.len() > 0 && column.null_count() == column.len()
        })
        .map(|column| column.name().to_string())
        .collect();
    for name in &doomed {
        frame = frame.drop(name)?;
    }
    if !doomed.is_empty() {
        debug!("Dropped still-empty features after imputation: {doomed:?}");
    }
    Ok((frame, doomed))
}

fn is_numeric(dtype: &DataType) -> bool {
    matches!(
        dtype,
        DataType::Float64
            | DataType::Float32
            | DataType::Int64
            | DataType::Int32
            | DataType::UInt64
            | DataType::UInt32
    )
}

fn resolve_fill(method: ImputationMethod, observed: &[f64]) -> f64 {
    match method {
        ImputationMethod::Mean => mean(observed),
        ImputationMethod::Median => median(observed),
        ImputationMethod::Mode => mode(observed),
        ImputationMethod::Zero => 0.0,
        ImputationMethod::Constant(value) => value,
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    }
}

fn mode(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mut best = sorted[0];
    let mut best_count = 0usize;
    let mut run_value = sorted[0];
    let mut run_count = 0usize;
    for &value in &sorted {
        if value == run_value {
            run_count += 1;
        } else {
            run_value = value;
            run_count = 1;
        }
        if run_count > best_count {
            best_count = run_count;
            best = run_value;
        }
    }
    best
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use crate::matrix;

    fn train_frame() -> DataFrame {
        DataFrame::new(vec![
            Series::new("pat_id".into(), vec![1i64, 1, 2, 3]).into(),
            Series::new("label".into(), vec![0.0f64, 1.0, 0.0, 1.0]).into(),
            Series::new("CRP".into(), vec![Some(1.0f64), Some(2.0), None, Some(4.0)]).into(),
            Series::new("ghost".into(), vec![None::<f64>, None, None, None]).into(),
            Series::new("WBC".into(), vec![5.0f64, 6.0, 7.0, 8.0]).into(),
        ])
        .unwrap()
    }

    fn test_frame() -> DataFrame {
        DataFrame::new(vec![
            Series::new("pat_id".into(), vec![4i64, 5]).into(),
            Series::new("CRP".into(), vec![None::<f64>, Some(9.0)]).into(),
            Series::new("WBC".into(), vec![Some(1.0f64), None]).into(),
        ])
        .unwrap()
    }

    #[test]
    fn per_feature_fills_with_training_means() {
        let plan = ImputationPlan::default();
        let outcome = impute(&plan, train_frame(), test_frame(), "pat_id", "label").unwrap();

        let crp = matrix::numeric_column(&outcome.train, "CRP").unwrap();
        assert_abs_diff_eq!(crp[2], 7.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(outcome.record.fill("CRP").unwrap(), 7.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn nan_cells_receive_the_training_mean() {
        let frame = DataFrame::new(vec![
            Series::new("CRP".into(), vec![Some(1.0f64), Some(f64::NAN), None, Some(2.0)]).into(),
        ])
        .unwrap();
        let normalized = matrix::nan_to_null(frame).unwrap();
        let empty = DataFrame::new(vec![]).unwrap();
        let outcome =
            impute(&ImputationPlan::default(), normalized, empty, "pat_id", "label").unwrap();

        // The fill averages the finite values only.
        assert_abs_diff_eq!(outcome.record.fill("CRP").unwrap(), 1.5);
        let crp = matrix::numeric_column(&outcome.train, "CRP").unwrap();
        assert_eq!(crp, vec![1.0, 1.5, 1.5, 2.0]);

        let held_out = DataFrame::new(vec![
            Series::new("CRP".into(), vec![None::<f64>, Some(9.0)]).into(),
        ])
        .unwrap();
        let replayed = apply_record(&outcome.record, held_out).unwrap();
        let filled = matrix::numeric_column(&replayed, "CRP").unwrap();
        assert_abs_diff_eq!(filled[0], 1.5);
    }

    #[test]
    fn fully_observed_features_still_get_a_recorded_fill() {
        let plan = ImputationPlan::default();
        let outcome = impute(&plan, train_frame(), test_frame(), "pat_id", "label").unwrap();

        // WBC has no training nulls, yet its mean is on record for any
        // test-only nulls.
        assert_abs_diff_eq!(outcome.record.fill("WBC").unwrap(), 6.5);
        let wbc = matrix::numeric_column(&outcome.train, "WBC").unwrap();
        assert_eq!(wbc, vec![5.0, 6.0, 7.0, 8.0]);
    }

    #[test]
    fn entirely_null_features_are_dropped_not_filled() {
        let plan = ImputationPlan::default();
        let outcome = impute(&plan, train_frame(), test_frame(), "pat_id", "label").unwrap();

        assert!(outcome.train.column("ghost").is_err());
        assert_eq!(outcome.removed_features, vec!["ghost".to_string()]);
        assert!(outcome.record.fill("ghost").is_none());
    }

    #[test]
    fn grouping_and_outcome_columns_are_never_recorded() {
        let plan = ImputationPlan::default();
        let outcome = impute(&plan, train_frame(), test_frame(), "pat_id", "label").unwrap();

        assert!(outcome.record.fill("pat_id").is_none());
        assert!(outcome.record.fill("label").is_none());
    }

    #[test]
    fn per_feature_plan_leaves_the_test_partition_untouched() {
        let plan = ImputationPlan::default();
        let outcome = impute(&plan, train_frame(), test_frame(), "pat_id", "label").unwrap();

        assert_eq!(outcome.test.column("CRP").unwrap().null_count(), 1);
        assert_eq!(outcome.test.column("WBC").unwrap().null_count(), 1);
    }

    #[test]
    fn whole_frame_plan_fills_both_partitions_with_training_means() {
        let outcome = impute(
            &ImputationPlan::WholeFrame,
            train_frame(),
            test_frame(),
            "pat_id",
            "label",
        )
        .unwrap();

        assert_eq!(outcome.train.column("CRP").unwrap().null_count(), 0);
        let test_crp = matrix::numeric_column(&outcome.test, "CRP").unwrap();
        // The test null receives the 7/3 training mean, not the test mean.
        assert_abs_diff_eq!(test_crp[0], 7.0 / 3.0, epsilon = 1e-12);
        let test_wbc = matrix::numeric_column(&outcome.test, "WBC").unwrap();
        assert_abs_diff_eq!(test_wbc[1], 6.5);
    }

    #[test]
    fn overrides_choose_the_fill_statistic() {
        let frame = DataFrame::new(vec![
            Series::new("median_col".into(), vec![Some(1.0f64), Some(2.0), Some(4.0), None]).into(),
            Series::new("mode_col".into(), vec![Some(2.0f64), Some(2.0), Some(9.0), None]).into(),
            Series::new("zero_col".into(), vec![Some(5.0f64), None, None, None]).into(),
            Series::new("const_col".into(), vec![Some(5.0f64), None, None, None]).into(),
        ])
        .unwrap();
        let overrides = BTreeMap::from([
            ("median_col".to_string(), ImputationMethod::Median),
            ("mode_col".to_string(), ImputationMethod::Mode),
            ("zero_col".to_string(), ImputationMethod::Zero),
            ("const_col".to_string(), ImputationMethod::Constant(-1.0)),
        ]);
        let plan = ImputationPlan::PerFeature { overrides };
        let empty = DataFrame::new(vec![]).unwrap();
        let outcome = impute(&plan, frame, empty, "pat_id", "label").unwrap();

        assert_abs_diff_eq!(outcome.record.fill("median_col").unwrap(), 2.0);
        assert_abs_diff_eq!(outcome.record.fill("mode_col").unwrap(), 2.0);
        assert_abs_diff_eq!(outcome.record.fill("zero_col").unwrap(), 0.0);
        assert_abs_diff_eq!(outcome.record.fill("const_col").unwrap(), -1.0);
    }

    #[test]
    fn mode_ties_resolve_to_the_smallest_value() {
        assert_abs_diff_eq!(mode(&[3.0, 1.0, 3.0, 1.0, 2.0]), 1.0);
        assert_abs_diff_eq!(median(&[4.0, 1.0, 2.0]), 2.0);
        assert_abs_diff_eq!(median(&[4.0, 1.0, 2.0, 3.0]), 2.5);
    }

    #[test]
    fn string_features_are_left_alone() {
        let frame = DataFrame::new(vec![
            Series::new("ward".into(), vec![Some("icu"), None, Some("ed")]).into(),
            Series::new("CRP".into(), vec![Some(1.0f64), None, Some(3.0)]).into(),
        ])
        .unwrap();
        let empty = DataFrame::new(vec![]).unwrap();
        let plan = ImputationPlan::default();
        let outcome = impute(&plan, frame, empty, "pat_id", "label").unwrap();

        assert_eq!(outcome.train.column("ward").unwrap().null_count(), 1);
        assert!(outcome.record.fill("ward").is_none());
        assert_eq!(outcome.train.column("CRP").unwrap().null_count(), 0);
    }

    #[test]
    fn record_replay_skips_absent_features() {
        let plan = ImputationPlan::default();
        let outcome = impute(&plan, train_frame(), test_frame(), "pat_id", "label").unwrap();

        let narrow = DataFrame::new(vec![
            Series::new("CRP".into(), vec![None::<f64>, Some(1.0)]).into(),
        ])
        .unwrap();
        let replayed = apply_record(&outcome.record, narrow).unwrap();
        let crp = matrix::numeric_column(&replayed, "CRP").unwrap();
        assert_abs_diff_eq!(crp[0], 7.0 / 3.0, epsilon = 1e-12);
        // The record also knows WBC, which this frame does not carry.
        assert!(outcome.record.fill("WBC").is_some());
        assert_eq!(replayed.width(), 1);
    }

    #[test]
    fn lingering_empty_columns_are_dropped() {
        let frame = DataFrame::new(vec![
            Series::new("keep".into(), vec![Some(1.0f64), None]).into(),
            Series::new("empty".into(), vec![None::<f64>, None]).into(),
            Series::new("pat_id".into(), vec![1i64, 2]).into(),
        ])
        .unwrap();
        let (trimmed, dropped) = drop_all_null_columns(frame, &["pat_id"]).unwrap();
        assert_eq!(dropped, vec!["empty".to_string()]);
        assert_eq!(
            trimmed
                .get_column_names()
                .iter()
                .map(|name| name.to_string())
                .collect::<Vec<_>>(),
            vec!["keep".to_string(), "pat_id".to_string()]
        );
    }
}
