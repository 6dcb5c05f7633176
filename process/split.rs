//! # Entity-Grouped Train/Test Partitioning
//!
//! Rows are never split individually: the distinct entity ids of the
//! grouping column are partitioned, and every row follows its entity. The
//! id sets are disjoint by construction, which is what makes the downstream
//! leakage assertion a pure regression guard.
//!
//! The shuffle is driven by a seeded [`StdRng`], so a given (id set, seed,
//! fraction) triple always produces the same partition, including when the
//! split is recomputed from a cached processed matrix.

use crate::matrix::{self, MatrixError};
use log::debug;
use polars::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

/// Fraction of entities assigned to the test partition when the caller does
/// not choose one.
pub const DEFAULT_TEST_FRACTION: f64 = 0.25;

#[derive(Error, Debug)]
pub enum SplitError {
    #[error("Matrix error during splitting: {0}")]
    Matrix(#[from] MatrixError),
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("The grouping column '{0}' was not found in the matrix.")]
    GroupingColumnMissing(String),
    #[error("The outcome column '{0}' was not found in the matrix.")]
    OutcomeColumnMissing(String),
    #[error("The grouping column '{column}' must hold integer entity ids. (Found type: {found_type})")]
    GroupingColumnType { column: String, found_type: String },
    #[error("The grouping column '{0}' contains null entity ids.")]
    NullEntityIds(String),
    #[error("Cannot split {num_ids} distinct entity ids into non-empty train and test partitions.")]
    TooFewGroups { num_ids: usize },
    #[error("test_fraction must lie strictly between 0 and 1; got {0}.")]
    InvalidFraction(f64),
}

/// How entities are divided between partitions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SplitSpec {
    /// Fraction of distinct entity ids held out for testing. The resulting
    /// test-id count is `floor(test_fraction * n)`, clamped so that both
    /// partitions stay non-empty.
    pub test_fraction: f64,
}

impl Default for SplitSpec {
    fn default() -> Self {
        Self {
            test_fraction: DEFAULT_TEST_FRACTION,
        }
    }
}

/// The four partition pieces plus the bookkeeping needed to restore and
/// verify them later.
#[derive(Debug)]
pub struct GroupedSplit {
    pub train_ids: BTreeSet<i64>,
    pub test_ids: BTreeSet<i64>,
    /// Training features, grouping column included, outcome removed.
    pub x_train: DataFrame,
    pub y_train: Vec<f64>,
    /// Test features, grouping column included, outcome removed.
    pub x_test: DataFrame,
    pub y_test: Vec<f64>,
    /// For each partition row, its row position in the source frame.
    pub train_positions: Vec<usize>,
    pub test_positions: Vec<usize>,
}

/// Splits a frame into entity-disjoint train and test partitions.
///
/// The distinct ids of `grouping_column` are sorted, shuffled with a rng
/// seeded from `seed`, and the trailing `floor(test_fraction * n)` ids
/// (clamped to `1..=n-1`) become the test set. Every row is then routed by
/// its entity membership and the outcome column is separated from each
/// partition.
pub fn split_frame(
    frame: &DataFrame,
    grouping_column: &str,
    outcome_column: &str,
    spec: &SplitSpec,
    seed: u64,
) -> Result<GroupedSplit, SplitError> {
    if !(spec.test_fraction > 0.0 && spec.test_fraction < 1.0) {
        return Err(SplitError::InvalidFraction(spec.test_fraction));
    }
    let column_names: Vec<String> = frame
        .get_column_names()
        .iter()
        .map(|name| name.to_string())
        .collect();
    if !column_names.iter().any(|name| name == grouping_column) {
        return Err(SplitError::GroupingColumnMissing(
            grouping_column.to_string(),
        ));
    }
    if !column_names.iter().any(|name| name == outcome_column) {
        return Err(SplitError::OutcomeColumnMissing(outcome_column.to_string()));
    }

    let ids_column = frame.column(grouping_column)?;
    if ids_column.null_count() > 0 {
        return Err(SplitError::NullEntityIds(grouping_column.to_string()));
    }
    let ids_casted = ids_column
        .cast(&DataType::Int64)
        .map_err(|_| SplitError::GroupingColumnType {
            column: grouping_column.to_string(),
            found_type: format!("{:?}", ids_column.dtype()),
        })?;
    let ids = ids_casted.i64()?;

    // Sorted distinct ids give a platform-independent shuffle input.
    let distinct: BTreeSet<i64> = ids.into_iter().flatten().collect();
    let num_ids = distinct.len();
    if num_ids < 2 {
        return Err(SplitError::TooFewGroups { num_ids });
    }
    let mut ordered: Vec<i64> = distinct.into_iter().collect();
    let mut rng = StdRng::seed_from_u64(seed);
    ordered.shuffle(&mut rng);

    let requested = (spec.test_fraction * num_ids as f64).floor() as usize;
    let num_test = requested.clamp(1, num_ids - 1);
    let test_ids: BTreeSet<i64> = ordered[num_ids - num_test..].iter().copied().collect();
    let train_ids: BTreeSet<i64> = ordered[..num_ids - num_test].iter().copied().collect();
    debug!(
        "Split {} entities into {} train / {} test (seed {})",
        num_ids,
        train_ids.len(),
        test_ids.len(),
        seed
    );

    let mut train_positions = Vec::new();
    let mut test_positions = Vec::new();
    for (row, id) in ids.into_iter().enumerate() {
        // Nulls were rejected above.
        if let Some(id) = id {
            if train_ids.contains(&id) {
                train_positions.push(row);
            } else {
                test_positions.push(row);
            }
        }
    }

    let train_mask: BooleanChunked = ids
        .into_iter()
        .map(|id| id.map(|v| train_ids.contains(&v)))
        .collect();
    let test_mask: BooleanChunked = ids
        .into_iter()
        .map(|id| id.map(|v| test_ids.contains(&v)))
        .collect();

    let mut x_train = frame.filter(&train_mask)?;
    let y_train = matrix::column_values(&x_train.drop_in_place(outcome_column)?)?;
    let mut x_test = frame.filter(&test_mask)?;
    let y_test = matrix::column_values(&x_test.drop_in_place(outcome_column)?)?;

    Ok(GroupedSplit {
        train_ids,
        test_ids,
        x_train,
        y_train,
        x_test,
        y_test,
        train_positions,
        test_positions,
    })
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;

    /// Two rows per entity so grouping actually matters.
    fn frame_for_ids(ids: &[i64]) -> DataFrame {
        let mut id_rows = Vec::with_capacity(ids.len() * 2);
        let mut labels = Vec::with_capacity(ids.len() * 2);
        let mut values = Vec::with_capacity(ids.len() * 2);
        for &id in ids {
            for visit in 0..2 {
                id_rows.push(id);
                labels.push((id % 2) as f64);
                values.push(id as f64 + visit as f64 / 10.0);
            }
        }
        DataFrame::new(vec![
            Series::new("pat_id".into(), id_rows).into(),
            Series::new("label".into(), labels).into(),
            Series::new("CRP".into(), values).into(),
        ])
        .unwrap()
    }

    #[test]
    fn same_seed_produces_identical_partitions() {
        let ids: Vec<i64> = (1..=10).collect();
        let frame = frame_for_ids(&ids);
        let spec = SplitSpec { test_fraction: 0.2 };

        let first = split_frame(&frame, "pat_id", "label", &spec, 42).unwrap();
        let second = split_frame(&frame, "pat_id", "label", &spec, 42).unwrap();

        assert_eq!(first.train_ids, second.train_ids);
        assert_eq!(first.test_ids, second.test_ids);
        assert_eq!(first.train_ids.len(), 8);
        assert_eq!(first.test_ids.len(), 2);
    }

    #[test]
    fn partitions_are_disjoint_and_cover_all_ids() {
        let ids: Vec<i64> = (1..=25).collect();
        let frame = frame_for_ids(&ids);
        let split = split_frame(&frame, "pat_id", "label", &SplitSpec::default(), 7).unwrap();

        assert!(split.train_ids.is_disjoint(&split.test_ids));
        let union: BTreeSet<i64> = split.train_ids.union(&split.test_ids).copied().collect();
        let expected: BTreeSet<i64> = ids.iter().copied().collect();
        assert_eq!(union, expected);
    }

    #[test]
    fn rows_follow_their_entity() {
        let ids: Vec<i64> = (1..=12).collect();
        let frame = frame_for_ids(&ids);
        let split = split_frame(&frame, "pat_id", "label", &SplitSpec::default(), 3).unwrap();

        let train_rows = matrix::numeric_column(&split.x_train, "pat_id").unwrap();
        for id in train_rows {
            assert!(split.train_ids.contains(&(id as i64)));
        }
        let test_rows = matrix::numeric_column(&split.x_test, "pat_id").unwrap();
        for id in test_rows {
            assert!(split.test_ids.contains(&(id as i64)));
        }
        // Outcome has been separated from both partitions.
        assert!(
            !split
                .x_train
                .get_column_names()
                .iter()
                .any(|name| name.as_str() == "label")
        );
        assert_eq!(split.y_train.len(), split.x_train.height());
        assert_eq!(split.y_test.len(), split.x_test.height());
    }

    #[test]
    fn row_positions_index_into_the_source_frame() {
        let ids: Vec<i64> = (1..=6).collect();
        let frame = frame_for_ids(&ids);
        let split = split_frame(&frame, "pat_id", "label", &SplitSpec::default(), 11).unwrap();

        assert_eq!(split.train_positions.len(), split.x_train.height());
        assert_eq!(split.test_positions.len(), split.x_test.height());
        let all_ids = matrix::numeric_column(&frame, "pat_id").unwrap();
        for (row, &position) in split.train_positions.iter().enumerate() {
            let expected = all_ids[position];
            let actual = matrix::numeric_column(&split.x_train, "pat_id").unwrap()[row];
            assert_eq!(actual, expected);
        }
    }

    #[test]
    fn single_entity_cannot_be_split() {
        let frame = frame_for_ids(&[5]);
        match split_frame(&frame, "pat_id", "label", &SplitSpec::default(), 1) {
            Err(SplitError::TooFewGroups { num_ids }) => assert_eq!(num_ids, 1),
            other => panic!("Expected TooFewGroups, got {other:?}"),
        }
    }

    #[test]
    fn fraction_bounds_are_enforced() {
        let frame = frame_for_ids(&[1, 2, 3]);
        for bad in [0.0, 1.0, -0.5, 1.5] {
            let spec = SplitSpec { test_fraction: bad };
            match split_frame(&frame, "pat_id", "label", &spec, 1) {
                Err(SplitError::InvalidFraction(value)) => assert_eq!(value, bad),
                other => panic!("Expected InvalidFraction, got {other:?}"),
            }
        }
    }

    #[test]
    fn missing_columns_are_reported_by_name() {
        let frame = frame_for_ids(&[1, 2, 3]);
        match split_frame(&frame, "episode_id", "label", &SplitSpec::default(), 1) {
            Err(SplitError::GroupingColumnMissing(name)) => assert_eq!(name, "episode_id"),
            other => panic!("Expected GroupingColumnMissing, got {other:?}"),
        }
        match split_frame(&frame, "pat_id", "outcome", &SplitSpec::default(), 1) {
            Err(SplitError::OutcomeColumnMissing(name)) => assert_eq!(name, "outcome"),
            other => panic!("Expected OutcomeColumnMissing, got {other:?}"),
        }
    }
}
