//! # Rank-Based Feature Selection
//!
//! The selector reduces the training frame to its most informative columns
//! and forces the test frame into the identical shape. Ranking is pluggable
//! through the [`FeatureRanker`] trait: a ranker sees the numeric training
//! matrix and outcome vector and returns one rank per column, rank 1 being
//! the most informative. Two rankers ship here, a recursive-elimination
//! least-squares ranker and a plain correlation ranker.
//!
//! The cutoff is `floor(fraction * ncols)`. Columns ranked past the cutoff
//! are eliminated unless they appear in the protected keep list; protected
//! columns are snapshotted before the cut and merged back afterwards, so a
//! ranker can never drop them. The surviving training column order is then
//! applied to the test frame; a survivor missing from test is a fatal
//! mismatch because no model could be scored on it.

use std::fmt;

use log::debug;
use ndarray::{Array2, ArrayView1, ArrayView2};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::matrix::{self, MatrixError};

const MAX_SWEEPS: usize = 200;
const CONVERGENCE_TOL: f64 = 1e-10;

#[derive(Error, Debug)]
pub enum SelectionError {
    #[error("Matrix error during selection: {0}")]
    Matrix(#[from] MatrixError),
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("The selection fraction must lie in (0, 1]. (Got: {0})")]
    InvalidFraction(f64),
    #[error("The ranker produced {got} ranks for {expected} columns.")]
    RankCountMismatch { expected: usize, got: usize },
    #[error("The ranker produced an invalid ranking: {0}")]
    InvalidRanking(String),
    #[error(
        "The feature matrix has {x_rows} rows but the outcome vector has {y_rows}; the partitions are out of step."
    )]
    DimensionMismatch { x_rows: usize, y_rows: usize },
    #[error(
        "The test partition lacks columns that survived selection on train: {missing:?}. The partitions no longer describe the same feature space."
    )]
    ColumnMismatch { missing: Vec<String> },
}

/// Which built-in ranker a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionAlgorithm {
    RecursiveElimination,
    Correlation,
}

impl fmt::Display for SelectionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RecursiveElimination => write!(f, "recursive feature elimination"),
            Self::Correlation => write!(f, "correlation ranking"),
        }
    }
}

/// Selection parameters for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionSpec {
    pub algorithm: SelectionAlgorithm,
    /// Fraction of columns to keep, applied as `floor(fraction * ncols)`.
    pub fraction: f64,
    /// Features that survive regardless of rank.
    pub keep: Vec<String>,
}

impl Default for SelectionSpec {
    fn default() -> Self {
        Self {
            algorithm: SelectionAlgorithm::RecursiveElimination,
            fraction: 0.05,
            keep: Vec::new(),
        }
    }
}

/// Assigns an informativeness rank to every feature column.
///
/// The returned vector holds one rank per column, a permutation of
/// `1..=ncols` with rank 1 the most informative.
pub trait FeatureRanker {
    fn name(&self) -> &'static str;
    fn rank(&self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<Vec<usize>, SelectionError>;
}

/// Both partitions reduced to the surviving feature space.
#[derive(Debug)]
pub struct SelectionOutcome {
    pub train: DataFrame,
    pub test: DataFrame,
    pub eliminated: Vec<String>,
    /// The rank cutoff that was applied, before keep-list merge-back.
    pub num_selected: usize,
}

/// Dispatches to the ranker named in `spec` and applies its rank cut.
pub fn select_features(
    spec: &SelectionSpec,
    train: DataFrame,
    y_train: &[f64],
    test: DataFrame,
) -> Result<SelectionOutcome, SelectionError> {
    match spec.algorithm {
        SelectionAlgorithm::RecursiveElimination => {
            select_with_ranker(&RecursiveEliminationRanker, spec, train, y_train, test)
        }
        SelectionAlgorithm::Correlation => {
            select_with_ranker(&CorrelationRanker, spec, train, y_train, test)
        }
    }
}

/// Selection with an explicit ranker, the seam the built-ins plug into.
pub fn select_with_ranker(
    ranker: &dyn FeatureRanker,
    spec: &SelectionSpec,
    train: DataFrame,
    y_train: &[f64],
    test: DataFrame,
) -> Result<SelectionOutcome, SelectionError> {
    if !(spec.fraction > 0.0 && spec.fraction <= 1.0) {
        return Err(SelectionError::InvalidFraction(spec.fraction));
    }

    let names: Vec<String> = train
        .get_column_names()
        .iter()
        .map(|name| name.to_string())
        .collect();
    let x = matrix::numeric_matrix(&train, &names)?;
    let y = ArrayView1::from(y_train);
    if x.nrows() != y.len() {
        return Err(SelectionError::DimensionMismatch {
            x_rows: x.nrows(),
            y_rows: y.len(),
        });
    }

    debug!(
        "Ranking {} candidate features with {}.",
        names.len(),
        ranker.name()
    );
    let ranks = ranker.rank(x.view(), y)?;
    validate_ranking(&ranks, names.len())?;
    let num_selected = (spec.fraction * names.len() as f64).floor() as usize;

    // Protected columns are snapshotted before the cut so the merge-back
    // cannot depend on what the ranker decided.
    let mut snapshots: Vec<Column> = Vec::new();
    for keep in &spec.keep {
        match train.column(keep) {
            Ok(column) => snapshots.push(column.clone()),
            Err(_) => debug!("Protected feature '{keep}' is not present; nothing to keep."),
        }
    }

    let mut survivors: Vec<String> = Vec::new();
    let mut eliminated: Vec<String> = Vec::new();
    for (name, &rank) in names.iter().zip(&ranks) {
        if rank <= num_selected {
            survivors.push(name.clone());
        } else if spec.keep.iter().any(|keep| keep == name) {
            debug!("Feature '{name}' ranked {rank}, past the cutoff, but is protected.");
        } else {
            eliminated.push(name.clone());
        }
    }

    let mut train = train.select(survivors.iter().map(|name| name.as_str()))?;
    for snapshot in snapshots {
        let name = snapshot.name().to_string();
        if !survivors.iter().any(|survivor| *survivor == name) {
            train.with_column(snapshot)?;
            survivors.push(name);
        }
    }

    let test = reindex_to_columns(&survivors, &test)?;

    Ok(SelectionOutcome {
        train,
        test,
        eliminated,
        num_selected,
    })
}

/// Projects a frame onto the given columns in the given order.
///
/// Extra columns are dropped silently; a requested column the frame lacks
/// is a fatal mismatch.
pub fn reindex_to_columns(
    columns: &[String],
    frame: &DataFrame,
) -> Result<DataFrame, SelectionError> {
    let missing: Vec<String> = columns
        .iter()
        .filter(|name| frame.column(name).is_err())
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(SelectionError::ColumnMismatch { missing });
    }
    Ok(frame.select(columns.iter().map(|name| name.as_str()))?)
}

fn validate_ranking(ranks: &[usize], expected: usize) -> Result<(), SelectionError> {
    if ranks.len() != expected {
        return Err(SelectionError::RankCountMismatch {
            expected,
            got: ranks.len(),
        });
    }
    let mut seen = vec![false; expected];
    for &rank in ranks {
        if rank == 0 || rank > expected {
            return Err(SelectionError::InvalidRanking(format!(
                "rank {rank} is outside 1..={expected}"
            )));
        }
        if seen[rank - 1] {
            return Err(SelectionError::InvalidRanking(format!(
                "rank {rank} was assigned twice"
            )));
        }
        seen[rank - 1] = true;
    }
    Ok(())
}

/// Ranks features by the absolute Pearson correlation between each column
/// and the outcome, most correlated first. Ties and degenerate columns
/// resolve by column order.
pub struct CorrelationRanker;

impl FeatureRanker for CorrelationRanker {
    fn name(&self) -> &'static str {
        "correlation ranking"
    }

    fn rank(&self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<Vec<usize>, SelectionError> {
        let (rows, cols) = x.dim();
        if rows != y.len() {
            return Err(SelectionError::DimensionMismatch {
                x_rows: rows,
                y_rows: y.len(),
            });
        }
        let y_mean = y.iter().sum::<f64>() / rows as f64;
        let y_dev: Vec<f64> = y.iter().map(|value| value - y_mean).collect();
        let y_ss: f64 = y_dev.iter().map(|dev| dev * dev).sum();

        let mut scores = Vec::with_capacity(cols);
        for j in 0..cols {
            let column = x.column(j);
            let mean = column.iter().sum::<f64>() / rows as f64;
            let mut cov = 0.0;
            let mut ss = 0.0;
            for (value, dev) in column.iter().zip(&y_dev) {
                cov += (value - mean) * dev;
                ss += (value - mean) * (value - mean);
            }
            let denominator = (ss * y_ss).sqrt();
            let score = if denominator > 0.0 {
                (cov / denominator).abs()
            } else {
                0.0
            };
            scores.push(score);
        }

        let mut order: Vec<usize> = (0..cols).collect();
        order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));
        let mut ranks = vec![0usize; cols];
        for (position, &column) in order.iter().enumerate() {
            ranks[column] = position + 1;
        }
        Ok(ranks)
    }
}

/// Backwards-elimination ranker over a least-squares fit.
///
/// Columns are standardized, a linear model is fitted by coordinate
/// descent, and the feature with the smallest absolute coefficient is
/// eliminated and handed the worst open rank. The fit repeats on the
/// remaining columns until every feature is ranked.
pub struct RecursiveEliminationRanker;

impl FeatureRanker for RecursiveEliminationRanker {
    fn name(&self) -> &'static str {
        "recursive feature elimination"
    }

    fn rank(&self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<Vec<usize>, SelectionError> {
        let (rows, cols) = x.dim();
        if rows != y.len() {
            return Err(SelectionError::DimensionMismatch {
                x_rows: rows,
                y_rows: y.len(),
            });
        }
        if cols == 0 {
            return Ok(Vec::new());
        }

        let mut standardized = Array2::<f64>::zeros((rows, cols));
        let mut active: Vec<usize> = Vec::new();
        let mut degenerate: Vec<usize> = Vec::new();
        for j in 0..cols {
            let column = x.column(j);
            let mean = column.iter().sum::<f64>() / rows as f64;
            let variance = column.iter().map(|value| (value - mean).powi(2)).sum::<f64>();
            if variance > 0.0 {
                let sd = (variance / rows as f64).sqrt();
                for (i, value) in column.iter().enumerate() {
                    standardized[(i, j)] = (value - mean) / sd;
                }
                active.push(j);
            } else {
                degenerate.push(j);
            }
        }

        let y_mean = y.iter().sum::<f64>() / rows as f64;
        let y_centered: Vec<f64> = y.iter().map(|value| value - y_mean).collect();

        let mut ranks = vec![0usize; cols];
        let mut worst = cols;
        // Constant columns carry no signal; they take the worst ranks in
        // column order before any fitting happens.
        for &j in &degenerate {
            ranks[j] = worst;
            worst -= 1;
        }

        while !active.is_empty() {
            let betas = fit_least_squares(&standardized, &active, &y_centered);
            let mut weakest = 0usize;
            for (position, beta) in betas.iter().enumerate() {
                if beta.abs() < betas[weakest].abs() {
                    weakest = position;
                }
            }
            let column = active.remove(weakest);
            ranks[column] = worst;
            worst -= 1;
        }
        Ok(ranks)
    }
}

fn fit_least_squares(x: &Array2<f64>, active: &[usize], y: &[f64]) -> Vec<f64> {
    let mut betas = vec![0.0f64; active.len()];
    let mut residual = y.to_vec();
    let norms: Vec<f64> = active
        .iter()
        .map(|&j| x.column(j).iter().map(|value| value * value).sum())
        .collect();

    for _ in 0..MAX_SWEEPS {
        let mut largest_step = 0.0f64;
        for (position, &j) in active.iter().enumerate() {
            if norms[position] == 0.0 {
                continue;
            }
            let column = x.column(j);
            let dot: f64 = column
                .iter()
                .zip(&residual)
                .map(|(value, res)| value * res)
                .sum();
            let step = dot / norms[position];
            if step != 0.0 {
                betas[position] += step;
                for (res, value) in residual.iter_mut().zip(column) {
                    *res -= step * value;
                }
            }
            largest_step = largest_step.max(step.abs());
        }
        if largest_step < CONVERGENCE_TOL {
            break;
        }
    }
    betas
}
