//! # Training Seams
//!
//! The pipeline never trains a model itself. It drives injected
//! implementations of the traits below: a [`RawMatrixProvider`] that
//! materializes the raw feature matrix, a [`PredictorFactory`] that builds
//! or reloads predictors, and an [`Analyzer`] that scores a trained
//! predictor on the held-out partition and writes the per-algorithm report.
//!
//! A predictor reports how training ended through [`TrainStatus`]. Running
//! out of usable samples is an expected outcome on rare outcomes, not a
//! failure, and the pipeline degrades to an error report for that algorithm
//! while the run carries on. Hard faults use the error types instead.

use std::collections::BTreeSet;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use ndarray::{Array1, ArrayView1, ArrayView2};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::matrix::MatrixError;

#[derive(Error, Debug)]
pub enum PredictorError {
    #[error("Training failed: {0}")]
    Training(String),
    #[error("Prediction failed: {0}")]
    Prediction(String),
    #[error("Model artifact error: {0}")]
    Artifact(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("Analysis failed: {0}")]
    Analysis(String),
    #[error("Matrix error while writing the report: {0}")]
    Matrix(#[from] MatrixError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Raw matrix acquisition failed: {0}")]
    Acquisition(String),
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// How a training attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainStatus {
    Trained,
    /// Too few usable samples to fit anything. Expected on rare outcomes;
    /// the pipeline records it and moves on to the next algorithm.
    InsufficientSamples,
}

impl fmt::Display for TrainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trained => write!(f, "trained"),
            Self::InsufficientSamples => write!(f, "insufficient-samples"),
        }
    }
}

/// Whether the outcome is a class label or a continuous value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredictionProblem {
    #[default]
    Classification,
    Regression,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchStrategy {
    /// Try every hyperparameter combination.
    Exhaustive,
    /// Sample combinations up to `max_iter`.
    Random,
}

/// Hyperparameter search settings handed to the factory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub search: SearchStrategy,
    pub max_iter: usize,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            search: SearchStrategy::Exhaustive,
            max_iter: 1024,
        }
    }
}

/// Splits training on a feature comparison, so a factory can fit separate
/// sub-models either side of a clinical threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BifurcationSpec {
    pub feature: String,
    pub comparison: BifurcationComparison,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BifurcationComparison {
    Equal,
    LessThan,
    GreaterThan,
}

impl BifurcationSpec {
    /// True when a sample's feature value falls on the bifurcated side.
    pub fn admits(&self, observed: f64) -> bool {
        match self.comparison {
            BifurcationComparison::Equal => observed == self.value,
            BifurcationComparison::LessThan => observed < self.value,
            BifurcationComparison::GreaterThan => observed > self.value,
        }
    }
}

/// One algorithm to train, as named in the run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlgorithmSpec {
    pub name: String,
    #[serde(default)]
    pub hyperparameters: Hyperparameters,
    #[serde(default)]
    pub bifurcation: Option<BifurcationSpec>,
}

impl AlgorithmSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            hyperparameters: Hyperparameters::default(),
            bifurcation: None,
        }
    }
}

/// Constraints forwarded to the raw matrix provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConstraints {
    /// Restrict source records to this closed interval.
    pub time_window: Option<(NaiveDateTime, NaiveDateTime)>,
    /// Entities excluded from the matrix outright.
    pub exclude_entities: BTreeSet<i64>,
}

/// Source of the raw feature matrix.
///
/// `seed` arrives mapped into `[-1, 1]`, the convention the upstream
/// samplers use for reproducible random row draws.
pub trait RawMatrixProvider {
    fn build_matrix(
        &self,
        variable: &str,
        num_rows: usize,
        seed: f64,
        constraints: &ProviderConstraints,
    ) -> Result<DataFrame, ProviderError>;
}

/// A supervised model behind a uniform facade.
pub trait Predictor {
    fn algorithm(&self) -> &str;

    /// Fits on the training partition. `groups` carries the grouping ids
    /// row-aligned with `x`, for implementations that cross-validate
    /// group-wise.
    fn train(
        &mut self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        groups: &[i64],
    ) -> Result<TrainStatus, PredictorError>;

    fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, PredictorError>;

    /// Persists the fitted model to the given path.
    fn save(&self, path: &Path) -> Result<(), PredictorError>;
}

/// Builds fresh predictors and reloads persisted ones.
pub trait PredictorFactory {
    fn build(
        &self,
        spec: &AlgorithmSpec,
        problem: PredictionProblem,
        seed: u64,
    ) -> Result<Box<dyn Predictor>, PredictorError>;

    fn load(&self, spec: &AlgorithmSpec, path: &Path) -> Result<Box<dyn Predictor>, PredictorError>;
}

/// Where an analyzer should put its report and how to label it.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub report_dir: PathBuf,
    pub report_prefix: String,
    pub variable: String,
}

/// Scores a trained predictor on the held-out partition and writes the
/// per-algorithm report, returning the report path.
pub trait Analyzer {
    fn analyze(
        &self,
        predictor: &dyn Predictor,
        x_test: ArrayView2<f64>,
        y_test: ArrayView1<f64>,
        request: &AnalysisRequest,
    ) -> Result<PathBuf, AnalyzerError>;
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn train_status_renders_for_reports() {
        assert_eq!(TrainStatus::Trained.to_string(), "trained");
        assert_eq!(
            TrainStatus::InsufficientSamples.to_string(),
            "insufficient-samples"
        );
    }

    #[test]
    fn bifurcation_comparisons_partition_samples() {
        let spec = |comparison| BifurcationSpec {
            feature: "age".to_string(),
            comparison,
            value: 65.0,
        };
        assert!(spec(BifurcationComparison::Equal).admits(65.0));
        assert!(!spec(BifurcationComparison::Equal).admits(64.0));
        assert!(spec(BifurcationComparison::LessThan).admits(64.9));
        assert!(!spec(BifurcationComparison::LessThan).admits(65.0));
        assert!(spec(BifurcationComparison::GreaterThan).admits(65.1));
        assert!(!spec(BifurcationComparison::GreaterThan).admits(65.0));
    }

    #[test]
    fn hyperparameter_defaults_are_exhaustive_search() {
        let spec = AlgorithmSpec::new("l1-logistic");
        assert_eq!(spec.hyperparameters.search, SearchStrategy::Exhaustive);
        assert_eq!(spec.hyperparameters.max_iter, 1024);
        assert!(spec.bifurcation.is_none());
    }
}
