//! # Pipeline Orchestration
//!
//! [`MatrixPipeline`] drives one complete run: raw matrix acquisition,
//! entity-grouped splitting, feature engineering, imputation, feature
//! selection, matrix persistence, and the per-algorithm training loop. The
//! collaborators that touch the outside world (raw matrix provider,
//! predictor factory, analyzer, path resolver) are injected; the
//! orchestrator owns nothing but sequencing and bookkeeping.
//!
//! Train-before-test discipline runs through every step. The split happens
//! before any transform so nothing can be learned from held-out rows; every
//! statistic (imputation fill, selection rank) is computed on the training
//! partition and replayed onto test. Immediately before any model sees
//! data, the grouping column is popped from both partitions and the two
//! entity-id sets are checked for overlap. An overlap aborts the run: it
//! signals a correctness defect, not a data condition, and any model
//! trained past it would look better than it is.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use ndarray::Array1;
use polars::prelude::*;
use thiserror::Error;

use crate::cache::{
    ArtifactCache, CacheDecision, CacheError, PathResolver, RunManifest, companion_matrix_path,
    variable_slug,
};
use crate::config::{ConfigError, PipelineConfig};
use crate::engineer::{self, EngineerError};
use crate::impute::{self, ImputationPlan, ImputationRecord, ImputeError};
use crate::matrix::{self, MatrixError, ProcessingLog};
use crate::report::{self, ReportError};
use crate::select::{self, SelectionError};
use crate::split::{self, SplitError};
use crate::train::{
    AnalysisRequest, Analyzer, Predictor, PredictorError, PredictorFactory, ProviderError,
    RawMatrixProvider, TrainStatus,
};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Artifact layout error: {0}")]
    Cache(#[from] CacheError),
    #[error("Matrix error: {0}")]
    Matrix(#[from] MatrixError),
    #[error("Split error: {0}")]
    Split(#[from] SplitError),
    #[error("Feature engineering error: {0}")]
    Engineer(#[from] EngineerError),
    #[error("Imputation error: {0}")]
    Impute(#[from] ImputeError),
    #[error("Selection error: {0}")]
    Selection(#[from] SelectionError),
    #[error("Raw matrix provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("Predictor error: {0}")]
    Predictor(#[from] PredictorError),
    #[error("Report error: {0}")]
    Report(#[from] ReportError),
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error(
        "{overlap} entity id(s) appear in both the train and test partitions (e.g. {sample:?}); aborting before any model sees leaked data."
    )]
    LeakageDetected { overlap: usize, sample: Vec<i64> },
    #[error(
        "The test partition lacks train columns with no recorded fill to synthesize them from: {missing:?}."
    )]
    ColumnMismatch { missing: Vec<String> },
}

/// How one algorithm of the run ended.
#[derive(Debug)]
pub struct AlgorithmOutcome {
    pub algorithm: String,
    pub status: TrainStatus,
    /// The per-algorithm report, degraded or full. `None` only when the
    /// analyzer failed (non-fatal).
    pub report_path: Option<PathBuf>,
    pub model_path: Option<PathBuf>,
}

/// Summary of a completed run.
#[derive(Debug)]
pub struct PipelineRun {
    pub processed_matrix_path: PathBuf,
    pub algorithm_outcomes: Vec<AlgorithmOutcome>,
    pub meta_report_path: Option<PathBuf>,
    pub processing_log: ProcessingLog,
    pub manifest: RunManifest,
}

/// Both partitions in model-ready shape, plus the processing history.
struct ProcessedPartitions {
    x_train: DataFrame,
    y_train: Vec<f64>,
    x_test: DataFrame,
    y_test: Vec<f64>,
    log: ProcessingLog,
}

/// One end-to-end run over injected collaborators.
pub struct MatrixPipeline<'a> {
    config: PipelineConfig,
    provider: &'a dyn RawMatrixProvider,
    resolver: &'a dyn PathResolver,
    factory: &'a dyn PredictorFactory,
    analyzer: &'a dyn Analyzer,
    cache: ArtifactCache,
    manifest: RunManifest,
}

impl<'a> MatrixPipeline<'a> {
    /// Validates the configuration and assembles a pipeline around the
    /// injected collaborators.
    pub fn new(
        config: PipelineConfig,
        provider: &'a dyn RawMatrixProvider,
        resolver: &'a dyn PathResolver,
        factory: &'a dyn PredictorFactory,
        analyzer: &'a dyn Analyzer,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let cache = ArtifactCache::new(config.cache);
        Ok(Self {
            config,
            provider,
            resolver,
            factory,
            analyzer,
            cache,
            manifest: RunManifest::new(),
        })
    }

    /// Runs the pipeline to completion.
    pub fn run(mut self) -> Result<PipelineRun, PipelineError> {
        info!(
            "Starting matrix pipeline for '{}' ({} rows requested, seed {}).",
            self.config.variable, self.config.num_rows, self.config.seed
        );

        let processed_path = self
            .resolver
            .processed_matrix_path(&self.config.variable, self.config.num_rows)?;
        let partitions = self.build_processed_matrix(&processed_path)?;

        // The grouping column leaves the feature space here, for good.
        let (x_train, train_ids) = pop_grouping(partitions.x_train, &self.config.grouping_column)?;
        let (x_test, test_ids) = pop_grouping(partitions.x_test, &self.config.grouping_column)?;
        assert_disjoint(&train_ids, &test_ids)?;
        info!(
            "Partitions are entity-disjoint: {} train rows, {} test rows.",
            x_train.height(),
            x_test.height()
        );

        let (algorithm_outcomes, meta_report_path) = self.train_and_analyze(
            &x_train,
            &partitions.y_train,
            &train_ids,
            &x_test,
            &partitions.y_test,
        )?;

        Ok(PipelineRun {
            processed_matrix_path: processed_path,
            algorithm_outcomes,
            meta_report_path,
            processing_log: partitions.log,
            manifest: self.manifest,
        })
    }

    /// Produces the model-ready partitions, from cache or from scratch.
    fn build_processed_matrix(
        &mut self,
        processed_path: &Path,
    ) -> Result<ProcessedPartitions, PipelineError> {
        if self.cache.resolve(processed_path) == CacheDecision::Reuse {
            info!(
                "Reusing processed matrix '{}'; recomputing only the split.",
                processed_path.display()
            );
            let frame = matrix::nan_to_null(matrix::read_matrix(processed_path)?)?;
            let split = split::split_frame(
                &frame,
                &self.config.grouping_column,
                &self.config.outcome_column,
                &self.config.split,
                self.config.seed,
            )?;
            self.manifest.record("processed-matrix", processed_path);
            return Ok(ProcessedPartitions {
                x_train: split.x_train,
                y_train: split.y_train,
                x_test: split.x_test,
                y_test: split.y_test,
                log: ProcessingLog::default(),
            });
        }

        // Raw matrix acquisition, behind its own cache entry.
        let raw_path = self
            .resolver
            .raw_matrix_path(&self.config.variable, self.config.num_rows)?;
        let raw = if self.cache.resolve(&raw_path) == CacheDecision::Reuse {
            info!("Reusing raw matrix '{}'.", raw_path.display());
            matrix::read_matrix(&raw_path)?
        } else {
            let raw = self.provider.build_matrix(
                &self.config.variable,
                self.config.num_rows,
                provider_seed(self.config.seed),
                &self.config.constraints,
            )?;
            matrix::write_matrix(&raw_path, &raw, &[])?;
            raw
        };
        self.manifest.record("raw-matrix", &raw_path);

        // Raw exports encode missing cells as NaN as often as they leave
        // them empty; fold both into nulls before any statistic runs.
        let raw = matrix::nan_to_null(raw)?;

        // Split before any transform, then snapshot the per-row entity ids
        // so the grouping column can be re-attached after selection.
        let split = split::split_frame(
            &raw,
            &self.config.grouping_column,
            &self.config.outcome_column,
            &self.config.split,
            self.config.seed,
        )?;
        let raw_ids = entity_ids(&raw, &self.config.grouping_column)?;
        let y_test = split.y_test;
        let mut log = ProcessingLog::default();

        // Feature engineering sees the outcome alongside the features.
        let mut working = split.x_train;
        working.with_column(Series::new(
            self.config.outcome_column.as_str().into(),
            split.y_train,
        ))?;
        let engineered =
            engineer::add_features(working, split.train_positions, &self.config.features_to_add)?;
        log.added_features = engineered.added_features;
        let (working, train_positions) = engineer::filter_rows(
            engineered.frame,
            engineered.row_positions,
            &self.config.row_filters,
        )?;

        // Duplicate-merge collisions, then manual removals.
        let (working, pruned) = engineer::prune_collision_columns(working)?;
        log.removed_features.extend(pruned);
        let (working, removed) = engineer::remove_features(working, &self.config.features_to_remove)?;
        log.removed_features.extend(removed);

        // Imputation on train statistics only.
        let imputed = impute::impute(
            &self.config.imputation,
            working,
            split.x_test,
            &self.config.grouping_column,
            &self.config.outcome_column,
        )?;
        log.removed_features.extend(imputed.removed_features);
        log.imputation_note = match &self.config.imputation {
            ImputationPlan::PerFeature { .. } => {
                "Imputing missing values with the mean value of each column.".to_string()
            }
            ImputationPlan::WholeFrame => {
                "Imputing missing values with the training-frame mean of each numeric column."
                    .to_string()
            }
        };
        let (mut working, emptied) = impute::drop_all_null_columns(
            imputed.train,
            &[&self.config.grouping_column, &self.config.outcome_column],
        )?;
        log.removed_features.extend(emptied);

        // The outcome comes off the training frame; the grouping column
        // leaves the working feature set until the rejoin below.
        let y_train = matrix::column_values(&working.drop_in_place(&self.config.outcome_column)?)?;
        if working.column(&self.config.grouping_column).is_ok() {
            working.drop_in_place(&self.config.grouping_column)?;
        }
        let train_columns: Vec<String> = working
            .get_column_names()
            .iter()
            .map(|name| name.to_string())
            .collect();
        let x_test = align_test_columns(imputed.test, &train_columns, &imputed.record)?;

        // Rank-based selection, train statistics applied to both frames.
        let selected = select::select_features(&self.config.selection, working, &y_train, x_test)?;
        log.selection_note = format!(
            "Algorithmically selecting the top {} features via {}.",
            selected.num_selected, self.config.selection.algorithm
        );
        log.eliminated_features = selected.eliminated;

        // Re-attach the grouping column by original row position.
        let mut x_train = selected.train;
        let train_groups: Vec<i64> = train_positions.iter().map(|&row| raw_ids[row]).collect();
        x_train.with_column(Series::new(
            self.config.grouping_column.as_str().into(),
            train_groups,
        ))?;
        let mut x_test = selected.test;
        let test_groups: Vec<i64> = split.test_positions.iter().map(|&row| raw_ids[row]).collect();
        x_test.with_column(Series::new(
            self.config.grouping_column.as_str().into(),
            test_groups,
        ))?;

        // Persist the companions, then the row-order-restored combination
        // with its provenance header.
        let train_out = outcome_first(&self.config.outcome_column, &y_train, &x_train)?;
        let test_out = outcome_first(&self.config.outcome_column, &y_test, &x_test)?;
        let train_path = companion_matrix_path(processed_path, "train");
        matrix::write_matrix(&train_path, &train_out, &[])?;
        self.manifest.record("train-matrix", &train_path);
        let test_path = companion_matrix_path(processed_path, "test");
        matrix::write_matrix(&test_path, &test_out, &[])?;
        self.manifest.record("test-matrix", &test_path);

        let combined = matrix::interleave_partitions(
            &train_out,
            &test_out,
            &train_positions,
            &split.test_positions,
        )?;
        let mut header = matrix::build_file_summary(
            &file_name_of(processed_path),
            "caliper::pipeline",
            &self.config.invocation(),
            combined.height(),
            &file_name_of(&raw_path),
        );
        header.push(String::new());
        header.extend(matrix::build_processing_summary(&log));
        matrix::write_matrix(processed_path, &combined, &header)?;
        self.manifest.record("processed-matrix", processed_path);

        Ok(ProcessedPartitions {
            x_train,
            y_train,
            x_test,
            y_test,
            log,
        })
    }

    /// The per-algorithm loop: train or reload, then analyze or degrade.
    fn train_and_analyze(
        &mut self,
        x_train: &DataFrame,
        y_train: &[f64],
        train_ids: &[i64],
        x_test: &DataFrame,
        y_test: &[f64],
    ) -> Result<(Vec<AlgorithmOutcome>, Option<PathBuf>), PipelineError> {
        if self.config.algorithms.is_empty() {
            debug!("No algorithms configured; matrix-only run.");
            return Ok((Vec::new(), None));
        }

        let train_columns: Vec<String> = x_train
            .get_column_names()
            .iter()
            .map(|name| name.to_string())
            .collect();
        let x = matrix::numeric_matrix(x_train, &train_columns)?;
        let y = Array1::from(y_train.to_vec());
        let x_held_out = matrix::numeric_matrix(x_test, &train_columns)?;
        let y_held_out = Array1::from(y_test.to_vec());

        let mut outcomes = Vec::with_capacity(self.config.algorithms.len());
        let mut meta: Option<DataFrame> = None;

        for spec in &self.config.algorithms {
            let model_path = self.resolver.model_path(&self.config.variable, &spec.name)?;
            let report_dir = self.resolver.report_dir(&self.config.variable, &spec.name)?;
            let degraded_path = self
                .resolver
                .algorithm_report_path(&self.config.variable, &spec.name)?;

            let mut reloaded: Option<Box<dyn Predictor>> = None;
            if self.cache.resolve(&model_path) == CacheDecision::Reuse {
                match self.factory.load(spec, &model_path) {
                    Ok(predictor) => {
                        info!("Reusing trained model '{}'.", model_path.display());
                        self.manifest
                            .record(&format!("{}-model", spec.name), &model_path);
                        reloaded = Some(predictor);
                    }
                    Err(error) => warn!(
                        "Could not reload model '{}' ({error}); training afresh.",
                        model_path.display()
                    ),
                }
            }

            let predictor = match reloaded {
                Some(predictor) => predictor,
                None => {
                    let mut fresh =
                        self.factory
                            .build(spec, self.config.problem, self.config.seed)?;
                    match fresh.train(x.view(), y.view(), train_ids)? {
                        TrainStatus::Trained => {
                            fresh.save(&model_path)?;
                            self.manifest
                                .record(&format!("{}-model", spec.name), &model_path);
                            fresh
                        }
                        TrainStatus::InsufficientSamples => {
                            warn!(
                                "Algorithm '{}' has too few usable samples; writing the degraded report.",
                                spec.name
                            );
                            let degraded = report::error_report_frame(
                                &self.config.variable,
                                &spec.name,
                                &TrainStatus::InsufficientSamples.to_string(),
                                y_train,
                                y_test,
                            )?;
                            let header = vec![self.config.invocation()];
                            matrix::write_matrix(&degraded_path, &degraded, &header)?;
                            self.manifest
                                .record(&format!("{}-report", spec.name), &degraded_path);
                            outcomes.push(AlgorithmOutcome {
                                algorithm: spec.name.clone(),
                                status: TrainStatus::InsufficientSamples,
                                report_path: Some(degraded_path),
                                model_path: None,
                            });
                            continue;
                        }
                    }
                }
            };

            // Analysis failures degrade this algorithm, never the run.
            let request = AnalysisRequest {
                report_dir: report_dir.clone(),
                report_prefix: format!("{}-{}", variable_slug(&self.config.variable), spec.name),
                variable: self.config.variable.clone(),
            };
            let report_path = match self.analyzer.analyze(
                predictor.as_ref(),
                x_held_out.view(),
                y_held_out.view(),
                &request,
            ) {
                Ok(path) => {
                    self.manifest.record(&format!("{}-report", spec.name), &path);
                    match matrix::read_matrix(&path) {
                        Ok(frame) => match report::append_meta(meta.clone(), frame) {
                            Ok(stacked) => meta = Some(stacked),
                            Err(error) => warn!(
                                "Report for '{}' does not stack into the meta report: {error}",
                                spec.name
                            ),
                        },
                        Err(error) => warn!(
                            "Could not read back report '{}': {error}",
                            path.display()
                        ),
                    }
                    Some(path)
                }
                Err(error) => {
                    warn!(
                        "Analysis for '{}' failed: {error}; continuing with the next algorithm.",
                        spec.name
                    );
                    None
                }
            };

            outcomes.push(AlgorithmOutcome {
                algorithm: spec.name.clone(),
                status: TrainStatus::Trained,
                report_path,
                model_path: Some(model_path),
            });
        }

        let meta_report_path = match meta {
            Some(frame) => {
                let path = self.resolver.meta_report_path(&self.config.variable)?;
                let header = vec![self.config.invocation()];
                matrix::write_matrix(&path, &frame, &header)?;
                self.manifest.record("meta-report", &path);
                Some(path)
            }
            None => None,
        };

        Ok((outcomes, meta_report_path))
    }
}

/// Maps the run seed into the `[-1, 1]` convention of the upstream
/// samplers.
fn provider_seed(seed: u64) -> f64 {
    (seed as i64) as f64 / i64::MAX as f64
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Per-row entity ids of the grouping column.
fn entity_ids(frame: &DataFrame, grouping_column: &str) -> Result<Vec<i64>, PipelineError> {
    let casted = frame.column(grouping_column)?.cast(&DataType::Int64)?;
    Ok(casted.i64()?.into_iter().flatten().collect())
}

/// Removes the grouping column from a frame, returning its values.
fn pop_grouping(
    mut frame: DataFrame,
    grouping_column: &str,
) -> Result<(DataFrame, Vec<i64>), PipelineError> {
    let column = frame.drop_in_place(grouping_column)?;
    let casted = column.cast(&DataType::Int64)?;
    let ids: Vec<i64> = casted.i64()?.into_iter().flatten().collect();
    Ok((frame, ids))
}

fn assert_disjoint(train_ids: &[i64], test_ids: &[i64]) -> Result<(), PipelineError> {
    let train: BTreeSet<i64> = train_ids.iter().copied().collect();
    let overlap: BTreeSet<i64> = test_ids
        .iter()
        .copied()
        .filter(|id| train.contains(id))
        .collect();
    if !overlap.is_empty() {
        return Err(PipelineError::LeakageDetected {
            overlap: overlap.len(),
            sample: overlap.into_iter().take(5).collect(),
        });
    }
    Ok(())
}

/// Reindexes the test frame to the training columns.
///
/// A train column absent from test (an engineered feature, say) is
/// synthesized as nulls when the imputation record has a fill for it; with
/// no fill the mismatch cannot be resolved and the run aborts. Extra test
/// columns are dropped by the projection, and recorded fills are replayed
/// at the end so synthesized and pre-existing nulls are treated alike.
fn align_test_columns(
    test: DataFrame,
    train_columns: &[String],
    record: &ImputationRecord,
) -> Result<DataFrame, PipelineError> {
    let height = test.height();
    let mut test = test;
    let mut unresolved = Vec::new();
    for name in train_columns {
        if test.column(name).is_ok() {
            continue;
        }
        if record.fill(name).is_some() {
            debug!("Test partition lacks '{name}'; synthesizing it from the recorded fill.");
            test.with_column(Series::new(name.as_str().into(), vec![None::<f64>; height]))?;
        } else {
            unresolved.push(name.clone());
        }
    }
    if !unresolved.is_empty() {
        return Err(PipelineError::ColumnMismatch {
            missing: unresolved,
        });
    }
    let projected = test.select(train_columns.iter().map(|name| name.as_str()))?;
    Ok(impute::apply_record(record, projected)?)
}

/// Rebuilds the persisted layout: outcome first, features, grouping last.
fn outcome_first(
    outcome_column: &str,
    y: &[f64],
    x: &DataFrame,
) -> Result<DataFrame, PipelineError> {
    let mut columns: Vec<Column> = vec![Series::new(outcome_column.into(), y.to_vec()).into()];
    columns.extend(x.get_columns().iter().cloned());
    Ok(DataFrame::new(columns)?)
}
