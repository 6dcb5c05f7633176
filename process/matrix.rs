//! # Feature-Matrix I/O and Provenance
//!
//! This module is the exclusive entry and exit point for feature matrices on
//! disk. Matrices are tab-separated files that may open with a provenance
//! block: `#`-prefixed comment lines describing where the file came from and
//! which processing steps produced it, followed by a blank line, the column
//! header, and the data rows. Missing values are empty cells.
//!
//! - Reading skips the provenance block and hands back a `polars` frame.
//! - `nan_to_null` folds the upstream NaN encoding of a missing cell into
//!   the null representation the rest of the pipeline reads.
//! - Writing goes through a temporary sibling file which is renamed into
//!   place once the contents are complete, so a crashed run never leaves a
//!   truncated matrix behind a cache-hit check.
//! - The numeric accessors convert frame columns into the `ndarray`
//!   structures consumed by rankers and predictors, rejecting missing or
//!   non-numeric data with actionable errors.

use chrono::Local;
use itertools::Itertools;
use log::{debug, info};
use ndarray::{Array2, ShapeBuilder};
use polars::prelude::*;
use std::fs::{self, File};
use std::io::{BufWriter, Cursor, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Prefix marking provenance lines at the top of a matrix file.
pub const COMMENT_PREFIX: &str = "#";

/// A comprehensive error type for matrix reading, writing, and conversion.
#[derive(Error, Debug)]
pub enum MatrixError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TSV writer error: {0}")]
    Csv(#[from] csv::Error),
    #[error("The required column '{0}' was not found in the matrix.")]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error(
        "Missing or null values remain in column '{0}' at a stage that requires complete data."
    )]
    MissingValuesFound(String),
    #[error("The matrix file '{0}' contains no column header line.")]
    EmptyMatrix(String),
    #[error("Partition frames disagree on layout: {0}")]
    PartitionMismatch(String),
}

/// Processing history accumulated while a matrix is built.
///
/// Each pipeline stage returns the names it touched and the orchestrator
/// extends this log, so the history travels forward explicitly instead of
/// living in hidden mutable state. The log is rendered into the provenance
/// header of the processed matrix.
#[derive(Debug, Clone, Default)]
pub struct ProcessingLog {
    pub added_features: Vec<String>,
    pub removed_features: Vec<String>,
    pub eliminated_features: Vec<String>,
    pub imputation_note: String,
    pub selection_note: String,
}

/// Reads a tab-separated matrix file, skipping any provenance block.
pub fn read_matrix(path: &Path) -> Result<DataFrame, MatrixError> {
    debug!("Loading matrix from '{}'", path.display());
    let raw = fs::read_to_string(path)?;

    // Strip comment lines and any blank separator lines before the header.
    let mut body = String::with_capacity(raw.len());
    let mut seen_header = false;
    for line in raw.lines() {
        if line.starts_with(COMMENT_PREFIX) {
            continue;
        }
        if !seen_header && line.trim().is_empty() {
            continue;
        }
        seen_header = true;
        body.push_str(line);
        body.push('\n');
    }
    if !seen_header {
        return Err(MatrixError::EmptyMatrix(path.display().to_string()));
    }

    let df = CsvReader::new(Cursor::new(body.into_bytes()))
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
        )
        .finish()?;
    Ok(df)
}

/// Rewrites NaN cells in float columns as nulls.
///
/// Upstream exports use NaN interchangeably with an empty cell for a
/// missing measurement. Missing-value handling reads nulls only, so both
/// forms are normalized to one representation before any statistic is
/// computed.
pub fn nan_to_null(frame: DataFrame) -> Result<DataFrame, MatrixError> {
    let mut frame = frame;
    let names: Vec<String> = frame
        .get_column_names()
        .iter()
        .map(|name| name.to_string())
        .collect();
    for name in &names {
        let column = frame.column(name)?;
        if !matches!(column.dtype(), DataType::Float64 | DataType::Float32) {
            continue;
        }
        let casted = column.cast(&DataType::Float64)?;
        let chunked = casted.f64()?;
        let nan_cells = chunked
            .into_iter()
            .flatten()
            .filter(|value| value.is_nan())
            .count();
        if nan_cells == 0 {
            continue;
        }
        debug!("Feature '{name}': treating {nan_cells} NaN cell(s) as missing.");
        let values: Vec<Option<f64>> = chunked
            .into_iter()
            .map(|value| value.filter(|cell| !cell.is_nan()))
            .collect();
        frame.with_column(Series::new(name.as_str().into(), values))?;
    }
    Ok(frame)
}

/// Writes a matrix as a tab-separated file with an optional provenance block.
///
/// Header lines are emitted verbatim behind the comment prefix; an empty
/// header slice produces a plain headerless TSV. The file is first written to
/// a `.tmp` sibling and renamed into place.
pub fn write_matrix(
    path: &Path,
    frame: &DataFrame,
    header_lines: &[String],
) -> Result<(), MatrixError> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    {
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        for line in header_lines {
            if line.is_empty() {
                writeln!(writer, "{COMMENT_PREFIX}")?;
            } else {
                writeln!(writer, "{COMMENT_PREFIX} {line}")?;
            }
        }
        if !header_lines.is_empty() {
            writeln!(writer)?;
        }

        let mut body = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .from_writer(writer);
        let names: Vec<String> = frame
            .get_column_names()
            .iter()
            .map(|name| name.to_string())
            .collect();
        body.write_record(&names)?;
        for row in 0..frame.height() {
            let mut record = Vec::with_capacity(names.len());
            for column in frame.get_columns() {
                record.push(render_cell(column.get(row)?));
            }
            body.write_record(&record)?;
        }
        body.flush()?;
    }

    fs::rename(&tmp_path, path)?;
    info!(
        "Wrote matrix with {} rows and {} columns to '{}'",
        frame.height(),
        frame.width(),
        path.display()
    );
    Ok(())
}

fn render_cell(value: AnyValue) -> String {
    match value {
        AnyValue::Null => String::new(),
        AnyValue::String(text) => text.to_string(),
        AnyValue::StringOwned(ref text) => text.to_string(),
        AnyValue::Float64(v) => format!("{v}"),
        AnyValue::Float32(v) => format!("{v}"),
        AnyValue::Int64(v) => v.to_string(),
        AnyValue::Int32(v) => v.to_string(),
        AnyValue::UInt64(v) => v.to_string(),
        AnyValue::UInt32(v) => v.to_string(),
        AnyValue::Boolean(v) => (v as u8).to_string(),
        other => other.to_string(),
    }
}

/// Recombines two partitions into one frame whose rows follow the original
/// raw-matrix order.
///
/// `train_rows` and `test_rows` give, for each partition row, its position in
/// the source matrix the partitions were carved from. Both frames must share
/// one column layout.
pub fn interleave_partitions(
    train: &DataFrame,
    test: &DataFrame,
    train_rows: &[usize],
    test_rows: &[usize],
) -> Result<DataFrame, MatrixError> {
    let names: Vec<String> = train
        .get_column_names()
        .iter()
        .map(|name| name.to_string())
        .collect();
    let test_names: Vec<String> = test
        .get_column_names()
        .iter()
        .map(|name| name.to_string())
        .collect();
    if names != test_names {
        return Err(MatrixError::PartitionMismatch(format!(
            "train columns {names:?} vs test columns {test_names:?}"
        )));
    }
    if train.height() != train_rows.len() || test.height() != test_rows.len() {
        return Err(MatrixError::PartitionMismatch(
            "row-position bookkeeping does not match partition heights".to_string(),
        ));
    }

    // (source position, from test?, row within partition), sorted by source.
    let total = train_rows.len() + test_rows.len();
    let mut order: Vec<(usize, bool, usize)> = Vec::with_capacity(total);
    for (row, &position) in train_rows.iter().enumerate() {
        order.push((position, false, row));
    }
    for (row, &position) in test_rows.iter().enumerate() {
        order.push((position, true, row));
    }
    order.sort_unstable_by_key(|&(position, _, _)| position);

    let mut columns: Vec<Column> = Vec::with_capacity(names.len());
    for name in &names {
        let train_column = train.column(name)?;
        let test_column = test.column(name)?;
        let column: Column = match train_column.dtype() {
            DataType::Int64 => {
                let a = train_column.i64()?;
                let b = test_column.i64()?;
                let mut values: Vec<Option<i64>> = Vec::with_capacity(total);
                for &(_, from_test, row) in &order {
                    values.push(if from_test { b.get(row) } else { a.get(row) });
                }
                Series::new(name.as_str().into(), values).into()
            }
            DataType::String => {
                let a = train_column.str()?;
                let b = test_column.str()?;
                let mut values: Vec<Option<String>> = Vec::with_capacity(total);
                for &(_, from_test, row) in &order {
                    let text = if from_test { b.get(row) } else { a.get(row) };
                    values.push(text.map(|t| t.to_string()));
                }
                Series::new(name.as_str().into(), values).into()
            }
            _ => {
                let a = train_column.cast(&DataType::Float64)?;
                let b = test_column.cast(&DataType::Float64)?;
                let a = a.f64()?;
                let b = b.f64()?;
                let mut values: Vec<Option<f64>> = Vec::with_capacity(total);
                for &(_, from_test, row) in &order {
                    values.push(if from_test { b.get(row) } else { a.get(row) });
                }
                Series::new(name.as_str().into(), values).into()
            }
        };
        columns.push(column);
    }
    Ok(DataFrame::new(columns)?)
}

/// Extracts a complete numeric column as `f64` values.
pub fn numeric_column(df: &DataFrame, column_name: &str) -> Result<Vec<f64>, MatrixError> {
    let column = df
        .column(column_name)
        .map_err(|_| MatrixError::ColumnNotFound(column_name.to_string()))?;
    column_values(column)
}

/// Converts a column handle into complete `f64` values.
pub fn column_values(column: &Column) -> Result<Vec<f64>, MatrixError> {
    let column_name = column.name().to_string();
    if column.null_count() > 0 {
        return Err(MatrixError::MissingValuesFound(column_name));
    }

    let casted = match column.cast(&DataType::Float64) {
        Ok(casted) => casted,
        Err(_) => {
            return Err(MatrixError::ColumnWrongType {
                column_name,
                expected_type: "f64 (numeric)",
                found_type: format!("{:?}", column.dtype()),
            });
        }
    };
    if casted.null_count() > 0 {
        return Err(MatrixError::ColumnWrongType {
            column_name,
            expected_type: "f64 (numeric)",
            found_type: format!("{:?}", column.dtype()),
        });
    }

    let chunked = casted.f64()?.rechunk();
    Ok(chunked.into_no_null_iter().collect())
}

/// Converts the named columns into a dense `[rows, columns]` matrix.
pub fn numeric_matrix(df: &DataFrame, columns: &[String]) -> Result<Array2<f64>, MatrixError> {
    let height = df.height();
    let mut buffer = Vec::with_capacity(height * columns.len());
    for name in columns {
        let mut column = numeric_column(df, name)?;
        buffer.append(&mut column);
    }
    Ok(Array2::from_shape_vec((height, columns.len()).f(), buffer)
        .expect("column buffers must agree on row count"))
}

/// Builds the file-identity half of a provenance header.
pub fn build_file_summary(
    matrix_file_name: &str,
    source_module: &str,
    command: &str,
    num_rows: usize,
    raw_matrix_name: &str,
) -> Vec<String> {
    vec![
        matrix_file_name.to_string(),
        format!("Created: {}", Local::now().format("%Y-%m-%d %H:%M")),
        format!("Source: {source_module}"),
        format!("Command: {command}"),
        format!("Number of Observations: {num_rows}"),
        String::new(),
        "Overview:".to_string(),
        format!("This file is a post-processed version of {raw_matrix_name}."),
    ]
}

/// Renders the processing history into provenance header lines.
pub fn build_processing_summary(log: &ProcessingLog) -> Vec<String> {
    let mut summary = vec![
        "This matrix is the result of the following processing steps on the raw matrix:"
            .to_string(),
        "  * Adding the following features:".to_string(),
    ];
    for feature in &log.added_features {
        summary.push(format!("      {feature}"));
    }
    summary.push(format!("  * {}", log.imputation_note));
    summary.push("  * Manually removing low-information features:".to_string());
    summary.push(format!("      [{}]", quoted_list(&log.removed_features)));
    summary.push(format!("  * {}", log.selection_note));
    summary.push("      The following features were eliminated:".to_string());
    summary.push(format!("        [{}]", quoted_list(&log.eliminated_features)));
    summary
}

fn quoted_list(names: &[String]) -> String {
    names.iter().map(|name| format!("'{name}'")).join(", ")
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use tempfile::tempdir;

    fn sample_frame() -> DataFrame {
        DataFrame::new(vec![
            Series::new("pat_id".into(), vec![1i64, 1, 2, 3]).into(),
            Series::new("label".into(), vec![0.0f64, 1.0, 0.0, 1.0]).into(),
            Series::new("ALBUMIN".into(), vec![Some(3.5f64), None, Some(2.8), Some(4.1)]).into(),
        ])
        .unwrap()
    }

    #[test]
    fn write_then_read_round_trips_through_provenance_block() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("matrix.tab");
        let header = vec![
            "matrix.tab".to_string(),
            String::new(),
            "Overview:".to_string(),
        ];

        write_matrix(&path, &sample_frame(), &header).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("# matrix.tab\n"));
        assert!(contents.contains("\n#\n"));

        let reloaded = read_matrix(&path).unwrap();
        assert_eq!(reloaded.height(), 4);
        assert_eq!(reloaded.width(), 3);
        let ids = numeric_column(&reloaded, "pat_id").unwrap();
        assert_abs_diff_eq!(ids[3], 3.0, epsilon = 1e-12);
    }

    #[test]
    fn null_cells_survive_a_round_trip_as_nulls() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("matrix.tab");
        write_matrix(&path, &sample_frame(), &[]).unwrap();

        let reloaded = read_matrix(&path).unwrap();
        assert_eq!(reloaded.column("ALBUMIN").unwrap().null_count(), 1);
    }

    #[test]
    fn nan_cells_are_normalized_to_missing() {
        let frame = DataFrame::new(vec![
            Series::new("CRP".into(), vec![Some(1.0f64), Some(f64::NAN), None, Some(2.0)]).into(),
            Series::new("ward".into(), vec![Some("icu"), None, Some("ed"), Some("ed")]).into(),
        ])
        .unwrap();

        let normalized = nan_to_null(frame).unwrap();
        assert_eq!(normalized.column("CRP").unwrap().null_count(), 2);
        // Non-float columns pass through untouched.
        assert_eq!(normalized.column("ward").unwrap().null_count(), 1);

        let observed: Vec<f64> = normalized
            .column("CRP")
            .unwrap()
            .f64()
            .unwrap()
            .into_iter()
            .flatten()
            .collect();
        assert_eq!(observed, vec![1.0, 2.0]);
    }

    #[test]
    fn headerless_write_produces_no_comment_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plain.tab");
        write_matrix(&path, &sample_frame(), &[]).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("pat_id\tlabel\tALBUMIN"));
    }

    #[test]
    fn read_rejects_a_file_with_only_comments() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.tab");
        fs::write(&path, "# nothing here\n#\n").unwrap();
        match read_matrix(&path) {
            Err(MatrixError::EmptyMatrix(_)) => {}
            other => panic!("Expected EmptyMatrix, got {other:?}"),
        }
    }

    #[test]
    fn interleave_restores_source_row_order() {
        let train = DataFrame::new(vec![
            Series::new("pat_id".into(), vec![1i64, 3]).into(),
            Series::new("x".into(), vec![10.0f64, 30.0]).into(),
        ])
        .unwrap();
        let test = DataFrame::new(vec![
            Series::new("pat_id".into(), vec![2i64, 4]).into(),
            Series::new("x".into(), vec![20.0f64, 40.0]).into(),
        ])
        .unwrap();

        let combined = interleave_partitions(&train, &test, &[0, 2], &[1, 3]).unwrap();
        let x = numeric_column(&combined, "x").unwrap();
        assert_eq!(x, vec![10.0, 20.0, 30.0, 40.0]);
        let ids = numeric_column(&combined, "pat_id").unwrap();
        assert_eq!(ids, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn interleave_rejects_mismatched_layouts() {
        let train = DataFrame::new(vec![Series::new("a".into(), vec![1.0f64]).into()]).unwrap();
        let test = DataFrame::new(vec![Series::new("b".into(), vec![1.0f64]).into()]).unwrap();
        match interleave_partitions(&train, &test, &[0], &[1]) {
            Err(MatrixError::PartitionMismatch(_)) => {}
            other => panic!("Expected PartitionMismatch, got {other:?}"),
        }
    }

    #[test]
    fn numeric_matrix_is_row_major_by_observation() {
        let frame = DataFrame::new(vec![
            Series::new("a".into(), vec![1.0f64, 2.0, 3.0]).into(),
            Series::new("b".into(), vec![4.0f64, 5.0, 6.0]).into(),
        ])
        .unwrap();
        let matrix =
            numeric_matrix(&frame, &["a".to_string(), "b".to_string()]).unwrap();
        assert_eq!(matrix.shape(), &[3, 2]);
        assert_abs_diff_eq!(matrix[[1, 0]], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(matrix[[1, 1]], 5.0, epsilon = 1e-12);
    }

    #[test]
    fn numeric_column_rejects_missing_values_and_text() {
        let frame = DataFrame::new(vec![
            Series::new("partial".into(), vec![Some(1.0f64), None]).into(),
            Series::new("text".into(), vec!["a", "b"]).into(),
        ])
        .unwrap();
        match numeric_column(&frame, "partial") {
            Err(MatrixError::MissingValuesFound(name)) => assert_eq!(name, "partial"),
            other => panic!("Expected MissingValuesFound, got {other:?}"),
        }
        match numeric_column(&frame, "absent") {
            Err(MatrixError::ColumnNotFound(name)) => assert_eq!(name, "absent"),
            other => panic!("Expected ColumnNotFound, got {other:?}"),
        }
    }

    #[test]
    fn processing_summary_lists_feature_histories() {
        let log = ProcessingLog {
            added_features: vec!["I(CRP)".to_string()],
            removed_features: vec!["pat_id".to_string(), "CRP.1".to_string()],
            eliminated_features: vec!["noise".to_string()],
            imputation_note: "Imputing missing values with the mean value of each column."
                .to_string(),
            selection_note: "Algorithmically selecting the top 5 features via recursive feature elimination."
                .to_string(),
        };
        let summary = build_processing_summary(&log);
        assert!(summary.iter().any(|line| line.contains("I(CRP)")));
        assert!(summary.iter().any(|line| line.contains("'pat_id', 'CRP.1'")));
        assert!(summary.iter().any(|line| line.contains("top 5 features")));
    }
}
