//! # Run Reports
//!
//! When an algorithm cannot be trained, the run still leaves a tabular
//! trace behind: a one-row error report naming the variable, the
//! algorithm, what went wrong, and the outcome label distribution of both
//! partitions. Reports from algorithms that did train are stacked into a
//! single meta report at the end of the run.

use itertools::Itertools;
use polars::prelude::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
}

/// Renders a label distribution as `{label: count, …}`, labels ascending.
///
/// Integral labels print without a decimal point, matching how binary
/// outcomes appear in the matrices themselves.
pub fn value_counts(values: &[f64]) -> String {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let mut entries: Vec<(f64, usize)> = Vec::new();
    for &value in &sorted {
        match entries.last_mut() {
            Some((label, count)) if *label == value => *count += 1,
            _ => entries.push((value, 1)),
        }
    }

    let body = entries
        .iter()
        .map(|&(label, count)| format!("{}: {count}", render_label(label)))
        .join(", ");
    format!("{{{body}}}")
}

fn render_label(label: f64) -> String {
    if label.fract() == 0.0 && label.is_finite() && label.abs() < 9.0e15 {
        format!("{}", label as i64)
    } else {
        format!("{label}")
    }
}

/// The one-row degraded report for an algorithm that could not train.
pub fn error_report_frame(
    variable: &str,
    algorithm: &str,
    error: &str,
    y_train: &[f64],
    y_test: &[f64],
) -> Result<DataFrame, ReportError> {
    let frame = DataFrame::new(vec![
        Series::new("variable".into(), vec![variable]).into(),
        Series::new("algorithm".into(), vec![algorithm]).into(),
        Series::new("error".into(), vec![error]).into(),
        Series::new("y_train_counts".into(), vec![value_counts(y_train)]).into(),
        Series::new("y_test_counts".into(), vec![value_counts(y_test)]).into(),
    ])?;
    Ok(frame)
}

/// Stacks a per-algorithm report onto the meta-report accumulation.
pub fn append_meta(
    accumulated: Option<DataFrame>,
    report: DataFrame,
) -> Result<DataFrame, ReportError> {
    match accumulated {
        None => Ok(report),
        Some(meta) => Ok(meta.vstack(&report)?),
    }
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_counts_render_in_label_order() {
        let labels = [1.0, 0.0, 0.0, 1.0, 0.0];
        assert_eq!(value_counts(&labels), "{0: 3, 1: 2}");
    }

    #[test]
    fn fractional_labels_keep_their_decimals() {
        assert_eq!(value_counts(&[0.5, 0.5, 2.0]), "{0.5: 2, 2: 1}");
        assert_eq!(value_counts(&[]), "{}");
    }

    #[test]
    fn error_report_carries_both_distributions() {
        let frame = error_report_frame(
            "CRP",
            "l1-logistic",
            "insufficient-samples",
            &[0.0, 0.0, 1.0],
            &[0.0],
        )
        .unwrap();

        assert_eq!(frame.height(), 1);
        let names: Vec<String> = frame
            .get_column_names()
            .iter()
            .map(|name| name.to_string())
            .collect();
        assert_eq!(
            names,
            vec!["variable", "algorithm", "error", "y_train_counts", "y_test_counts"]
        );
        let counts = frame
            .column("y_train_counts")
            .unwrap()
            .str()
            .unwrap()
            .get(0)
            .unwrap();
        assert_eq!(counts, "{0: 2, 1: 1}");
    }

    #[test]
    fn meta_report_stacks_rows_in_arrival_order() {
        let first = error_report_frame("CRP", "a", "insufficient-samples", &[0.0], &[1.0]).unwrap();
        let second = error_report_frame("CRP", "b", "insufficient-samples", &[0.0], &[1.0]).unwrap();

        let meta = append_meta(None, first).unwrap();
        let meta = append_meta(Some(meta), second).unwrap();
        assert_eq!(meta.height(), 2);
        let name = meta.column("algorithm").unwrap().str().unwrap().get(1).unwrap();
        assert_eq!(name, "b");
    }
}
