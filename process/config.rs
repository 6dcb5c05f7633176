//! # Run Configuration
//!
//! Everything a pipeline run needs, declared up front and persistable as
//! human-readable TOML. A configuration is validated before any data is
//! touched, so structurally impossible runs (a second change feature, a
//! grouping column doubling as the outcome) fail fast instead of after
//! minutes of matrix work.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::CacheMode;
use crate::engineer::{self, EngineerError, FeatureSpec, RowFilter};
use crate::impute::ImputationPlan;
use crate::select::SelectionSpec;
use crate::split::SplitSpec;
use crate::train::{AlgorithmSpec, PredictionProblem, ProviderConstraints};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error(transparent)]
    Engineer(#[from] EngineerError),
    #[error("The predicted variable must not be empty.")]
    EmptyVariable,
    #[error("The requested matrix size must be at least one row.")]
    ZeroRows,
    #[error("The grouping column '{0}' cannot double as the outcome column.")]
    GroupingOutcomeClash(String),
    #[error("The test fraction must lie strictly between 0 and 1. (Got: {0})")]
    InvalidSplitFraction(f64),
    #[error("The selection fraction must lie in (0, 1]. (Got: {0})")]
    InvalidSelectionFraction(f64),
}

fn default_grouping_column() -> String {
    "pat_id".to_string()
}

fn default_seed() -> u64 {
    123456789
}

/// Full description of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// The clinical variable being predicted, e.g. a lab component name.
    pub variable: String,
    /// How many raw observation rows to request from the provider.
    pub num_rows: usize,
    /// Column carrying the entity id that grouping must respect.
    #[serde(default = "default_grouping_column")]
    pub grouping_column: String,
    /// Column carrying the supervised outcome.
    pub outcome_column: String,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub problem: PredictionProblem,
    #[serde(default)]
    pub cache: CacheMode,
    #[serde(default)]
    pub features_to_remove: Vec<String>,
    #[serde(default)]
    pub split: SplitSpec,
    #[serde(default)]
    pub constraints: ProviderConstraints,
    #[serde(default)]
    pub imputation: ImputationPlan,
    #[serde(default)]
    pub selection: SelectionSpec,
    #[serde(default)]
    pub features_to_add: Vec<FeatureSpec>,
    #[serde(default)]
    pub row_filters: Vec<RowFilter>,
    #[serde(default)]
    pub algorithms: Vec<AlgorithmSpec>,
}

impl PipelineConfig {
    /// A configuration with the documented defaults: `pat_id` grouping,
    /// mean imputation, recursive-elimination selection at 5%, cache reuse.
    pub fn new(variable: &str, outcome_column: &str, num_rows: usize) -> Self {
        Self {
            variable: variable.to_string(),
            num_rows,
            grouping_column: default_grouping_column(),
            outcome_column: outcome_column.to_string(),
            seed: default_seed(),
            problem: PredictionProblem::default(),
            cache: CacheMode::default(),
            features_to_remove: Vec::new(),
            split: SplitSpec::default(),
            constraints: ProviderConstraints::default(),
            imputation: ImputationPlan::default(),
            selection: SelectionSpec::default(),
            features_to_add: Vec::new(),
            row_filters: Vec::new(),
            algorithms: Vec::new(),
        }
    }

    /// Checks everything that can be checked without data.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.variable.trim().is_empty() {
            return Err(ConfigError::EmptyVariable);
        }
        if self.num_rows == 0 {
            return Err(ConfigError::ZeroRows);
        }
        if self.grouping_column == self.outcome_column {
            return Err(ConfigError::GroupingOutcomeClash(
                self.grouping_column.clone(),
            ));
        }
        if !(self.split.test_fraction > 0.0 && self.split.test_fraction < 1.0) {
            return Err(ConfigError::InvalidSplitFraction(self.split.test_fraction));
        }
        if !(self.selection.fraction > 0.0 && self.selection.fraction <= 1.0) {
            return Err(ConfigError::InvalidSelectionFraction(
                self.selection.fraction,
            ));
        }
        engineer::validate_feature_specs(&self.features_to_add)?;
        Ok(())
    }

    /// The invocation string recorded in provenance headers.
    pub fn invocation(&self) -> String {
        format!("MatrixPipeline(\"{}\", {})", self.variable, self.num_rows)
    }

    /// Saves the configuration to a file in a human-readable TOML format.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    /// Loads a configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let config = toml::from_str(&toml_string)?;
        Ok(config)
    }
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use crate::engineer::{ChangeMethod, IndicatorPredicate};
    use crate::split::DEFAULT_TEST_FRACTION;
    use tempfile::tempdir;

    fn base_config() -> PipelineConfig {
        PipelineConfig::new("CRP", "abnormal_yn", 4000)
    }

    #[test]
    fn defaults_match_the_documented_run_shape() {
        let config = base_config();
        assert_eq!(config.grouping_column, "pat_id");
        assert_eq!(config.split.test_fraction, DEFAULT_TEST_FRACTION);
        assert_eq!(config.cache, CacheMode::Reuse);
        assert!(matches!(
            config.imputation,
            ImputationPlan::PerFeature { ref overrides } if overrides.is_empty()
        ));
        config.validate().unwrap();
    }

    #[test]
    fn invocation_string_names_variable_and_size() {
        assert_eq!(base_config().invocation(), "MatrixPipeline(\"CRP\", 4000)");
    }

    #[test]
    fn structural_problems_fail_validation() {
        let mut config = base_config();
        config.variable = "  ".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::EmptyVariable)));

        let mut config = base_config();
        config.num_rows = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroRows)));

        let mut config = base_config();
        config.outcome_column = "pat_id".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::GroupingOutcomeClash(_))
        ));

        let mut config = base_config();
        config.split.test_fraction = 1.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSplitFraction(_))
        ));

        let mut config = base_config();
        config.selection.fraction = 0.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSelectionFraction(_))
        ));
    }

    #[test]
    fn a_second_change_feature_fails_validation_before_any_data() {
        let change = |old: &str, new: &str| FeatureSpec::Change {
            feature_old: old.to_string(),
            feature_new: new.to_string(),
            method: ChangeMethod::Percent,
            param: 0.1,
        };
        let mut config = base_config();
        config.features_to_add = vec![change("CRP_old", "CRP_new"), change("WBC_old", "WBC_new")];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Engineer(EngineerError::MultipleChangeFeatures))
        ));
    }

    #[test]
    fn configurations_survive_a_toml_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.toml");

        let mut config = base_config();
        config.features_to_add = vec![FeatureSpec::Indicator {
            base: "CRP".to_string(),
            predicate: IndicatorPredicate::NonNull,
        }];
        config.features_to_remove = vec!["order_proc_id".to_string()];
        config.algorithms = vec![AlgorithmSpec::new("l1-logistic")];
        config.save(&path).unwrap();

        let reloaded = PipelineConfig::load(&path).unwrap();
        assert_eq!(reloaded.variable, "CRP");
        assert_eq!(reloaded.features_to_remove, vec!["order_proc_id".to_string()]);
        assert_eq!(reloaded.algorithms.len(), 1);
        assert!(matches!(
            reloaded.features_to_add[0],
            FeatureSpec::Indicator { .. }
        ));
    }

    #[test]
    fn minimal_toml_fills_in_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("minimal.toml");
        fs::write(
            &path,
            "variable = \"LAC\"\nnum_rows = 100\noutcome_column = \"abnormal_yn\"\n",
        )
        .unwrap();

        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.grouping_column, "pat_id");
        assert_eq!(config.seed, 123456789);
        assert_eq!(config.split.test_fraction, DEFAULT_TEST_FRACTION);
        config.validate().unwrap();
    }
}
