//! Artifact caching and the on-disk layout of a pipeline run.
//!
//! Expensive artifacts (raw and processed matrices, trained models) are
//! resolved through [`ArtifactCache`]: a missing file is a signal to
//! recompute, never an error. [`SlugPathResolver`] provides the default
//! filename templates, and [`RunManifest`] registers every artifact a run
//! writes, reporting duplicate registrations as an explicit outcome rather
//! than a failure.

use itertools::Itertools;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Failed to prepare artifact directory '{path}': {source}")]
    DirectoryCreation { path: String, source: io::Error },
}

/// Whether existing artifacts may satisfy a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheMode {
    /// Reuse any artifact that already exists on disk.
    #[default]
    Reuse,
    /// Ignore existing artifacts and rebuild everything.
    Flush,
}

/// The answer to a cache lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDecision {
    Reuse,
    Recompute,
}

/// Resolves artifact paths against the cache policy of the current run.
#[derive(Debug, Clone, Copy)]
pub struct ArtifactCache {
    mode: CacheMode,
}

impl ArtifactCache {
    pub fn new(mode: CacheMode) -> Self {
        Self { mode }
    }

    pub fn resolve(&self, path: &Path) -> CacheDecision {
        let decision = match self.mode {
            CacheMode::Flush => CacheDecision::Recompute,
            CacheMode::Reuse => {
                if path.exists() {
                    CacheDecision::Reuse
                } else {
                    CacheDecision::Recompute
                }
            }
        };
        debug!("Cache lookup for '{}': {:?}", path.display(), decision);
        decision
    }
}

/// The outcome of registering an artifact in the run manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted,
    AlreadyExists,
}

/// Registry of the artifacts written during a single run.
///
/// The manifest is single-writer and per-run. A second registration under
/// the same logical name returns [`RecordOutcome::AlreadyExists`]; callers
/// log and move on.
#[derive(Debug, Default)]
pub struct RunManifest {
    artifacts: BTreeMap<String, PathBuf>,
}

impl RunManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, name: &str, path: &Path) -> RecordOutcome {
        if self.artifacts.contains_key(name) {
            warn!("Artifact '{name}' is already registered; keeping the first entry.");
            return RecordOutcome::AlreadyExists;
        }
        self.artifacts.insert(name.to_string(), path.to_path_buf());
        RecordOutcome::Inserted
    }

    pub fn get(&self, name: &str) -> Option<&Path> {
        self.artifacts.get(name).map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.artifacts
            .iter()
            .map(|(name, path)| (name.as_str(), path.as_path()))
    }
}

/// Where the files of a run live.
///
/// Implementations map a predicted variable and artifact kind to a concrete
/// path, creating directories as needed.
pub trait PathResolver {
    /// Directory holding every artifact for `variable`; created on demand.
    fn data_dir(&self, variable: &str) -> Result<PathBuf, CacheError>;
    fn raw_matrix_path(&self, variable: &str, num_rows: usize) -> Result<PathBuf, CacheError>;
    fn processed_matrix_path(&self, variable: &str, num_rows: usize)
    -> Result<PathBuf, CacheError>;
    fn model_path(&self, variable: &str, algorithm: &str) -> Result<PathBuf, CacheError>;
    /// Per-algorithm report directory; created on demand.
    fn report_dir(&self, variable: &str, algorithm: &str) -> Result<PathBuf, CacheError>;
    fn algorithm_report_path(&self, variable: &str, algorithm: &str)
    -> Result<PathBuf, CacheError>;
    fn meta_report_path(&self, variable: &str) -> Result<PathBuf, CacheError>;
}

/// Default resolver: `<root>/<slug>/<slug>-...` with whitespace in the
/// variable collapsed to dashes.
#[derive(Debug, Clone)]
pub struct SlugPathResolver {
    data_root: PathBuf,
}

impl SlugPathResolver {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
        }
    }

    fn ensured(&self, dir: PathBuf) -> Result<PathBuf, CacheError> {
        fs::create_dir_all(&dir).map_err(|source| CacheError::DirectoryCreation {
            path: dir.display().to_string(),
            source,
        })?;
        Ok(dir)
    }
}

impl PathResolver for SlugPathResolver {
    fn data_dir(&self, variable: &str) -> Result<PathBuf, CacheError> {
        self.ensured(self.data_root.join(variable_slug(variable)))
    }

    fn raw_matrix_path(&self, variable: &str, num_rows: usize) -> Result<PathBuf, CacheError> {
        let slug = variable_slug(variable);
        Ok(self
            .data_dir(variable)?
            .join(format!("{slug}-matrix-{num_rows}-raw.tab")))
    }

    fn processed_matrix_path(
        &self,
        variable: &str,
        num_rows: usize,
    ) -> Result<PathBuf, CacheError> {
        let slug = variable_slug(variable);
        Ok(self
            .data_dir(variable)?
            .join(format!("{slug}-matrix-{num_rows}-processed.tab")))
    }

    fn model_path(&self, variable: &str, algorithm: &str) -> Result<PathBuf, CacheError> {
        let slug = variable_slug(variable);
        Ok(self
            .data_dir(variable)?
            .join(format!("{slug}-{algorithm}-model.toml")))
    }

    fn report_dir(&self, variable: &str, algorithm: &str) -> Result<PathBuf, CacheError> {
        let dir = self.data_dir(variable)?.join(algorithm);
        self.ensured(dir)
    }

    fn algorithm_report_path(
        &self,
        variable: &str,
        algorithm: &str,
    ) -> Result<PathBuf, CacheError> {
        let slug = variable_slug(variable);
        Ok(self
            .report_dir(variable, algorithm)?
            .join(format!("{slug}-{algorithm}-report.tab")))
    }

    fn meta_report_path(&self, variable: &str) -> Result<PathBuf, CacheError> {
        let slug = variable_slug(variable);
        Ok(self.data_dir(variable)?.join(format!("{slug}-report.tab")))
    }
}

/// Derives the train/test companion path of a processed matrix by renaming
/// the `matrix` segment of its file name.
pub fn companion_matrix_path(processed: &Path, role: &str) -> PathBuf {
    let file_name = processed
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let companion = file_name.replacen("matrix", &format!("{role}-matrix"), 1);
    processed.with_file_name(companion)
}

/// Collapses whitespace in a variable name to dashes for use in file names.
pub fn variable_slug(variable: &str) -> String {
    variable.split_whitespace().join("-")
}
