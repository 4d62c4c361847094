//! Explicit per-stage artifact manifests.
//!
//! A manifest enumerates every file a stage produces. It is both the
//! idempotency predicate ("all present and non-empty means done") and the
//! exact deletion set for a scoped re-run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::StageName;
use crate::errors::StageError;

/// The expected outputs of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageManifest {
    stage: StageName,
    artifacts: Vec<String>,
}

impl StageManifest {
    /// Creates a manifest.
    ///
    /// Artifact names must be plain file names: no separators, no `..`.
    pub fn new<I, S>(stage: StageName, artifacts: I) -> Result<Self, StageError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let artifacts: Vec<String> = artifacts.into_iter().map(Into::into).collect();
        if let Some(bad) = artifacts.iter().find(|name| !is_plain_file_name(name)) {
            return Err(StageError::Precondition {
                stage,
                message: format!("artifact name '{bad}' is not a plain file name"),
            });
        }
        Ok(Self { stage, artifacts })
    }

    /// The stage this manifest belongs to.
    #[must_use]
    pub fn stage(&self) -> StageName {
        self.stage
    }

    /// The artifact names.
    #[must_use]
    pub fn artifacts(&self) -> &[String] {
        &self.artifacts
    }

    /// Whether the manifest lists no artifacts.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    /// Absolute paths of the artifacts under `dir`.
    #[must_use]
    pub fn paths(&self, dir: &Path) -> Vec<PathBuf> {
        self.artifacts.iter().map(|name| dir.join(name)).collect()
    }

    /// Artifacts that are absent or empty under `dir`.
    pub async fn missing(&self, dir: &Path) -> Vec<String> {
        let mut missing = Vec::new();
        for name in &self.artifacts {
            if !artifact_present(&dir.join(name)).await {
                missing.push(name.clone());
            }
        }
        missing
    }

    /// Returns true if every artifact exists with non-zero size.
    ///
    /// An empty manifest is never satisfied, so a stage that declares no
    /// outputs always runs.
    pub async fn is_satisfied(&self, dir: &Path) -> bool {
        !self.is_empty() && self.missing(dir).await.is_empty()
    }

    /// Deletes exactly this manifest's artifacts from `dir`.
    ///
    /// Absent files are not an error. Returns the names actually removed.
    pub async fn invalidate(&self, dir: &Path) -> Result<Vec<String>, StageError> {
        let mut removed = Vec::new();
        for name in &self.artifacts {
            let path = dir.join(name);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(stage = %self.stage, artifact = %name, "Removed artifact");
                    removed.push(name.clone());
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(stage = %self.stage, artifact = %name, error = %e, "Failed to remove artifact");
                    return Err(StageError::Artifact {
                        stage: self.stage,
                        source: e,
                    });
                }
            }
        }
        info!(stage = %self.stage, removed = removed.len(), "Invalidated stage artifacts");
        Ok(removed)
    }
}

/// Manifests for every stage, plus the upstream inputs each stage requires.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestSet {
    manifests: BTreeMap<StageName, StageManifest>,
    required_inputs: BTreeMap<StageName, Vec<String>>,
}

impl ManifestSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a stage manifest.
    #[must_use]
    pub fn with_manifest(mut self, manifest: StageManifest) -> Self {
        self.manifests.insert(manifest.stage(), manifest);
        self
    }

    /// Declares artifacts a stage needs before it can be re-run.
    #[must_use]
    pub fn with_required_inputs<I, S>(mut self, stage: StageName, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_inputs
            .insert(stage, inputs.into_iter().map(Into::into).collect());
        self
    }

    /// The manifest of a stage.
    #[must_use]
    pub fn get(&self, stage: StageName) -> Option<&StageManifest> {
        self.manifests.get(&stage)
    }

    /// The manifest of a stage, or an empty one.
    #[must_use]
    pub fn get_or_empty(&self, stage: StageName) -> StageManifest {
        self.manifests.get(&stage).cloned().unwrap_or(StageManifest {
            stage,
            artifacts: Vec::new(),
        })
    }

    /// Upstream inputs required by a stage.
    #[must_use]
    pub fn required_inputs(&self, stage: StageName) -> &[String] {
        self.required_inputs
            .get(&stage)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The first required input missing under `dir`, if any.
    pub async fn first_missing_input(&self, stage: StageName, dir: &Path) -> Option<String> {
        for name in self.required_inputs(stage) {
            if !artifact_present(&dir.join(name)).await {
                return Some(name.clone());
            }
        }
        None
    }

    /// Iterates over all registered manifests.
    pub fn iter(&self) -> impl Iterator<Item = &StageManifest> {
        self.manifests.values()
    }
}

async fn artifact_present(path: &Path) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) => meta.is_file() && meta.len() > 0,
        Err(_) => false,
    }
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
}
