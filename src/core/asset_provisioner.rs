// Model asset staging
// Copies the model files a graph needs into a cache directory the runtime loads from

use crate::models::pose::{ModelComplexity, POSE_DETECTION_ASSET};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A model file to stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetSpec {
    /// File name inside the source directory
    pub name: String,
    /// File name inside the cache directory
    pub unique_key: String,
    /// Replace an already staged copy instead of reusing it
    #[serde(default)]
    pub overwrite: bool,
}

impl AssetSpec {
    /// Stage `name` under the same key, reusing an existing copy
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            unique_key: name.clone(),
            name,
            overwrite: false,
        }
    }

    pub fn with_unique_key(mut self, unique_key: impl Into<String>) -> Self {
        self.unique_key = unique_key.into();
        self
    }

    pub fn overwriting(mut self) -> Self {
        self.overwrite = true;
        self
    }

    /// Both names must be plain file names
    pub fn validate(&self) -> AssetResult<()> {
        for key in [&self.name, &self.unique_key] {
            let plain = !key.is_empty()
                && key != "."
                && key != ".."
                && !key.contains(|c| c == '/' || c == '\\');
            if !plain {
                return Err(AssetError::InvalidKey(key.clone()));
            }
        }
        Ok(())
    }
}

/// Assets required by the pose tracking graph
pub fn pose_assets(complexity: ModelComplexity) -> Vec<AssetSpec> {
    vec![
        AssetSpec::new(POSE_DETECTION_ASSET),
        AssetSpec::new(complexity.landmark_asset()),
    ]
}

/// Stages model assets from a read-only source directory into a cache
pub struct AssetProvisioner {
    source_dir: PathBuf,
    cache_dir: PathBuf,
}

impl AssetProvisioner {
    /// Create a provisioner, creating the cache directory if needed
    pub async fn new(source_dir: PathBuf, cache_dir: PathBuf) -> AssetResult<Self> {
        tokio::fs::create_dir_all(&cache_dir)
            .await
            .map_err(|e| AssetError::io(&cache_dir, e))?;
        Ok(Self {
            source_dir,
            cache_dir,
        })
    }

    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Location the runtime loads `unique_key` from
    pub fn staged_path(&self, unique_key: &str) -> PathBuf {
        self.cache_dir.join(unique_key)
    }

    pub async fn is_staged(&self, unique_key: &str) -> bool {
        tokio::fs::try_exists(self.staged_path(unique_key))
            .await
            .unwrap_or(false)
    }

    /// Stage one asset and return its cache path
    pub async fn prepare_asset(&self, spec: &AssetSpec) -> AssetResult<PathBuf> {
        spec.validate()?;

        let staged = self.staged_path(&spec.unique_key);
        if !spec.overwrite && self.is_staged(&spec.unique_key).await {
            debug!("Asset {} already staged at {:?}", spec.name, staged);
            return Ok(staged);
        }

        let source = self.source_dir.join(&spec.name);
        if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
            return Err(AssetError::NotFound(source));
        }

        // Copy next to the destination first so a half-written file is never loadable
        let partial = self.cache_dir.join(format!("{}.partial", spec.unique_key));
        tokio::fs::copy(&source, &partial)
            .await
            .map_err(|e| AssetError::io(&source, e))?;
        tokio::fs::rename(&partial, &staged)
            .await
            .map_err(|e| AssetError::io(&staged, e))?;

        info!("Staged asset {} at {:?}", spec.name, staged);
        Ok(staged)
    }

    /// Stage every asset in order, stopping at the first failure
    pub async fn prepare_all(&self, specs: &[AssetSpec]) -> AssetResult<Vec<PathBuf>> {
        let mut staged = Vec::with_capacity(specs.len());
        for spec in specs {
            staged.push(self.prepare_asset(spec).await?);
        }
        Ok(staged)
    }

    /// Remove every staged asset
    pub async fn clear_cache(&self) -> AssetResult<()> {
        if tokio::fs::try_exists(&self.cache_dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&self.cache_dir)
                .await
                .map_err(|e| AssetError::io(&self.cache_dir, e))?;
        }
        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(|e| AssetError::io(&self.cache_dir, e))?;
        Ok(())
    }

    /// Total size of staged files in bytes
    pub async fn cache_size(&self) -> AssetResult<u64> {
        let mut total_size = 0u64;
        let mut entries = tokio::fs::read_dir(&self.cache_dir)
            .await
            .map_err(|e| AssetError::io(&self.cache_dir, e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AssetError::io(&self.cache_dir, e))?
        {
            let metadata = entry
                .metadata()
                .await
                .map_err(|e| AssetError::io(&entry.path(), e))?;
            if metadata.is_file() {
                total_size += metadata.len();
            }
        }

        Ok(total_size)
    }
}

/// Error types for asset staging
#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error("Asset not found: {0:?}")]
    NotFound(PathBuf),

    #[error("Invalid asset key: {0:?}")]
    InvalidKey(String),

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl AssetError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        AssetError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub type AssetResult<T> = Result<T, AssetError>;

#[cfg(test)]
mod tests {
    use super::*;

    async fn provisioner_with(files: &[(&str, &str)]) -> (AssetProvisioner, PathBuf) {
        let root =
            std::env::temp_dir().join(format!("pose_tracker_assets_{}", uuid::Uuid::new_v4()));
        let source = root.join("source");
        tokio::fs::create_dir_all(&source).await.unwrap();
        for (name, contents) in files {
            tokio::fs::write(source.join(name), contents).await.unwrap();
        }
        let provisioner = AssetProvisioner::new(source, root.join("cache")).await.unwrap();
        (provisioner, root)
    }

    #[tokio::test]
    async fn test_prepare_asset_copies_into_cache() {
        let (provisioner, root) = provisioner_with(&[("pose_detection.bytes", "detector")]).await;

        let path = provisioner
            .prepare_asset(&AssetSpec::new("pose_detection.bytes"))
            .await
            .unwrap();

        assert_eq!(path, provisioner.staged_path("pose_detection.bytes"));
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"detector");
        assert!(provisioner.is_staged("pose_detection.bytes").await);
        assert_eq!(provisioner.cache_size().await.unwrap(), 8);

        tokio::fs::remove_dir_all(root).await.unwrap();
    }

    #[tokio::test]
    async fn test_overwrite_flag() {
        let (provisioner, root) = provisioner_with(&[("model.bytes", "v1")]).await;
        provisioner.prepare_asset(&AssetSpec::new("model.bytes")).await.unwrap();

        tokio::fs::write(provisioner.source_dir().join("model.bytes"), b"v2").await.unwrap();

        // Existing copy is reused
        let path = provisioner.prepare_asset(&AssetSpec::new("model.bytes")).await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"v1");

        // Overwriting replaces it
        let path = provisioner
            .prepare_asset(&AssetSpec::new("model.bytes").overwriting())
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"v2");

        tokio::fs::remove_dir_all(root).await.unwrap();
    }

    #[tokio::test]
    async fn test_prepare_all_stops_at_missing_asset() {
        let (provisioner, root) = provisioner_with(&[("pose_detection.bytes", "d")]).await;

        let result = provisioner.prepare_all(&pose_assets(ModelComplexity::Full)).await;
        match result {
            Err(AssetError::NotFound(path)) => {
                assert!(path.ends_with("pose_landmark_full.bytes"));
            }
            other => panic!("Expected NotFound, got {:?}", other),
        }

        tokio::fs::remove_dir_all(root).await.unwrap();
    }

    #[tokio::test]
    async fn test_unique_key_and_clear_cache() {
        let (provisioner, root) = provisioner_with(&[("model.bytes", "abc")]).await;

        let path = provisioner
            .prepare_asset(&AssetSpec::new("model.bytes").with_unique_key("renamed.bytes"))
            .await
            .unwrap();
        assert!(path.ends_with("renamed.bytes"));

        provisioner.clear_cache().await.unwrap();
        assert!(!provisioner.is_staged("renamed.bytes").await);
        assert_eq!(provisioner.cache_size().await.unwrap(), 0);

        tokio::fs::remove_dir_all(root).await.unwrap();
    }

    #[test]
    fn test_invalid_keys() {
        assert!(AssetSpec::new("../escape.bytes").validate().is_err());
        assert!(AssetSpec::new("model.bytes").with_unique_key("").validate().is_err());
        assert!(AssetSpec::new("model.bytes").validate().is_ok());
    }
}
