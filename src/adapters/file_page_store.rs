//! File Page Store
//!
//! Persists page snapshots as one binary file per (layer, gridset) pair,
//! next to a YAML file holding the used quota of every layer:
//!
//! ```text
//! <dir>/
//! ├── toppstates.EPSG4326.pages
//! ├── toppstates.EPSG900913.pages
//! └── usage.yaml
//! ```
//!
//! Page files use the record format of [`crate::paging::record`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::ports::{PageRecord, PageStore, UsageStore};
use crate::domain::quota::Quota;
use crate::error::{Error, Result};
use crate::paging::record;

/// Page file extension
pub const PAGE_FILE_EXTENSION: &str = "pages";

/// Name of the layer usage file
pub const USAGE_FILE_NAME: &str = "usage.yaml";

/// On-disk layout of the usage file; exact byte counts per layer
#[derive(Debug, Default, Serialize, Deserialize)]
struct UsageFile {
    #[serde(default)]
    layers: BTreeMap<String, i64>,
}

/// Strip characters that are unsafe in a file name.
///
/// Keeps ASCII alphanumerics, `-`, and `_`; an empty result becomes `_`.
pub fn sanitize_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if sanitized.is_empty() {
        "_".to_string()
    } else {
        sanitized
    }
}

/// `PageStore` writing one file per (layer, gridset) under a directory
#[derive(Debug, Clone)]
pub struct FilePageStore {
    dir: PathBuf,
}

impl FilePageStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<sanitized layer>.<sanitized gridset>.pages`
    pub fn file_name(layer: &str, gridset_id: &str) -> String {
        format!(
            "{}.{}.{}",
            sanitize_name(layer),
            sanitize_name(gridset_id),
            PAGE_FILE_EXTENSION
        )
    }

    pub fn page_file(&self, layer: &str, gridset_id: &str) -> PathBuf {
        self.dir.join(Self::file_name(layer, gridset_id))
    }

    pub fn usage_file(&self) -> PathBuf {
        self.dir.join(USAGE_FILE_NAME)
    }

    /// Write `data` to `path` through a temp file and rename
    async fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let mut temp_path = path.as_os_str().to_owned();
        temp_path.push(".tmp");
        tokio::fs::write(&temp_path, data).await?;
        tokio::fs::rename(&temp_path, path).await?;
        Ok(())
    }

    /// Decode a page file
    pub async fn read_file(path: &Path) -> Result<Vec<PageRecord>> {
        match tokio::fs::read(path).await {
            Ok(data) => record::decode(&data, &path.display().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::PageStateNotFound(path.display().to_string()))
            }
            Err(e) => Err(Error::Io(e)),
        }
    }
}

#[async_trait]
impl PageStore for FilePageStore {
    async fn load_pages(&self, layer: &str, gridset_id: &str) -> Result<Vec<PageRecord>> {
        let path = self.page_file(layer, gridset_id);
        let records = Self::read_file(&path).await?;
        debug!(path = %path.display(), pages = records.len(), "Loaded page file");
        Ok(records)
    }

    async fn save_pages(&self, layer: &str, gridset_id: &str, pages: &[PageRecord]) -> Result<()> {
        let path = self.page_file(layer, gridset_id);
        let data = record::encode(pages)?;
        self.write_atomic(&path, &data).await?;

        debug!(path = %path.display(), pages = pages.len(), "Saved page file");
        Ok(())
    }
}

#[async_trait]
impl UsageStore for FilePageStore {
    async fn load_usage(&self) -> Result<BTreeMap<String, Quota>> {
        let path = self.usage_file();
        let text = tokio::fs::read_to_string(&path).await?;
        let file: UsageFile = serde_yaml::from_str(&text)?;
        debug!(path = %path.display(), layers = file.layers.len(), "Loaded usage file");

        Ok(file
            .layers
            .into_iter()
            .map(|(layer, bytes)| (layer, Quota::from_bytes(bytes)))
            .collect())
    }

    async fn save_usage(&self, usage: &BTreeMap<String, Quota>) -> Result<()> {
        let path = self.usage_file();
        let file = UsageFile {
            layers: usage
                .iter()
                .map(|(layer, used)| (layer.clone(), used.bytes()))
                .collect(),
        };
        let text = serde_yaml::to_string(&file)?;
        self.write_atomic(&path, text.as_bytes()).await?;

        debug!(path = %path.display(), layers = usage.len(), "Saved usage file");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
