//! Object storage.
//!
//! Blobs live in named containers and are addressed by locators of the form
//! `blob://{account}/{container}/{name}`. The locator shape is an external
//! contract: path segment 4 (counting the scheme as segment 0) is the first
//! segment of the blob name, which by upload convention is the user id.
//!
//! Artifact names are derived deterministically from the upload's blob name
//! by the `*_name` helpers below, so every stage can find what an earlier
//! stage wrote without extra bookkeeping.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use docflow_core::error::PipelineError;
use docflow_core::models::base_name;

pub type Metadata = HashMap<String, String>;

const SCHEME: &str = "blob://";

/// A parsed blob locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobUri {
    pub account: String,
    pub container: String,
    pub name: String,
}

impl BlobUri {
    pub fn new(account: &str, container: &str, name: &str) -> Self {
        Self {
            account: account.to_string(),
            container: container.to_string(),
            name: name.trim_start_matches('/').to_string(),
        }
    }

    pub fn parse(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix(SCHEME)
            .ok_or_else(|| anyhow!("not a blob locator: '{}'", uri))?;
        let mut parts = rest.splitn(3, '/');
        let account = parts.next().unwrap_or_default();
        let container = parts.next().unwrap_or_default();
        let name = parts.next().unwrap_or_default();
        if account.is_empty() || container.is_empty() || name.is_empty() {
            bail!("incomplete blob locator: '{}'", uri);
        }
        Ok(Self::new(account, container, name))
    }
}

impl std::fmt::Display for BlobUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}/{}/{}", SCHEME, self.account, self.container, self.name)
    }
}

/// User id encoded in an upload locator (`blob://account/container/{user}/...`).
pub fn user_id_from_uri(uri: &str) -> Result<String, PipelineError> {
    let segments: Vec<&str> = uri.split('/').collect();
    // The user segment must be followed by at least the file name.
    match segments.get(4) {
        Some(user) if !user.is_empty() && segments.len() > 5 => Ok(user.to_string()),
        _ => Err(PipelineError::MalformedMessage(format!(
            "no user segment in blob locator '{}'",
            uri
        ))),
    }
}

/// File name without its final extension (`a/report.v2.pdf` → `report.v2`).
pub fn file_stem(blob_name: &str) -> &str {
    let base = base_name(blob_name);
    match base.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => base,
    }
}

/// Raw analysis payload, in the log container.
pub fn doc_intel_response_name(blob_name: &str) -> String {
    format!("{}/doc_intel_response.json", blob_name)
}

/// Paragraph-level chunk `index`, in the output container.
pub fn chunk_name(blob_name: &str, index: usize) -> String {
    format!("{}/chunks/{}-{}.json", blob_name, file_stem(blob_name), index)
}

/// Merged chunk `index`, in the output container.
pub fn merged_chunk_name(blob_name: &str, index: usize) -> String {
    format!(
        "{}/merged/{}-merged-{}.json",
        blob_name,
        file_stem(blob_name),
        index
    )
}

/// LLM output for a merged chunk, in the output container.
pub fn llm_output_name(blob_name: &str, merged_chunk_name: &str) -> String {
    format!("{}/llm/{}", blob_name, base_name(merged_chunk_name))
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Locator for `name` in `container` of this store's account.
    fn uri(&self, container: &str, name: &str) -> BlobUri;

    /// Create or overwrite a blob. Returns its locator.
    async fn write(
        &self,
        container: &str,
        name: &str,
        content: &[u8],
        metadata: &Metadata,
    ) -> Result<BlobUri>;

    async fn read(&self, uri: &BlobUri) -> Result<Vec<u8>>;

    async fn metadata(&self, uri: &BlobUri) -> Result<Metadata>;
}

/// Containers as directories under a root; metadata in a sidecar tree.
pub struct FsBlobStore {
    root: PathBuf,
    account: String,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>, account: &str) -> Self {
        Self {
            root: root.into(),
            account: account.to_string(),
        }
    }

    fn check_account(&self, uri: &BlobUri) -> Result<()> {
        if uri.account != self.account {
            bail!(
                "blob {} belongs to account '{}', store serves '{}'",
                uri,
                uri.account,
                self.account
            );
        }
        Ok(())
    }

    fn relative(container: &str, name: &str) -> Result<PathBuf> {
        let path = Path::new(container).join(name);
        if path
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("invalid blob path: {}/{}", container, name);
        }
        Ok(path)
    }

    fn data_path(&self, container: &str, name: &str) -> Result<PathBuf> {
        Ok(self.root.join(Self::relative(container, name)?))
    }

    fn meta_path(&self, container: &str, name: &str) -> Result<PathBuf> {
        let mut path = self
            .root
            .join(".metadata")
            .join(Self::relative(container, name)?)
            .into_os_string();
        path.push(".json");
        Ok(PathBuf::from(path))
    }
}

async fn write_file(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

#[async_trait]
impl BlobStore for FsBlobStore {
    fn uri(&self, container: &str, name: &str) -> BlobUri {
        BlobUri::new(&self.account, container, name)
    }

    async fn write(
        &self,
        container: &str,
        name: &str,
        content: &[u8],
        metadata: &Metadata,
    ) -> Result<BlobUri> {
        write_file(&self.data_path(container, name)?, content).await?;
        let meta_path = self.meta_path(container, name)?;
        if metadata.is_empty() {
            match tokio::fs::remove_file(&meta_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).context("Failed to clear blob metadata"),
            }
        } else {
            write_file(&meta_path, &serde_json::to_vec(metadata)?).await?;
        }
        Ok(self.uri(container, name))
    }

    async fn read(&self, uri: &BlobUri) -> Result<Vec<u8>> {
        self.check_account(uri)?;
        let path = self.data_path(&uri.container, &uri.name)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read blob {}", uri))
    }

    async fn metadata(&self, uri: &BlobUri) -> Result<Metadata> {
        self.check_account(uri)?;
        let path = self.meta_path(&uri.container, &uri.name)?;
        match tokio::fs::read(&path).await {
            Ok(raw) => Ok(serde_json::from_slice(&raw)
                .with_context(|| format!("corrupt metadata for {}", uri))?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Metadata::new()),
            Err(e) => Err(e).with_context(|| format!("Failed to read metadata for {}", uri)),
        }
    }
}

/// In-process blob store for tests.
pub struct MemoryBlobStore {
    account: String,
    blobs: Mutex<HashMap<(String, String), (Vec<u8>, Metadata)>>,
}

impl MemoryBlobStore {
    pub fn new(account: &str) -> Self {
        Self {
            account: account.to_string(),
            blobs: Mutex::new(HashMap::new()),
        }
    }

    /// Names stored in `container` that start with `prefix`, sorted.
    pub fn list(&self, container: &str, prefix: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .blobs
            .lock()
            .map(|b| {
                b.keys()
                    .filter(|(c, n)| c == container && n.starts_with(prefix))
                    .map(|(_, n)| n.clone())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn uri(&self, container: &str, name: &str) -> BlobUri {
        BlobUri::new(&self.account, container, name)
    }

    async fn write(
        &self,
        container: &str,
        name: &str,
        content: &[u8],
        metadata: &Metadata,
    ) -> Result<BlobUri> {
        self.blobs
            .lock()
            .map_err(|_| anyhow!("blob store lock poisoned"))?
            .insert(
                (container.to_string(), name.to_string()),
                (content.to_vec(), metadata.clone()),
            );
        Ok(self.uri(container, name))
    }

    async fn read(&self, uri: &BlobUri) -> Result<Vec<u8>> {
        self.blobs
            .lock()
            .map_err(|_| anyhow!("blob store lock poisoned"))?
            .get(&(uri.container.clone(), uri.name.clone()))
            .map(|(content, _)| content.clone())
            .ok_or_else(|| anyhow!("blob not found: {}", uri))
    }

    async fn metadata(&self, uri: &BlobUri) -> Result<Metadata> {
        self.blobs
            .lock()
            .map_err(|_| anyhow!("blob store lock poisoned"))?
            .get(&(uri.container.clone(), uri.name.clone()))
            .map(|(_, metadata)| metadata.clone())
            .ok_or_else(|| anyhow!("blob not found: {}", uri))
    }
}
