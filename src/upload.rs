//! `docflow upload`: copy local files into the upload container and
//! dispatch each one, as the blob-created trigger would.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use walkdir::WalkDir;

use crate::blob::Metadata;
use crate::stages::dispatch::PROMPT_ID_METADATA_KEY;
use crate::stages::{DispatchOutcome, Dispatcher, Services, Upload};

/// Options for one `docflow upload` run.
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub source: PathBuf,
    /// Blob path for a single file; defaults to the file name.
    pub name: Option<String>,
    /// Leading path segment, read back as the user id for non-default prompts.
    pub user: Option<String>,
    pub prompt_id: Option<String>,
}

/// Files under `source` with their blob path relative to it.
fn collect_files(source: &Path) -> Result<Vec<(PathBuf, String)>> {
    if source.is_file() {
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        return Ok(vec![(source.to_path_buf(), name)]);
    }
    if !source.is_dir() {
        bail!("upload source does not exist: {}", source.display());
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(source).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(source).unwrap_or(path);
        let rel = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push((path.to_path_buf(), rel));
    }
    Ok(files)
}

fn blob_path(request: &UploadRequest, relative: &str, single: bool) -> String {
    let name = match (&request.name, single) {
        (Some(name), true) => name.trim_matches('/').to_string(),
        _ => relative.to_string(),
    };
    match &request.user {
        Some(user) => format!("{}/{}", user.trim_matches('/'), name),
        None => name,
    }
}

/// Upload and dispatch. Returns one outcome per file, in walk order.
pub async fn upload(
    services: Arc<Services>,
    request: &UploadRequest,
) -> Result<Vec<(String, DispatchOutcome)>> {
    let files = collect_files(&request.source)?;
    let single = request.source.is_file();
    let container = services.config.storage.upload_container.clone();

    let mut metadata = Metadata::new();
    if let Some(prompt_id) = &request.prompt_id {
        metadata.insert(PROMPT_ID_METADATA_KEY.to_string(), prompt_id.clone());
    }

    let dispatcher = Dispatcher::new(services.clone());
    let mut outcomes = Vec::with_capacity(files.len());
    for (path, relative) in files {
        let name = blob_path(request, &relative, single);
        let content = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let uri = services
            .blobs
            .write(&container, &name, &content, &metadata)
            .await?;

        let upload = Upload {
            name: format!("{}/{}", container, name),
            uri: uri.to_string(),
            metadata: metadata.clone(),
        };
        let outcome = dispatcher.dispatch(&upload).await;
        outcomes.push((upload.name, outcome));
    }
    Ok(outcomes)
}

pub async fn run_upload(services: Arc<Services>, request: &UploadRequest) -> Result<()> {
    let outcomes = upload(services, request).await?;
    if outcomes.is_empty() {
        println!("No files found under {}", request.source.display());
        return Ok(());
    }
    for (name, outcome) in &outcomes {
        match outcome {
            DispatchOutcome::Queued { queue, delay_secs } => {
                println!("queued     {}  -> {} (+{}s)", name, queue, delay_secs)
            }
            DispatchOutcome::Unsupported => println!("skipped    {}  (unsupported file type)", name),
            DispatchOutcome::Failed(e) => println!("failed     {}  ({})", name, e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_path() {
        let request = UploadRequest {
            user: Some("alice".to_string()),
            name: Some("renamed.pdf".to_string()),
            ..Default::default()
        };
        assert_eq!(blob_path(&request, "report.pdf", true), "alice/renamed.pdf");
        assert_eq!(blob_path(&request, "dir/report.pdf", false), "alice/dir/report.pdf");
        assert_eq!(
            blob_path(&UploadRequest::default(), "report.pdf", true),
            "report.pdf"
        );
    }

    #[test]
    fn test_collect_files_walks_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.pdf"), b"a").unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), b"b").unwrap();

        let files = collect_files(dir.path()).unwrap();
        let names: Vec<&str> = files.iter().map(|(_, n)| n.as_str()).collect();
        assert_eq!(names, vec!["a.pdf", "sub/b.txt"]);
        assert!(collect_files(&dir.path().join("missing")).is_err());
    }
}
