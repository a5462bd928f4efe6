//! Upload of staged files to S3 with public-read access.

use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ObjectCannedAcl;
use aws_sdk_s3::Client as S3Client;
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Failed to read staging directory {path}: {message}")]
    Staging { path: String, message: String },

    #[error("Failed to upload {key}: {message}")]
    Upload { key: String, message: String },

    #[error("Failed to set public-read on {key}: {message}")]
    Acl { key: String, message: String },
}

/// Object storage operations used by the publisher.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload_file(&self, bucket: &str, key: &str, path: &Path) -> Result<(), PublishError>;

    async fn set_public_read(&self, bucket: &str, key: &str) -> Result<(), PublishError>;
}

/// S3 implementation of [`ObjectStore`]
pub struct S3ObjectStore {
    client: S3Client,
}

impl S3ObjectStore {
    pub fn new(client: S3Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn upload_file(&self, bucket: &str, key: &str, path: &Path) -> Result<(), PublishError> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| PublishError::Upload {
                key: key.to_string(),
                message: e.to_string(),
            })?;

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .content_type(get_content_type(path))
            .send()
            .await
            .map_err(|e| PublishError::Upload {
                key: key.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        Ok(())
    }

    async fn set_public_read(&self, bucket: &str, key: &str) -> Result<(), PublishError> {
        self.client
            .put_object_acl()
            .bucket(bucket)
            .key(key)
            .acl(ObjectCannedAcl::PublicRead)
            .send()
            .await
            .map_err(|e| PublishError::Acl {
                key: key.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        Ok(())
    }
}

/// Get content type from a file extension
fn get_content_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "gif" => "image/gif",
        _ => "application/octet-stream",
    }
}

/// Completion accounting for one publish phase
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    /// Objects written to the bucket
    pub uploaded: usize,
    /// Uploaded objects whose ACL is now public-read
    pub made_public: usize,
    /// Files that could not be uploaded
    pub failed: usize,
    /// Files skipped because the run was cancelled
    pub cancelled: usize,
}

enum FileOutcome {
    Public,
    Private,
    Failed,
    Cancelled,
}

/// Bounded-concurrency uploader for a staging directory
pub struct BulkPublisher {
    store: Arc<dyn ObjectStore>,
    concurrency: usize,
}

impl BulkPublisher {
    pub fn new(store: Arc<dyn ObjectStore>, concurrency: usize) -> Self {
        Self {
            store,
            concurrency: concurrency.max(1),
        }
    }

    /// Upload every file under `staging_dir` to `bucket`, keyed by file name,
    /// and make each uploaded object public.
    #[instrument(skip(self, cancel))]
    pub async fn publish_all(
        &self,
        staging_dir: &Path,
        bucket: &str,
        cancel: &CancellationToken,
    ) -> Result<PublishReport, PublishError> {
        let root = staging_dir.to_path_buf();
        let files = tokio::task::spawn_blocking(move || collect_files(&root))
            .await
            .map_err(|e| PublishError::Staging {
                path: staging_dir.display().to_string(),
                message: e.to_string(),
            })?
            .map_err(|e| PublishError::Staging {
                path: staging_dir.display().to_string(),
                message: e.to_string(),
            })?;

        debug!(files = files.len(), "Staged files found");

        let outcomes: Vec<FileOutcome> = stream::iter(files)
            .map(|path| {
                let store = self.store.clone();
                let cancel = cancel.clone();

                async move {
                    if cancel.is_cancelled() {
                        return FileOutcome::Cancelled;
                    }
                    publish_file(store.as_ref(), bucket, &path).await
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = PublishReport::default();
        for outcome in outcomes {
            match outcome {
                FileOutcome::Public => {
                    report.uploaded += 1;
                    report.made_public += 1;
                }
                FileOutcome::Private => report.uploaded += 1,
                FileOutcome::Failed => report.failed += 1,
                FileOutcome::Cancelled => report.cancelled += 1,
            }
        }

        metrics::counter!("harvester.uploads.succeeded").increment(report.uploaded as u64);
        metrics::counter!("harvester.uploads.failed").increment(report.failed as u64);
        metrics::counter!("harvester.acl.failed")
            .increment((report.uploaded - report.made_public) as u64);

        info!(
            uploaded = report.uploaded,
            made_public = report.made_public,
            failed = report.failed,
            cancelled = report.cancelled,
            "Publish phase complete"
        );

        Ok(report)
    }
}

async fn publish_file(store: &dyn ObjectStore, bucket: &str, path: &Path) -> FileOutcome {
    let key = match path.file_name() {
        Some(name) => name.to_string_lossy().into_owned(),
        None => return FileOutcome::Failed,
    };

    if let Err(e) = store.upload_file(bucket, &key, path).await {
        error!(key = %key, error = %e, "Upload failed");
        return FileOutcome::Failed;
    }
    debug!(key = %key, "Uploaded");

    // The object stays uploaded even when the ACL call fails.
    match store.set_public_read(bucket, &key).await {
        Ok(()) => FileOutcome::Public,
        Err(e) => {
            warn!(key = %key, error = %e, "Uploaded but not public");
            FileOutcome::Private
        }
    }
}

/// Regular files under `root`, recursively, following symlinks.
///
/// An unreadable root fails the walk; an unreadable entry below it is logged
/// and skipped.
fn collect_files(root: &Path) -> Result<Vec<PathBuf>, walkdir::Error> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root).follow_links(true).sort_by_file_name();

    for entry in walker {
        match entry {
            Ok(entry) => {
                if entry.file_type().is_file() {
                    files.push(entry.into_path());
                }
            }
            Err(e) if e.depth() == 0 => return Err(e),
            Err(e) => {
                warn!(error = %e, "Skipping unreadable staging entry");
            }
        }
    }

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUCKET: &str = "car-photos";

    fn staging_with(names: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in names {
            let path = dir.path().join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, b"jpeg").unwrap();
        }
        dir
    }

    #[tokio::test]
    async fn test_acl_failure_keeps_upload_but_not_public() {
        let staging = staging_with(&["a.jpg", "b.jpg", "nested/c.jpg"]);

        let mut store = MockObjectStore::new();
        store
            .expect_upload_file()
            .withf(|bucket, _, _| bucket == BUCKET)
            .times(3)
            .returning(|_, _, _| Ok(()));
        store.expect_set_public_read().times(3).returning(|_, key| {
            if key == "b.jpg" {
                Err(PublishError::Acl {
                    key: key.to_string(),
                    message: "AccessControlListNotSupported".to_string(),
                })
            } else {
                Ok(())
            }
        });

        let publisher = BulkPublisher::new(Arc::new(store), 2);
        let report = publisher
            .publish_all(staging.path(), BUCKET, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.uploaded, 3);
        assert_eq!(report.made_public, 2);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn test_failed_upload_skips_acl() {
        let staging = staging_with(&["ok.jpg", "broken.jpg"]);

        let mut store = MockObjectStore::new();
        store.expect_upload_file().times(2).returning(|_, key, _| {
            if key == "broken.jpg" {
                Err(PublishError::Upload {
                    key: key.to_string(),
                    message: "SlowDown".to_string(),
                })
            } else {
                Ok(())
            }
        });
        store
            .expect_set_public_read()
            .withf(|_, key| key == "ok.jpg")
            .times(1)
            .returning(|_, _| Ok(()));

        let publisher = BulkPublisher::new(Arc::new(store), 4);
        let report = publisher
            .publish_all(staging.path(), BUCKET, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            report,
            PublishReport {
                uploaded: 1,
                made_public: 1,
                failed: 1,
                cancelled: 0
            }
        );
    }

    #[tokio::test]
    async fn test_objects_keyed_by_file_name() {
        let staging = staging_with(&["deep/er/7_1.jpg"]);

        let mut store = MockObjectStore::new();
        store
            .expect_upload_file()
            .withf(|_, key, path| key == "7_1.jpg" && path.ends_with("deep/er/7_1.jpg"))
            .times(1)
            .returning(|_, _, _| Ok(()));
        store.expect_set_public_read().returning(|_, _| Ok(()));

        let publisher = BulkPublisher::new(Arc::new(store), 1);
        let report = publisher
            .publish_all(staging.path(), BUCKET, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.made_public, 1);
    }

    #[tokio::test]
    async fn test_missing_staging_dir_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let publisher = BulkPublisher::new(Arc::new(MockObjectStore::new()), 1);

        let result = publisher
            .publish_all(&root.path().join("absent"), BUCKET, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(PublishError::Staging { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinked_files_are_published() {
        let staging = staging_with(&["a.jpg"]);
        let elsewhere = tempfile::tempdir().unwrap();
        let target = elsewhere.path().join("outside.jpg");
        std::fs::write(&target, b"jpeg").unwrap();
        std::os::unix::fs::symlink(&target, staging.path().join("link.jpg")).unwrap();

        let mut store = MockObjectStore::new();
        store
            .expect_upload_file()
            .withf(|_, key, _| key == "a.jpg" || key == "link.jpg")
            .times(2)
            .returning(|_, _, _| Ok(()));
        store.expect_set_public_read().times(2).returning(|_, _| Ok(()));

        let publisher = BulkPublisher::new(Arc::new(store), 2);
        let report = publisher
            .publish_all(staging.path(), BUCKET, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.uploaded, 2);
        assert_eq!(report.made_public, 2);
    }

    #[test]
    fn test_get_content_type() {
        assert_eq!(get_content_type(Path::new("a.jpg")), "image/jpeg");
        assert_eq!(get_content_type(Path::new("a.JPEG")), "image/jpeg");
        assert_eq!(get_content_type(Path::new("a.png")), "image/png");
        assert_eq!(get_content_type(Path::new("a")), "application/octet-stream");
    }
}
