//! Finalization of a closed upload session.
//!
//! Runs once per session, inside the session task, after every in-flight
//! writer has reported:
//!
//! 1. a timed-out session skips straight to cleanup;
//! 2. the temp file is hashed from its start (SHA-256);
//! 3. the temp file is synced and its handle released;
//! 4. the file is renamed into the content store under its digest;
//! 5. the metadata store records it and the `finished` latch fires;
//! 6. the post-processor runs (best effort, bounded by a timeout);
//! 7. cleanup: the temp file is removed if it is still there, and the
//!    session leaves the registry;
//! 8. the `processed` latch fires.
//!
//! Steps 5 to 8 always run, so no watcher is left waiting on a failed session.
//! The registry entry is gone by the time `processed` resolves, so a client
//! may re-create the same upload as soon as it sees the result.

use crate::{
    models::upload::{UploadDescriptor, UploadId},
    services::{
        content_store::{ContentStore, digest_file},
        latch::Latch,
        metadata::MetadataStore,
        post_process::{PostProcessReport, PostProcessor},
        registry::Registry,
        session::SessionEnd,
    },
};
use futures::FutureExt;
use std::{
    fs::File as StdFile,
    io::{self, ErrorKind},
    panic::AssertUnwindSafe,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

/// A file that made it into the content store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredFile {
    pub digest: String,
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
}

/// How a session ended, as seen by `finished` watchers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FinishOutcome {
    Stored(StoredFile),
    TimedOut,
    Failed(String),
}

/// What `processed` watchers see.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessedOutcome {
    pub finish: FinishOutcome,
    pub mime_type: Option<String>,
    pub thumbnail: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("hashing failed: {0}")]
    Hash(#[source] io::Error),
    #[error("closing temp file failed: {0}")]
    Close(#[source] io::Error),
    #[error("moving file into the store failed: {0}")]
    Relocate(#[source] io::Error),
}

/// Everything the session hands over once it has stopped accepting writers.
pub struct FinalizeJob {
    pub id: UploadId,
    pub descriptor: Arc<UploadDescriptor>,
    pub file: Arc<StdFile>,
    pub tmp_path: PathBuf,
    pub end: SessionEnd,
}

pub struct Finalizer {
    store: ContentStore,
    metadata: Arc<dyn MetadataStore>,
    post_processor: Arc<dyn PostProcessor>,
    post_process_timeout: Duration,
    registry: Registry,
}

impl Finalizer {
    pub fn new(
        store: ContentStore,
        metadata: Arc<dyn MetadataStore>,
        post_processor: Arc<dyn PostProcessor>,
        post_process_timeout: Duration,
        registry: Registry,
    ) -> Self {
        Self {
            store,
            metadata,
            post_processor,
            post_process_timeout,
            registry,
        }
    }

    pub async fn run(
        &self,
        job: FinalizeJob,
        finished: Latch<FinishOutcome>,
        processed: Latch<ProcessedOutcome>,
    ) {
        let FinalizeJob {
            id,
            descriptor,
            file,
            tmp_path,
            end,
        } = job;

        let outcome = match end {
            SessionEnd::TimedOut => {
                drop(file);
                FinishOutcome::TimedOut
            }
            SessionEnd::Complete => match self.store_file(&descriptor, file, &tmp_path).await {
                Ok(stored) => {
                    info!(
                        upload_id = %id,
                        digest = %stored.digest,
                        size = stored.size,
                        "upload stored"
                    );
                    if let Err(err) = self.metadata.record_file(&stored).await {
                        warn!(
                            upload_id = %id,
                            digest = %stored.digest,
                            "recording file metadata failed: {:#}",
                            err
                        );
                    }
                    FinishOutcome::Stored(stored)
                }
                Err(err) => {
                    warn!(
                        upload_id = %id,
                        name = %descriptor.name,
                        "finalizing upload failed: {}",
                        err
                    );
                    FinishOutcome::Failed(err.to_string())
                }
            },
        };

        finished.fire(outcome.clone());

        let report = match &outcome {
            FinishOutcome::Stored(stored) => self.post_process(id, &descriptor, stored).await,
            _ => PostProcessReport::default(),
        };

        match fs::remove_file(&tmp_path).await {
            Ok(()) => debug!(upload_id = %id, "removed temp file {}", tmp_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(
                upload_id = %id,
                "failed to remove temp file {}: {}",
                tmp_path.display(),
                err
            ),
        }
        self.registry.remove(id, &descriptor.fingerprint()).await;

        processed.fire(ProcessedOutcome {
            finish: outcome,
            mime_type: report.mime_type,
            thumbnail: report.thumbnail,
        });
    }

    async fn store_file(
        &self,
        descriptor: &UploadDescriptor,
        file: Arc<StdFile>,
        tmp_path: &Path,
    ) -> Result<StoredFile, FinalizeError> {
        let digest = digest_file(file.clone())
            .await
            .map_err(FinalizeError::Hash)?;

        let size = tokio::task::spawn_blocking(move || {
            file.sync_all()?;
            file.metadata().map(|m| m.len())
        })
        .await
        .map_err(|err| FinalizeError::Close(io::Error::other(err)))?
        .map_err(FinalizeError::Close)?;

        let path = self
            .store
            .commit(tmp_path, &digest)
            .await
            .map_err(FinalizeError::Relocate)?;

        Ok(StoredFile {
            digest,
            path,
            name: descriptor.name.clone(),
            size,
        })
    }

    /// Run the post-processor; failures, panics and overruns are logged and
    /// ignored.
    async fn post_process(
        &self,
        id: UploadId,
        descriptor: &UploadDescriptor,
        stored: &StoredFile,
    ) -> PostProcessReport {
        let run = self
            .post_processor
            .process(descriptor, &stored.digest, &stored.path);

        let guarded = AssertUnwindSafe(run).catch_unwind();
        let report = match tokio::time::timeout(self.post_process_timeout, guarded).await {
            Ok(Ok(Ok(report))) => report,
            Ok(Ok(Err(err))) => {
                warn!(
                    upload_id = %id,
                    digest = %stored.digest,
                    "post-processing failed: {:#}",
                    err
                );
                return PostProcessReport::default();
            }
            Ok(Err(_)) => {
                warn!(upload_id = %id, digest = %stored.digest, "post-processor panicked");
                return PostProcessReport::default();
            }
            Err(_) => {
                warn!(
                    upload_id = %id,
                    digest = %stored.digest,
                    timeout = ?self.post_process_timeout,
                    "post-processing timed out"
                );
                return PostProcessReport::default();
            }
        };

        if let Err(err) = self
            .metadata
            .record_post_process(&stored.digest, &report)
            .await
        {
            warn!(
                upload_id = %id,
                digest = %stored.digest,
                "recording post-processing failed: {:#}",
                err
            );
        }
        report
    }
}
