//! src/services/upload_service.rs
//!
//! UploadService: the operations the HTTP layer needs: create an upload,
//! write a chunk, poll status, long-poll for completion, and read stored
//! files back. All per-upload state lives in the session actors; this type
//! only validates input, finds the right session and shapes the results.

use crate::{
    models::{
        file::FileRecord,
        upload::{UploadDescriptor, UploadId},
    },
    services::{
        content_store::ContentStore,
        finalize::{Finalizer, FinishOutcome, ProcessedOutcome},
        metadata::MetadataStore,
        registry::{Registry, RegistryError},
        session::{self, SessionHandle},
    },
};
use bytes::Bytes;
use std::{
    io::{self, ErrorKind},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload `{0}` not found")]
    NotFound(UploadId),
    #[error("{0}")]
    InvalidUploadId(String),
    #[error("`{0}` is not a valid chunk index")]
    MalformedChunkIndex(String),
    #[error("chunk {index} is out of range for an upload of {chunks} chunks")]
    InvalidChunkIndex { index: u32, chunks: u32 },
    #[error("chunk {index} has {len} bytes, expected exactly {expected}")]
    InvalidChunkLength { index: u32, len: u64, expected: u64 },
    #[error("invalid upload: {0}")]
    InvalidDescriptor(String),
    #[error(transparent)]
    Duplicate(#[from] RegistryError),
    #[error("`{0}` is not a valid content digest")]
    InvalidDigest(String),
    #[error("file `{0}` not found")]
    FileNotFound(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type UploadResult<T> = Result<T, UploadError>;

/// Result of a long-poll.
#[derive(Debug)]
pub enum PollOutcome<T> {
    Ready(T),
    /// The poll timed out before the awaited event happened.
    Pending,
}

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct UploadService {
    pub registry: Registry,
    pub store: ContentStore,
    pub metadata: Arc<dyn MetadataStore>,
    finalizer: Arc<Finalizer>,
    tmp_dir: PathBuf,
    upload_timeout: Duration,
    long_poll_timeout: Duration,
}

impl UploadService {
    pub fn new(
        registry: Registry,
        store: ContentStore,
        metadata: Arc<dyn MetadataStore>,
        finalizer: Arc<Finalizer>,
        tmp_dir: impl Into<PathBuf>,
        upload_timeout: Duration,
        long_poll_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            metadata,
            finalizer,
            tmp_dir: tmp_dir.into(),
            upload_timeout,
            long_poll_timeout,
        }
    }

    /// Allocate a session for `descriptor` and start its actor.
    ///
    /// The temp file is created before the registry is touched so that no
    /// I/O happens under the registry lock; a refused duplicate removes it
    /// again.
    pub async fn create_upload(&self, descriptor: UploadDescriptor) -> UploadResult<UploadId> {
        descriptor
            .validate()
            .map_err(UploadError::InvalidDescriptor)?;

        fs::create_dir_all(&self.tmp_dir).await?;
        let tmp_path = self.tmp_dir.join(format!(".tmp-{}", Uuid::new_v4()));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&tmp_path)
            .await?
            .into_std()
            .await;

        let created = self
            .registry
            .create(&descriptor, |id| {
                session::start(
                    id,
                    descriptor.clone(),
                    file,
                    tmp_path.clone(),
                    self.upload_timeout,
                    self.finalizer.clone(),
                )
            })
            .await;

        match created {
            Ok(id) => {
                info!(
                    upload_id = %id,
                    name = %descriptor.name,
                    chunks = descriptor.chunks,
                    "upload created"
                );
                Ok(id)
            }
            Err(err) => {
                if let Err(rm_err) = fs::remove_file(&tmp_path).await {
                    warn!("failed to remove temp file {}: {}", tmp_path.display(), rm_err);
                }
                debug!("refusing upload: {}", err);
                Err(err.into())
            }
        }
    }

    async fn session(&self, id: UploadId) -> UploadResult<SessionHandle> {
        self.registry
            .lookup(id)
            .await
            .ok_or(UploadError::NotFound(id))
    }

    /// Write chunk `index` of upload `id`.
    ///
    /// Range and length are checked before the session is asked for a
    /// permit. Every chunk but the last must be exactly `chunk_size` bytes
    /// and the last one must hold the rest of the declared size, so the
    /// assembled file never has holes.
    /// A session that no longer accepts writers answers as not found.
    pub async fn write_chunk(&self, id: UploadId, index: u32, data: Bytes) -> UploadResult<()> {
        let session = self.session(id).await?;
        let descriptor = session.descriptor();

        if index >= descriptor.chunks {
            return Err(UploadError::InvalidChunkIndex {
                index,
                chunks: descriptor.chunks,
            });
        }
        let expected = descriptor.chunk_len(index);
        if data.len() as u64 != expected {
            return Err(UploadError::InvalidChunkLength {
                index,
                len: data.len() as u64,
                expected,
            });
        }

        let permit = session
            .request_write_permit()
            .await
            .ok_or(UploadError::NotFound(id))?;

        permit.write_chunk(index, data).await.map_err(|err| {
            warn!(upload_id = %id, chunk = index, "chunk write failed: {}", err);
            UploadError::Io(err)
        })
    }

    /// Received chunk indices of upload `id`, ascending.
    pub async fn status(&self, id: UploadId) -> UploadResult<Vec<u32>> {
        self.session(id)
            .await?
            .query_status()
            .await
            .ok_or(UploadError::NotFound(id))
    }

    /// Wait until upload `id` is finalized, or the long-poll times out.
    pub async fn await_finished(&self, id: UploadId) -> UploadResult<PollOutcome<FinishOutcome>> {
        let session = self.session(id).await?;
        Ok(self.long_poll(session.finished()).await)
    }

    /// Wait until upload `id` is post-processed, or the long-poll times out.
    pub async fn await_processed(
        &self,
        id: UploadId,
    ) -> UploadResult<PollOutcome<ProcessedOutcome>> {
        let session = self.session(id).await?;
        Ok(self.long_poll(session.processed()).await)
    }

    async fn long_poll<T>(&self, signal: impl Future<Output = T>) -> PollOutcome<T> {
        match tokio::time::timeout(self.long_poll_timeout, signal).await {
            Ok(value) => PollOutcome::Ready(value),
            Err(_) => PollOutcome::Pending,
        }
    }

    /// Open a stored file by digest, with its metadata row when one exists.
    pub async fn open_file(&self, digest: &str) -> UploadResult<(Option<FileRecord>, File)> {
        if !ContentStore::is_valid_digest(digest) {
            return Err(UploadError::InvalidDigest(digest.to_string()));
        }

        let file = self.store.open(digest).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                UploadError::FileNotFound(digest.to_string())
            } else {
                UploadError::Io(err)
            }
        })?;

        let record = match self.metadata.fetch_file(digest).await {
            Ok(record) => record,
            Err(err) => {
                warn!(digest, "metadata lookup failed: {:#}", err);
                None
            }
        };

        Ok((record, file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::finalize::tests::{Harness, harness};
    use sha2::{Digest, Sha256};
    use std::collections::HashMap;
    use tokio::sync::oneshot;

    fn service(
        h: &Harness,
        upload_timeout: Duration,
        long_poll_timeout: Duration,
    ) -> UploadService {
        UploadService::new(
            h.registry.clone(),
            ContentStore::new(h.store_root()),
            h.metadata.clone(),
            h.finalizer.clone(),
            h.tmp_root(),
            upload_timeout,
            long_poll_timeout,
        )
    }

    fn descriptor(name: &str, chunks: u32, chunk_size: u64) -> UploadDescriptor {
        UploadDescriptor {
            name: name.into(),
            size: u64::from(chunks) * chunk_size,
            chunks,
            chunk_size,
        }
    }

    #[tokio::test]
    async fn end_to_end_out_of_order_concurrent_chunks() {
        let h = harness().await;
        let service = service(&h, Duration::from_secs(30), Duration::from_secs(30));
        let id = service
            .create_upload(descriptor("a.bin", 4, 1024))
            .await
            .unwrap();

        let chunk = |index: u32| Bytes::from(vec![b'a' + index as u8; 1024]);

        // Four writers are in flight at once; each waits for its gate, which
        // fixes the arrival order to 2, 0, 3, 1.
        let mut gates = HashMap::new();
        let mut writers = HashMap::new();
        for index in 0..4u32 {
            let (open, gate) = oneshot::channel::<()>();
            let service = service.clone();
            let data = chunk(index);
            gates.insert(index, open);
            writers.insert(
                index,
                tokio::spawn(async move {
                    gate.await.unwrap();
                    service.write_chunk(id, index, data).await
                }),
            );
        }

        let watcher = {
            let service = service.clone();
            tokio::spawn(async move { service.await_finished(id).await })
        };

        for (arrived, index) in [2, 0, 3, 1].into_iter().enumerate() {
            gates.remove(&index).unwrap().send(()).unwrap();
            writers.remove(&index).unwrap().await.unwrap().unwrap();
            if arrived == 1 {
                assert_eq!(service.status(id).await.unwrap(), vec![0, 2]);
            }
        }

        let PollOutcome::Ready(FinishOutcome::Stored(stored)) = watcher.await.unwrap().unwrap()
        else {
            panic!("upload should be stored");
        };

        let mut payload = Vec::new();
        for index in 0..4 {
            payload.extend_from_slice(&chunk(index));
        }
        assert_eq!(stored.digest, format!("{:x}", Sha256::digest(&payload)));
        assert_eq!(std::fs::read(&stored.path).unwrap(), payload);

        let (record, _file) = service.open_file(&stored.digest).await.unwrap();
        assert_eq!(record.unwrap().name, "a.bin");
    }

    #[tokio::test]
    async fn concurrent_writers_in_any_order_complete_the_upload() {
        let h = harness().await;
        let service = service(&h, Duration::from_secs(30), Duration::from_secs(30));
        let id = service
            .create_upload(descriptor("many.bin", 130, 8))
            .await
            .unwrap();

        let writers: Vec<_> = (0..130u32)
            .rev()
            .map(|index| {
                let service = service.clone();
                tokio::spawn(async move {
                    let data = Bytes::from(index.to_le_bytes().repeat(2));
                    service.write_chunk(id, index, data).await
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let PollOutcome::Ready(processed) = service.await_processed(id).await.unwrap() else {
            panic!("processing should finish well within the poll timeout");
        };
        let FinishOutcome::Stored(stored) = processed.finish else {
            panic!("upload should be stored");
        };
        assert_eq!(stored.size, 130 * 8);
    }

    #[tokio::test]
    async fn duplicate_create_is_refused_until_the_first_terminates() {
        let h = harness().await;
        let service = service(&h, Duration::from_secs(30), Duration::from_secs(30));
        let d = descriptor("dup.bin", 1, 4);

        let (a, b) = tokio::join!(
            service.create_upload(d.clone()),
            service.create_upload(d.clone())
        );
        let id = match (a, b) {
            (Ok(id), Err(UploadError::Duplicate(_)))
            | (Err(UploadError::Duplicate(_)), Ok(id)) => id,
            other => panic!("exactly one create should succeed: {:?}", other),
        };
        // Only the winner's temp file is left behind.
        assert_eq!(std::fs::read_dir(h.tmp_root()).unwrap().count(), 1);

        service
            .write_chunk(id, 0, Bytes::from_static(b"data"))
            .await
            .unwrap();
        // The registry entry is released before `processed` resolves.
        service.await_processed(id).await.unwrap();

        service.create_upload(d).await.unwrap();
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected_before_the_session() {
        let h = harness().await;
        let service = service(&h, Duration::from_secs(30), Duration::from_secs(30));

        assert!(matches!(
            service.create_upload(descriptor("", 1, 1)).await,
            Err(UploadError::InvalidDescriptor(_))
        ));

        let id = service
            .create_upload(descriptor("v.bin", 2, 4))
            .await
            .unwrap();
        assert!(matches!(
            service.write_chunk(id, 2, Bytes::from_static(b"x")).await,
            Err(UploadError::InvalidChunkIndex { index: 2, chunks: 2 })
        ));
        assert!(matches!(
            service.write_chunk(id, 0, Bytes::from_static(b"12345")).await,
            Err(UploadError::InvalidChunkLength {
                index: 0,
                len: 5,
                expected: 4
            })
        ));
        assert!(service.status(id).await.unwrap().is_empty());

        let unknown = UploadId::new(id.get().wrapping_add(1).max(1)).unwrap();
        assert!(matches!(
            service.status(unknown).await,
            Err(UploadError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn chunk_lengths_must_match_the_declared_size() {
        let h = harness().await;
        let service = service(&h, Duration::from_secs(30), Duration::from_secs(30));
        let d = UploadDescriptor {
            size: 3000,
            ..descriptor("short-tail.bin", 4, 1024)
        };
        let id = service.create_upload(d).await.unwrap();

        // A short chunk in the middle would leave a hole in the file.
        assert!(matches!(
            service.write_chunk(id, 0, Bytes::from_static(b"x")).await,
            Err(UploadError::InvalidChunkLength {
                index: 0,
                len: 1,
                expected: 1024
            })
        ));
        // The last chunk holds exactly the remainder of the declared size.
        assert!(matches!(
            service.write_chunk(id, 3, Bytes::from(vec![0u8; 1024])).await,
            Err(UploadError::InvalidChunkLength {
                index: 3,
                len: 1024,
                expected: 952
            })
        ));
        assert!(service.status(id).await.unwrap().is_empty());

        let mut payload = Vec::new();
        for index in 0..4u32 {
            let len = if index == 3 { 952 } else { 1024 };
            let data = vec![b'0' + index as u8; len];
            payload.extend_from_slice(&data);
            service.write_chunk(id, index, Bytes::from(data)).await.unwrap();
        }

        let PollOutcome::Ready(FinishOutcome::Stored(stored)) =
            service.await_finished(id).await.unwrap()
        else {
            panic!("upload should be stored");
        };
        assert_eq!(stored.size, 3000);
        assert_eq!(std::fs::read(&stored.path).unwrap(), payload);
    }

    #[tokio::test]
    async fn oversized_layouts_are_rejected_at_creation() {
        let h = harness().await;
        let service = service(&h, Duration::from_secs(30), Duration::from_secs(30));
        let huge = UploadDescriptor {
            name: "huge.bin".into(),
            size: 0,
            chunks: u32::MAX,
            chunk_size: 1,
        };
        assert!(matches!(
            service.create_upload(huge).await,
            Err(UploadError::InvalidDescriptor(_))
        ));
        assert_eq!(service.registry.len().await, 0);
    }

    #[tokio::test]
    async fn long_poll_reports_pending_then_timed_out_session() {
        let h = harness().await;
        let service = service(&h, Duration::from_millis(300), Duration::from_millis(50));
        let id = service
            .create_upload(descriptor("idle.bin", 2, 4))
            .await
            .unwrap();

        assert!(matches!(
            service.await_finished(id).await.unwrap(),
            PollOutcome::Pending
        ));

        let session = service.registry.lookup(id).await.unwrap();
        assert_eq!(session.finished().await, FinishOutcome::TimedOut);
        session.processed().await;

        assert!(matches!(
            service.write_chunk(id, 0, Bytes::from_static(b"late")).await,
            Err(UploadError::NotFound(_))
        ));
        assert_eq!(std::fs::read_dir(h.tmp_root()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn open_file_validates_digest() {
        let h = harness().await;
        let service = service(&h, Duration::from_secs(30), Duration::from_secs(30));

        assert!(matches!(
            service.open_file("../../etc/passwd").await,
            Err(UploadError::InvalidDigest(_))
        ));
        assert!(matches!(
            service.open_file(&"0".repeat(64)).await,
            Err(UploadError::FileNotFound(_))
        ));
    }
}
