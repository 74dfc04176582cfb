//! Process-wide index of active upload sessions.
//!
//! Maps upload ids to session handles and keeps the set of fingerprints of
//! active uploads so the same logical file cannot be uploaded twice at once.
//! The lock is only held for map operations, never across I/O.

use crate::{
    models::upload::{Fingerprint, UploadDescriptor, UploadId},
    services::session::SessionHandle,
};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("an upload of {0} is already in progress")]
    Duplicate(Fingerprint),
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<UploadId, SessionHandle>,
    active: HashSet<Fingerprint>,
}

/// Cheap-to-clone handle to the shared registry.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RwLock<Inner>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new upload.
    ///
    /// The duplicate check, id allocation and insertion happen under one
    /// write lock. `start` receives the fresh id and must return the handle
    /// of the session it spawned; it is only called if registration succeeds.
    pub async fn create<F>(
        &self,
        descriptor: &UploadDescriptor,
        start: F,
    ) -> Result<UploadId, RegistryError>
    where
        F: FnOnce(UploadId) -> SessionHandle,
    {
        let fingerprint = descriptor.fingerprint();
        let mut inner = self.inner.write().await;

        if inner.active.contains(&fingerprint) {
            return Err(RegistryError::Duplicate(fingerprint));
        }

        let id = loop {
            if let Some(id) = UploadId::new(rand::random()) {
                if !inner.sessions.contains_key(&id) {
                    break id;
                }
            }
        };

        inner.active.insert(fingerprint);
        inner.sessions.insert(id, start(id));
        Ok(id)
    }

    pub async fn lookup(&self, id: UploadId) -> Option<SessionHandle> {
        self.inner.read().await.sessions.get(&id).cloned()
    }

    /// Drop a session's entries. Removing an unknown entry is a no-op.
    pub async fn remove(&self, id: UploadId, fingerprint: &Fingerprint) {
        let mut inner = self.inner.write().await;
        let had_session = inner.sessions.remove(&id).is_some();
        let had_fingerprint = inner.active.remove(fingerprint);
        debug!(upload_id = %id, had_session, had_fingerprint, "removed upload from registry");
    }

    /// Number of active sessions.
    pub async fn len(&self) -> usize {
        self.inner.read().await.sessions.len()
    }
}
