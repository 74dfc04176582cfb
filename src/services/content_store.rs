//! Content-addressed file store.
//!
//! Every entry lives at `root/{sha256-hex}` with no extension. Entries are
//! only ever created by renaming a fully written file into place, so readers
//! never observe a partial entry.

use sha2::{Digest, Sha256};
use std::{
    fs::File as StdFile,
    io::{self, ErrorKind, Seek, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::fs::{self, File};
use tracing::debug;

const DIGEST_HEX_LEN: usize = 64;

#[derive(Clone, Debug)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store path for `digest`. Does not check for existence.
    pub fn path_for(&self, digest: &str) -> PathBuf {
        self.root.join(digest)
    }

    /// True if `digest` looks like a lowercase hex SHA-256.
    pub fn is_valid_digest(digest: &str) -> bool {
        digest.len() == DIGEST_HEX_LEN
            && digest
                .bytes()
                .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    }

    /// Move the fully written file at `tmp_path` into the store under `digest`.
    ///
    /// An existing entry with the same digest holds the same bytes, so it is
    /// simply replaced.
    pub async fn commit(&self, tmp_path: &Path, digest: &str) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.root).await?;
        let target = self.path_for(digest);

        if let Err(err) = fs::rename(tmp_path, &target).await {
            if err.kind() == ErrorKind::AlreadyExists {
                debug!(digest, "store entry already present, replacing");
                fs::remove_file(&target).await?;
                fs::rename(tmp_path, &target).await?;
            } else {
                return Err(err);
            }
        }

        Ok(target)
    }

    /// Open a stored entry for reading.
    pub async fn open(&self, digest: &str) -> io::Result<File> {
        File::open(self.path_for(digest)).await
    }
}

/// SHA-256 of the whole file, read from its start through the given handle.
pub async fn digest_file(file: Arc<StdFile>) -> io::Result<String> {
    tokio::task::spawn_blocking(move || {
        let mut reader: &StdFile = &file;
        reader.seek(SeekFrom::Start(0))?;
        let mut hasher = Sha256::new();
        io::copy(&mut reader, &mut hasher)?;
        Ok(format!("{:x}", hasher.finalize()))
    })
    .await
    .map_err(io::Error::other)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[tokio::test]
    async fn digest_reads_from_the_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload");
        let mut file = StdFile::options()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        file.write_all(b"hello").unwrap();

        let digest = digest_file(Arc::new(file)).await.unwrap();
        assert_eq!(digest, HELLO_SHA256);
        assert!(ContentStore::is_valid_digest(&digest));
    }

    #[tokio::test]
    async fn commit_moves_file_and_tolerates_existing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path().join("store"));

        for _ in 0..2 {
            let tmp = dir.path().join(format!(".tmp-{}", uuid::Uuid::new_v4()));
            std::fs::write(&tmp, b"hello").unwrap();

            let stored = store.commit(&tmp, HELLO_SHA256).await.unwrap();
            assert_eq!(stored, store.path_for(HELLO_SHA256));
            assert!(!tmp.exists());
            assert_eq!(std::fs::read(&stored).unwrap(), b"hello");
        }
    }

    #[test]
    fn digest_validation() {
        assert!(ContentStore::is_valid_digest(HELLO_SHA256));
        assert!(!ContentStore::is_valid_digest(&HELLO_SHA256.to_uppercase()));
        assert!(!ContentStore::is_valid_digest("../etc/passwd"));
        assert!(!ContentStore::is_valid_digest(&HELLO_SHA256[1..]));
    }
}
