//! Metadata persistence for finalized files.
//!
//! The upload core only talks to the `MetadataStore` trait and treats every
//! call as best effort: a failure here never rolls back a file that has
//! already been moved into the content store.

use crate::{
    models::file::FileRecord,
    services::{finalize::StoredFile, post_process::PostProcessReport},
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;

const INIT_SQL: &str = include_str!("../../migrations/0001_init.sql");

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Cheap connectivity check used by the readiness probe.
    async fn ping(&self) -> Result<()>;

    /// Record (or refresh) the row for a file that was just stored.
    async fn record_file(&self, file: &StoredFile) -> Result<()>;

    /// Attach post-processing results to an existing row.
    async fn record_post_process(&self, digest: &str, report: &PostProcessReport) -> Result<()>;

    async fn fetch_file(&self, digest: &str) -> Result<Option<FileRecord>>;
}

/// `MetadataStore` backed by SQLite.
#[derive(Clone)]
pub struct SqliteMetadataStore {
    db: Arc<SqlitePool>,
}

impl SqliteMetadataStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn ping(&self) -> Result<()> {
        let one = sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        anyhow::ensure!(one == 1, "unexpected result: {}", one);
        Ok(())
    }

    async fn record_file(&self, file: &StoredFile) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO files (digest, name, size_bytes, path, stored_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(digest) DO UPDATE SET
                name = excluded.name,
                size_bytes = excluded.size_bytes,
                path = excluded.path,
                stored_at = excluded.stored_at
            "#,
        )
        .bind(&file.digest)
        .bind(&file.name)
        .bind(i64::try_from(file.size)?)
        .bind(file.path.to_string_lossy().into_owned())
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    async fn record_post_process(&self, digest: &str, report: &PostProcessReport) -> Result<()> {
        let result = sqlx::query(
            "UPDATE files SET mime_type = ?, thumbnail_path = ? WHERE digest = ?",
        )
        .bind(report.mime_type.as_deref())
        .bind(
            report
                .thumbnail
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
        )
        .bind(digest)
        .execute(&*self.db)
        .await?;

        anyhow::ensure!(
            result.rows_affected() == 1,
            "no file row for digest {}",
            digest
        );
        Ok(())
    }

    async fn fetch_file(&self, digest: &str) -> Result<Option<FileRecord>> {
        let record = sqlx::query_as::<_, FileRecord>(
            "SELECT digest, name, size_bytes, path, mime_type, thumbnail_path, stored_at
             FROM files WHERE digest = ?",
        )
        .bind(digest)
        .fetch_optional(&*self.db)
        .await?;
        Ok(record)
    }
}

/// Apply the embedded schema, statement by statement.
pub async fn run_migrations(db: &SqlitePool) -> Result<()> {
    let statements = INIT_SQL
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::info!("Running {} migration statements...", statements.len());

    for stmt in statements {
        tracing::debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(db).await?;
    }

    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::path::PathBuf;

    pub(crate) async fn memory_store() -> SqliteMetadataStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        SqliteMetadataStore::new(Arc::new(pool))
    }

    fn stored(name: &str) -> StoredFile {
        StoredFile {
            digest: "ab".repeat(32),
            path: PathBuf::from("/store").join("ab".repeat(32)),
            name: name.into(),
            size: 4096,
        }
    }

    #[tokio::test]
    async fn ping_succeeds_on_fresh_database() {
        memory_store().await.ping().await.unwrap();
    }

    #[tokio::test]
    async fn record_file_upserts_by_digest() {
        let store = memory_store().await;
        store.record_file(&stored("first.bin")).await.unwrap();
        store.record_file(&stored("second.bin")).await.unwrap();

        let record = store
            .fetch_file(&"ab".repeat(32))
            .await
            .unwrap()
            .expect("row exists");
        assert_eq!(record.name, "second.bin");
        assert_eq!(record.size_bytes, 4096);
        assert!(record.mime_type.is_none());

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files")
            .fetch_one(&*store.db)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn post_process_results_are_attached() {
        let store = memory_store().await;
        store.record_file(&stored("pic.png")).await.unwrap();

        let report = PostProcessReport {
            mime_type: Some("image/png".into()),
            thumbnail: Some(PathBuf::from("/thumbs/x.png")),
        };
        store
            .record_post_process(&"ab".repeat(32), &report)
            .await
            .unwrap();

        let record = store.fetch_file(&"ab".repeat(32)).await.unwrap().unwrap();
        assert_eq!(record.mime_type.as_deref(), Some("image/png"));
        assert_eq!(record.thumbnail_path.as_deref(), Some("/thumbs/x.png"));
    }

    #[tokio::test]
    async fn post_process_for_unknown_digest_fails() {
        let store = memory_store().await;
        let err = store
            .record_post_process(&"cd".repeat(32), &PostProcessReport::default())
            .await;
        assert!(err.is_err());
        assert!(store.fetch_file(&"cd".repeat(32)).await.unwrap().is_none());
    }
}
