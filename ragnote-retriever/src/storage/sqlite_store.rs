//! SQLite implementation of [`RecordStore`].
//!
//! ## Database Schema
//!
//! ```sql
//! -- One row per indexed block; seq preserves first-insertion order across updates
//! CREATE TABLE embeddings (
//!     seq INTEGER PRIMARY KEY AUTOINCREMENT,
//!     id TEXT NOT NULL UNIQUE,          -- block id
//!     content TEXT NOT NULL,            -- raw block text
//!     content_hash BLOB NOT NULL,       -- blake3 of content (32 bytes)
//!     vector BLOB NOT NULL,             -- f16 embedding
//!     dimension INTEGER NOT NULL,
//!     updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
//! );
//!
//! -- Key/value metadata; holds the model id of the current generation
//! CREATE TABLE store_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);
//! ```
//!
//! The schema version lives in `PRAGMA user_version`. A different version, or a
//! different model id in `store_meta`, drops both tables before recreating them.

use super::{
    ContentHash, EmbeddingModelMetadata, EmbeddingRecord, RecordStore, RecordStream, content_hash,
};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use half::f16;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File name of the database inside the base directory
pub const DB_FILE_NAME: &str = ".ragnote.db";

/// Bumped whenever the table layout changes. Older stores are destroyed, not migrated.
pub const SCHEMA_VERSION: i64 = 1;

const MODEL_ID_KEY: &str = "model_id";

/// Persistent record store backed by a single SQLite file.
#[derive(Clone, Debug)]
pub struct SqliteRecordStore {
    path: Option<PathBuf>,
    pool: SqlitePool,
    page_size: usize,
}

impl SqliteRecordStore {
    /// Opens or creates the store at `base_dir/.ragnote.db`.
    ///
    /// `base_dir` must already exist. If the stored schema version or model id do not
    /// match, the old generation is dropped and an empty store is returned.
    pub async fn open(
        base_dir: &Path,
        model: &EmbeddingModelMetadata,
        page_size: usize,
    ) -> Result<Self> {
        let db_path = base_dir.join(DB_FILE_NAME);

        let pool = SqlitePool::connect_with(
            SqliteConnectOptions::new()
                .filename(&db_path)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .busy_timeout(std::time::Duration::from_secs(5))
                .create_if_missing(true)
                .page_size(1 << 16)
                .optimize_on_close(true, 1 << 10),
        )
        .await?;

        info!("Opened record store at {}", db_path.display());
        Self::new_with_pool(Some(db_path), pool, model, page_size).await
    }

    /// Opens a store in an in-memory SQLite database, for tests.
    pub async fn open_memory(model: &EmbeddingModelMetadata, page_size: usize) -> Result<Self> {
        // Every connection to :memory: is a separate database, so pin the pool to one
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::new_with_pool(None, pool, model, page_size).await
    }

    async fn new_with_pool(
        path: Option<PathBuf>,
        pool: SqlitePool,
        model: &EmbeddingModelMetadata,
        page_size: usize,
    ) -> Result<Self> {
        if page_size == 0 {
            bail!("replay page size must be at least 1");
        }

        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&pool)
            .await?;
        if version != 0 && version != SCHEMA_VERSION {
            info!(
                "Record store schema version {} differs from {}, recreating",
                version, SCHEMA_VERSION
            );
            Self::drop_tables(&pool).await?;
        }

        Self::create_tables(&pool).await?;

        let model_id = model.model_id();
        let stored_model: Option<String> =
            sqlx::query_scalar("SELECT value FROM store_meta WHERE key = ?1")
                .bind(MODEL_ID_KEY)
                .fetch_optional(&pool)
                .await?;

        match stored_model {
            Some(stored) if stored != model_id => {
                info!(
                    "Embedding model changed from {} to {}, starting a new index generation",
                    stored, model_id
                );
                Self::drop_tables(&pool).await?;
                Self::create_tables(&pool).await?;
            }
            _ => {}
        }

        sqlx::query(
            "INSERT INTO store_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(MODEL_ID_KEY)
        .bind(&model_id)
        .execute(&pool)
        .await?;

        Ok(Self {
            path,
            pool,
            page_size,
        })
    }

    async fn create_tables(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS embeddings (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                content TEXT NOT NULL,
                content_hash BLOB NOT NULL,
                vector BLOB NOT NULL,
                dimension INTEGER NOT NULL,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS store_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_embeddings_content_hash ON embeddings(content_hash)",
        )
        .execute(pool)
        .await?;

        sqlx::query(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))
            .execute(pool)
            .await?;

        Ok(())
    }

    async fn drop_tables(pool: &SqlitePool) -> Result<()> {
        sqlx::query("DROP TABLE IF EXISTS embeddings")
            .execute(pool)
            .await?;
        sqlx::query("DROP TABLE IF EXISTS store_meta")
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Model id recorded for the current generation
    pub async fn model_id(&self) -> Result<Option<String>> {
        Ok(
            sqlx::query_scalar("SELECT value FROM store_meta WHERE key = ?1")
                .bind(MODEL_ID_KEY)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    /// Get the underlying SQLite connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn encode_vector(vector: &[f16]) -> &[u8] {
    bytemuck::cast_slice::<f16, u8>(vector)
}

fn decode_vector(bytes: &[u8]) -> Result<Vec<f16>> {
    if bytes.len() % 2 != 0 {
        bail!("stored vector has odd byte length {}", bytes.len());
    }
    // SQLite blobs carry no alignment guarantee
    Ok(match bytemuck::try_cast_slice::<u8, f16>(bytes) {
        Ok(values) => values.to_vec(),
        Err(_) => bytes
            .chunks_exact(2)
            .map(|pair| f16::from_ne_bytes([pair[0], pair[1]]))
            .collect(),
    })
}

fn row_to_record(row: &SqliteRow) -> Result<EmbeddingRecord> {
    let id: String = row.try_get("id")?;
    let fields = || -> Result<(String, Vec<f16>)> {
        let content: String = row.try_get("content")?;
        let vector_bytes: Vec<u8> = row.try_get("vector")?;
        Ok((content, decode_vector(&vector_bytes)?))
    };
    let (content, vector) =
        fields().with_context(|| format!("stored record {id} is unreadable"))?;
    Ok(EmbeddingRecord {
        id,
        vector,
        content,
    })
}

/// One page of rows, decoded one at a time so a bad row does not sink its neighbours.
type RecordPage = futures::stream::Iter<std::vec::IntoIter<Result<EmbeddingRecord>>>;

async fn fetch_page(
    pool: &SqlitePool,
    after_seq: i64,
    page_size: usize,
) -> Result<(Vec<Result<EmbeddingRecord>>, Option<i64>)> {
    let rows = sqlx::query(
        "SELECT seq, id, content, vector FROM embeddings WHERE seq > ?1 ORDER BY seq LIMIT ?2",
    )
    .bind(after_seq)
    .bind(page_size as i64)
    .fetch_all(pool)
    .await?;

    let next = if rows.len() < page_size {
        None
    } else {
        rows.last().map(|row| row.try_get::<i64, _>("seq")).transpose()?
    };

    let records = rows.iter().map(row_to_record).collect();
    Ok((records, next))
}

async fn next_page(
    pool: SqlitePool,
    cursor: Option<i64>,
    page_size: usize,
) -> Result<Option<(RecordPage, Option<i64>)>> {
    let Some(after) = cursor else {
        return Ok(None);
    };
    let (records, next) = fetch_page(&pool, after, page_size).await?;
    debug!("Loaded page of {} records after seq {}", records.len(), after);
    if records.is_empty() {
        return Ok(None);
    }
    Ok(Some((futures::stream::iter(records), next)))
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    fn load_all(&self) -> RecordStream {
        let pool = self.pool.clone();
        let page_size = self.page_size;

        // Keyset paging on seq; rows inserted after the cursor passes are still picked up.
        // A failed page query ends the stream, an unreadable row is yielded as an error.
        futures::stream::try_unfold(Some(0i64), move |cursor| {
            next_page(pool.clone(), cursor, page_size)
        })
        .try_flatten()
        .boxed()
    }

    async fn has_unchanged(&self, id: &str, content: &str) -> Result<bool> {
        let hash: ContentHash = content_hash(content);
        let stored: Option<String> =
            sqlx::query_scalar("SELECT content FROM embeddings WHERE id = ?1 AND content_hash = ?2")
                .bind(id)
                .bind(&hash[..])
                .fetch_optional(&self.pool)
                .await?;

        Ok(stored.is_some_and(|stored| stored == content))
    }

    async fn put_batch(&self, records: &[EmbeddingRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        for record in records {
            let hash = content_hash(&record.content);
            sqlx::query(
                r#"
                INSERT INTO embeddings (id, content, content_hash, vector, dimension, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(id) DO UPDATE SET
                    content = excluded.content,
                    content_hash = excluded.content_hash,
                    vector = excluded.vector,
                    dimension = excluded.dimension,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&record.id)
            .bind(&record.content)
            .bind(&hash[..])
            .bind(encode_vector(&record.vector))
            .bind(record.vector.len() as i64)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!("Persisted {} records", records.len());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM embeddings WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embeddings")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn last_updated(&self) -> Result<Option<DateTime<Utc>>> {
        let latest: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT MAX(updated_at) FROM embeddings")
                .fetch_one(&self.pool)
                .await?;
        Ok(latest)
    }

    fn is_persistent(&self) -> bool {
        self.path.is_some()
    }
}
