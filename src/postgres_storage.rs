use async_trait::async_trait;
use sqlx::{PgPool, Row};

use crate::crypto::{AesGcmCipher, EncryptedData, SecureKey, AES_256_KEY_SIZE};
use crate::error::{KeyMaterialError, Result};
use crate::material::{MaterialAggregate, Subject};
use crate::storage::{AggregateStore, StoredAggregate};

pub const SERVER_KEY_ENV: &str = "SERVER_KEY_BASE64";

/// Load the server key sealing aggregates at rest from `SERVER_KEY_BASE64`
pub fn server_key_from_env() -> Result<SecureKey> {
    let encoded = std::env::var(SERVER_KEY_ENV)
        .map_err(|_| KeyMaterialError::Config(format!("{} not set", SERVER_KEY_ENV)))?;
    let key = SecureKey::from_base64(encoded.trim())
        .map_err(|e| KeyMaterialError::Config(format!("Invalid {}: {}", SERVER_KEY_ENV, e)))?;
    if key.len() != AES_256_KEY_SIZE {
        return Err(KeyMaterialError::Config(format!(
            "{} must decode to exactly {} bytes, got {}",
            SERVER_KEY_ENV,
            AES_256_KEY_SIZE,
            key.len()
        )));
    }
    Ok(key)
}

/// Production PostgreSQL local table
/// Strict requirements:
/// - No plaintext key material stored
/// - Aggregates sealed with the server key, bound to their subject
/// - Offsets committed per commands partition
pub struct PostgresAggregateStore {
    pool: PgPool,
    server_key: SecureKey,
}

impl PostgresAggregateStore {
    pub fn new(pool: PgPool, server_key: SecureKey) -> Self {
        Self { pool, server_key }
    }

    /// Connect to `database_url` and load the server key from the environment
    pub async fn connect(database_url: &str) -> Result<Self> {
        let server_key = server_key_from_env()?;
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| KeyMaterialError::Storage(format!("Failed to connect: {}", e)))?;
        tracing::info!("connected to PostgreSQL aggregate store");
        Ok(Self::new(pool, server_key))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the tables if they do not exist
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS subject_aggregates (
                subject TEXT PRIMARY KEY,
                partition_id INTEGER NOT NULL,
                sealed_nonce BYTEA NOT NULL,
                sealed_aggregate BYTEA NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| {
            KeyMaterialError::Storage(format!("Failed to create subject_aggregates: {}", e))
        })?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS subject_aggregates_partition_idx
            ON subject_aggregates (partition_id)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| {
            KeyMaterialError::Storage(format!("Failed to create partition index: {}", e))
        })?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS partition_offsets (
                partition_id INTEGER PRIMARY KEY,
                next_offset BIGINT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| {
            KeyMaterialError::Storage(format!("Failed to create partition_offsets: {}", e))
        })?;

        tracing::info!("aggregate store schema ready");
        Ok(())
    }
}

/// Encrypt an aggregate for storage; the subject is the associated data
fn seal(
    server_key: &SecureKey,
    subject: &Subject,
    aggregate: &MaterialAggregate,
) -> Result<EncryptedData> {
    let json = serde_json::to_vec(aggregate)?;
    AesGcmCipher::encrypt(server_key, &json, Some(subject.as_str().as_bytes()))
}

fn open(
    server_key: &SecureKey,
    subject: &Subject,
    sealed: &EncryptedData,
) -> Result<MaterialAggregate> {
    let json = AesGcmCipher::decrypt(server_key, sealed, Some(subject.as_str().as_bytes()))?;
    Ok(serde_json::from_slice(&json)?)
}

fn partition_id(partition: u32) -> Result<i32> {
    i32::try_from(partition)
        .map_err(|_| KeyMaterialError::Storage(format!("Partition {} out of range", partition)))
}

#[async_trait]
impl AggregateStore for PostgresAggregateStore {
    async fn get(&self, subject: &Subject) -> Result<Option<MaterialAggregate>> {
        let row = sqlx::query(
            r#"
            SELECT sealed_nonce, sealed_aggregate
            FROM subject_aggregates
            WHERE subject = $1
            "#,
        )
        .bind(subject.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| KeyMaterialError::Storage(format!("Failed to get aggregate: {}", e)))?;

        match row {
            Some(r) => {
                let sealed = EncryptedData::new(r.get("sealed_nonce"), r.get("sealed_aggregate"));
                Ok(Some(open(&self.server_key, subject, &sealed)?))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, entry: StoredAggregate) -> Result<()> {
        let sealed = seal(&self.server_key, &entry.subject, &entry.aggregate)?;
        sqlx::query(
            r#"
            INSERT INTO subject_aggregates
                (subject, partition_id, sealed_nonce, sealed_aggregate, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (subject) DO UPDATE
            SET partition_id = EXCLUDED.partition_id,
                sealed_nonce = EXCLUDED.sealed_nonce,
                sealed_aggregate = EXCLUDED.sealed_aggregate,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(entry.subject.as_str())
        .bind(partition_id(entry.partition)?)
        .bind(&sealed.nonce)
        .bind(&sealed.ciphertext)
        .bind(entry.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| KeyMaterialError::Storage(format!("Failed to store aggregate: {}", e)))?;

        Ok(())
    }

    async fn commit_offset(&self, partition: u32, next_offset: u64) -> Result<()> {
        let next_offset = i64::try_from(next_offset).map_err(|_| {
            KeyMaterialError::Storage(format!("Offset {} out of range", next_offset))
        })?;
        sqlx::query(
            r#"
            INSERT INTO partition_offsets (partition_id, next_offset)
            VALUES ($1, $2)
            ON CONFLICT (partition_id) DO UPDATE
            SET next_offset = EXCLUDED.next_offset
            "#,
        )
        .bind(partition_id(partition)?)
        .bind(next_offset)
        .execute(&self.pool)
        .await
        .map_err(|e| KeyMaterialError::Storage(format!("Failed to commit offset: {}", e)))?;

        Ok(())
    }

    async fn committed_offset(&self, partition: u32) -> Result<Option<u64>> {
        let row = sqlx::query(
            r#"
            SELECT next_offset
            FROM partition_offsets
            WHERE partition_id = $1
            "#,
        )
        .bind(partition_id(partition)?)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| KeyMaterialError::Storage(format!("Failed to get committed offset: {}", e)))?;

        Ok(row.map(|r| r.get::<i64, _>("next_offset").max(0) as u64))
    }

    async fn subjects_in_partition(&self, partition: u32) -> Result<Vec<Subject>> {
        let rows = sqlx::query(
            r#"
            SELECT subject
            FROM subject_aggregates
            WHERE partition_id = $1
            ORDER BY subject
            "#,
        )
        .bind(partition_id(partition)?)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| KeyMaterialError::Storage(format!("Failed to list subjects: {}", e)))?;

        rows.iter().map(|r| Subject::new(r.get::<String, _>("subject"))).collect()
    }
}
