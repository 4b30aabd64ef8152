//! src/services/binding_store.rs
//!
//! BindingStore keeps the bucket bindings handed out by the coordinator in
//! SQLite, keyed by claim namespace and name. The binding itself is stored as
//! JSON; bucket name, storage class and user are copied into columns so they
//! can be inspected without decoding.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::models::binding::ObjectBucket;

const MIGRATION_SQL: &str = include_str!("../../migrations/0001_init.sql");

#[derive(Debug, Error)]
pub enum BindingStoreError {
    #[error("binding `{namespace}/{name}` not found")]
    NotFound { namespace: String, name: String },
    #[error("stored binding is not valid JSON: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type BindingStoreResult<T> = Result<T, BindingStoreError>;

/// A stored binding with its bookkeeping timestamps.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BindingRecord {
    pub binding: ObjectBucket,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct BindingRow {
    binding_json: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct BindingStore {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
}

impl BindingStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Apply the embedded schema. Safe to run repeatedly.
    pub async fn migrate(&self) -> BindingStoreResult<usize> {
        let statements = MIGRATION_SQL
            .split(';')
            .map(|stmt| {
                stmt.lines()
                    .filter(|line| !line.trim_start().starts_with("--"))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .filter(|stmt| !stmt.trim().is_empty())
            .collect::<Vec<_>>();

        for stmt in &statements {
            debug!("Executing migration SQL: {}", stmt.trim());
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(statements.len())
    }

    /// Insert or replace the binding for its claim. `created_at` survives replacement.
    pub async fn upsert(&self, binding: &ObjectBucket) -> BindingStoreResult<BindingRecord> {
        let json = serde_json::to_string(binding)?;
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO bindings
                 (namespace, name, storage_class, bucket_name, ceph_user, binding_json, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (namespace, name) DO UPDATE SET
                 storage_class = excluded.storage_class,
                 bucket_name = excluded.bucket_name,
                 ceph_user = excluded.ceph_user,
                 binding_json = excluded.binding_json,
                 updated_at = excluded.updated_at",
        )
        .bind(&binding.namespace)
        .bind(&binding.name)
        .bind(&binding.storage_class_name)
        .bind(binding.bucket_name())
        .bind(binding.ceph_user().unwrap_or_default())
        .bind(&json)
        .bind(now)
        .bind(now)
        .execute(&*self.db)
        .await?;

        debug!(namespace = %binding.namespace, name = %binding.name, "binding stored");
        self.get(&binding.namespace, &binding.name).await
    }

    pub async fn get(&self, namespace: &str, name: &str) -> BindingStoreResult<BindingRecord> {
        let row = sqlx::query_as::<_, BindingRow>(
            "SELECT binding_json, created_at, updated_at
             FROM bindings WHERE namespace = ? AND name = ?",
        )
        .bind(namespace)
        .bind(name)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => BindingStoreError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            },
            other => BindingStoreError::Sqlx(other),
        })?;

        Ok(BindingRecord {
            binding: serde_json::from_str(&row.binding_json)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }

    /// Remove a binding. Returns whether a record existed.
    pub async fn remove(&self, namespace: &str, name: &str) -> BindingStoreResult<bool> {
        let result = sqlx::query("DELETE FROM bindings WHERE namespace = ? AND name = ?")
            .bind(namespace)
            .bind(name)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Cheap connectivity probe used by readiness checks.
    pub async fn ping(&self) -> BindingStoreResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }
}
