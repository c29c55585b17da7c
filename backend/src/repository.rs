use std::{
    collections::HashMap,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{FromRow, PgPool, types::Json};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    error::AppError,
    models::{DashboardStats, Role, User},
};

/// StoreError
///
/// Failure of the store call itself, as opposed to a successful call that found nothing.
/// Callers must keep the two apart: an unreachable store is never reported as a missing
/// record.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("store request timed out")]
    Timeout,
    #[error("store denied the request: {0}")]
    Permission(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("stored row could not be decoded: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut => StoreError::Timeout,
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Corrupt(err.to_string())
            }
            // 42501: insufficient_privilege
            sqlx::Error::Database(db) if db.code().as_deref() == Some("42501") => {
                StoreError::Permission(db.message().to_string())
            }
            _ => StoreError::Unavailable(err.to_string()),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Corrupt(reason) => AppError::Internal(reason),
            other => AppError::Transient(other.to_string()),
        }
    }
}

/// Bounds a store call by `limit`. Elapsing is reported as [`StoreError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| StoreError::Timeout)?
}

/// MaterialDocument
///
/// A raw document from the `materials` collection: the key, its flat field map and the
/// store-maintained timestamps. No shape is assumed here; shape checks belong to the
/// resolution flow.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterialDocument {
    pub key: String,
    pub fields: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Repository Trait
///
/// The document-store contract. Keys are opaque strings and documents are flat maps of
/// primitive fields. Every method distinguishes "the call failed" (`Err`) from "the call
/// succeeded and found nothing" (`Ok(None)` / `Ok(false)`).
#[async_trait]
pub trait Repository: Send + Sync {
    // --- Materials ---
    async fn get_material(&self, key: &str) -> Result<Option<MaterialDocument>, StoreError>;
    /// Inserts a new document. Returns `None` when the key is already taken.
    async fn insert_material(
        &self,
        key: &str,
        fields: Map<String, Value>,
    ) -> Result<Option<MaterialDocument>, StoreError>;
    /// Shallow-merges `fields` into an existing document. Returns `None` when absent.
    async fn merge_material(
        &self,
        key: &str,
        fields: Map<String, Value>,
    ) -> Result<Option<MaterialDocument>, StoreError>;
    /// Newest first. `vendor_id` restricts the listing to one vendor's documents.
    async fn list_materials(
        &self,
        vendor_id: Option<Uuid>,
    ) -> Result<Vec<MaterialDocument>, StoreError>;

    // --- Profiles ---
    async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError>;
    async fn create_user(&self, user: User) -> Result<User, StoreError>;

    // --- Dashboard ---
    async fn get_stats(&self) -> Result<DashboardStats, StoreError>;
}

/// RepositoryState
///
/// The concrete type used to share the store client across the application state.
pub type RepositoryState = Arc<dyn Repository>;

#[derive(FromRow)]
struct MaterialRow {
    key: String,
    data: Json<Map<String, Value>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<MaterialRow> for MaterialDocument {
    fn from(row: MaterialRow) -> Self {
        Self {
            key: row.key,
            fields: row.data.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct ProfileRow {
    id: Uuid,
    email: String,
    role: String,
}

impl TryFrom<ProfileRow> for User {
    type Error = StoreError;

    fn try_from(row: ProfileRow) -> Result<Self, Self::Error> {
        let role = row.role.parse::<Role>().map_err(StoreError::Corrupt)?;
        Ok(User {
            id: row.id,
            email: row.email,
            role,
        })
    }
}

/// PostgresRepository
///
/// Postgres-backed document store. Materials live in a JSONB `data` column keyed by the
/// material identifier; profiles are a plain table. See `migrations/`.
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Repository for PostgresRepository {
    async fn get_material(&self, key: &str) -> Result<Option<MaterialDocument>, StoreError> {
        let row = sqlx::query_as::<_, MaterialRow>(
            "SELECT key, data, created_at, updated_at FROM materials WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(MaterialDocument::from))
    }

    /// insert_material
    ///
    /// `ON CONFLICT DO NOTHING` turns a key collision into an empty result rather than an
    /// error, which is what the identifier-minting loop retries on.
    async fn insert_material(
        &self,
        key: &str,
        fields: Map<String, Value>,
    ) -> Result<Option<MaterialDocument>, StoreError> {
        let row = sqlx::query_as::<_, MaterialRow>(
            r#"
            INSERT INTO materials (key, data, created_at, updated_at)
            VALUES ($1, $2, NOW(), NOW())
            ON CONFLICT (key) DO NOTHING
            RETURNING key, data, created_at, updated_at
            "#,
        )
        .bind(key)
        .bind(Json(fields))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(MaterialDocument::from))
    }

    /// merge_material
    ///
    /// JSONB `||` gives set-with-merge semantics: supplied keys overwrite, the rest are
    /// kept. Concurrent edits resolve last-write-wins.
    async fn merge_material(
        &self,
        key: &str,
        fields: Map<String, Value>,
    ) -> Result<Option<MaterialDocument>, StoreError> {
        let row = sqlx::query_as::<_, MaterialRow>(
            r#"
            UPDATE materials
            SET data = data || $2, updated_at = NOW()
            WHERE key = $1
            RETURNING key, data, created_at, updated_at
            "#,
        )
        .bind(key)
        .bind(Json(fields))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(MaterialDocument::from))
    }

    async fn list_materials(
        &self,
        vendor_id: Option<Uuid>,
    ) -> Result<Vec<MaterialDocument>, StoreError> {
        let rows = sqlx::query_as::<_, MaterialRow>(
            r#"
            SELECT key, data, created_at, updated_at
            FROM materials
            WHERE $1::text IS NULL OR data->>'vendorId' = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(vendor_id.map(|id| id.to_string()))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(MaterialDocument::from).collect())
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let row = sqlx::query_as::<_, ProfileRow>(
            "SELECT id, email, role FROM profiles WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(User::try_from).transpose()
    }

    async fn create_user(&self, user: User) -> Result<User, StoreError> {
        let row = sqlx::query_as::<_, ProfileRow>(
            r#"
            INSERT INTO profiles (id, email, role) VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET email = EXCLUDED.email, role = EXCLUDED.role
            RETURNING id, email, role
            "#,
        )
        .bind(user.id)
        .bind(&user.email)
        .bind(user.role.as_str())
        .fetch_one(&self.pool)
        .await?;
        User::try_from(row)
    }

    /// get_stats
    ///
    /// Compiles the dashboard counters. Any failing counter fails the whole call; a
    /// dashboard of zeroes would be indistinguishable from an empty system.
    async fn get_stats(&self) -> Result<DashboardStats, StoreError> {
        let total_materials = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM materials")
            .fetch_one(&self.pool)
            .await?;
        let active_vendors = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(DISTINCT data->>'vendorId') FROM materials",
        )
        .fetch_one(&self.pool)
        .await?;
        let total_users = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM profiles")
            .fetch_one(&self.pool)
            .await?;
        Ok(DashboardStats {
            total_materials,
            active_vendors,
            total_users,
        })
    }
}

// --- In-Memory Implementation (Local & Tests) ---

/// InMemoryRepository
///
/// A process-local store with the same semantics as [`PostgresRepository`]. Used by the
/// test suites and handy for running the portal without a database. `set_failing(true)`
/// makes every call return [`StoreError::Unavailable`], simulating a dropped connection.
#[derive(Default)]
pub struct InMemoryRepository {
    materials: RwLock<HashMap<String, MaterialDocument>>,
    users: RwLock<HashMap<Uuid, User>>,
    should_fail: AtomicBool,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_failing() -> Self {
        let repo = Self::default();
        repo.set_failing(true);
        repo
    }

    pub fn set_failing(&self, failing: bool) {
        self.should_fail.store(failing, Ordering::SeqCst);
    }

    /// Writes a document verbatim, bypassing every check. Lets tests plant malformed data.
    pub async fn seed_material(&self, key: &str, fields: Map<String, Value>) {
        let now = Utc::now();
        self.materials.write().await.insert(
            key.to_string(),
            MaterialDocument {
                key: key.to_string(),
                fields,
                created_at: now,
                updated_at: now,
            },
        );
    }

    pub async fn seed_user(&self, user: User) {
        self.users.write().await.insert(user.id, user);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "simulated connectivity failure".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn get_material(&self, key: &str) -> Result<Option<MaterialDocument>, StoreError> {
        self.check()?;
        Ok(self.materials.read().await.get(key).cloned())
    }

    async fn insert_material(
        &self,
        key: &str,
        fields: Map<String, Value>,
    ) -> Result<Option<MaterialDocument>, StoreError> {
        self.check()?;
        let mut materials = self.materials.write().await;
        if materials.contains_key(key) {
            return Ok(None);
        }
        let now = Utc::now();
        let document = MaterialDocument {
            key: key.to_string(),
            fields,
            created_at: now,
            updated_at: now,
        };
        materials.insert(key.to_string(), document.clone());
        Ok(Some(document))
    }

    async fn merge_material(
        &self,
        key: &str,
        fields: Map<String, Value>,
    ) -> Result<Option<MaterialDocument>, StoreError> {
        self.check()?;
        let mut materials = self.materials.write().await;
        let Some(document) = materials.get_mut(key) else {
            return Ok(None);
        };
        document.fields.extend(fields);
        document.updated_at = Utc::now();
        Ok(Some(document.clone()))
    }

    async fn list_materials(
        &self,
        vendor_id: Option<Uuid>,
    ) -> Result<Vec<MaterialDocument>, StoreError> {
        self.check()?;
        let vendor = vendor_id.map(|id| id.to_string());
        let mut documents: Vec<MaterialDocument> = self
            .materials
            .read()
            .await
            .values()
            .filter(|doc| match &vendor {
                Some(v) => doc.fields.get("vendorId").and_then(Value::as_str) == Some(v),
                None => true,
            })
            .cloned()
            .collect();
        documents.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.key.cmp(&b.key))
        });
        Ok(documents)
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        self.check()?;
        Ok(self.users.read().await.get(&id).cloned())
    }

    async fn create_user(&self, user: User) -> Result<User, StoreError> {
        self.check()?;
        self.users.write().await.insert(user.id, user.clone());
        Ok(user)
    }

    async fn get_stats(&self) -> Result<DashboardStats, StoreError> {
        self.check()?;
        let materials = self.materials.read().await;
        let mut vendors: Vec<&str> = materials
            .values()
            .filter_map(|doc| doc.fields.get("vendorId").and_then(Value::as_str))
            .collect();
        vendors.sort_unstable();
        vendors.dedup();
        Ok(DashboardStats {
            total_materials: materials.len() as i64,
            active_vendors: vendors.len() as i64,
            total_users: self.users.read().await.len() as i64,
        })
    }
}
