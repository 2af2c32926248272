//! Object store interface and its SQLite implementation.
//!
//! The store holds raw JSON documents keyed by `(kind, namespace, name)`.
//! It owns `metadata.uid`, `metadata.resourceVersion`, `metadata.generation`
//! and `metadata.creationTimestamp`:
//!
//! - every successful write takes the next value of a store-wide
//!   resourceVersion sequence
//! - `generation` bumps only when `spec` changes
//! - writes carrying a stale resourceVersion fail with
//!   [`StoreError::Conflict`]
//! - `replace` never touches `status`; `replace_status` touches nothing else

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use json_patch::Patch;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;
use virtops_id::{Generation, ResourceVersion, Uid};

use crate::{patch, ObjectKey, ObjectMeta, StoreError};

/// Change notification kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

/// A committed change, carrying the object as written (or as last stored,
/// for deletions).
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub event_type: WatchEventType,
    pub kind: String,
    pub object: Value,
}

/// Store consumed by the controllers.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Value>, StoreError>;

    /// Objects of `kind`, optionally limited to one namespace, ordered by name.
    async fn list(&self, kind: &str, namespace: Option<&str>) -> Result<Vec<Value>, StoreError>;

    /// Every stored object with its kind.
    async fn list_all(&self) -> Result<Vec<(String, Value)>, StoreError>;

    async fn create(&self, kind: &str, object: Value) -> Result<Value, StoreError>;

    /// Replaces metadata and spec; keeps the stored status.
    async fn replace(&self, kind: &str, object: Value) -> Result<Value, StoreError>;

    /// Replaces status only.
    async fn replace_status(&self, kind: &str, object: Value) -> Result<Value, StoreError>;

    /// Applies a JSON-Patch to metadata and spec.
    async fn patch(&self, key: &ObjectKey, patch: &Patch) -> Result<Value, StoreError>;

    /// Deletes and returns the last stored document.
    async fn delete(&self, key: &ObjectKey) -> Result<Value, StoreError>;

    /// Subscribes to committed changes.
    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}

const WATCH_CAPACITY: usize = 1024;

/// SQLite-backed object store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    events: broadcast::Sender<WatchEvent>,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        Self::with_connection(conn)
    }

    /// Open an in-memory store (for testing and dev mode).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        init_schema(&conn)?;
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Ok(Self {
            conn: Mutex::new(conn),
            events,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // The connection stays consistent: every write is one transaction.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, event_type: WatchEventType, kind: &str, object: &Value) {
        // No receivers is fine.
        let _ = self.events.send(WatchEvent {
            event_type,
            kind: kind.to_string(),
            object: object.clone(),
        });
    }

    fn write<F>(&self, kind: &str, event_type: WatchEventType, f: F) -> Result<Value, StoreError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<Value, StoreError>,
    {
        let body = {
            let mut conn = self.lock();
            let tx = conn.transaction()?;
            let body = f(&tx)?;
            tx.commit()?;
            body
        };
        self.publish(event_type, kind, &body);
        Ok(body)
    }
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS objects (
            kind TEXT NOT NULL,
            namespace TEXT NOT NULL,
            name TEXT NOT NULL,
            uid TEXT NOT NULL UNIQUE,
            resource_version INTEGER NOT NULL,
            body TEXT NOT NULL,
            PRIMARY KEY (kind, namespace, name)
        );

        CREATE INDEX IF NOT EXISTS idx_objects_kind_namespace ON objects(kind, namespace);

        CREATE TABLE IF NOT EXISTS sequence (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            last_resource_version INTEGER NOT NULL DEFAULT 0
        );

        INSERT OR IGNORE INTO sequence (id) VALUES (1);
        "#,
    )?;
    Ok(())
}

fn next_resource_version(tx: &Transaction<'_>) -> Result<ResourceVersion, StoreError> {
    tx.execute(
        "UPDATE sequence SET last_resource_version = last_resource_version + 1 WHERE id = 1",
        [],
    )?;
    let rv: i64 = tx.query_row(
        "SELECT last_resource_version FROM sequence WHERE id = 1",
        [],
        |row| row.get(0),
    )?;
    Ok(ResourceVersion::new(rv))
}

fn load(tx: &Transaction<'_>, key: &ObjectKey) -> Result<Option<Value>, StoreError> {
    let body: Option<String> = tx
        .query_row(
            "SELECT body FROM objects WHERE kind = ?1 AND namespace = ?2 AND name = ?3",
            params![key.kind, key.namespace, key.name],
            |row| row.get(0),
        )
        .optional()?;
    body.map(|b| serde_json::from_str(&b).map_err(StoreError::from))
        .transpose()
}

fn store_body(tx: &Transaction<'_>, key: &ObjectKey, meta: &ObjectMeta, body: &Value) -> Result<(), StoreError> {
    let uid = meta
        .uid
        .ok_or_else(|| StoreError::Invalid(format!("{key} has no uid")))?;
    let rv = meta.resource_version.unwrap_or_default();
    tx.execute(
        r#"
        INSERT INTO objects (kind, namespace, name, uid, resource_version, body)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(kind, namespace, name) DO UPDATE SET
            resource_version = excluded.resource_version,
            body = excluded.body
        "#,
        params![
            key.kind,
            key.namespace,
            key.name,
            uid.to_string(),
            rv.value(),
            serde_json::to_string(body)?,
        ],
    )?;
    Ok(())
}

fn meta_of(body: &Value) -> Result<ObjectMeta, StoreError> {
    let raw = body
        .get("metadata")
        .cloned()
        .ok_or_else(|| StoreError::Invalid("object has no metadata".to_string()))?;
    Ok(serde_json::from_value(raw)?)
}

fn set_meta(body: &mut Value, meta: &ObjectMeta) -> Result<(), StoreError> {
    let obj = body
        .as_object_mut()
        .ok_or_else(|| StoreError::Invalid("object is not a JSON object".to_string()))?;
    obj.insert("metadata".to_string(), serde_json::to_value(meta)?);
    Ok(())
}

fn key_of(kind: &str, meta: &ObjectMeta) -> Result<ObjectKey, StoreError> {
    if meta.name.is_empty() {
        return Err(StoreError::Invalid("metadata.name is required".to_string()));
    }
    Ok(ObjectKey::new(kind, meta.namespace.clone(), meta.name.clone()))
}

/// Rejects a write whose resourceVersion is set and stale.
fn check_version(key: &ObjectKey, incoming: &ObjectMeta, stored: &ObjectMeta) -> Result<(), StoreError> {
    match (incoming.resource_version, stored.resource_version) {
        (Some(expected), Some(actual)) if expected != actual => Err(StoreError::Conflict {
            key: key.clone(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }),
        _ => Ok(()),
    }
}

/// Copies store-owned fields from `stored` into `next`, bumping the
/// resourceVersion and, if the spec changed, the generation.
fn carry_over(
    tx: &Transaction<'_>,
    next: &mut ObjectMeta,
    stored: &ObjectMeta,
    spec_changed: bool,
) -> Result<(), StoreError> {
    next.uid = stored.uid;
    next.creation_timestamp = stored.creation_timestamp;
    next.deletion_timestamp = stored.deletion_timestamp;
    let generation = stored.generation.unwrap_or(Generation::FIRST);
    next.generation = Some(if spec_changed {
        generation.next()
    } else {
        generation
    });
    next.resource_version = Some(next_resource_version(tx)?);
    Ok(())
}

fn spec_of(body: &Value) -> &Value {
    body.get("spec").unwrap_or(&Value::Null)
}

fn replace_field(body: &mut Value, field: &str, value: Option<Value>) {
    if let Some(obj) = body.as_object_mut() {
        match value {
            Some(v) => {
                obj.insert(field.to_string(), v);
            }
            None => {
                obj.remove(field);
            }
        }
    }
}

#[async_trait]
impl ObjectStore for SqliteStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Value>, StoreError> {
        let conn = self.lock();
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM objects WHERE kind = ?1 AND namespace = ?2 AND name = ?3",
                params![key.kind, key.namespace, key.name],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| serde_json::from_str(&b).map_err(StoreError::from))
            .transpose()
    }

    async fn list(&self, kind: &str, namespace: Option<&str>) -> Result<Vec<Value>, StoreError> {
        let conn = self.lock();
        let rows: Vec<String> = match namespace {
            Some(ns) => {
                let mut stmt = conn.prepare(
                    "SELECT body FROM objects WHERE kind = ?1 AND namespace = ?2 ORDER BY name",
                )?;
                let rows = stmt.query_map(params![kind, ns], |row| row.get(0))?;
                rows.collect::<Result<_, _>>()?
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT body FROM objects WHERE kind = ?1 ORDER BY namespace, name",
                )?;
                let rows = stmt.query_map(params![kind], |row| row.get(0))?;
                rows.collect::<Result<_, _>>()?
            }
        };
        rows.iter()
            .map(|b| serde_json::from_str(b).map_err(StoreError::from))
            .collect()
    }

    async fn list_all(&self) -> Result<Vec<(String, Value)>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT kind, body FROM objects ORDER BY kind, namespace, name")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        let mut out = Vec::new();
        for row in rows {
            let (kind, body) = row?;
            out.push((kind, serde_json::from_str(&body)?));
        }
        Ok(out)
    }

    async fn create(&self, kind: &str, mut object: Value) -> Result<Value, StoreError> {
        let mut meta = meta_of(&object)?;
        let key = key_of(kind, &meta)?;

        self.write(kind, WatchEventType::Added, |tx| {
            if load(tx, &key)?.is_some() {
                return Err(StoreError::AlreadyExists(key.clone()));
            }

            meta.uid = Some(Uid::new());
            meta.generation = Some(Generation::FIRST);
            meta.creation_timestamp = Some(Utc::now());
            meta.deletion_timestamp = None;
            meta.resource_version = Some(next_resource_version(tx)?);
            set_meta(&mut object, &meta)?;

            store_body(tx, &key, &meta, &object)?;
            debug!(key = %key, rv = ?meta.resource_version, "Created object");
            Ok(object)
        })
    }

    async fn replace(&self, kind: &str, mut object: Value) -> Result<Value, StoreError> {
        let mut meta = meta_of(&object)?;
        let key = key_of(kind, &meta)?;

        self.write(kind, WatchEventType::Modified, |tx| {
            let stored = load(tx, &key)?.ok_or_else(|| StoreError::NotFound(key.clone()))?;
            let stored_meta = meta_of(&stored)?;
            check_version(&key, &meta, &stored_meta)?;

            let spec_changed = spec_of(&stored) != spec_of(&object);
            carry_over(tx, &mut meta, &stored_meta, spec_changed)?;
            set_meta(&mut object, &meta)?;
            replace_field(&mut object, "status", stored.get("status").cloned());

            store_body(tx, &key, &meta, &object)?;
            debug!(key = %key, rv = ?meta.resource_version, spec_changed, "Replaced object");
            Ok(object)
        })
    }

    async fn replace_status(&self, kind: &str, object: Value) -> Result<Value, StoreError> {
        let meta = meta_of(&object)?;
        let key = key_of(kind, &meta)?;

        self.write(kind, WatchEventType::Modified, |tx| {
            let mut stored = load(tx, &key)?.ok_or_else(|| StoreError::NotFound(key.clone()))?;
            let mut stored_meta = meta_of(&stored)?;
            check_version(&key, &meta, &stored_meta)?;

            stored_meta.resource_version = Some(next_resource_version(tx)?);
            set_meta(&mut stored, &stored_meta)?;
            replace_field(&mut stored, "status", object.get("status").cloned());

            store_body(tx, &key, &stored_meta, &stored)?;
            debug!(key = %key, rv = ?stored_meta.resource_version, "Replaced status");
            Ok(stored)
        })
    }

    async fn patch(&self, key: &ObjectKey, ops: &Patch) -> Result<Value, StoreError> {
        self.write(&key.kind, WatchEventType::Modified, |tx| {
            let stored = load(tx, key)?.ok_or_else(|| StoreError::NotFound(key.clone()))?;
            let stored_meta = meta_of(&stored)?;

            let mut object = stored.clone();
            patch::apply(&mut object, ops)?;

            let mut meta = meta_of(&object)?;
            if meta.name != stored_meta.name || meta.namespace != stored_meta.namespace {
                return Err(StoreError::Invalid(format!(
                    "patch may not rename {key}"
                )));
            }
            check_version(key, &meta, &stored_meta)?;

            let spec_changed = spec_of(&stored) != spec_of(&object);
            carry_over(tx, &mut meta, &stored_meta, spec_changed)?;
            set_meta(&mut object, &meta)?;
            replace_field(&mut object, "status", stored.get("status").cloned());

            store_body(tx, key, &meta, &object)?;
            debug!(key = %key, ops = ops.0.len(), spec_changed, "Patched object");
            Ok(object)
        })
    }

    async fn delete(&self, key: &ObjectKey) -> Result<Value, StoreError> {
        self.write(&key.kind, WatchEventType::Deleted, |tx| {
            let stored = load(tx, key)?.ok_or_else(|| StoreError::NotFound(key.clone()))?;
            tx.execute(
                "DELETE FROM objects WHERE kind = ?1 AND namespace = ?2 AND name = ?3",
                params![key.kind, key.namespace, key.name],
            )?;
            debug!(key = %key, "Deleted object");
            Ok(stored)
        })
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}
