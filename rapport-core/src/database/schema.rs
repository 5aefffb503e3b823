//! Database schema and the `LocalStore` implementation over SQLite.

use crate::database::DatabaseError;
use crate::storage::{merge_patch, record_id, Collection, CollectionData, LocalStore};
use crate::Result;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Current schema version. Incremented when the schema changes.
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Local record store backed by a single SQLite connection
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a store at the specified path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path).map_err(DatabaseError::Sqlite)?;
        Self::from_connection(conn)
    }

    /// Create a new in-memory store for testing
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(DatabaseError::Sqlite)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| DatabaseError::LockPoisoned("sqlite store".to_string()).into())
    }

    /// Initialize the database schema
    fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS db_metadata (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS records (
                collection TEXT NOT NULL,
                record_id TEXT NOT NULL,
                body TEXT NOT NULL,
                modified_at INTEGER NOT NULL,
                PRIMARY KEY (collection, record_id)
            );
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )
        .map_err(DatabaseError::Sqlite)?;

        let version: Option<i32> = conn
            .query_row("SELECT version FROM db_metadata WHERE id = 1", [], |row| row.get(0))
            .optional()
            .map_err(DatabaseError::Sqlite)?;

        match version {
            None => {
                conn.execute(
                    "INSERT INTO db_metadata (id, version, created_at) VALUES (1, ?1, ?2)",
                    params![CURRENT_SCHEMA_VERSION, chrono::Utc::now().timestamp()],
                )
                .map_err(DatabaseError::Sqlite)?;
            }
            Some(found) if found > CURRENT_SCHEMA_VERSION => {
                return Err(DatabaseError::UnsupportedSchema {
                    found,
                    supported: CURRENT_SCHEMA_VERSION,
                }
                .into());
            }
            Some(_) => {}
        }

        Ok(())
    }

    /// Number of records in a collection
    pub fn count(&self, collection: Collection) -> Result<usize> {
        let conn = self.conn()?;
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM records WHERE collection = ?1",
                [collection.as_str()],
                |row| row.get(0),
            )
            .map_err(DatabaseError::Sqlite)?;
        Ok(n as usize)
    }

    /// Insert or replace a single record, assigning an id when missing
    pub fn put(&self, collection: Collection, record: &Value) -> Result<String> {
        let conn = self.conn()?;
        upsert(&conn, collection, record)
    }
}

fn upsert(conn: &Connection, collection: Collection, record: &Value) -> Result<String> {
    let mut record = record.clone();
    let id = match record_id(&record) {
        Some(id) => id,
        None => {
            let id = uuid::Uuid::new_v4().to_string();
            if let Value::Object(map) = &mut record {
                map.insert("id".to_string(), Value::String(id.clone()));
            }
            id
        }
    };

    let body = serde_json::to_string(&record)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

    conn.execute(
        "INSERT INTO records (collection, record_id, body, modified_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(collection, record_id) DO UPDATE SET
            body = excluded.body,
            modified_at = excluded.modified_at",
        params![collection.as_str(), id, body, chrono::Utc::now().timestamp()],
    )
    .map_err(DatabaseError::Sqlite)?;

    Ok(id)
}

fn parse_body(body: &str) -> Result<Value> {
    serde_json::from_str(body).map_err(|e| DatabaseError::Serialization(e.to_string()).into())
}

impl LocalStore for SqliteStore {
    fn get_all(&self, collection: Collection) -> Result<Vec<Value>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT body FROM records WHERE collection = ?1 ORDER BY rowid")
            .map_err(DatabaseError::Sqlite)?;

        let bodies = stmt
            .query_map([collection.as_str()], |row| row.get::<_, String>(0))
            .map_err(DatabaseError::Sqlite)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(DatabaseError::Sqlite)?;

        bodies.iter().map(|b| parse_body(b)).collect()
    }

    fn get_by_id(&self, collection: Collection, id: &str) -> Result<Option<Value>> {
        let conn = self.conn()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM records WHERE collection = ?1 AND record_id = ?2",
                params![collection.as_str(), id],
                |row| row.get(0),
            )
            .optional()
            .map_err(DatabaseError::Sqlite)?;

        body.map(|b| parse_body(&b)).transpose()
    }

    fn update(&self, collection: Collection, id: &str, patch: &Value) -> Result<bool> {
        let Some(mut record) = self.get_by_id(collection, id)? else {
            return Ok(false);
        };
        merge_patch(&mut record, patch);

        let body = serde_json::to_string(&record)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let conn = self.conn()?;
        conn.execute(
            "UPDATE records SET body = ?1, modified_at = ?2 WHERE collection = ?3 AND record_id = ?4",
            params![body, chrono::Utc::now().timestamp(), collection.as_str(), id],
        )
        .map_err(DatabaseError::Sqlite)?;
        Ok(true)
    }

    fn import_data(&self, data: &CollectionData, replace: bool) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(DatabaseError::Sqlite)?;

        if replace {
            tx.execute("DELETE FROM records", [])
                .map_err(DatabaseError::Sqlite)?;
        }

        for (collection, records) in data {
            for record in records {
                upsert(&tx, *collection, record)?;
            }
        }

        tx.commit().map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        conn.query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| row.get(0))
            .optional()
            .map_err(|e| DatabaseError::Sqlite(e).into())
    }

    fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_put_and_get() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .put(Collection::Clients, &json!({"id": "c1", "name": "Ada"}))
            .unwrap();

        let fetched = store.get_by_id(Collection::Clients, "c1").unwrap().unwrap();
        assert_eq!(fetched["name"], "Ada");
        assert!(store.get_by_id(Collection::Tasks, "c1").unwrap().is_none());
    }

    #[test]
    fn test_missing_id_is_assigned() {
        let store = SqliteStore::in_memory().unwrap();
        let id = store.put(Collection::Tasks, &json!({"title": "Call back"})).unwrap();

        let fetched = store.get_by_id(Collection::Tasks, &id).unwrap().unwrap();
        assert_eq!(fetched["id"], id.as_str());
    }

    #[test]
    fn test_update_merges_fields() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .put(Collection::Clients, &json!({"id": "c1", "name": "Ada", "phone": "1"}))
            .unwrap();

        assert!(store
            .update(Collection::Clients, "c1", &json!({"phone": "2"}))
            .unwrap());
        assert!(!store
            .update(Collection::Clients, "missing", &json!({"phone": "2"}))
            .unwrap());

        let fetched = store.get_by_id(Collection::Clients, "c1").unwrap().unwrap();
        assert_eq!(fetched, json!({"id": "c1", "name": "Ada", "phone": "2"}));
    }

    #[test]
    fn test_import_replace_clears_other_collections() {
        let store = SqliteStore::in_memory().unwrap();
        store.put(Collection::Tasks, &json!({"id": "t1"})).unwrap();
        store.put(Collection::Clients, &json!({"id": "old"})).unwrap();

        let mut data = CollectionData::new();
        data.insert(
            Collection::Clients,
            vec![json!({"id": "c1"}), json!({"id": "c2"})],
        );
        store.import_data(&data, true).unwrap();

        assert_eq!(store.count(Collection::Clients).unwrap(), 2);
        assert_eq!(store.count(Collection::Tasks).unwrap(), 0);
        assert!(store.get_by_id(Collection::Clients, "old").unwrap().is_none());
    }

    #[test]
    fn test_import_merge_upserts() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .put(Collection::Clients, &json!({"id": "c1", "name": "Old"}))
            .unwrap();

        let mut data = CollectionData::new();
        data.insert(Collection::Clients, vec![json!({"id": "c1", "name": "New"})]);
        store.import_data(&data, false).unwrap();

        let fetched = store.get_by_id(Collection::Clients, "c1").unwrap().unwrap();
        assert_eq!(fetched["name"], "New");
        assert_eq!(store.count(Collection::Clients).unwrap(), 1);
    }

    #[test]
    fn test_settings_roundtrip() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.get_setting("k").unwrap().is_none());

        store.put_setting("k", "v1").unwrap();
        store.put_setting("k", "v2").unwrap();
        assert_eq!(store.get_setting("k").unwrap().as_deref(), Some("v2"));
    }

    #[test]
    fn test_reopen_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rapport.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.put(Collection::Calendars, &json!({"id": "work"})).unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get_all(Collection::Calendars).unwrap().len(), 1);
    }
}
