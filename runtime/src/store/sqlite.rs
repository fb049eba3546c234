//! SQLite backend.
//!
//! Items are stored whole as JSON. Secondary indexes live in
//! `index_entries`, one row per (index, item) with the key split into
//! `(key_type, key_num, key_text)` columns that sort exactly like
//! [`IndexKey`], so equality and range lookups are plain SQL comparisons.
//! Every write runs in a transaction; schema upgrades additionally hold an
//! in-process lock.

use super::{create_pool, run_migrations, LocalStore, Pool, SyncStateStore};
use crate::error::{Result, RuntimeError};
use async_trait::async_trait;
use harbor_engine::{
    validate_index_set, Checkpoint, Error, IndexDef, IndexKey, Item, KeyRange, QueueEntry,
    SchemaChange, SchemaVersion, SecondaryIndex,
};
use serde_json::Value;
use sqlx::{Row, SqliteConnection};
use tokio::sync::Mutex;

pub struct SqliteStore {
    pool: Pool,
    upgrade_lock: Mutex<()>,
}

impl SqliteStore {
    /// Open (or create) the database at `database_url` and migrate it.
    pub async fn open(database_url: &str) -> Result<Self> {
        let pool = create_pool(database_url).await?;
        run_migrations(&pool).await?;
        Ok(Self::from_pool(pool))
    }

    /// Wrap an already migrated pool.
    pub fn from_pool(pool: Pool) -> Self {
        Self {
            pool,
            upgrade_lock: Mutex::new(()),
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn decode_item(body: &str) -> Result<Item> {
    serde_json::from_str(body).map_err(|e| RuntimeError::Corrupt(format!("item: {e}")))
}

fn decode_entry(seq: i64, body: &str) -> Result<QueueEntry> {
    let mut entry: QueueEntry = serde_json::from_str(body)
        .map_err(|e| RuntimeError::Corrupt(format!("queue entry: {e}")))?;
    entry.seq = seq as u64;
    Ok(entry)
}

async fn require_collection(conn: &mut SqliteConnection, collection: &str) -> Result<()> {
    let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM collections WHERE name = ?")
        .bind(collection)
        .fetch_optional(&mut *conn)
        .await?;
    match found {
        Some(_) => Ok(()),
        None => Err(Error::CollectionNotFound(collection.to_string()).into()),
    }
}

async fn load_index_defs(conn: &mut SqliteConnection, collection: &str) -> Result<Vec<IndexDef>> {
    let rows = sqlx::query(
        r#"
        SELECT name, key_path, is_unique
        FROM schema_indexes
        WHERE collection = ?
        ORDER BY name
        "#,
    )
    .bind(collection)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter()
        .map(|row| -> Result<IndexDef> {
            Ok(IndexDef {
                name: row.try_get("name")?,
                key_path: row.try_get("key_path")?,
                unique: row.try_get::<i64, _>("is_unique")? != 0,
            })
        })
        .collect()
}

async fn load_items(conn: &mut SqliteConnection, collection: &str) -> Result<Vec<Item>> {
    let bodies: Vec<String> =
        sqlx::query_scalar("SELECT body FROM records WHERE collection = ? ORDER BY id")
            .bind(collection)
            .fetch_all(&mut *conn)
            .await?;
    bodies.iter().map(|b| decode_item(b)).collect()
}

async fn insert_index_entry(
    conn: &mut SqliteConnection,
    def: &IndexDef,
    item: &Item,
) -> Result<()> {
    let Some(key) = IndexKey::for_item(item, &def.key_path) else {
        return Ok(());
    };
    let (key_type, key_num, key_text) = key.columns();
    sqlx::query(
        r#"
        INSERT INTO index_entries (collection, index_name, key_type, key_num, key_text, record_id)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&item.collection)
    .bind(&def.name)
    .bind(key_type as i64)
    .bind(key_num)
    .bind(key_text)
    .bind(&item.id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn require_index(conn: &mut SqliteConnection, collection: &str, index: &str) -> Result<()> {
    require_collection(&mut *conn, collection).await?;
    let found: Option<i64> =
        sqlx::query_scalar("SELECT 1 FROM schema_indexes WHERE collection = ? AND name = ?")
            .bind(collection)
            .bind(index)
            .fetch_optional(&mut *conn)
            .await?;
    match found {
        Some(_) => Ok(()),
        None => Err(Error::IndexNotFound {
            collection: collection.to_string(),
            index: index.to_string(),
        }
        .into()),
    }
}

async fn fetch_range(
    conn: &mut SqliteConnection,
    collection: &str,
    index: &str,
    range: &KeyRange,
) -> Result<Vec<Item>> {
    if range.is_empty() {
        return Ok(Vec::new());
    }

    let mut sql = String::from(
        r#"
        SELECT r.body FROM index_entries e
        JOIN records r ON r.collection = e.collection AND r.id = e.record_id
        WHERE e.collection = ? AND e.index_name = ?
        "#,
    );
    if let Some(lower) = &range.lower {
        sql.push_str(if lower.inclusive {
            " AND (e.key_type, e.key_num, e.key_text) >= (?, ?, ?)"
        } else {
            " AND (e.key_type, e.key_num, e.key_text) > (?, ?, ?)"
        });
    }
    if let Some(upper) = &range.upper {
        sql.push_str(if upper.inclusive {
            " AND (e.key_type, e.key_num, e.key_text) <= (?, ?, ?)"
        } else {
            " AND (e.key_type, e.key_num, e.key_text) < (?, ?, ?)"
        });
    }
    sql.push_str(" ORDER BY e.key_type, e.key_num, e.key_text, e.record_id");

    let mut query = sqlx::query_scalar::<_, String>(&sql)
        .bind(collection)
        .bind(index);
    for bound in [&range.lower, &range.upper].into_iter().flatten() {
        let (key_type, key_num, key_text) = bound.key.columns();
        query = query.bind(key_type as i64).bind(key_num).bind(key_text);
    }

    let bodies = query.fetch_all(&mut *conn).await?;
    bodies.iter().map(|b| decode_item(b)).collect()
}

#[async_trait]
impl LocalStore for SqliteStore {
    async fn ensure(
        &self,
        collection: &str,
        primary_key_path: &str,
        indexes: &[IndexDef],
    ) -> Result<SchemaChange> {
        validate_index_set(collection, indexes)?;

        let _guard = self.upgrade_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let existing_pk: Option<String> =
            sqlx::query_scalar("SELECT primary_key_path FROM collections WHERE name = ?")
                .bind(collection)
                .fetch_optional(&mut *tx)
                .await?;
        if let Some(pk) = &existing_pk {
            if pk != primary_key_path {
                return Err(Error::SchemaUpgrade {
                    collection: collection.to_string(),
                    reason: format!("primary key path is {pk:?}, not {primary_key_path:?}"),
                }
                .into());
            }
        }

        let existing = load_index_defs(&mut tx, collection).await?;
        let mut missing: Vec<IndexDef> = Vec::new();
        for def in indexes {
            if missing.iter().any(|d| d.name == def.name) {
                continue;
            }
            match existing.iter().find(|d| d.name == def.name) {
                Some(current) if current == def => {}
                Some(current) => {
                    return Err(Error::SchemaUpgrade {
                        collection: collection.to_string(),
                        reason: format!(
                            "index {} already exists over {}",
                            def.name, current.key_path
                        ),
                    }
                    .into())
                }
                None => missing.push(def.clone()),
            }
        }

        let change = SchemaChange {
            created: existing_pk.is_none(),
            added_indexes: missing.iter().map(|d| d.name.clone()).collect(),
        };
        if change.is_noop() {
            return Ok(change);
        }

        if change.created {
            sqlx::query("INSERT INTO collections (name, primary_key_path) VALUES (?, ?)")
                .bind(collection)
                .bind(primary_key_path)
                .execute(&mut *tx)
                .await?;
        }

        if !missing.is_empty() {
            let items = load_items(&mut tx, collection).await?;
            for def in &missing {
                // Validates uniqueness over the existing data before any row
                // is written; the transaction rolls back on failure.
                SecondaryIndex::build(def.clone(), items.iter()).map_err(|e| {
                    Error::SchemaUpgrade {
                        collection: collection.to_string(),
                        reason: e.to_string(),
                    }
                })?;

                sqlx::query(
                    "INSERT INTO schema_indexes (collection, name, key_path, is_unique) VALUES (?, ?, ?, ?)",
                )
                .bind(collection)
                .bind(&def.name)
                .bind(&def.key_path)
                .bind(def.unique as i64)
                .execute(&mut *tx)
                .await?;

                for item in &items {
                    insert_index_entry(&mut tx, def, item).await?;
                }
            }
        }

        sqlx::query("UPDATE schema_meta SET version = version + 1 WHERE id = 1")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(
            collection = %collection,
            created = change.created,
            added = ?change.added_indexes,
            "Schema upgraded"
        );
        Ok(change)
    }

    async fn schema_version(&self) -> Result<SchemaVersion> {
        let version: i64 = sqlx::query_scalar("SELECT version FROM schema_meta WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;
        SchemaVersion::try_from(version)
            .map_err(|_| RuntimeError::Corrupt(format!("schema version {version}")))
    }

    async fn index_defs(&self, collection: &str) -> Result<Vec<IndexDef>> {
        let mut conn = self.pool.acquire().await?;
        require_collection(&mut conn, collection).await?;
        load_index_defs(&mut conn, collection).await
    }

    async fn put(&self, item: &Item) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        require_collection(&mut tx, &item.collection).await?;
        let defs = load_index_defs(&mut tx, &item.collection).await?;

        for def in defs.iter().filter(|d| d.unique) {
            let Some(key) = IndexKey::for_item(item, &def.key_path) else {
                continue;
            };
            let (key_type, key_num, key_text) = key.columns();
            let clash: Option<String> = sqlx::query_scalar(
                r#"
                SELECT record_id FROM index_entries
                WHERE collection = ? AND index_name = ?
                  AND key_type = ? AND key_num = ? AND key_text = ?
                  AND record_id <> ?
                LIMIT 1
                "#,
            )
            .bind(&item.collection)
            .bind(&def.name)
            .bind(key_type as i64)
            .bind(key_num)
            .bind(key_text)
            .bind(&item.id)
            .fetch_optional(&mut *tx)
            .await?;
            if clash.is_some() {
                return Err(Error::UniqueViolation {
                    index: def.name.clone(),
                    key: key.to_string(),
                }
                .into());
            }
        }

        let body = serde_json::to_string(item)?;
        sqlx::query(
            r#"
            INSERT INTO records (collection, id, body, updated_at, is_deleted)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (collection, id) DO UPDATE SET
                body = excluded.body,
                updated_at = excluded.updated_at,
                is_deleted = excluded.is_deleted
            "#,
        )
        .bind(&item.collection)
        .bind(&item.id)
        .bind(&body)
        .bind(item.updated_at as i64)
        .bind(item.is_deleted)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM index_entries WHERE collection = ? AND record_id = ?")
            .bind(&item.collection)
            .bind(&item.id)
            .execute(&mut *tx)
            .await?;
        for def in &defs {
            insert_index_entry(&mut tx, def, item).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Item>> {
        let mut conn = self.pool.acquire().await?;
        require_collection(&mut conn, collection).await?;
        let body: Option<String> =
            sqlx::query_scalar("SELECT body FROM records WHERE collection = ? AND id = ?")
                .bind(collection)
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?;
        body.as_deref().map(decode_item).transpose()
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        require_collection(&mut tx, collection).await?;
        let removed = sqlx::query("DELETE FROM records WHERE collection = ? AND id = ?")
            .bind(collection)
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM index_entries WHERE collection = ? AND record_id = ?")
            .bind(collection)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(removed > 0)
    }

    async fn get_all(&self, collection: &str) -> Result<Vec<Item>> {
        let mut conn = self.pool.acquire().await?;
        require_collection(&mut conn, collection).await?;
        load_items(&mut conn, collection).await
    }

    async fn get_all_by_index(
        &self,
        collection: &str,
        index: &str,
        value: &Value,
    ) -> Result<Vec<Item>> {
        let mut conn = self.pool.acquire().await?;
        require_index(&mut conn, collection, index).await?;
        match IndexKey::from_value(value) {
            Some(key) => fetch_range(&mut conn, collection, index, &KeyRange::exact(key)).await,
            None => Ok(Vec::new()),
        }
    }

    async fn get_by_range(
        &self,
        collection: &str,
        index: &str,
        range: &KeyRange,
    ) -> Result<Vec<Item>> {
        let mut conn = self.pool.acquire().await?;
        require_index(&mut conn, collection, index).await?;
        fetch_range(&mut conn, collection, index, range).await
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        let mut conn = self.pool.acquire().await?;
        require_collection(&mut conn, collection).await?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records WHERE collection = ?")
            .bind(collection)
            .fetch_one(&mut *conn)
            .await?;
        Ok(count as usize)
    }
}

#[async_trait]
impl SyncStateStore for SqliteStore {
    async fn enqueue(&self, mut entry: QueueEntry) -> Result<QueueEntry> {
        let body = serde_json::to_string(&entry)?;
        let seq = sqlx::query(
            r#"
            INSERT INTO replication_queue (id, collection, item_id, status, body)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.collection)
        .bind(&entry.item_id)
        .bind(entry.status.as_str())
        .bind(&body)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        entry.seq = seq as u64;
        Ok(entry)
    }

    async fn queue_entries(&self, collection: Option<&str>) -> Result<Vec<QueueEntry>> {
        let rows = match collection {
            Some(collection) => {
                sqlx::query(
                    "SELECT seq, body FROM replication_queue WHERE collection = ? ORDER BY seq",
                )
                .bind(collection)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT seq, body FROM replication_queue ORDER BY seq")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter()
            .map(|row| -> Result<QueueEntry> {
                let seq: i64 = row.try_get("seq")?;
                let body: String = row.try_get("body")?;
                decode_entry(seq, &body)
            })
            .collect()
    }

    async fn update_queue_entry(&self, entry: &QueueEntry) -> Result<()> {
        let body = serde_json::to_string(entry)?;
        let updated = sqlx::query("UPDATE replication_queue SET status = ?, body = ? WHERE id = ?")
            .bind(entry.status.as_str())
            .bind(&body)
            .bind(&entry.id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(Error::Storage(format!("queue entry {} not found", entry.id)).into());
        }
        Ok(())
    }

    async fn remove_queue_entry(&self, id: &str) -> Result<bool> {
        let removed = sqlx::query("DELETE FROM replication_queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed > 0)
    }

    async fn checkpoint(&self, collection: &str) -> Result<Checkpoint> {
        let stored: Option<Option<i64>> =
            sqlx::query_scalar("SELECT last_pulled_at FROM checkpoints WHERE collection = ?")
                .bind(collection)
                .fetch_optional(&self.pool)
                .await?;
        Ok(Checkpoint {
            collection: collection.to_string(),
            last_pulled_at: stored.flatten().map(|t| t as u64),
        })
    }

    async fn set_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO checkpoints (collection, last_pulled_at) VALUES (?, ?)
            ON CONFLICT (collection) DO UPDATE SET last_pulled_at = excluded.last_pulled_at
            "#,
        )
        .bind(&checkpoint.collection)
        .bind(checkpoint.last_pulled_at.map(|t| t as i64))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
