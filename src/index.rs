//! Relational index of blob ownership and container structure.
//!
//! Every mutation is an `INSERT ... ON CONFLICT DO NOTHING` against the
//! unique constraints followed by a re-select, which gives at-most-once
//! semantics when identical content is ingested concurrently.

use rusqlite::{params, OptionalExtension};
use serde_json::Value;

use crate::db::Db;
use crate::error::Result;
use crate::object::{BlobRef, EntryType, TenantKey};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS orgs (
    id   INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS tenants (
    id     INTEGER PRIMARY KEY,
    org_id INTEGER NOT NULL REFERENCES orgs(id),
    name   TEXT NOT NULL,
    uuid   TEXT,
    UNIQUE (org_id, name)
);
CREATE TABLE IF NOT EXISTS blob_refs (
    id        INTEGER PRIMARY KEY,
    hash      BLOB NOT NULL,
    leaf_size INTEGER NOT NULL,
    container INTEGER NOT NULL,
    mime_type TEXT,
    handler   TEXT,
    UNIQUE (hash, leaf_size, container)
);
CREATE TABLE IF NOT EXISTS blobs (
    id          INTEGER PRIMARY KEY,
    tenant_id   INTEGER NOT NULL REFERENCES tenants(id),
    blob_ref_id INTEGER NOT NULL REFERENCES blob_refs(id),
    UNIQUE (tenant_id, blob_ref_id)
);
CREATE TABLE IF NOT EXISTS blob_contents (
    blob_id        INTEGER PRIMARY KEY REFERENCES blobs(id),
    extracted_text TEXT,
    metadata       TEXT NOT NULL DEFAULT '{}'
);
CREATE TABLE IF NOT EXISTS containers (
    blob_id     INTEGER PRIMARY KEY REFERENCES blobs(id),
    entry_count INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS entries (
    id            INTEGER PRIMARY KEY,
    container_id  INTEGER NOT NULL REFERENCES containers(blob_id),
    blob_id       INTEGER NOT NULL REFERENCES blobs(id),
    entry_type    TEXT NOT NULL,
    internal_path TEXT NOT NULL,
    mtime         INTEGER,
    metadata      TEXT NOT NULL DEFAULT '{}',
    position      INTEGER NOT NULL,
    UNIQUE (container_id, internal_path)
);
CREATE INDEX IF NOT EXISTS idx_entries_blob ON entries(blob_id);
CREATE INDEX IF NOT EXISTS idx_blobs_tenant ON blobs(tenant_id);
";

/// A tenant row.
#[derive(Clone, Debug)]
pub struct TenantRow {
    pub id: i64,
    pub org_id: i64,
    pub name: String,
    pub uuid: Option<uuid::Uuid>,
}

impl TenantRow {
    /// Returns the key under which this tenant's objects are stored.
    pub fn key(&self) -> TenantKey {
        TenantKey::new(self.id, self.uuid)
    }
}

/// An entry row to be batch-inserted for a container.
#[derive(Clone, Debug)]
pub struct NewEntry {
    pub blob_id: i64,
    pub entry_type: EntryType,
    pub internal_path: String,
    pub mtime_millis: Option<i64>,
    pub metadata: Value,
    pub position: i64,
}

/// An entry row read back from the index.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EntryRecord {
    pub blob_id: i64,
    pub entry_type: EntryType,
    pub internal_path: String,
    pub position: i64,
}

/// Row counts across the content tables, used to check idempotence.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IndexCounts {
    pub blob_refs: usize,
    pub blobs: usize,
    pub containers: usize,
    pub entries: usize,
}

/// The blob/entry index.
#[derive(Clone, Debug)]
pub struct Index {
    db: Db,
}

impl Index {
    /// Creates an index over the given database handle.
    pub fn new(db: Db) -> Self {
        Index { db }
    }

    /// Applies the schema. Safe to call repeatedly.
    pub async fn init(&self) -> Result<()> {
        self.db.with(|conn| Ok(conn.execute_batch(SCHEMA)?)).await
    }

    /// Finds or creates an organization by name.
    pub async fn find_or_insert_org(&self, name: &str) -> Result<i64> {
        let name = name.to_owned();
        self.db
            .transaction(move |tx| {
                tx.execute(
                    "INSERT INTO orgs (name) VALUES (?1) ON CONFLICT DO NOTHING",
                    params![name],
                )?;
                let id = tx.query_row(
                    "SELECT id FROM orgs WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )?;
                Ok(id)
            })
            .await
    }

    /// Finds or creates a tenant under an organization.
    ///
    /// New tenants are assigned a global UUID.
    pub async fn find_or_insert_tenant(&self, org_id: i64, name: &str) -> Result<TenantRow> {
        let name = name.to_owned();
        self.db
            .transaction(move |tx| {
                let uuid = uuid::Uuid::new_v4();
                tx.execute(
                    "INSERT INTO tenants (org_id, name, uuid) VALUES (?1, ?2, ?3)
                     ON CONFLICT DO NOTHING",
                    params![org_id, name, uuid.to_string()],
                )?;
                let row = tx.query_row(
                    "SELECT id, org_id, name, uuid FROM tenants
                     WHERE org_id = ?1 AND name = ?2",
                    params![org_id, name],
                    read_tenant,
                )?;
                Ok(row)
            })
            .await
    }

    /// Loads a tenant row by id.
    pub async fn tenant_by_id(&self, id: i64) -> Result<Option<TenantRow>> {
        self.db
            .with(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT id, org_id, name, uuid FROM tenants WHERE id = ?1",
                        params![id],
                        read_tenant,
                    )
                    .optional()?)
            })
            .await
    }

    /// Resolves a storage tenant key back to its tenant row.
    pub async fn tenant_by_key(&self, key: &TenantKey) -> Result<Option<TenantRow>> {
        let key = key.clone();
        self.db
            .with(move |conn| {
                let by_uuid = conn
                    .query_row(
                        "SELECT id, org_id, name, uuid FROM tenants WHERE uuid = ?1",
                        params![key.as_str()],
                        read_tenant,
                    )
                    .optional()?;
                if by_uuid.is_some() {
                    return Ok(by_uuid);
                }
                match key.as_str().parse::<i64>() {
                    Ok(id) => Ok(conn
                        .query_row(
                            "SELECT id, org_id, name, uuid FROM tenants WHERE id = ?1",
                            params![id],
                            read_tenant,
                        )
                        .optional()?),
                    Err(_) => Ok(None),
                }
            })
            .await
    }

    /// Finds or creates the global row identifying a blob ref.
    ///
    /// Returns the `blob_refs.id`. MIME and handler are advisory hints set on
    /// first sighting and never overwritten.
    pub async fn find_or_insert_blob_ref(
        &self,
        blob: &BlobRef,
        mime: Option<&str>,
        handler: Option<&str>,
    ) -> Result<i64> {
        let blob = *blob;
        let mime = mime.map(str::to_owned);
        let handler = handler.map(str::to_owned);
        self.db
            .transaction(move |tx| find_or_insert_blob_ref_tx(tx, &blob, mime.as_deref(), handler.as_deref()))
            .await
    }

    /// Finds or creates a tenant's ownership row for a blob ref.
    ///
    /// Returns the `blobs.id`.
    pub async fn find_or_insert_blob(&self, tenant_id: i64, blob_ref_id: i64) -> Result<i64> {
        self.db
            .transaction(move |tx| find_or_insert_blob_tx(tx, tenant_id, blob_ref_id))
            .await
    }

    /// Stores or replaces the enrichment record for a blob.
    pub async fn upsert_blob_content(
        &self,
        blob_id: i64,
        extracted_text: Option<&str>,
        metadata: &Value,
    ) -> Result<()> {
        let text = extracted_text.map(str::to_owned);
        let metadata = metadata.to_string();
        self.db
            .with(move |conn| {
                conn.execute(
                    "INSERT INTO blob_contents (blob_id, extracted_text, metadata)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT (blob_id) DO UPDATE
                     SET extracted_text = excluded.extracted_text,
                         metadata = excluded.metadata",
                    params![blob_id, text, metadata],
                )?;
                Ok(())
            })
            .await
    }

    /// Records a container and its entries in one transaction.
    ///
    /// The entry batch mirrors a manifest's child list; committing both
    /// together means readers never observe a container without its entries.
    pub async fn insert_container(&self, blob_id: i64, entries: Vec<NewEntry>) -> Result<()> {
        self.db
            .transaction(move |tx| {
                tx.execute(
                    "INSERT INTO containers (blob_id, entry_count) VALUES (?1, ?2)
                     ON CONFLICT DO NOTHING",
                    params![blob_id, entries.len() as i64],
                )?;
                let mut stmt = tx.prepare(
                    "INSERT INTO entries
                     (container_id, blob_id, entry_type, internal_path, mtime, metadata, position)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT DO NOTHING",
                )?;
                for entry in &entries {
                    stmt.execute(params![
                        blob_id,
                        entry.blob_id,
                        entry.entry_type.as_str(),
                        entry.internal_path,
                        entry.mtime_millis,
                        entry.metadata.to_string(),
                        entry.position,
                    ])?;
                }
                Ok(())
            })
            .await
    }

    /// Looks up the row id of a blob ref, if it has been seen.
    pub async fn blob_ref_id(&self, blob: &BlobRef) -> Result<Option<i64>> {
        let blob = *blob;
        self.db
            .with(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT id FROM blob_refs
                         WHERE hash = ?1 AND leaf_size = ?2 AND container = ?3",
                        params![
                            blob.hash.as_bytes().as_slice(),
                            blob.leaf_size as i64,
                            blob.is_container()
                        ],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await
    }

    /// Reads back the ordered entries of a container.
    pub async fn container_entries(&self, container_blob_id: i64) -> Result<Vec<EntryRecord>> {
        self.db
            .with(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT blob_id, entry_type, internal_path, position
                     FROM entries WHERE container_id = ?1 ORDER BY position ASC",
                )?;
                let rows = stmt.query_map(params![container_blob_id], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })?;

                let mut records = Vec::new();
                for row in rows {
                    let (blob_id, entry_type, internal_path, position) = row?;
                    records.push(EntryRecord {
                        blob_id,
                        entry_type: entry_type
                            .parse()
                            .map_err(|_| rusqlite::Error::InvalidQuery)?,
                        internal_path,
                        position,
                    });
                }
                Ok(records)
            })
            .await
    }

    /// Counts rows across the content tables.
    pub async fn counts(&self) -> Result<IndexCounts> {
        self.db
            .with(|conn| {
                let count = |table: &str| -> rusqlite::Result<usize> {
                    conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                        row.get::<_, i64>(0).map(|n| n as usize)
                    })
                };
                Ok(IndexCounts {
                    blob_refs: count("blob_refs")?,
                    blobs: count("blobs")?,
                    containers: count("containers")?,
                    entries: count("entries")?,
                })
            })
            .await
    }

    /// Deletes every content row, leaving orgs and tenants intact.
    ///
    /// Used by the SQL rebuild when asked to start from a clean slate.
    pub async fn truncate_content(&self) -> Result<()> {
        self.db
            .transaction(|tx| {
                tx.execute_batch(
                    "DELETE FROM entries;
                     DELETE FROM containers;
                     DELETE FROM blob_contents;
                     DELETE FROM blobs;
                     DELETE FROM blob_refs;",
                )?;
                Ok(())
            })
            .await
    }

    /// Returns the underlying database handle.
    pub fn db(&self) -> &Db {
        &self.db
    }
}

fn read_tenant(row: &rusqlite::Row) -> rusqlite::Result<TenantRow> {
    let uuid: Option<String> = row.get(3)?;
    Ok(TenantRow {
        id: row.get(0)?,
        org_id: row.get(1)?,
        name: row.get(2)?,
        uuid: uuid.and_then(|text| text.parse().ok()),
    })
}

/// Transaction-scoped variant for callers composing larger transactions.
pub(crate) fn find_or_insert_blob_ref_tx(
    tx: &rusqlite::Transaction,
    blob: &BlobRef,
    mime: Option<&str>,
    handler: Option<&str>,
) -> Result<i64> {
    tx.execute(
        "INSERT INTO blob_refs (hash, leaf_size, container, mime_type, handler)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT DO NOTHING",
        params![
            blob.hash.as_bytes().as_slice(),
            blob.leaf_size as i64,
            blob.is_container(),
            mime,
            handler
        ],
    )?;
    let id = tx.query_row(
        "SELECT id FROM blob_refs WHERE hash = ?1 AND leaf_size = ?2 AND container = ?3",
        params![
            blob.hash.as_bytes().as_slice(),
            blob.leaf_size as i64,
            blob.is_container()
        ],
        |row| row.get(0),
    )?;
    Ok(id)
}

/// Transaction-scoped variant for callers composing larger transactions.
pub(crate) fn find_or_insert_blob_tx(
    tx: &rusqlite::Transaction,
    tenant_id: i64,
    blob_ref_id: i64,
) -> Result<i64> {
    tx.execute(
        "INSERT INTO blobs (tenant_id, blob_ref_id) VALUES (?1, ?2)
         ON CONFLICT DO NOTHING",
        params![tenant_id, blob_ref_id],
    )?;
    let id = tx.query_row(
        "SELECT id FROM blobs WHERE tenant_id = ?1 AND blob_ref_id = ?2",
        params![tenant_id, blob_ref_id],
        |row| row.get(0),
    )?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ContentHash;

    async fn test_index() -> Index {
        let index = Index::new(Db::open_in_memory().unwrap());
        index.init().await.unwrap();
        index
    }

    #[tokio::test]
    async fn org_and_tenant_upserts_are_idempotent() {
        let index = test_index().await;
        let org = index.find_or_insert_org("acme").await.unwrap();
        assert_eq!(index.find_or_insert_org("acme").await.unwrap(), org);

        let tenant = index.find_or_insert_tenant(org, "main").await.unwrap();
        let again = index.find_or_insert_tenant(org, "main").await.unwrap();
        assert_eq!(tenant.id, again.id);
        assert_eq!(tenant.uuid, again.uuid);
        assert!(tenant.uuid.is_some());
    }

    #[tokio::test]
    async fn tenant_resolves_by_uuid_and_id() {
        let index = test_index().await;
        let org = index.find_or_insert_org("acme").await.unwrap();
        let tenant = index.find_or_insert_tenant(org, "main").await.unwrap();

        let by_key = index.tenant_by_key(&tenant.key()).await.unwrap().unwrap();
        assert_eq!(by_key.id, tenant.id);

        let by_id = index
            .tenant_by_key(&TenantKey::from(tenant.id.to_string().as_str()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_id.id, tenant.id);
    }

    #[tokio::test]
    async fn blob_ref_dedup_is_global() {
        let index = test_index().await;
        let blob = BlobRef::leaf(ContentHash::of_bytes(b"x"), 1);

        let first = index
            .find_or_insert_blob_ref(&blob, Some("text/plain"), Some("opaque"))
            .await
            .unwrap();
        let second = index.find_or_insert_blob_ref(&blob, None, None).await.unwrap();
        assert_eq!(first, second);

        // The container variant is a distinct row.
        let container = index
            .find_or_insert_blob_ref(&blob.counterpart(), None, Some("zip"))
            .await
            .unwrap();
        assert_ne!(container, first);
        assert_eq!(index.counts().await.unwrap().blob_refs, 2);
    }

    #[tokio::test]
    async fn container_entries_preserve_order() {
        let index = test_index().await;
        let org = index.find_or_insert_org("acme").await.unwrap();
        let tenant = index.find_or_insert_tenant(org, "main").await.unwrap();

        let mut blob_ids = Vec::new();
        for content in [&b"a"[..], b"b", b"container"] {
            let blob = BlobRef::leaf(ContentHash::of_bytes(content), content.len() as u64);
            let ref_id = index.find_or_insert_blob_ref(&blob, None, None).await.unwrap();
            blob_ids.push(index.find_or_insert_blob(tenant.id, ref_id).await.unwrap());
        }

        let container_id = blob_ids[2];
        index
            .insert_container(
                container_id,
                vec![
                    NewEntry {
                        blob_id: blob_ids[1],
                        entry_type: EntryType::File,
                        internal_path: "z-last-alphabetically".into(),
                        mtime_millis: None,
                        metadata: Value::Null,
                        position: 0,
                    },
                    NewEntry {
                        blob_id: blob_ids[0],
                        entry_type: EntryType::File,
                        internal_path: "a-first-alphabetically".into(),
                        mtime_millis: Some(1000),
                        metadata: Value::Null,
                        position: 1,
                    },
                ],
            )
            .await
            .unwrap();

        let entries = index.container_entries(container_id).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].internal_path, "z-last-alphabetically");
        assert_eq!(entries[1].internal_path, "a-first-alphabetically");
    }

    #[tokio::test]
    async fn truncate_preserves_tenants() {
        let index = test_index().await;
        let org = index.find_or_insert_org("acme").await.unwrap();
        let tenant = index.find_or_insert_tenant(org, "main").await.unwrap();

        let blob = BlobRef::leaf(ContentHash::of_bytes(b"x"), 1);
        let ref_id = index.find_or_insert_blob_ref(&blob, None, None).await.unwrap();
        index.find_or_insert_blob(tenant.id, ref_id).await.unwrap();

        index.truncate_content().await.unwrap();
        assert_eq!(index.counts().await.unwrap(), IndexCounts::default());
        assert!(index.tenant_by_key(&tenant.key()).await.unwrap().is_some());
    }
}
