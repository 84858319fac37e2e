//! Reverse derivation of the relational index from object storage.

use std::io::Read;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;
use crate::format::FormatRegistry;
use crate::index::Index;
use crate::manifest::Manifest;
use crate::object::{BlobRef, TenantKey};
use crate::storage::ObjectStorage;

/// What a rebuild pass touched.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
pub struct RebuildReport {
    pub tenants: usize,
    pub blobs: usize,
    pub containers: usize,
    pub entries: usize,
}

/// Rebuilds the blob/entry index from object storage alone.
///
/// Two passes per the restartability argument: pass one inserts every
/// BlobRef and Blob row (for stored objects and for every child a manifest
/// references), so pass two's Container and Entry rows always find their
/// foreign keys in place. Every insert is an idempotent upsert, so a crashed
/// rebuild can simply run again.
///
/// Organization and tenant rows are not derivable from object keys and must
/// already exist; stored objects whose tenant key resolves to no tenant are
/// skipped with a warning.
pub async fn sql_rebuild(
    storage: &Arc<dyn ObjectStorage>,
    index: &Index,
    registry: &FormatRegistry,
    truncate_first: bool,
) -> Result<RebuildReport> {
    if truncate_first {
        index.truncate_content().await?;
    }

    let mut report = RebuildReport::default();
    let tenants = storage.list_tenants().await?;

    // Pass 1: identities and ownership.
    for tenant_key in &tenants {
        let tenant = match index.tenant_by_key(tenant_key).await? {
            Some(tenant) => tenant,
            None => {
                warn!(tenant = %tenant_key, "stored objects for unknown tenant; skipping");
                continue;
            }
        };
        report.tenants += 1;

        for blob in storage.list_blobs(tenant_key).await? {
            let handler = if blob.is_container() {
                read_manifest(storage, tenant_key, &blob)
                    .await?
                    .and_then(|manifest| registry.by_id(manifest.format_id))
                    .map(|format| format.name())
            } else {
                None
            };

            let ref_id = index.find_or_insert_blob_ref(&blob, None, handler).await?;
            index.find_or_insert_blob(tenant.id, ref_id).await?;
            report.blobs += 1;

            if blob.is_container() {
                if let Some(manifest) = read_manifest(storage, tenant_key, &blob).await? {
                    for entry in &manifest.entries {
                        let child = entry.child_ref();
                        let child_ref_id =
                            index.find_or_insert_blob_ref(&child, None, None).await?;
                        index.find_or_insert_blob(tenant.id, child_ref_id).await?;
                    }
                }
            }
        }
    }

    // Pass 2: structure.
    for tenant_key in &tenants {
        let tenant = match index.tenant_by_key(tenant_key).await? {
            Some(tenant) => tenant,
            None => continue,
        };

        for container in storage.list_containers(tenant_key).await? {
            let manifest = match read_manifest(storage, tenant_key, &container).await? {
                Some(manifest) => manifest,
                None => continue,
            };

            let ref_id = index.find_or_insert_blob_ref(&container, None, None).await?;
            let blob_id = index.find_or_insert_blob(tenant.id, ref_id).await?;

            let mut rows = Vec::with_capacity(manifest.entries.len());
            for (position, entry) in manifest.entries.iter().enumerate() {
                let child = entry.child_ref();
                let child_ref_id = index.find_or_insert_blob_ref(&child, None, None).await?;
                let child_blob_id = index.find_or_insert_blob(tenant.id, child_ref_id).await?;
                rows.push(crate::index::NewEntry {
                    blob_id: child_blob_id,
                    entry_type: entry.entry_type,
                    internal_path: entry.path.clone(),
                    mtime_millis: entry.mtime_millis,
                    metadata: entry_metadata_json(&entry.metadata),
                    position: position as i64,
                });
            }
            report.entries += rows.len();
            index.insert_container(blob_id, rows).await?;
            report.containers += 1;
        }
    }

    info!(
        tenants = report.tenants,
        blobs = report.blobs,
        containers = report.containers,
        "index rebuilt from storage"
    );
    Ok(report)
}

async fn read_manifest(
    storage: &Arc<dyn ObjectStorage>,
    tenant: &TenantKey,
    container: &BlobRef,
) -> Result<Option<Manifest>> {
    let mut data = storage.read(tenant, container).await?;
    let mut bytes = Vec::with_capacity(data.size() as usize);
    data.read_to_end(&mut bytes)?;
    match Manifest::decode(&bytes) {
        Ok(manifest) => Ok(Some(manifest)),
        Err(e) => {
            warn!(container = %container, error = %e, "undecodable manifest during rebuild");
            Ok(None)
        }
    }
}

fn entry_metadata_json(metadata: &[u8]) -> serde_json::Value {
    if metadata.is_empty() {
        return serde_json::Value::Object(serde_json::Map::new());
    }
    serde_json::from_slice(metadata)
        .unwrap_or_else(|_| serde_json::json!({ "raw_hex": hex::encode(metadata) }))
}
