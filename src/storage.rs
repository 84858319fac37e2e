//! Object storage interface and provided implementations.

pub use self::fs::FsStorage;
pub use self::mem::MemoryStorage;

use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::Result;
use crate::object::{BinaryData, BlobRef, TenantKey};

mod fs;
mod mem;

const TENANTS_SEGMENT: &str = "tenants";
const BLOBS_SEGMENT: &str = "blobs";

/// Computes the canonical storage key for a blob.
///
/// Keys follow `tenants/{tenantKey}/blobs/{hashHex}/{leafSize}/{kind}`, with
/// `kind` being `leaf` or `container`. The hash and size live in the key, so
/// an object under a key can only ever hold one byte sequence.
pub fn object_key(tenant: &TenantKey, blob: &BlobRef) -> PathBuf {
    PathBuf::from(TENANTS_SEGMENT)
        .join(tenant.as_str())
        .join(BLOBS_SEGMENT)
        .join(blob.hash.to_hex())
        .join(blob.leaf_size.to_string())
        .join(blob.kind.as_str())
}

/// A tenant-scoped store of content-addressed blobs.
///
/// Objects are immutable once written: the key embeds the content hash, so a
/// successful `write` can never be observed with different bytes afterwards.
/// Concurrent writers of the same key are safe because their bytes agree.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Stores `data` under the blob's key for the given tenant.
    ///
    /// Writing is conditionally idempotent: if the key already exists the
    /// call is a no-op. The data is hashed before persisting; bytes that do
    /// not hash to `blob.hash` are rejected as mislabeled with
    /// [`BlobAlreadyExists`](crate::error::VaultError::BlobAlreadyExists).
    ///
    /// Returns `Err` if the content hash does not match or an I/O error
    /// occurred.
    async fn write(
        &self,
        tenant: &TenantKey,
        blob: &BlobRef,
        data: &mut (dyn BinaryData + 'static),
        mime: Option<&str>,
    ) -> Result<()>;

    /// Retrieves the blob stored under the given key.
    ///
    /// Returns `Err` with [`BlobNotFound`](crate::error::VaultError::BlobNotFound)
    /// if no object exists under the key, or if an I/O error occurred.
    async fn read(&self, tenant: &TenantKey, blob: &BlobRef) -> Result<Box<dyn BinaryData>>;

    /// Returns `Ok(true)` if an object exists under the given key.
    async fn exists(&self, tenant: &TenantKey, blob: &BlobRef) -> Result<bool>;

    /// Removes the object under the given key, if present.
    async fn delete(&self, tenant: &TenantKey, blob: &BlobRef) -> Result<()>;

    /// Removes every object belonging to the given tenant.
    async fn delete_tenant(&self, tenant: &TenantKey) -> Result<()>;

    /// Enumerates every tenant with at least one stored object.
    async fn list_tenants(&self) -> Result<Vec<TenantKey>>;

    /// Enumerates every container manifest stored for the given tenant.
    async fn list_containers(&self, tenant: &TenantKey) -> Result<Vec<BlobRef>>;

    /// Enumerates every blob (leaf and container) stored for the given tenant.
    async fn list_blobs(&self, tenant: &TenantKey) -> Result<Vec<BlobRef>>;
}

/// Verifies that `data` hashes to the identity its ref claims.
///
/// Only leaf objects carry their own hash in the key; a container object
/// holds manifest bytes filed under the *original* content's identity, so
/// there is nothing to check for them. Shared by backends so the
/// mislabeled-content check behaves identically everywhere.
pub(crate) fn verify_label(
    blob: &BlobRef,
    data: &mut (dyn BinaryData + 'static),
) -> Result<()> {
    if blob.is_container() {
        return Ok(());
    }
    let actual = data.hash()?;
    if actual != blob.hash {
        return Err(crate::error::VaultError::BlobAlreadyExists {
            blob: *blob,
            existing: actual,
        });
    }
    Ok(())
}
