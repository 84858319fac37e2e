//! In-memory object storage intended for testing.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::io::Seek;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{verify_label, ObjectStorage};
use crate::error::{Result, VaultError};
use crate::object::{BinaryData, BlobRef, Contents, TenantKey};

/// Object storage kept entirely in memory, useful for testing.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: Mutex<BTreeMap<(TenantKey, BlobRef), Vec<u8>>>,
}

impl MemoryStorage {
    /// Creates an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored objects across all tenants.
    pub async fn object_count(&self) -> usize {
        self.objects.lock().await.len()
    }
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    async fn write(
        &self,
        tenant: &TenantKey,
        blob: &BlobRef,
        data: &mut (dyn BinaryData + 'static),
        _mime: Option<&str>,
    ) -> Result<()> {
        let mut objects = self.objects.lock().await;
        let key = (tenant.clone(), *blob);
        if objects.contains_key(&key) {
            return Ok(());
        }

        verify_label(blob, data)?;
        let mut bytes = Vec::with_capacity(data.size() as usize);
        data.seek(SeekFrom::Start(0))?;
        data.copy_to(&mut bytes)?;
        objects.insert(key, bytes);
        Ok(())
    }

    async fn read(&self, tenant: &TenantKey, blob: &BlobRef) -> Result<Box<dyn BinaryData>> {
        let objects = self.objects.lock().await;
        match objects.get(&(tenant.clone(), *blob)) {
            Some(bytes) => Ok(Box::new(Contents::from_bytes(bytes.clone()))),
            None => Err(VaultError::BlobNotFound {
                tenant: tenant.clone(),
                blob: *blob,
            }),
        }
    }

    async fn exists(&self, tenant: &TenantKey, blob: &BlobRef) -> Result<bool> {
        let objects = self.objects.lock().await;
        Ok(objects.contains_key(&(tenant.clone(), *blob)))
    }

    async fn delete(&self, tenant: &TenantKey, blob: &BlobRef) -> Result<()> {
        let mut objects = self.objects.lock().await;
        objects.remove(&(tenant.clone(), *blob));
        Ok(())
    }

    async fn delete_tenant(&self, tenant: &TenantKey) -> Result<()> {
        let mut objects = self.objects.lock().await;
        objects.retain(|(owner, _), _| owner != tenant);
        Ok(())
    }

    async fn list_tenants(&self) -> Result<Vec<TenantKey>> {
        let objects = self.objects.lock().await;
        let mut tenants: Vec<_> = objects.keys().map(|(t, _)| t.clone()).collect();
        tenants.dedup();
        Ok(tenants)
    }

    async fn list_containers(&self, tenant: &TenantKey) -> Result<Vec<BlobRef>> {
        let blobs = self.list_blobs(tenant).await?;
        Ok(blobs.into_iter().filter(BlobRef::is_container).collect())
    }

    async fn list_blobs(&self, tenant: &TenantKey) -> Result<Vec<BlobRef>> {
        let objects = self.objects.lock().await;
        Ok(objects
            .keys()
            .filter(|(owner, _)| owner == tenant)
            .map(|(_, blob)| *blob)
            .collect())
    }
}
