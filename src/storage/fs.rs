//! Filesystem-backed object storage.

use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use async_trait::async_trait;
use filetime::FileTime;

use super::{object_key, verify_label, ObjectStorage, BLOBS_SEGMENT, TENANTS_SEGMENT};
use crate::error::{Result, VaultError};
use crate::object::{BinaryData, BlobKind, BlobRef, ContentHash, Contents, TenantKey};

/// Object storage backed by a local directory tree.
///
/// Each blob is written to a temporary file first and atomically renamed into
/// place, so readers never observe partially-written objects. Persisted files
/// get read-only permissions and a zeroed mtime; content addressing makes the
/// original timestamps meaningless.
#[derive(Debug)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    /// Opens (creating if necessary) a storage directory at `path`.
    ///
    /// Returns `Err` if the directory could not be created due to permissions
    /// or other I/O errors.
    pub fn open<P: Into<PathBuf>>(path: P) -> anyhow::Result<Self> {
        let root = path.into();
        std::fs::create_dir_all(root.join(TENANTS_SEGMENT))
            .context("could not create storage root")?;
        Ok(FsStorage { root })
    }

    fn blob_path(&self, tenant: &TenantKey, blob: &BlobRef) -> PathBuf {
        self.root.join(object_key(tenant, blob))
    }

    fn persist(&self, dest: &Path, data: &mut (dyn BinaryData + 'static)) -> Result<()> {
        let parent = dest.parent().expect("blob path cannot be at storage root");
        std::fs::create_dir_all(parent)?;

        let mut temp = tempfile::NamedTempFile::new_in(&self.root)?;
        data.seek(SeekFrom::Start(0))?;
        data.copy_to(&mut temp)?;
        temp.flush()?;

        let mut perms = temp.as_file().metadata()?.permissions();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            perms.set_mode(0o444);
        }
        perms.set_readonly(true);
        temp.as_file_mut().set_permissions(perms)?;
        filetime::set_file_mtime(temp.path(), FileTime::zero())?;

        match temp.persist(dest) {
            Ok(_) => Ok(()),
            // Lost the race to a concurrent writer of the same key; the
            // bytes agree by construction, so this write is a no-op.
            Err(_) if dest.is_file() => Ok(()),
            Err(e) => Err(e.error.into()),
        }
    }
}

#[async_trait]
impl ObjectStorage for FsStorage {
    async fn write(
        &self,
        tenant: &TenantKey,
        blob: &BlobRef,
        data: &mut (dyn BinaryData + 'static),
        _mime: Option<&str>,
    ) -> Result<()> {
        let dest = self.blob_path(tenant, blob);
        if dest.is_file() {
            return Ok(());
        }

        verify_label(blob, data)?;
        self.persist(&dest, data)
    }

    async fn read(&self, tenant: &TenantKey, blob: &BlobRef) -> Result<Box<dyn BinaryData>> {
        let path = self.blob_path(tenant, blob);
        if !path.is_file() {
            return Err(VaultError::BlobNotFound {
                tenant: tenant.clone(),
                blob: *blob,
            });
        }
        let contents = Contents::open(&path)?;
        Ok(Box::new(contents))
    }

    async fn exists(&self, tenant: &TenantKey, blob: &BlobRef) -> Result<bool> {
        Ok(self.blob_path(tenant, blob).is_file())
    }

    async fn delete(&self, tenant: &TenantKey, blob: &BlobRef) -> Result<()> {
        let path = self.blob_path(tenant, blob);
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_tenant(&self, tenant: &TenantKey) -> Result<()> {
        let dir = self.root.join(TENANTS_SEGMENT).join(tenant.as_str());
        match std::fs::remove_dir_all(dir) {
            Ok(()) => Ok(()),
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_tenants(&self) -> Result<Vec<TenantKey>> {
        let dir = self.root.join(TENANTS_SEGMENT);
        let mut tenants = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    tenants.push(TenantKey::from(name));
                }
            }
        }
        tenants.sort();
        Ok(tenants)
    }

    async fn list_containers(&self, tenant: &TenantKey) -> Result<Vec<BlobRef>> {
        let blobs = self.list_blobs(tenant).await?;
        Ok(blobs.into_iter().filter(BlobRef::is_container).collect())
    }

    async fn list_blobs(&self, tenant: &TenantKey) -> Result<Vec<BlobRef>> {
        let dir = self
            .root
            .join(TENANTS_SEGMENT)
            .join(tenant.as_str())
            .join(BLOBS_SEGMENT);

        let mut refs = Vec::new();
        let hashes = match std::fs::read_dir(&dir) {
            Ok(iter) => iter,
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(refs),
            Err(e) => return Err(e.into()),
        };

        // Layout: blobs/{hashHex}/{leafSize}/{kind}
        for hash_entry in hashes {
            let hash_entry = hash_entry?;
            let hash = match hash_entry.file_name().to_str().map(ContentHash::from_str) {
                Some(Ok(hash)) => hash,
                _ => continue,
            };
            for size_entry in std::fs::read_dir(hash_entry.path())? {
                let size_entry = size_entry?;
                let leaf_size = match size_entry.file_name().to_str().map(str::parse::<u64>) {
                    Some(Ok(size)) => size,
                    _ => continue,
                };
                for kind_entry in std::fs::read_dir(size_entry.path())? {
                    let kind_entry = kind_entry?;
                    if let Some(Ok(kind)) =
                        kind_entry.file_name().to_str().map(BlobKind::from_str)
                    {
                        refs.push(BlobRef {
                            hash,
                            leaf_size,
                            kind,
                        });
                    }
                }
            }
        }

        refs.sort();
        Ok(refs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Buffer;

    fn leaf(bytes: &[u8]) -> (BlobRef, Buffer) {
        let mut buf = Buffer::from_bytes(bytes.to_vec());
        let hash = buf.hash().unwrap();
        (BlobRef::leaf(hash, bytes.len() as u64), buf)
    }

    #[tokio::test]
    async fn write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::open(dir.path()).unwrap();
        let tenant = TenantKey::from("t1");

        let (blob, mut buf) = leaf(b"payload bytes");
        storage.write(&tenant, &blob, &mut buf, None).await.unwrap();
        assert!(storage.exists(&tenant, &blob).await.unwrap());

        let mut read = storage.read(&tenant, &blob).await.unwrap();
        assert_eq!(read.size(), 13);
        assert_eq!(read.hash().unwrap(), blob.hash);
    }

    #[tokio::test]
    async fn write_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::open(dir.path()).unwrap();
        let tenant = TenantKey::from("t1");

        let (blob, mut buf) = leaf(b"same bytes");
        storage.write(&tenant, &blob, &mut buf, None).await.unwrap();
        let mut again = Buffer::from_bytes(b"same bytes".to_vec());
        storage.write(&tenant, &blob, &mut again, None).await.unwrap();
        assert_eq!(storage.list_blobs(&tenant).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mislabeled_write_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::open(dir.path()).unwrap();
        let tenant = TenantKey::from("t1");

        let (blob, _) = leaf(b"claimed content");
        let mut wrong = Buffer::from_bytes(b"different content".to_vec());
        let err = storage
            .write(&tenant, &blob, &mut wrong, None)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::BlobAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::open(dir.path()).unwrap();
        let tenant = TenantKey::from("t1");

        let (blob, _) = leaf(b"never stored");
        let err = storage.read(&tenant, &blob).await.unwrap_err();
        assert!(matches!(err, VaultError::BlobNotFound { .. }));
    }

    #[tokio::test]
    async fn listings_cover_kinds_and_tenants() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::open(dir.path()).unwrap();
        let t1 = TenantKey::from("t1");
        let t2 = TenantKey::from("t2");

        let (blob, mut buf) = leaf(b"shared");
        storage.write(&t1, &blob, &mut buf, None).await.unwrap();
        let mut again = Buffer::from_bytes(b"shared".to_vec());
        storage.write(&t2, &blob, &mut again, None).await.unwrap();

        // A manifest is filed under the original content's identity.
        let mut manifest_bytes = Buffer::from_bytes(b"manifest".to_vec());
        let manifest = BlobRef::container(blob.hash, blob.leaf_size);
        storage
            .write(&t1, &manifest, &mut manifest_bytes, None)
            .await
            .unwrap();

        assert_eq!(storage.list_tenants().await.unwrap(), vec![t1.clone(), t2]);
        assert_eq!(storage.list_blobs(&t1).await.unwrap().len(), 2);
        assert_eq!(storage.list_containers(&t1).await.unwrap(), vec![manifest]);
    }
}
