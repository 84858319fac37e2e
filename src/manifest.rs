//! Canonical binary serialization for container manifests.
//!
//! A manifest records, in extraction order, every child a container
//! decomposes into. Encoding is deterministic: identical inputs produce
//! byte-identical manifests, which is what makes manifests content-addressable
//! alongside the blobs they describe.

use std::convert::TryFrom;

use anyhow::anyhow;
use bytes::{Buf, BufMut};

use crate::error::{Result, VaultError};
use crate::format::Capability;
use crate::object::{BlobRef, ContentHash, EntryType};

const FORMAT_VERSION: u16 = 1;

/// Upper bound on declared lengths, to stop corrupt varints from triggering
/// huge allocations during decode.
const MAX_DECLARED_LEN: u64 = 1 << 32;

/// A single child of a container, in extraction order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ManifestEntry {
    /// Path of the child inside the container.
    pub path: String,
    /// What kind of entry this is.
    pub entry_type: EntryType,
    /// Whether the child ref points at a container manifest rather than a
    /// leaf (true only for tier-1 sub-containers).
    pub is_container: bool,
    /// Content hash of the child's original bytes.
    pub child_hash: ContentHash,
    /// Size of the child's original bytes.
    pub child_leaf_size: u64,
    /// Modification time in milliseconds, if the container recorded one.
    pub mtime_millis: Option<i64>,
    /// Format-owned reconstruction state for this entry.
    pub metadata: Vec<u8>,
}

impl ManifestEntry {
    /// Returns the ref this entry points at.
    pub fn child_ref(&self) -> BlobRef {
        if self.is_container {
            BlobRef::container(self.child_hash, self.child_leaf_size)
        } else {
            BlobRef::leaf(self.child_hash, self.child_leaf_size)
        }
    }
}

/// The decoded form of a container manifest.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Manifest {
    /// Identifier of the format that produced this container.
    pub format_id: u16,
    /// Capability tier proven during ingest.
    pub capability: Capability,
    /// Children in extraction order.
    pub entries: Vec<ManifestEntry>,
    /// Format-owned reconstruction state for the container as a whole.
    pub container_meta: Vec<u8>,
}

impl Manifest {
    /// Serializes the manifest to its canonical byte form.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64 + self.entries.len() * 64);
        buf.put_u16(FORMAT_VERSION);
        buf.put_u16(self.format_id);
        buf.put_u8(self.capability.as_u8());
        put_varint(&mut buf, self.entries.len() as u64);

        for entry in &self.entries {
            put_varint(&mut buf, entry.path.len() as u64);
            buf.put_slice(entry.path.as_bytes());
            buf.put_u8(entry_type_byte(entry.entry_type));
            buf.put_u8(entry.is_container as u8);
            buf.put_slice(entry.child_hash.as_bytes());
            buf.put_u64(entry.child_leaf_size);
            buf.put_i64(entry.mtime_millis.unwrap_or(0));
            put_varint(&mut buf, entry.metadata.len() as u64);
            buf.put_slice(&entry.metadata);
        }

        put_varint(&mut buf, self.container_meta.len() as u64);
        buf.put_slice(&self.container_meta);
        buf
    }

    /// Parses a manifest from its canonical byte form.
    ///
    /// Returns `Err` if the version does not match, a field is truncated, or
    /// trailing garbage follows the optional container metadata section.
    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        let version = take_u16(&mut bytes)?;
        if version != FORMAT_VERSION {
            return Err(decode_error(anyhow!(
                "unsupported manifest version: {}",
                version
            )));
        }

        let format_id = take_u16(&mut bytes)?;
        let capability = Capability::try_from(take_u8(&mut bytes)?).map_err(decode_error)?;
        let entry_count = take_varint(&mut bytes)?;
        if entry_count > MAX_DECLARED_LEN {
            return Err(decode_error(anyhow!("entry count out of range")));
        }

        let mut entries = Vec::with_capacity(entry_count.min(1024) as usize);
        for _ in 0..entry_count {
            let path = String::from_utf8(take_bytes(&mut bytes)?)
                .map_err(|e| decode_error(anyhow!("entry path is not UTF-8: {}", e)))?;
            let entry_type = entry_type_from_byte(take_u8(&mut bytes)?)?;
            let is_container = match take_u8(&mut bytes)? {
                0 => false,
                1 => true,
                b => return Err(decode_error(anyhow!("invalid container flag: {}", b))),
            };
            let mut hash = [0u8; ContentHash::LENGTH];
            take_slice(&mut bytes, &mut hash)?;
            let child_leaf_size = take_u64(&mut bytes)?;
            let mtime = take_i64(&mut bytes)?;
            let metadata = take_bytes(&mut bytes)?;

            entries.push(ManifestEntry {
                path,
                entry_type,
                is_container,
                child_hash: ContentHash::from_bytes(hash),
                child_leaf_size,
                mtime_millis: (mtime != 0).then_some(mtime),
                metadata,
            });
        }

        // Optional container metadata section; absent means empty.
        let container_meta = if bytes.has_remaining() {
            take_bytes(&mut bytes)?
        } else {
            Vec::new()
        };

        if bytes.has_remaining() {
            return Err(decode_error(anyhow!(
                "{} bytes of trailing garbage after manifest",
                bytes.remaining()
            )));
        }

        Ok(Manifest {
            format_id,
            capability,
            entries,
            container_meta,
        })
    }
}

fn decode_error(cause: anyhow::Error) -> VaultError {
    VaultError::TaskExecutionFailed {
        retryable: false,
        cause: cause.context("malformed manifest"),
    }
}

const fn entry_type_byte(ty: EntryType) -> u8 {
    match ty {
        EntryType::File => 0,
        EntryType::Directory => 1,
        EntryType::Symlink => 2,
    }
}

fn entry_type_from_byte(byte: u8) -> Result<EntryType> {
    match byte {
        0 => Ok(EntryType::File),
        1 => Ok(EntryType::Directory),
        2 => Ok(EntryType::Symlink),
        b => Err(decode_error(anyhow!("unrecognized entry type byte: {}", b))),
    }
}

fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

fn take_varint(bytes: &mut &[u8]) -> Result<u64> {
    let mut value = 0u64;
    for shift in (0..64).step_by(7) {
        let byte = take_u8(bytes)?;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(decode_error(anyhow!("varint is too long")))
}

fn take_u8(bytes: &mut &[u8]) -> Result<u8> {
    if bytes.remaining() < 1 {
        return Err(decode_error(anyhow!("unexpected end of manifest")));
    }
    Ok(bytes.get_u8())
}

fn take_u16(bytes: &mut &[u8]) -> Result<u16> {
    if bytes.remaining() < 2 {
        return Err(decode_error(anyhow!("unexpected end of manifest")));
    }
    Ok(bytes.get_u16())
}

fn take_u64(bytes: &mut &[u8]) -> Result<u64> {
    if bytes.remaining() < 8 {
        return Err(decode_error(anyhow!("unexpected end of manifest")));
    }
    Ok(bytes.get_u64())
}

fn take_i64(bytes: &mut &[u8]) -> Result<i64> {
    if bytes.remaining() < 8 {
        return Err(decode_error(anyhow!("unexpected end of manifest")));
    }
    Ok(bytes.get_i64())
}

fn take_slice(bytes: &mut &[u8], out: &mut [u8]) -> Result<()> {
    if bytes.remaining() < out.len() {
        return Err(decode_error(anyhow!("unexpected end of manifest")));
    }
    bytes.copy_to_slice(out);
    Ok(())
}

fn take_bytes(bytes: &mut &[u8]) -> Result<Vec<u8>> {
    let len = take_varint(bytes)?;
    if len > MAX_DECLARED_LEN || bytes.remaining() < len as usize {
        return Err(decode_error(anyhow!("declared length out of range")));
    }
    let mut out = vec![0u8; len as usize];
    bytes.copy_to_slice(&mut out);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example_manifest() -> Manifest {
        Manifest {
            format_id: 2,
            capability: Capability::Reconstructable,
            entries: vec![
                ManifestEntry {
                    path: "a.txt".into(),
                    entry_type: EntryType::File,
                    is_container: false,
                    child_hash: ContentHash::of_bytes(b"A"),
                    child_leaf_size: 1,
                    mtime_millis: Some(1_600_000_000_000),
                    metadata: vec![1, 2, 3],
                },
                ManifestEntry {
                    path: "sub/".into(),
                    entry_type: EntryType::Directory,
                    is_container: false,
                    child_hash: ContentHash::of_bytes(b""),
                    child_leaf_size: 0,
                    mtime_millis: None,
                    metadata: Vec::new(),
                },
                ManifestEntry {
                    path: "sub/inner.zip".into(),
                    entry_type: EntryType::File,
                    is_container: true,
                    child_hash: ContentHash::of_bytes(b"inner"),
                    child_leaf_size: 123,
                    mtime_millis: None,
                    metadata: Vec::new(),
                },
            ],
            container_meta: b"trailer state".to_vec(),
        }
    }

    #[test]
    fn round_trip() {
        let manifest = example_manifest();
        let encoded = manifest.encode();
        let decoded = Manifest::decode(&encoded).expect("failed to decode");
        assert_eq!(decoded, manifest);
    }

    #[test]
    fn encoding_is_deterministic() {
        let manifest = example_manifest();
        assert_eq!(manifest.encode(), manifest.encode());
    }

    #[test]
    fn rejects_wrong_version() {
        let mut encoded = example_manifest().encode();
        encoded[0] = 0xff;
        assert!(Manifest::decode(&encoded).is_err());
    }

    #[test]
    fn rejects_truncation_and_trailing_garbage() {
        let encoded = example_manifest().encode();
        assert!(Manifest::decode(&encoded[..encoded.len() - 1]).is_err());

        let mut padded = encoded.clone();
        padded.push(0xaa);
        assert!(Manifest::decode(&padded).is_err());
    }

    #[test]
    fn missing_container_meta_section_reads_as_empty() {
        let mut manifest = example_manifest();
        manifest.container_meta.clear();
        let mut encoded = manifest.encode();
        // Strip the zero-length trailer varint entirely; older encoders
        // omitted the section.
        encoded.pop();
        let decoded = Manifest::decode(&encoded).unwrap();
        assert_eq!(decoded, manifest);
    }

    #[test]
    fn entry_child_ref_follows_container_flag() {
        let manifest = example_manifest();
        assert!(!manifest.entries[0].child_ref().is_container());
        assert!(manifest.entries[2].child_ref().is_container());
    }
}
