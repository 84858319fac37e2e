//! TAR container format.
//!
//! Extraction walks the archive with the `tar` crate while tracking raw
//! record positions. An archive proves tier-1 (losslessly reconstructable)
//! only when every record is a plain contiguous ustar header of a supported
//! entry type and the trailer is all zeros; each entry then carries its raw
//! 512-byte header so reconstruction is a straight re-emission. Anything
//! fancier (pax extensions, GNU long names, sparse files) downgrades the
//! archive to tier-2: the original bytes stay stored as a leaf and the
//! manifest is informational.

use std::io::{Read, Seek, SeekFrom, Write};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Capability, ContainerChild, DetectionCriteria, Extraction, Format, RestoredChild};
use crate::error::{Result, VaultError};
use crate::manifest::Manifest;
use crate::object::{BinaryData, Buffer, EntryType};
use crate::util;

const BLOCK: u64 = 512;

/// Per-entry reconstruction state: the raw ustar header record.
#[derive(Debug, Deserialize, Serialize)]
struct TarEntryMeta {
    #[serde(with = "hex::serde")]
    raw_header: Vec<u8>,
}

/// Container-level reconstruction state.
#[derive(Debug, Default, Deserialize, Serialize)]
struct TarContainerMeta {
    /// Number of zero bytes following the last entry record.
    trailer_len: u64,
}

/// The TAR archive format.
pub struct TarFormat;

static CRITERIA: DetectionCriteria = DetectionCriteria {
    mime_patterns: &["application/x-tar"],
    extensions: &["tar"],
    magic: b"ustar",
    magic_offset: 257,
    priority: 60,
};

impl Format for TarFormat {
    fn name(&self) -> &'static str {
        "tar"
    }

    fn id(&self) -> u16 {
        1
    }

    fn criteria(&self) -> &DetectionCriteria {
        &CRITERIA
    }

    fn is_container(&self) -> bool {
        true
    }

    fn extract_children(&self, data: &mut dyn BinaryData) -> Result<Extraction> {
        let total_size = data.size();
        data.seek(SeekFrom::Start(0))?;

        let mut capability = Capability::Reconstructable;
        let mut children = Vec::new();
        let mut expected_pos = 0u64;
        let mut data_end = 0u64;

        {
            let mut archive = tar::Archive::new(&mut *data);
            for entry in archive.entries()? {
                let mut entry = entry?;

                // Extension records (pax, long names) sit between the
                // previous record and this header; their presence shows up
                // as a position gap.
                if entry.raw_header_position() != expected_pos {
                    capability = Capability::Stored;
                }

                let raw_header = entry.header().as_bytes().to_vec();
                let size = entry.size();
                let path = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
                let mtime_millis = entry
                    .header()
                    .mtime()
                    .ok()
                    .and_then(|secs| i64::try_from(secs).ok())
                    .map(|secs| secs * 1000);

                let padded = (size + BLOCK - 1) / BLOCK * BLOCK;
                data_end = entry.raw_file_position() + padded;
                expected_pos = data_end;

                let (entry_type, buffer) = match entry.header().entry_type() {
                    tar::EntryType::Regular | tar::EntryType::Continuous => {
                        let mut buffer = Buffer::new();
                        util::copy_wide(&mut entry, &mut buffer)?;
                        (EntryType::File, buffer)
                    }
                    tar::EntryType::Directory => (EntryType::Directory, Buffer::new()),
                    tar::EntryType::Symlink => {
                        let target = entry
                            .link_name_bytes()
                            .map(|bytes| bytes.into_owned())
                            .unwrap_or_default();
                        (EntryType::Symlink, Buffer::from_bytes(target))
                    }
                    // Hard links, sparse files, and friends cannot be
                    // expressed as entries; keep the original as a leaf.
                    _ => {
                        capability = Capability::Stored;
                        continue;
                    }
                };

                let metadata = serde_json::to_vec(&TarEntryMeta { raw_header })
                    .expect("tar entry metadata serializes");

                children.push(ContainerChild {
                    path,
                    entry_type,
                    data: buffer,
                    mtime_millis,
                    metadata,
                });
            }
        }

        let trailer_len = total_size.saturating_sub(data_end);
        if capability == Capability::Reconstructable && !trailer_is_zeros(data, data_end)? {
            capability = Capability::Stored;
        }

        let container_meta = serde_json::to_vec(&TarContainerMeta { trailer_len })
            .expect("tar container metadata serializes");

        Ok(Extraction {
            capability,
            children,
            container_meta,
        })
    }

    fn extract_metadata(
        &self,
        data: &mut dyn BinaryData,
        _filename: &str,
    ) -> Result<Map<String, Value>> {
        let mut map = Map::new();
        map.insert("size".into(), Value::from(data.size()));
        map.insert("mime_type".into(), Value::from("application/x-tar"));
        Ok(map)
    }

    fn reconstruct(
        &self,
        manifest: &Manifest,
        children: Vec<RestoredChild>,
        sink: &mut dyn Write,
    ) -> Result<()> {
        let container_meta: TarContainerMeta = if manifest.container_meta.is_empty() {
            TarContainerMeta::default()
        } else {
            serde_json::from_slice(&manifest.container_meta)
                .map_err(|e| reconstruct_error(anyhow!("bad tar container metadata: {}", e)))?
        };

        for mut child in children {
            let meta: TarEntryMeta = serde_json::from_slice(&child.entry.metadata)
                .map_err(|e| reconstruct_error(anyhow!("bad tar entry metadata: {}", e)))?;
            if meta.raw_header.len() != BLOCK as usize {
                return Err(reconstruct_error(anyhow!(
                    "tar entry header must be {} bytes, got {}",
                    BLOCK,
                    meta.raw_header.len()
                )));
            }

            sink.write_all(&meta.raw_header)?;

            if child.entry.entry_type == EntryType::File {
                child.data.seek(SeekFrom::Start(0))?;
                let copied = child.data.copy_to(sink)?;
                let padding = (BLOCK - copied % BLOCK) % BLOCK;
                sink.write_all(&vec![0u8; padding as usize])?;
            }
        }

        sink.write_all(&vec![0u8; container_meta.trailer_len as usize])?;
        Ok(())
    }
}

fn trailer_is_zeros(data: &mut dyn BinaryData, from: u64) -> Result<bool> {
    data.seek(SeekFrom::Start(from))?;
    let mut buf = [0u8; 4096];
    loop {
        match data.read(&mut buf) {
            Ok(0) => return Ok(true),
            Ok(n) => {
                if buf[..n].iter().any(|&b| b != 0) {
                    return Ok(false);
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

fn reconstruct_error(cause: anyhow::Error) -> VaultError {
    VaultError::TaskExecutionFailed {
        retryable: false,
        cause: cause.context("tar reconstruction failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestEntry;
    use crate::object::ContentHash;

    fn build_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, content) in entries {
            let mut header = tar::Header::new_ustar();
            header.set_path(*path).unwrap();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(1_600_000_000);
            header.set_cksum();
            builder.append(&header, *content).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn canonical_archive_is_reconstructable() {
        let bytes = build_tar(&[("a.txt", b"A"), ("b.txt", b"BB")]);
        let mut data = Buffer::from_bytes(bytes);
        let extraction = TarFormat.extract_children(&mut data).unwrap();

        assert_eq!(extraction.capability, Capability::Reconstructable);
        assert_eq!(extraction.children.len(), 2);
        assert_eq!(extraction.children[0].path, "a.txt");
        assert_eq!(
            extraction.children[0].mtime_millis,
            Some(1_600_000_000_000)
        );
    }

    #[test]
    fn round_trip_is_byte_exact() {
        let original = build_tar(&[("a.txt", b"alpha"), ("dir/b.txt", b"beta bytes")]);
        let mut data = Buffer::from_bytes(original.clone());
        let extraction = TarFormat.extract_children(&mut data).unwrap();
        assert_eq!(extraction.capability, Capability::Reconstructable);

        let manifest = Manifest {
            format_id: TarFormat.id(),
            capability: extraction.capability,
            entries: extraction
                .children
                .iter()
                .map(|child| ManifestEntry {
                    path: child.path.clone(),
                    entry_type: child.entry_type,
                    is_container: false,
                    child_hash: ContentHash::of_bytes(b"unused here"),
                    child_leaf_size: child.data.size(),
                    mtime_millis: child.mtime_millis,
                    metadata: child.metadata.clone(),
                })
                .collect(),
            container_meta: extraction.container_meta.clone(),
        };

        let children = extraction
            .children
            .into_iter()
            .zip(manifest.entries.iter())
            .map(|(child, entry)| RestoredChild {
                entry: entry.clone(),
                data: Box::new(child.data) as Box<dyn BinaryData>,
            })
            .collect();

        let mut sink = Vec::new();
        TarFormat
            .reconstruct(&manifest, children, &mut sink)
            .unwrap();
        assert_eq!(sink, original);
    }

    #[test]
    fn long_path_downgrades_to_stored() {
        // Paths beyond the 100-byte ustar field force a GNU long-name
        // record, which shows up as a position gap.
        let long_path = format!("{}/file.txt", "d".repeat(120));
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(4);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, &long_path, &b"data"[..])
            .unwrap();
        let bytes = builder.into_inner().unwrap();

        let mut data = Buffer::from_bytes(bytes);
        let extraction = TarFormat.extract_children(&mut data).unwrap();
        assert_eq!(extraction.capability, Capability::Stored);
        assert_eq!(extraction.children.len(), 1);
        assert_eq!(extraction.children[0].path, long_path);
    }
}
