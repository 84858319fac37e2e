//! ZIP container format.
//!
//! The scanner walks the end-of-central-directory record, the central
//! directory, and each local file header directly, because byte-exact
//! reconstruction needs the raw header records and no archive crate exposes
//! them. An archive proves tier-1 only when it is a single-disk, comment-free
//! archive of contiguous `stored` entries with no data descriptors, zip64
//! records, or encryption; each entry then carries its raw local and central
//! records and the end record is recomputed on reconstruction. Everything
//! else (most notably deflated archives) downgrades to tier-2: children are
//! still extracted for dedup and search, but the original bytes stay stored
//! as a leaf.

use std::io::{Read, Seek, SeekFrom, Write};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Capability, ContainerChild, DetectionCriteria, Extraction, Format, RestoredChild};
use crate::error::{Result, VaultError};
use crate::manifest::Manifest;
use crate::object::{BinaryData, Buffer, EntryType};
use crate::util;

const EOCD_SIG: u32 = 0x0605_4b50;
const CENTRAL_SIG: u32 = 0x0201_4b50;
const LOCAL_SIG: u32 = 0x0403_4b50;

const EOCD_LEN: usize = 22;
const CENTRAL_FIXED_LEN: usize = 46;
const LOCAL_FIXED_LEN: usize = 30;

const METHOD_STORED: u16 = 0;
const METHOD_DEFLATED: u16 = 8;

const FLAG_ENCRYPTED: u16 = 1 << 0;
const FLAG_DATA_DESCRIPTOR: u16 = 1 << 3;

/// Per-entry reconstruction state: the raw local and central records.
#[derive(Debug, Deserialize, Serialize)]
struct ZipEntryMeta {
    #[serde(with = "hex::serde")]
    local: Vec<u8>,
    #[serde(with = "hex::serde")]
    central: Vec<u8>,
    method: u16,
}

/// The ZIP archive format.
pub struct ZipFormat;

static CRITERIA: DetectionCriteria = DetectionCriteria {
    mime_patterns: &["application/zip"],
    extensions: &["zip", "jar"],
    magic: b"PK\x03\x04",
    magic_offset: 0,
    priority: 60,
};

/// One parsed central-directory record.
struct CentralRecord {
    raw: Vec<u8>,
    flags: u16,
    method: u16,
    mod_time: u16,
    mod_date: u16,
    comp_size: u64,
    uncomp_size: u64,
    external_attrs: u32,
    local_offset: u64,
    name: String,
}

impl Format for ZipFormat {
    fn name(&self) -> &'static str {
        "zip"
    }

    fn id(&self) -> u16 {
        2
    }

    fn criteria(&self) -> &DetectionCriteria {
        &CRITERIA
    }

    fn is_container(&self) -> bool {
        true
    }

    fn extract_children(&self, data: &mut dyn BinaryData) -> Result<Extraction> {
        let eocd = find_eocd(data)?;
        let mut capability = Capability::Reconstructable;

        if eocd.disk_number != 0
            || eocd.cd_disk != 0
            || eocd.disk_entries != eocd.total_entries
            || !eocd.comment.is_empty()
            || eocd.total_entries == 0xffff
            || eocd.cd_size == 0xffff_ffff
            || eocd.cd_offset == 0xffff_ffff
        {
            capability = Capability::Stored;
        }

        let records = read_central_directory(data, &eocd)?;
        let mut children = Vec::with_capacity(records.len());
        let mut expected_offset = 0u64;

        for record in &records {
            if record.local_offset != expected_offset {
                capability = Capability::Stored;
            }
            if record.flags & (FLAG_ENCRYPTED | FLAG_DATA_DESCRIPTOR) != 0 {
                capability = Capability::Stored;
            }
            if record.method != METHOD_STORED {
                capability = Capability::Stored;
            }

            let (raw_local, data_start) = read_local_record(data, record.local_offset)?;
            expected_offset = data_start + record.comp_size;

            let entry_type = classify_entry(record);
            let buffer = match entry_type {
                EntryType::Directory => Buffer::new(),
                _ => read_entry_data(data, record, data_start)?,
            };

            let metadata = serde_json::to_vec(&ZipEntryMeta {
                local: raw_local,
                central: record.raw.clone(),
                method: record.method,
            })
            .expect("zip entry metadata serializes");

            children.push(ContainerChild {
                path: record.name.clone(),
                entry_type,
                data: buffer,
                mtime_millis: dos_datetime_millis(record.mod_date, record.mod_time),
                metadata,
            });
        }

        // The central directory must immediately follow the last record, and
        // the end record must close the file, or raw re-emission would leave
        // gaps.
        if expected_offset != eocd.cd_offset
            || eocd.cd_offset + eocd.cd_size != eocd.position
            || eocd.position + (EOCD_LEN as u64 + eocd.comment.len() as u64) != data.size()
        {
            capability = Capability::Stored;
        }

        Ok(Extraction {
            capability,
            children,
            container_meta: Vec::new(),
        })
    }

    fn extract_metadata(
        &self,
        data: &mut dyn BinaryData,
        _filename: &str,
    ) -> Result<Map<String, Value>> {
        let eocd = find_eocd(data)?;
        let mut map = Map::new();
        map.insert("size".into(), Value::from(data.size()));
        map.insert("mime_type".into(), Value::from("application/zip"));
        map.insert("entry_count".into(), Value::from(eocd.total_entries));
        Ok(map)
    }

    fn reconstruct(
        &self,
        _manifest: &Manifest,
        children: Vec<RestoredChild>,
        sink: &mut dyn Write,
    ) -> Result<()> {
        let mut metas = Vec::with_capacity(children.len());
        let mut offset = 0u64;

        for mut child in children {
            let meta: ZipEntryMeta = serde_json::from_slice(&child.entry.metadata)
                .map_err(|e| reconstruct_error(anyhow!("bad zip entry metadata: {}", e)))?;
            if meta.method != METHOD_STORED {
                return Err(reconstruct_error(anyhow!(
                    "zip entry {:?} was not stored verbatim",
                    child.entry.path
                )));
            }

            sink.write_all(&meta.local)?;
            offset += meta.local.len() as u64;

            if child.entry.entry_type != EntryType::Directory {
                child.data.seek(SeekFrom::Start(0))?;
                offset += child.data.copy_to(sink)?;
            }

            metas.push(meta);
        }

        let cd_offset = offset;
        let mut cd_size = 0u64;
        for meta in &metas {
            sink.write_all(&meta.central)?;
            cd_size += meta.central.len() as u64;
        }

        // The end record is fully derivable for the archives we mark tier-1.
        let mut eocd = Vec::with_capacity(EOCD_LEN);
        eocd.extend_from_slice(&EOCD_SIG.to_le_bytes());
        eocd.extend_from_slice(&0u16.to_le_bytes());
        eocd.extend_from_slice(&0u16.to_le_bytes());
        eocd.extend_from_slice(&(metas.len() as u16).to_le_bytes());
        eocd.extend_from_slice(&(metas.len() as u16).to_le_bytes());
        eocd.extend_from_slice(&(cd_size as u32).to_le_bytes());
        eocd.extend_from_slice(&(cd_offset as u32).to_le_bytes());
        eocd.extend_from_slice(&0u16.to_le_bytes());
        sink.write_all(&eocd)?;
        Ok(())
    }
}

struct Eocd {
    /// Absolute position of the end record in the file.
    position: u64,
    disk_number: u16,
    cd_disk: u16,
    disk_entries: u16,
    total_entries: u16,
    cd_size: u64,
    cd_offset: u64,
    comment: Vec<u8>,
}

fn find_eocd(data: &mut dyn BinaryData) -> Result<Eocd> {
    let size = data.size();
    if size < EOCD_LEN as u64 {
        return Err(parse_error(anyhow!("file too short to be a zip archive")));
    }

    // The end record sits in the last 64 KiB + 22 bytes (bounded by the
    // maximum comment length).
    let tail_len = size.min(EOCD_LEN as u64 + 0xffff);
    let tail_start = size - tail_len;
    data.seek(SeekFrom::Start(tail_start))?;
    let mut tail = vec![0u8; tail_len as usize];
    data.read_exact(&mut tail)?;

    let sig = EOCD_SIG.to_le_bytes();
    let at = tail
        .windows(4)
        .rposition(|window| window == sig)
        .ok_or_else(|| parse_error(anyhow!("end of central directory not found")))?;
    let record = &tail[at..];
    if record.len() < EOCD_LEN {
        return Err(parse_error(anyhow!("truncated end of central directory")));
    }

    let comment_len = u16_at(record, 20) as usize;
    Ok(Eocd {
        position: tail_start + at as u64,
        disk_number: u16_at(record, 4),
        cd_disk: u16_at(record, 6),
        disk_entries: u16_at(record, 8),
        total_entries: u16_at(record, 10),
        cd_size: u32_at(record, 12) as u64,
        cd_offset: u32_at(record, 16) as u64,
        comment: record[EOCD_LEN..].get(..comment_len).unwrap_or(&[]).to_vec(),
    })
}

fn read_central_directory(data: &mut dyn BinaryData, eocd: &Eocd) -> Result<Vec<CentralRecord>> {
    data.seek(SeekFrom::Start(eocd.cd_offset))?;
    let mut cd = vec![0u8; eocd.cd_size as usize];
    data.read_exact(&mut cd)?;

    let mut records = Vec::with_capacity(eocd.total_entries as usize);
    let mut at = 0usize;
    for _ in 0..eocd.total_entries {
        if cd.len() < at + CENTRAL_FIXED_LEN || u32_at(&cd[at..], 0) != CENTRAL_SIG {
            return Err(parse_error(anyhow!("malformed central directory record")));
        }
        let rec = &cd[at..];
        let name_len = u16_at(rec, 28) as usize;
        let extra_len = u16_at(rec, 30) as usize;
        let comment_len = u16_at(rec, 32) as usize;
        let total = CENTRAL_FIXED_LEN + name_len + extra_len + comment_len;
        if cd.len() < at + total {
            return Err(parse_error(anyhow!("truncated central directory record")));
        }

        let name_bytes = &rec[CENTRAL_FIXED_LEN..CENTRAL_FIXED_LEN + name_len];
        records.push(CentralRecord {
            raw: rec[..total].to_vec(),
            flags: u16_at(rec, 8),
            method: u16_at(rec, 10),
            mod_time: u16_at(rec, 12),
            mod_date: u16_at(rec, 14),
            comp_size: u32_at(rec, 20) as u64,
            uncomp_size: u32_at(rec, 24) as u64,
            external_attrs: u32_at(rec, 38),
            local_offset: u32_at(rec, 42) as u64,
            name: String::from_utf8_lossy(name_bytes).into_owned(),
        });
        at += total;
    }

    Ok(records)
}

/// Reads an entry's raw local record and returns it with the absolute
/// position where the entry's payload begins.
fn read_local_record(data: &mut dyn BinaryData, offset: u64) -> Result<(Vec<u8>, u64)> {
    data.seek(SeekFrom::Start(offset))?;
    let mut fixed = [0u8; LOCAL_FIXED_LEN];
    data.read_exact(&mut fixed)?;
    if u32_at(&fixed, 0) != LOCAL_SIG {
        return Err(parse_error(anyhow!("malformed local file header")));
    }

    let name_len = u16_at(&fixed, 26) as usize;
    let extra_len = u16_at(&fixed, 28) as usize;
    let mut raw = fixed.to_vec();
    raw.resize(LOCAL_FIXED_LEN + name_len + extra_len, 0);
    data.read_exact(&mut raw[LOCAL_FIXED_LEN..])?;

    Ok((raw, offset + LOCAL_FIXED_LEN as u64 + name_len as u64 + extra_len as u64))
}

fn read_entry_data(
    data: &mut dyn BinaryData,
    record: &CentralRecord,
    data_start: u64,
) -> Result<Buffer> {
    data.seek(SeekFrom::Start(data_start))?;
    let mut buffer = Buffer::new();

    match record.method {
        METHOD_STORED => {
            let mut payload = ReadAdapter(data).take(record.comp_size);
            util::copy_wide(&mut payload, &mut buffer)?;
        }
        METHOD_DEFLATED => {
            let payload = ReadAdapter(data).take(record.comp_size);
            let mut decoder = flate2::read::DeflateDecoder::new(payload);
            util::copy_wide(&mut decoder, &mut buffer)?;
        }
        other => {
            return Err(parse_error(anyhow!(
                "unsupported zip compression method {} for {:?}",
                other,
                record.name
            )));
        }
    }

    if buffer.size() != record.uncomp_size && record.uncomp_size != 0xffff_ffff {
        return Err(parse_error(anyhow!(
            "zip entry {:?} decompressed to {} bytes, expected {}",
            record.name,
            buffer.size(),
            record.uncomp_size
        )));
    }

    Ok(buffer)
}

/// `Take`/`DeflateDecoder` want a sized `Read` value; this borrows the trait
/// object for the duration of one entry.
struct ReadAdapter<'a>(&'a mut dyn BinaryData);

impl Read for ReadAdapter<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.read(buf)
    }
}

fn classify_entry(record: &CentralRecord) -> EntryType {
    if record.name.ends_with('/') && record.uncomp_size == 0 {
        return EntryType::Directory;
    }
    let unix_mode = record.external_attrs >> 16;
    if unix_mode & 0o170_000 == 0o120_000 {
        return EntryType::Symlink;
    }
    EntryType::File
}

fn dos_datetime_millis(date: u16, time: u16) -> Option<i64> {
    let year = 1980 + ((date >> 9) & 0x7f) as i32;
    let month = ((date >> 5) & 0x0f) as u32;
    let day = (date & 0x1f) as u32;
    let hour = ((time >> 11) & 0x1f) as u32;
    let minute = ((time >> 5) & 0x3f) as u32;
    let second = ((time & 0x1f) * 2) as u32;

    let date = chrono::NaiveDate::from_ymd_opt(year, month, day)?;
    let datetime = date.and_hms_opt(hour, minute, second)?;
    Some(datetime.and_utc().timestamp_millis())
}

fn u16_at(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn u32_at(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn parse_error(cause: anyhow::Error) -> VaultError {
    VaultError::TaskExecutionFailed {
        retryable: false,
        cause: cause.context("zip parsing failed"),
    }
}

fn reconstruct_error(cause: anyhow::Error) -> VaultError {
    VaultError::TaskExecutionFailed {
        retryable: false,
        cause: cause.context("zip reconstruction failed"),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::manifest::ManifestEntry;
    use crate::object::ContentHash;

    /// Builds a canonical stored-only archive of the kind the format marks
    /// tier-1: contiguous records, no extras, no comment.
    pub(crate) fn build_stored_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut locals = Vec::new();

        for (name, content) in entries {
            let crc = crc32(content);
            let offset = out.len() as u32;
            let mut local = Vec::new();
            local.extend_from_slice(&LOCAL_SIG.to_le_bytes());
            local.extend_from_slice(&10u16.to_le_bytes()); // version needed
            local.extend_from_slice(&0u16.to_le_bytes()); // flags
            local.extend_from_slice(&METHOD_STORED.to_le_bytes());
            local.extend_from_slice(&0x6000u16.to_le_bytes()); // mod time 12:00:00
            local.extend_from_slice(&0x5021u16.to_le_bytes()); // mod date 2020-01-01
            local.extend_from_slice(&crc.to_le_bytes());
            local.extend_from_slice(&(content.len() as u32).to_le_bytes());
            local.extend_from_slice(&(content.len() as u32).to_le_bytes());
            local.extend_from_slice(&(name.len() as u16).to_le_bytes());
            local.extend_from_slice(&0u16.to_le_bytes()); // extra len
            local.extend_from_slice(name.as_bytes());
            out.extend_from_slice(&local);
            out.extend_from_slice(content);
            locals.push((*name, crc, content.len() as u32, offset));
        }

        let cd_offset = out.len() as u32;
        for (name, crc, size, offset) in &locals {
            out.extend_from_slice(&CENTRAL_SIG.to_le_bytes());
            out.extend_from_slice(&20u16.to_le_bytes()); // version made by
            out.extend_from_slice(&10u16.to_le_bytes()); // version needed
            out.extend_from_slice(&0u16.to_le_bytes()); // flags
            out.extend_from_slice(&METHOD_STORED.to_le_bytes());
            out.extend_from_slice(&0x6000u16.to_le_bytes());
            out.extend_from_slice(&0x5021u16.to_le_bytes());
            out.extend_from_slice(&crc.to_le_bytes());
            out.extend_from_slice(&size.to_le_bytes());
            out.extend_from_slice(&size.to_le_bytes());
            out.extend_from_slice(&(name.len() as u16).to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes()); // extra len
            out.extend_from_slice(&0u16.to_le_bytes()); // comment len
            out.extend_from_slice(&0u16.to_le_bytes()); // disk start
            out.extend_from_slice(&0u16.to_le_bytes()); // internal attrs
            out.extend_from_slice(&0u32.to_le_bytes()); // external attrs
            out.extend_from_slice(&offset.to_le_bytes());
            out.extend_from_slice(name.as_bytes());
        }
        let cd_size = out.len() as u32 - cd_offset;

        out.extend_from_slice(&EOCD_SIG.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&(locals.len() as u16).to_le_bytes());
        out.extend_from_slice(&(locals.len() as u16).to_le_bytes());
        out.extend_from_slice(&cd_size.to_le_bytes());
        out.extend_from_slice(&cd_offset.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out
    }

    fn crc32(bytes: &[u8]) -> u32 {
        // Tiny table-free CRC-32 (IEEE), enough for fixtures.
        let mut crc = !0u32;
        for &byte in bytes {
            crc ^= byte as u32;
            for _ in 0..8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xedb8_8320
                } else {
                    crc >> 1
                };
            }
        }
        !crc
    }

    #[test]
    fn stored_archive_is_reconstructable() {
        let bytes = build_stored_zip(&[("a.txt", b"A"), ("b.txt", b"B")]);
        let mut data = Buffer::from_bytes(bytes);
        let extraction = ZipFormat.extract_children(&mut data).unwrap();

        assert_eq!(extraction.capability, Capability::Reconstructable);
        assert_eq!(extraction.children.len(), 2);
        assert_eq!(extraction.children[0].path, "a.txt");
        assert_eq!(extraction.children[1].path, "b.txt");
        assert!(extraction.children[0].mtime_millis.is_some());
    }

    #[test]
    fn round_trip_is_byte_exact() {
        let original = build_stored_zip(&[("a.txt", b"alpha"), ("dir/b.txt", b"beta")]);
        let mut data = Buffer::from_bytes(original.clone());
        let extraction = ZipFormat.extract_children(&mut data).unwrap();
        assert_eq!(extraction.capability, Capability::Reconstructable);

        let manifest = Manifest {
            format_id: ZipFormat.id(),
            capability: extraction.capability,
            entries: extraction
                .children
                .iter()
                .map(|child| ManifestEntry {
                    path: child.path.clone(),
                    entry_type: child.entry_type,
                    is_container: false,
                    child_hash: ContentHash::of_bytes(b"unused"),
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
        ZipFormat
            .reconstruct(&manifest, children, &mut sink)
            .unwrap();
        assert_eq!(sink, original);
    }

    #[test]
    fn deflated_archive_downgrades_but_extracts() {
        let payload = b"compress me compress me compress me";
        let mut deflated = Vec::new();
        let mut encoder =
            flate2::write::DeflateEncoder::new(&mut deflated, flate2::Compression::default());
        encoder.write_all(payload).unwrap();
        encoder.finish().unwrap();

        // Splice the deflated payload into a hand-built single-entry archive.
        let mut out = Vec::new();
        let crc = crc32(payload);
        out.extend_from_slice(&LOCAL_SIG.to_le_bytes());
        out.extend_from_slice(&20u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&METHOD_DEFLATED.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&crc.to_le_bytes());
        out.extend_from_slice(&(deflated.len() as u32).to_le_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&5u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(b"c.txt");
        out.extend_from_slice(&deflated);

        let cd_offset = out.len() as u32;
        out.extend_from_slice(&CENTRAL_SIG.to_le_bytes());
        out.extend_from_slice(&20u16.to_le_bytes());
        out.extend_from_slice(&20u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&METHOD_DEFLATED.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&crc.to_le_bytes());
        out.extend_from_slice(&(deflated.len() as u32).to_le_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&5u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(b"c.txt");
        let cd_size = out.len() as u32 - cd_offset;

        out.extend_from_slice(&EOCD_SIG.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&cd_size.to_le_bytes());
        out.extend_from_slice(&cd_offset.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());

        let mut data = Buffer::from_bytes(out);
        let mut extraction = ZipFormat.extract_children(&mut data).unwrap();
        assert_eq!(extraction.capability, Capability::Stored);
        assert_eq!(extraction.children.len(), 1);
        let mut child = extraction.children.pop().unwrap();
        assert_eq!(child.data.to_vec().unwrap(), payload);
    }

    #[test]
    fn archive_comment_downgrades() {
        let mut bytes = build_stored_zip(&[("a.txt", b"A")]);
        let last = bytes.len() - 2;
        bytes[last] = 4; // comment length
        bytes.extend_from_slice(b"note");

        let mut data = Buffer::from_bytes(bytes);
        let extraction = ZipFormat.extract_children(&mut data).unwrap();
        assert_eq!(extraction.capability, Capability::Stored);
    }

    #[test]
    fn directory_entries_are_classified() {
        let bytes = build_stored_zip(&[("dir/", b""), ("dir/file", b"x")]);
        let mut data = Buffer::from_bytes(bytes);
        let extraction = ZipFormat.extract_children(&mut data).unwrap();
        assert_eq!(extraction.children[0].entry_type, EntryType::Directory);
        assert_eq!(extraction.children[1].entry_type, EntryType::File);
    }
}
