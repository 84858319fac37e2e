//! GZIP container format.
//!
//! A gzip stream decomposes into exactly one child: the decompressed bytes.
//! Recompression is not guaranteed to reproduce the original byte-for-byte
//! (it depends on the encoder and level), so gzip is always tier-2: the
//! original stays stored as a leaf and the manifest exists for dedup and
//! search of the inner content.

use std::io::{Read, SeekFrom};
use std::io::Seek;

use serde_json::{Map, Value};

use super::{Capability, ContainerChild, DetectionCriteria, Extraction, Format};
use crate::error::Result;
use crate::object::{BinaryData, Buffer, EntryType};
use crate::util;

/// The GZIP compressed stream format.
pub struct GzipFormat;

static CRITERIA: DetectionCriteria = DetectionCriteria {
    mime_patterns: &["application/gzip", "application/x-gzip"],
    extensions: &["gz", "tgz"],
    magic: &[0x1f, 0x8b],
    magic_offset: 0,
    priority: 55,
};

impl Format for GzipFormat {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn id(&self) -> u16 {
        3
    }

    fn criteria(&self) -> &DetectionCriteria {
        &CRITERIA
    }

    fn is_container(&self) -> bool {
        true
    }

    fn is_compressible(&self) -> bool {
        false
    }

    fn extract_children(&self, data: &mut dyn BinaryData) -> Result<Extraction> {
        data.seek(SeekFrom::Start(0))?;
        let mut decoder = flate2::read::GzDecoder::new(ReadAdapter(data));

        let mut buffer = Buffer::new();
        util::copy_wide(&mut decoder, &mut buffer)?;

        // The header is only parsed once decompression has begun.
        let path = decoder
            .header()
            .and_then(|header| header.filename())
            .map(|name| String::from_utf8_lossy(name).into_owned())
            .unwrap_or_else(|| "content".to_owned());
        let mtime_millis = decoder
            .header()
            .map(|header| header.mtime())
            .filter(|&mtime| mtime != 0)
            .map(|mtime| i64::from(mtime) * 1000);

        Ok(Extraction {
            capability: Capability::Stored,
            children: vec![ContainerChild {
                path,
                entry_type: EntryType::File,
                data: buffer,
                mtime_millis,
                metadata: Vec::new(),
            }],
            container_meta: Vec::new(),
        })
    }

    fn extract_metadata(
        &self,
        data: &mut dyn BinaryData,
        _filename: &str,
    ) -> Result<Map<String, Value>> {
        let mut map = Map::new();
        map.insert("size".into(), Value::from(data.size()));
        map.insert("mime_type".into(), Value::from("application/gzip"));
        Ok(map)
    }
}

struct ReadAdapter<'a>(&'a mut dyn BinaryData);

impl Read for ReadAdapter<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn gzip_bytes(payload: &[u8]) -> Vec<u8> {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(payload).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn decomposes_into_single_child() {
        let payload = b"the inner document";
        let mut data = Buffer::from_bytes(gzip_bytes(payload));
        let mut extraction = GzipFormat.extract_children(&mut data).unwrap();

        assert_eq!(extraction.capability, Capability::Stored);
        assert_eq!(extraction.children.len(), 1);
        let mut child = extraction.children.pop().unwrap();
        assert_eq!(child.entry_type, EntryType::File);
        assert_eq!(child.data.to_vec().unwrap(), payload);
    }

    #[test]
    fn matches_by_magic() {
        let header = [0x1f, 0x8b, 0x08, 0x00];
        assert!(GzipFormat.criteria().matches(None, "blob", &header));
    }
}
