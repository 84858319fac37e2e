//! Catch-all leaf format for content nothing else claims.

use serde_json::{Map, Value};

use super::{DetectionCriteria, Format};
use crate::error::Result;
use crate::object::BinaryData;

/// Largest prefix considered for text extraction, in bytes.
const TEXT_EXTRACT_LIMIT: usize = 64 * 1024;

/// The fallback format: everything matches it at the lowest priority.
///
/// Content handled here is stored as an opaque leaf. A magic-byte sniff
/// provides a best-effort MIME type, and content that looks like text gets a
/// plain-text extraction for search enrichment.
pub struct OpaqueFormat;

static CRITERIA: DetectionCriteria = DetectionCriteria {
    mime_patterns: &["*/*"],
    extensions: &[],
    magic: &[],
    magic_offset: 0,
    priority: 0,
};

impl Format for OpaqueFormat {
    fn name(&self) -> &'static str {
        "opaque"
    }

    fn id(&self) -> u16 {
        0
    }

    fn criteria(&self) -> &DetectionCriteria {
        &CRITERIA
    }

    fn extract_metadata(
        &self,
        data: &mut dyn BinaryData,
        filename: &str,
    ) -> Result<Map<String, Value>> {
        let header = data.read_header(8192)?;
        let mut map = Map::new();
        map.insert("size".into(), Value::from(data.size()));
        map.insert("filename".into(), Value::from(filename));
        if let Some(kind) = infer::get(&header) {
            map.insert("mime_type".into(), Value::from(kind.mime_type()));
            map.insert("extension".into(), Value::from(kind.extension()));
        }
        Ok(map)
    }

    fn extract_text(&self, data: &mut dyn BinaryData) -> Result<Option<String>> {
        let header = data.read_header(TEXT_EXTRACT_LIMIT)?;
        if header.is_empty() || header.contains(&0) {
            return Ok(None);
        }
        match std::str::from_utf8(&header) {
            Ok(text) => Ok(Some(text.to_owned())),
            // A multi-byte sequence may be cut at the extraction limit.
            Err(e) if header.len() == TEXT_EXTRACT_LIMIT && e.valid_up_to() > 0 => {
                let valid = std::str::from_utf8(&header[..e.valid_up_to()]).unwrap();
                Ok(Some(valid.to_owned()))
            }
            Err(_) => Ok(None),
        }
    }
}
