//! Format detection and container decomposition.

pub use self::gzip::GzipFormat;
pub use self::opaque::OpaqueFormat;
pub use self::tarball::TarFormat;
pub use self::zipfile::ZipFormat;

use std::convert::TryFrom;
use std::io::Write;
use std::sync::Arc;

use anyhow::anyhow;
use serde_json::{Map, Value};

use crate::error::{Result, VaultError};
use crate::manifest::{Manifest, ManifestEntry};
use crate::object::{BinaryData, Buffer, EntryType};

mod gzip;
mod opaque;
mod tarball;
mod zipfile;

#[cfg(test)]
pub(crate) use self::zipfile::tests::build_stored_zip;

/// What the ingest pipeline may do with content of a given format.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Capability {
    /// No decomposition; the bytes are stored as-is.
    Leaf,
    /// Decomposition is lossless: only the manifest is stored, and the
    /// original bytes are reproduced from it on demand.
    Reconstructable,
    /// Decomposition is informational: the original bytes are kept as a leaf
    /// and a manifest is stored alongside as a bonus.
    Stored,
}

impl Capability {
    /// Returns the tier byte recorded in manifests.
    pub const fn as_u8(self) -> u8 {
        match self {
            Capability::Leaf => 0,
            Capability::Reconstructable => 1,
            Capability::Stored => 2,
        }
    }
}

impl TryFrom<u8> for Capability {
    type Error = anyhow::Error;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0 => Ok(Capability::Leaf),
            1 => Ok(Capability::Reconstructable),
            2 => Ok(Capability::Stored),
            b => Err(anyhow!("unrecognized capability tier byte: {}", b)),
        }
    }
}

/// Rules for matching content to a format.
///
/// A candidate matches if its magic bytes appear at `magic_offset` (the
/// header must be long enough), or if its MIME type or file extension
/// matches. MIME patterns may use a `*` subtype wildcard, and `*/*` matches
/// anything including content with no known MIME type at all.
#[derive(Clone, Debug)]
pub struct DetectionCriteria {
    pub mime_patterns: &'static [&'static str],
    pub extensions: &'static [&'static str],
    pub magic: &'static [u8],
    pub magic_offset: usize,
    pub priority: u8,
}

impl DetectionCriteria {
    /// Returns `true` if any rule matches the candidate.
    pub fn matches(&self, mime: Option<&str>, filename: &str, header: &[u8]) -> bool {
        if !self.magic.is_empty() {
            let end = self.magic_offset + self.magic.len();
            if header.len() >= end && &header[self.magic_offset..end] == self.magic {
                return true;
            }
        }

        for pattern in self.mime_patterns {
            if mime_matches(pattern, mime) {
                return true;
            }
        }

        let lowered = filename.to_ascii_lowercase();
        self.extensions
            .iter()
            .any(|ext| lowered.ends_with(&format!(".{}", ext)))
    }
}

fn mime_matches(pattern: &str, mime: Option<&str>) -> bool {
    if pattern == "*/*" {
        return true;
    }
    let mime = match mime {
        Some(mime) => mime,
        None => return false,
    };
    match pattern.strip_suffix("/*") {
        Some(prefix) => mime
            .split('/')
            .next()
            .map(|ty| ty == prefix)
            .unwrap_or(false),
        None => pattern == mime,
    }
}

/// A single child extracted from a container, in extraction order.
#[derive(Debug)]
pub struct ContainerChild {
    /// Path of the child inside the container.
    pub path: String,
    /// What kind of entry this is.
    pub entry_type: EntryType,
    /// The child's bytes. Directories carry an empty buffer; symlinks carry
    /// their target path as bytes so every entry has addressable content.
    pub data: Buffer,
    /// Modification time recorded by the container, in milliseconds.
    pub mtime_millis: Option<i64>,
    /// Format-owned reconstruction state for this entry.
    pub metadata: Vec<u8>,
}

/// The result of decomposing one container.
#[derive(Debug)]
pub struct Extraction {
    /// Capability proven for this particular archive.
    pub capability: Capability,
    /// Children in the order the format yielded them.
    pub children: Vec<ContainerChild>,
    /// Format-owned reconstruction state for the container as a whole.
    pub container_meta: Vec<u8>,
}

impl Extraction {
    /// An extraction describing plain leaf content.
    pub fn leaf() -> Self {
        Extraction {
            capability: Capability::Leaf,
            children: Vec::new(),
            container_meta: Vec::new(),
        }
    }
}

/// A child handed back to a format during reconstruction.
pub struct RestoredChild {
    /// The manifest entry this child satisfies.
    pub entry: ManifestEntry,
    /// The child's bytes, leaf or recursively reconstructed.
    pub data: Box<dyn BinaryData>,
}

/// A registered file format.
///
/// Formats are stateless: every operation receives the content it should
/// inspect. Leaf-only formats get working defaults for the container
/// operations.
pub trait Format: Send + Sync {
    /// Short name recorded on blob-ref rows for content of this format.
    fn name(&self) -> &'static str;

    /// Stable identifier recorded in manifests (`container_format_id`).
    fn id(&self) -> u16;

    /// How candidates are matched to this format.
    fn criteria(&self) -> &DetectionCriteria;

    /// Returns `true` if this format can decompose content into children.
    fn is_container(&self) -> bool {
        false
    }

    /// Returns `true` if stored bytes of this format benefit from transport
    /// compression.
    fn is_compressible(&self) -> bool {
        true
    }

    /// Decomposes the content into ordered children.
    ///
    /// The returned capability reflects what was proven for *these* bytes;
    /// formats downgrade to [`Capability::Stored`] when they cannot
    /// guarantee byte-exact reconstruction.
    fn extract_children(&self, data: &mut dyn BinaryData) -> Result<Extraction> {
        let _ = data;
        Ok(Extraction::leaf())
    }

    /// Extracts descriptive metadata for the index.
    fn extract_metadata(
        &self,
        data: &mut dyn BinaryData,
        filename: &str,
    ) -> Result<Map<String, Value>> {
        let _ = (data, filename);
        Ok(Map::new())
    }

    /// Extracts plain text for search enrichment, if the format carries any.
    fn extract_text(&self, data: &mut dyn BinaryData) -> Result<Option<String>> {
        let _ = data;
        Ok(None)
    }

    /// Writes bytes identical to the original container, given the same
    /// children in the same order.
    ///
    /// Returns `Err` if this format is not a container or the children do
    /// not satisfy the manifest.
    fn reconstruct(
        &self,
        manifest: &Manifest,
        children: Vec<RestoredChild>,
        sink: &mut dyn Write,
    ) -> Result<()> {
        let _ = (manifest, children, sink);
        Err(VaultError::TaskExecutionFailed {
            retryable: false,
            cause: anyhow!("format {} does not support reconstruction", self.name()),
        })
    }
}

impl std::fmt::Debug for dyn Format + '_ {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Format").field("name", &self.name()).finish()
    }
}

/// The set of formats known to a vault, scanned in registration order.
///
/// The registry is a process-scoped service built once during wiring and
/// shared by reference; there is no global state.
#[derive(Clone)]
pub struct FormatRegistry {
    formats: Vec<Arc<dyn Format>>,
}

impl FormatRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        FormatRegistry {
            formats: Vec::new(),
        }
    }

    /// Creates a registry with every built-in format registered.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(TarFormat));
        registry.register(Arc::new(ZipFormat));
        registry.register(Arc::new(GzipFormat));
        registry.register(Arc::new(OpaqueFormat));
        registry
    }

    /// Adds a format to the registry.
    pub fn register(&mut self, format: Arc<dyn Format>) {
        self.formats.push(format);
    }

    /// Picks the highest-priority format matching the candidate.
    ///
    /// Ties on priority resolve to the earliest registration; callers must
    /// not rely on any particular tie-break. Returns `Err` only when the
    /// registry was built without a catch-all format.
    pub fn detect(
        &self,
        mime: Option<&str>,
        filename: &str,
        header: &[u8],
    ) -> Result<Arc<dyn Format>> {
        self.formats
            .iter()
            .filter(|f| f.criteria().matches(mime, filename, header))
            .max_by(|a, b| {
                a.criteria()
                    .priority
                    .cmp(&b.criteria().priority)
                    // `max_by` keeps the later element on ties; prefer the
                    // earlier registration instead.
                    .then(std::cmp::Ordering::Greater)
            })
            .cloned()
            .ok_or_else(|| VaultError::UnknownFormat {
                filename: filename.to_owned(),
            })
    }

    /// Looks up a format by its manifest identifier.
    pub fn by_id(&self, id: u16) -> Option<Arc<dyn Format>> {
        self.formats.iter().find(|f| f.id() == id).cloned()
    }

    /// Guesses a MIME type from leading magic bytes.
    pub fn sniff_mime(header: &[u8]) -> Option<&'static str> {
        infer::get(header).map(|kind| kind.mime_type())
    }
}

impl Default for FormatRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_requires_sufficient_header() {
        let criteria = DetectionCriteria {
            mime_patterns: &[],
            extensions: &[],
            magic: b"ustar",
            magic_offset: 257,
            priority: 50,
        };
        let mut header = vec![0u8; 262];
        header[257..262].copy_from_slice(b"ustar");
        assert!(criteria.matches(None, "x", &header));
        assert!(!criteria.matches(None, "x", &header[..200]));
    }

    #[test]
    fn mime_wildcards() {
        assert!(mime_matches("text/*", Some("text/plain")));
        assert!(!mime_matches("text/*", Some("application/zip")));
        assert!(mime_matches("*/*", None));
        assert!(mime_matches("application/zip", Some("application/zip")));
        assert!(!mime_matches("text/plain", None));
    }

    #[test]
    fn extension_matching_is_case_insensitive() {
        let criteria = DetectionCriteria {
            mime_patterns: &[],
            extensions: &["tar"],
            magic: &[],
            magic_offset: 0,
            priority: 10,
        };
        assert!(criteria.matches(None, "BACKUP.TAR", &[]));
        assert!(!criteria.matches(None, "backup.tar.gz", &[]));
    }

    #[test]
    fn detection_prefers_higher_priority() {
        let registry = FormatRegistry::builtin();
        let format = registry
            .detect(Some("application/zip"), "a.zip", b"PK\x03\x04")
            .unwrap();
        assert_eq!(format.name(), "zip");

        let fallback = registry.detect(None, "unknown.bin", &[0u8; 8]).unwrap();
        assert_eq!(fallback.name(), "opaque");
    }

    #[test]
    fn empty_registry_reports_unknown_format() {
        let registry = FormatRegistry::new();
        let err = registry.detect(None, "x", &[]).unwrap_err();
        assert!(matches!(err, VaultError::UnknownFormat { .. }));
    }
}
