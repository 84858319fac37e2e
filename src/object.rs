//! Core identity types for vault objects.

pub use self::buffer::{BinaryData, Buffer, Contents, DEFAULT_SPILL_THRESHOLD};
pub use self::id::{ContentHash, HashWriter, Hasher};

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

mod buffer;
mod id;

const LEAF_KIND_NAME: &str = "leaf";
const CONTAINER_KIND_NAME: &str = "container";

/// Distinguishes the two objects that may exist for a single `(hash, size)`.
///
/// A `Leaf` holds the original bytes themselves; a `Container` holds the
/// manifest describing how those bytes decompose into children. Both can
/// coexist for the same hash and size.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
pub enum BlobKind {
    /// The stored bytes are the content itself.
    Leaf,
    /// The stored bytes are a manifest of the content's decomposition.
    Container,
}

impl BlobKind {
    /// Enumerates all variants of `BlobKind`.
    pub fn iter() -> impl Iterator<Item = Self> {
        use std::iter::once;
        once(BlobKind::Leaf).chain(once(BlobKind::Container))
    }

    /// Returns the string representation of the `BlobKind`.
    ///
    /// This is used as the final segment of object-storage keys.
    pub const fn as_str(self) -> &'static str {
        match self {
            BlobKind::Leaf => LEAF_KIND_NAME,
            BlobKind::Container => CONTAINER_KIND_NAME,
        }
    }
}

impl FromStr for BlobKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            LEAF_KIND_NAME => Ok(BlobKind::Leaf),
            CONTAINER_KIND_NAME => Ok(BlobKind::Container),
            other => Err(anyhow!("unrecognized blob kind: {}", other)),
        }
    }
}

/// Global, tenant-agnostic identity of a stored byte sequence.
///
/// `leaf_size` is always the size of the *original* bytes, even for the
/// container variant, so the leaf and the manifest describing it share an
/// identity prefix and differ only in `kind`.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
pub struct BlobRef {
    /// Content hash of the original bytes.
    pub hash: ContentHash,
    /// Size of the original bytes, in bytes.
    pub leaf_size: u64,
    /// Which of the two objects this ref names.
    pub kind: BlobKind,
}

impl BlobRef {
    /// Creates a reference to the leaf object for the given content.
    pub const fn leaf(hash: ContentHash, leaf_size: u64) -> Self {
        BlobRef {
            hash,
            leaf_size,
            kind: BlobKind::Leaf,
        }
    }

    /// Creates a reference to the container manifest for the given content.
    pub const fn container(hash: ContentHash, leaf_size: u64) -> Self {
        BlobRef {
            hash,
            leaf_size,
            kind: BlobKind::Container,
        }
    }

    /// Returns `true` if this ref names a container manifest.
    #[inline]
    pub fn is_container(&self) -> bool {
        self.kind == BlobKind::Container
    }

    /// Returns the ref naming the sibling object of the other kind.
    pub fn counterpart(&self) -> Self {
        let kind = match self.kind {
            BlobKind::Leaf => BlobKind::Container,
            BlobKind::Container => BlobKind::Leaf,
        };
        BlobRef { kind, ..*self }
    }
}

impl Display for BlobRef {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}/{}/{}", self.hash, self.leaf_size, self.kind.as_str())
    }
}

/// The type of a single entry inside a container.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    File,
    Directory,
    Symlink,
}

impl EntryType {
    /// Returns the string representation stored in the index.
    pub const fn as_str(self) -> &'static str {
        match self {
            EntryType::File => "file",
            EntryType::Directory => "directory",
            EntryType::Symlink => "symlink",
        }
    }
}

impl FromStr for EntryType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(EntryType::File),
            "directory" => Ok(EntryType::Directory),
            "symlink" => Ok(EntryType::Symlink),
            other => Err(anyhow!("unrecognized entry type: {}", other)),
        }
    }
}

/// Key under which a tenant's objects are grouped in object storage.
///
/// The tenant's global UUID when one is assigned, else its integer row id
/// rendered as text.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
pub struct TenantKey(smol_str::SmolStr);

impl TenantKey {
    /// Builds the key for a tenant row.
    pub fn new(id: i64, uuid: Option<uuid::Uuid>) -> Self {
        match uuid {
            Some(uuid) => TenantKey(smol_str::SmolStr::new(uuid.to_string())),
            None => TenantKey(smol_str::SmolStr::new(id.to_string())),
        }
    }

    /// Returns the key as a path-safe string.
    #[inline]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for TenantKey {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TenantKey {
    fn from(s: &str) -> Self {
        TenantKey(smol_str::SmolStr::new(s))
    }
}
