//! Content hash and associated helper types.

use std::cmp::Ordering;
use std::fmt::{self, Debug, Display, Formatter};
use std::io::Write;
use std::str::FromStr;

use anyhow::Context;
use serde::{de::Deserializer, ser::Serializer, Deserialize, Serialize};

/// A unique cryptographic hash identifying a stored byte sequence.
///
/// Digests are the first 16 bytes of the BLAKE3 extended output (BLAKE3-128).
/// Equality and ordering are byte-wise.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct ContentHash([u8; Self::LENGTH]);

impl ContentHash {
    /// The digest length, in bytes.
    pub const LENGTH: usize = 16;

    /// The length of the lowercase hex representation, in characters.
    pub const STR_LENGTH: usize = Self::LENGTH * 2;

    /// Computes the hash of the given byte slice.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(bytes);
        hasher.finish()
    }

    /// Constructs a `ContentHash` directly from a raw digest.
    #[inline]
    pub const fn from_bytes(bytes: [u8; Self::LENGTH]) -> Self {
        ContentHash(bytes)
    }

    /// Returns the raw digest bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; Self::LENGTH] {
        &self.0
    }

    /// Returns the lowercase hex representation of the digest.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Debug for ContentHash {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}({})", stringify!(ContentHash), self.to_hex())
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut buf = [0u8; Self::LENGTH];
        hex::decode_to_slice(s, &mut buf).context("string is not a valid content hash")?;
        Ok(ContentHash(buf))
    }
}

impl PartialOrd for ContentHash {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ContentHash {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: [u8; Self::LENGTH] = hex::serde::deserialize(deserializer)?;
        Ok(ContentHash(bytes))
    }
}

impl Serialize for ContentHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_hex().serialize(serializer)
    }
}

/// An incremental hasher that computes content hashes.
#[derive(Clone, Debug, Default)]
pub struct Hasher(blake3::Hasher);

impl Hasher {
    /// Constructs a new `Hasher` with an empty state.
    pub fn new() -> Self {
        Hasher(blake3::Hasher::new())
    }

    /// Adds input bytes to the hash state. You can call this any number of times.
    ///
    /// For best throughput, feed buffers of at least 8 KiB at a time.
    pub fn update(&mut self, bytes: &[u8]) -> &mut Self {
        self.0.update(bytes);
        self
    }

    /// Finalizes the hash state and returns the computed `ContentHash`.
    ///
    /// The state is not consumed; further `update()` calls continue from it.
    pub fn finish(&self) -> ContentHash {
        let mut digest = [0u8; ContentHash::LENGTH];
        self.0.finalize_xof().fill(&mut digest);
        ContentHash(digest)
    }
}

/// Wraps an I/O writer and hashes everything written through it.
///
/// While writing, it is recommended to pass buffers of at least 8 KiB in size
/// for best performance.
#[derive(Debug)]
pub struct HashWriter<W> {
    inner: W,
    hasher: Hasher,
}

impl<W: Write> HashWriter<W> {
    /// Creates a new `HashWriter<W>` wrapping the given writer.
    pub fn new(inner: W) -> Self {
        HashWriter {
            inner,
            hasher: Hasher::new(),
        }
    }

    /// Finalizes the hash state and returns the computed `ContentHash`.
    pub fn content_hash(&self) -> ContentHash {
        self.hasher.finish()
    }

    /// Unwraps this `HashWriter<W>`, returning the underlying writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for HashWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let len = self.inner.write(buf)?;
        self.hasher.update(&buf[0..len]);
        Ok(len)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
