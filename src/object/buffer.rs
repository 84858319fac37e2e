//! Hybrid memory and disk backed byte sequences with incremental hashing.

use std::fmt::{self, Debug, Formatter};
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

use memmap2::Mmap;

use super::id::{ContentHash, Hasher};
use crate::util;

/// Largest prefix `read_header()` will return, in bytes.
const MAX_HEADER_LEN: usize = 64 * 1024;

/// Buffers below this size stay on the heap; larger ones spill to disk.
pub const DEFAULT_SPILL_THRESHOLD: usize = 4 * 1024 * 1024;

/// An abstract seekable byte sequence.
///
/// This is the unit of data exchanged between the ingest pipeline, format
/// handlers, and object storage. Implementations must tolerate interleaved
/// reads, seeks, and hashing.
pub trait BinaryData: Read + Seek + Send {
    /// Returns the total size of the sequence, in bytes.
    fn size(&self) -> u64;

    /// Returns the current read position.
    fn position(&mut self) -> io::Result<u64> {
        self.stream_position()
    }

    /// Computes the content hash of the entire sequence.
    ///
    /// The read position is preserved across the call.
    fn hash(&mut self) -> io::Result<ContentHash> {
        let pos = self.stream_position()?;
        self.seek(SeekFrom::Start(0))?;
        let digest = hash_stream(self)?;
        self.seek(SeekFrom::Start(pos))?;
        Ok(digest)
    }

    /// Copies the remaining bytes from the current position into `writer`.
    ///
    /// Returns the number of bytes copied.
    fn copy_to(&mut self, writer: &mut dyn Write) -> io::Result<u64> {
        let mut buf = [0u8; 65536];
        let mut total = 0;
        loop {
            match self.read(&mut buf) {
                Ok(0) => return Ok(total),
                Ok(n) => {
                    writer.write_all(&buf[..n])?;
                    total += n as u64;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Reads up to `n` bytes from the start of the sequence.
    ///
    /// `n` is clamped to 64 KiB. The read position is preserved across the
    /// call.
    fn read_header(&mut self, n: usize) -> io::Result<Vec<u8>> {
        let n = n.min(MAX_HEADER_LEN).min(self.size() as usize);
        let pos = self.stream_position()?;
        self.seek(SeekFrom::Start(0))?;
        let mut buf = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            match self.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(len) => filled += len,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        buf.truncate(filled);
        self.seek(SeekFrom::Start(pos))?;
        Ok(buf)
    }
}

impl Debug for dyn BinaryData + '_ {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("BinaryData").field("size", &self.size()).finish()
    }
}

fn hash_stream<R: Read + ?Sized>(reader: &mut R) -> io::Result<ContentHash> {
    let mut hasher = Hasher::new();
    let mut buf = [0u8; 65536];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => return Ok(hasher.finish()),
            Ok(n) => {
                hasher.update(&buf[..n]);
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

enum Storage {
    Inline(Cursor<Vec<u8>>),
    File(tempfile::NamedTempFile),
}

impl Debug for Storage {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            Storage::Inline(ref cur) => f
                .debug_struct("Inline")
                .field("len", &cur.get_ref().len())
                .field("pos", &cur.position())
                .finish(),
            Storage::File(ref file) => f.debug_tuple("File").field(file).finish(),
        }
    }
}

/// A growable buffer which spills over to a scoped temporary file once its
/// length grows beyond a set threshold.
///
/// The buffer maintains a rolling hash over the prefix written so far. As long
/// as writes append at the frontier, `hash()` is an O(1) finalization of that
/// state; an overwrite, a truncation below the frontier, or a write past it
/// invalidates the rolling state and the next `hash()` streams the whole
/// buffer from scratch (re-priming the state so later appends are cheap
/// again). The backing temp file is removed when the buffer is dropped.
#[derive(Debug)]
pub struct Buffer {
    inner: Storage,
    threshold: usize,
    len: u64,
    hashed_up_to: u64,
    rolling: Option<Hasher>,
    cached: Option<ContentHash>,
}

impl Buffer {
    /// Creates an empty `Buffer` with the default spill threshold.
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_SPILL_THRESHOLD)
    }

    /// Creates an empty `Buffer` with the given spill threshold.
    pub fn with_threshold(threshold: usize) -> Self {
        Buffer {
            inner: Storage::Inline(Cursor::new(Vec::new())),
            threshold,
            len: 0,
            hashed_up_to: 0,
            rolling: Some(Hasher::new()),
            cached: None,
        }
    }

    /// Creates a `Buffer` holding the given bytes, hashed up front.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let mut rolling = Hasher::new();
        rolling.update(&bytes);
        let len = bytes.len() as u64;
        Buffer {
            inner: Storage::Inline(Cursor::new(bytes)),
            threshold: DEFAULT_SPILL_THRESHOLD,
            len,
            hashed_up_to: len,
            rolling: Some(rolling),
            cached: None,
        }
    }

    /// Returns the number of bytes hashed by the rolling state so far.
    #[inline]
    pub fn hashed_up_to(&self) -> u64 {
        self.hashed_up_to
    }

    /// Shortens the buffer to `size` bytes.
    ///
    /// Truncating below the hashed frontier resets the rolling hash state.
    /// Has no effect if `size` is not smaller than the current length.
    pub fn truncate(&mut self, size: u64) -> io::Result<()> {
        if size >= self.len {
            return Ok(());
        }

        match self.inner {
            Storage::Inline(ref mut cur) => {
                cur.get_mut().truncate(size as usize);
                if cur.position() > size {
                    cur.set_position(size);
                }
            }
            Storage::File(ref mut file) => file.as_file_mut().set_len(size)?,
        }

        self.len = size;
        self.cached = None;
        if size < self.hashed_up_to {
            self.rolling = None;
            self.hashed_up_to = 0;
        }
        Ok(())
    }

    /// Copies the entire contents out to a `Vec<u8>`.
    ///
    /// The read position is preserved across the call.
    pub fn to_vec(&mut self) -> io::Result<Vec<u8>> {
        let pos = self.stream_position()?;
        self.seek(SeekFrom::Start(0))?;
        let mut out = Vec::with_capacity(self.len as usize);
        self.read_to_end(&mut out)?;
        self.seek(SeekFrom::Start(pos))?;
        Ok(out)
    }

    fn spill(&mut self, at: u64) -> io::Result<()> {
        if let Storage::Inline(ref mut cur) = self.inner {
            let mut file = tempfile::NamedTempFile::new()?;
            file.write_all(cur.get_ref())?;
            file.seek(SeekFrom::Start(at))?;
            self.inner = Storage::File(file);
        }
        Ok(())
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl BinaryData for Buffer {
    fn size(&self) -> u64 {
        self.len
    }

    fn hash(&mut self) -> io::Result<ContentHash> {
        if self.hashed_up_to == self.len {
            if let Some(digest) = self.cached {
                return Ok(digest);
            }
            if let Some(ref rolling) = self.rolling {
                let digest = rolling.finish();
                self.cached = Some(digest);
                return Ok(digest);
            }
        }

        // Rolling state is stale; stream the whole buffer and re-prime it.
        let pos = self.stream_position()?;
        self.seek(SeekFrom::Start(0))?;
        let mut hasher = Hasher::new();
        let mut buf = [0u8; 65536];
        loop {
            match self.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    hasher.update(&buf[..n]);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.seek(SeekFrom::Start(pos))?;

        let digest = hasher.finish();
        self.hashed_up_to = self.len;
        self.rolling = Some(hasher);
        self.cached = Some(digest);
        Ok(digest)
    }
}

impl Read for Buffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inner {
            Storage::Inline(ref mut cur) => cur.read(buf),
            Storage::File(ref mut file) => file.read(buf),
        }
    }
}

impl Seek for Buffer {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self.inner {
            Storage::Inline(ref mut cur) => cur.seek(pos),
            Storage::File(ref mut file) => file.seek(pos),
        }
    }
}

impl Write for Buffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let at = self.stream_position()?;

        if matches!(self.inner, Storage::Inline(_))
            && at as usize + buf.len() > self.threshold
        {
            self.spill(at)?;
        }

        let written = match self.inner {
            Storage::Inline(ref mut cur) => cur.write(buf)?,
            Storage::File(ref mut file) => file.write(buf)?,
        };

        if written > 0 {
            if at == self.hashed_up_to && self.rolling.is_some() {
                // Tailing write: extend the rolling state.
                if let Some(ref mut rolling) = self.rolling {
                    rolling.update(&buf[..written]);
                }
                self.hashed_up_to += written as u64;
            } else if at < self.hashed_up_to {
                // Overwrite inside the hashed prefix.
                self.rolling = None;
                self.hashed_up_to = 0;
            } else {
                // Write past the frontier leaves a gap.
                self.rolling = None;
            }
            self.cached = None;
            self.len = self.len.max(at + written as u64);
        }

        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.inner {
            Storage::Inline(ref mut cur) => cur.flush(),
            Storage::File(ref mut file) => file.flush(),
        }
    }
}

/// Read-only binary data served from storage.
///
/// The backing representation is chosen by [`util::open_large_read`]: small
/// files come back inline, medium ones memory-mapped, and very large ones as
/// plain file handles.
pub enum Contents {
    Inline(Cursor<Vec<u8>>),
    Mmap(Cursor<Mmap>),
    File(u64, File),
}

impl Contents {
    /// Opens the file at `path` with the most efficient read strategy.
    pub fn open(path: &std::path::Path) -> io::Result<Self> {
        util::open_large_read(
            path,
            |cursor| Ok(Contents::Inline(cursor)),
            |mmap| Ok(Contents::Mmap(mmap)),
            |len, file| Ok(Contents::File(len, file)),
        )
    }

    /// Wraps an in-memory byte vector.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Contents::Inline(Cursor::new(bytes))
    }
}

impl Debug for Contents {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct(stringify!(Contents))
            .field("size", &self.size())
            .finish()
    }
}

impl BinaryData for Contents {
    fn size(&self) -> u64 {
        match *self {
            Contents::Inline(ref cur) => cur.get_ref().len() as u64,
            Contents::Mmap(ref cur) => cur.get_ref().len() as u64,
            Contents::File(len, _) => len,
        }
    }
}

impl Read for Contents {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match *self {
            Contents::Inline(ref mut inner) => inner.read(buf),
            Contents::Mmap(ref mut inner) => inner.read(buf),
            Contents::File(_, ref mut inner) => inner.read(buf),
        }
    }
}

impl Seek for Contents {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match *self {
            Contents::Inline(ref mut inner) => inner.seek(pos),
            Contents::Mmap(ref mut inner) => inner.seek(pos),
            Contents::File(_, ref mut inner) => inner.seek(pos),
        }
    }
}
