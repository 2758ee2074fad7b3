//! Data sources and positioned readers
//!
//! A [`Source`] is the byte supply behind a dataset: a file opened per
//! reader (stream mode), a memory-mapped file, or an owned byte buffer.
//! A [`Reader`] holds a position cursor over one source and offers the
//! little-endian primitive reads the record parsers are built from.
//!
//! Readers are not thread-safe individually; matcher threads borrow one
//! exclusively through the pool. Sources marked temporary delete their
//! backing file when dropped.

use crate::error::Result;
use memmap2::Mmap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// How a file-backed dataset reads its records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMode {
    /// Seek-and-read from the file on demand; smallest footprint
    Stream,
    /// Memory-map the whole file; fastest access
    Memory,
}

enum Backing {
    /// Stream mode: each reader re-opens the file
    File { path: PathBuf, len: u64 },
    /// Memory mode over a mapped file
    Mmap { map: Arc<Mmap>, path: Option<PathBuf> },
    /// Owned bytes (tests, embedded data)
    Bytes(Arc<Vec<u8>>),
}

/// The byte supply behind a dataset
pub struct Source {
    backing: Backing,
    temporary: bool,
}

impl Source {
    /// Stream source: readers seek-and-read the file at `path`
    pub fn stream(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let len = std::fs::metadata(&path)?.len();
        Ok(Self {
            backing: Backing::File { path, len },
            temporary: false,
        })
    }

    /// Memory source: map the file at `path`
    pub fn memory_mapped(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let map = unsafe { Mmap::map(&file) }?;
        Ok(Self {
            backing: Backing::Mmap {
                map: Arc::new(map),
                path: Some(path),
            },
            temporary: false,
        })
    }

    /// Memory source over an owned byte buffer
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            backing: Backing::Bytes(Arc::new(bytes)),
            temporary: false,
        }
    }

    /// Delete the backing file when this source is dropped
    pub fn mark_temporary(&mut self) {
        self.temporary = true;
    }

    /// Total byte length of the source
    pub fn len(&self) -> u64 {
        match &self.backing {
            Backing::File { len, .. } => *len,
            Backing::Mmap { map, .. } => map.len() as u64,
            Backing::Bytes(bytes) => bytes.len() as u64,
        }
    }

    /// True when the source has no bytes
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Path of the backing file, when there is one
    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::File { path, .. } => Some(path),
            Backing::Mmap { path, .. } => path.as_deref(),
            Backing::Bytes(_) => None,
        }
    }

    /// Open a fresh reader over this source
    pub(crate) fn new_reader(&self) -> Result<Reader> {
        let backing = match &self.backing {
            Backing::File { path, .. } => ReaderBacking::File(File::open(path)?),
            Backing::Mmap { map, .. } => ReaderBacking::Mmap(Arc::clone(map)),
            Backing::Bytes(bytes) => ReaderBacking::Bytes(Arc::clone(bytes)),
        };
        Ok(Reader {
            backing,
            pos: 0,
            len: self.len(),
        })
    }
}

impl Drop for Source {
    fn drop(&mut self) {
        if self.temporary {
            if let Some(path) = self.path().map(Path::to_path_buf) {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

enum ReaderBacking {
    File(File),
    Mmap(Arc<Mmap>),
    Bytes(Arc<Vec<u8>>),
}

/// Positioned reader over a [`Source`]
///
/// Not thread-safe; acquire exclusive use through the pool.
pub struct Reader {
    backing: ReaderBacking,
    pos: u64,
    len: u64,
}

impl Reader {
    /// Move the cursor to an absolute byte offset
    pub fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    /// Current cursor position
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Total length of the underlying source
    pub fn len(&self) -> u64 {
        self.len
    }

    /// True when the source has no bytes
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn fill(&mut self, buf: &mut [u8]) -> Result<()> {
        if self.pos + buf.len() as u64 > self.len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "read of {} bytes at offset {} past end of {}-byte source",
                    buf.len(),
                    self.pos,
                    self.len
                ),
            )
            .into());
        }
        match &mut self.backing {
            ReaderBacking::File(file) => {
                file.seek(SeekFrom::Start(self.pos))?;
                file.read_exact(buf)?;
            }
            ReaderBacking::Mmap(map) => {
                let at = self.pos as usize;
                buf.copy_from_slice(&map[at..at + buf.len()]);
            }
            ReaderBacking::Bytes(bytes) => {
                let at = self.pos as usize;
                buf.copy_from_slice(&bytes[at..at + buf.len()]);
            }
        }
        self.pos += buf.len() as u64;
        Ok(())
    }

    /// Read `n` bytes at the cursor
    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.fill(&mut buf)?;
        Ok(buf)
    }

    /// Read bytes up to (not including) the next 0x00, advancing past it
    pub fn read_null_terminated(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let byte = self.read_u8()?;
            if byte == 0 {
                return Ok(out);
            }
            out.push(byte);
        }
    }

    /// Read an unsigned 8-bit integer
    pub fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.fill(&mut buf)?;
        Ok(buf[0])
    }

    /// Read a signed 8-bit integer
    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    /// Read a little-endian unsigned 16-bit integer
    pub fn read_u16(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.fill(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    /// Read a little-endian signed 16-bit integer
    pub fn read_i16(&mut self) -> Result<i16> {
        let mut buf = [0u8; 2];
        self.fill(&mut buf)?;
        Ok(i16::from_le_bytes(buf))
    }

    /// Read a little-endian unsigned 32-bit integer
    pub fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.fill(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Read a little-endian signed 32-bit integer
    pub fn read_i32(&mut self) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.fill(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    /// Read a little-endian unsigned 64-bit integer
    pub fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.fill(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Read a little-endian signed 64-bit integer
    pub fn read_i64(&mut self) -> Result<i64> {
        let mut buf = [0u8; 8];
        self.fill(&mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0xABCDu16.to_le_bytes());
        bytes.extend_from_slice(&0xDEADBEEFu32.to_le_bytes());
        bytes.extend_from_slice(&(-7i64).to_le_bytes());
        bytes.extend_from_slice(b"run\0");
        bytes
    }

    #[test]
    fn reads_primitives_in_order() {
        let source = Source::from_bytes(sample());
        let mut reader = source.new_reader().unwrap();
        assert_eq!(reader.read_u16().unwrap(), 0xABCD);
        assert_eq!(reader.read_u32().unwrap(), 0xDEADBEEF);
        assert_eq!(reader.read_i64().unwrap(), -7);
        assert_eq!(reader.read_null_terminated().unwrap(), b"run");
        assert_eq!(reader.position(), source.len());
    }

    #[test]
    fn seek_is_absolute() {
        let source = Source::from_bytes(sample());
        let mut reader = source.new_reader().unwrap();
        reader.seek(2);
        assert_eq!(reader.read_u32().unwrap(), 0xDEADBEEF);
        reader.seek(0);
        assert_eq!(reader.read_u16().unwrap(), 0xABCD);
    }

    #[test]
    fn read_past_end_is_io_error() {
        let source = Source::from_bytes(vec![1, 2, 3]);
        let mut reader = source.new_reader().unwrap();
        reader.seek(2);
        assert!(reader.read_u32().is_err());
    }

    #[test]
    fn stream_and_memory_read_identically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("source.dat");
        std::fs::write(&path, sample()).unwrap();

        let stream = Source::stream(&path).unwrap();
        let mapped = Source::memory_mapped(&path).unwrap();
        let mut a = stream.new_reader().unwrap();
        let mut b = mapped.new_reader().unwrap();
        assert_eq!(a.read_bytes(18).unwrap(), b.read_bytes(18).unwrap());
    }

    #[test]
    fn temporary_source_deletes_file_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("temp.dat");
        std::fs::write(&path, b"x").unwrap();
        let mut source = Source::stream(&path).unwrap();
        source.mark_temporary();
        drop(source);
        assert!(!path.exists());
    }
}
