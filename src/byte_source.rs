//! Abstraction over wherever the raw boot image bytes come from.
//!
//! The image reader only ever needs random-access reads plus a total size, so it is written
//! against this trait rather than a concrete file handle. Grounded on the teacher's habit of
//! putting I/O behind small traits at module boundaries (see `maps_reader.rs`'s use of
//! `ReadMemory`) so the parsing logic can be exercised with synthetic fixtures in tests.

use std::io::{Read, Seek, SeekFrom};

/// A source of bytes that can be read at arbitrary offsets.
pub trait ByteSource {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Total size of the underlying data.
    fn size(&self) -> u64;

    /// Read exactly `len` bytes starting at `offset`.
    fn read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, Self::Error>;
}

/// An in-memory [ByteSource], mainly useful for tests and already-loaded images.
#[derive(Debug, Clone)]
pub struct MemoryByteSource {
    data: Vec<u8>,
}

impl MemoryByteSource {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl ByteSource for MemoryByteSource {
    type Error = std::io::Error;

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, Self::Error> {
        let start = usize::try_from(offset)
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::UnexpectedEof))?;
        let end = start
            .checked_add(len)
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::UnexpectedEof))?;
        self.data
            .get(start..end)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::UnexpectedEof))
    }
}

/// A [ByteSource] backed by any `Read + Seek` handle, e.g. an open file.
pub struct SeekableByteSource<T> {
    inner: T,
    size: u64,
}

impl<T: Read + Seek> SeekableByteSource<T> {
    pub fn new(mut inner: T) -> std::io::Result<Self> {
        let size = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        Ok(Self { inner, size })
    }
}

impl<T: Read + Seek> ByteSource for SeekableByteSource<T> {
    type Error = std::io::Error;

    fn size(&self) -> u64 {
        self.size
    }

    fn read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, Self::Error> {
        self.inner.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf)?;
        Ok(buf)
    }
}
