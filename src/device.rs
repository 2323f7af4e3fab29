//! Positioned read/write over the backing volume, with a fixed partition offset
//! applied to every access.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Mutex;

#[cfg(unix)]
use std::os::unix::fs::FileExt;

/// A backing store addressable by absolute byte offset, independent of any
/// shared seek cursor.
pub trait PositionedIo: Send + Sync {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()>;
    fn len(&self) -> io::Result<u64>;
}

/// A device backed by a real file, shifted by `partition_offset` bytes.
pub struct FileDevice {
    file: FileBackend,
    partition_offset: u64,
}

impl FileDevice {
    pub fn open(file: File, partition_offset: u64) -> Self {
        FileDevice {
            file: FileBackend::new(file),
            partition_offset,
        }
    }

    pub fn partition_offset(&self) -> u64 {
        self.partition_offset
    }
}

impl PositionedIo for FileDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let abs = self
            .partition_offset
            .checked_add(offset)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "offset overflow"))?;
        self.file.read_at(abs, buf)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let abs = self
            .partition_offset
            .checked_add(offset)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "offset overflow"))?;
        self.file.write_at(abs, buf)
    }

    fn len(&self) -> io::Result<u64> {
        let total = self.file.len()?;
        Ok(total.saturating_sub(self.partition_offset))
    }
}

#[cfg(unix)]
struct FileBackend(File);

#[cfg(unix)]
impl FileBackend {
    fn new(file: File) -> Self {
        FileBackend(file)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.0.read_exact_at(buf, offset)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.0.write_all_at(buf, offset)
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.0.metadata()?.len())
    }
}

#[cfg(not(unix))]
struct FileBackend(Mutex<File>);

#[cfg(not(unix))]
impl FileBackend {
    fn new(file: File) -> Self {
        FileBackend(Mutex::new(file))
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let mut guard = self.0.lock().expect("device mutex poisoned");
        guard.seek(SeekFrom::Start(offset))?;
        guard.read_exact(buf)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let mut guard = self.0.lock().expect("device mutex poisoned");
        guard.seek(SeekFrom::Start(offset))?;
        guard.write_all(buf)
    }

    fn len(&self) -> io::Result<u64> {
        let guard = self.0.lock().expect("device mutex poisoned");
        Ok(guard.metadata()?.len())
    }
}

/// An in-memory device used by the test suite; avoids materializing
/// multi-megabyte fixtures on disk.
pub struct MemoryDevice {
    data: Mutex<Vec<u8>>,
    partition_offset: u64,
}

impl MemoryDevice {
    pub fn new(data: Vec<u8>, partition_offset: u64) -> Self {
        MemoryDevice {
            data: Mutex::new(data),
            partition_offset,
        }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data.into_inner().expect("memory device mutex poisoned")
    }
}

impl PositionedIo for MemoryDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let abs = self.partition_offset + offset;
        let guard = self.data.lock().expect("memory device mutex poisoned");
        let start = abs as usize;
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "offset overflow"))?;
        if end > guard.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "read past end of device"));
        }
        buf.copy_from_slice(&guard[start..end]);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let abs = self.partition_offset + offset;
        let mut guard = self.data.lock().expect("memory device mutex poisoned");
        let start = abs as usize;
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "offset overflow"))?;
        if end > guard.len() {
            guard.resize(end, 0);
        }
        guard[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn len(&self) -> io::Result<u64> {
        let guard = self.data.lock().expect("memory device mutex poisoned");
        Ok((guard.len() as u64).saturating_sub(self.partition_offset))
    }
}
