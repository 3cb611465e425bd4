//! Typed byte-range access to the backing file.
//!
//! A [`Region`] is a bounded window of the index's file or block device.
//! The layout carves the file into regions (superblock, config, volume,
//! save slots) and every other component does its IO through one, so
//! nothing can scribble outside its own range. Readers and writers over a
//! region implement [`std::io::Read`]/[`std::io::Write`] so the usual
//! byteorder codecs apply.

use std::fs::File;
use std::io::{self, Read, Write};
use std::sync::Arc;

use crate::error::{Error, Result};

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_read(buf, offset)?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        buf = &mut buf[n..];
        offset += n as u64;
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_write(buf, offset)?;
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        buf = &buf[n..];
        offset += n as u64;
    }
    Ok(())
}

/// A bounded byte range of the backing file.
#[derive(Clone)]
pub struct Region {
    file: Arc<File>,
    start: u64,
    len: u64,
}

impl Region {
    pub fn new(file: Arc<File>, start: u64, len: u64) -> Self {
        Region { file, start, len }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// A sub-window of this region.
    pub fn subregion(&self, offset: u64, len: u64) -> Result<Region> {
        if offset + len > self.len {
            return Err(Error::OutOfRange(format!(
                "subregion {offset}+{len} exceeds region of {} bytes",
                self.len
            )));
        }
        Ok(Region {
            file: self.file.clone(),
            start: self.start + offset,
            len,
        })
    }

    fn check(&self, offset: u64, size: usize) -> Result<u64> {
        if offset + size as u64 > self.len {
            return Err(Error::OutOfRange(format!(
                "access {offset}+{size} exceeds region of {} bytes",
                self.len
            )));
        }
        Ok(self.start + offset)
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let position = self.check(offset, buf.len())?;
        read_exact_at(&self.file, buf, position).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => {
                Error::ShortRead(format!("{} bytes at region offset {offset}", buf.len()))
            }
            _ => e.into(),
        })
    }

    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let position = self.check(offset, buf.len())?;
        write_all_at(&self.file, buf, position)?;
        Ok(())
    }

    /// Flush file contents to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// A sequential reader positioned at `offset`.
    pub fn reader(&self, offset: u64) -> RegionReader {
        RegionReader {
            region: self.clone(),
            position: offset,
        }
    }

    /// A buffered sequential writer positioned at `offset`. Data reaches
    /// the file on `flush` or `finish`.
    pub fn writer(&self, offset: u64) -> RegionWriter {
        RegionWriter {
            region: self.clone(),
            position: offset,
            buffer: Vec::new(),
        }
    }
}

/// A sequential reader over a region.
pub struct RegionReader {
    region: Region,
    position: u64,
}

impl RegionReader {
    pub fn position(&self) -> u64 {
        self.position
    }
}

impl Read for RegionReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.region.len.saturating_sub(self.position);
        if remaining == 0 {
            return Ok(0);
        }
        let take = (buf.len() as u64).min(remaining) as usize;
        self.region
            .read_at(self.position, &mut buf[..take])
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        self.position += take as u64;
        Ok(take)
    }
}

/// A buffered sequential writer over a region.
pub struct RegionWriter {
    region: Region,
    position: u64,
    buffer: Vec<u8>,
}

impl RegionWriter {
    /// The position the next written byte will land at.
    pub fn position(&self) -> u64 {
        self.position + self.buffer.len() as u64
    }

    /// Flush and return the final region offset.
    pub fn finish(mut self) -> Result<u64> {
        self.flush()?;
        Ok(self.position)
    }
}

impl Write for RegionWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.buffer.is_empty() {
            self.region
                .write_at(self.position, &self.buffer)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            self.position += self.buffer.len() as u64;
            self.buffer.clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
    use tempfile::tempfile;

    fn region(len: u64) -> Region {
        let file = tempfile().unwrap();
        file.set_len(len + 32).unwrap();
        Region::new(Arc::new(file), 16, len)
    }

    #[test]
    fn test_read_write_at() {
        let region = region(128);
        region.write_at(5, b"hello").unwrap();
        let mut buf = [0u8; 5];
        region.read_at(5, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_bounds_enforced() {
        let region = region(16);
        assert!(region.write_at(12, &[0u8; 8]).is_err());
        let mut buf = [0u8; 8];
        assert!(region.read_at(12, &mut buf).is_err());
        assert!(region.subregion(8, 16).is_err());
        assert!(region.subregion(8, 8).is_ok());
    }

    #[test]
    fn test_subregion_isolation() {
        let region = region(64);
        let sub = region.subregion(32, 16).unwrap();
        sub.write_at(0, b"abcd").unwrap();
        let mut buf = [0u8; 4];
        region.read_at(32, &mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
    }

    #[test]
    fn test_streaming_roundtrip() {
        let region = region(64);
        let mut writer = region.writer(8);
        writer.write_u32::<LittleEndian>(0xdead_beef).unwrap();
        writer.write_u64::<LittleEndian>(42).unwrap();
        writer.finish().unwrap();

        let mut reader = region.reader(8);
        assert_eq!(reader.read_u32::<LittleEndian>().unwrap(), 0xdead_beef);
        assert_eq!(reader.read_u64::<LittleEndian>().unwrap(), 42);
    }
}
