//! Size-capped, lazily filled byte buffer.
//!
//! A [`BoundedBuffer`] sits between an upstream body and the image decoder.
//! It behaves like an in-memory `Cursor<Vec<u8>>` but only pulls bytes from
//! its source when a read or seek actually needs them, and refuses to hold
//! more than `max` bytes. Overflow surfaces as an `io::Error` carrying
//! [`SizeExceeded`], which converts into
//! [`GatewayError::UnsupportedFeature`](crate::GatewayError).

use std::io::{self, Read, Seek, SeekFrom, Write};

use bytes::Bytes;

use crate::error::SizeExceeded;

/// Bytes pulled from the source per fill step
pub const FILL_CHUNK_SIZE: usize = 32 * 1024;

/// Seekable byte store fed lazily from `R`, never larger than `max` bytes
pub struct BoundedBuffer<R = io::Empty> {
    source: Option<R>,
    data: Vec<u8>,
    pos: u64,
    max: u64,
}

impl BoundedBuffer<io::Empty> {
    /// Create an empty, writable buffer (used for encoder output)
    pub fn new(max: u64) -> Self {
        Self {
            source: None,
            data: Vec::new(),
            pos: 0,
            max,
        }
    }
}

impl<R: Read> BoundedBuffer<R> {
    /// Wrap a source stream; nothing is read until requested
    pub fn with_source(source: R, max: u64) -> Self {
        Self {
            source: Some(source),
            data: Vec::new(),
            pos: 0,
            max,
        }
    }

    /// Configured maximum size in bytes
    pub fn max_size(&self) -> u64 {
        self.max
    }

    /// Number of bytes pulled from the source (or written) so far
    pub fn buffered(&self) -> u64 {
        self.data.len() as u64
    }

    /// Current cursor position
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Total length. Drains the source, so it is subject to the size limit.
    pub fn len(&mut self) -> io::Result<u64> {
        self.drain()?;
        Ok(self.data.len() as u64)
    }

    /// True when the drained content is empty
    pub fn is_empty(&mut self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Drain the source and hand over the content
    pub fn into_bytes(mut self) -> io::Result<Bytes> {
        self.drain()?;
        Ok(Bytes::from(std::mem::take(&mut self.data)))
    }

    /// Release the source stream without reading the rest of it
    pub fn release(&mut self) {
        self.source = None;
    }

    fn exceeded(&self) -> io::Error {
        SizeExceeded { max: self.max }.into_io()
    }

    fn drain(&mut self) -> io::Result<()> {
        self.fill_to(u64::MAX)
    }

    /// Pull from the source until at least `target` bytes are buffered or
    /// the source is exhausted.
    fn fill_to(&mut self, target: u64) -> io::Result<()> {
        let mut chunk = [0u8; FILL_CHUNK_SIZE];
        while (self.data.len() as u64) < target {
            let Some(source) = self.source.as_mut() else {
                break;
            };
            let len = self.data.len() as u64;
            // one byte past `max` is enough to detect overflow
            let want = (target - len)
                .min(self.max.saturating_add(1) - len)
                .min(FILL_CHUNK_SIZE as u64) as usize;
            let read = match source.read(&mut chunk[..want]) {
                Ok(0) => {
                    self.source = None;
                    break;
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if self.data.len() as u64 + read as u64 > self.max {
                self.source = None;
                return Err(self.exceeded());
            }
            self.data.extend_from_slice(&chunk[..read]);
        }
        Ok(())
    }
}

impl<R: Read> Read for BoundedBuffer<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        // short reads up to `max` always succeed; past it, look for one more byte
        let target = if self.pos < self.max {
            self.pos.saturating_add(buf.len() as u64).min(self.max)
        } else {
            self.pos.saturating_add(1)
        };
        self.fill_to(target)?;

        let len = self.data.len() as u64;
        if self.pos >= len {
            return Ok(0);
        }
        let start = self.pos as usize;
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: Read> Seek for BoundedBuffer<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(offset) => self.pos.checked_add_signed(offset),
            SeekFrom::End(offset) => {
                self.drain()?;
                (self.data.len() as u64).checked_add_signed(offset)
            }
        };
        let Some(target) = target else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            ));
        };
        if target > self.max {
            return Err(self.exceeded());
        }
        self.pos = target;
        Ok(target)
    }
}

impl<R: Read> Write for BoundedBuffer<R> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let end = self.pos.saturating_add(buf.len() as u64);
        if end > self.max {
            return Err(self.exceeded());
        }
        // keep source bytes that the write does not overwrite
        self.fill_to(end)?;

        let start = self.pos as usize;
        let end = end as usize;
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(buf);
        self.pos = end as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Source that counts how many bytes were pulled from it
    struct CountingReader {
        inner: Cursor<Vec<u8>>,
        pulled: usize,
    }

    impl Read for CountingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.inner.read(buf)?;
            self.pulled += n;
            Ok(n)
        }
    }

    fn source(len: usize) -> Cursor<Vec<u8>> {
        Cursor::new((0..len).map(|i| (i % 251) as u8).collect())
    }

    fn is_size_exceeded(err: &io::Error) -> bool {
        SizeExceeded::from_io(err).is_some()
    }

    #[test]
    fn test_read_within_limit_replays() {
        let mut buffer = BoundedBuffer::with_source(source(1000), 1000);

        let mut first = Vec::new();
        buffer.read_to_end(&mut first).unwrap();
        assert_eq!(first.len(), 1000);

        buffer.seek(SeekFrom::Start(0)).unwrap();
        let mut second = Vec::new();
        buffer.read_to_end(&mut second).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_read_past_limit_fails() {
        let mut buffer = BoundedBuffer::with_source(source(1001), 1000);
        let mut out = Vec::new();
        let err = buffer.read_to_end(&mut out).unwrap_err();
        assert!(is_size_exceeded(&err));
    }

    #[test]
    fn test_fill_is_lazy() {
        let mut reader = CountingReader {
            inner: source(200_000),
            pulled: 0,
        };
        {
            let mut buffer = BoundedBuffer::with_source(&mut reader, 1_000_000);
            let mut header = [0u8; 16];
            buffer.read_exact(&mut header).unwrap();
            assert_eq!(buffer.buffered(), 16);

            // re-reading cached bytes does not touch the source
            buffer.seek(SeekFrom::Start(0)).unwrap();
            buffer.read_exact(&mut header).unwrap();
        }
        assert_eq!(reader.pulled, 16);
    }

    #[test]
    fn test_header_read_from_oversized_source() {
        let mut buffer = BoundedBuffer::with_source(source(2000), 1000);
        let mut header = [0u8; 16];
        buffer.read_exact(&mut header).unwrap();
        assert_eq!(buffer.buffered(), 16);

        // reading right up to the limit is fine, one byte more is not
        buffer.seek(SeekFrom::Start(0)).unwrap();
        let mut body = vec![0u8; 1000];
        buffer.read_exact(&mut body).unwrap();
        let mut extra = [0u8; 1];
        assert!(is_size_exceeded(&buffer.read(&mut extra).unwrap_err()));
    }

    #[test]
    fn test_len_drains_and_respects_limit() {
        let mut buffer = BoundedBuffer::with_source(source(5000), 5000);
        assert_eq!(buffer.len().unwrap(), 5000);

        let mut buffer = BoundedBuffer::with_source(source(5001), 5000);
        assert!(is_size_exceeded(&buffer.len().unwrap_err()));
    }

    #[test]
    fn test_seek_past_limit_fails() {
        let mut buffer = BoundedBuffer::with_source(source(10), 100);
        assert_eq!(buffer.seek(SeekFrom::Start(100)).unwrap(), 100);
        assert!(is_size_exceeded(&buffer.seek(SeekFrom::Start(101)).unwrap_err()));

        // mid-stream
        buffer.seek(SeekFrom::Start(50)).unwrap();
        assert!(is_size_exceeded(&buffer.seek(SeekFrom::Current(51)).unwrap_err()));
        assert_eq!(buffer.position(), 50);
    }

    #[test]
    fn test_seek_from_end_drains() {
        let mut buffer = BoundedBuffer::with_source(source(300), 1000);
        assert_eq!(buffer.seek(SeekFrom::End(-10)).unwrap(), 290);
        let mut tail = Vec::new();
        buffer.read_to_end(&mut tail).unwrap();
        assert_eq!(tail.len(), 10);
    }

    #[test]
    fn test_write_up_to_limit() {
        let mut buffer = BoundedBuffer::new(8);
        buffer.write_all(b"abcd").unwrap();
        buffer.write_all(b"efgh").unwrap();
        assert_eq!(buffer.into_bytes().unwrap(), Bytes::from_static(b"abcdefgh"));
    }

    #[test]
    fn test_write_past_limit_fails() {
        let mut buffer = BoundedBuffer::new(8);
        buffer.write_all(b"abcdef").unwrap();
        let err = buffer.write(b"xyz").unwrap_err();
        assert!(is_size_exceeded(&err));

        // mid-stream overwrite that stays inside the limit is fine
        buffer.seek(SeekFrom::Start(2)).unwrap();
        buffer.write_all(b"CD").unwrap();
        assert_eq!(buffer.into_bytes().unwrap(), Bytes::from_static(b"abCDef"));
    }

    #[test]
    fn test_size_exceeded_converts_to_gateway_error() {
        let mut buffer = BoundedBuffer::new(1);
        let err = buffer.write(b"xy").unwrap_err();
        let err: crate::GatewayError = err.into();
        assert!(matches!(err, crate::GatewayError::UnsupportedFeature(_)));
    }
}
