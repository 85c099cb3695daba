//! Positional I/O traits used by the image reader and writer.
//!
//! Every operation takes an absolute offset and no seek state is kept, so a
//! source may be shared between threads whenever its own positional reads
//! allow it.

use std::io::{Error, ErrorKind, Read, Result};

/// Random-access byte source.
pub trait ReadAt {
    /// Reads into `buf` starting at `offset`, returning the number of bytes
    /// read.  Returns 0 at end of input.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Fills `buf` completely from `offset`, retrying partial reads.
    fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> Result<()> {
        while !buf.is_empty() {
            match self.read_at(buf, offset) {
                Ok(0) => return Err(Error::from(ErrorKind::UnexpectedEof)),
                Ok(n) => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl ReadAt for [u8] {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let Ok(offset) = usize::try_from(offset) else {
            return Ok(0);
        };
        if offset >= self.len() {
            return Ok(0);
        }
        let avail = &self[offset..];
        let n = buf.len().min(avail.len());
        buf[..n].copy_from_slice(&avail[..n]);
        Ok(n)
    }
}

impl ReadAt for Vec<u8> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.as_slice().read_at(buf, offset)
    }
}

#[cfg(unix)]
impl ReadAt for std::fs::File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buf, offset)
    }
}

impl<R: ReadAt + ?Sized> ReadAt for &R {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        (**self).read_at(buf, offset)
    }
}

/// Random-access byte sink.
pub trait WriteAt {
    /// Writes all of `buf` at `offset`, extending the destination as needed.
    fn write_all_at(&mut self, buf: &[u8], offset: u64) -> Result<()>;

    /// Resizes the destination to exactly `len` bytes.  Destinations without
    /// a size concept keep this default no-op.
    fn set_len(&mut self, _len: u64) -> Result<()> {
        Ok(())
    }
}

impl WriteAt for Vec<u8> {
    fn write_all_at(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        let offset = usize::try_from(offset)
            .map_err(|_| Error::new(ErrorKind::InvalidInput, "offset overflow"))?;
        let end = offset + buf.len();
        if self.len() < end {
            self.resize(end, 0);
        }
        self[offset..end].copy_from_slice(buf);
        Ok(())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        let len = usize::try_from(len)
            .map_err(|_| Error::new(ErrorKind::InvalidInput, "length overflow"))?;
        self.resize(len, 0);
        Ok(())
    }
}

#[cfg(unix)]
impl WriteAt for std::fs::File {
    fn write_all_at(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        std::os::unix::fs::FileExt::write_all_at(self, buf, offset)
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        std::fs::File::set_len(self, len)
    }
}

impl<W: WriteAt + ?Sized> WriteAt for &mut W {
    fn write_all_at(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        (**self).write_all_at(buf, offset)
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        (**self).set_len(len)
    }
}

/// Sequential [`Read`] view over a fixed range of a [`ReadAt`] source.
#[derive(Debug)]
pub struct SectionReader<'a, R: ?Sized> {
    src: &'a R,
    offset: u64,
    remaining: u64,
}

impl<'a, R: ReadAt + ?Sized> SectionReader<'a, R> {
    pub fn new(src: &'a R, offset: u64, len: u64) -> Self {
        SectionReader {
            src,
            offset,
            remaining: len,
        }
    }
}

impl<R: ReadAt + ?Sized> Read for SectionReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let want = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        if want == 0 {
            return Ok(0);
        }
        let n = self.src.read_at(&mut buf[..want], self.offset)?;
        self.offset += n as u64;
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Copies all of `src` into `dst` starting at `offset`, in chunks.
pub(crate) fn copy_to_at(
    src: &mut dyn Read,
    dst: &mut (impl WriteAt + ?Sized),
    mut offset: u64,
) -> Result<u64> {
    let mut buf = [0u8; 65536];
    let mut total = 0u64;
    loop {
        let n = match src.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        dst.write_all_at(&buf[..n], offset)?;
        offset += n as u64;
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_read_at() {
        let data = b"hello world";
        let mut buf = [0u8; 5];
        assert_eq!(data.as_slice().read_at(&mut buf, 6).unwrap(), 5);
        assert_eq!(&buf, b"world");
        assert_eq!(data.as_slice().read_at(&mut buf, 11).unwrap(), 0);
        assert_eq!(data.as_slice().read_at(&mut buf, 100).unwrap(), 0);
    }

    #[test]
    fn test_read_exact_at_short() {
        let data = b"abc";
        let mut buf = [0u8; 4];
        let err = data.as_slice().read_exact_at(&mut buf, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_vec_write_at_grows() {
        let mut out = Vec::new();
        out.write_all_at(b"abc", 4).unwrap();
        assert_eq!(out, [0, 0, 0, 0, b'a', b'b', b'c']);
        out.write_all_at(b"xy", 0).unwrap();
        assert_eq!(out, [b'x', b'y', 0, 0, b'a', b'b', b'c']);
        unsafe { out.set_len(4) };
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn test_section_reader() {
        let data = b"0123456789";
        let mut section = SectionReader::new(data.as_slice(), 2, 5);
        let mut out = String::new();
        section.read_to_string(&mut out).unwrap();
        assert_eq!(out, "23456");
    }

    #[test]
    fn test_section_reader_past_end() {
        let data = b"0123";
        let mut section = SectionReader::new(data.as_slice(), 2, 100);
        let mut out = Vec::new();
        section.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"23");
    }

    #[test]
    fn test_copy_to_at() {
        let src = vec![7u8; 100_000];
        let mut dst = Vec::new();
        let n = copy_to_at(&mut src.as_slice(), &mut dst, 10).unwrap();
        assert_eq!(n, 100_000);
        assert_eq!(dst.len(), 100_010);
        assert_eq!(&dst[10..], &src[..]);
    }
}
