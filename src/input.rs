//! Buffered byte input with lookahead, used by every matching unit.

use std::io::{self, Read};

const CHUNK: usize = 4096;

/// Byte source for a match: any `Read` plus a lookahead buffer.
///
/// Bytes are consumed strictly forward; `peek` never consumes. Large
/// declared lengths are read incrementally, so a bogus length field only
/// costs as much memory as the input actually provides.
pub struct Input<'a> {
    src: Box<dyn Read + 'a>,
    buf: Vec<u8>,
    pos: usize,
    offset: u64,
    eof: bool,
}

impl<'a> Input<'a> {
    pub fn new<R: Read + 'a>(reader: R) -> Self {
        Input {
            src: Box::new(reader),
            buf: Vec::new(),
            pos: 0,
            offset: 0,
            eof: false,
        }
    }

    pub fn from_bytes(bytes: &'a [u8]) -> Self {
        Input::new(bytes)
    }

    /// Number of bytes consumed so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Bytes already pulled from the source but not consumed yet.
    pub fn buffered(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    /// Best-effort lookahead of up to `n` bytes (for diagnostics).
    pub fn lookahead(&mut self, n: usize) -> &[u8] {
        let _ = self.fill(n);
        let end = (self.pos + n).min(self.buf.len());
        &self.buf[self.pos..end]
    }

    fn available(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Pull from the source until `n` bytes are buffered or the source ends.
    fn fill(&mut self, n: usize) -> io::Result<bool> {
        if self.available() >= n {
            return Ok(true);
        }
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        let mut chunk = [0u8; CHUNK];
        while self.available() < n && !self.eof {
            match self.src.read(&mut chunk) {
                Ok(0) => self.eof = true,
                Ok(k) => self.buf.extend_from_slice(&chunk[..k]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(self.available() >= n)
    }

    /// Look at the next `n` bytes without consuming them.
    pub fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        if !self.fill(n)? {
            return Err(short_read(n, self.available()));
        }
        Ok(&self.buf[self.pos..self.pos + n])
    }

    /// Consume `n` bytes that were previously peeked.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.available());
        self.pos += n;
        self.offset += n as u64;
    }

    pub fn at_eof(&mut self) -> io::Result<bool> {
        Ok(!self.fill(1)?)
    }

    /// Consume exactly `n` bytes.
    pub fn take_exact(&mut self, n: usize) -> io::Result<Vec<u8>> {
        let from_buf = n.min(self.available());
        let mut out = self.buf[self.pos..self.pos + from_buf].to_vec();
        self.consume(from_buf);
        let rest = (n - from_buf) as u64;
        if rest > 0 {
            let got = (&mut self.src).take(rest).read_to_end(&mut out)?;
            self.offset += got as u64;
            if (got as u64) < rest {
                self.eof = true;
                return Err(short_read(n, out.len()));
            }
        }
        Ok(out)
    }

    /// Consume bytes up to and including `delim`; the delimiter is not returned.
    pub fn read_until(&mut self, delim: u8) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            if let Some(i) = self.buffered().iter().position(|&b| b == delim) {
                out.extend_from_slice(&self.buf[self.pos..self.pos + i]);
                self.consume(i + 1);
                return Ok(out);
            }
            out.extend_from_slice(self.buffered());
            let n = self.available();
            self.consume(n);
            if !self.fill(1)? {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("missing terminator 0x{:02x}", delim),
                ));
            }
        }
    }

    /// Discard everything left in the source.
    pub fn skip_to_end(&mut self) -> io::Result<()> {
        let n = self.available();
        self.consume(n);
        let skipped = io::copy(&mut self.src, &mut io::sink())?;
        self.offset += skipped;
        self.eof = true;
        Ok(())
    }
}

impl Read for Input<'_> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.available() == 0 && !self.fill(1)? {
            return Ok(0);
        }
        let n = out.len().min(self.available());
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.consume(n);
        Ok(n)
    }
}

impl std::fmt::Debug for Input<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Input")
            .field("offset", &self.offset)
            .field("buffered", &self.available())
            .field("eof", &self.eof)
            .finish()
    }
}

fn short_read(want: usize, have: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("short read: need {} bytes, {} available", want, have),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reader that hands out one byte per call.
    struct Trickle<'a>(&'a [u8]);

    impl Read for Trickle<'_> {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            if self.0.is_empty() || out.is_empty() {
                return Ok(0);
            }
            out[0] = self.0[0];
            self.0 = &self.0[1..];
            Ok(1)
        }
    }

    #[test]
    fn peek_does_not_consume() {
        let mut input = Input::from_bytes(&[1, 2, 3]);
        assert_eq!(input.peek(2).unwrap(), &[1, 2]);
        assert_eq!(input.offset(), 0);
        input.consume(2);
        assert_eq!(input.peek(1).unwrap(), &[3]);
        assert!(input.peek(2).is_err());
    }

    #[test]
    fn take_spans_buffer_and_source() {
        let data = b"abcdefgh";
        let mut input = Input::new(Trickle(data));
        input.peek(3).unwrap();
        assert_eq!(input.take_exact(6).unwrap(), b"abcdef");
        assert_eq!(input.offset(), 6);
        assert!(input.take_exact(5).is_err());
    }

    #[test]
    fn take_huge_length_fails_without_allocating_it() {
        let mut input = Input::from_bytes(&[0u8; 16]);
        let err = input.take_exact(usize::MAX / 2).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn read_until_strips_delimiter() {
        let mut input = Input::new(Trickle(b"foo\0bar"));
        assert_eq!(input.read_until(0).unwrap(), b"foo");
        assert_eq!(input.offset(), 4);
        assert!(input.read_until(0).is_err());
    }

    #[test]
    fn skip_and_eof() {
        let mut input = Input::from_bytes(b"xyz");
        assert!(!input.at_eof().unwrap());
        input.skip_to_end().unwrap();
        assert!(input.at_eof().unwrap());
        assert_eq!(input.offset(), 3);
    }
}
