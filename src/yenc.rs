//! Streaming yEnc decoder
//!
//! Decodes one Usenet article body (already un-dot-stuffed by the NNTP
//! layer) into the original binary bytes while accumulating a CRC32-IEEE
//! checksum over the decoded output.
//!
//! Format subset handled here:
//! - `=ybegin ... size=N ...` header, optionally followed by
//!   `=ypart begin=A end=B` (1-based inclusive range within the file);
//! - body bytes offset by +42 mod 256, with `=` escaping the next byte
//!   (offset +42+64 mod 256) and bare CR/LF skipped as line breaks;
//! - `=yend ... pcrc32=HEX` / `crc32=HEX` trailer, `pcrc32` preferred.
//!
//! Escape state persists across `read` calls, so the decoder behaves
//! identically no matter how the transport chunks the stream.

use crate::error::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt};

const REFILL_CHUNK: usize = 8 * 1024;

/// Incremental yEnc decoder over any byte stream
pub struct YencDecoder<R> {
    inner: R,
    buf: Vec<u8>,
    pos: usize,
    source_eof: bool,
    escaped: bool,
    reached_end: bool,
    hasher: crc32fast::Hasher,
    expected_crc: u32,
    part_offset: Option<u64>,
    file_size: Option<u64>,
}

impl<R: AsyncRead + Unpin> YencDecoder<R> {
    /// Wrap a raw article-body reader
    pub fn new(inner: R) -> Self {
        YencDecoder {
            inner,
            buf: Vec::with_capacity(REFILL_CHUNK),
            pos: 0,
            source_eof: false,
            escaped: false,
            reached_end: false,
            hasher: crc32fast::Hasher::new(),
            expected_crc: 0,
            part_offset: None,
            file_size: None,
        }
    }

    /// 0-based byte offset within the whole file, from `=ypart begin=`
    /// (yEnc offsets are 1-based on the wire). `None` when no part
    /// header was present — the caller falls back to computed offsets.
    pub fn part_offset(&self) -> Option<u64> {
        self.part_offset
    }

    /// Whole-file size declared by `=ybegin size=`, if present
    pub fn file_size(&self) -> Option<u64> {
        self.file_size
    }

    /// Skip transport headers until the `=ybegin` line, parse it, and
    /// consume a following `=ypart` line when present.
    ///
    /// Returns [`Error::HeaderNotFound`] when the stream ends without a
    /// yEnc header.
    pub async fn discard_header(&mut self) -> Result<()> {
        loop {
            let line = match self.read_line().await? {
                Some(line) => line,
                None => return Err(Error::HeaderNotFound),
            };

            if line.starts_with("=ybegin") {
                self.parse_ybegin(&line);

                // Peek a small window; the part header directly follows
                // the begin line when the article is multi-part.
                let available = self.ensure(6).await?;
                let window = &self.buf[self.pos..self.pos + available.min(6)];
                if window.starts_with(b"=ypart")
                    && let Some(part_line) = self.read_line().await?
                {
                    self.parse_ypart(&part_line);
                }
                return Ok(());
            }
        }
    }

    /// Decode bytes into `out`, returning the count produced. `Ok(0)`
    /// signals end of the part (either the `=yend` trailer or transport
    /// EOF on a truncated article).
    pub async fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        if self.reached_end || out.is_empty() {
            return Ok(0);
        }

        let mut n = 0;
        while n < out.len() {
            if self.ensure(1).await? == 0 {
                break;
            }

            let b = self.buf[self.pos];

            if b == b'=' && !self.escaped {
                // Either the trailer or an escape marker; look ahead far
                // enough to tell them apart.
                let available = self.ensure(5).await?;
                if available >= 5 && &self.buf[self.pos + 1..self.pos + 5] == b"yend" {
                    self.pos += 1;
                    self.reached_end = true;
                    if let Ok(Some(line)) = self.read_line().await {
                        self.parse_yend(&line);
                    }
                    break;
                }
                self.escaped = true;
                self.pos += 1;
                continue;
            }

            if (b == b'\r' || b == b'\n') && !self.escaped {
                self.pos += 1;
                continue;
            }

            let decoded = if self.escaped {
                self.escaped = false;
                b.wrapping_sub(64).wrapping_sub(42)
            } else {
                b.wrapping_sub(42)
            };
            out[n] = decoded;
            n += 1;
            self.pos += 1;
        }

        self.hasher.update(&out[..n]);
        Ok(n)
    }

    /// Compare the accumulated CRC32 against the trailer-declared value.
    ///
    /// When the trailer carried no checksum the expected value is 0, so
    /// any nonzero decoded content fails — a truncated article must not
    /// pass verification.
    pub fn verify(&self) -> Result<()> {
        let actual = self.hasher.clone().finalize();
        if actual != self.expected_crc {
            return Err(Error::ChecksumMismatch {
                expected: self.expected_crc,
                actual,
            });
        }
        Ok(())
    }

    /// Ensure at least `n` unread bytes are buffered (or the source is
    /// exhausted); returns the number actually available.
    async fn ensure(&mut self, n: usize) -> Result<usize> {
        while self.buf.len() - self.pos < n && !self.source_eof {
            if self.pos > 0 {
                self.buf.drain(..self.pos);
                self.pos = 0;
            }
            let mut chunk = [0u8; REFILL_CHUNK];
            let read = self.inner.read(&mut chunk).await?;
            if read == 0 {
                self.source_eof = true;
            } else {
                self.buf.extend_from_slice(&chunk[..read]);
            }
        }
        Ok(self.buf.len() - self.pos)
    }

    /// Read one physical line (without the trailing newline); `None` at
    /// a clean EOF with nothing buffered.
    async fn read_line(&mut self) -> Result<Option<String>> {
        let mut scanned = 0;
        loop {
            if let Some(rel) = self.buf[self.pos + scanned..].iter().position(|&b| b == b'\n') {
                let end = self.pos + scanned + rel;
                let mut line = &self.buf[self.pos..end];
                if line.ends_with(b"\r") {
                    line = &line[..line.len() - 1];
                }
                let text = String::from_utf8_lossy(line).into_owned();
                self.pos = end + 1;
                return Ok(Some(text));
            }

            scanned = self.buf.len() - self.pos;
            let available = self.ensure(scanned + 1).await?;
            if available == scanned {
                // EOF without a newline: hand back the remainder
                if scanned == 0 {
                    return Ok(None);
                }
                let text = String::from_utf8_lossy(&self.buf[self.pos..]).into_owned();
                self.pos = self.buf.len();
                return Ok(Some(text));
            }
        }
    }

    fn parse_ybegin(&mut self, line: &str) {
        for field in line.split_whitespace() {
            if let Some(value) = field.strip_prefix("size=")
                && let Ok(size) = value.parse::<u64>()
            {
                self.file_size = Some(size);
            }
        }
    }

    fn parse_ypart(&mut self, line: &str) {
        for field in line.split_whitespace() {
            if let Some(value) = field.strip_prefix("begin=")
                && let Ok(begin) = value.parse::<u64>()
            {
                self.part_offset = Some(begin.saturating_sub(1));
            }
        }
    }

    fn parse_yend(&mut self, line: &str) {
        for field in line.split_whitespace() {
            if let Some(value) = field.strip_prefix("pcrc32=") {
                if let Ok(crc) = u32::from_str_radix(value, 16) {
                    self.expected_crc = crc;
                    return;
                }
            }
            if let Some(value) = field.strip_prefix("crc32=")
                && let Ok(crc) = u32::from_str_radix(value, 16)
            {
                self.expected_crc = crc;
            }
        }
    }
}
