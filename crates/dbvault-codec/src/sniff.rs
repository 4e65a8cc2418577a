//! Content sniffing for backup artifacts.
//!
//! Restore never trusts the file extension or the configured pipeline
//! shape: it classifies the first bytes of the raw artifact, then of each
//! decoded layer, and builds the decode pipeline from what it actually
//! sees. Recognized heads are the encrypted-artifact magic, the gzip magic,
//! the `PGDMP` custom-archive magic, and a prefix heuristic for plain SQL
//! text.

use std::fmt;
use std::io::SeekFrom;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, ReadBuf};

use crate::aead::ENC_MAGIC;
use crate::error::{CodecError, CodecResult};

/// Magic prefix of a gzip stream.
pub const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
/// Magic prefix of a custom-format archive.
pub const ARCHIVE_MAGIC: &[u8] = b"PGDMP";

/// Classification of a raw (undecoded) artifact head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawKind {
    /// Framed AEAD envelope.
    Encrypted,
    /// Gzip stream.
    Gzip,
    /// Custom-format dump archive.
    Archive,
    /// None of the known magics.
    Unknown,
}

impl fmt::Display for RawKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawKind::Encrypted => write!(f, "enc"),
            RawKind::Gzip => write!(f, "gzip"),
            RawKind::Archive => write!(f, "archive"),
            RawKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// Classification of the stream right after the decrypt stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadingKind {
    /// Gzip stream (the artifact was compressed before encryption).
    Gzip,
    /// Custom-format dump archive.
    Archive,
    /// Plain SQL text.
    Sql,
    /// Unrecognized.
    Unknown,
}

impl fmt::Display for LeadingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeadingKind::Gzip => write!(f, "gzip"),
            LeadingKind::Archive => write!(f, "archive"),
            LeadingKind::Sql => write!(f, "sql"),
            LeadingKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// Classification of the fully decoded stream handed to the restore tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodedKind {
    /// Custom-format dump archive; restored with the archive tool.
    Archive,
    /// Plain SQL text; restored with the SQL client when allowed.
    Sql,
    /// Unrecognized.
    Unknown,
}

impl fmt::Display for DecodedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodedKind::Archive => write!(f, "archive"),
            DecodedKind::Sql => write!(f, "sql"),
            DecodedKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// A reader that can look at upcoming bytes without consuming them.
///
/// Buffers whatever `peek` pulled in and serves it back on subsequent
/// reads, so the wrapped stream sees no gap.
pub struct Peek<R> {
    inner: R,
    buf: Vec<u8>,
    pos: usize,
}

impl<R: AsyncRead + Unpin> Peek<R> {
    /// Wraps a reader.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            pos: 0,
        }
    }

    /// Returns up to `n` upcoming bytes without consuming them. Shorter
    /// output means the stream ended.
    pub async fn peek(&mut self, n: usize) -> std::io::Result<&[u8]> {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        let mut chunk = [0u8; 512];
        while self.buf.len() < n {
            let got = self.inner.read(&mut chunk).await?;
            if got == 0 {
                break;
            }
            self.buf.extend_from_slice(&chunk[..got]);
        }
        let end = self.buf.len().min(n);
        Ok(&self.buf[..end])
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for Peek<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let me = &mut *self;
        if me.pos < me.buf.len() {
            let avail = &me.buf[me.pos..];
            let n = avail.len().min(buf.remaining());
            buf.put_slice(&avail[..n]);
            me.pos += n;
            if me.pos == me.buf.len() {
                me.buf.clear();
                me.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut me.inner).poll_read(cx, buf)
    }
}

fn classify_raw(head: &[u8]) -> RawKind {
    if head.starts_with(ENC_MAGIC) {
        RawKind::Encrypted
    } else if head.starts_with(GZIP_MAGIC) {
        RawKind::Gzip
    } else if head.starts_with(ARCHIVE_MAGIC) {
        RawKind::Archive
    } else {
        RawKind::Unknown
    }
}

fn looks_like_sql(head: &[u8]) -> bool {
    const PREFIXES: &[&str] = &[
        "--", "/*", "SET ", "CREATE ", "INSERT ", "UPDATE ", "DELETE ", "BEGIN", "COPY ",
        "ALTER ", "DO ", "SELECT ", "\\CONNECT ",
    ];
    let text = String::from_utf8_lossy(head);
    let trimmed = text.trim_start();
    if trimmed.is_empty() {
        return false;
    }
    let upper = trimmed.to_uppercase();
    PREFIXES.iter().any(|p| upper.starts_with(p))
}

/// Classifies a seekable artifact by its first 8 bytes, then rewinds.
pub async fn sniff_raw<F>(src: &mut F) -> CodecResult<RawKind>
where
    F: AsyncRead + AsyncSeek + Unpin + ?Sized,
{
    let mut head = [0u8; 8];
    let mut filled = 0usize;
    while filled < head.len() {
        let n = src.read(&mut head[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    src.seek(SeekFrom::Start(0)).await?;
    Ok(classify_raw(&head[..filled]))
}

/// Classifies the head of a freshly decrypted stream without consuming it.
pub async fn sniff_leading<R>(src: &mut Peek<R>) -> CodecResult<LeadingKind>
where
    R: AsyncRead + Unpin,
{
    let head = src.peek(ENC_MAGIC.len()).await?;
    if head.is_empty() {
        return Err(CodecError::EmptyStream);
    }
    let kind = if head.starts_with(GZIP_MAGIC) {
        LeadingKind::Gzip
    } else if head.starts_with(ARCHIVE_MAGIC) {
        LeadingKind::Archive
    } else if looks_like_sql(head) {
        LeadingKind::Sql
    } else {
        LeadingKind::Unknown
    };
    Ok(kind)
}

/// Classifies the fully decoded stream that will feed the restore tool.
///
/// An empty decoded stream is an error: every valid decode yields bytes.
pub async fn sniff_decoded<R>(src: &mut Peek<R>) -> CodecResult<DecodedKind>
where
    R: AsyncRead + Unpin,
{
    let head = src.peek(ARCHIVE_MAGIC.len()).await?;
    if head.len() >= ARCHIVE_MAGIC.len() && &head[..ARCHIVE_MAGIC.len()] == ARCHIVE_MAGIC {
        return Ok(DecodedKind::Archive);
    }

    let probe = src.peek(256).await?;
    if probe.is_empty() {
        return Err(CodecError::EmptyStream);
    }
    if looks_like_sql(probe) {
        Ok(DecodedKind::Sql)
    } else {
        Ok(DecodedKind::Unknown)
    }
}

/// The raw head a restore should expect given the configured pipeline.
pub fn expected_raw_kind(compression: bool, encryption: bool) -> RawKind {
    if encryption {
        RawKind::Encrypted
    } else if compression {
        RawKind::Gzip
    } else {
        RawKind::Archive
    }
}

/// Artifact extension as a pure function of the two pipeline switches.
pub fn expected_ext(compression: bool, encryption: bool) -> &'static str {
    match (compression, encryption) {
        (false, false) => ".dump",
        (true, false) => ".dump.gz",
        (false, true) => ".dump.enc",
        (true, true) => ".dump.gz.enc",
    }
}

/// The recognized artifact suffix of a file name, if any.
pub fn artifact_suffix(name: &str) -> Option<&'static str> {
    if name.ends_with(".dump.gz.enc") {
        Some(".dump.gz.enc")
    } else if name.ends_with(".dump.enc") {
        Some(".dump.enc")
    } else if name.ends_with(".dump.gz") {
        Some(".dump.gz")
    } else if name.ends_with(".dump") {
        Some(".dump")
    } else {
        None
    }
}
