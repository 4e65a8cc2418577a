//! Error types for the codec crate.

use thiserror::Error;

/// Result type alias for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// All errors that can occur while encoding or decoding an artifact stream.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Encryption was requested with an empty password.
    #[error("encryption password is empty")]
    EmptyPassword,

    /// The AEAD cipher could not be constructed.
    #[error("cipher init failed: {0}")]
    Cipher(String),

    /// The cipher reports a nonce size other than the 12 bytes the frame
    /// format is built around.
    #[error("unexpected GCM nonce size: {0}")]
    NonceSize(usize),

    /// The per-frame counter would wrap, which would reuse a nonce.
    #[error("frame counter exhausted: stream too large for a single artifact")]
    NonceExhausted,

    /// The stream does not start with the encrypted-artifact magic.
    #[error("invalid encrypted stream header")]
    BadHeader,

    /// A frame declared a length beyond what any writer produces.
    #[error("frame length {0} exceeds maximum {1}")]
    FrameTooLarge(u32, u32),

    /// GCM authentication failed — wrong password, corruption, or tampering.
    #[error("decrypt failed: authentication tag mismatch")]
    AuthFailed,

    /// The stream ended before the terminator frame. Distinct from an
    /// authentication failure: the bytes seen so far were genuine.
    #[error("encrypted stream truncated: {0}")]
    Truncated(&'static str),

    /// Compression or decompression failed, including a gzip stream that
    /// ended without its trailer.
    #[error("gzip: {0}")]
    Gzip(String),

    /// A decoded stream yielded no bytes where content was required.
    #[error("decoded stream is empty or truncated")]
    EmptyStream,

    /// Wraps standard I/O errors from the underlying reader or writer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
