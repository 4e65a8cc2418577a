//! Streaming gzip compression and decompression.
//!
//! Thin async wrappers over `flate2`. Input is pulled in 32 KiB reads and
//! pushed through an in-memory encoder/decoder whose output buffer is
//! drained to the destination after every chunk, so memory stays bounded
//! regardless of stream size.

use std::io::Write;

use flate2::write::{GzDecoder, GzEncoder};
use flate2::Compression;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{CodecError, CodecResult};

const COPY_CHUNK: usize = 32 * 1024;

/// Compresses `src` to EOF into `dst` as a gzip stream.
///
/// The encoder is finalized before success is reported; a failure to write
/// the gzip trailer is an error, never a silently short stream. Returns the
/// number of input bytes consumed.
pub async fn gzip<W, R>(dst: &mut W, src: &mut R) -> CodecResult<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
    R: AsyncRead + Unpin + ?Sized,
{
    let mut encoder = GzEncoder::new(Vec::with_capacity(COPY_CHUNK), Compression::default());
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut consumed = 0u64;

    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        encoder
            .write_all(&buf[..n])
            .map_err(|e| CodecError::Gzip(e.to_string()))?;
        consumed += n as u64;

        if !encoder.get_ref().is_empty() {
            dst.write_all(encoder.get_ref()).await?;
            encoder.get_mut().clear();
        }
    }

    let tail = encoder
        .finish()
        .map_err(|e| CodecError::Gzip(e.to_string()))?;
    dst.write_all(&tail).await?;
    dst.flush().await?;
    Ok(consumed)
}

/// Decompresses a gzip stream from `src` into `dst`.
///
/// A stream that ends before the gzip trailer fails rather than yielding a
/// silently short payload. Returns the number of decompressed bytes written.
pub async fn gunzip<W, R>(dst: &mut W, src: &mut R) -> CodecResult<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
    R: AsyncRead + Unpin + ?Sized,
{
    let mut decoder = GzDecoder::new(Vec::with_capacity(COPY_CHUNK));
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut produced = 0u64;

    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        decoder
            .write_all(&buf[..n])
            .map_err(|e| CodecError::Gzip(e.to_string()))?;

        if !decoder.get_ref().is_empty() {
            produced += decoder.get_ref().len() as u64;
            dst.write_all(decoder.get_ref()).await?;
            decoder.get_mut().clear();
        }
    }

    // finish() fails if the input did not form a complete gzip stream.
    let tail = decoder
        .finish()
        .map_err(|e| CodecError::Gzip(e.to_string()))?;
    produced += tail.len() as u64;
    dst.write_all(&tail).await?;
    dst.flush().await?;
    Ok(produced)
}
