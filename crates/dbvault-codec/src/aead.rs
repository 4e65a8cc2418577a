//! Framed AES-256-GCM stream encryption.
//!
//! Wire format (big-endian):
//!
//! ```text
//! "BKENC001" (8B) || nonce_prefix (8B)
//! || { u32 plaintext_len, ciphertext (len + 16B tag) }*
//! || u32 0
//! ```
//!
//! Every frame is sealed under `nonce = prefix || u32(counter)`, so nonces
//! are unique within one artifact as long as the counter never wraps. The
//! key is the SHA-256 digest of the password; a future format revision that
//! adds a salt and a real KDF will bump the magic and keep this path for
//! old artifacts.

use aes_gcm::aead::generic_array::typenum::Unsigned;
use aes_gcm::aead::{Aead, AeadCore};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zeroize::Zeroizing;

use crate::error::{CodecError, CodecResult};

/// Magic prefix of an encrypted artifact.
pub const ENC_MAGIC: &[u8; 8] = b"BKENC001";

const NONCE_LEN: usize = 12;
const NONCE_PREFIX_LEN: usize = 8;
const TAG_LEN: usize = 16;
/// Plaintext read granularity; also the largest frame a writer emits.
const PLAIN_CHUNK: usize = 32 * 1024;
/// Upper bound accepted when reading frame lengths. Keeps a corrupted
/// length field from turning into a multi-gigabyte allocation.
const MAX_FRAME: u32 = 16 * 1024 * 1024;

fn build_cipher(password: &str) -> CodecResult<Aes256Gcm> {
    if password.is_empty() {
        return Err(CodecError::EmptyPassword);
    }
    let digest: [u8; 32] = Sha256::digest(password.as_bytes()).into();
    let key = Zeroizing::new(digest);
    let cipher =
        Aes256Gcm::new_from_slice(&key[..]).map_err(|e| CodecError::Cipher(e.to_string()))?;
    let nonce_len = <Aes256Gcm as AeadCore>::NonceSize::USIZE;
    if nonce_len != NONCE_LEN {
        return Err(CodecError::NonceSize(nonce_len));
    }
    Ok(cipher)
}

async fn read_exact_frame<R>(src: &mut R, buf: &mut [u8], what: &'static str) -> CodecResult<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    src.read_exact(buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            CodecError::Truncated(what)
        } else {
            CodecError::Io(e)
        }
    })?;
    Ok(())
}

/// Encrypts `src` to EOF into `dst` as a framed AES-256-GCM stream.
///
/// Returns the number of bytes written to `dst`, header and terminator
/// included.
pub async fn encrypt<W, R>(dst: &mut W, src: &mut R, password: &str) -> CodecResult<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
    R: AsyncRead + Unpin + ?Sized,
{
    let cipher = build_cipher(password)?;

    // Fresh per artifact; combined with the counter this keeps nonces unique.
    let mut prefix = [0u8; NONCE_PREFIX_LEN];
    rand::thread_rng().fill_bytes(&mut prefix);

    dst.write_all(ENC_MAGIC).await?;
    dst.write_all(&prefix).await?;
    let mut written = (ENC_MAGIC.len() + NONCE_PREFIX_LEN) as u64;

    let mut nonce = [0u8; NONCE_LEN];
    nonce[..NONCE_PREFIX_LEN].copy_from_slice(&prefix);

    let mut buf = vec![0u8; PLAIN_CHUNK];
    let mut counter: u64 = 0;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        if counter > u64::from(u32::MAX) {
            return Err(CodecError::NonceExhausted);
        }
        nonce[NONCE_PREFIX_LEN..].copy_from_slice(&(counter as u32).to_be_bytes());
        counter += 1;

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), &buf[..n])
            .map_err(|_| CodecError::Cipher("seal failed".to_string()))?;
        dst.write_all(&(n as u32).to_be_bytes()).await?;
        dst.write_all(&ciphertext).await?;
        written += 4 + ciphertext.len() as u64;
    }

    // Zero-length terminator frame; nothing may follow it.
    dst.write_all(&0u32.to_be_bytes()).await?;
    written += 4;
    dst.flush().await?;
    Ok(written)
}

/// Decrypts a framed AES-256-GCM stream from `src` into `dst`.
///
/// Plaintext is written only after the frame it came from authenticated, so
/// a consumer never observes tampered bytes. A stream that ends before the
/// terminator fails with [`CodecError::Truncated`]; a failed tag check fails
/// with [`CodecError::AuthFailed`]. Returns plaintext bytes written.
pub async fn decrypt<W, R>(dst: &mut W, src: &mut R, password: &str) -> CodecResult<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
    R: AsyncRead + Unpin + ?Sized,
{
    let cipher = build_cipher(password)?;

    let mut magic = [0u8; ENC_MAGIC.len()];
    read_exact_frame(src, &mut magic, "missing stream header").await?;
    if &magic != ENC_MAGIC {
        return Err(CodecError::BadHeader);
    }

    let mut prefix = [0u8; NONCE_PREFIX_LEN];
    read_exact_frame(src, &mut prefix, "missing nonce prefix").await?;

    let mut nonce = [0u8; NONCE_LEN];
    nonce[..NONCE_PREFIX_LEN].copy_from_slice(&prefix);

    let mut len_buf = [0u8; 4];
    let mut counter: u32 = 0;
    let mut total = 0u64;
    loop {
        read_exact_frame(src, &mut len_buf, "stream ended without terminator").await?;
        let plain_len = u32::from_be_bytes(len_buf);
        if plain_len == 0 {
            break;
        }
        if plain_len > MAX_FRAME {
            return Err(CodecError::FrameTooLarge(plain_len, MAX_FRAME));
        }

        let mut ciphertext = vec![0u8; plain_len as usize + TAG_LEN];
        read_exact_frame(src, &mut ciphertext, "frame body cut short").await?;

        nonce[NONCE_PREFIX_LEN..].copy_from_slice(&counter.to_be_bytes());
        counter = counter.wrapping_add(1);

        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| CodecError::AuthFailed)?;
        dst.write_all(&plaintext).await?;
        total += plaintext.len() as u64;
    }

    dst.flush().await?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    async fn roundtrip(data: &[u8], password: &str) -> Vec<u8> {
        let mut encrypted = Vec::new();
        let mut src = data;
        encrypt(&mut encrypted, &mut src, password).await.unwrap();

        let mut decrypted = Vec::new();
        let mut enc_src = encrypted.as_slice();
        decrypt(&mut decrypted, &mut enc_src, password).await.unwrap();
        decrypted
    }

    #[tokio::test]
    async fn roundtrip_small() {
        let data = b"pg_dump says hello";
        assert_eq!(roundtrip(data, "pw").await, data);
    }

    #[tokio::test]
    async fn roundtrip_multi_frame() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(roundtrip(&data, "long passphrase").await, data);
    }

    #[tokio::test]
    async fn roundtrip_empty() {
        assert_eq!(roundtrip(b"", "pw").await, b"");
    }

    #[tokio::test]
    async fn header_layout() {
        let mut encrypted = Vec::new();
        let mut src: &[u8] = b"payload";
        encrypt(&mut encrypted, &mut src, "pw").await.unwrap();

        assert_eq!(&encrypted[..8], ENC_MAGIC);
        // terminator frame is the last four bytes
        assert_eq!(&encrypted[encrypted.len() - 4..], &[0, 0, 0, 0]);
        // first frame length equals the payload length
        assert_eq!(&encrypted[16..20], &7u32.to_be_bytes());
    }

    #[tokio::test]
    async fn wrong_password_fails_auth() {
        let mut encrypted = Vec::new();
        let mut src: &[u8] = b"secret";
        encrypt(&mut encrypted, &mut src, "right").await.unwrap();

        let mut out = Vec::new();
        let mut enc_src = encrypted.as_slice();
        let err = decrypt(&mut out, &mut enc_src, "wrong").await.unwrap_err();
        assert!(matches!(err, CodecError::AuthFailed));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn tampered_frame_fails_auth() {
        let mut encrypted = Vec::new();
        let mut src: &[u8] = b"secret";
        encrypt(&mut encrypted, &mut src, "pw").await.unwrap();
        let mid = encrypted.len() / 2;
        encrypted[mid] ^= 0xff;

        let mut out = Vec::new();
        let mut enc_src = encrypted.as_slice();
        let err = decrypt(&mut out, &mut enc_src, "pw").await.unwrap_err();
        assert!(matches!(err, CodecError::AuthFailed));
    }

    #[tokio::test]
    async fn missing_terminator_is_truncation() {
        let mut encrypted = Vec::new();
        let mut src: &[u8] = b"secret";
        encrypt(&mut encrypted, &mut src, "pw").await.unwrap();
        encrypted.truncate(encrypted.len() - 4);

        let mut out = Vec::new();
        let mut enc_src = encrypted.as_slice();
        let err = decrypt(&mut out, &mut enc_src, "pw").await.unwrap_err();
        assert!(matches!(err, CodecError::Truncated(_)));
    }

    #[tokio::test]
    async fn cut_frame_is_truncation_and_withholds_chunk() {
        let data: Vec<u8> = vec![0xAB; PLAIN_CHUNK + 17];
        let mut encrypted = Vec::new();
        let mut src = data.as_slice();
        encrypt(&mut encrypted, &mut src, "pw").await.unwrap();
        // chop into the middle of the second frame
        encrypted.truncate(encrypted.len() - 10);

        let mut out = Vec::new();
        let mut enc_src = encrypted.as_slice();
        let err = decrypt(&mut out, &mut enc_src, "pw").await.unwrap_err();
        assert!(matches!(err, CodecError::Truncated(_)));
        // only the first, fully authenticated frame may have been emitted
        assert_eq!(out.len(), PLAIN_CHUNK);
    }

    #[tokio::test]
    async fn bad_magic_rejected() {
        let mut out = Vec::new();
        let mut src: &[u8] = b"NOTMAGIC\x00\x00\x00\x00\x00\x00\x00\x00";
        let err = decrypt(&mut out, &mut src, "pw").await.unwrap_err();
        assert!(matches!(err, CodecError::BadHeader));
    }

    #[tokio::test]
    async fn empty_password_rejected() {
        let mut out = Vec::new();
        let mut src: &[u8] = b"data";
        assert!(matches!(
            encrypt(&mut out, &mut src, "").await.unwrap_err(),
            CodecError::EmptyPassword
        ));
        let mut src2: &[u8] = b"data";
        assert!(matches!(
            decrypt(&mut out, &mut src2, "").await.unwrap_err(),
            CodecError::EmptyPassword
        ));
    }

    #[tokio::test]
    async fn nonce_prefix_differs_between_invocations() {
        let mut a = Vec::new();
        let mut b = Vec::new();
        let mut src_a: &[u8] = b"same payload";
        let mut src_b: &[u8] = b"same payload";
        encrypt(&mut a, &mut src_a, "pw").await.unwrap();
        encrypt(&mut b, &mut src_b, "pw").await.unwrap();
        assert_ne!(&a[8..16], &b[8..16]);
        assert_ne!(a, b);
    }

    proptest! {
        #[test]
        fn prop_roundtrip(data in prop::collection::vec(any::<u8>(), 0..70_000)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap();
            let out = rt.block_on(roundtrip(&data, "prop-pw"));
            prop_assert_eq!(out, data);
        }
    }
}
