#![warn(missing_docs)]

//! dbvault streaming codecs: framed AES-256-GCM encryption, gzip, and
//! content sniffing for backup artifacts.
//!
//! Encode path: dump stream → [gzip] → [encrypt] → artifact bytes.
//! Decode path: artifact bytes → sniff → [decrypt] → sniff → [gunzip] → dump stream.

pub mod aead;
pub mod error;
pub mod gzip;
pub mod sniff;

pub use aead::{decrypt, encrypt, ENC_MAGIC};
pub use error::CodecError;
pub use gzip::{gunzip, gzip};
pub use sniff::{
    artifact_suffix, expected_ext, expected_raw_kind, sniff_decoded, sniff_leading, sniff_raw,
    DecodedKind, LeadingKind, Peek, RawKind, ARCHIVE_MAGIC, GZIP_MAGIC,
};
