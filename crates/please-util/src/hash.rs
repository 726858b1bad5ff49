//! Content hashing behind a single configurable algorithm.
//!
//! The fingerprint layer in `please_core` never hashes bytes directly; it
//! goes through a [`HashAlgorithm`] so that the choice of hash function is a
//! configuration concern, not something scattered across call sites.

use std::fmt;
use std::io::{self, Read};
use std::path::Path;

use base64::Engine as _;
use sha2::Digest;

/// The hash function used to compute rule and input fingerprints.
///
/// SHA-256 is the default: stable, well understood, and fast enough for
/// most repositories. BLAKE3 is offered for monorepos where hashing
/// throughput on the input closure starts to matter.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Default)]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Blake3,
}

impl HashAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Blake3 => "blake3",
        }
    }

    /// Hashes a sequence of byte slices, each fed into the digest in order.
    ///
    /// Callers pass slices rather than a single concatenated buffer so that
    /// canonical ordering (e.g. "rule hash, then each input in sorted
    /// order") is visible at the call site instead of being baked into an
    /// intermediate `Vec<u8>`.
    pub fn hash_parts<'a, I>(self, parts: I) -> Digest256
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        match self {
            HashAlgorithm::Sha256 => {
                let mut h = sha2::Sha256::new();
                for part in parts {
                    h.update(part);
                }
                Digest256(h.finalize().to_vec())
            }
            HashAlgorithm::Blake3 => {
                let mut h = blake3::Hasher::new();
                for part in parts {
                    h.update(part);
                }
                Digest256(h.finalize().as_bytes().to_vec())
            }
        }
    }

    /// Hashes the content of a file, streaming it in fixed-size chunks so
    /// that large generated artifacts don't need to be read into memory
    /// whole.
    pub fn hash_file(self, path: &Path) -> io::Result<Digest256> {
        let mut file = std::fs::File::open(path)?;
        let mut buf = [0u8; 64 * 1024];
        match self {
            HashAlgorithm::Sha256 => {
                let mut h = sha2::Sha256::new();
                loop {
                    let n = file.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    h.update(&buf[..n]);
                }
                Ok(Digest256(h.finalize().to_vec()))
            }
            HashAlgorithm::Blake3 => {
                let mut h = blake3::Hasher::new();
                loop {
                    let n = file.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    h.update(&buf[..n]);
                }
                Ok(Digest256(h.finalize().as_bytes().to_vec()))
            }
        }
    }
}

/// An opaque digest produced by a [`HashAlgorithm`].
///
/// Deliberately not `Copy`: digests can vary in length across algorithms,
/// and callers should treat them as opaque keys rather than reach into the
/// bytes.
#[derive(Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Digest256(Vec<u8>);

impl Digest256 {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn to_base64url(&self) -> String {
        base64::engine::general_purpose::URL_SAFE.encode(&self.0)
    }
}

impl fmt::Debug for Digest256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest256({})", self.to_hex())
    }
}

impl fmt::Display for Digest256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_is_deterministic() {
        let a = HashAlgorithm::Sha256.hash_parts([b"hello".as_slice(), b"world".as_slice()]);
        let b = HashAlgorithm::Sha256.hash_parts([b"hello".as_slice(), b"world".as_slice()]);
        assert_eq!(a, b);
    }

    #[test]
    fn different_algorithms_disagree() {
        let a = HashAlgorithm::Sha256.hash_parts([b"x".as_slice()]);
        let b = HashAlgorithm::Blake3.hash_parts([b"x".as_slice()]);
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn concatenation_order_matters() {
        let a = HashAlgorithm::Sha256.hash_parts([b"a".as_slice(), b"b".as_slice()]);
        let b = HashAlgorithm::Sha256.hash_parts([b"b".as_slice(), b"a".as_slice()]);
        assert_ne!(a, b);
    }

    #[test]
    fn base64url_has_no_padding_chars_that_break_paths() {
        let d = HashAlgorithm::Sha256.hash_parts([b"please".as_slice()]);
        let encoded = d.to_base64url();
        assert!(!encoded.contains('/'));
        assert!(!encoded.contains('+'));
    }

    #[test]
    fn hex_roundtrips_known_value() {
        let d = Digest256(vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(d.to_hex(), "deadbeef");
    }
}
