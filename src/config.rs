use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{FfdbError, Result};

/// Fixed salt used when an encrypted index declares no `salt=` in its header.
/// Kept for compatibility with indexes produced before the header carried
/// explicit KDF parameters.
pub const COMPAT_SALT: &[u8] = b"5ed3a4284d6a9c1e4e4f6b4729b254be";

/// PBKDF2 iteration count used when the index header declares none.
pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 100_000;

/// Default zlib compression level for entry compression.
pub const DEFAULT_COMPRESS_LEVEL: u32 = 9;

/// AES key size chosen at index time
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeySize {
    Aes128,
    Aes192,
    Aes256,
}

impl KeySize {
    pub fn bits(self) -> u32 {
        match self {
            KeySize::Aes128 => 128,
            KeySize::Aes192 => 192,
            KeySize::Aes256 => 256,
        }
    }

    pub fn key_len(self) -> usize {
        (self.bits() / 8) as usize
    }

    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            128 => Some(KeySize::Aes128),
            192 => Some(KeySize::Aes192),
            256 => Some(KeySize::Aes256),
            _ => None,
        }
    }
}

/// Per-entry codec stack declared by the index header.
///
/// Writing composes plaintext -> zlib -> aes; reading inverts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodecKind {
    #[default]
    None,
    Zlib,
    Aes,
    AesZlib,
}

impl CodecKind {
    pub fn compressed(self) -> bool {
        matches!(self, CodecKind::Zlib | CodecKind::AesZlib)
    }

    pub fn encrypted(self) -> bool {
        matches!(self, CodecKind::Aes | CodecKind::AesZlib)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CodecKind::None => "none",
            CodecKind::Zlib => "zlib",
            CodecKind::Aes => "aes",
            CodecKind::AesZlib => "aes+zlib",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(CodecKind::None),
            "zlib" => Ok(CodecKind::Zlib),
            "aes" => Ok(CodecKind::Aes),
            "aes+zlib" | "zlib+aes" => Ok(CodecKind::AesZlib),
            other => Err(FfdbError::UnsupportedCodec(format!(
                "unknown codec {other:?}"
            ))),
        }
    }

    pub fn from_flags(compress: bool, encrypt: bool) -> Self {
        match (compress, encrypt) {
            (false, false) => CodecKind::None,
            (true, false) => CodecKind::Zlib,
            (false, true) => CodecKind::Aes,
            (true, true) => CodecKind::AesZlib,
        }
    }
}

/// PBKDF2-HMAC-SHA256 parameters for passphrase key derivation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyParams {
    pub iterations: u32,
    pub salt: Vec<u8>,
}

impl Default for KeyParams {
    /// Compatibility parameters for headers that omit `iter=`/`salt=`.
    fn default() -> Self {
        Self {
            iterations: DEFAULT_PBKDF2_ITERATIONS,
            salt: COMPAT_SALT.to_vec(),
        }
    }
}

impl KeyParams {
    /// Fresh parameters for a new index: random 16-byte salt.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut salt = vec![0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        Self {
            iterations: DEFAULT_PBKDF2_ITERATIONS,
            salt,
        }
    }
}

/// How to resolve an identifier that maps to several entries
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DuplicatesPolicy {
    /// Entry appearing first in the flatfile (the default)
    #[default]
    First,
    /// Entry appearing last in the flatfile
    Last,
    /// Every matching entry, in flatfile order
    All,
}

/// Retry behaviour for remote byte sources
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Total attempts per request (default: 3)
    pub attempts: u32,
    /// First backoff delay; doubles per retry
    pub base_delay: Duration,
    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(100),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Parse a byte count with an optional SI-ish suffix: `40k`, `50M`, `1g`.
pub fn parse_byte_size(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(FfdbError::Usage("empty size".into()));
    }
    let lower = s.to_ascii_lowercase();
    let (digits, multiplier) = match lower.chars().last() {
        Some('k') => (&lower[..lower.len() - 1], 1u64 << 10),
        Some('m') => (&lower[..lower.len() - 1], 1u64 << 20),
        Some('g') => (&lower[..lower.len() - 1], 1u64 << 30),
        Some('t') => (&lower[..lower.len() - 1], 1u64 << 40),
        _ => (lower.as_str(), 1),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| FfdbError::Usage(format!("invalid size {s:?}")))?;
    Ok(value * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_byte_size() {
        assert_eq!(parse_byte_size("0").unwrap(), 0);
        assert_eq!(parse_byte_size("40k").unwrap(), 40 * 1024);
        assert_eq!(parse_byte_size("50M").unwrap(), 50 * 1024 * 1024);
        assert_eq!(parse_byte_size("1g").unwrap(), 1 << 30);
        assert!(parse_byte_size("abc").is_err());
    }

    #[test]
    fn test_codec_kind_roundtrip() {
        for kind in [
            CodecKind::None,
            CodecKind::Zlib,
            CodecKind::Aes,
            CodecKind::AesZlib,
        ] {
            assert_eq!(CodecKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(CodecKind::parse("lz4").is_err());
    }

    #[test]
    fn test_key_size_from_bits() {
        assert_eq!(KeySize::from_bits(256), Some(KeySize::Aes256));
        assert_eq!(KeySize::from_bits(512), None);
        assert_eq!(KeySize::Aes192.key_len(), 24);
    }
}
