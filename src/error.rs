use thiserror::Error;

/// Main error type for ffdb operations
#[derive(Error, Debug)]
pub enum FfdbError {
    #[error("Usage error: {0}")]
    Usage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server does not support byte-range requests: {url}")]
    RangeUnsupported { url: String },

    #[error("Index is not sorted at line {line}: {identifier:?} sorts before the preceding identifier")]
    UnsortedIndex { line: u64, identifier: String },

    #[error("Malformed index record at line {line}: {reason}")]
    IndexFormat { line: u64, reason: String },

    #[error("Bad passphrase: entry failed to decrypt")]
    BadPassphrase,

    #[error("Corrupt entry for identifier {0}: checksum mismatch")]
    CorruptEntry(String),

    #[error("Unsupported codec configuration: {0}")]
    UnsupportedCodec(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for ffdb operations
pub type Result<T> = std::result::Result<T, FfdbError>;

impl FfdbError {
    /// Process exit code for this error.
    ///
    /// 1 = usage, 2 = IO/network, 3 = integrity (bad passphrase,
    /// checksum mismatch, corrupt or unsupported index).
    pub fn exit_code(&self) -> i32 {
        match self {
            FfdbError::Usage(_) => 1,
            FfdbError::Io(_) | FfdbError::Http(_) | FfdbError::RangeUnsupported { .. } => 2,
            FfdbError::UnsortedIndex { .. }
            | FfdbError::IndexFormat { .. }
            | FfdbError::BadPassphrase
            | FfdbError::CorruptEntry(_)
            | FfdbError::UnsupportedCodec(_) => 3,
            FfdbError::Internal(_) => 2,
        }
    }

    /// Check if this error indicates data that failed an integrity check
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            FfdbError::BadPassphrase | FfdbError::CorruptEntry(_) | FfdbError::UnsortedIndex { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(FfdbError::Usage("bad flag".into()).exit_code(), 1);
        assert_eq!(FfdbError::BadPassphrase.exit_code(), 3);
        assert_eq!(
            FfdbError::RangeUnsupported {
                url: "http://x".into()
            }
            .exit_code(),
            2
        );
    }

    #[test]
    fn test_integrity_predicate() {
        assert!(FfdbError::BadPassphrase.is_integrity());
        assert!(FfdbError::CorruptEntry("Q12345".into()).is_integrity());
        assert!(!FfdbError::Usage("x".into()).is_integrity());
    }
}
