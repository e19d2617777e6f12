use std::io;
use thiserror::Error;

use crate::codec::Compression;

/// Errors raised by the compression codecs.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The input is structurally invalid for the codec.
    #[error("malformed {kind} payload: {reason}")]
    Format {
        kind: Compression,
        reason: String,
    },

    /// The LZ4 output buffer could not hold the decompressed payload.
    #[error("lz4 output buffer of {capacity} bytes is too small")]
    Capacity { capacity: usize },

    /// The decompressed payload would exceed the size limit.
    #[error("decompressed length {length} exceeds the limit of {limit} bytes")]
    TooLarge { length: usize, limit: usize },
}

impl CodecError {
    pub(crate) fn format(kind: Compression, reason: impl ToString) -> Self {
        CodecError::Format {
            kind,
            reason: reason.to_string(),
        }
    }
}

/// Errors raised by the cipher primitives and key handling.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AES keys must be 16, 24 or 32 bytes.
    #[error("invalid aes key length: {0} bytes")]
    KeyLength(usize),

    /// Ciphertext is not a whole number of AES blocks.
    #[error("aes ciphertext length {0} is not a multiple of the block size")]
    BlockLength(usize),

    /// PKCS#7 padding did not check out after decryption.
    #[error("aes padding is invalid")]
    Padding,

    #[error("rsa: {0}")]
    Rsa(#[from] rsa::Error),

    /// An RSA ciphertext block does not match the modulus.
    #[error("rsa block of {0} bytes does not fit the key")]
    RsaBlock(usize),

    /// A block opened with the public key lacks the private-key padding.
    #[error("rsa block padding is invalid")]
    RsaPadding,

    #[error("rsa key encoding: {0}")]
    KeyEncoding(String),

    #[error("base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("hex: {0}")]
    Hex(#[from] hex::FromHexError),

    /// The hybrid step was requested but no wrapped key travelled with the payload.
    #[error("hybrid step without a wrapped key")]
    MissingWrappedKey,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Anything that can go wrong inside the transform chain.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// A character in the encryption chain names no known step.
    #[error("unknown encryption step {0:?}")]
    UnknownStep(char),

    /// A negotiation header carries a value that cannot be interpreted.
    #[error("invalid {name} header: {value:?}")]
    Header { name: &'static str, value: String },
}

/// Errors mapping structured values to and from bodies.
#[derive(Debug, Error)]
pub enum ContentError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cbor: {0}")]
    Cbor(String),

    #[error("body is not valid utf-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

/// Errors raised by the handler pools.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The handler type cannot produce an instance. This is a wiring mistake.
    #[error("handler type {type_name} cannot be constructed: {reason}")]
    Construction {
        type_name: &'static str,
        reason: String,
    },

    /// Error when a mutex lock becomes poisoned due to a panic in another thread
    #[error("mutex lock poisoned")]
    LockPoisoned,
}

/// Route lookups never fail a request; the dispatcher falls back to the default handler.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("no route for {0}")]
    Unmapped(String),

    #[error("invalid route {path}: {reason}")]
    Insert { path: String, reason: String },
}

/// Represents errors that can occur in the blocking worker pool.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Error when a mutex lock becomes poisoned due to a panic in another thread
    #[error("mutex lock poisoned")]
    LockPoisoned,

    /// Error when spawning a new thread fails
    #[error("thread spawn failed: {0}")]
    ThreadSpawn(io::Error),

    /// The job was dropped before it produced a reply.
    #[error("job was dropped before completing")]
    Canceled,
}

/// Errors that stop the server from starting or running.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("key material: {0}")]
    Crypto(#[from] CryptoError),

    #[error("route table: {0}")]
    Route(#[from] RouteError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Type alias for Results using ExecutorError as the error type
pub type Result<T> = std::result::Result<T, ExecutorError>;

pub type CodecResult<T> = std::result::Result<T, CodecError>;

pub type CryptoResult<T> = std::result::Result<T, CryptoError>;

pub type PoolResult<T> = std::result::Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests the formatting of codec errors, which end up in warn logs.
    #[test]
    fn test_codec_error_display() {
        let err = CodecError::format(Compression::Gzip, "bad header");
        assert_eq!(err.to_string(), "malformed gzip payload: bad header");

        let err = CodecError::Capacity { capacity: 50 };
        assert_eq!(err.to_string(), "lz4 output buffer of 50 bytes is too small");
    }

    /// Tests that codec and crypto errors fold into TransformError unchanged.
    #[test]
    fn test_transform_error_conversion() {
        let err = TransformError::from(CodecError::Capacity { capacity: 1 });
        assert!(matches!(err, TransformError::Codec(CodecError::Capacity { .. })));
        assert_eq!(err.to_string(), "lz4 output buffer of 1 bytes is too small");

        let err = TransformError::from(CryptoError::MissingWrappedKey);
        assert!(matches!(err, TransformError::Crypto(_)));
    }

    /// Tests the automatic conversion from io::Error to ServerError
    #[test]
    fn test_server_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::Other, "test error");
        let err = ServerError::from(io_err);

        assert!(matches!(err, ServerError::Io(_)));
        assert_eq!(err.to_string(), "io error: test error");
    }
}
