//! The transform chain: compression first, then an ordered list of encryption
//! steps, described to the peer through negotiation headers.
//!
//! Encoding and decoding are fail-open. Any codec or cipher failure yields
//! [`Degraded`], which hands back the untouched input so that the caller can
//! carry on with it instead of failing the request.

use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hyper::header::{HeaderMap, HeaderValue};

use crate::codec::{Compression, MAX_DECOMPRESSED_LEN};
use crate::crypto::{Aes, KeyRing};
use crate::error::{CryptoError, TransformError};
use crate::http::{names, Bytes};

/// One encryption step, named on the wire by a single character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptStep {
    /// `a`: AES with the shared passphrase.
    Aes,
    /// `b`: base64 armor.
    Base64,
    /// `c`: AES with a fresh per-message key, the key RSA-wrapped into `Encrypt-Key`.
    AesRsa,
    /// `r`: RSA directly over the payload.
    Rsa,
    /// `h`: hex armor.
    Hex,
}

impl EncryptStep {
    pub fn from_code(code: char) -> Option<EncryptStep> {
        match code {
            'a' => Some(EncryptStep::Aes),
            'b' => Some(EncryptStep::Base64),
            'c' => Some(EncryptStep::AesRsa),
            'r' => Some(EncryptStep::Rsa),
            'h' => Some(EncryptStep::Hex),
            _ => None,
        }
    }

    pub fn code(self) -> char {
        match self {
            EncryptStep::Aes => 'a',
            EncryptStep::Base64 => 'b',
            EncryptStep::AesRsa => 'c',
            EncryptStep::Rsa => 'r',
            EncryptStep::Hex => 'h',
        }
    }

    /// Parses a chain string in application order. Order matters: `"ab"` is not `"ba"`.
    pub fn parse_chain(chain: &str) -> Result<Vec<EncryptStep>, TransformError> {
        chain
            .chars()
            .map(|c| EncryptStep::from_code(c).ok_or(TransformError::UnknownStep(c)))
            .collect()
    }
}

/// A payload together with everything needed to reverse its transforms.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContentEnvelope {
    pub payload: Bytes,
    /// Encryption codes in the order they were applied. Empty means none.
    pub encrypt_chain: String,
    /// Base64 of the wrapped per-message key, present when the hybrid step ran.
    pub wrapped_key: Option<String>,
    /// Applied before any encryption and undone after all decryption.
    pub compression: Compression,
    /// Pre-compression length; only meaningful for LZ4.
    pub original_length: Option<usize>,
}

impl ContentEnvelope {
    /// An envelope describing an untransformed payload.
    pub fn plain(payload: impl Into<Bytes>) -> Self {
        ContentEnvelope {
            payload: payload.into(),
            ..ContentEnvelope::default()
        }
    }

    /// Whether any compression or encryption is described.
    pub fn is_transformed(&self) -> bool {
        !self.encrypt_chain.is_empty() || !self.compression.is_none()
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Reads the negotiation headers. The payload is left empty.
    ///
    /// A missing header means "not applied". `Original-Length` is only read
    /// for LZ4, and `Encrypt-Key` only when the chain contains the hybrid step.
    /// An `Original-Length` above [`MAX_DECOMPRESSED_LEN`] is rejected.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, TransformError> {
        let text = |name| header_text(headers, name);

        let encrypt_chain = text(names::ORIGINAL_ENCRYPT)?.unwrap_or_default().to_owned();

        let wrapped_key = if encrypt_chain.contains(EncryptStep::AesRsa.code()) {
            text(names::ENCRYPT_KEY)?.map(str::to_owned)
        } else {
            None
        };

        let compression = match text(names::ORIGINAL_ENCODING)? {
            None => Compression::None,
            Some(raw) => raw
                .parse::<u8>()
                .ok()
                .and_then(Compression::from_code)
                .ok_or_else(|| TransformError::Header {
                    name: names::ORIGINAL_ENCODING,
                    value: raw.to_owned(),
                })?,
        };

        let original_length = match text(names::ORIGINAL_LENGTH)? {
            Some(raw) if compression.needs_original_length() => Some(
                raw.parse::<usize>()
                    .ok()
                    .filter(|&len| len <= MAX_DECOMPRESSED_LEN)
                    .ok_or_else(|| TransformError::Header {
                        name: names::ORIGINAL_LENGTH,
                        value: raw.to_owned(),
                    })?,
            ),
            _ => None,
        };

        Ok(ContentEnvelope {
            payload: Bytes::new(),
            encrypt_chain,
            wrapped_key,
            compression,
            original_length,
        })
    }

    /// Writes the negotiation headers that describe this envelope.
    pub fn write_headers(&self, headers: &mut HeaderMap) {
        if !self.encrypt_chain.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&self.encrypt_chain) {
                headers.insert(names::ORIGINAL_ENCRYPT, value);
            }
        }
        if let Some(value) = self
            .wrapped_key
            .as_deref()
            .and_then(|k| HeaderValue::from_str(k).ok())
        {
            headers.insert(names::ENCRYPT_KEY, value);
        }
        if !self.compression.is_none() {
            headers.insert(
                names::ORIGINAL_ENCODING,
                HeaderValue::from(u16::from(self.compression.code())),
            );
        }
        if self.compression.needs_original_length() {
            if let Some(len) = self.original_length {
                headers.insert(names::ORIGINAL_LENGTH, HeaderValue::from(len));
            }
        }
    }
}

/// Trimmed header text; blank counts as absent.
fn header_text<'a>(
    headers: &'a HeaderMap,
    name: &'static str,
) -> Result<Option<&'a str>, TransformError> {
    match headers.get(name) {
        None => Ok(None),
        Some(v) => v
            .to_str()
            .map(|s| Some(s.trim()).filter(|s| !s.is_empty()))
            .map_err(|_| TransformError::Header {
                name,
                value: String::from_utf8_lossy(v.as_bytes()).into_owned(),
            }),
    }
}

/// A transform that failed. `payload` is the input, untouched.
#[derive(Debug)]
pub struct Degraded {
    pub payload: Bytes,
    pub error: TransformError,
}

impl fmt::Display for Degraded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transform degraded to pass-through: {}", self.error)
    }
}

/// Either the transformed value or the untouched input.
pub type Transformed<T> = Result<T, Degraded>;

/// Applies and reverses transform chains with shared, read-only key material.
#[derive(Debug, Clone)]
pub struct TransformEngine {
    keys: Arc<KeyRing>,
}

impl TransformEngine {
    pub fn new(keys: KeyRing) -> Self {
        TransformEngine {
            keys: Arc::new(keys),
        }
    }

    pub fn keys(&self) -> &KeyRing {
        &self.keys
    }

    /// Compresses `data` when it is at least `min_size` bytes long and a
    /// compression kind is requested, then applies `encrypt_chain` left to right.
    ///
    /// The returned envelope reports what was actually applied: a payload that
    /// was too small to compress comes back with [`Compression::None`].
    pub fn encode(
        &self,
        data: Bytes,
        encrypt_chain: &str,
        compression: Compression,
        min_size: usize,
    ) -> Transformed<ContentEnvelope> {
        self.try_encode(&data, encrypt_chain, compression, min_size)
            .map_err(|error| Degraded {
                payload: data,
                error,
            })
    }

    fn try_encode(
        &self,
        data: &Bytes,
        encrypt_chain: &str,
        compression: Compression,
        min_size: usize,
    ) -> Result<ContentEnvelope, TransformError> {
        let steps = EncryptStep::parse_chain(encrypt_chain)?;

        let mut envelope = ContentEnvelope {
            encrypt_chain: encrypt_chain.to_owned(),
            ..ContentEnvelope::default()
        };

        let mut out: Option<Vec<u8>> = None;
        if !compression.is_none() && data.len() >= min_size {
            out = Some(compression.compress(data)?);
            envelope.compression = compression;
            if compression.needs_original_length() {
                envelope.original_length = Some(data.len());
            }
        }

        for step in steps {
            let input: &[u8] = out.as_deref().unwrap_or(data);
            let next = match step {
                EncryptStep::Aes => Aes::encrypt(self.keys.aes_passphrase(), input)?,
                EncryptStep::Base64 => STANDARD.encode(input).into_bytes(),
                EncryptStep::AesRsa => {
                    let (sealed, wrapped) = self.keys.hybrid_encrypt(input)?;
                    envelope.wrapped_key = Some(wrapped);
                    sealed
                }
                EncryptStep::Rsa => self.keys.rsa().encrypt(input)?,
                EncryptStep::Hex => hex::encode(input).into_bytes(),
            };
            out = Some(next);
        }

        envelope.payload = out.map(Bytes::from).unwrap_or_else(|| data.clone());
        Ok(envelope)
    }

    /// Reverses the encryption chain right to left, then decompresses.
    ///
    /// An empty chain with no compression returns the payload as is.
    pub fn decode(&self, envelope: &ContentEnvelope) -> Transformed<Bytes> {
        if !envelope.is_transformed() {
            return Ok(envelope.payload.clone());
        }
        self.try_decode(envelope).map_err(|error| Degraded {
            payload: envelope.payload.clone(),
            error,
        })
    }

    fn try_decode(&self, envelope: &ContentEnvelope) -> Result<Bytes, TransformError> {
        let steps = EncryptStep::parse_chain(&envelope.encrypt_chain)?;

        let mut data = envelope.payload.to_vec();
        for step in steps.into_iter().rev() {
            data = match step {
                EncryptStep::Aes => Aes::decrypt(self.keys.aes_passphrase(), &data)?,
                EncryptStep::Base64 => STANDARD.decode(&data).map_err(CryptoError::from)?,
                EncryptStep::AesRsa => {
                    let wrapped = envelope
                        .wrapped_key
                        .as_deref()
                        .ok_or(CryptoError::MissingWrappedKey)?;
                    self.keys.hybrid_decrypt(&data, wrapped)?
                }
                EncryptStep::Rsa => self.keys.rsa().decrypt(&data)?,
                EncryptStep::Hex => hex::decode(&data).map_err(CryptoError::from)?,
            };
        }

        if !envelope.compression.is_none() {
            data = envelope
                .compression
                .decompress(&data, envelope.original_length)?;
        }
        Ok(Bytes::from(data))
    }
}
