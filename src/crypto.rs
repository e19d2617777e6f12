//! Cipher primitives behind the transform chain.
//!
//! AES runs in ECB mode with PKCS#7 padding and no IV, keyed directly by the bytes
//! of a passphrase. RSA uses PKCS#1 v1.5 and processes payloads block by block so
//! that any length can be encrypted. The server seals with its private key and
//! clients with the public key, see [`KeyRole`]. These are wire-compatibility choices and
//! provide no more strength than the primitives themselves.

use std::fmt;
use std::path::Path;

use aes::{Aes128, Aes192, Aes256};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ecb::cipher::block_padding::Pkcs7;
use ecb::cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit};
use rand::distributions::Alphanumeric;
use rand::Rng;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};

use crate::error::{CryptoError, CryptoResult};

/// The shared passphrase deployed clients were built with.
///
/// Weak by construction; override it through configuration.
pub const LEGACY_AES_PASSPHRASE: &str = "xyzG7FBook9OverZ";

/// Length of the alphanumeric per-message keys used by the hybrid step.
pub const MESSAGE_KEY_LEN: usize = 16;

const AES_BLOCK: usize = 16;

/// PKCS#1 v1.5 overhead per encrypted block.
const PKCS1_OVERHEAD: usize = 11;

const LEGACY_RSA_MODULUS: &str = "6912060769967909665747229577748486878584118041454730994790740440917251733833292356102546466418655717490140587808347980414374545347276788402037864864794123";
const LEGACY_RSA_PRIVATE_EXPONENT: &str = "6364259624977853318891390732106702224917244228077312547395481185075144138039461420260483980363741724467902776024236460630716647921826962535465529587263233";
const LEGACY_RSA_PUBLIC_EXPONENT: u32 = 65537;

/// AES/ECB/PKCS#7 keyed by raw key bytes.
pub struct Aes;

macro_rules! ecb_by_key_len {
    ($key:expr, $cipher:ident => $body:expr) => {
        match $key.len() {
            16 => {
                type $cipher = Aes128;
                $body
            }
            24 => {
                type $cipher = Aes192;
                $body
            }
            32 => {
                type $cipher = Aes256;
                $body
            }
            other => Err(CryptoError::KeyLength(other)),
        }
    };
}

impl Aes {
    pub fn encrypt(key: &[u8], data: &[u8]) -> CryptoResult<Vec<u8>> {
        ecb_by_key_len!(key, C => {
            let enc = ecb::Encryptor::<C>::new_from_slice(key)
                .map_err(|_| CryptoError::KeyLength(key.len()))?;
            Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(data))
        })
    }

    pub fn decrypt(key: &[u8], data: &[u8]) -> CryptoResult<Vec<u8>> {
        if data.is_empty() || data.len() % AES_BLOCK != 0 {
            return Err(CryptoError::BlockLength(data.len()));
        }
        ecb_by_key_len!(key, C => {
            let dec = ecb::Decryptor::<C>::new_from_slice(key)
                .map_err(|_| CryptoError::KeyLength(key.len()))?;
            dec.decrypt_padded_vec_mut::<Pkcs7>(data)
                .map_err(|_| CryptoError::Padding)
        })
    }

    /// A fresh 128-bit key made of ASCII letters and digits.
    pub fn gen_alpha_num_key() -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(MESSAGE_KEY_LEN)
            .map(char::from)
            .collect()
    }
}

/// Which half of an RSA keypair a party holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRole {
    /// Holds the private key. Seals with it and opens what clients sealed.
    Server,
    /// Holds only the public key. Seals with it and opens what the server sealed.
    Client,
}

/// RSA key material shared read-only by every request.
///
/// The direction of every operation follows the role. A server seals with its
/// private key (PKCS#1 v1.5 block type 1) so that any public-key holder can
/// open the result. A client seals with the public key (block type 2) so that
/// only the server can open it.
#[derive(Clone)]
pub struct RsaKeys {
    private: Option<RsaPrivateKey>,
    public: RsaPublicKey,
}

impl RsaKeys {
    pub fn new(private: RsaPrivateKey) -> Self {
        let public = RsaPublicKey::from(&private);
        RsaKeys {
            private: Some(private),
            public,
        }
    }

    /// Client-side keys: the public half only.
    pub fn public_only(public: RsaPublicKey) -> Self {
        RsaKeys {
            private: None,
            public,
        }
    }

    /// Generates a fresh keypair of `bits`.
    pub fn generate(bits: usize) -> CryptoResult<Self> {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), bits)?;
        Ok(RsaKeys::new(private))
    }

    /// Rebuilds the fixed 512-bit keypair of the legacy deployment from its
    /// modulus and exponents.
    pub fn legacy() -> CryptoResult<Self> {
        let parse = |s: &str| {
            BigUint::parse_bytes(s.as_bytes(), 10)
                .ok_or_else(|| CryptoError::KeyEncoding(format!("not a decimal integer: {s}")))
        };
        let n = parse(LEGACY_RSA_MODULUS)?;
        let d = parse(LEGACY_RSA_PRIVATE_EXPONENT)?;
        let e = BigUint::from(LEGACY_RSA_PUBLIC_EXPONENT);
        let private = RsaPrivateKey::from_components(n, e, d, Vec::new())?;
        Ok(RsaKeys::new(private))
    }

    /// Parses a PEM private key, PKCS#8 first, then PKCS#1.
    pub fn from_pem(pem: &str) -> CryptoResult<Self> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| e.to_string())
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem).map_err(|e| e.to_string()))
            .map_err(CryptoError::KeyEncoding)?;
        Ok(RsaKeys::new(private))
    }

    /// Parses a PEM public key, SPKI first, then PKCS#1.
    pub fn from_public_pem(pem: &str) -> CryptoResult<Self> {
        let public = RsaPublicKey::from_public_key_pem(pem)
            .map_err(|e| e.to_string())
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem).map_err(|e| e.to_string()))
            .map_err(CryptoError::KeyEncoding)?;
        Ok(RsaKeys::public_only(public))
    }

    pub fn from_pem_file(path: impl AsRef<Path>) -> CryptoResult<Self> {
        let pem = std::fs::read_to_string(path)?;
        RsaKeys::from_pem(&pem)
    }

    pub fn role(&self) -> KeyRole {
        match self.private {
            Some(_) => KeyRole::Server,
            None => KeyRole::Client,
        }
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    /// The same keys with the private half dropped.
    pub fn to_public(&self) -> RsaKeys {
        RsaKeys::public_only(self.public.clone())
    }

    /// Modulus size in bytes.
    pub fn size(&self) -> usize {
        self.public.size()
    }

    /// Seals `data` for the other role, `size() - 11` plaintext bytes per block.
    pub fn encrypt(&self, data: &[u8]) -> CryptoResult<Vec<u8>> {
        let chunk = self.size() - PKCS1_OVERHEAD;
        let mut out = Vec::with_capacity((data.len() / chunk + 1) * self.size());
        for block in data.chunks(chunk) {
            out.extend(self.seal_block(block)?);
        }
        Ok(out)
    }

    /// Opens what the other role sealed, one modulus-sized block at a time.
    pub fn decrypt(&self, data: &[u8]) -> CryptoResult<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len());
        for block in data.chunks(self.size()) {
            out.extend(self.open_block(block)?);
        }
        Ok(out)
    }

    /// Wraps a symmetric key for the other role.
    pub fn wrap_key(&self, key: &[u8]) -> CryptoResult<Vec<u8>> {
        self.seal_block(key)
    }

    pub fn unwrap_key(&self, wrapped: &[u8]) -> CryptoResult<Vec<u8>> {
        self.open_block(wrapped)
    }

    fn seal_block(&self, block: &[u8]) -> CryptoResult<Vec<u8>> {
        let mut rng = rand::thread_rng();
        Ok(match &self.private {
            Some(private) => {
                private.sign_with_rng(&mut rng, Pkcs1v15Sign::new_unprefixed(), block)?
            }
            None => self.public.encrypt(&mut rng, Pkcs1v15Encrypt, block)?,
        })
    }

    fn open_block(&self, block: &[u8]) -> CryptoResult<Vec<u8>> {
        match &self.private {
            Some(private) => Ok(private.decrypt(Pkcs1v15Encrypt, block)?),
            None => open_with_public(&self.public, block),
        }
    }
}

/// Raw public-key operation followed by removal of block type 1 padding:
/// `00 01 FF..FF 00 data`, with at least eight `FF` bytes.
fn open_with_public(public: &RsaPublicKey, block: &[u8]) -> CryptoResult<Vec<u8>> {
    let k = public.size();
    if block.len() != k {
        return Err(CryptoError::RsaBlock(block.len()));
    }
    let c = BigUint::from_bytes_be(block);
    if c >= *public.n() {
        return Err(CryptoError::RsaBlock(block.len()));
    }
    let m = c.modpow(public.e(), public.n()).to_bytes_be();
    let mut em = vec![0u8; k.saturating_sub(m.len())];
    em.extend_from_slice(&m);

    if em.len() < PKCS1_OVERHEAD || em[0] != 0x00 || em[1] != 0x01 {
        return Err(CryptoError::RsaPadding);
    }
    let fill = em[2..].iter().take_while(|&&b| b == 0xff).count();
    let separator = 2 + fill;
    if fill < 8 || em.get(separator) != Some(&0x00) {
        return Err(CryptoError::RsaPadding);
    }
    Ok(em[separator + 1..].to_vec())
}

impl fmt::Debug for RsaKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsaKeys")
            .field("role", &self.role())
            .field("bits", &(self.size() * 8))
            .finish_non_exhaustive()
    }
}

/// Key material handed to the transform engine at construction.
///
/// Read-only after startup, so it is shared across workers without locking.
#[derive(Clone)]
pub struct KeyRing {
    aes_passphrase: Vec<u8>,
    rsa: RsaKeys,
}

impl KeyRing {
    pub fn new(aes_passphrase: impl Into<Vec<u8>>, rsa: RsaKeys) -> Self {
        KeyRing {
            aes_passphrase: aes_passphrase.into(),
            rsa,
        }
    }

    /// The legacy passphrase and keypair.
    pub fn legacy() -> CryptoResult<Self> {
        Ok(KeyRing::new(LEGACY_AES_PASSPHRASE, RsaKeys::legacy()?))
    }

    pub fn aes_passphrase(&self) -> &[u8] {
        &self.aes_passphrase
    }

    pub fn rsa(&self) -> &RsaKeys {
        &self.rsa
    }

    /// The ring a client of this server holds: same passphrase, public key only.
    pub fn client_ring(&self) -> KeyRing {
        KeyRing::new(self.aes_passphrase.clone(), self.rsa.to_public())
    }

    /// Fresh per-message key, AES-encrypts `data` with it and wraps the key.
    /// Returns the ciphertext and the base64 text of the wrapped key.
    pub fn hybrid_encrypt(&self, data: &[u8]) -> CryptoResult<(Vec<u8>, String)> {
        let key = Aes::gen_alpha_num_key();
        let sealed = Aes::encrypt(key.as_bytes(), data)?;
        let wrapped = self.rsa.wrap_key(key.as_bytes())?;
        Ok((sealed, STANDARD.encode(wrapped)))
    }

    pub fn hybrid_decrypt(&self, data: &[u8], wrapped_key: &str) -> CryptoResult<Vec<u8>> {
        let wrapped = STANDARD.decode(wrapped_key.trim())?;
        let key = self.rsa.unwrap_key(&wrapped)?;
        Aes::decrypt(&key, data)
    }
}

impl fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRing")
            .field("aes_passphrase", &"<redacted>")
            .field("rsa", &self.rsa)
            .finish()
    }
}
