//! End-to-end encryption of file content.
//!
//! The receiver owns an RSA-OAEP (SHA-256) key pair and hands its public key
//! to the sender out of band. Each file gets a fresh AES-128-GCM key, wrapped
//! under that public key and carried in `MetaData.key`. Chunks travel as
//! `nonce (12 bytes) || ciphertext || tag`.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes128Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::fmt;

use crate::error::CryptoError;

/// Modulus size of generated key pairs
pub const RSA_KEY_BITS: usize = 1024;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const SYMMETRIC_KEY_LEN: usize = 16;

#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey(RsaPublicKey);

#[derive(Clone)]
pub struct PrivateKey(RsaPrivateKey);

#[derive(Clone)]
pub struct KeyPair {
    pub public: PublicKey,
    pub private: PrivateKey,
}

/// Per-file AES-128-GCM key
#[derive(Clone)]
pub struct SymmetricKey {
    key: Key<Aes128Gcm>,
    cipher: Aes128Gcm,
}

impl PublicKey {
    /// SubjectPublicKeyInfo DER, the same blob WebCrypto exports as `spki`
    pub fn to_der(&self) -> Result<Vec<u8>, CryptoError> {
        self.0
            .to_public_key_der()
            .map(|doc| doc.as_bytes().to_vec())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    pub fn from_der(der: &[u8]) -> Result<Self, CryptoError> {
        RsaPublicKey::from_public_key_der(der)
            .map(PublicKey)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    pub fn to_base64(&self) -> Result<String, CryptoError> {
        Ok(STANDARD.encode(self.to_der()?))
    }

    pub fn from_base64(text: &str) -> Result<Self, CryptoError> {
        let der = STANDARD
            .decode(text.trim())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Self::from_der(&der)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKey").field(&"rsa").finish()
    }
}

impl PrivateKey {
    pub fn to_pkcs8_der(&self) -> Result<Vec<u8>, CryptoError> {
        self.0
            .to_pkcs8_der()
            .map(|doc| doc.as_bytes().to_vec())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, CryptoError> {
        RsaPrivateKey::from_pkcs8_der(der)
            .map(PrivateKey)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(RsaPublicKey::from(&self.0))
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair").finish_non_exhaustive()
    }
}

impl SymmetricKey {
    pub fn from_bytes(raw: &[u8]) -> Result<Self, CryptoError> {
        if raw.len() != SYMMETRIC_KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "expected {} key bytes, got {}",
                SYMMETRIC_KEY_LEN,
                raw.len()
            )));
        }
        let key = *Key::<Aes128Gcm>::from_slice(raw);
        Ok(Self {
            cipher: Aes128Gcm::new(&key),
            key,
        })
    }

    /// Raw key bytes, as WebCrypto exports them with `raw`
    pub fn as_bytes(&self) -> &[u8] {
        self.key.as_slice()
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// Generate the receiver's key pair. Runs on the blocking pool: prime search
/// takes long enough to stall a single-threaded runtime.
pub async fn generate_key_pair() -> Result<KeyPair, CryptoError> {
    generate_key_pair_with_bits(RSA_KEY_BITS).await
}

pub async fn generate_key_pair_with_bits(bits: usize) -> Result<KeyPair, CryptoError> {
    let private = tokio::task::spawn_blocking(move || RsaPrivateKey::new(&mut OsRng, bits))
        .await
        .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?
        .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
    let public = RsaPublicKey::from(&private);
    Ok(KeyPair {
        public: PublicKey(public),
        private: PrivateKey(private),
    })
}

/// Fresh key for one file. Never reused across files.
pub fn generate_symmetric_key() -> SymmetricKey {
    let key = Aes128Gcm::generate_key(OsRng);
    SymmetricKey {
        cipher: Aes128Gcm::new(&key),
        key,
    }
}

/// Encrypt the raw symmetric key under the peer's public key (goes into `MetaData.key`)
pub fn wrap_symmetric_key(public: &PublicKey, key: &SymmetricKey) -> Result<Vec<u8>, CryptoError> {
    public
        .0
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), key.as_bytes())
        .map_err(|e| CryptoError::Wrap(e.to_string()))
}

pub fn unwrap_symmetric_key(private: &PrivateKey, wrapped: &[u8]) -> Result<SymmetricKey, CryptoError> {
    let raw = private
        .0
        .decrypt(Oaep::new::<Sha256>(), wrapped)
        .map_err(|e| CryptoError::Unwrap(e.to_string()))?;
    SymmetricKey::from_bytes(&raw)
}

/// `nonce || ciphertext`, with a fresh random nonce on every call
pub fn encrypt_chunk(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let nonce = Aes128Gcm::generate_nonce(&mut OsRng);
    let ciphertext = key
        .cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CryptoError::Encrypt)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn decrypt_chunk(key: &SymmetricKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::CiphertextTooShort(data.len()));
    }
    let (nonce, ciphertext) = data.split_at(NONCE_LEN);
    key.cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}
