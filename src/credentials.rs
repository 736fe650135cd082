//! Session credential: RSA-wrapped AES envelopes and HMAC request signing.
//!
//! DESIGN
//! ======
//! One `Credential` lives for the whole client, across reconnects. It holds
//! an ephemeral AES-256 key and IV, the server's RSA public key (set at
//! preflight) and the shared HMAC secret (set after login).
//!
//! - Pre-authentication calls are wrapped as `{req:"encrypted",iv,rsa,aes}`:
//!   the AES key is RSA-PKCS1v15 encrypted for the server, the body is
//!   AES-256-CBC/PKCS7 encrypted with that key.
//! - Once the secret exists, calls are sent as
//!   `base64(HMAC-SHA256(secret, body)) ++ body`.
//!
//! The login response's `secret` field is AES-CBC encrypted with the key and
//! IV of the most recent envelope, so [`KeyRotation::PerRequest`] rotates
//! before encrypting and never after.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use aes::Aes256;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use cbc::cipher::block_padding::{NoPadding, Pkcs7};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use frames::EncryptedEnvelope;
use hmac::{Hmac, Mac};
use rand::Rng;
use rsa::pkcs8::{Document, SubjectPublicKeyInfoRef};
use rsa::pkcs8::der::Decode;
use rsa::{Pkcs1v15Encrypt, RsaPublicKey};
use sha2::Sha256;

use crate::error::{CryptoError, Error};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

pub const AES_KEY_LEN: usize = 32;
pub const AES_IV_LEN: usize = 16;
pub const SECRET_LEN: usize = 16;

const KEY_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

// =============================================================================
// KEY ROTATION
// =============================================================================

/// How often the AES key and IV are regenerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyRotation {
    /// One key/IV pair for the credential's lifetime.
    #[default]
    PerCredential,
    /// A fresh key/IV pair for every encrypted envelope.
    PerRequest,
}

#[derive(Clone)]
struct SessionKey {
    key: [u8; AES_KEY_LEN],
    iv: [u8; AES_IV_LEN],
}

impl SessionKey {
    /// The key is drawn from an alphanumeric alphabet; the appliance treats
    /// it as text once RSA-unwrapped.
    fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut key = [0_u8; AES_KEY_LEN];
        for byte in &mut key {
            *byte = KEY_ALPHABET[rng.gen_range(0..KEY_ALPHABET.len())];
        }
        Self { key, iv: rng.r#gen() }
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256CbcEnc::new_from_slices(&self.key, &self.iv)
            .map_err(|e| CryptoError::Cipher(e.to_string()))?;
        Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
    }

    fn decrypt_raw(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256CbcDec::new_from_slices(&self.key, &self.iv)
            .map_err(|e| CryptoError::Cipher(e.to_string()))?;
        cipher
            .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
            .map_err(|e| CryptoError::Cipher(e.to_string()))
    }
}

// =============================================================================
// CREDENTIAL
// =============================================================================

struct CryptoSession {
    key: SessionKey,
    public_key: Option<RsaPublicKey>,
    secret: Option<[u8; SECRET_LEN]>,
}

/// Hybrid encryption and signing state shared by every connection of a client.
pub struct Credential {
    rotation: KeyRotation,
    session: RwLock<CryptoSession>,
}

impl Credential {
    #[must_use]
    pub fn new(rotation: KeyRotation) -> Self {
        Self {
            rotation,
            session: RwLock::new(CryptoSession { key: SessionKey::generate(), public_key: None, secret: None }),
        }
    }

    #[must_use]
    pub fn rotation(&self) -> KeyRotation {
        self.rotation
    }

    /// Parse and store the server's PEM `PUBLIC KEY`.
    ///
    /// # Errors
    ///
    /// [`CryptoError::InvalidPem`] for a missing or mislabelled block,
    /// [`CryptoError::NotRsa`] when the key algorithm is not RSA.
    pub fn set_public_key(&self, pem: &str) -> Result<(), CryptoError> {
        let key = parse_public_key(pem)?;
        self.write().public_key = Some(key);
        Ok(())
    }

    #[must_use]
    pub fn has_public_key(&self) -> bool {
        self.read().public_key.is_some()
    }

    /// Decrypt the login response's `secret` and keep its first 16 bytes.
    ///
    /// # Errors
    ///
    /// Fails on bad base64, a ciphertext that is not block aligned, or a
    /// plaintext shorter than 16 bytes.
    pub fn set_secret(&self, encoded: &str) -> Result<(), CryptoError> {
        let ciphertext = STANDARD.decode(encoded.trim())?;
        let mut session = self.write();
        let plaintext = session.key.decrypt_raw(&ciphertext)?;
        let secret: [u8; SECRET_LEN] = plaintext
            .get(..SECRET_LEN)
            .and_then(|head| head.try_into().ok())
            .ok_or(CryptoError::SecretTooShort(plaintext.len()))?;
        session.secret = Some(secret);
        Ok(())
    }

    #[must_use]
    pub fn has_secret(&self) -> bool {
        self.read().secret.is_some()
    }

    /// `base64(HMAC-SHA256(secret, data))`, always 44 characters.
    ///
    /// # Errors
    ///
    /// [`Error::MissingSecret`] before [`Credential::set_secret`] succeeded.
    pub fn signature(&self, data: &[u8]) -> Result<String, Error> {
        let secret = self.read().secret.ok_or(Error::MissingSecret)?;
        Ok(hmac_base64(&secret, data))
    }

    /// Prefix `data` with its signature. This concatenation is the wire frame.
    ///
    /// # Errors
    ///
    /// [`Error::MissingSecret`] before [`Credential::set_secret`] succeeded.
    pub fn sign(&self, data: &str) -> Result<String, Error> {
        let signature = self.signature(data.as_bytes())?;
        Ok(frames::signed_frame(&signature, data))
    }

    /// Wrap `data` in a hybrid-encrypted envelope.
    ///
    /// # Errors
    ///
    /// [`CryptoError::MissingPublicKey`] before preflight, otherwise RSA or
    /// cipher failures.
    pub fn encrypted_request(&self, data: &str) -> Result<String, Error> {
        let (key, public_key) = {
            let mut session = self.write();
            if self.rotation == KeyRotation::PerRequest {
                session.key = SessionKey::generate();
            }
            let public_key = session.public_key.clone().ok_or(CryptoError::MissingPublicKey)?;
            (session.key.clone(), public_key)
        };

        let wrapped_key = public_key
            .encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, &key.key)
            .map_err(CryptoError::from)?;
        let ciphertext = key.encrypt(data.as_bytes())?;

        let envelope =
            EncryptedEnvelope::new(STANDARD.encode(key.iv), STANDARD.encode(wrapped_key), STANDARD.encode(ciphertext));
        Ok(envelope.to_json()?)
    }

    fn read(&self) -> RwLockReadGuard<'_, CryptoSession> {
        self.session.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CryptoSession> {
        self.session.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Credential {
    fn default() -> Self {
        Self::new(KeyRotation::default())
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let session = self.read();
        f.debug_struct("Credential")
            .field("rotation", &self.rotation)
            .field("public_key", &session.public_key.is_some())
            .field("secret", &session.secret.is_some())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// HELPERS
// =============================================================================

pub(crate) fn hmac_base64(secret: &[u8], data: &[u8]) -> String {
    // HMAC accepts keys of any length.
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret).unwrap_or_else(|_| unreachable!());
    mac.update(data);
    STANDARD.encode(mac.finalize().into_bytes())
}

/// Only the first PEM block is read, and it must be labelled `PUBLIC KEY`.
fn parse_public_key(pem: &str) -> Result<RsaPublicKey, CryptoError> {
    let (label, document) = Document::from_pem(pem.trim()).map_err(|_| CryptoError::InvalidPem)?;
    if label != "PUBLIC KEY" {
        return Err(CryptoError::InvalidPem);
    }
    let spki = SubjectPublicKeyInfoRef::from_der(document.as_bytes()).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    if spki.algorithm.oid != rsa::pkcs1::ALGORITHM_OID {
        return Err(CryptoError::NotRsa);
    }
    RsaPublicKey::try_from(spki).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

#[cfg(test)]
#[path = "credentials_test.rs"]
mod tests;
