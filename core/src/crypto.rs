// Crypto primitives — fixed parameter set, no negotiation
//
// RSA-2048 (e = 65537) with OAEP(SHA-256) for key transport and
// PSS(SHA-256, salt 32) for signatures. Message bodies ride in
// AES-256-GCM with the protocol's 16-byte nonce, tag appended to the
// ciphertext. A user's identity is the Base64 SHA-256 of their public
// key PEM.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{
    DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding,
};
use rsa::{Oaep, Pss, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

pub const RSA_KEY_BITS: usize = 2048;
pub const AES_KEY_SIZE: usize = 32;
pub const AES_IV_SIZE: usize = 16;
pub const GCM_TAG_SIZE: usize = 16;
pub const PSS_SALT_LEN: usize = 32;

/// AES-256-GCM parameterized with the wire format's 16-byte nonce.
type Aes256Gcm16 = AesGcm<Aes256, U16>;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("malformed PEM: {0}")]
    Pem(String),
    #[error("key generation failed: {0}")]
    KeyGen(String),
    #[error("RSA-OAEP operation failed")]
    Oaep,
    #[error("signature verification failed")]
    Signature,
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("AES-GCM failure (bad key, nonce, or tag)")]
    Cipher,
}

/// Generate a fresh RSA-2048 key pair.
pub fn generate_keypair() -> Result<(RsaPrivateKey, RsaPublicKey), CryptoError> {
    let private = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
        .map_err(|e| CryptoError::KeyGen(e.to_string()))?;
    let public = RsaPublicKey::from(&private);
    Ok((private, public))
}

pub fn public_key_to_pem(key: &RsaPublicKey) -> Result<String, CryptoError> {
    key.to_public_key_pem(LineEnding::LF)
        .map_err(|e| CryptoError::Pem(e.to_string()))
}

pub fn public_key_from_pem(pem: &str) -> Result<RsaPublicKey, CryptoError> {
    RsaPublicKey::from_public_key_pem(pem).map_err(|e| CryptoError::Pem(e.to_string()))
}

pub fn private_key_to_pem(key: &RsaPrivateKey) -> Result<Zeroizing<String>, CryptoError> {
    key.to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| CryptoError::Pem(e.to_string()))
}

pub fn private_key_from_pem(pem: &str) -> Result<RsaPrivateKey, CryptoError> {
    RsaPrivateKey::from_pkcs8_pem(pem).map_err(|e| CryptoError::Pem(e.to_string()))
}

/// Fingerprint of a public key: `base64(sha256(pem bytes))`.
///
/// Hashes the PEM string exactly as exchanged on the wire, so both ends
/// must serialize with the same line endings (LF, see `public_key_to_pem`).
pub fn fingerprint(public_key_pem: &str) -> String {
    B64.encode(Sha256::digest(public_key_pem.as_bytes()))
}

/// Sign with RSA-PSS(SHA-256), MGF1/SHA-256, 32-byte salt.
pub fn sign_pss(key: &RsaPrivateKey, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let digest = Sha256::digest(message);
    key.sign_with_rng(&mut OsRng, Pss::new_with_salt::<Sha256>(PSS_SALT_LEN), &digest)
        .map_err(|e| CryptoError::Signing(e.to_string()))
}

pub fn verify_pss(key: &RsaPublicKey, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    let digest = Sha256::digest(message);
    key.verify(Pss::new_with_salt::<Sha256>(PSS_SALT_LEN), &digest, signature)
        .map_err(|_| CryptoError::Signature)
}

/// Encrypt under RSA-OAEP(SHA-256, MGF1/SHA-256, empty label).
pub fn oaep_encrypt(key: &RsaPublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    key.encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext)
        .map_err(|_| CryptoError::Oaep)
}

pub fn oaep_decrypt(key: &RsaPrivateKey, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    key.decrypt(Oaep::new::<Sha256>(), ciphertext)
        .map_err(|_| CryptoError::Oaep)
}

pub fn generate_aes_key() -> [u8; AES_KEY_SIZE] {
    let mut key = [0u8; AES_KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    key
}

pub fn generate_iv() -> [u8; AES_IV_SIZE] {
    let mut iv = [0u8; AES_IV_SIZE];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// AES-256-GCM encrypt. Returns ciphertext with the 16-byte tag appended.
pub fn gcm_encrypt(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if iv.len() != AES_IV_SIZE {
        return Err(CryptoError::Cipher);
    }
    let cipher = Aes256Gcm16::new_from_slice(key).map_err(|_| CryptoError::Cipher)?;
    cipher
        .encrypt(Nonce::from_slice(iv), plaintext)
        .map_err(|_| CryptoError::Cipher)
}

/// AES-256-GCM decrypt. Expects the tag appended to the ciphertext.
pub fn gcm_decrypt(key: &[u8], iv: &[u8], ciphertext_and_tag: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if iv.len() != AES_IV_SIZE || ciphertext_and_tag.len() < GCM_TAG_SIZE {
        return Err(CryptoError::Cipher);
    }
    let cipher = Aes256Gcm16::new_from_slice(key).map_err(|_| CryptoError::Cipher)?;
    cipher
        .decrypt(Nonce::from_slice(iv), ciphertext_and_tag)
        .map_err(|_| CryptoError::Cipher)
}
