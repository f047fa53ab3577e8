//! AES-256-GCM-SIV encryption of transfer blocks and wrapping of key material.
//!
//! **Algorithm choice:** AES-256-GCM-SIV (RFC 8452) is nonce-misuse-resistant:
//! an accidental nonce repeat leaks only plaintext equality instead of
//! breaking authentication. Callers still derive a unique nonce per call.

use aes_gcm_siv::{
    aead::{AeadInPlace, KeyInit, OsRng},
    Aes256GcmSiv, Nonce, Tag,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use common::protocol::{NONCE_LEN, TAG_LEN};
use common::TransferError;
use thiserror::Error;
use zeroize::Zeroizing;

/// Byte length of an AES-256 key (32 bytes = 256 bits).
pub const KEY_LEN: usize = 32;

/// Prefix that appears at the start of every wrapped key.
pub const VERSION_PREFIX: &str = "v1";

/// Errors produced by the cipher layer.
#[derive(Debug, Error)]
pub enum CipherError {
    /// The key is the wrong length (must be [`KEY_LEN`] bytes).
    #[error("invalid key length: expected {KEY_LEN} bytes")]
    InvalidKeyLength,

    /// Authentication tag verification failed: wrong key, nonce, or tampered data.
    #[error("authentication tag mismatch")]
    TagMismatch,

    /// The plaintext digest does not match the expected value.
    #[error("plaintext digest mismatch")]
    DigestMismatch,

    /// AEAD encryption failed (unreachable with a valid key and bounded input).
    #[error("aead operation failed")]
    AeadFailure,

    /// A wrapped key string does not match the `v1.<nonce>.<ciphertext>` structure.
    #[error("invalid wrapped key format")]
    InvalidFormat,
}

impl From<CipherError> for TransferError {
    fn from(err: CipherError) -> Self {
        match err {
            CipherError::TagMismatch | CipherError::DigestMismatch => {
                TransferError::Integrity(err.to_string())
            }
            other => TransferError::Internal(other.to_string()),
        }
    }
}

/// Ciphertext and detached authentication tag of one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBlock {
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

/// Encrypt one block under `key` with the caller-supplied `nonce`.
///
/// The nonce must never repeat for the same key; see
/// [`derive_nonce`](super::digest::derive_nonce).
///
/// # Errors
///
/// Returns [`CipherError::InvalidKeyLength`] if `key` is not [`KEY_LEN`] bytes.
pub fn encrypt_block(
    key: &[u8],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
) -> Result<SealedBlock, CipherError> {
    let cipher = build_cipher(key)?;
    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(nonce), b"", &mut buffer)
        .map_err(|_| CipherError::AeadFailure)?;

    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(tag.as_slice());
    Ok(SealedBlock {
        ciphertext: buffer,
        tag: tag_bytes,
    })
}

/// Decrypt one block and verify its authentication tag.
///
/// # Errors
///
/// Returns [`CipherError::TagMismatch`] if authentication fails.
pub fn decrypt_block(
    key: &[u8],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    tag: &[u8; TAG_LEN],
) -> Result<Vec<u8>, CipherError> {
    let cipher = build_cipher(key)?;
    let mut buffer = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(nonce),
            b"",
            &mut buffer,
            Tag::from_slice(tag),
        )
        .map_err(|_| CipherError::TagMismatch)?;
    Ok(buffer)
}

// ---------------------------------------------------------------------------
// Key wrapping
// ---------------------------------------------------------------------------

/// Key material encrypted under a key-encryption key.
///
/// The string representation is `v1.<base64url(nonce)>.<base64url(ciphertext+tag)>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKey {
    pub nonce: [u8; NONCE_LEN],
    /// Ciphertext with the 16-byte tag appended.
    pub ciphertext: Vec<u8>,
}

impl WrappedKey {
    /// Encrypt `material` under `kek` with a fresh random nonce.
    pub fn seal(material: &[u8], kek: &[u8]) -> Result<Self, CipherError> {
        let nonce = random_nonce();
        let sealed = encrypt_block(kek, &nonce, material)?;
        let mut ciphertext = sealed.ciphertext;
        ciphertext.extend_from_slice(&sealed.tag);
        Ok(Self { nonce, ciphertext })
    }

    /// Decrypt the wrapped material. The returned buffer is zeroed on drop.
    pub fn open(&self, kek: &[u8]) -> Result<Zeroizing<Vec<u8>>, CipherError> {
        if self.ciphertext.len() < TAG_LEN {
            return Err(CipherError::InvalidFormat);
        }
        let (body, tag) = self.ciphertext.split_at(self.ciphertext.len() - TAG_LEN);
        let mut tag_bytes = [0u8; TAG_LEN];
        tag_bytes.copy_from_slice(tag);
        decrypt_block(kek, &self.nonce, body, &tag_bytes).map(Zeroizing::new)
    }

    /// Encode this value to its canonical string representation.
    pub fn to_string_repr(&self) -> String {
        format!(
            "{}.{}.{}",
            VERSION_PREFIX,
            URL_SAFE_NO_PAD.encode(self.nonce),
            URL_SAFE_NO_PAD.encode(&self.ciphertext),
        )
    }

    /// Parse a wrapped key string back into a [`WrappedKey`].
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::InvalidFormat`] if the string does not match the
    /// expected `v1.<nonce>.<ciphertext>` structure.
    pub fn parse(s: &str) -> Result<Self, CipherError> {
        let parts: Vec<&str> = s.splitn(3, '.').collect();
        if parts.len() != 3 || parts[0] != VERSION_PREFIX {
            return Err(CipherError::InvalidFormat);
        }
        let nonce_bytes = URL_SAFE_NO_PAD
            .decode(parts[1])
            .map_err(|_| CipherError::InvalidFormat)?;
        let nonce: [u8; NONCE_LEN] = nonce_bytes
            .try_into()
            .map_err(|_| CipherError::InvalidFormat)?;
        let ciphertext = URL_SAFE_NO_PAD
            .decode(parts[2])
            .map_err(|_| CipherError::InvalidFormat)?;

        Ok(Self { nonce, ciphertext })
    }
}

/// Fill a fixed-size buffer from the OS CSPRNG.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    use aes_gcm_siv::aead::rand_core::RngCore;
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

fn random_nonce() -> [u8; NONCE_LEN] {
    random_bytes::<NONCE_LEN>()
}

fn build_cipher(key: &[u8]) -> Result<Aes256GcmSiv, CipherError> {
    if key.len() != KEY_LEN {
        return Err(CipherError::InvalidKeyLength);
    }
    Aes256GcmSiv::new_from_slice(key).map_err(|_| CipherError::InvalidKeyLength)
}
