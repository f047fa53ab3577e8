//! Plaintext content digests and per-block nonce derivation.

use common::protocol::{DIGEST_LEN, NONCE_LEN};
use common::SessionId;
use hmac::{Hmac, Mac};
use sha2::{Digest as _, Sha256};

use super::cipher::CipherError;

/// SHA-256 digest of a block's plaintext.
pub type Digest = [u8; DIGEST_LEN];

/// Byte length of the random salt mixed into every derived nonce.
pub const NONCE_SALT_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// Compute the content digest of `data`.
pub fn digest(data: &[u8]) -> Digest {
    Sha256::digest(data).into()
}

/// Verify that `data` hashes to `expected`.
///
/// Runs after AEAD decryption as an independent check against logic errors in
/// the authenticated-encryption layer.
///
/// # Errors
///
/// Returns [`CipherError::DigestMismatch`] on mismatch.
pub fn verify_digest(data: &[u8], expected: &Digest) -> Result<(), CipherError> {
    if &digest(data) == expected {
        Ok(())
    } else {
        Err(CipherError::DigestMismatch)
    }
}

/// Derive a 96-bit nonce unique to `(salt, session, block, attempt)`.
///
/// The salt is drawn fresh for every transfer run, so retries inside a run
/// (distinct `attempt`) and later resumed runs (distinct salt) never reuse a
/// nonce under the same key.
pub fn derive_nonce(
    salt: &[u8; NONCE_SALT_LEN],
    session_id: &SessionId,
    block_index: u64,
    attempt: u32,
) -> Result<[u8; NONCE_LEN], CipherError> {
    let mut mac = HmacSha256::new_from_slice(salt).map_err(|_| CipherError::InvalidKeyLength)?;
    mac.update(session_id.as_bytes());
    mac.update(&block_index.to_be_bytes());
    mac.update(&attempt.to_be_bytes());
    let out = mac.finalize().into_bytes();

    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&out[..NONCE_LEN]);
    Ok(nonce)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::cipher::random_bytes;

    #[test]
    fn digest_is_sha256() {
        // SHA-256("abc")
        let expected = [
            0xba, 0x78, 0x16, 0xbf, 0x8f, 0x01, 0xcf, 0xea, 0x41, 0x41, 0x40, 0xde, 0x5d, 0xae,
            0x22, 0x23, 0xb0, 0x03, 0x61, 0xa3, 0x96, 0x17, 0x7a, 0x9c, 0xb4, 0x10, 0xff, 0x61,
            0xf2, 0x00, 0x15, 0xad,
        ];
        assert_eq!(digest(b"abc"), expected);
    }

    #[test]
    fn verify_digest_detects_change() {
        let d = digest(b"block-0");
        assert!(verify_digest(b"block-0", &d).is_ok());
        assert!(matches!(
            verify_digest(b"block-1", &d),
            Err(CipherError::DigestMismatch)
        ));
    }

    #[test]
    fn nonce_is_deterministic_for_same_inputs() {
        let salt = random_bytes::<NONCE_SALT_LEN>();
        let session = SessionId::new();
        assert_eq!(
            derive_nonce(&salt, &session, 4, 0).unwrap(),
            derive_nonce(&salt, &session, 4, 0).unwrap()
        );
    }

    #[test]
    fn nonce_varies_with_every_input() {
        let salt = random_bytes::<NONCE_SALT_LEN>();
        let session = SessionId::new();
        let base = derive_nonce(&salt, &session, 4, 0).unwrap();
        assert_ne!(base, derive_nonce(&salt, &session, 5, 0).unwrap());
        assert_ne!(base, derive_nonce(&salt, &session, 4, 1).unwrap());
        assert_ne!(base, derive_nonce(&salt, &SessionId::new(), 4, 0).unwrap());
        let other_salt = random_bytes::<NONCE_SALT_LEN>();
        assert_ne!(base, derive_nonce(&other_salt, &session, 4, 0).unwrap());
    }
}
