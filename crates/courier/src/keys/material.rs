//! [`KeyBytes`]: zeroize-on-drop key buffer, and Argon2id derivation.

use argon2::{Algorithm, Argon2, Params, Version};
use zeroize::Zeroize;

use super::KeyError;
use crate::crypto::cipher::random_bytes;
use crate::crypto::KEY_LEN;

/// Fixed-size key buffer that holds exactly [`KEY_LEN`] bytes.
///
/// Lives inside the key manager; cloned onto the stack of a single
/// encrypt/decrypt call and dropped immediately after. When this type is
/// dropped, the memory is overwritten with zeroes.
#[derive(Clone)]
pub struct KeyBytes(Box<[u8; KEY_LEN]>);

impl KeyBytes {
    /// Fresh key material from the OS CSPRNG.
    pub fn random() -> Self {
        Self(Box::new(random_bytes::<KEY_LEN>()))
    }

    /// Copy `bytes` into a new buffer.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::InvalidLength`] if the slice has the wrong length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != KEY_LEN {
            return Err(KeyError::InvalidLength(bytes.len()));
        }
        let mut buf = Box::new([0u8; KEY_LEN]);
        buf.copy_from_slice(bytes);
        Ok(Self(buf))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0[..]
    }
}

impl Drop for KeyBytes {
    fn drop(&mut self) {
        self.0.as_mut_slice().zeroize();
    }
}

impl std::fmt::Debug for KeyBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material, not even in debug builds.
        f.write_str("KeyBytes([REDACTED])")
    }
}

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub memory_kib: u32,
    /// Number of passes.
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 19_456,
            iterations: 2,
            parallelism: 1,
        }
    }
}

/// Derive a key from `secret` and `salt` with Argon2id.
///
/// CPU and memory heavy by construction; async callers run it on the
/// blocking pool.
///
/// # Errors
///
/// Returns [`KeyError::Kdf`] for invalid parameters or a salt shorter than
/// 8 bytes.
pub fn derive_key(secret: &[u8], salt: &[u8], params: &KdfParams) -> Result<KeyBytes, KeyError> {
    let params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|e| KeyError::Kdf(e.to_string()))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut out = KeyBytes(Box::new([0u8; KEY_LEN]));
    argon
        .hash_password_into(secret, salt, &mut out.0[..])
        .map_err(|e| KeyError::Kdf(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
pub(crate) fn test_kdf() -> KdfParams {
    KdfParams {
        memory_kib: 64,
        iterations: 1,
        parallelism: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_wrong_length() {
        assert!(matches!(
            KeyBytes::from_slice(&[0u8; 16]),
            Err(KeyError::InvalidLength(16))
        ));
        assert!(KeyBytes::from_slice(&[7u8; KEY_LEN]).is_ok());
    }

    #[test]
    fn random_keys_differ() {
        assert_ne!(KeyBytes::random().as_bytes(), KeyBytes::random().as_bytes());
    }

    #[test]
    fn key_bytes_redacted_in_debug() {
        let key = KeyBytes::from_slice(&[0xFFu8; KEY_LEN]).unwrap();
        let printed = format!("{key:?}");
        assert!(printed.contains("REDACTED"));
        assert!(!printed.contains("255"));
    }

    #[test]
    fn derivation_is_deterministic_and_salted() {
        let params = test_kdf();
        let a = derive_key(b"license", b"salt-0001", &params).unwrap();
        let b = derive_key(b"license", b"salt-0001", &params).unwrap();
        let c = derive_key(b"license", b"salt-0002", &params).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn short_salt_is_rejected() {
        assert!(matches!(
            derive_key(b"license", b"abc", &test_kdf()),
            Err(KeyError::Kdf(_))
        ));
    }
}
