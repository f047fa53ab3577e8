//! Block codec: AES-256-GCM-SIV block encryption, plaintext digests, and
//! nonce derivation.
//!
//! This module is intentionally free of key-lifecycle and transport
//! dependencies. Every function is a pure transform of its inputs; key
//! material is borrowed for the duration of a single call.
//!
//! # Wrapped key format
//!
//! ```text
//! v1.<base64url-no-pad(nonce)>.<base64url-no-pad(ciphertext+tag)>
//! ```
//!
//! Used only for key material at rest. The `v1` prefix enables future
//! algorithm migration without breaking stored registries.

pub mod cipher;
pub mod digest;

pub use cipher::{decrypt_block, encrypt_block, CipherError, SealedBlock, WrappedKey, KEY_LEN};
pub use digest::{derive_nonce, digest, verify_digest, Digest, NONCE_SALT_LEN};
