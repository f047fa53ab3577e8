//! Secure block transfer with hardware-bound key lifecycle.
//!
//! - [`keys`]: generation, hardware binding, rotation, revocation and disposal
//!   of block-encryption keys.
//! - [`crypto`]: the block codec (AEAD, digests, nonce derivation).
//! - [`transfer`]: resumable transfer sessions and the receiving sink.
//! - [`server`]: TCP accept loop for sink nodes.

pub mod config;
pub mod crypto;
pub mod keys;
pub mod persist;
pub mod server;
pub mod telemetry;
pub mod transfer;
