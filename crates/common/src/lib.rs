//! Shared identifiers, wire protocol, and error taxonomy for the `courier` crates.

pub mod error;
pub mod ids;
pub mod protocol;

pub use error::{FailureKind, FailureReason, TransferError};
pub use ids::{KeyId, NodeId, SessionId};
