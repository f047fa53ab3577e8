//! The delivery seam between a sending [`TransferManager`] and a receiving
//! [`BlockSink`].
//!
//! A transport only moves messages and returns the sink's acknowledgement;
//! it never inspects payloads. Every call must be safe to repeat: the sink
//! acknowledges an already-completed block as a duplicate without rewriting
//! it.
//!
//! [`TransferManager`]: super::TransferManager

use async_trait::async_trait;
use common::protocol::{DeliveryAck, WireMessage};
use common::TransferError;

use super::sink::BlockSink;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `message` and wait for the sink's acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Transport`] if the message may not have been
    /// delivered.
    async fn send(&self, message: WireMessage) -> Result<DeliveryAck, TransferError>;
}

/// Delivers straight into an in-process sink.
#[derive(Clone)]
pub struct LoopbackTransport {
    sink: BlockSink,
}

impl LoopbackTransport {
    pub fn new(sink: BlockSink) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, message: WireMessage) -> Result<DeliveryAck, TransferError> {
        Ok(self.sink.handle(message).await)
    }
}
