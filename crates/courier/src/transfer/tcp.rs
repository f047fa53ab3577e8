//! [`TcpTransport`]: framed request/acknowledgement exchange with a remote
//! sink node over one persistent TCP connection.

use async_trait::async_trait;
use common::protocol::{DeliveryAck, WireMessage};
use common::TransferError;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use super::frame::{read_frame, write_frame};
use super::transport::Transport;

/// One exchange at a time over a lazily (re)connected stream.
///
/// The stream is taken out of its slot for the duration of an exchange and
/// only put back once the acknowledgement has been read, so an exchange that
/// fails or is abandoned mid-frame forces a fresh connection next time.
#[derive(Debug)]
pub struct TcpTransport {
    addr: String,
    conn: Mutex<Option<TcpStream>>,
}

impl TcpTransport {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            conn: Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<TcpStream, TransferError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| TransferError::Transport(format!("connect {}: {e}", self.addr)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| TransferError::Transport(e.to_string()))?;
        debug!(addr = %self.addr, "sink connection established");
        Ok(stream)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, message: WireMessage) -> Result<DeliveryAck, TransferError> {
        let mut slot = self.conn.lock().await;
        let mut stream = match slot.take() {
            Some(stream) => stream,
            None => self.connect().await?,
        };

        write_frame(&mut stream, &message)
            .await
            .map_err(|e| TransferError::Transport(format!("write: {e}")))?;
        let ack = read_frame::<_, DeliveryAck>(&mut stream)
            .await
            .map_err(|e| TransferError::Transport(format!("read acknowledgement: {e}")))?
            .ok_or_else(|| {
                TransferError::Transport("connection closed before acknowledgement".into())
            })?;

        *slot = Some(stream);
        Ok(ack)
    }
}
