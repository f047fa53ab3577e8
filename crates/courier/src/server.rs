//! TCP accept loop for a sink node.
//!
//! Each connection carries a sequence of length-prefixed [`WireMessage`]
//! frames; every frame is answered with exactly one [`DeliveryAck`] frame
//! before the next one is read. Connections are independent and handled on
//! their own tasks.
//!
//! [`DeliveryAck`]: common::protocol::DeliveryAck

use std::net::SocketAddr;

use anyhow::{Context, Result};
use common::protocol::WireMessage;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::transfer::frame::{read_frame, write_frame};
use crate::transfer::BlockSink;

/// Bind `addr` and serve until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound.
pub async fn run(addr: &str, sink: BlockSink, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind sink listener on {addr}"))?;
    serve(listener, sink, shutdown).await
}

/// Accept loop over an already bound listener.
pub async fn serve(listener: TcpListener, sink: BlockSink, shutdown: CancellationToken) -> Result<()> {
    let local = listener.local_addr()?;
    info!(addr = %local, node = %sink.node(), "sink node listening");

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer_addr)) => {
                debug!(%peer_addr, "accepted source connection");
                let sink = sink.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer_addr, sink, shutdown).await {
                        warn!(%peer_addr, error = %e, "connection error");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "accept error");
            }
        }
    }

    info!(addr = %local, "sink node stopped");
    Ok(())
}

async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    sink: BlockSink,
    shutdown: CancellationToken,
) -> Result<()> {
    stream.set_nodelay(true)?;
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            frame = read_frame::<_, WireMessage>(&mut stream) => frame,
        };
        let Some(message) = frame.context("failed to read frame")? else {
            debug!(%peer_addr, "source closed connection");
            return Ok(());
        };
        let ack = sink.handle(message).await;
        write_frame(&mut stream, &ack)
            .await
            .context("failed to write acknowledgement")?;
    }
}
