//! Stream bridge
//!
//! Pumps bytes between one logical stream and a backend byte stream. The
//! forward half reads the backend and sends frames, pausing while the
//! stream's flow signal says so. The reverse half writes delivered bytes
//! back in order and shuts the backend's write side down on remote close.

use crate::transport::{BoxedIo, Dialer, Io, TcpDialer, TransportConfig};
use crate::tunnel::{Flow, Session, TunnelError};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

/// Dials the backend of a stream opened by the peer
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(&self, target: &str) -> Result<BoxedIo, TunnelError>;
}

/// Plain TCP backends
#[derive(Debug, Clone)]
pub struct TcpConnector {
    dialer: TcpDialer,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            dialer: TcpDialer::new(TransportConfig {
                connect_timeout,
                nodelay: true,
            }),
        }
    }
}

#[async_trait]
impl BackendConnector for TcpConnector {
    async fn connect(&self, target: &str) -> Result<BoxedIo, TunnelError> {
        self.dialer
            .dial(target, None)
            .await
            .map_err(|e| TunnelError::BackendDialFailure {
                target: target.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Run both directions of a stream until they are done
pub async fn run_bridge<S: Io>(
    session: Arc<Session>,
    id: u32,
    io: S,
    mut delivered: mpsc::UnboundedReceiver<Bytes>,
    mut flow: watch::Receiver<Flow>,
) {
    let (mut reader, mut writer) = tokio::io::split(io);

    let (forward, reverse) = tokio::join!(
        forward(&session, id, &mut reader, &mut flow),
        reverse(&mut writer, &mut delivered),
    );

    if let Err(e) = forward {
        debug!(stream = id, error = %e, "forward direction failed");
        session.abort_stream(id, &e);
    } else if let Err(e) = reverse {
        debug!(stream = id, error = %e, "backend write failed");
        session.abort_stream(id, &TunnelError::Io(e));
    }
    trace!(stream = id, "bridge finished");
}

async fn forward<R: AsyncRead + Unpin>(
    session: &Session,
    id: u32,
    reader: &mut R,
    flow: &mut watch::Receiver<Flow>,
) -> Result<(), TunnelError> {
    let mut buf = vec![0u8; session.config().read_chunk()];

    loop {
        let state = match flow.wait_for(|f| *f != Flow::Paused).await {
            Ok(state) => *state,
            Err(_) => return Ok(()),
        };
        if state == Flow::Cancelled {
            return Ok(());
        }

        let n = tokio::select! {
            read = reader.read(&mut buf) => read?,
            _ = flow.wait_for(|f| *f == Flow::Cancelled) => return Ok(()),
        };

        if n == 0 {
            let frame = session.finish_stream(id)?;
            debug!(stream = id, seq = frame.seq, "backend EOF, closing");
            return session.send_with_retry(&frame).await;
        }

        let frame = session.prepare_data(id, Bytes::copy_from_slice(&buf[..n]))?;
        session.send_with_retry(&frame).await?;
    }
}

async fn reverse<W: AsyncWrite + Unpin>(
    writer: &mut W,
    delivered: &mut mpsc::UnboundedReceiver<Bytes>,
) -> std::io::Result<()> {
    while let Some(chunk) = delivered.recv().await {
        writer.write_all(&chunk).await?;
    }
    writer.shutdown().await
}
