//! One physical link of a bonded session
//!
//! A link owns a writer task fed through an unbounded queue. Bytes are
//! charged to `outstanding` when the scheduler picks the link and released
//! once the writer has flushed them to the socket.

use super::{Frame, TunnelError};
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace};

pub type LinkId = u64;

/// Link health
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkHealth {
    /// Eligible for new traffic
    Healthy,
    /// Reads stalled once; receives no new traffic
    Degraded,
    /// Removed from rotation
    Dead,
}

/// Snapshot of link counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub outstanding: u64,
}

enum Outgoing {
    Bytes { data: Bytes, charged: u64 },
    Shutdown,
}

/// A physical connection carrying frames of one session
pub struct Link {
    id: LinkId,
    name: String,
    health: RwLock<LinkHealth>,
    outstanding: AtomicU64,
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_received: AtomicU64,
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl Link {
    /// Create a link and spawn its writer task.
    ///
    /// The writer sends a keepalive whenever nothing was written for half of
    /// `keepalive_interval`. It ends on write error or after [`Link::shutdown`].
    pub fn spawn<W>(
        id: LinkId,
        name: impl Into<String>,
        writer: W,
        keepalive_interval: Duration,
    ) -> (Arc<Link>, JoinHandle<Result<(), TunnelError>>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = Arc::new(Link {
            id,
            name: name.into(),
            health: RwLock::new(LinkHealth::Healthy),
            outstanding: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            tx,
        });

        let task = tokio::spawn(run_writer(
            link.clone(),
            writer,
            rx,
            keepalive_interval / 2,
        ));
        (link, task)
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn health(&self) -> LinkHealth {
        *self.health.read()
    }

    pub fn is_healthy(&self) -> bool {
        self.health() == LinkHealth::Healthy
    }

    pub fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Charge bytes that are about to be queued
    pub(crate) fn charge(&self, bytes: u64) {
        self.outstanding.fetch_add(bytes, Ordering::AcqRel);
    }

    fn release(&self, bytes: u64) {
        let _ = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some(cur.saturating_sub(bytes))
            });
    }

    /// Queue an already-charged frame for writing.
    ///
    /// Fails if the writer task is gone; the charge is released.
    pub fn enqueue(&self, frame: &Frame, charged: u64) -> Result<(), TunnelError> {
        let data = frame.encode().freeze();
        self.tx
            .send(Outgoing::Bytes { data, charged })
            .map_err(|_| {
                self.release(charged);
                TunnelError::StreamClosed
            })
    }

    /// Queue a frame outside the scheduler (session control, keepalive)
    pub fn send_uncharged(&self, frame: &Frame) -> Result<(), TunnelError> {
        self.enqueue(frame, 0)
    }

    /// Flush what is queued, then close the write side
    pub fn shutdown(&self) {
        let _ = self.tx.send(Outgoing::Shutdown);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Read timeout elapsed; Healthy -> Degraded -> Dead
    pub fn note_stall(&self) -> LinkHealth {
        let mut health = self.health.write();
        *health = match *health {
            LinkHealth::Healthy => LinkHealth::Degraded,
            _ => LinkHealth::Dead,
        };
        *health
    }

    /// Degraded -> Healthy. Returns true if the health changed.
    pub fn recover(&self) -> bool {
        let mut health = self.health.write();
        if *health == LinkHealth::Degraded {
            *health = LinkHealth::Healthy;
            return true;
        }
        false
    }

    pub fn mark_dead(&self) {
        *self.health.write() = LinkHealth::Dead;
    }

    pub fn record_received(&self, frame: &Frame) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(frame.encoded_size() as u64, Ordering::Relaxed);
    }

    pub fn stats(&self) -> LinkStats {
        LinkStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            outstanding: self.outstanding(),
        }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("health", &self.health())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

async fn run_writer<W>(
    link: Arc<Link>,
    writer: W,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    idle: Duration,
) -> Result<(), TunnelError>
where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(writer);

    loop {
        let first = match timeout(idle, rx.recv()).await {
            Ok(Some(out)) => out,
            Ok(None) => break,
            Err(_) => {
                trace!(link = link.id, "keepalive");
                writer.write_all(&Frame::keepalive().encode()).await?;
                writer.flush().await?;
                continue;
            }
        };

        // Coalesce whatever is already queued into one flush
        let mut charged = 0;
        let mut next = Some(first);
        let mut stop = false;
        while let Some(out) = next.take() {
            match out {
                Outgoing::Bytes { data, charged: c } => {
                    writer.write_all(&data).await?;
                    charged += c;
                    link.frames_sent.fetch_add(1, Ordering::Relaxed);
                    link.bytes_sent
                        .fetch_add(data.len() as u64, Ordering::Relaxed);
                }
                Outgoing::Shutdown => {
                    stop = true;
                    break;
                }
            }
            next = rx.try_recv().ok();
        }

        writer.flush().await?;
        link.release(charged);

        if stop {
            break;
        }
    }

    debug!(link = link.id, name = %link.name, "link writer finished");
    writer.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::FrameReader;

    #[tokio::test]
    async fn test_writer_releases_outstanding() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (link, task) = Link::spawn(1, "main", client, Duration::from_secs(15));

        let frame = Frame::data(1, 0, bytes::Bytes::from_static(b"hello"));
        let size = frame.encoded_size() as u64;
        link.charge(size);
        assert_eq!(link.outstanding(), size);
        link.enqueue(&frame, size).unwrap();

        let mut reader = FrameReader::new(server, 64 * 1024);
        assert_eq!(reader.next_frame().await.unwrap(), Some(frame));

        link.shutdown();
        task.await.unwrap().unwrap();
        assert_eq!(link.outstanding(), 0);
        assert_eq!(link.stats().frames_sent, 1);
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_writer_sends_keepalive() {
        let (client, server) = tokio::io::duplex(1024);
        let (_link, _task) = Link::spawn(1, "main", client, Duration::from_secs(2));

        let mut reader = FrameReader::new(server, 1024);
        let frame = reader.next_frame().await.unwrap().unwrap();
        assert!(frame.is_keepalive());
    }

    #[tokio::test]
    async fn test_health_transitions() {
        let (client, _server) = tokio::io::duplex(1024);
        let (link, _task) = Link::spawn(7, "helper", client, Duration::from_secs(15));

        assert_eq!(link.health(), LinkHealth::Healthy);
        assert_eq!(link.note_stall(), LinkHealth::Degraded);
        assert!(link.recover());
        assert!(!link.recover());
        assert_eq!(link.note_stall(), LinkHealth::Degraded);
        assert_eq!(link.note_stall(), LinkHealth::Dead);
        assert!(!link.recover());
    }
}
