//! Tunnel session
//!
//! A session owns the stream table and the link set of one bonded tunnel.
//! Every link gets a reader task that routes frames through the table and a
//! writer task owned by [`Link`]. A sweeper task expires stalled and idle
//! streams once a second.
//!
//! The table and the link set sit behind `parking_lot` mutexes that are only
//! ever held for synchronous work.

use super::{
    Dispatch, Frame, FrameReader, Link, LinkHealth, LinkId, LinkSet, LinkStats, Receipt, Role,
    StreamState, StreamTable, TunnelError,
};
use crate::config::TunnelConfig;
use crate::proxy::bridge::{self, BackendConnector};
use crate::transport::Io;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Poll interval while waiting for a link to become available
const SEND_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingHandshake,
    Established,
    Closing,
    Closed,
}

type OpenWaiter = oneshot::Sender<Result<(), TunnelError>>;

/// A bonded tunnel session
pub struct Session {
    token: String,
    role: Role,
    target: Option<String>,
    config: TunnelConfig,
    state: RwLock<SessionState>,
    streams: Mutex<StreamTable>,
    links: Mutex<LinkSet>,
    link_changes: Arc<Notify>,
    pending: Mutex<HashMap<u32, OpenWaiter>>,
    connector: Option<Arc<dyn BackendConnector>>,
    next_link_id: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl Session {
    /// Dialing side. `token` comes from the first link's handshake.
    pub fn initiator(
        token: impl Into<String>,
        target: Option<String>,
        config: TunnelConfig,
    ) -> Arc<Self> {
        Self::new(token.into(), Role::Initiator, target, None, config)
    }

    /// Accepting side with a fresh random token.
    ///
    /// Streams opened by the peer are dialed through `connector`; without one
    /// every open is refused.
    pub fn acceptor(
        target: Option<String>,
        connector: Option<Arc<dyn BackendConnector>>,
        config: TunnelConfig,
    ) -> Arc<Self> {
        Self::new(generate_token(), Role::Acceptor, target, connector, config)
    }

    fn new(
        token: String,
        role: Role,
        target: Option<String>,
        connector: Option<Arc<dyn BackendConnector>>,
        config: TunnelConfig,
    ) -> Arc<Self> {
        let links = LinkSet::new();
        let link_changes = links.changed();
        let (shutdown, _) = watch::channel(false);

        let session = Arc::new(Self {
            streams: Mutex::new(StreamTable::new(
                role,
                config.stream_buffer_budget,
                target.is_some(),
            )),
            token,
            role,
            target,
            config,
            state: RwLock::new(SessionState::AwaitingHandshake),
            links: Mutex::new(links),
            link_changes,
            pending: Mutex::new(HashMap::new()),
            connector,
            next_link_id: AtomicU64::new(1),
            shutdown,
        });

        spawn_sweeper(Arc::downgrade(&session), session.shutdown.subscribe());
        debug!(session = %session.token, ?role, "session created");
        session
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Fixed backend of a CONNECT-style session
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state(), SessionState::Closing | SessionState::Closed)
    }

    fn ensure_open(&self) -> Result<(), TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::SessionClosed);
        }
        Ok(())
    }

    /// Add a physical link and start its reader and writer
    pub fn attach_link<S>(self: &Arc<Self>, name: impl Into<String>, io: S) -> Result<LinkId, TunnelError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.ensure_open()?;

        let (reader, writer) = tokio::io::split(io);
        let id = self.next_link_id.fetch_add(1, Ordering::Relaxed);
        let (link, writer_task) =
            Link::spawn(id, name, writer, self.config.keepalive_interval());
        self.links.lock().add(link.clone());

        {
            let mut state = self.state.write();
            if *state == SessionState::AwaitingHandshake {
                *state = SessionState::Established;
                info!(session = %self.token, "session established");
            }
        }

        let session = self.clone();
        tokio::spawn(async move { session.read_loop(link, reader).await });

        let session = Arc::downgrade(self);
        tokio::spawn(async move {
            match writer_task.await {
                Ok(Ok(())) => trace!(link = id, "link writer finished"),
                Ok(Err(e)) => debug!(link = id, error = %e, "link writer failed"),
                Err(e) => warn!(link = id, error = %e, "link writer panicked"),
            }
            if let Some(session) = session.upgrade() {
                session.link_down(id);
            }
        });

        Ok(id)
    }

    async fn read_loop<R>(self: Arc<Self>, link: Arc<Link>, reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut frames = FrameReader::new(reader, self.config.max_payload_size);
        let mut shutdown = self.shutdown.subscribe();
        let stall_after = self.config.keepalive_interval();

        loop {
            let read = tokio::select! {
                read = timeout(stall_after, frames.next_frame()) => read,
                _ = shutdown.wait_for(|closed| *closed) => break,
            };

            match read {
                Err(_) => {
                    let health = link.note_stall();
                    warn!(link = link.id(), name = %link.name(), ?health, "link read stalled");
                    if health == LinkHealth::Dead {
                        break;
                    }
                }
                Ok(Ok(Some(frame))) => {
                    link.record_received(&frame);
                    self.links.lock().report_success(link.id());
                    self.handle_frame(frame);
                }
                Ok(Ok(None)) => {
                    debug!(link = link.id(), "link closed by peer");
                    break;
                }
                Ok(Err(e)) if e.is_framing() => {
                    warn!(link = link.id(), name = %link.name(), error = %e, "framing error, dropping link");
                    break;
                }
                Ok(Err(e)) => {
                    debug!(link = link.id(), error = %e, "link read failed");
                    break;
                }
            }
        }

        self.link_down(link.id());
    }

    fn handle_frame(self: &Arc<Self>, frame: Frame) {
        let dispatch = self.streams.lock().dispatch(frame, Instant::now());

        match dispatch {
            Dispatch::Nothing => {}
            Dispatch::Received { id, receipt } => {
                if receipt == Receipt::Conflict {
                    warn!(stream = id, "protocol violation: conflicting frame");
                }
            }
            Dispatch::Opened { id, target } => self.accept_stream(id, target),
            Dispatch::Accepted(id) => {
                if let Some(waiter) = self.pending.lock().remove(&id) {
                    let _ = waiter.send(Ok(()));
                }
            }
            Dispatch::Refused(id) => {
                if let Some(waiter) = self.pending.lock().remove(&id) {
                    let _ = waiter.send(Err(TunnelError::OpenRefused(id)));
                }
            }
            Dispatch::Reset(id) => {
                if let Some(waiter) = self.pending.lock().remove(&id) {
                    let _ = waiter.send(Err(TunnelError::StreamReset(id)));
                }
            }
            Dispatch::Finished(id) => debug!(stream = id, "stream complete"),
            Dispatch::Abort { id, error } => {
                warn!(stream = id, error = %error, "aborting stream");
                self.abort_stream(id, &error);
            }
            Dispatch::Reply(frame) => self.send_control(&frame),
            Dispatch::SessionClose => {
                info!(session = %self.token, "peer closed session");
                self.close();
            }
        }
    }

    /// Dial the backend for a stream the peer opened
    fn accept_stream(self: &Arc<Self>, id: u32, target: Option<String>) {
        let Some(target) = target.or_else(|| self.target.clone()) else {
            warn!(stream = id, "open without a target");
            self.abort_stream(id, &TunnelError::StreamClosed);
            return;
        };
        let Some(connector) = self.connector.clone() else {
            debug!(stream = id, dest = %target, "no backend connector, refusing");
            self.abort_stream(id, &TunnelError::StreamClosed);
            return;
        };

        // Only target-carrying opens wait for an ack
        let ack = self.target.is_none();
        let session = self.clone();
        tokio::spawn(async move {
            match connector.connect(&target).await {
                Ok(io) => {
                    debug!(stream = id, dest = %target, "backend connected");
                    if ack {
                        session.send_control(&Frame::open(id, 0, Bytes::new()));
                    }
                    if let Err(e) = session.spawn_bridge(id, io) {
                        debug!(stream = id, error = %e, "stream gone before bridge");
                    }
                }
                Err(e) => {
                    warn!(stream = id, dest = %target, error = %e, "backend dial failed");
                    session.abort_stream(id, &e);
                }
            }
        });
    }

    /// Open a stream to `target` and wait for the peer to dial it
    pub async fn connect(&self, target: &str) -> Result<u32, TunnelError> {
        self.ensure_open()?;

        let (id, frame) = {
            let mut streams = self.streams.lock();
            let id = streams.open_local(StreamState::Opening, Instant::now())?;
            (id, streams.prepare_open(id, target)?)
        };

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        if let Err(e) = self.send_frame(&frame) {
            self.pending.lock().remove(&id);
            self.streams.lock().abort(id);
            return Err(e);
        }

        let result = match timeout(self.config.open_timeout(), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TunnelError::SessionClosed),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(TunnelError::OpenTimeout(id))
            }
        };

        match result {
            Ok(()) => {
                debug!(stream = id, dest = %target, "stream opened");
                Ok(id)
            }
            Err(TunnelError::OpenRefused(_)) => Err(TunnelError::BackendDialFailure {
                target: target.to_string(),
                reason: "refused by peer".into(),
            }),
            Err(e) => {
                self.abort_stream(id, &e);
                Err(e)
            }
        }
    }

    /// Open a stream of a CONNECT-style session; the first chunk carries the open
    pub fn open_local(&self) -> Result<u32, TunnelError> {
        self.ensure_open()?;
        self.streams
            .lock()
            .open_local(StreamState::Open, Instant::now())
    }

    /// Connect a stream to a backend byte stream
    pub fn spawn_bridge<S: Io>(self: &Arc<Self>, id: u32, io: S) -> Result<JoinHandle<()>, TunnelError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let flow = self.streams.lock().attach(id, tx, Instant::now())?;
        Ok(tokio::spawn(bridge::run_bridge(self.clone(), id, io, rx, flow)))
    }

    /// Build the next data frame of a stream
    pub fn prepare_data(&self, id: u32, payload: Bytes) -> Result<Frame, TunnelError> {
        self.streams
            .lock()
            .prepare_send(id, payload, Instant::now())
    }

    /// Half-close the local direction of a stream
    pub fn finish_stream(&self, id: u32) -> Result<Frame, TunnelError> {
        self.streams.lock().prepare_close(id)
    }

    /// Tear a stream down and reset it on the peer, best effort
    pub fn abort_stream(&self, id: u32, reason: &TunnelError) {
        let frame = self.streams.lock().abort(id);
        if let Some(waiter) = self.pending.lock().remove(&id) {
            let _ = waiter.send(Err(TunnelError::StreamClosed));
        }
        if let Some(frame) = frame {
            debug!(stream = id, %reason, "stream aborted");
            self.send_control(&frame);
        }
    }

    /// Schedule a frame on the least loaded healthy link
    pub fn send_frame(&self, frame: &Frame) -> Result<(), TunnelError> {
        self.ensure_open()?;
        let size = frame.encoded_size();

        loop {
            let link = self.links.lock().select_link(frame.stream_id, size)?;
            match link.enqueue(frame, size as u64) {
                Ok(()) => return Ok(()),
                Err(_) => {
                    debug!(link = link.id(), "link writer gone");
                    self.links.lock().report_failure(link.id());
                }
            }
        }
    }

    /// Like [`Session::send_frame`], but waits out `NoLinkAvailable`
    /// for up to the send retry timeout, keeping the same frame.
    pub async fn send_with_retry(&self, frame: &Frame) -> Result<(), TunnelError> {
        let deadline = Instant::now() + self.config.send_retry_timeout();
        loop {
            match self.send_frame(frame) {
                Err(TunnelError::NoLinkAvailable) if Instant::now() < deadline => {
                    trace!(stream = frame.stream_id, seq = frame.seq, "no link, waiting");
                    let _ = timeout(SEND_RETRY_INTERVAL, self.link_changes.notified()).await;
                }
                other => return other,
            }
        }
    }

    fn send_control(&self, frame: &Frame) {
        if let Err(e) = self.send_frame(frame) {
            debug!(stream = frame.stream_id, error = %e, "control frame dropped");
        }
    }

    fn sweep(&self) {
        let expired = self.streams.lock().sweep(
            Instant::now(),
            self.config.gap_timeout(),
            self.config.idle_timeout(),
        );
        for (id, error) in expired {
            warn!(stream = id, error = %error, "stream expired");
            self.abort_stream(id, &error);
        }
    }

    fn link_down(&self, id: LinkId) {
        let (removed, remaining) = {
            let mut links = self.links.lock();
            let removed = links.report_failure(id);
            (removed, links.len())
        };
        let Some(link) = removed else {
            return;
        };

        info!(link = id, name = %link.name(), remaining, "link down");
        if remaining == 0 && self.state() == SessionState::Established {
            warn!(session = %self.token, "all links lost");
            self.close();
        }
    }

    /// Close the session: tell the peer on every link, stop every task
    pub fn close(&self) {
        {
            let mut state = self.state.write();
            if matches!(*state, SessionState::Closing | SessionState::Closed) {
                return;
            }
            *state = SessionState::Closing;
        }

        let links = self.links.lock().drain();
        for link in &links {
            let _ = link.send_uncharged(&Frame::session_close());
            link.shutdown();
        }

        self.shutdown.send_replace(true);
        self.streams.lock().clear();
        self.pending.lock().clear();

        *self.state.write() = SessionState::Closed;
        info!(session = %self.token, links = links.len(), "session closed");
    }

    /// Resolves once the session is closed
    pub async fn closed(&self) {
        let mut shutdown = self.shutdown.subscribe();
        let _ = shutdown.wait_for(|closed| *closed).await;
    }

    /// Woken whenever a link is added, removed or recovers
    pub fn link_changes(&self) -> Arc<Notify> {
        self.link_changes.clone()
    }

    pub fn link_count(&self) -> usize {
        self.links.lock().len()
    }

    pub fn healthy_links(&self) -> usize {
        self.links.lock().healthy_count()
    }

    /// Names of the links currently in rotation
    pub fn link_names(&self) -> Vec<String> {
        self.links
            .lock()
            .links()
            .iter()
            .map(|l| l.name().to_string())
            .collect()
    }

    pub fn link_stats(&self) -> Vec<(LinkId, LinkHealth, LinkStats)> {
        self.links
            .lock()
            .links()
            .iter()
            .map(|l| (l.id(), l.health(), l.stats()))
            .collect()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.lock().len()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("token", &self.token)
            .field("role", &self.role)
            .field("target", &self.target)
            .field("state", &self.state())
            .finish()
    }
}

fn spawn_sweeper(session: Weak<Session>, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wait_for(|closed| *closed) => break,
            }
            match session.upgrade() {
                Some(session) => session.sweep(),
                None => break,
            }
        }
    });
}

/// 16 random bytes as 32 hex characters
fn generate_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::FrameKind;
    use tokio::io::{duplex, AsyncWriteExt};

    fn config() -> TunnelConfig {
        TunnelConfig::default()
    }

    async fn next_frame<R: AsyncRead + Unpin>(peer: &mut FrameReader<R>) -> Frame {
        loop {
            let frame = peer.next_frame().await.unwrap().unwrap();
            if !frame.is_keepalive() {
                return frame;
            }
        }
    }

    #[tokio::test]
    async fn test_token_format() {
        let session = Session::acceptor(None, None, config());
        assert_eq!(session.token().len(), 32);
        assert!(session.token().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(session.state(), SessionState::AwaitingHandshake);
        assert_ne!(generate_token(), generate_token());
    }

    #[tokio::test]
    async fn test_first_link_establishes() {
        let session = Session::initiator("t", None, config());
        let (a, _b) = duplex(1024);
        session.attach_link("main", a).unwrap();
        assert_eq!(session.state(), SessionState::Established);
        assert_eq!(session.link_names(), vec!["main".to_string()]);
    }

    #[tokio::test]
    async fn test_open_refused_without_connector() {
        let session = Session::acceptor(None, None, config());
        let (local, remote) = duplex(64 * 1024);
        session.attach_link("main", local).unwrap();

        let (read, mut write) = tokio::io::split(remote);
        write
            .write_all(&Frame::open(1, 0, Bytes::from_static(b"example.com:80")).encode())
            .await
            .unwrap();

        let mut peer = FrameReader::new(read, 64 * 1024);
        let reply = next_frame(&mut peer).await;
        assert_eq!(reply.kind(), FrameKind::Reset);
        assert_eq!(reply.stream_id, 1);
    }

    #[tokio::test]
    async fn test_connect_timeout_and_ack() {
        let mut cfg = config();
        cfg.open_timeout_secs = 1;
        let session = Session::initiator("t", None, cfg);
        let (local, remote) = duplex(64 * 1024);
        session.attach_link("main", local).unwrap();
        let mut peer = FrameReader::new(remote, 64 * 1024);

        let pending = {
            let session = session.clone();
            tokio::spawn(async move { session.connect("example.com:443").await })
        };

        let open = next_frame(&mut peer).await;
        assert_eq!(open.kind(), FrameKind::Open);
        assert_eq!(open.stream_id, 1);
        assert_eq!(&open.payload[..], b"example.com:443");

        let mut remote = peer.into_inner();
        remote
            .write_all(&Frame::open(1, 0, Bytes::new()).encode())
            .await
            .unwrap();
        assert_eq!(pending.await.unwrap().unwrap(), 1);

        // Nobody answers the second open
        let err = session.connect("example.com:443").await.unwrap_err();
        assert!(matches!(err, TunnelError::OpenTimeout(3)));
        drop(remote);
    }

    #[tokio::test]
    async fn test_no_link_available() {
        let session = Session::initiator("t", None, config());
        let frame = Frame::data(1, 0, Bytes::from_static(b"x"));
        assert!(matches!(
            session.send_frame(&frame),
            Err(TunnelError::NoLinkAvailable)
        ));
    }

    #[tokio::test]
    async fn test_peer_close_ends_session() {
        let session = Session::acceptor(None, None, config());
        let (local, mut remote) = duplex(1024);
        session.attach_link("main", local).unwrap();

        remote
            .write_all(&Frame::session_close().encode())
            .await
            .unwrap();
        timeout(Duration::from_secs(5), session.closed())
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(
            session.open_local(),
            Err(TunnelError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_total_link_loss_closes() {
        let session = Session::initiator("t", None, config());
        let (a, a_remote) = duplex(1024);
        let (b, b_remote) = duplex(1024);
        session.attach_link("main", a).unwrap();
        session.attach_link("helper", b).unwrap();

        drop(a_remote);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!session.is_closed());
        assert_eq!(session.link_count(), 1);

        drop(b_remote);
        timeout(Duration::from_secs(5), session.closed())
            .await
            .unwrap();
    }
}
