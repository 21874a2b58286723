//! Stream table for a session
//!
//! Routes incoming frames to their logical streams and builds the frames
//! each stream sends. Holds no I/O; the session drives it under a lock.

use super::{
    flags, Flow, Frame, FrameKind, LogicalStream, Receipt, StreamState, TunnelError, MAX_STREAMS,
};
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Number of destroyed stream ids remembered
const RETIRED_CAPACITY: usize = 4096;

/// Which end of the session this table belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dials links, allocates odd stream ids
    Initiator,
    /// Accepts links, allocates even stream ids
    Acceptor,
}

impl Role {
    fn first_id(self) -> u32 {
        match self {
            Role::Initiator => 1,
            Role::Acceptor => 2,
        }
    }

    /// Whether `id` was allocated by this side
    pub fn owns(self, id: u32) -> bool {
        match self {
            Role::Initiator => id % 2 == 1,
            Role::Acceptor => id != 0 && id % 2 == 0,
        }
    }
}

/// What the session must do after a frame was routed
#[derive(Debug)]
pub enum Dispatch {
    /// Nothing further (keepalive, late or stale frame)
    Nothing,
    /// Frame was handed to a stream
    Received { id: u32, receipt: Receipt },
    /// The peer opened a stream; dial `target`, or the session default when `None`
    Opened { id: u32, target: Option<String> },
    /// Our open was acknowledged
    Accepted(u32),
    /// Our open was refused
    Refused(u32),
    /// The peer reset the stream; it has been removed and cancelled
    Reset(u32),
    /// Both directions done, stream removed
    Finished(u32),
    /// The stream must be torn down
    Abort { id: u32, error: TunnelError },
    /// Send this frame back to the peer
    Reply(Frame),
    /// Peer closed the whole session
    SessionClose,
}

/// Active logical streams keyed by id
pub struct StreamTable {
    role: Role,
    connect_style: bool,
    budget: usize,
    streams: HashMap<u32, LogicalStream>,
    next_local_id: u32,
    retired: HashSet<u32>,
    retired_order: VecDeque<u32>,
}

impl StreamTable {
    /// Create a table. `connect_style` sessions carry stream data in open frames.
    pub fn new(role: Role, budget: usize, connect_style: bool) -> Self {
        Self {
            role,
            connect_style,
            budget,
            streams: HashMap::new(),
            next_local_id: role.first_id(),
            retired: HashSet::new(),
            retired_order: VecDeque::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_connect_style(&self) -> bool {
        self.connect_style
    }

    /// Allocate a local stream id and register the stream
    pub fn open_local(&mut self, state: StreamState, now: Instant) -> Result<u32, TunnelError> {
        if self.streams.len() >= MAX_STREAMS {
            return Err(TunnelError::TooManyStreams);
        }

        let id = self.next_local_id;
        self.next_local_id = self
            .next_local_id
            .checked_add(2)
            .ok_or(TunnelError::TooManyStreams)?;

        self.streams
            .insert(id, LogicalStream::new(id, state, self.budget, now));
        Ok(id)
    }

    /// Build the control open frame carrying `target`
    pub fn prepare_open(&mut self, id: u32, target: &str) -> Result<Frame, TunnelError> {
        let stream = self
            .streams
            .get_mut(&id)
            .ok_or(TunnelError::StreamNotFound(id))?;
        stream.set_target(target.to_string());
        Ok(Frame::open(
            id,
            stream.next_send_seq(),
            Bytes::copy_from_slice(target.as_bytes()),
        ))
    }

    /// Build the next data frame for a stream
    pub fn prepare_send(
        &mut self,
        id: u32,
        payload: Bytes,
        now: Instant,
    ) -> Result<Frame, TunnelError> {
        let role = self.role;
        let connect_style = self.connect_style;
        let stream = self
            .streams
            .get_mut(&id)
            .ok_or(TunnelError::StreamNotFound(id))?;
        if !stream.can_send() {
            return Err(TunnelError::StreamClosed);
        }

        let first = stream.next_send_seq() == 0;
        let seq = stream.take_send_seq(now);
        if connect_style && role.owns(id) && first {
            Ok(Frame::open(id, seq, payload))
        } else {
            Ok(Frame::data(id, seq, payload))
        }
    }

    /// Half-close the local direction and build the close frame
    pub fn prepare_close(&mut self, id: u32) -> Result<Frame, TunnelError> {
        let role = self.role;
        let connect_style = self.connect_style;
        let stream = self
            .streams
            .get_mut(&id)
            .ok_or(TunnelError::StreamNotFound(id))?;

        let seq = stream.next_send_seq();
        let mut frame = Frame::close(id, seq);
        if connect_style && role.owns(id) && seq == 0 {
            // Nothing was sent yet, so the peer has not seen the open
            frame.flags |= flags::OPEN;
        }

        stream.close_local();
        if stream.is_finished() {
            self.remove(id);
        }
        Ok(frame)
    }

    /// Attach the in-order consumer of a stream
    pub fn attach(
        &mut self,
        id: u32,
        consumer: mpsc::UnboundedSender<Bytes>,
        now: Instant,
    ) -> Result<watch::Receiver<Flow>, TunnelError> {
        let stream = self
            .streams
            .get_mut(&id)
            .ok_or(TunnelError::StreamNotFound(id))?;
        stream.attach(consumer, now);
        let flow = stream.flow();
        if stream.is_finished() {
            self.remove(id);
        }
        Ok(flow)
    }

    /// Route one received frame
    pub fn dispatch(&mut self, frame: Frame, now: Instant) -> Dispatch {
        let id = frame.stream_id;
        if id == 0 {
            return match frame.kind() {
                FrameKind::Close => Dispatch::SessionClose,
                _ => Dispatch::Nothing,
            };
        }

        if frame.kind() == FrameKind::Reset {
            return self.on_reset(id);
        }

        if self.retired.contains(&id) {
            trace!(stream = id, seq = frame.seq, "frame for retired stream");
            return Dispatch::Nothing;
        }

        match frame.kind() {
            FrameKind::Open => self.on_open(frame, now),
            FrameKind::Close => self.on_close(frame, now),
            FrameKind::Data => self.on_data(frame, now),
            FrameKind::Reset => Dispatch::Nothing,
        }
    }

    fn on_reset(&mut self, id: u32) -> Dispatch {
        let Some(mut stream) = self.streams.remove(&id) else {
            // A reset may overtake the open on another link
            if !self.role.owns(id) {
                self.retire(id);
            }
            trace!(stream = id, "reset for unknown stream");
            return Dispatch::Nothing;
        };

        let opening = stream.state() == StreamState::Opening;
        stream.cancel();
        self.retire(id);

        if opening && self.role.owns(id) {
            Dispatch::Refused(id)
        } else {
            debug!(stream = id, "stream reset by peer");
            Dispatch::Reset(id)
        }
    }

    fn on_open(&mut self, frame: Frame, now: Instant) -> Dispatch {
        let id = frame.stream_id;

        if self.role.owns(id) {
            return match self.streams.get_mut(&id) {
                Some(stream) if stream.state() == StreamState::Opening => {
                    stream.mark_open();
                    Dispatch::Accepted(id)
                }
                _ => Dispatch::Nothing,
            };
        }

        let connect_style = self.connect_style;
        let stream = match self.remote_stream(id, now) {
            Ok(stream) => stream,
            Err(reply) => return reply,
        };
        let fresh = stream.state() == StreamState::Opening;
        stream.mark_open();

        let has_close = frame.has_close();
        let mut fin = frame.seq;
        let target = if connect_style {
            if !frame.payload.is_empty() {
                fin = match fin_after(id, frame.seq) {
                    Ok(fin) => fin,
                    Err(error) => return Dispatch::Abort { id, error },
                };
                if let Err(error) = stream.receive(frame.seq, frame.payload, now) {
                    return Dispatch::Abort { id, error };
                }
            }
            None
        } else if frame.payload.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&frame.payload).into_owned())
        };

        if has_close {
            stream.close_remote(fin, now);
        }

        if !fresh {
            trace!(stream = id, "repeated open");
            return Dispatch::Nothing;
        }
        if let Some(target) = &target {
            stream.set_target(target.clone());
        }
        Dispatch::Opened { id, target }
    }

    fn on_close(&mut self, frame: Frame, now: Instant) -> Dispatch {
        let id = frame.stream_id;

        if self.role.owns(id) && !self.streams.contains_key(&id) {
            return Dispatch::Nothing;
        }

        let stream = match self.remote_stream(id, now) {
            Ok(stream) => stream,
            Err(reply) => return reply,
        };

        let mut receipt = Receipt::Duplicate;
        let mut fin = frame.seq;
        if !frame.payload.is_empty() {
            fin = match fin_after(id, frame.seq) {
                Ok(fin) => fin,
                Err(error) => return Dispatch::Abort { id, error },
            };
            match stream.receive(frame.seq, frame.payload, now) {
                Ok(r) => receipt = r,
                Err(error) => return Dispatch::Abort { id, error },
            }
        }
        stream.close_remote(fin, now);
        debug!(stream = id, fin, "remote close");

        self.finish_or(id, receipt)
    }

    fn on_data(&mut self, frame: Frame, now: Instant) -> Dispatch {
        let id = frame.stream_id;

        if self.role.owns(id) && !self.streams.contains_key(&id) {
            trace!(stream = id, seq = frame.seq, "data for unknown local stream");
            return Dispatch::Nothing;
        }

        let stream = match self.remote_stream(id, now) {
            Ok(stream) => stream,
            Err(reply) => return reply,
        };

        match stream.receive(frame.seq, frame.payload, now) {
            Ok(receipt) => self.finish_or(id, receipt),
            Err(error) => Dispatch::Abort { id, error },
        }
    }

    /// Existing stream, or a new remote one in `Opening` awaiting its open frame
    fn remote_stream(&mut self, id: u32, now: Instant) -> Result<&mut LogicalStream, Dispatch> {
        if !self.streams.contains_key(&id) {
            if self.streams.len() >= MAX_STREAMS {
                warn!(stream = id, "stream limit reached, refusing");
                self.retire(id);
                return Err(Dispatch::Reply(Frame::reset(id)));
            }
            self.streams.insert(
                id,
                LogicalStream::new(id, StreamState::Opening, self.budget, now),
            );
        }
        self.streams
            .get_mut(&id)
            .ok_or(Dispatch::Nothing)
    }

    fn finish_or(&mut self, id: u32, receipt: Receipt) -> Dispatch {
        let finished = self
            .streams
            .get(&id)
            .map(|s| s.is_finished())
            .unwrap_or(false);
        if finished {
            self.remove(id);
            Dispatch::Finished(id)
        } else {
            Dispatch::Received { id, receipt }
        }
    }

    /// Remove and cancel a stream, returning the reset to send the peer
    pub fn abort(&mut self, id: u32) -> Option<Frame> {
        let mut stream = self.streams.remove(&id)?;
        stream.cancel();
        self.retire(id);
        Some(Frame::reset(id))
    }

    /// Streams whose gap or idle timer expired
    pub fn sweep(
        &self,
        now: Instant,
        gap_timeout: Duration,
        idle_timeout: Duration,
    ) -> Vec<(u32, TunnelError)> {
        self.streams
            .values()
            .filter_map(|stream| {
                let id = stream.id();
                if stream.is_stalled(now, gap_timeout) {
                    Some((id, TunnelError::StreamStalled(id)))
                } else if stream.is_idle(now, idle_timeout) {
                    Some((id, TunnelError::StreamIdle(id)))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Cancel every stream
    pub fn clear(&mut self) {
        for (_, mut stream) in self.streams.drain() {
            stream.cancel();
        }
    }

    fn remove(&mut self, id: u32) {
        if self.streams.remove(&id).is_some() {
            debug!(stream = id, "stream finished");
            self.retire(id);
        }
    }

    fn retire(&mut self, id: u32) {
        if self.retired.insert(id) {
            self.retired_order.push_back(id);
            if self.retired_order.len() > RETIRED_CAPACITY {
                if let Some(old) = self.retired_order.pop_front() {
                    self.retired.remove(&old);
                }
            }
        }
    }

    pub fn get(&self, id: u32) -> Option<&LogicalStream> {
        self.streams.get(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.streams.contains_key(&id)
    }

    pub fn is_retired(&self, id: u32) -> bool {
        self.retired.contains(&id)
    }

    /// Get number of active streams
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

/// Close boundary of a frame carrying data at `seq`
fn fin_after(id: u32, seq: u64) -> Result<u64, TunnelError> {
    seq.checked_add(1)
        .ok_or(TunnelError::ProtocolViolation(id, "sequence number exhausted"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> Instant {
        Instant::now()
    }

    #[test]
    fn test_stream_ids() {
        let mut client = StreamTable::new(Role::Initiator, 1024, false);
        assert_eq!(client.open_local(StreamState::Opening, now()).unwrap(), 1);
        assert_eq!(client.open_local(StreamState::Opening, now()).unwrap(), 3);

        let mut server = StreamTable::new(Role::Acceptor, 1024, false);
        assert_eq!(server.open_local(StreamState::Open, now()).unwrap(), 2);
        assert_eq!(server.open_local(StreamState::Open, now()).unwrap(), 4);

        assert!(Role::Acceptor.owns(2));
        assert!(!Role::Acceptor.owns(0));
        assert!(Role::Initiator.owns(1));
    }

    #[test]
    fn test_remote_open_with_target() {
        let mut server = StreamTable::new(Role::Acceptor, 1024, false);
        let frame = Frame::open(1, 0, Bytes::from_static(b"example.com:443"));

        match server.dispatch(frame, now()) {
            Dispatch::Opened { id, target } => {
                assert_eq!(id, 1);
                assert_eq!(target.as_deref(), Some("example.com:443"));
            }
            other => panic!("unexpected {:?}", other),
        }
        let stream = server.get(1).unwrap();
        assert_eq!(stream.state(), StreamState::Open);
        assert_eq!(stream.next_deliver_seq(), 0);
    }

    #[test]
    fn test_open_ack_and_refusal() {
        let mut client = StreamTable::new(Role::Initiator, 1024, false);
        let a = client.open_local(StreamState::Opening, now()).unwrap();
        let b = client.open_local(StreamState::Opening, now()).unwrap();

        assert!(matches!(
            client.dispatch(Frame::open(a, 0, Bytes::new()), now()),
            Dispatch::Accepted(id) if id == a
        ));
        assert_eq!(client.get(a).unwrap().state(), StreamState::Open);

        assert!(matches!(
            client.dispatch(Frame::reset(b), now()),
            Dispatch::Refused(id) if id == b
        ));
        assert!(!client.contains(b));
        assert!(client.is_retired(b));
    }

    #[test]
    fn test_close_overtaking_ack_is_not_refusal() {
        let mut client = StreamTable::new(Role::Initiator, 1024, false);
        let id = client.open_local(StreamState::Opening, now()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.attach(id, tx, now()).unwrap();

        // The backend closed at once and its close won the race against the ack
        assert!(matches!(
            client.dispatch(Frame::close(id, 0), now()),
            Dispatch::Received { .. }
        ));
        assert_eq!(client.get(id).unwrap().state(), StreamState::Opening);

        assert!(matches!(
            client.dispatch(Frame::open(id, 0, Bytes::new()), now()),
            Dispatch::Accepted(a) if a == id
        ));
        assert_eq!(client.get(id).unwrap().state(), StreamState::HalfClosedRemote);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_reset_cancels_open_stream() {
        let mut server = StreamTable::new(Role::Acceptor, 1024, false);
        let t = now();
        server.dispatch(Frame::open(1, 0, Bytes::from_static(b"h:1")), t);
        let (tx, _rx) = mpsc::unbounded_channel();
        let flow = server.attach(1, tx, t).unwrap();

        assert!(matches!(server.dispatch(Frame::reset(1), t), Dispatch::Reset(1)));
        assert_eq!(*flow.borrow(), Flow::Cancelled);
        assert!(!server.contains(1));

        // Nothing after the reset brings it back
        assert!(matches!(
            server.dispatch(Frame::data(1, 0, Bytes::from_static(b"x")), t),
            Dispatch::Nothing
        ));
        assert!(matches!(server.dispatch(Frame::reset(1), t), Dispatch::Nothing));
    }

    #[test]
    fn test_reset_before_open_blocks_the_open() {
        let mut server = StreamTable::new(Role::Acceptor, 1024, false);
        assert!(matches!(server.dispatch(Frame::reset(7), now()), Dispatch::Nothing));
        assert!(matches!(
            server.dispatch(Frame::open(7, 0, Bytes::from_static(b"h:1")), now()),
            Dispatch::Nothing
        ));
        assert!(!server.contains(7));
    }

    #[test]
    fn test_last_seq_with_payload_is_a_violation() {
        let mut server = StreamTable::new(Role::Acceptor, 1024, false);
        let t = now();
        server.dispatch(Frame::open(1, 0, Bytes::from_static(b"h:1")), t);

        let mut close = Frame::close(1, u64::MAX);
        close.payload = Bytes::from_static(b"x");
        assert!(matches!(
            server.dispatch(close, t),
            Dispatch::Abort { id: 1, error: TunnelError::ProtocolViolation(1, _) }
        ));

        let mut connect = StreamTable::new(Role::Acceptor, 1024, true);
        let mut open = Frame::open(3, u64::MAX, Bytes::from_static(b"x"));
        open.flags |= flags::CLOSE;
        assert!(matches!(
            connect.dispatch(open, t),
            Dispatch::Abort { id: 3, error: TunnelError::ProtocolViolation(3, _) }
        ));
    }

    #[test]
    fn test_orphan_data_waits_for_open() {
        let mut server = StreamTable::new(Role::Acceptor, 1024, false);

        assert!(matches!(
            server.dispatch(Frame::data(5, 0, Bytes::from_static(b"early")), now()),
            Dispatch::Received { id: 5, receipt: Receipt::Buffered }
        ));
        assert_eq!(server.get(5).unwrap().state(), StreamState::Opening);

        assert!(matches!(
            server.dispatch(Frame::open(5, 0, Bytes::from_static(b"h:1")), now()),
            Dispatch::Opened { id: 5, .. }
        ));

        let (tx, mut rx) = mpsc::unbounded_channel();
        server.attach(5, tx, now()).unwrap();
        assert_eq!(&rx.try_recv().unwrap()[..], b"early");
    }

    #[test]
    fn test_connect_style_open_carries_data() {
        let mut server = StreamTable::new(Role::Acceptor, 1024, true);
        let t = now();

        assert!(matches!(
            server.dispatch(Frame::open(1, 0, Bytes::from_static(b"GET /")), t),
            Dispatch::Opened { id: 1, target: None }
        ));
        server.dispatch(Frame::data(1, 2, Bytes::from_static(b"\r\n\r\n")), t);
        server.dispatch(Frame::data(1, 1, Bytes::new()), t);

        let (tx, mut rx) = mpsc::unbounded_channel();
        server.attach(1, tx, t).unwrap();
        let mut out = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, b"GET /\r\n\r\n");
    }

    #[test]
    fn test_connect_style_first_chunk_opens() {
        let mut client = StreamTable::new(Role::Initiator, 1024, true);
        let id = client.open_local(StreamState::Open, now()).unwrap();

        let first = client.prepare_send(id, Bytes::from_static(b"a"), now()).unwrap();
        let second = client.prepare_send(id, Bytes::from_static(b"b"), now()).unwrap();
        assert_eq!(first.kind(), FrameKind::Open);
        assert_eq!(first.seq, 0);
        assert_eq!(second.kind(), FrameKind::Data);
        assert_eq!(second.seq, 1);

        let close = client.prepare_close(id).unwrap();
        assert_eq!(close.kind(), FrameKind::Close);
        assert_eq!(close.seq, 2);
    }

    #[test]
    fn test_close_completes_and_retires() {
        let mut server = StreamTable::new(Role::Acceptor, 1024, false);
        let t = now();
        server.dispatch(Frame::open(1, 0, Bytes::from_static(b"h:1")), t);
        let (tx, _rx) = mpsc::unbounded_channel();
        server.attach(1, tx, t).unwrap();

        server.dispatch(Frame::data(1, 0, Bytes::from_static(b"x")), t);
        assert!(matches!(
            server.dispatch(Frame::close(1, 1), t),
            Dispatch::Received { id: 1, .. }
        ));

        let close = server.prepare_close(1).unwrap();
        assert_eq!(close.seq, 0);
        assert!(!server.contains(1));

        // Late frames never resurrect the stream
        assert!(matches!(
            server.dispatch(Frame::data(1, 0, Bytes::from_static(b"x")), t),
            Dispatch::Nothing
        ));
        assert!(!server.contains(1));
    }

    #[test]
    fn test_session_level_frames() {
        let mut table = StreamTable::new(Role::Acceptor, 1024, false);
        assert!(matches!(
            table.dispatch(Frame::keepalive(), now()),
            Dispatch::Nothing
        ));
        assert!(matches!(
            table.dispatch(Frame::session_close(), now()),
            Dispatch::SessionClose
        ));
    }

    #[test]
    fn test_sweep_reports_stalled_and_idle() {
        let mut server = StreamTable::new(Role::Acceptor, 1024, false);
        let t = now();
        server.dispatch(Frame::open(1, 0, Bytes::from_static(b"h:1")), t);
        server.dispatch(Frame::open(3, 0, Bytes::from_static(b"h:1")), t);
        let (tx, _rx) = mpsc::unbounded_channel();
        server.attach(1, tx, t).unwrap();
        server.dispatch(Frame::data(1, 4, Bytes::from_static(b"gap")), t);

        let gap = Duration::from_secs(30);
        let idle = Duration::from_secs(300);
        let expired = server.sweep(t + gap, gap, idle);
        assert_eq!(expired.len(), 1);
        assert!(matches!(expired[0], (1, TunnelError::StreamStalled(1))));

        let expired = server.sweep(t + idle, gap, idle);
        assert_eq!(expired.len(), 2);
    }

    #[test]
    fn test_abort_returns_reset_frame() {
        let mut client = StreamTable::new(Role::Initiator, 1024, false);
        let id = client.open_local(StreamState::Open, now()).unwrap();
        client.prepare_send(id, Bytes::from_static(b"a"), now()).unwrap();

        let reset = client.abort(id).unwrap();
        assert_eq!(reset.kind(), FrameKind::Reset);
        assert_eq!(reset.stream_id, id);
        assert!(client.abort(id).is_none());
    }
}
