//! Logical stream reassembly

use super::TunnelError;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{trace, warn};

/// Stream state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Waiting for the open handshake
    Opening,
    /// Stream is open and active
    Open,
    /// Local side has closed
    HalfClosedLocal,
    /// Remote side has closed
    HalfClosedRemote,
    /// Stream is fully closed
    Closed,
}

/// Read-side signal for the bridge feeding this stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Running,
    Paused,
    Cancelled,
}

/// Outcome of handing a frame to [`LogicalStream::receive`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receipt {
    /// Delivered in order, with this many frames in total (including drained ones)
    Delivered(usize),
    /// Held until the gap before it fills
    Buffered,
    /// Already seen, dropped
    Duplicate,
    /// Same seq with a different payload; the first copy is kept
    Conflict,
}

/// One multiplexed byte stream within a session
pub struct LogicalStream {
    id: u32,
    state: StreamState,
    target: Option<String>,
    next_deliver_seq: u64,
    next_send_seq: u64,
    reorder: BTreeMap<u64, Bytes>,
    buffered_bytes: usize,
    budget: usize,
    remote_fin_at: Option<u64>,
    gap_since: Option<Instant>,
    last_activity: Instant,
    consumer: Option<mpsc::UnboundedSender<Bytes>>,
    flow: watch::Sender<Flow>,
}

impl LogicalStream {
    /// Create a new stream
    pub fn new(id: u32, state: StreamState, budget: usize, now: Instant) -> Self {
        let (flow, _) = watch::channel(Flow::Running);
        Self {
            id,
            state,
            target: None,
            next_deliver_seq: 0,
            next_send_seq: 0,
            reorder: BTreeMap::new(),
            buffered_bytes: 0,
            budget,
            remote_fin_at: None,
            gap_since: None,
            last_activity: now,
            consumer: None,
            flow,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn set_target(&mut self, target: String) {
        self.target = Some(target);
    }

    pub fn next_deliver_seq(&self) -> u64 {
        self.next_deliver_seq
    }

    pub fn next_send_seq(&self) -> u64 {
        self.next_send_seq
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    pub fn has_consumer(&self) -> bool {
        self.consumer.is_some()
    }

    /// Subscribe to this stream's flow signal
    pub fn flow(&self) -> watch::Receiver<Flow> {
        self.flow.subscribe()
    }

    pub fn flow_state(&self) -> Flow {
        *self.flow.borrow()
    }

    /// Opening -> Open
    pub fn mark_open(&mut self) {
        if self.state == StreamState::Opening {
            self.state = StreamState::Open;
            self.check_remote_fin();
        }
    }

    /// Check if the local side may still send
    pub fn can_send(&self) -> bool {
        matches!(
            self.state,
            StreamState::Opening | StreamState::Open | StreamState::HalfClosedRemote
        )
    }

    /// Check if the remote side may still send
    pub fn can_recv(&self) -> bool {
        self.remote_fin_at.is_none()
    }

    /// Claim the next outgoing seq
    pub fn take_send_seq(&mut self, now: Instant) -> u64 {
        let seq = self.next_send_seq;
        self.next_send_seq += 1;
        self.last_activity = now;
        seq
    }

    /// Attach the in-order consumer, draining anything already deliverable
    pub fn attach(&mut self, consumer: mpsc::UnboundedSender<Bytes>, now: Instant) -> usize {
        self.consumer = Some(consumer);
        let delivered = self.drain(now);
        self.check_remote_fin();
        self.update_flow();
        delivered
    }

    /// Hand a received frame to the stream
    pub fn receive(
        &mut self,
        seq: u64,
        payload: Bytes,
        now: Instant,
    ) -> Result<Receipt, TunnelError> {
        self.last_activity = now;

        if seq < self.next_deliver_seq {
            trace!(stream = self.id, seq, "duplicate frame");
            return Ok(Receipt::Duplicate);
        }

        if let Some(fin) = self.remote_fin_at {
            if seq >= fin {
                warn!(stream = self.id, seq, fin, "data past remote close");
                return Ok(Receipt::Conflict);
            }
        }

        if let Some(existing) = self.reorder.get(&seq) {
            if *existing == payload {
                trace!(stream = self.id, seq, "duplicate frame");
                return Ok(Receipt::Duplicate);
            }
            warn!(stream = self.id, seq, "conflicting payload for seq, keeping first copy");
            return Ok(Receipt::Conflict);
        }

        let receipt = if seq == self.next_deliver_seq && self.consumer.is_some() {
            self.deliver(payload);
            Receipt::Delivered(1 + self.drain(now))
        } else {
            if self.buffered_bytes + payload.len() > self.budget * 4 {
                return Err(TunnelError::BufferOverflow(self.id));
            }
            self.buffered_bytes += payload.len();
            self.reorder.insert(seq, payload);
            Receipt::Buffered
        };

        self.update_gap(now, matches!(receipt, Receipt::Delivered(_)));
        self.check_remote_fin();
        self.update_flow();
        Ok(receipt)
    }

    /// Record the remote close boundary; takes effect once delivery reaches it
    pub fn close_remote(&mut self, fin_at: u64, now: Instant) {
        self.last_activity = now;
        if self.remote_fin_at.is_none() {
            self.remote_fin_at = Some(fin_at);
        }
        self.check_remote_fin();
    }

    /// Close local side
    pub fn close_local(&mut self) {
        self.state = match self.state {
            StreamState::Opening | StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            _ => self.state,
        };
    }

    /// Tear the stream down and stop its bridge
    pub fn cancel(&mut self) {
        self.state = StreamState::Closed;
        self.consumer = None;
        self.reorder.clear();
        self.buffered_bytes = 0;
        self.flow.send_replace(Flow::Cancelled);
    }

    /// Both directions closed and nothing left to hand over
    pub fn is_finished(&self) -> bool {
        self.state == StreamState::Closed && self.reorder.is_empty()
    }

    /// A gap has been held without progress for at least `timeout`
    pub fn is_stalled(&self, now: Instant, timeout: Duration) -> bool {
        self.gap_since
            .map(|since| now.saturating_duration_since(since) >= timeout)
            .unwrap_or(false)
    }

    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) >= timeout
    }

    fn deliver(&mut self, payload: Bytes) {
        self.next_deliver_seq += 1;
        if payload.is_empty() {
            return;
        }
        if let Some(consumer) = &self.consumer {
            // The bridge may already be gone; the stream is torn down elsewhere.
            let _ = consumer.send(payload);
        }
    }

    fn drain(&mut self, now: Instant) -> usize {
        if self.consumer.is_none() {
            return 0;
        }
        let mut delivered = 0;
        while let Some(payload) = self.reorder.remove(&self.next_deliver_seq) {
            self.buffered_bytes -= payload.len();
            self.deliver(payload);
            delivered += 1;
        }
        if delivered > 0 {
            self.update_gap(now, true);
        }
        delivered
    }

    fn holds_gap(&self) -> bool {
        match self.reorder.keys().next() {
            Some(first) => *first > self.next_deliver_seq || self.state == StreamState::Opening,
            None => false,
        }
    }

    fn update_gap(&mut self, now: Instant, progressed: bool) {
        if !self.holds_gap() {
            self.gap_since = None;
        } else if progressed || self.gap_since.is_none() {
            self.gap_since = Some(now);
        }
    }

    fn check_remote_fin(&mut self) {
        let Some(fin) = self.remote_fin_at else {
            return;
        };
        if self.next_deliver_seq < fin || self.state == StreamState::Opening {
            return;
        }

        // Dropping the sender lets the bridge shut the backend's write side.
        self.consumer = None;
        self.state = match self.state {
            StreamState::HalfClosedLocal => StreamState::Closed,
            StreamState::Open => StreamState::HalfClosedRemote,
            other => other,
        };
    }

    fn update_flow(&mut self) {
        let next = if self.buffered_bytes > self.budget {
            Flow::Paused
        } else {
            Flow::Running
        };
        self.flow.send_if_modified(|flow| {
            if *flow == Flow::Cancelled || *flow == next {
                return false;
            }
            *flow = next;
            true
        });
    }
}
