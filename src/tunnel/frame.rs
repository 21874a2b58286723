//! Frame encoding/decoding for the tunnel protocol
//!
//! Frame format (all integers little-endian):
//! ```text
//! +--------+--------+--------+--------+
//! |          Magic "DWNB" (4B)        |
//! +--------+--------+--------+--------+
//! | Version| Flags  |  Stream ID (4B) ...
//! +--------+--------+--------+--------+
//! ...     |      Sequence (8B) ...
//! +--------+--------+--------+--------+
//! ...     |  Payload Length (4B) ...
//! +--------+--------+--------+--------+
//! ...     |         Payload           |
//! +--------+--------+--------+--------+
//! ```

use super::TunnelError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame magic
pub const MAGIC: [u8; 4] = *b"DWNB";

/// Version written on every outgoing frame
pub const FRAME_VERSION: u8 = 1;

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 22;

/// Flag bits
pub mod flags {
    /// Sender's direction is finished
    pub const CLOSE: u8 = 0b0000_0001;
    /// First frame of a stream
    pub const OPEN: u8 = 0b0000_0010;
    /// Stream torn down, discard everything
    pub const RESET: u8 = 0b0000_0100;
}

/// What a frame means, derived from its flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Stream payload
    Data,
    /// Stream open (may also carry the close bit)
    Open,
    /// Half-close of the sender's direction
    Close,
    /// Abortive teardown of the whole stream
    Reset,
}

/// A protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Protocol version (accepted as-is on decode)
    pub version: u8,
    /// Flag bits, see [`flags`]
    pub flags: u8,
    /// Stream ID (0 for session-level frames)
    pub stream_id: u32,
    /// Per-stream sequence number
    pub seq: u64,
    /// Payload data
    pub payload: Bytes,
}

impl Frame {
    fn new(flags: u8, stream_id: u32, seq: u64, payload: Bytes) -> Self {
        Self {
            version: FRAME_VERSION,
            flags,
            stream_id,
            seq,
            payload,
        }
    }

    /// Create a data frame
    pub fn data(stream_id: u32, seq: u64, payload: Bytes) -> Self {
        Self::new(0, stream_id, seq, payload)
    }

    /// Create a stream open frame
    pub fn open(stream_id: u32, seq: u64, payload: Bytes) -> Self {
        Self::new(flags::OPEN, stream_id, seq, payload)
    }

    /// Create a stream close frame at the sender's final seq boundary
    pub fn close(stream_id: u32, seq: u64) -> Self {
        Self::new(flags::CLOSE, stream_id, seq, Bytes::new())
    }

    /// Create a stream reset; refusals and aborts both use it
    pub fn reset(stream_id: u32) -> Self {
        Self::new(flags::RESET, stream_id, 0, Bytes::new())
    }

    /// Create a link keepalive
    pub fn keepalive() -> Self {
        Self::new(0, 0, 0, Bytes::new())
    }

    /// Create a session close
    pub fn session_close() -> Self {
        Self::new(flags::CLOSE, 0, 0, Bytes::new())
    }

    pub fn kind(&self) -> FrameKind {
        if self.flags & flags::RESET != 0 {
            FrameKind::Reset
        } else if self.flags & flags::OPEN != 0 {
            FrameKind::Open
        } else if self.flags & flags::CLOSE != 0 {
            FrameKind::Close
        } else {
            FrameKind::Data
        }
    }

    pub fn has_close(&self) -> bool {
        self.flags & flags::CLOSE != 0
    }

    pub fn is_keepalive(&self) -> bool {
        self.stream_id == 0 && self.kind() == FrameKind::Data && self.payload.is_empty()
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_size());

        buf.put_slice(&MAGIC);
        buf.put_u8(self.version);
        buf.put_u8(self.flags);
        buf.put_u32_le(self.stream_id);
        buf.put_u64_le(self.seq);
        buf.put_u32_le(self.payload.len() as u32);
        buf.extend_from_slice(&self.payload);

        buf
    }

    /// Decode one frame from the front of `buf`, consuming it.
    ///
    /// Returns `Ok(None)` until a complete frame is buffered. Bad magic and
    /// oversized lengths are reported as soon as enough bytes are present to
    /// see them, before any payload is awaited.
    pub fn decode(buf: &mut BytesMut, max_payload: usize) -> Result<Option<Self>, TunnelError> {
        if buf.len() >= MAGIC.len() && buf[..4] != MAGIC {
            let mut magic = [0u8; 4];
            magic.copy_from_slice(&buf[..4]);
            return Err(TunnelError::MalformedFrame(magic));
        }

        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let payload_len = read_len(&buf[..FRAME_HEADER_SIZE]);
        if payload_len > max_payload {
            return Err(TunnelError::PayloadTooLarge(payload_len, max_payload));
        }

        if buf.len() < FRAME_HEADER_SIZE + payload_len {
            buf.reserve(FRAME_HEADER_SIZE + payload_len - buf.len());
            return Ok(None);
        }

        buf.advance(MAGIC.len());
        let version = buf.get_u8();
        let flags = buf.get_u8();
        let stream_id = buf.get_u32_le();
        let seq = buf.get_u64_le();
        buf.advance(4);
        let payload = buf.split_to(payload_len).freeze();

        Ok(Some(Self {
            version,
            flags,
            stream_id,
            seq,
            payload,
        }))
    }

    /// Parse one frame from a complete byte slice.
    ///
    /// Returns the frame and the number of bytes it occupied.
    pub fn parse(data: &[u8], max_payload: usize) -> Result<(Self, usize), TunnelError> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(TunnelError::TruncatedFrame {
                needed: FRAME_HEADER_SIZE,
                available: data.len(),
            });
        }

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&data[..4]);
        if magic != MAGIC {
            return Err(TunnelError::MalformedFrame(magic));
        }

        let payload_len = read_len(data);
        if payload_len > max_payload {
            return Err(TunnelError::PayloadTooLarge(payload_len, max_payload));
        }

        let total = FRAME_HEADER_SIZE + payload_len;
        if data.len() < total {
            return Err(TunnelError::TruncatedFrame {
                needed: total,
                available: data.len(),
            });
        }

        let mut header = &data[4..FRAME_HEADER_SIZE];
        let version = header.get_u8();
        let flags = header.get_u8();
        let stream_id = header.get_u32_le();
        let seq = header.get_u64_le();

        let frame = Self {
            version,
            flags,
            stream_id,
            seq,
            payload: Bytes::copy_from_slice(&data[FRAME_HEADER_SIZE..total]),
        };
        Ok((frame, total))
    }

    /// Get the total encoded size of this frame
    pub fn encoded_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }
}

fn read_len(header: &[u8]) -> usize {
    let mut len = &header[18..22];
    len.get_u32_le() as usize
}

/// Reads frames off a link.
///
/// Partial reads stay in the internal buffer, so `next_frame` can be raced
/// against a timer without losing bytes.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    max_payload: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_payload: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(16 * 1024),
            max_payload,
        }
    }

    /// Next frame, or `None` on a clean EOF at a frame boundary
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, TunnelError> {
        loop {
            if let Some(frame) = Frame::decode(&mut self.buf, self.max_payload)? {
                return Ok(Some(frame));
            }

            if self.inner.read_buf(&mut self.buf).await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                let needed = if self.buf.len() < FRAME_HEADER_SIZE {
                    FRAME_HEADER_SIZE
                } else {
                    FRAME_HEADER_SIZE + read_len(&self.buf)
                };
                return Err(TunnelError::TruncatedFrame {
                    needed,
                    available: self.buf.len(),
                });
            }
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Write one frame
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), TunnelError> {
    writer.write_all(&frame.encode()).await?;
    Ok(())
}
