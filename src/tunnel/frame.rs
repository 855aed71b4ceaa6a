use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

// Constants
pub const MAGIC: u16 = 0xABCD;
pub const FRAME_HEADER_SIZE: usize = 16; // magic(2) + event(2) + conn_id(4) + index(4) + len(4)
pub const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// Event carried by a frame. The numeric codes are the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum EventType {
    Ping = 10,
    Pong = 11,
    Open = 12,
    Data = 13,
    Req = 14,
    Ack = 15,
    Listen = 16,
}

impl EventType {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            10 => Some(EventType::Ping),
            11 => Some(EventType::Pong),
            12 => Some(EventType::Open),
            13 => Some(EventType::Data),
            14 => Some(EventType::Req),
            15 => Some(EventType::Ack),
            16 => Some(EventType::Listen),
            _ => None,
        }
    }

    pub fn as_u16(&self) -> u16 {
        *self as u16
    }

    pub fn name(&self) -> &'static str {
        match self {
            EventType::Ping => "ping",
            EventType::Pong => "pong",
            EventType::Open => "open",
            EventType::Data => "data",
            EventType::Req => "req",
            EventType::Ack => "ack",
            EventType::Listen => "listen",
        }
    }
}

// Frame Struct
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    event: EventType,
    conn_id: u32,
    index: u32,
    body: Bytes,
}

impl Frame {
    pub fn new(event: EventType, conn_id: u32, index: u32, body: Bytes) -> Self {
        Self {
            event,
            conn_id,
            index,
            body,
        }
    }

    pub fn ping(timestamp: u32) -> Self {
        Self::new(EventType::Ping, 0, timestamp, Bytes::new())
    }

    pub fn pong(timestamp: u32) -> Self {
        Self::new(EventType::Pong, 0, timestamp, Bytes::new())
    }

    /// Announces a logical connection and the address the far side should dial.
    pub fn open(conn_id: u32, target: &str) -> Self {
        Self::new(
            EventType::Open,
            conn_id,
            0,
            Bytes::copy_from_slice(target.as_bytes()),
        )
    }

    pub fn data(conn_id: u32, index: u32, body: Bytes) -> Self {
        Self::new(EventType::Data, conn_id, index, body)
    }

    pub fn req(conn_id: u32, index: u32) -> Self {
        Self::new(EventType::Req, conn_id, index, Bytes::new())
    }

    pub fn ack(conn_id: u32, index: u32) -> Self {
        Self::new(EventType::Ack, conn_id, index, Bytes::new())
    }

    pub fn listen(forward_spec: &str) -> Self {
        Self::new(
            EventType::Listen,
            0,
            0,
            Bytes::copy_from_slice(forward_spec.as_bytes()),
        )
    }

    // Accessors
    pub fn event(&self) -> EventType {
        self.event
    }

    pub fn conn_id(&self) -> u32 {
        self.conn_id
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// Body interpreted as an address string (open / listen frames).
    pub fn body_str(&self) -> Result<&str, FrameError> {
        std::str::from_utf8(&self.body).map_err(|_| FrameError::InvalidText(self.event.name()))
    }

    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.body.len()
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u16_le(MAGIC);
        dst.put_u16_le(self.event.as_u16());
        dst.put_u32_le(self.conn_id);
        dst.put_u32_le(self.index);
        dst.put_u32_le(self.body.len() as u32);
        dst.extend_from_slice(&self.body);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }
}

/// Incremental decoder over a growing accumulator.
///
/// Partial headers and bodies are left in the buffer until more bytes arrive.
/// A wrong magic at the current offset is skipped one byte at a time, which
/// recovers from corrupted framing but is not a security boundary.
#[derive(Debug, Default)]
pub struct FrameCodec {
    skipped: u64,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes discarded while scanning for a valid magic.
    pub fn skipped_bytes(&self) -> u64 {
        self.skipped
    }

    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        loop {
            if src.len() < FRAME_HEADER_SIZE {
                return Ok(None);
            }

            let magic = u16::from_le_bytes([src[0], src[1]]);
            if magic != MAGIC {
                src.advance(1);
                self.skipped += 1;
                continue;
            }

            let code = u16::from_le_bytes([src[2], src[3]]);
            let conn_id = u32::from_le_bytes([src[4], src[5], src[6], src[7]]);
            let index = u32::from_le_bytes([src[8], src[9], src[10], src[11]]);
            let length = u32::from_le_bytes([src[12], src[13], src[14], src[15]]) as usize;

            let event = EventType::from_u16(code).ok_or(FrameError::UnknownEvent(code))?;

            if length > MAX_BODY_SIZE {
                return Err(FrameError::BodyTooLarge {
                    size: length,
                    max: MAX_BODY_SIZE,
                });
            }

            if src.len() < FRAME_HEADER_SIZE + length {
                src.reserve(FRAME_HEADER_SIZE + length - src.len());
                return Ok(None);
            }

            src.advance(FRAME_HEADER_SIZE);
            let body = src.split_to(length).freeze();
            return Ok(Some(Frame::new(event, conn_id, index, body)));
        }
    }

    /// Drains every complete frame currently buffered.
    pub fn decode_all(&mut self, src: &mut BytesMut) -> Result<Vec<Frame>, FrameError> {
        let mut frames = Vec::new();
        while let Some(frame) = self.decode(src)? {
            frames.push(frame);
        }
        Ok(frames)
    }
}

// FrameError
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Unknown event type: {0}")]
    UnknownEvent(u16),

    #[error("Frame body too large: {size} bytes (max: {max})")]
    BodyTooLarge { size: usize, max: usize },

    #[error("Body of {0} frame is not valid UTF-8")]
    InvalidText(&'static str),
}
