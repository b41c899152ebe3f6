//! Relay wire framing
//!
//! Every frame is a fixed 9-byte header followed by the payload:
//!
//! ```text
//! +------+-------------+---------+----------+
//! | type | stream_id   | length  | payload  |
//! | u8   | u32 BE      | u32 BE  | length B |
//! +------+-------------+---------+----------+
//! ```
//!
//! Stream id 0 is the control stream (Hello/Ping/Pong).

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::Result;
use crate::error::Error;

/// Maximum payload carried by a single frame (64 KiB)
pub const MAX_PAYLOAD: usize = 64 * 1024;

const HEADER_LEN: usize = 9;

/// Frame types on the relay connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Hello = 1,
    Ping = 2,
    Pong = 3,
    OpenStream = 4,
    Data = 5,
    CloseStream = 6,
}

impl FrameType {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(FrameType::Hello),
            2 => Some(FrameType::Ping),
            3 => Some(FrameType::Pong),
            4 => Some(FrameType::OpenStream),
            5 => Some(FrameType::Data),
            6 => Some(FrameType::CloseStream),
            _ => None,
        }
    }
}

/// Client identification sent in the Hello frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloInfo {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partner_id: Option<String>,
}

/// A single frame on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn hello(info: &HelloInfo) -> Result<Frame> {
        let payload = serde_json::to_vec(info)?;
        Ok(Frame {
            frame_type: FrameType::Hello,
            stream_id: 0,
            payload: Bytes::from(payload),
        })
    }

    pub fn ping() -> Frame {
        Frame {
            frame_type: FrameType::Ping,
            stream_id: 0,
            payload: Bytes::new(),
        }
    }

    pub fn pong() -> Frame {
        Frame {
            frame_type: FrameType::Pong,
            stream_id: 0,
            payload: Bytes::new(),
        }
    }

    pub fn open_stream(stream_id: u32, target: &str) -> Frame {
        Frame {
            frame_type: FrameType::OpenStream,
            stream_id,
            payload: Bytes::copy_from_slice(target.as_bytes()),
        }
    }

    pub fn data(stream_id: u32, payload: Bytes) -> Frame {
        Frame {
            frame_type: FrameType::Data,
            stream_id,
            payload,
        }
    }

    pub fn close_stream(stream_id: u32) -> Frame {
        Frame {
            frame_type: FrameType::CloseStream,
            stream_id,
            payload: Bytes::new(),
        }
    }
}

/// Read one frame from the stream
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let frame_type = FrameType::from_byte(header[0])
        .ok_or_else(|| Error::Protocol(format!("unknown frame type: {}", header[0])))?;
    let stream_id = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    let len = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;

    if len > MAX_PAYLOAD {
        return Err(Error::Protocol(format!("frame too large: {} bytes", len)));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Frame {
        frame_type,
        stream_id,
        payload: Bytes::from(payload),
    })
}

/// Write one frame to the stream
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    debug_assert!(frame.payload.len() <= MAX_PAYLOAD);

    let mut buf = BytesMut::with_capacity(HEADER_LEN + frame.payload.len());
    buf.put_u8(frame.frame_type as u8);
    buf.put_u32(frame.stream_id);
    buf.put_u32(frame.payload.len() as u32);
    buf.put_slice(&frame.payload);

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}
