//! Binary frame codec for the peer-to-peer data channel.
//!
//! Every frame is:
//!
//! ```text
//! [1B version=1][1B type][2B flags big-endian][payload]
//! ```
//!
//! The data channel delivers whole frames, so no outer length prefix is
//! needed; the payload runs to the end of the frame. Handshake payloads
//! are JSON objects inside the binary envelope; file chunks use the
//! tagged binary sub-structure in [`FileChunk`].

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Frame codec errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown frame type {0}")]
    UnknownType(u8),
    #[error("frame truncated")]
    Truncated,
}

/// Frame types carried over the data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Text = 1,
    HandshakeRequest = 2,
    HandshakeResponse = 3,
    FileChunk = 4,
    Ack = 7,
    Ping = 8,
    Pong = 9,
}

impl TryFrom<u8> for FrameType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            1 => Ok(FrameType::Text),
            2 => Ok(FrameType::HandshakeRequest),
            3 => Ok(FrameType::HandshakeResponse),
            4 => Ok(FrameType::FileChunk),
            7 => Ok(FrameType::Ack),
            8 => Ok(FrameType::Ping),
            9 => Ok(FrameType::Pong),
            other => Err(ProtocolError::UnknownType(other)),
        }
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub flags: u16,
    pub payload: Bytes,
}

impl Frame {
    /// Build a frame with no flags set.
    pub fn new(frame_type: FrameType, payload: impl Into<Bytes>) -> Self {
        Self {
            frame_type,
            flags: 0,
            payload: payload.into(),
        }
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.payload.len());
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.frame_type as u8);
        buf.put_u16(self.flags);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode a whole frame from wire bytes.
    pub fn decode(mut wire: &[u8]) -> Result<Self, ProtocolError> {
        if wire.remaining() < 4 {
            return Err(ProtocolError::Truncated);
        }
        let version = wire.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let frame_type = FrameType::try_from(wire.get_u8())?;
        let flags = wire.get_u16();
        Ok(Self {
            frame_type,
            flags,
            payload: Bytes::copy_from_slice(wire),
        })
    }
}

/// Payload of a [`FrameType::FileChunk`] frame.
///
/// ```text
/// [2B fileId len][fileId UTF-8][4B chunkIndex][4B totalChunks]
/// [4B data len][encryptedData]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    pub file_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub encrypted_data: Bytes,
}

impl FileChunk {
    /// Encode the chunk sub-structure.
    pub fn encode(&self) -> Bytes {
        let id = self.file_id.as_bytes();
        let mut buf = BytesMut::with_capacity(14 + id.len() + self.encrypted_data.len());
        buf.put_u16(id.len() as u16);
        buf.put_slice(id);
        buf.put_u32(self.chunk_index);
        buf.put_u32(self.total_chunks);
        buf.put_u32(self.encrypted_data.len() as u32);
        buf.put_slice(&self.encrypted_data);
        buf.freeze()
    }

    /// Decode the chunk sub-structure.
    pub fn decode(mut wire: &[u8]) -> Result<Self, ProtocolError> {
        if wire.remaining() < 2 {
            return Err(ProtocolError::Truncated);
        }
        let id_len = wire.get_u16() as usize;
        if wire.remaining() < id_len + 12 {
            return Err(ProtocolError::Truncated);
        }
        let file_id = std::str::from_utf8(&wire[..id_len])
            .map_err(|_| ProtocolError::Truncated)?
            .to_string();
        wire.advance(id_len);
        let chunk_index = wire.get_u32();
        let total_chunks = wire.get_u32();
        let data_len = wire.get_u32() as usize;
        if wire.remaining() < data_len {
            return Err(ProtocolError::Truncated);
        }
        Ok(Self {
            file_id,
            chunk_index,
            total_chunks,
            encrypted_data: Bytes::copy_from_slice(&wire[..data_len]),
        })
    }

    /// Wrap this chunk in a frame.
    pub fn into_frame(self) -> Frame {
        Frame::new(FrameType::FileChunk, self.encode())
    }
}
