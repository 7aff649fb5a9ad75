//! Frame encoding and decoding.
//!
//! Every datagram a link carries is exactly one frame. The first byte is the
//! frame type, all integers are little-endian.
//!
//! ```text
//! Hello / HelloAck   type | version u8 | fp_len u8 | fingerprint
//! StreamSyn          type | stream u32 | port u32
//! StreamSynAck       type | stream u32
//! StreamData         type | stream u32 | offset u64 | len u16 | payload
//! StreamAck          type | stream u32 | ack u64 | window u32
//! StreamFin          type | stream u32 | offset u64
//! StreamRst          type | stream u32
//! Request / Response type | token u32 | len u16 | body
//! Close / CloseAck   type
//! KeepAlive / Ack     type
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Fixed header sizes.
pub mod sizes {
    /// Frame type byte.
    pub const TYPE_SIZE: usize = 1;
    /// Stream id field.
    pub const STREAM_ID_SIZE: usize = 4;
    /// Data frame header (type + stream + offset + length).
    pub const DATA_HEADER_SIZE: usize = TYPE_SIZE + STREAM_ID_SIZE + 8 + 2;
    /// Ack frame size.
    pub const ACK_FRAME_SIZE: usize = TYPE_SIZE + STREAM_ID_SIZE + 8 + 4;
    /// Request/response header (type + token + length).
    pub const EXCHANGE_HEADER_SIZE: usize = TYPE_SIZE + 4 + 2;
}

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Channel handshake initiation.
    Hello = 0x01,
    /// Channel handshake response.
    HelloAck = 0x02,
    /// Stream open request.
    StreamSyn = 0x10,
    /// Stream open acceptance.
    StreamSynAck = 0x11,
    /// Stream payload segment.
    StreamData = 0x12,
    /// Cumulative stream acknowledgement with window.
    StreamAck = 0x13,
    /// Stream half-close.
    StreamFin = 0x14,
    /// Stream reset.
    StreamRst = 0x15,
    /// Encoded request.
    Request = 0x20,
    /// Encoded response.
    Response = 0x21,
    /// Graceful connection close.
    Close = 0x30,
    /// Close acknowledgement.
    CloseAck = 0x31,
    /// Keep-alive request.
    KeepAlive = 0x32,
    /// Keep-alive answer.
    KeepAliveAck = 0x33,
}

impl FrameType {
    /// Parse frame type from a byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Hello),
            0x02 => Some(Self::HelloAck),
            0x10 => Some(Self::StreamSyn),
            0x11 => Some(Self::StreamSynAck),
            0x12 => Some(Self::StreamData),
            0x13 => Some(Self::StreamAck),
            0x14 => Some(Self::StreamFin),
            0x15 => Some(Self::StreamRst),
            0x20 => Some(Self::Request),
            0x21 => Some(Self::Response),
            0x30 => Some(Self::Close),
            0x31 => Some(Self::CloseAck),
            0x32 => Some(Self::KeepAlive),
            0x33 => Some(Self::KeepAliveAck),
            _ => None,
        }
    }

    /// Convert frame type to its byte representation.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Channel handshake initiation.
    Hello {
        /// Protocol version.
        version: u8,
        /// Sender's hex fingerprint.
        fingerprint: String,
    },
    /// Channel handshake response.
    HelloAck {
        /// Protocol version.
        version: u8,
        /// Responder's hex fingerprint.
        fingerprint: String,
    },
    /// Open `stream_id` bound to `port`.
    StreamSyn {
        /// Stream id chosen by the opener.
        stream_id: u32,
        /// Target port on the peer.
        port: u32,
    },
    /// The peer accepted the stream.
    StreamSynAck {
        /// Stream id.
        stream_id: u32,
    },
    /// Stream bytes starting at `offset`.
    StreamData {
        /// Stream id.
        stream_id: u32,
        /// Byte offset of the first payload byte.
        offset: u64,
        /// Segment payload. Empty for a window check.
        payload: Bytes,
    },
    /// Everything below `ack` arrived; `window` more bytes fit.
    StreamAck {
        /// Stream id.
        stream_id: u32,
        /// Next expected sequence number.
        ack: u64,
        /// Free receive buffer space.
        window: u32,
    },
    /// No bytes past `offset` will be sent. Consumes one sequence number.
    StreamFin {
        /// Stream id.
        stream_id: u32,
        /// Final byte offset.
        offset: u64,
    },
    /// Abort the stream.
    StreamRst {
        /// Stream id.
        stream_id: u32,
    },
    /// Encoded request body.
    Request {
        /// Exchange token.
        token: u32,
        /// Codec output.
        body: Bytes,
    },
    /// Encoded response body.
    Response {
        /// Token of the request answered.
        token: u32,
        /// Codec output.
        body: Bytes,
    },
    /// Graceful connection close.
    Close,
    /// Close acknowledgement.
    CloseAck,
    /// Keep-alive; the peer answers with [`Frame::KeepAliveAck`].
    KeepAlive,
    /// Keep-alive answer.
    KeepAliveAck,
}

impl Frame {
    /// Frame type of this frame.
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Hello { .. } => FrameType::Hello,
            Frame::HelloAck { .. } => FrameType::HelloAck,
            Frame::StreamSyn { .. } => FrameType::StreamSyn,
            Frame::StreamSynAck { .. } => FrameType::StreamSynAck,
            Frame::StreamData { .. } => FrameType::StreamData,
            Frame::StreamAck { .. } => FrameType::StreamAck,
            Frame::StreamFin { .. } => FrameType::StreamFin,
            Frame::StreamRst { .. } => FrameType::StreamRst,
            Frame::Request { .. } => FrameType::Request,
            Frame::Response { .. } => FrameType::Response,
            Frame::Close => FrameType::Close,
            Frame::CloseAck => FrameType::CloseAck,
            Frame::KeepAlive => FrameType::KeepAlive,
            Frame::KeepAliveAck => FrameType::KeepAliveAck,
        }
    }

    /// Stream the frame belongs to, if any.
    pub fn stream_id(&self) -> Option<u32> {
        match self {
            Frame::StreamSyn { stream_id, .. }
            | Frame::StreamSynAck { stream_id }
            | Frame::StreamData { stream_id, .. }
            | Frame::StreamAck { stream_id, .. }
            | Frame::StreamFin { stream_id, .. }
            | Frame::StreamRst { stream_id } => Some(*stream_id),
            _ => None,
        }
    }

    /// Serialize to a datagram.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(self.frame_type().as_byte());
        match self {
            Frame::Hello {
                version,
                fingerprint,
            }
            | Frame::HelloAck {
                version,
                fingerprint,
            } => {
                buf.put_u8(*version);
                buf.put_u8(fingerprint.len() as u8);
                buf.put_slice(fingerprint.as_bytes());
            }
            Frame::StreamSyn { stream_id, port } => {
                buf.put_u32_le(*stream_id);
                buf.put_u32_le(*port);
            }
            Frame::StreamSynAck { stream_id } | Frame::StreamRst { stream_id } => {
                buf.put_u32_le(*stream_id);
            }
            Frame::StreamData {
                stream_id,
                offset,
                payload,
            } => {
                buf.put_u32_le(*stream_id);
                buf.put_u64_le(*offset);
                buf.put_u16_le(payload.len() as u16);
                buf.put_slice(payload);
            }
            Frame::StreamAck {
                stream_id,
                ack,
                window,
            } => {
                buf.put_u32_le(*stream_id);
                buf.put_u64_le(*ack);
                buf.put_u32_le(*window);
            }
            Frame::StreamFin { stream_id, offset } => {
                buf.put_u32_le(*stream_id);
                buf.put_u64_le(*offset);
            }
            Frame::Request { token, body } | Frame::Response { token, body } => {
                buf.put_u32_le(*token);
                buf.put_u16_le(body.len() as u16);
                buf.put_slice(body);
            }
            Frame::Close | Frame::CloseAck | Frame::KeepAlive | Frame::KeepAliveAck => {}
        }
        buf.freeze()
    }

    fn encoded_len(&self) -> usize {
        match self {
            Frame::Hello { fingerprint, .. } | Frame::HelloAck { fingerprint, .. } => {
                3 + fingerprint.len()
            }
            Frame::StreamSyn { .. } => 9,
            Frame::StreamSynAck { .. } | Frame::StreamRst { .. } => 5,
            Frame::StreamData { payload, .. } => sizes::DATA_HEADER_SIZE + payload.len(),
            Frame::StreamAck { .. } => sizes::ACK_FRAME_SIZE,
            Frame::StreamFin { .. } => 13,
            Frame::Request { body, .. } | Frame::Response { body, .. } => {
                sizes::EXCHANGE_HEADER_SIZE + body.len()
            }
            Frame::Close | Frame::CloseAck | Frame::KeepAlive | Frame::KeepAliveAck => 1,
        }
    }

    /// Parse a datagram.
    pub fn decode(mut data: Bytes) -> Result<Frame, FrameError> {
        need(&data, sizes::TYPE_SIZE)?;
        let type_byte = data.get_u8();
        let frame_type = FrameType::from_byte(type_byte).ok_or(FrameError::InvalidType(type_byte))?;

        let frame = match frame_type {
            FrameType::Hello | FrameType::HelloAck => {
                need(&data, 2)?;
                let version = data.get_u8();
                let len = data.get_u8() as usize;
                need(&data, len)?;
                let fingerprint = String::from_utf8(data.split_to(len).to_vec())
                    .map_err(|_| FrameError::Malformed("fingerprint is not utf-8"))?;
                if frame_type == FrameType::Hello {
                    Frame::Hello {
                        version,
                        fingerprint,
                    }
                } else {
                    Frame::HelloAck {
                        version,
                        fingerprint,
                    }
                }
            }
            FrameType::StreamSyn => {
                need(&data, 8)?;
                Frame::StreamSyn {
                    stream_id: data.get_u32_le(),
                    port: data.get_u32_le(),
                }
            }
            FrameType::StreamSynAck => {
                need(&data, 4)?;
                Frame::StreamSynAck {
                    stream_id: data.get_u32_le(),
                }
            }
            FrameType::StreamData => {
                need(&data, 14)?;
                let stream_id = data.get_u32_le();
                let offset = data.get_u64_le();
                let len = data.get_u16_le() as usize;
                let payload = take_body(&mut data, len)?;
                Frame::StreamData {
                    stream_id,
                    offset,
                    payload,
                }
            }
            FrameType::StreamAck => {
                need(&data, 16)?;
                Frame::StreamAck {
                    stream_id: data.get_u32_le(),
                    ack: data.get_u64_le(),
                    window: data.get_u32_le(),
                }
            }
            FrameType::StreamFin => {
                need(&data, 12)?;
                Frame::StreamFin {
                    stream_id: data.get_u32_le(),
                    offset: data.get_u64_le(),
                }
            }
            FrameType::StreamRst => {
                need(&data, 4)?;
                Frame::StreamRst {
                    stream_id: data.get_u32_le(),
                }
            }
            FrameType::Request | FrameType::Response => {
                need(&data, 6)?;
                let token = data.get_u32_le();
                let len = data.get_u16_le() as usize;
                let body = take_body(&mut data, len)?;
                if frame_type == FrameType::Request {
                    Frame::Request { token, body }
                } else {
                    Frame::Response { token, body }
                }
            }
            FrameType::Close => Frame::Close,
            FrameType::CloseAck => Frame::CloseAck,
            FrameType::KeepAlive => Frame::KeepAlive,
            FrameType::KeepAliveAck => Frame::KeepAliveAck,
        };
        Ok(frame)
    }
}

fn need(data: &Bytes, expected: usize) -> Result<(), FrameError> {
    if data.remaining() < expected {
        return Err(FrameError::TooShort {
            expected,
            actual: data.remaining(),
        });
    }
    Ok(())
}

fn take_body(data: &mut Bytes, len: usize) -> Result<Bytes, FrameError> {
    if data.remaining() != len {
        return Err(FrameError::PayloadLengthMismatch {
            expected: len,
            actual: data.remaining(),
        });
    }
    Ok(data.split_to(len))
}

/// Errors that can occur during frame parsing.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Frame is too short.
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum expected size.
        expected: usize,
        /// Actual size received.
        actual: usize,
    },

    /// Invalid frame type.
    #[error("invalid frame type: 0x{0:02x}")]
    InvalidType(u8),

    /// Payload length mismatch.
    #[error("payload length mismatch: header says {expected}, but {actual} bytes available")]
    PayloadLengthMismatch {
        /// Expected payload length from header.
        expected: usize,
        /// Actual bytes available.
        actual: usize,
    },

    /// A field held an impossible value.
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}
