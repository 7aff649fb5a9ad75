//! Request/response body codec.
//!
//! The connection only moves opaque bodies. [`RequestCodec`] turns messages
//! into bodies and back; [`BinaryCodec`] is the built-in format:
//!
//! ```text
//! request   method u8 | path_len u16 | path | has_cf u8 | cf u16 | payload
//! response  status u16 | has_cf u8 | cf u16 | payload
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::message::{Method, RequestMessage, ResponseMessage};
use crate::core::Error;
use crate::core::constants::{MAX_DATAGRAM_SIZE, MAX_REQUEST_PAYLOAD};
use crate::transport::sizes::EXCHANGE_HEADER_SIZE;

/// Largest body one request or response frame carries.
pub const MAX_BODY_SIZE: usize = MAX_DATAGRAM_SIZE - EXCHANGE_HEADER_SIZE;

/// Codec errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Body ended early.
    #[error("body truncated")]
    Truncated,

    /// Unknown method code.
    #[error("unknown method code {0}")]
    UnknownMethod(u8),

    /// Path is not valid UTF-8.
    #[error("path is not utf-8")]
    InvalidPath,

    /// Field too large to encode.
    #[error("{0} too large")]
    TooLarge(&'static str),
}

impl From<CodecError> for Error {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::TooLarge(_) => Error::InvalidArgument,
            _ => Error::BadResponse,
        }
    }
}

/// Encodes and decodes request and response bodies.
pub trait RequestCodec: Send + Sync {
    /// Encode a request.
    fn encode_request(&self, request: &RequestMessage) -> Result<Bytes, CodecError>;

    /// Decode a request.
    fn decode_request(&self, body: Bytes) -> Result<RequestMessage, CodecError>;

    /// Encode a response.
    fn encode_response(&self, response: &ResponseMessage) -> Result<Bytes, CodecError>;

    /// Decode a response.
    fn decode_response(&self, body: Bytes) -> Result<ResponseMessage, CodecError>;
}

/// Compact binary codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCodec;

fn put_content(buf: &mut BytesMut, content_format: Option<u16>, payload: &Bytes) -> Result<(), CodecError> {
    if payload.len() > MAX_REQUEST_PAYLOAD {
        return Err(CodecError::TooLarge("payload"));
    }
    match content_format {
        Some(cf) => {
            buf.put_u8(1);
            buf.put_u16_le(cf);
        }
        None => {
            buf.put_u8(0);
            buf.put_u16_le(0);
        }
    }
    buf.put_slice(payload);
    Ok(())
}

fn get_content(body: &mut Bytes) -> Result<(Option<u16>, Bytes), CodecError> {
    if body.remaining() < 3 {
        return Err(CodecError::Truncated);
    }
    let has_cf = body.get_u8() != 0;
    let cf = body.get_u16_le();
    let payload = body.split_off(0);
    Ok((has_cf.then_some(cf), payload))
}

fn finish(buf: BytesMut, what: &'static str) -> Result<Bytes, CodecError> {
    if buf.len() > MAX_BODY_SIZE {
        return Err(CodecError::TooLarge(what));
    }
    Ok(buf.freeze())
}

impl RequestCodec for BinaryCodec {
    fn encode_request(&self, request: &RequestMessage) -> Result<Bytes, CodecError> {
        let path = request.path.as_bytes();
        if path.len() > u16::MAX as usize {
            return Err(CodecError::TooLarge("path"));
        }
        let mut buf = BytesMut::with_capacity(6 + path.len() + request.payload.len());
        buf.put_u8(request.method.as_byte());
        buf.put_u16_le(path.len() as u16);
        buf.put_slice(path);
        put_content(&mut buf, request.content_format, &request.payload)?;
        finish(buf, "request")
    }

    fn decode_request(&self, mut body: Bytes) -> Result<RequestMessage, CodecError> {
        if body.remaining() < 3 {
            return Err(CodecError::Truncated);
        }
        let code = body.get_u8();
        let method = Method::from_byte(code).ok_or(CodecError::UnknownMethod(code))?;
        let len = body.get_u16_le() as usize;
        if body.remaining() < len {
            return Err(CodecError::Truncated);
        }
        let path = String::from_utf8(body.split_to(len).to_vec()).map_err(|_| CodecError::InvalidPath)?;
        let (content_format, payload) = get_content(&mut body)?;
        Ok(RequestMessage {
            method,
            path,
            content_format,
            payload,
        })
    }

    fn encode_response(&self, response: &ResponseMessage) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(5 + response.payload.len());
        buf.put_u16_le(response.status);
        put_content(&mut buf, response.content_format, &response.payload)?;
        finish(buf, "response")
    }

    fn decode_response(&self, mut body: Bytes) -> Result<ResponseMessage, CodecError> {
        if body.remaining() < 2 {
            return Err(CodecError::Truncated);
        }
        let status = body.get_u16_le();
        let (content_format, payload) = get_content(&mut body)?;
        Ok(ResponseMessage {
            status,
            content_format,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_layout() {
        let mut request = RequestMessage::new(Method::Post, "/a");
        request.content_format = Some(50);
        request.payload = Bytes::from_static(b"{}");

        let body = BinaryCodec.encode_request(&request).unwrap();
        assert_eq!(body.as_ref(), &[2, 2, 0, b'/', b'a', 1, 50, 0, b'{', b'}']);
        assert_eq!(BinaryCodec.decode_request(body).unwrap(), request);
    }

    #[test]
    fn test_response_without_payload() {
        let response = ResponseMessage::new(205);
        let body = BinaryCodec.encode_response(&response).unwrap();
        let decoded = BinaryCodec.decode_response(body).unwrap();
        assert_eq!(decoded.status, 205);
        assert_eq!(decoded.content_format, None);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_truncated_response() {
        assert_eq!(
            BinaryCodec.decode_response(Bytes::from_static(&[0xCD])),
            Err(CodecError::Truncated)
        );
        assert_eq!(
            BinaryCodec.decode_response(Bytes::from_static(&[0xCD, 0x00, 1])),
            Err(CodecError::Truncated)
        );
        assert_eq!(Error::from(CodecError::Truncated), Error::BadResponse);
    }

    #[test]
    fn test_unknown_method() {
        assert_eq!(
            BinaryCodec.decode_request(Bytes::from_static(&[9, 0, 0, 0, 0, 0])),
            Err(CodecError::UnknownMethod(9))
        );
    }

    #[test]
    fn test_payload_too_large() {
        let response = ResponseMessage::new(200).with_payload(42, vec![0u8; MAX_REQUEST_PAYLOAD + 1]);
        assert_eq!(
            BinaryCodec.encode_response(&response),
            Err(CodecError::TooLarge("payload"))
        );
    }

    #[test]
    fn test_request_must_fit_one_frame() {
        let long = RequestMessage::new(Method::Get, &"a".repeat(65_000));
        assert_eq!(BinaryCodec.encode_request(&long), Err(CodecError::TooLarge("request")));

        let mut request = RequestMessage::new(Method::Put, &"a".repeat(1500));
        request.payload = Bytes::from(vec![0u8; 1000]);
        assert_eq!(BinaryCodec.encode_request(&request), Err(CodecError::TooLarge("request")));
        assert_eq!(Error::from(CodecError::TooLarge("request")), Error::InvalidArgument);

        let fits = RequestMessage::new(Method::Get, &"a".repeat(MAX_BODY_SIZE - 6));
        assert_eq!(BinaryCodec.encode_request(&fits).unwrap().len(), MAX_BODY_SIZE);
    }
}
