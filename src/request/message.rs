//! Request and response messages.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;

use crate::core::Error;

/// Request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Read a resource.
    Get,
    /// Create or invoke.
    Post,
    /// Replace a resource.
    Put,
    /// Remove a resource.
    Delete,
}

impl Method {
    /// Canonical uppercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }

    /// Wire code.
    pub fn as_byte(self) -> u8 {
        match self {
            Method::Get => 1,
            Method::Post => 2,
            Method::Put => 3,
            Method::Delete => 4,
        }
    }

    /// Parse a wire code.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Method::Get),
            2 => Some(Method::Post),
            3 => Some(Method::Put),
            4 => Some(Method::Delete),
            _ => None,
        }
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            _ => Err(Error::InvalidArgument),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMessage {
    /// Method.
    pub method: Method,
    /// Resource path, e.g. `/heat-pump/target`.
    pub path: String,
    /// Content format of the payload, if any.
    pub content_format: Option<u16>,
    /// Payload, possibly empty.
    pub payload: Bytes,
}

impl RequestMessage {
    /// Request without payload.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            content_format: None,
            payload: Bytes::new(),
        }
    }
}

/// A response as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMessage {
    /// Status code, e.g. 205.
    pub status: u16,
    /// Content format of the payload, if any.
    pub content_format: Option<u16>,
    /// Payload, possibly empty.
    pub payload: Bytes,
}

impl ResponseMessage {
    /// Response without payload.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            content_format: None,
            payload: Bytes::new(),
        }
    }

    /// Attach a payload.
    pub fn with_payload(mut self, content_format: u16, payload: impl Into<Bytes>) -> Self {
        self.content_format = Some(content_format);
        self.payload = payload.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_parse() {
        assert_eq!("GET".parse::<Method>(), Ok(Method::Get));
        assert_eq!("DELETE".parse::<Method>(), Ok(Method::Delete));
        assert_eq!("PATCH".parse::<Method>(), Err(Error::InvalidArgument));
        assert_eq!("get".parse::<Method>(), Err(Error::InvalidArgument));
    }

    #[test]
    fn test_method_codes() {
        for method in [Method::Get, Method::Post, Method::Put, Method::Delete] {
            assert_eq!(Method::from_byte(method.as_byte()), Some(method));
        }
        assert_eq!(Method::from_byte(0), None);
    }

    #[test]
    fn test_response_builder() {
        let response = ResponseMessage::new(205).with_payload(50, &b"{}"[..]);
        assert_eq!(response.status, 205);
        assert_eq!(response.content_format, Some(50));
        assert_eq!(response.payload.as_ref(), b"{}");
    }
}
