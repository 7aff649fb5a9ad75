//! Tunnel stream preamble.
//!
//! ```text
//! target   host_len u8 | host | port u16
//! status   code u8
//! ```

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use super::read_exact;
use crate::core::{Error, Result};
use crate::stream::Stream;

/// Where the device should connect.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelTarget {
    /// Host name or address, as seen from the device.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl TunnelTarget {
    /// Validated target.
    pub fn new(host: &str, port: u16) -> Result<Self> {
        if host.is_empty() || host.len() > u8::MAX as usize || port == 0 {
            return Err(Error::InvalidArgument);
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    pub(crate) fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(3 + self.host.len());
        buf.put_u8(self.host.len() as u8);
        buf.put_slice(self.host.as_bytes());
        buf.put_u16_le(self.port);
        buf.freeze()
    }

    pub(crate) async fn read_from(stream: &Stream) -> Result<Self> {
        let len = read_exact(stream, 1).await?[0] as usize;
        if len == 0 {
            return Err(Error::BadResponse);
        }
        let rest = read_exact(stream, len + 2).await?;
        let host = std::str::from_utf8(&rest[..len]).map_err(|_| Error::BadResponse)?;
        let port = u16::from_le_bytes([rest[len], rest[len + 1]]);
        Self::new(host, port).map_err(|_| Error::BadResponse)
    }
}

impl fmt::Display for TunnelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Device answer to a tunnel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TunnelStatus {
    /// Connected to the target; raw bytes follow.
    Connected = 0,
    /// The device does not tunnel to this target.
    Refused = 1,
    /// The target did not accept the TCP connection.
    Unreachable = 2,
}

impl TunnelStatus {
    /// Parse a status byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Connected),
            1 => Some(Self::Refused),
            2 => Some(Self::Unreachable),
            _ => None,
        }
    }

    pub(crate) async fn read_from(stream: &Stream) -> Result<Self> {
        let byte = read_exact(stream, 1).await?[0];
        Self::from_byte(byte).ok_or(Error::BadResponse)
    }
}
