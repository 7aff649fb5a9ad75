//! Protocol constants and defaults.

use std::time::Duration;

// =============================================================================
// CREDENTIALS
// =============================================================================

/// X25519 private key size.
pub const PRIVATE_KEY_SIZE: usize = 32;

/// X25519 public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// BLAKE2s-256 output size, used for fingerprints.
pub const FINGERPRINT_SIZE: usize = 32;

/// Length of a hex encoded fingerprint.
pub const FINGERPRINT_HEX_LEN: usize = FINGERPRINT_SIZE * 2;

// =============================================================================
// FRAMING
// =============================================================================

/// Wire protocol version carried in hello frames.
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest stream payload carried by one data frame.
pub const MAX_SEGMENT_SIZE: usize = 1024;

/// Largest datagram a link is expected to carry.
pub const MAX_DATAGRAM_SIZE: usize = 2048;

// =============================================================================
// STREAMS
// =============================================================================

/// Bytes a stream buffers for sending before writes start waiting.
pub const SEND_BUFFER_SIZE: usize = 64 * 1024;

/// Bytes a stream buffers on the receive side (advertised window).
pub const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Initial retransmission timeout.
pub const INITIAL_RTO: Duration = Duration::from_millis(250);

/// Minimum retransmission timeout.
pub const MIN_RTO: Duration = Duration::from_millis(50);

/// Maximum retransmission timeout.
pub const MAX_RTO: Duration = Duration::from_secs(10);

/// Retransmission backoff multiplier.
pub const RETRANSMIT_BACKOFF: u32 = 2;

/// Consecutive retransmission timeouts before a stream is aborted.
pub const MAX_RETRANSMITS: u32 = 10;

/// How long a fully closed stream keeps answering retransmitted FINs.
pub const STREAM_LINGER: Duration = Duration::from_secs(2);

// =============================================================================
// CONNECTIONS
// =============================================================================

/// Default upper bound on the whole connect operation.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default upper bound on a single channel attempt.
pub const DEFAULT_CHANNEL_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a replaced link keeps receiving after a channel upgrade.
pub const UPGRADE_GRACE: Duration = Duration::from_secs(2);

/// Interval between close frame retransmissions.
pub const CLOSE_RETRY_INTERVAL: Duration = Duration::from_millis(300);

/// Close frames sent before giving up on the peer's acknowledgement.
pub const CLOSE_ATTEMPTS: u32 = 3;

/// Default silence before the first keep-alive.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Default time between unanswered keep-alives.
pub const DEFAULT_KEEP_ALIVE_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Default unanswered keep-alives before a connection is declared dead.
pub const DEFAULT_KEEP_ALIVE_MAX_RETRIES: u32 = 15;

// =============================================================================
// REQUESTS
// =============================================================================

/// Default time a request waits for its response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between request retransmissions.
pub const REQUEST_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Largest request or response payload.
pub const MAX_REQUEST_PAYLOAD: usize = 1024;

/// Responses a device remembers for retransmitted requests.
pub const RESPONSE_CACHE_SIZE: usize = 64;

// =============================================================================
// TUNNELS
// =============================================================================

/// Stream port the device's TCP tunnel service listens on.
pub const TUNNEL_STREAM_PORT: u32 = 0x0001_0000;

/// Bytes a tunnel moves per read from either side.
pub const TUNNEL_CHUNK_SIZE: usize = 16 * 1024;
