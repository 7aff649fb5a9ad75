//! Device-side responder.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;

use super::handler::{RequestHandler, StreamHandler};
use super::session::DeviceSession;
use crate::core::SharedLink;
use crate::core::constants::PROTOCOL_VERSION;
use crate::crypto::PrivateKey;
use crate::request::{BinaryCodec, RequestCodec, ResponseMessage};
use crate::stream::{FrameSink, Stream, StreamEngine, spawn_stream};
use crate::transport::Frame;

/// Status answered when no request handler is installed.
const STATUS_NOT_FOUND: u16 = 404;

/// Status answered for requests that do not decode.
const STATUS_BAD_REQUEST: u16 = 400;

/// Answers streams and requests from clients over any [`Link`](crate::core::Link).
///
/// Call [`DeviceHost::serve`] once per link. Links from the same client share
/// one session.
pub struct DeviceHost {
    product_id: String,
    device_id: String,
    key: PrivateKey,
    codec: Arc<dyn RequestCodec>,
    stream_handlers: RwLock<HashMap<u32, Arc<dyn StreamHandler>>>,
    request_handler: RwLock<Option<Arc<RequestHandler>>>,
    sessions: Mutex<HashMap<String, Arc<DeviceSession>>>,
}

impl DeviceHost {
    /// Device with a fresh key and the binary codec.
    pub fn new(product_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            product_id: product_id.into(),
            device_id: device_id.into(),
            key: PrivateKey::generate(),
            codec: Arc::new(BinaryCodec),
            stream_handlers: RwLock::new(HashMap::new()),
            request_handler: RwLock::new(None),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Use `key` as the device identity.
    pub fn with_key(mut self, key: PrivateKey) -> Self {
        self.key = key;
        self
    }

    /// Use `codec` for request bodies.
    pub fn with_codec(mut self, codec: Arc<dyn RequestCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Product id.
    pub fn product_id(&self) -> &str {
        &self.product_id
    }

    /// Device id.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Hex fingerprint of the device key.
    pub fn fingerprint(&self) -> String {
        self.key.fingerprint()
    }

    /// Serve streams opened towards `port` with `handler`.
    pub fn add_stream_handler(&self, port: u32, handler: impl StreamHandler) {
        self.stream_handlers.write().insert(port, Arc::new(handler));
    }

    /// Answer requests with `handler`.
    pub fn set_request_handler<F>(&self, handler: F)
    where
        F: Fn(crate::request::RequestMessage) -> ResponseMessage + Send + Sync + 'static,
    {
        *self.request_handler.write() = Some(Arc::new(handler));
    }

    /// Number of clients with a live session.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    fn attach(&self, link: &SharedLink) -> Arc<DeviceSession> {
        let peer = link.peer_fingerprint();
        let session = Arc::clone(
            self.sessions
                .lock()
                .entry(peer.clone())
                .or_insert_with(|| Arc::new(DeviceSession::new(peer))),
        );
        session.attach(link);
        session
    }

    fn end_session(&self, session: &DeviceSession) {
        self.sessions.lock().remove(session.peer());
        session.teardown();
        tracing::debug!(peer = %session.peer(), "device session ended");
    }

    /// Serve one link until it closes.
    pub async fn serve(self: Arc<Self>, link: SharedLink) {
        let mut session = Some(self.attach(&link));
        tracing::debug!(peer = %link.peer_fingerprint(), "serving link");

        while let Ok(datagram) = link.recv().await {
            let frame = match Frame::decode(datagram) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::trace!(error = %e, "dropping malformed datagram");
                    continue;
                }
            };

            let current = match &session {
                Some(current) => Arc::clone(current),
                None => {
                    let fresh = self.attach(&link);
                    session = Some(Arc::clone(&fresh));
                    fresh
                }
            };
            current.touch(&link);

            match frame {
                Frame::Hello { .. } => {
                    self.reply(
                        &link,
                        Frame::HelloAck {
                            version: PROTOCOL_VERSION,
                            fingerprint: self.fingerprint(),
                        },
                    )
                    .await;
                }
                Frame::StreamSyn { stream_id, port } => {
                    self.accept_stream(&current, &link, stream_id, port).await;
                }
                Frame::Request { token, body } => {
                    let response = self.answer(&current, token, body);
                    if let Some(body) = response {
                        self.reply(&link, Frame::Response { token, body }).await;
                    }
                }
                Frame::KeepAlive => self.reply(&link, Frame::KeepAliveAck).await,
                Frame::Close => {
                    self.reply(&link, Frame::CloseAck).await;
                    current.detach(&link);
                    self.end_session(&current);
                    session = None;
                }
                frame => {
                    let Some(stream_id) = frame.stream_id() else {
                        continue;
                    };
                    match current.stream(stream_id) {
                        Some(stream) => stream.deliver(frame),
                        None if !matches!(frame, Frame::StreamRst { .. }) => {
                            self.reply(&link, Frame::StreamRst { stream_id }).await;
                        }
                        None => {}
                    }
                }
            }
        }

        if let Some(session) = session {
            if session.detach(&link) {
                self.end_session(&session);
            }
        }
    }

    async fn reply(&self, link: &SharedLink, frame: Frame) {
        if let Err(e) = link.send(frame.encode()).await {
            tracing::trace!(error = %e, "device reply not sent");
        }
    }

    async fn accept_stream(&self, session: &Arc<DeviceSession>, link: &SharedLink, stream_id: u32, port: u32) {
        if let Some(stream) = session.stream(stream_id) {
            stream.deliver(Frame::StreamSyn { stream_id, port });
            return;
        }

        let handler = self.stream_handlers.read().get(&port).cloned();
        let Some(handler) = handler else {
            tracing::debug!(stream = stream_id, port, "no handler for port");
            self.reply(link, Frame::StreamRst { stream_id }).await;
            return;
        };

        let sink: Arc<dyn FrameSink> = session.clone();
        let shared = spawn_stream(
            &Handle::current(),
            StreamEngine::acceptor(stream_id, port),
            sink,
        );
        session.insert_stream(Arc::clone(&shared));
        tracing::debug!(stream = stream_id, port, "stream accepted");

        tokio::spawn(async move {
            handler.handle(Stream::new(shared, None)).await;
        });
    }

    fn answer(&self, session: &DeviceSession, token: u32, body: Bytes) -> Option<Bytes> {
        if let Some(cached) = session.cached_response(token) {
            return Some(cached);
        }

        let response = match self.codec.decode_request(body) {
            Ok(request) => {
                let handler = self.request_handler.read().clone();
                match handler {
                    Some(handler) => handler(request),
                    None => ResponseMessage::new(STATUS_NOT_FOUND),
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "request did not decode");
                ResponseMessage::new(STATUS_BAD_REQUEST)
            }
        };

        let body = match self.codec.encode_response(&response) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(error = %e, "response did not encode");
                return None;
            }
        };
        session.cache_response(token, body.clone());
        Some(body)
    }
}

impl fmt::Debug for DeviceHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHost")
            .field("product_id", &self.product_id)
            .field("device_id", &self.device_id)
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}
