//! One-shot request/response over a connection.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::message::{Method, RequestMessage, ResponseMessage};
use crate::client::{ClientInner, ConnectionInner};
use crate::completion::{Completion, Resolver};
use crate::core::constants::{MAX_REQUEST_PAYLOAD, REQUEST_RETRY_INTERVAL};
use crate::core::{Error, Result};
use crate::transport::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Executing,
    Done,
}

struct ExchangeState {
    request: RequestMessage,
    phase: Phase,
    response: Option<ResponseMessage>,
}

/// A request to the connected device.
///
/// Single use: configure, [`execute`](RequestExchange::execute) once, then
/// read the response. Dropping the exchange abandons it.
pub struct RequestExchange {
    connection: Arc<ConnectionInner>,
    _client: Arc<ClientInner>,
    cancel: CancellationToken,
    state: Arc<Mutex<ExchangeState>>,
}

impl RequestExchange {
    pub(crate) fn new(
        connection: Arc<ConnectionInner>,
        client: Arc<ClientInner>,
        method: Method,
        path: &str,
    ) -> Self {
        Self {
            cancel: connection.child_token(),
            connection,
            _client: client,
            state: Arc::new(Mutex::new(ExchangeState {
                request: RequestMessage::new(method, path),
                phase: Phase::Idle,
                response: None,
            })),
        }
    }

    /// Request method.
    pub fn method(&self) -> Method {
        self.state.lock().request.method
    }

    /// Request path.
    pub fn path(&self) -> String {
        self.state.lock().request.path.clone()
    }

    /// Attach a payload with its content format.
    pub fn set_payload(&self, content_format: u16, payload: impl Into<Bytes>) -> Result<()> {
        let payload = payload.into();
        if payload.len() > MAX_REQUEST_PAYLOAD {
            return Err(Error::InvalidArgument);
        }
        let mut state = self.state.lock();
        if state.phase != Phase::Idle {
            return Err(Error::InvalidState);
        }
        state.request.content_format = Some(content_format);
        state.request.payload = payload;
        Ok(())
    }

    /// Send the request and wait for the response.
    pub fn execute(&self) -> Completion<()> {
        let body = {
            let mut state = self.state.lock();
            match state.phase {
                Phase::Executing => return Completion::immediate(Err(Error::OperationInProgress)),
                Phase::Done => return Completion::immediate(Err(Error::InvalidState)),
                Phase::Idle => {}
            }
            let body = match self.connection.codec().encode_request(&state.request) {
                Ok(body) => body,
                Err(e) => return Completion::immediate(Err(e.into())),
            };
            state.phase = Phase::Executing;
            body
        };

        let token = self.connection.next_request_token();
        let (tx, rx) = oneshot::channel();
        if let Err(e) = self.connection.register_request(token, tx) {
            self.state.lock().phase = Phase::Done;
            return Completion::immediate(Err(e));
        }

        let (completion, resolver) = Completion::pending();
        let exchange = Exchange {
            connection: Arc::clone(&self.connection),
            state: Arc::clone(&self.state),
            cancel: self.cancel.clone(),
            token,
            body,
        };
        self.connection.handle().spawn(exchange.run(rx, resolver));
        completion
    }

    fn response<T>(&self, f: impl FnOnce(&ResponseMessage) -> Result<T>) -> Result<T> {
        let state = self.state.lock();
        state.response.as_ref().map_or(Err(Error::InvalidState), f)
    }

    /// Response status code.
    pub fn status_code(&self) -> Result<u16> {
        self.response(|r| Ok(r.status))
    }

    /// Response content format; [`Error::NoData`] when the device sent none.
    pub fn content_format(&self) -> Result<u16> {
        self.response(|r| r.content_format.ok_or(Error::NoData))
    }

    /// Response payload; [`Error::NoData`] when empty.
    pub fn payload(&self) -> Result<Bytes> {
        self.response(|r| {
            if r.payload.is_empty() {
                Err(Error::NoData)
            } else {
                Ok(r.payload.clone())
            }
        })
    }
}

impl Drop for RequestExchange {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for RequestExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RequestExchange")
            .field("method", &state.request.method)
            .field("path", &state.request.path)
            .field("phase", &state.phase)
            .finish()
    }
}

/// The dispatcher side of one execute.
struct Exchange {
    connection: Arc<ConnectionInner>,
    state: Arc<Mutex<ExchangeState>>,
    cancel: CancellationToken,
    token: u32,
    body: Bytes,
}

impl Exchange {
    async fn run(self, mut rx: oneshot::Receiver<Bytes>, resolver: Resolver<()>) {
        let deadline = tokio::time::sleep(self.connection.request_timeout());
        tokio::pin!(deadline);
        let mut retransmit = tokio::time::interval(REQUEST_RETRY_INTERVAL);
        let mut sent = 0u32;

        let outcome = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Err(self.connection.failure()),
                _ = &mut deadline => break Err(Error::Timeout),
                response = &mut rx => match response {
                    Ok(body) => {
                        break self
                            .connection
                            .codec()
                            .decode_response(body)
                            .map_err(Error::from);
                    }
                    Err(_) => break Err(self.connection.failure()),
                },
                _ = retransmit.tick() => {
                    sent += 1;
                    let frame = Frame::Request {
                        token: self.token,
                        body: self.body.clone(),
                    };
                    if let Err(e) = self.connection.send_frame(frame).await {
                        tracing::debug!(token = self.token, error = %e, "request not sent");
                    }
                }
            }
        };
        self.connection.unregister_request(self.token);

        let mut state = self.state.lock();
        state.phase = Phase::Done;
        match outcome {
            Ok(response) => {
                tracing::debug!(
                    token = self.token,
                    status = response.status,
                    attempts = sent,
                    "response received"
                );
                state.response = Some(response);
                drop(state);
                resolver.complete();
            }
            Err(e) => {
                drop(state);
                tracing::debug!(token = self.token, error = %e, "request failed");
                resolver.fail(e);
            }
        }
    }
}
