//! Application hooks a device exposes.

use async_trait::async_trait;

use crate::core::Error;
use crate::request::{RequestMessage, ResponseMessage};
use crate::stream::Stream;

/// Buffer size the echo handler reads with.
const ECHO_CHUNK: usize = 4096;

/// Serves streams opened towards one port.
#[async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    /// Handle an accepted stream. The stream is aborted when dropped unless
    /// it was closed.
    async fn handle(&self, stream: Stream);
}

/// Answers requests.
pub type RequestHandler = dyn Fn(RequestMessage) -> ResponseMessage + Send + Sync + 'static;

/// Writes back everything it reads, then closes.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

#[async_trait]
impl StreamHandler for EchoHandler {
    async fn handle(&self, stream: Stream) {
        loop {
            let read = stream.read_some(ECHO_CHUNK);
            match read.outcome().await {
                Ok(()) => {
                    let Some(data) = read.into_output() else {
                        continue;
                    };
                    if let Err(e) = stream.write(data).outcome().await {
                        tracing::debug!(stream = stream.id(), error = %e, "echo write failed");
                        return;
                    }
                }
                Err(Error::Eof) => break,
                Err(e) => {
                    tracing::debug!(stream = stream.id(), error = %e, "echo read failed");
                    return;
                }
            }
        }

        if let Err(e) = stream.close().outcome().await {
            tracing::debug!(stream = stream.id(), error = %e, "echo close failed");
        }
    }
}
