//! Per-client device session.
//!
//! A session is keyed by the client's fingerprint rather than by link, so a
//! client that moves from a relayed link to a peer-to-peer one keeps its
//! streams. Replies go out on the link the client last sent on.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::core::constants::RESPONSE_CACHE_SIZE;
use crate::core::{Error, SharedLink};
use crate::stream::{FrameSink, StreamShared};

#[derive(Default)]
struct Links {
    current: Option<SharedLink>,
    attached: Vec<SharedLink>,
}

/// State a device keeps for one client.
pub(crate) struct DeviceSession {
    peer: String,
    links: Mutex<Links>,
    streams: Mutex<HashMap<u32, Arc<StreamShared>>>,
    responses: Mutex<VecDeque<(u32, Bytes)>>,
}

impl DeviceSession {
    pub(crate) fn new(peer: String) -> Self {
        Self {
            peer,
            links: Mutex::new(Links::default()),
            streams: Mutex::new(HashMap::new()),
            responses: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn peer(&self) -> &str {
        &self.peer
    }

    /// A serve loop started on `link`.
    pub(crate) fn attach(&self, link: &SharedLink) {
        let mut links = self.links.lock();
        links.attached.push(Arc::clone(link));
        links.current = Some(Arc::clone(link));
    }

    /// A serve loop on `link` ended. Returns true when no link is left.
    pub(crate) fn detach(&self, link: &SharedLink) -> bool {
        let mut links = self.links.lock();
        links.attached.retain(|l| !Arc::ptr_eq(l, link));
        if links
            .current
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, link))
        {
            links.current = links.attached.last().cloned();
        }
        links.attached.is_empty()
    }

    /// `link` delivered a frame; reply there from now on.
    pub(crate) fn touch(&self, link: &SharedLink) {
        let mut links = self.links.lock();
        let stale = links
            .current
            .as_ref()
            .is_none_or(|current| !Arc::ptr_eq(current, link));
        if stale {
            links.current = Some(Arc::clone(link));
        }
    }

    pub(crate) fn stream(&self, id: u32) -> Option<Arc<StreamShared>> {
        self.streams.lock().get(&id).cloned()
    }

    pub(crate) fn insert_stream(&self, stream: Arc<StreamShared>) {
        self.streams.lock().insert(stream.id(), stream);
    }

    pub(crate) fn cached_response(&self, token: u32) -> Option<Bytes> {
        self.responses
            .lock()
            .iter()
            .find(|(t, _)| *t == token)
            .map(|(_, body)| body.clone())
    }

    pub(crate) fn cache_response(&self, token: u32, body: Bytes) {
        let mut responses = self.responses.lock();
        if responses.len() == RESPONSE_CACHE_SIZE {
            responses.pop_front();
        }
        responses.push_back((token, body));
    }

    /// Fail every stream and forget cached responses.
    pub(crate) fn teardown(&self) {
        let streams: Vec<_> = self.streams.lock().drain().map(|(_, s)| s).collect();
        for stream in streams {
            stream.fail(Error::Aborted);
        }
        self.responses.lock().clear();
    }
}

impl FrameSink for DeviceSession {
    fn link(&self) -> Option<SharedLink> {
        self.links.lock().current.clone()
    }

    fn unregister_stream(&self, stream_id: u32) {
        self.streams.lock().remove(&stream_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{LinkConditions, link_pair};

    #[test]
    fn test_response_cache_is_bounded() {
        let session = DeviceSession::new("peer".into());
        for token in 0..(RESPONSE_CACHE_SIZE as u32 + 1) {
            session.cache_response(token, Bytes::from(token.to_le_bytes().to_vec()));
        }
        assert_eq!(session.cached_response(0), None);
        assert_eq!(
            session.cached_response(1),
            Some(Bytes::from(1u32.to_le_bytes().to_vec()))
        );
    }

    #[test]
    fn test_reply_link_follows_traffic() {
        let session = DeviceSession::new("peer".into());
        let (relay, _a) = link_pair("dev", "peer", LinkConditions::default());
        let (direct, _b) = link_pair("dev", "peer", LinkConditions::default());
        let relay: SharedLink = relay;
        let direct: SharedLink = direct;

        session.attach(&relay);
        session.attach(&direct);
        session.touch(&relay);
        assert!(Arc::ptr_eq(&session.link().unwrap(), &relay));

        assert!(!session.detach(&relay));
        assert!(Arc::ptr_eq(&session.link().unwrap(), &direct));
        assert!(session.detach(&direct));
        assert!(session.link().is_none());
    }
}
