//! Commit arbitration and the channel race.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinSet;

use super::direct::{DirectAttempt, attempt_direct};
use super::local::LocalAttempt;
use super::relay::RelayAttempt;
use super::{ChannelKind, ChannelObserver, EstablishedChannel};
use crate::core::{Endpoint, Error, LocalIdentity, Result};

/// Hands out the single commit token of a race.
#[derive(Debug, Default)]
pub(crate) struct Arbiter {
    committed: AtomicBool,
}

impl Arbiter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Take the commit token. Only the first caller gets `true`.
    pub(crate) fn try_commit(&self) -> bool {
        self.committed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[cfg(test)]
    pub(crate) fn is_committed(&self) -> bool {
        self.committed.load(Ordering::Acquire)
    }
}

/// A set of concurrently running attempts sharing one arbiter.
pub(crate) struct Race {
    arbiter: Arc<Arbiter>,
    observer: Arc<dyn ChannelObserver>,
    channel_timeout: Duration,
    attempts: JoinSet<Option<EstablishedChannel>>,
}

impl Race {
    pub(crate) fn new(observer: Arc<dyn ChannelObserver>, channel_timeout: Duration) -> Self {
        Self {
            arbiter: Arc::new(Arbiter::new()),
            observer,
            channel_timeout,
            attempts: JoinSet::new(),
        }
    }

    /// Start an attempt. It reports to the observer and, if it establishes a
    /// link after another attempt committed, closes that link.
    pub(crate) fn spawn<F>(&mut self, kind: ChannelKind, endpoint: Option<Endpoint>, attempt: F)
    where
        F: Future<Output = Result<EstablishedChannel>> + Send + 'static,
    {
        let index = self.observer.attempt_started(kind, endpoint);
        let arbiter = Arc::clone(&self.arbiter);
        let observer = Arc::clone(&self.observer);
        let channel_timeout = self.channel_timeout;

        self.attempts.spawn(async move {
            let outcome = match tokio::time::timeout(channel_timeout, attempt).await {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::Timeout),
            };

            match outcome {
                Ok(channel) if arbiter.try_commit() => {
                    observer.attempt_finished(index, Ok(()));
                    Some(channel)
                }
                Ok(channel) => {
                    tracing::debug!(kind = ?kind, "late channel closed");
                    channel.link.close();
                    observer.attempt_finished(index, Err(Error::Aborted));
                    None
                }
                Err(e) => {
                    tracing::debug!(kind = ?kind, error = %e, "channel attempt failed");
                    observer.attempt_finished(index, Err(e));
                    None
                }
            }
        });
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn is_committed(&self) -> bool {
        self.arbiter.is_committed()
    }

    /// Wait for the next attempt to finish. `None` once the set is empty.
    pub(crate) async fn next(&mut self) -> Option<Option<EstablishedChannel>> {
        let joined = self.attempts.join_next().await?;
        Some(joined.unwrap_or_else(|e| {
            tracing::debug!(error = %e, "channel attempt task ended abnormally");
            None
        }))
    }

    /// Abandon every remaining attempt.
    pub(crate) fn abandon(&mut self) {
        self.attempts.abort_all();
    }
}

impl Drop for Race {
    fn drop(&mut self) {
        self.abandon();
    }
}

/// Everything a connect race may attempt.
pub(crate) struct RacePlan {
    pub(crate) identity: LocalIdentity,
    pub(crate) channel_timeout: Duration,
    pub(crate) local: Option<LocalAttempt>,
    pub(crate) relay: Option<RelayAttempt>,
    pub(crate) direct: Option<DirectAttempt>,
}

impl RacePlan {
    /// Whether at least one channel kind can be attempted.
    pub(crate) fn has_attempts(&self) -> bool {
        self.local.is_some() || self.relay.is_some() || self.direct.is_some()
    }
}

/// Race every planned attempt; the first established channel wins.
///
/// Fails with [`Error::NoChannels`] once every attempt failed and the direct
/// candidate list is closed.
pub(crate) async fn race(plan: RacePlan, observer: Arc<dyn ChannelObserver>) -> Result<EstablishedChannel> {
    let RacePlan {
        identity,
        channel_timeout,
        local,
        relay,
        direct,
    } = plan;
    let mut attempts = Race::new(observer, channel_timeout);

    if let Some(local) = local {
        attempts.spawn(ChannelKind::Local, None, local.run(identity.clone()));
    }
    if let Some(relay) = relay {
        attempts.spawn(ChannelKind::Relay, None, relay.run());
    }
    let (channel, mut candidates) = match direct {
        Some(direct) => (Some(direct.channel), Some(direct.candidates)),
        None => (None, None),
    };

    loop {
        if attempts.is_empty() && candidates.is_none() {
            return Err(Error::NoChannels);
        }

        tokio::select! {
            endpoint = async { candidates.as_mut()?.recv().await }, if candidates.is_some() => {
                match (endpoint, &channel) {
                    (Some(endpoint), Some(channel)) => {
                        tracing::debug!(%endpoint, "attempting direct candidate");
                        let attempt = attempt_direct(
                            Arc::clone(channel),
                            ChannelKind::Direct,
                            endpoint.clone(),
                            identity.clone(),
                            None,
                        );
                        attempts.spawn(ChannelKind::Direct, Some(endpoint), attempt);
                    }
                    _ => candidates = None,
                }
            }
            joined = attempts.next(), if !attempts.is_empty() => {
                if let Some(Some(winner)) = joined {
                    attempts.abandon();
                    return Ok(winner);
                }
            }
        }
    }
}

#[cfg(all(test, feature = "device"))]
mod tests {
    use super::*;
    use crate::core::{Link, SecureChannel, SharedLink};
    use crate::transport::memory::{LinkConditions, link_pair};
    use crate::transport::{TransportError, TransportResult};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Records(Mutex<Vec<(ChannelKind, Option<Result<()>>)>>);

    impl ChannelObserver for Records {
        fn attempt_started(&self, kind: ChannelKind, _endpoint: Option<Endpoint>) -> usize {
            let mut records = self.0.lock();
            records.push((kind, None));
            records.len() - 1
        }

        fn attempt_finished(&self, index: usize, outcome: Result<()>) {
            self.0.lock()[index].1 = Some(outcome);
        }
    }

    /// Hosts answer after a delay; unknown hosts are unreachable.
    struct Delayed(HashMap<String, Duration>);

    #[async_trait]
    impl SecureChannel for Delayed {
        async fn establish(&self, endpoint: &Endpoint, _identity: &LocalIdentity) -> TransportResult<SharedLink> {
            let delay = self
                .0
                .get(&endpoint.host)
                .copied()
                .ok_or_else(|| TransportError::Unreachable(endpoint.to_string()))?;
            tokio::time::sleep(delay).await;
            let (link, _peer) = link_pair("client", &endpoint.host, LinkConditions::perfect());
            Ok(link)
        }
    }

    fn plan(hosts: &[(&str, u64)], endpoints: &[&str], close_list: bool) -> (RacePlan, Option<mpsc::UnboundedSender<Endpoint>>) {
        let channel = Arc::new(Delayed(
            hosts
                .iter()
                .map(|(h, ms)| (h.to_string(), Duration::from_millis(*ms)))
                .collect(),
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        for host in endpoints {
            tx.send(Endpoint::new(*host, 5592)).unwrap();
        }
        let plan = RacePlan {
            identity: LocalIdentity::default(),
            channel_timeout: Duration::from_millis(200),
            local: None,
            relay: None,
            direct: Some(DirectAttempt {
                channel,
                candidates: rx,
            }),
        };
        (plan, (!close_list).then_some(tx))
    }

    #[test]
    fn test_single_commit() {
        let arbiter = Arbiter::new();
        assert!(!arbiter.is_committed());
        assert!(arbiter.try_commit());
        assert!(!arbiter.try_commit());
        assert!(arbiter.is_committed());
    }

    #[tokio::test]
    async fn test_fastest_candidate_wins() {
        let records = Arc::new(Records::default());
        let (plan, _) = plan(&[("slow", 50), ("fast", 5)], &["slow", "fast"], true);

        let winner = race(plan, records.clone()).await.unwrap();
        assert_eq!(winner.kind, ChannelKind::Direct);
        assert_eq!(winner.link.peer_fingerprint(), "fast");
    }

    #[tokio::test]
    async fn test_all_failed() {
        let records = Arc::new(Records::default());
        let (plan, _) = plan(&[], &["a", "b"], true);

        assert_eq!(race(plan, records.clone()).await.unwrap_err(), Error::NoChannels);
        let records = records.0.lock();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|(_, outcome)| outcome.is_some_and(|o| o.is_err())));
    }

    #[tokio::test]
    async fn test_attempt_timeout() {
        let records = Arc::new(Records::default());
        let (plan, _) = plan(&[("sleepy", 1_000)], &["sleepy"], true);

        assert_eq!(race(plan, records.clone()).await.unwrap_err(), Error::NoChannels);
        assert_eq!(records.0.lock()[0].1, Some(Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn test_waits_for_candidate_list_end() {
        let records = Arc::new(Records::default());
        let (plan, tx) = plan(&[("late", 1)], &[], false);
        let tx = tx.unwrap();

        let handle = tokio::spawn(race(plan, records.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        tx.send(Endpoint::new("late", 5592)).unwrap();
        drop(tx);
        let winner = handle.await.unwrap().unwrap();
        assert_eq!(winner.link.peer_fingerprint(), "late");
    }

    #[tokio::test]
    async fn test_late_winner_closes_link() {
        let records: Arc<dyn ChannelObserver> = Arc::new(Records::default());
        let mut race = Race::new(records, Duration::from_secs(1));
        let (first, _a) = link_pair("c", "one", LinkConditions::perfect());
        let (second, _b) = link_pair("c", "two", LinkConditions::perfect());
        let second_link: SharedLink = second.clone();

        race.spawn(ChannelKind::Direct, None, async move {
            Ok(EstablishedChannel {
                kind: ChannelKind::Direct,
                link: first,
                peer_candidates: Vec::new(),
            })
        });
        assert!(matches!(race.next().await, Some(Some(_))));
        assert!(race.is_committed());

        race.spawn(ChannelKind::Direct, None, async move {
            Ok(EstablishedChannel {
                kind: ChannelKind::Direct,
                link: second_link,
                peer_candidates: Vec::new(),
            })
        });
        assert!(matches!(race.next().await, Some(None)));
        assert!(matches!(second.recv().await, Err(TransportError::Closed)));
    }
}
