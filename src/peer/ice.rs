//! Remote candidate buffering and candidate classification.

use std::collections::VecDeque;
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::logger::dump_candidate;
use crate::peer::connection::ConnectionHandle;
use crate::peer::types::{Generation, IceCandidate};

/// Remote candidates that arrived before their connection could take them.
///
/// Entries are applied in arrival order and only to the connection generation
/// they were received for. Flushes are serialized: a flush requested while
/// another is running returns immediately and the running one picks up
/// whatever was enqueued in the meantime.
#[derive(Default)]
pub struct CandidateBuffer {
    pending: Mutex<VecDeque<(Generation, IceCandidate)>>,
    flush_lock: tokio::sync::Mutex<()>,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, generation: Generation, candidate: IceCandidate) {
        dump_candidate("REMOTE-QUEUED", &candidate);
        self.pending.lock().push_back((generation, candidate));
    }

    /// Drops every entry that does not belong to `current`.
    pub fn discard(&self, current: Generation) -> usize {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|(generation, _)| *generation == current);
        let dropped = before - pending.len();
        if dropped > 0 {
            debug!(dropped, current, "discarded stale candidates");
        }
        dropped
    }

    /// Moves every entry onto `generation`. Used when a connection is
    /// replaced while answering an offer the buffered candidates belong to.
    pub fn rebind(&self, generation: Generation) {
        for entry in self.pending.lock().iter_mut() {
            entry.0 = generation;
        }
    }

    pub fn clear(&self) {
        self.pending.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    fn ready_for(&self, handle: &ConnectionHandle) -> bool {
        if handle.is_closed() || !handle.has_remote_description() {
            return false;
        }
        matches!(
            self.pending.lock().front(),
            Some((generation, _)) if *generation <= handle.generation()
        )
    }

    /// Applies queued candidates to `handle` and returns how many were
    /// applied. A candidate the connection rejects is logged and skipped.
    pub async fn flush(&self, handle: &ConnectionHandle) -> usize {
        let mut applied = 0;
        loop {
            {
                let Ok(_flushing) = self.flush_lock.try_lock() else {
                    return applied;
                };
                applied += self.drain_into(handle).await;
            }
            // Something may have been enqueued after our last pop but before
            // the lock was released; the caller that lost try_lock relies on
            // us to apply it.
            if !self.ready_for(handle) {
                return applied;
            }
        }
    }

    async fn drain_into(&self, handle: &ConnectionHandle) -> usize {
        let current = handle.generation();
        let mut applied = 0;
        loop {
            if handle.is_closed() || !handle.has_remote_description() {
                break;
            }
            let next = self.pending.lock().pop_front();
            let Some((generation, candidate)) = next else {
                break;
            };
            if generation < current {
                debug!(generation, current, "dropping candidate for replaced connection");
                continue;
            }
            if generation > current {
                // Meant for a connection newer than this handle; leave it.
                self.pending.lock().push_front((generation, candidate));
                break;
            }
            match handle.add_remote_candidate(candidate.clone()).await {
                Ok(()) => {
                    dump_candidate("REMOTE-APPLIED", &candidate);
                    applied += 1;
                }
                Err(err) => warn!(
                    generation,
                    candidate = %candidate.candidate,
                    error = %err,
                    "remote candidate rejected"
                ),
            }
        }
        applied
    }
}

/// Candidate type as carried in the `typ` attribute.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CandidateKind {
    Host,
    #[serde(rename = "srflx")]
    ServerReflexive,
    #[serde(rename = "prflx")]
    PeerReflexive,
    Relay,
    Unknown,
}

impl CandidateKind {
    pub fn of(candidate: &IceCandidate) -> Self {
        let mut fields = candidate.candidate.split_whitespace();
        while let Some(field) = fields.next() {
            if field == "typ" {
                return match fields.next() {
                    Some("host") => CandidateKind::Host,
                    Some("srflx") => CandidateKind::ServerReflexive,
                    Some("prflx") => CandidateKind::PeerReflexive,
                    Some("relay") => CandidateKind::Relay,
                    _ => CandidateKind::Unknown,
                };
            }
        }
        CandidateKind::Unknown
    }
}

impl fmt::Display for CandidateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CandidateKind::Host => "host",
            CandidateKind::ServerReflexive => "srflx",
            CandidateKind::PeerReflexive => "prflx",
            CandidateKind::Relay => "relay",
            CandidateKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::types::SessionDescription;
    use crate::testing::FakePeerFactory;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn cand(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 udp 1 10.0.0.{n} 5000 typ host"))
    }

    async fn answering_handle(
        factory: &FakePeerFactory,
        generation: Generation,
    ) -> Arc<ConnectionHandle> {
        let (tx, _rx) = mpsc::unbounded_channel();
        ConnectionHandle::create(factory, generation, true, tx)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn flush_waits_for_remote_description() {
        let factory = FakePeerFactory::new();
        let handle = answering_handle(&factory, 1).await;
        let buffer = CandidateBuffer::new();
        buffer.enqueue(1, cand(1));

        assert_eq!(buffer.flush(&handle).await, 0);
        assert_eq!(buffer.len(), 1);

        handle
            .apply_remote_description(SessionDescription::offer("o"))
            .await
            .unwrap();
        assert_eq!(buffer.flush(&handle).await, 1);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn applies_in_arrival_order() {
        let factory = FakePeerFactory::new();
        let handle = answering_handle(&factory, 1).await;
        let buffer = CandidateBuffer::new();
        for n in 1..=3 {
            buffer.enqueue(1, cand(n));
        }
        handle
            .apply_remote_description(SessionDescription::offer("o"))
            .await
            .unwrap();

        assert_eq!(buffer.flush(&handle).await, 3);
        assert_eq!(
            factory.last().unwrap().applied_candidates(),
            vec![cand(1), cand(2), cand(3)]
        );
    }

    #[tokio::test]
    async fn stale_generations_never_reach_the_new_connection() {
        let factory = FakePeerFactory::new();
        let handle = answering_handle(&factory, 2).await;
        let buffer = CandidateBuffer::new();
        buffer.enqueue(1, cand(1));
        buffer.enqueue(2, cand(2));
        buffer.enqueue(1, cand(3));
        handle
            .apply_remote_description(SessionDescription::offer("o"))
            .await
            .unwrap();

        assert_eq!(buffer.flush(&handle).await, 1);
        assert_eq!(factory.last().unwrap().applied_candidates(), vec![cand(2)]);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn rejected_candidate_does_not_stop_the_flush() {
        let factory = FakePeerFactory::new();
        let handle = answering_handle(&factory, 1).await;
        let buffer = CandidateBuffer::new();
        buffer.enqueue(1, cand(1));
        buffer.enqueue(1, IceCandidate::new("invalid"));
        buffer.enqueue(1, cand(2));
        handle
            .apply_remote_description(SessionDescription::offer("o"))
            .await
            .unwrap();

        assert_eq!(buffer.flush(&handle).await, 2);
        assert_eq!(
            factory.last().unwrap().applied_candidates(),
            vec![cand(1), cand(2)]
        );
    }

    #[tokio::test]
    async fn concurrent_flushes_apply_each_candidate_once() {
        let factory = FakePeerFactory::new();
        let handle = answering_handle(&factory, 1).await;
        let buffer = CandidateBuffer::new();
        handle
            .apply_remote_description(SessionDescription::offer("o"))
            .await
            .unwrap();
        for n in 1..=4 {
            buffer.enqueue(1, cand(n));
        }

        let (a, b) = tokio::join!(buffer.flush(&handle), buffer.flush(&handle));
        assert_eq!(a + b, 4);
        assert_eq!(
            factory.last().unwrap().applied_candidates(),
            (1..=4).map(cand).collect::<Vec<_>>()
        );
    }

    #[test]
    fn discard_keeps_only_current_generation() {
        let buffer = CandidateBuffer::new();
        buffer.enqueue(1, cand(1));
        buffer.enqueue(2, cand(2));
        assert_eq!(buffer.discard(2), 1);
        assert_eq!(buffer.len(), 1);
        buffer.enqueue(1, cand(3));
        buffer.rebind(3);
        assert_eq!(buffer.discard(3), 0);
        buffer.clear();
        assert!(buffer.is_empty());
    }

    #[test]
    fn classifies_candidate_types() {
        let host = cand(1);
        let srflx = IceCandidate::new(
            "candidate:2 1 udp 1694498815 203.0.113.7 61000 typ srflx raddr 10.0.0.2 rport 5000",
        );
        let relay = IceCandidate::new("candidate:3 1 udp 16777215 198.51.100.4 3478 typ relay");
        let garbage = IceCandidate::new("not a candidate");

        assert_eq!(CandidateKind::of(&host), CandidateKind::Host);
        assert_eq!(CandidateKind::of(&srflx), CandidateKind::ServerReflexive);
        assert_eq!(CandidateKind::of(&relay), CandidateKind::Relay);
        assert_eq!(CandidateKind::of(&garbage), CandidateKind::Unknown);
        assert_eq!(CandidateKind::ServerReflexive.to_string(), "srflx");
    }
}
