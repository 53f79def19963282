//! Inbound change stream.

use crate::change_store::ChangeStore;
use crate::error::SyncResult;
use crate::transport::Transport;
use parking_lot::Mutex;
use sitesync_protocol::{Changes, RejectChanges, Seq, SiteId};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Whether an incoming batch starting at `since` may be admitted given
/// the watermark `seen` we last acknowledged from that sender.
///
/// A batch is acceptable iff it does not skip ahead: it may start at
/// or behind the watermark, never beyond it.
pub fn acceptable(seen: Seq, since: Seq) -> bool {
    since.version < seen.version
        || (since.version == seen.version && since.counter <= seen.counter)
}

/// Outcome of receiving one changeset batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Batch was applied; watermark advanced to the given position.
    Applied(Seq),
    /// Batch skipped ahead and was rejected; nothing was applied.
    /// Carries the watermark reported back to the sender.
    Rejected(Seq),
    /// Batch was empty or the stream is stopped; nothing to do.
    Empty,
}

/// Per-direction receiver: validates causal contiguity of incoming
/// changesets, applies them, and answers gaps with rejections.
///
/// The rejection/rewind cycle is the protocol's core correctness
/// mechanism: a rare renegotiation round-trip buys the guarantee that
/// no gap is ever silently applied.
pub struct InboundStream<T: Transport, S: ChangeStore> {
    transport: Arc<T>,
    store: Arc<S>,
    state: Mutex<InboundState>,
}

struct InboundState {
    last_seen: HashMap<SiteId, Seq>,
    stopped: bool,
}

impl<T: Transport, S: ChangeStore> InboundStream<T, S> {
    /// Creates a stream with no seeded watermarks.
    pub fn new(transport: Arc<T>, store: Arc<S>) -> Self {
        Self {
            transport,
            store,
            state: Mutex::new(InboundState {
                last_seen: HashMap::new(),
                stopped: false,
            }),
        }
    }

    /// Seeds causal watermarks before any `Changes` message is
    /// accepted. Called at session start and again on clean reopen.
    pub fn prepare(&self, last_seens: &[(SiteId, Seq)]) {
        let mut state = self.state.lock();
        if state.stopped {
            return;
        }
        for (site, seq) in last_seens {
            state.last_seen.insert(*site, *seq);
        }
    }

    /// Validates and applies one changeset batch.
    pub fn receive_changes(&self, message: Changes) -> SyncResult<ReceiveOutcome> {
        let seen = {
            let state = self.state.lock();
            if state.stopped {
                return Ok(ReceiveOutcome::Empty);
            }
            state
                .last_seen
                .get(&message.sender)
                .copied()
                .unwrap_or(Seq::ZERO)
        };

        if !acceptable(seen, message.since) {
            debug!(
                sender = %message.sender,
                seen = %seen,
                since = %message.since,
                "rejecting changeset that skipped ahead"
            );
            self.transport.reject_changes(&RejectChanges {
                whose: message.sender,
                since: seen,
            })?;
            return Ok(ReceiveOutcome::Rejected(seen));
        }

        let new_seen = match message.changes.last() {
            Some(change) => Seq::new(change.db_version, 0),
            None => return Ok(ReceiveOutcome::Empty),
        };

        self.store
            .apply_changeset_and_set_last_seen(&message.changes, message.sender, new_seen)?;

        let mut state = self.state.lock();
        state.last_seen.insert(message.sender, new_seen);
        Ok(ReceiveOutcome::Applied(new_seen))
    }

    /// The watermark currently held for a sender.
    pub fn last_seen_of(&self, site: SiteId) -> Seq {
        self.state
            .lock()
            .last_seen
            .get(&site)
            .copied()
            .unwrap_or(Seq::ZERO)
    }

    /// Stops the stream. Terminal and idempotent.
    pub fn stop(&self) {
        self.state.lock().stopped = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_store::MemoryChangeStore;
    use crate::transport::MockTransport;
    use sitesync_protocol::{Change, Message, Scalar};

    fn site(byte: u8) -> SiteId {
        SiteId::from_bytes([byte; 16])
    }

    fn change(db_version: u64, value: i64) -> Change {
        Change {
            table: "t".into(),
            pk: vec![1],
            column: "a".into(),
            value: Scalar::Integer(value),
            col_version: db_version,
            db_version,
            origin_site: Some(site(9)),
            causal_length: 1,
        }
    }

    fn setup() -> (
        Arc<MockTransport>,
        Arc<MemoryChangeStore>,
        InboundStream<MockTransport, MemoryChangeStore>,
    ) {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryChangeStore::with_site_id(site(1)));
        let stream = InboundStream::new(Arc::clone(&transport), Arc::clone(&store));
        (transport, store, stream)
    }

    #[test]
    fn acceptable_boundaries() {
        assert!(acceptable(Seq::new(5, 2), Seq::new(5, 2)));
        assert!(!acceptable(Seq::new(5, 2), Seq::new(5, 3)));
        assert!(!acceptable(Seq::new(4, 9), Seq::new(5, 0)));
        assert!(acceptable(Seq::new(5, 0), Seq::new(4, 9)));
        assert!(acceptable(Seq::ZERO, Seq::ZERO));
    }

    #[test]
    fn contiguous_batch_is_applied() {
        let (_, store, stream) = setup();
        stream.prepare(&[(site(9), Seq::ZERO)]);

        let outcome = stream
            .receive_changes(Changes {
                sender: site(9),
                since: Seq::ZERO,
                changes: vec![change(1, 10), change(2, 20)],
            })
            .unwrap();

        assert_eq!(outcome, ReceiveOutcome::Applied(Seq::new(2, 0)));
        assert_eq!(stream.last_seen_of(site(9)), Seq::new(2, 0));
        assert_eq!(store.get_last_seen(site(9)).unwrap(), Seq::new(2, 0));
        assert_eq!(store.value_of("t", &[1], "a"), Some(Scalar::Integer(20)));
    }

    #[test]
    fn gap_is_rejected_not_applied() {
        let (transport, store, stream) = setup();
        stream.prepare(&[(site(9), Seq::new(5, 0))]);

        let outcome = stream
            .receive_changes(Changes {
                sender: site(9),
                since: Seq::new(6, 0),
                changes: vec![change(7, 70)],
            })
            .unwrap();

        assert_eq!(outcome, ReceiveOutcome::Rejected(Seq::new(5, 0)));
        // No partial application.
        assert_eq!(store.value_of("t", &[1], "a"), None);
        assert_eq!(stream.last_seen_of(site(9)), Seq::new(5, 0));

        // The rejection reports our true watermark back to the sender.
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0],
            Message::RejectChanges(RejectChanges {
                whose: site(9),
                since: Seq::new(5, 0),
            })
        );
    }

    #[test]
    fn overlapping_resend_is_accepted() {
        let (_, _, stream) = setup();
        stream.prepare(&[(site(9), Seq::new(5, 0))]);

        // since == seen is acceptable; so is since behind seen.
        for since in [Seq::new(5, 0), Seq::new(3, 0)] {
            let outcome = stream
                .receive_changes(Changes {
                    sender: site(9),
                    since,
                    changes: vec![change(6, 60)],
                })
                .unwrap();
            assert!(matches!(outcome, ReceiveOutcome::Applied(_)));
        }
    }

    #[test]
    fn unknown_sender_starts_from_zero() {
        let (transport, _, stream) = setup();

        // A fresh peer may only start from the beginning.
        let outcome = stream
            .receive_changes(Changes {
                sender: site(8),
                since: Seq::new(1, 0),
                changes: vec![change(2, 20)],
            })
            .unwrap();
        assert_eq!(outcome, ReceiveOutcome::Rejected(Seq::ZERO));
        assert_eq!(transport.sent().len(), 1);
    }

    #[test]
    fn empty_batch_is_a_noop() {
        let (transport, _, stream) = setup();
        stream.prepare(&[(site(9), Seq::ZERO)]);

        let outcome = stream
            .receive_changes(Changes {
                sender: site(9),
                since: Seq::ZERO,
                changes: vec![],
            })
            .unwrap();
        assert_eq!(outcome, ReceiveOutcome::Empty);
        assert_eq!(stream.last_seen_of(site(9)), Seq::ZERO);
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn stopped_stream_ignores_input() {
        let (transport, store, stream) = setup();
        stream.stop();
        stream.stop();

        let outcome = stream
            .receive_changes(Changes {
                sender: site(9),
                since: Seq::ZERO,
                changes: vec![change(1, 10)],
            })
            .unwrap();
        assert_eq!(outcome, ReceiveOutcome::Empty);
        assert_eq!(store.value_of("t", &[1], "a"), None);
        assert!(transport.sent().is_empty());
    }
}
