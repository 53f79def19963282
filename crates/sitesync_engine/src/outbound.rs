//! Outbound change stream.

use crate::change_store::{ChangeStore, Disposer};
use crate::config::BackoffConfig;
use crate::error::SyncError;
use crate::transport::{SendOutcome, Transport};
use parking_lot::Mutex;
use sitesync_protocol::{Changes, Seq, SiteId};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

/// Per-direction sender for one peer.
///
/// Watches the store for local commits, pulls a fresh changeset since
/// the last confirmed send, and ships it. At most one pull is in
/// flight per stream, and `last_sent` only advances on a confirmed
/// send, so the `since` values a receiver observes are non-decreasing.
/// Changesets are never buffered: a rewind after rejection simply
/// re-pulls from store state, which makes re-sending safe.
pub struct OutboundStream<T: Transport, S: ChangeStore> {
    transport: Arc<T>,
    store: Arc<S>,
    backoff: BackoffConfig,
    state: Mutex<OutboundState>,
    watch: Mutex<Option<Disposer>>,
    weak: Weak<Self>,
}

struct OutboundState {
    last_sent: Seq,
    exclude_sites: Vec<SiteId>,
    local_only: bool,
    in_flight: bool,
    pending_retrigger: bool,
    pending_reset: Option<Seq>,
    next_backoff: Duration,
    pending_retry: Option<Duration>,
    started: bool,
    stopped: bool,
}

impl<T: Transport + 'static, S: ChangeStore + 'static> OutboundStream<T, S> {
    /// Creates an idle stream; call [`OutboundStream::start`] to begin.
    pub fn new(transport: Arc<T>, store: Arc<S>, backoff: BackoffConfig) -> Arc<Self> {
        let send_floor = backoff.send_floor;
        Arc::new_cyclic(|weak| Self {
            transport,
            store,
            backoff,
            state: Mutex::new(OutboundState {
                last_sent: Seq::ZERO,
                exclude_sites: Vec::new(),
                local_only: false,
                in_flight: false,
                pending_retrigger: false,
                pending_reset: None,
                next_backoff: send_floor,
                pending_retry: None,
                started: false,
                stopped: false,
            }),
            watch: Mutex::new(None),
            weak: weak.clone(),
        })
    }

    /// Starts (or restarts) streaming from `since`.
    ///
    /// Attaches the store watch and performs one immediate tick.
    pub fn start(&self, since: Seq, exclude_sites: Vec<SiteId>, local_only: bool) {
        {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.last_sent = since;
            state.exclude_sites = exclude_sites;
            state.local_only = local_only;
            state.started = true;
            state.next_backoff = self.backoff.send_floor;
            state.pending_retry = None;
            state.pending_reset = None;
        }

        let weak = self.weak.clone();
        let disposer = self.store.on_change(Arc::new(move || {
            if let Some(stream) = weak.upgrade() {
                stream.on_local_change();
            }
        }));
        // Replacing the slot drops any previous watch.
        *self.watch.lock() = Some(disposer);

        self.on_local_change();
    }

    /// Store watch callback: schedule a tick, coalescing with any
    /// pull already in flight.
    pub fn on_local_change(&self) {
        {
            let mut state = self.state.lock();
            if state.stopped || !state.started {
                return;
            }
            if state.in_flight {
                state.pending_retrigger = true;
                return;
            }
            state.in_flight = true;
        }
        self.drive();
    }

    /// The delay until the scheduled retry, if one is pending.
    pub fn pending_retry(&self) -> Option<Duration> {
        self.state.lock().pending_retry
    }

    /// Invoked by the host when the scheduled retry delay elapses.
    pub fn on_retry_timer(&self) {
        {
            let mut state = self.state.lock();
            if state.stopped || state.pending_retry.is_none() {
                return;
            }
            state.pending_retry = None;
            if state.in_flight {
                state.pending_retrigger = true;
                return;
            }
            state.in_flight = true;
        }
        self.drive();
    }

    /// Rewinds to the watermark the peer reported and resumes ticking.
    pub fn reset(&self, new_since: Seq) {
        {
            let mut state = self.state.lock();
            if state.stopped || !state.started {
                return;
            }
            debug!(since = %new_since, "outbound stream rewound by peer");
            state.next_backoff = self.backoff.send_floor;
            if state.in_flight {
                state.pending_reset = Some(new_since);
                state.pending_retrigger = true;
                return;
            }
            state.last_sent = new_since;
            state.pending_retry = None;
            state.in_flight = true;
        }
        self.drive();
    }

    /// Detaches from the store and stops. Terminal and idempotent.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            state.stopped = true;
            state.pending_retry = None;
            state.pending_retrigger = false;
            state.pending_reset = None;
        }
        self.watch.lock().take();
    }

    /// The last confirmed send position.
    pub fn last_sent(&self) -> Seq {
        self.state.lock().last_sent
    }

    /// Whether the stream has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    /// Runs pull/send cycles until idle or backpressured.
    ///
    /// Entered with `in_flight` already claimed; exits with it
    /// released (or a retry scheduled).
    fn drive(&self) {
        loop {
            let (since, exclude_sites, local_only) = {
                let state = self.state.lock();
                (state.last_sent, state.exclude_sites.clone(), state.local_only)
            };

            let changes = match self.store.pull_changeset(since, &exclude_sites, local_only) {
                Ok(changes) => changes,
                Err(error) => {
                    warn!(%error, "outbound pull failed");
                    self.state.lock().in_flight = false;
                    return;
                }
            };

            let new_last_sent = match changes.last() {
                Some(change) => Seq::new(change.db_version, 0),
                None => {
                    let mut state = self.state.lock();
                    if let Some(rewind) = state.pending_reset.take() {
                        state.last_sent = rewind;
                    }
                    if state.pending_retrigger {
                        state.pending_retrigger = false;
                        drop(state);
                        continue;
                    }
                    state.in_flight = false;
                    return;
                }
            };

            let message = Changes {
                sender: self.store.site_id(),
                since,
                changes,
            };

            match self.transport.send_changes(&message) {
                Ok(SendOutcome::Sent) => {
                    let mut state = self.state.lock();
                    match state.pending_reset.take() {
                        Some(rewind) => state.last_sent = rewind,
                        None => state.last_sent = new_last_sent,
                    }
                    state.next_backoff = self.backoff.send_floor;
                    if state.pending_retrigger {
                        state.pending_retrigger = false;
                        drop(state);
                        continue;
                    }
                    state.in_flight = false;
                    return;
                }
                Ok(SendOutcome::BufferFull) => {
                    // Must re-pull the same range next attempt.
                    let mut state = self.state.lock();
                    if let Some(rewind) = state.pending_reset.take() {
                        state.last_sent = rewind;
                    }
                    let delay = state.next_backoff;
                    state.next_backoff =
                        BackoffConfig::doubled(delay, self.backoff.send_ceiling);
                    state.pending_retry = Some(delay);
                    state.in_flight = false;
                    return;
                }
                Ok(SendOutcome::Reconnecting) => {
                    let mut state = self.state.lock();
                    if let Some(rewind) = state.pending_reset.take() {
                        state.last_sent = rewind;
                    }
                    state.pending_retry = Some(self.backoff.reconnect_probe);
                    state.in_flight = false;
                    return;
                }
                Err(error) => {
                    let retry = match error {
                        SyncError::NotConnected => self.backoff.reconnect_probe,
                        ref other => {
                            warn!(error = %other, "outbound send failed");
                            self.backoff.reconnect_probe
                        }
                    };
                    let mut state = self.state.lock();
                    if let Some(rewind) = state.pending_reset.take() {
                        state.last_sent = rewind;
                    }
                    state.pending_retry = Some(retry);
                    state.in_flight = false;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_store::MemoryChangeStore;
    use crate::transport::MockTransport;
    use sitesync_protocol::{Change, Scalar};

    fn site(byte: u8) -> SiteId {
        SiteId::from_bytes([byte; 16])
    }

    fn setup() -> (Arc<MockTransport>, Arc<MemoryChangeStore>, Arc<OutboundStream<MockTransport, MemoryChangeStore>>) {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryChangeStore::with_site_id(site(1)));
        let stream = OutboundStream::new(
            Arc::clone(&transport),
            Arc::clone(&store),
            BackoffConfig::default(),
        );
        (transport, store, stream)
    }

    #[test]
    fn start_ships_existing_changes() {
        let (transport, store, stream) = setup();
        store.write("t", vec![1], "a", Scalar::Integer(1));
        store.write("t", vec![1], "a", Scalar::Integer(2));

        stream.start(Seq::ZERO, vec![], false);

        let sent = transport.sent_changes();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].since, Seq::ZERO);
        assert_eq!(sent[0].changes.len(), 2);
        assert_eq!(stream.last_sent(), Seq::new(2, 0));
    }

    #[test]
    fn local_commits_trigger_incremental_sends() {
        let (transport, store, stream) = setup();
        stream.start(Seq::ZERO, vec![], false);
        assert!(transport.sent_changes().is_empty());

        store.write("t", vec![1], "a", Scalar::Integer(1));
        store.write("t", vec![1], "a", Scalar::Integer(2));

        let sent = transport.sent_changes();
        assert_eq!(sent.len(), 2);
        // since values are non-decreasing as observed by the receiver.
        assert_eq!(sent[0].since, Seq::ZERO);
        assert_eq!(sent[1].since, Seq::new(1, 0));
        assert_eq!(stream.last_sent(), Seq::new(2, 0));
    }

    #[test]
    fn buffer_full_backs_off_without_advancing() {
        let (transport, store, stream) = setup();
        transport.push_outcomes(SendOutcome::BufferFull, 10);
        stream.start(Seq::ZERO, vec![], false);

        store.write("t", vec![1], "a", Scalar::Integer(1));
        assert_eq!(stream.last_sent(), Seq::ZERO);

        let mut delays = Vec::new();
        delays.push(stream.pending_retry().unwrap().as_millis());
        for _ in 0..9 {
            stream.on_retry_timer();
            delays.push(stream.pending_retry().unwrap().as_millis());
            assert_eq!(stream.last_sent(), Seq::ZERO);
        }
        assert_eq!(
            delays,
            vec![50, 100, 200, 400, 800, 1000, 1000, 1000, 1000, 1000]
        );

        // Outcome queue drained: the next retry succeeds and resets backoff.
        stream.on_retry_timer();
        assert_eq!(stream.last_sent(), Seq::new(1, 0));
        assert_eq!(stream.pending_retry(), None);

        transport.push_outcome(SendOutcome::BufferFull);
        store.write("t", vec![1], "a", Scalar::Integer(2));
        assert_eq!(stream.pending_retry(), Some(Duration::from_millis(50)));
    }

    #[test]
    fn reconnecting_uses_fixed_probe_delay() {
        let (transport, store, stream) = setup();
        transport.push_outcome(SendOutcome::Reconnecting);
        stream.start(Seq::ZERO, vec![], false);

        store.write("t", vec![1], "a", Scalar::Integer(1));
        assert_eq!(stream.pending_retry(), Some(Duration::from_millis(3000)));
        assert_eq!(stream.last_sent(), Seq::ZERO);

        stream.on_retry_timer();
        assert_eq!(stream.last_sent(), Seq::new(1, 0));
    }

    #[test]
    fn reset_rewinds_and_resends_overlapping_range() {
        let (transport, store, stream) = setup();
        store.write("t", vec![1], "a", Scalar::Integer(1));
        store.write("t", vec![2], "a", Scalar::Integer(2));
        stream.start(Seq::ZERO, vec![], false);
        assert_eq!(stream.last_sent(), Seq::new(2, 0));

        stream.reset(Seq::new(1, 0));

        let sent = transport.sent_changes();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].since, Seq::new(1, 0));
        assert_eq!(sent[1].changes.len(), 1);
        assert_eq!(stream.last_sent(), Seq::new(2, 0));
    }

    #[test]
    fn exclude_sites_are_not_echoed() {
        let (transport, store, stream) = setup();
        store.write("t", vec![1], "a", Scalar::Integer(1));
        // A change relayed from site 2.
        let foreign = Change {
            table: "t".into(),
            pk: vec![9],
            column: "a".into(),
            value: Scalar::Integer(9),
            col_version: 1,
            db_version: 1,
            origin_site: Some(site(2)),
            causal_length: 1,
        };
        store
            .apply_changeset_and_set_last_seen(&[foreign], site(2), Seq::new(1, 0))
            .unwrap();

        stream.start(Seq::ZERO, vec![site(2)], false);

        let sent = transport.sent_changes();
        assert_eq!(sent.len(), 1);
        assert!(sent[0]
            .changes
            .iter()
            .all(|c| c.origin_site == Some(site(1))));
    }

    #[test]
    fn stop_detaches_and_is_idempotent() {
        let (transport, store, stream) = setup();
        stream.start(Seq::ZERO, vec![], false);
        stream.stop();
        stream.stop();

        store.write("t", vec![1], "a", Scalar::Integer(1));
        assert!(transport.sent_changes().is_empty());
        assert!(stream.is_stopped());

        // A late timer after stop must not fire.
        stream.on_retry_timer();
        assert!(transport.sent_changes().is_empty());
    }
}
