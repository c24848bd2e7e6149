//! Sequence Manager (SM) — spec §4.2.
//!
//! Buffers early deltas, fetches a one-shot REST snapshot, reconciles it
//! against the buffer, and detects/recovers from sequence gaps. Drives
//! the [`crate::book::BookEngine`] directly rather than emitting deltas
//! through a channel, since SM and BE share a single owner (the
//! network-I/O context, spec §5).
//!
//! The snapshot fetch runs as a detached task (spawned by
//! [`SequenceManager::trigger_fetch`]) rather than being awaited inline
//! from [`SequenceManager::on_delta`]: the producer's event loop must
//! keep polling the transport stream while a fetch is in flight, or
//! deltas that arrive during the round trip never reach the buffer and
//! get misrouted through the post-sync gap policy instead of being
//! dropped by reconciliation step 2 (spec §4.2).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::book::BookEngine;
use crate::model::{ConnectionStatus, RawDelta, Snapshot};

/// Maximum acceptable skip in `first_update_id` without triggering a
/// resync (spec GLOSSARY, §4.2).
pub const GAP_TOLERANCE: u64 = 1000;

/// Hard cap on snapshot fetch attempts per synchronization attempt
/// (spec §9 Open Questions: the source "does not clearly bound
/// re-entry"; this crate bounds it explicitly). Each entry into
/// `buffering` — whether from a fresh connection or a post-gap
/// `reset()` — gets its own budget of three fetches.
const MAX_SNAPSHOT_ATTEMPTS: u32 = 3;

/// Upper bound on the number of deltas held while unsynchronized (spec
/// §4.2: "a bounded in-memory buffer"). Oldest entries are evicted first;
/// reconciliation only ever needs deltas at or after the snapshot's
/// `last_update_id`, so dropping the very oldest ones when the cap is
/// hit loses nothing a snapshot fetch wouldn't already supersede.
const MAX_BUFFERED_DELTAS: usize = 10_000;

const SNAPSHOT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const SNAPSHOT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Errors from the sequence manager's own I/O (snapshot fetch).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("snapshot request failed: {0}")]
    Request(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Fetches a one-shot REST snapshot for a symbol. Abstracted behind a
/// trait so the reconciliation logic (§4.2) is testable without a real
/// HTTP round trip; [`HttpSnapshotSource`] is the production
/// implementation.
#[async_trait::async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_snapshot(&self, symbol: &str) -> Result<Snapshot>;
}

#[derive(serde::Deserialize)]
struct SnapshotWire {
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,
    bids: Vec<(String, String)>,
    asks: Vec<(String, String)>,
}

/// Fetches `{rest_url}?symbol={SYMBOL}&limit=1000` over HTTP (spec §4.2).
pub struct HttpSnapshotSource {
    client: reqwest::Client,
    rest_url: String,
}

impl HttpSnapshotSource {
    pub fn new(rest_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            rest_url: rest_url.into(),
        }
    }
}

#[async_trait::async_trait]
impl SnapshotSource for HttpSnapshotSource {
    async fn fetch_snapshot(&self, symbol: &str) -> Result<Snapshot> {
        let url = format!("{}?symbol={}&limit=1000", self.rest_url, symbol);
        let wire: SnapshotWire = self.client.get(url).send().await?.json().await?;
        Ok(Snapshot {
            last_update_id: wire.last_update_id,
            bids: wire.bids,
            asks: wire.asks,
        })
    }
}

/// The four phases of spec §4.2. `Resyncing` is transient: it exists
/// only for the duration of one `reset()` call triggered by a disallowed
/// gap, and is immediately followed by `Buffering`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Buffering,
    Syncing,
    Synchronized,
    Resyncing,
}

/// Observable transitions the manager makes while processing a delta,
/// useful for tests and for the Producer Host's metrics/logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceEvent {
    SnapshotFetchStarted,
    Synchronized,
    SequenceGap,
}

/// The outcome of one spawned snapshot-fetch attempt, fed back into
/// [`SequenceManager::handle_fetch_result`] by whatever is polling
/// [`SequenceManager::wait_fetch`] (the Producer Host's event loop).
#[derive(Debug)]
pub enum FetchAttemptResult {
    Snapshot(Snapshot),
    Failed,
    Cancelled,
}

/// The Sequence Manager (spec §4.2).
pub struct SequenceManager<S: SnapshotSource> {
    phase: Phase,
    buffer: VecDeque<RawDelta>,
    last_update_id: u64,
    fetch_attempts: u32,
    /// Cancelled and replaced on every `reset()`, so a fetch started
    /// before the reset observes cancellation and a fetch started after
    /// gets a fresh, uncancelled token. Cloning this out via
    /// [`SequenceManager::cancel_token`] lets an external watcher (e.g.
    /// the Producer Host reacting to a transport disconnect) abort an
    /// in-flight fetch without needing `&mut` access to the manager.
    cancel: CancellationToken,
    source: Arc<S>,
    symbol: String,
    sequence_gaps: u64,
    /// The in-flight snapshot fetch, if any. Polled (not consumed) by
    /// [`SequenceManager::wait_fetch`] so a `select!` that drops this
    /// future mid-poll (because another branch completed first) doesn't
    /// orphan the task — the handle stays parked in this `Option` across
    /// suspended polls until the fetch actually resolves.
    pending_fetch: Option<JoinHandle<FetchAttemptResult>>,
}

impl<S: SnapshotSource + Send + Sync + 'static> SequenceManager<S> {
    pub fn new(source: S, symbol: impl Into<String>) -> Self {
        Self {
            phase: Phase::Buffering,
            buffer: VecDeque::new(),
            last_update_id: 0,
            fetch_attempts: 0,
            cancel: CancellationToken::new(),
            source: Arc::new(source),
            symbol: symbol.into(),
            sequence_gaps: 0,
            pending_fetch: None,
        }
    }

    /// Maps the internal phase to the externally reported status (spec
    /// §4.4): `{buffering, syncing, resyncing} -> syncing`,
    /// `synchronized -> connected`.
    pub fn status(&self) -> ConnectionStatus {
        match self.phase {
            Phase::Buffering | Phase::Syncing | Phase::Resyncing => ConnectionStatus::Syncing,
            Phase::Synchronized => ConnectionStatus::Connected,
        }
    }

    pub fn is_synchronized(&self) -> bool {
        self.phase == Phase::Synchronized
    }

    pub fn sequence_gaps(&self) -> u64 {
        self.sequence_gaps
    }

    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    /// Whether a snapshot fetch is currently in flight. Lets the
    /// Producer Host's event loop decide whether [`Self::wait_fetch`] is
    /// worth polling this iteration.
    pub fn has_pending_fetch(&self) -> bool {
        self.pending_fetch.is_some()
    }

    /// A clone of the token guarding the current (or next) in-flight
    /// fetch. Cancelling it aborts a pending fetch without retry, the
    /// same effect `reset()` has when it races an in-flight request.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Aborts any in-flight fetch, clears the buffer, zeroes
    /// `last_update_id`, and returns to `buffering` (spec §4.2
    /// "reset()"). Called on every TC reconnect (spec §4.1) and
    /// internally after a disallowed gap.
    pub fn reset(&mut self) {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        if let Some(handle) = self.pending_fetch.take() {
            handle.abort();
        }
        self.buffer.clear();
        self.last_update_id = 0;
        self.fetch_attempts = 0;
        self.phase = Phase::Buffering;
    }

    fn push_buffered(&mut self, delta: RawDelta) {
        if self.buffer.len() >= MAX_BUFFERED_DELTAS {
            self.buffer.pop_front();
        }
        self.buffer.push_back(delta);
    }

    /// Processes one inbound delta, driving the buffering/syncing/
    /// synchronized/resyncing state machine and the gap policy of
    /// spec §4.2, and applying accepted deltas to `book`. Never blocks
    /// on the snapshot fetch: while unsynchronized, this only buffers
    /// the delta and, if no fetch is already in flight, kicks one off
    /// via [`Self::trigger_fetch`] without awaiting it. Poll
    /// [`Self::wait_fetch`] concurrently (e.g. as another `select!`
    /// branch) to learn when that fetch completes.
    pub fn on_delta(&mut self, delta: RawDelta, book: &mut BookEngine) -> Vec<SequenceEvent> {
        let mut events = Vec::new();

        if self.phase == Phase::Synchronized {
            let u = delta.first_update_id;
            let fin = delta.final_update_id;

            if u <= self.last_update_id + 1 {
                book.apply_delta(&delta);
                self.last_update_id = fin;
                return events;
            }

            let gap = u - (self.last_update_id + 1);
            if gap <= GAP_TOLERANCE {
                book.apply_delta(&delta);
                self.last_update_id = fin;
                return events;
            }

            self.sequence_gaps += 1;
            events.push(SequenceEvent::SequenceGap);
            self.phase = Phase::Resyncing;
            self.reset();
            self.push_buffered(delta);
        } else {
            self.push_buffered(delta);
        }

        if self.phase == Phase::Buffering && self.pending_fetch.is_none() {
            events.push(SequenceEvent::SnapshotFetchStarted);
            self.phase = Phase::Syncing;
            if self.fetch_attempts < MAX_SNAPSHOT_ATTEMPTS {
                self.trigger_fetch();
            }
        }

        events
    }

    /// Spawns one snapshot-fetch attempt as a detached task, counting it
    /// against the attempt budget immediately (spec §9: bounding
    /// re-entry). Attempts after the first wait out
    /// `SNAPSHOT_RETRY_DELAY` before issuing the request, mirroring the
    /// previous inline retry loop's backoff.
    fn trigger_fetch(&mut self) {
        self.fetch_attempts += 1;
        let attempt = self.fetch_attempts;
        let source = Arc::clone(&self.source);
        let symbol = self.symbol.clone();
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move {
            if attempt > 1 {
                tokio::select! {
                    _ = cancel.cancelled() => return FetchAttemptResult::Cancelled,
                    _ = tokio::time::sleep(SNAPSHOT_RETRY_DELAY) => {}
                }
            }

            let fetch =
                tokio::time::timeout(SNAPSHOT_FETCH_TIMEOUT, source.fetch_snapshot(&symbol));
            tokio::select! {
                _ = cancel.cancelled() => FetchAttemptResult::Cancelled,
                res = fetch => match res {
                    Ok(Ok(snapshot)) => FetchAttemptResult::Snapshot(snapshot),
                    _ => FetchAttemptResult::Failed,
                },
            }
        });

        self.pending_fetch = Some(handle);
    }

    /// Resolves when the in-flight fetch completes; never resolves if
    /// there is none, so it's safe to hold as a permanent `select!`
    /// branch. Polls the handle in place rather than taking it, so a
    /// `select!` that picks a different branch this round leaves the
    /// task tracked for the next poll instead of detaching it.
    pub async fn wait_fetch(&mut self) -> FetchAttemptResult {
        match self.pending_fetch.as_mut() {
            Some(handle) => {
                let result = handle.await;
                self.pending_fetch = None;
                result.unwrap_or(FetchAttemptResult::Cancelled)
            }
            None => std::future::pending().await,
        }
    }

    /// Reconciles a completed fetch attempt against the buffer (spec
    /// §4.2 "Snapshot reconciliation"), or schedules a retry on failure
    /// or a too-old snapshot. All deltas buffered up to this point —
    /// not just the one that triggered the fetch — pass through the
    /// drop-covered-deltas filter, since `on_delta` keeps buffering
    /// while this fetch is outstanding.
    pub fn handle_fetch_result(
        &mut self,
        outcome: FetchAttemptResult,
        book: &mut BookEngine,
    ) -> Vec<SequenceEvent> {
        let snapshot = match outcome {
            FetchAttemptResult::Cancelled => return Vec::new(),
            FetchAttemptResult::Failed => {
                if self.fetch_attempts < MAX_SNAPSHOT_ATTEMPTS {
                    self.trigger_fetch();
                }
                return Vec::new();
            }
            FetchAttemptResult::Snapshot(snapshot) => snapshot,
        };

        if let Some(first) = self.buffer.front() {
            if snapshot.last_update_id < first.first_update_id {
                // Snapshot older than the earliest buffered delta;
                // discard and refetch (spec §4.2 step 1).
                if self.fetch_attempts < MAX_SNAPSHOT_ATTEMPTS {
                    self.trigger_fetch();
                }
                return Vec::new();
            }
        }

        while let Some(front) = self.buffer.front() {
            if front.final_update_id <= snapshot.last_update_id {
                self.buffer.pop_front();
            } else {
                break;
            }
        }

        book.apply_snapshot(&snapshot);
        while let Some(buffered) = self.buffer.pop_front() {
            book.apply_delta(&buffered);
        }

        self.last_update_id = book.state().last_update_id();
        self.phase = Phase::Synchronized;
        vec![SequenceEvent::Synchronized]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Returns a fixed sequence of snapshots, one per call; repeats the
    /// last one once exhausted.
    struct ScriptedSource {
        responses: Mutex<VecDeque<Snapshot>>,
    }

    impl ScriptedSource {
        fn new(responses: Vec<Snapshot>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
            }
        }
    }

    #[async_trait::async_trait]
    impl SnapshotSource for ScriptedSource {
        async fn fetch_snapshot(&self, _symbol: &str) -> Result<Snapshot> {
            let mut responses = self.responses.lock().unwrap();
            if responses.len() > 1 {
                Ok(responses.pop_front().unwrap())
            } else {
                Ok(responses.front().cloned().unwrap())
            }
        }
    }

    fn delta(first: u64, last: u64) -> RawDelta {
        RawDelta {
            first_update_id: first,
            final_update_id: last,
            symbol: "BTCUSDT".to_string(),
            bids: vec![],
            asks: vec![],
        }
    }

    fn snapshot(last_update_id: u64) -> Snapshot {
        Snapshot {
            last_update_id,
            bids: vec![("100.0".to_string(), "1.0".to_string())],
            asks: vec![],
        }
    }

    /// Drives the manager's `wait_fetch`/`handle_fetch_result` loop to
    /// completion (either synchronized, or retries exhausted and still
    /// unsynchronized), collecting every event along the way.
    async fn drain_fetches<S: SnapshotSource + Send + Sync + 'static>(
        sm: &mut SequenceManager<S>,
        book: &mut BookEngine,
    ) -> Vec<SequenceEvent> {
        let mut events = Vec::new();
        while sm.has_pending_fetch() {
            let outcome = sm.wait_fetch().await;
            events.extend(sm.handle_fetch_result(outcome, book));
        }
        events
    }

    #[tokio::test]
    async fn scenario_1_snapshot_reconciliation_drops_stale_deltas() {
        let source = ScriptedSource::new(vec![snapshot(104)]);
        let mut sm = SequenceManager::new(source, "BTCUSDT");
        let mut book = BookEngine::new(15);

        sm.on_delta(delta(100, 102), &mut book);
        sm.on_delta(delta(103, 105), &mut book);
        sm.on_delta(delta(106, 108), &mut book);

        let events = drain_fetches(&mut sm, &mut book).await;

        assert!(sm.is_synchronized());
        assert_eq!(sm.last_update_id(), 108);
        assert!(events.contains(&SequenceEvent::Synchronized));
    }

    #[tokio::test]
    async fn scenario_2_large_gap_triggers_resync() {
        let source = ScriptedSource::new(vec![snapshot(1003), snapshot(3007)]);
        let mut sm = SequenceManager::new(source, "BTCUSDT");
        let mut book = BookEngine::new(15);

        sm.on_delta(delta(1, 1003), &mut book);
        drain_fetches(&mut sm, &mut book).await;
        assert!(sm.is_synchronized());

        let events = sm.on_delta(delta(3005, 3007), &mut book);
        assert!(events.contains(&SequenceEvent::SequenceGap));
        drain_fetches(&mut sm, &mut book).await;

        assert_eq!(sm.sequence_gaps(), 1);
        assert!(sm.is_synchronized());
        assert_eq!(sm.last_update_id(), 3007);
    }

    #[tokio::test]
    async fn scenario_3_small_gap_is_tolerated_without_callback() {
        let source = ScriptedSource::new(vec![snapshot(1003)]);
        let mut sm = SequenceManager::new(source, "BTCUSDT");
        let mut book = BookEngine::new(15);

        sm.on_delta(delta(1, 1003), &mut book);
        drain_fetches(&mut sm, &mut book).await;
        assert!(sm.is_synchronized());

        let events = sm.on_delta(delta(1504, 1506), &mut book);
        assert!(events.is_empty());
        assert_eq!(sm.sequence_gaps(), 0);
        assert_eq!(sm.last_update_id(), 1506);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_snapshot_is_discarded_and_refetched() {
        // First response is older than the earliest buffered delta and
        // must be discarded; second response reconciles successfully.
        let source = ScriptedSource::new(vec![snapshot(50), snapshot(108)]);
        let mut sm = SequenceManager::new(source, "BTCUSDT");
        let mut book = BookEngine::new(15);

        sm.on_delta(delta(100, 108), &mut book);
        drain_fetches(&mut sm, &mut book).await;

        assert!(sm.is_synchronized());
        assert_eq!(sm.last_update_id(), 108);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausting_retry_cap_leaves_manager_in_syncing() {
        // Every response is too old; after MAX_SNAPSHOT_ATTEMPTS the
        // manager gives up without panicking and stays unsynchronized.
        let source = ScriptedSource::new(vec![snapshot(1)]);
        let mut sm = SequenceManager::new(source, "BTCUSDT");
        let mut book = BookEngine::new(15);

        sm.on_delta(delta(100, 108), &mut book);
        drain_fetches(&mut sm, &mut book).await;

        assert!(!sm.is_synchronized());
        assert!(!sm.has_pending_fetch());
    }

    #[tokio::test]
    async fn cancelling_the_token_aborts_an_in_flight_fetch_without_retry() {
        struct Hanging;
        #[async_trait::async_trait]
        impl SnapshotSource for Hanging {
            async fn fetch_snapshot(&self, _symbol: &str) -> Result<Snapshot> {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }

        let mut sm = SequenceManager::new(Hanging, "BTCUSDT");
        let mut book = BookEngine::new(15);

        let events = sm.on_delta(delta(1, 1), &mut book);
        assert!(events.contains(&SequenceEvent::SnapshotFetchStarted));

        sm.cancel_token().cancel();
        let outcome = sm.wait_fetch().await;
        assert!(matches!(outcome, FetchAttemptResult::Cancelled));

        let events = sm.handle_fetch_result(outcome, &mut book);
        assert!(events.is_empty());
        assert!(!sm.is_synchronized());
        assert!(!sm.has_pending_fetch());
    }

    #[tokio::test]
    async fn deltas_arriving_during_an_in_flight_fetch_are_buffered_and_filtered() {
        // Regression test: the snapshot fetch must not block on_delta,
        // so deltas that arrive while it's outstanding are still
        // buffered and pass through reconciliation's drop-covered-
        // deltas filter rather than being replayed after the fact
        // (which would regress last_update_id and violate spec §5's
        // monotonicity invariant).
        let source = ScriptedSource::new(vec![snapshot(104)]);
        let mut sm = SequenceManager::new(source, "BTCUSDT");
        let mut book = BookEngine::new(15);

        let events = sm.on_delta(delta(100, 102), &mut book);
        assert!(events.contains(&SequenceEvent::SnapshotFetchStarted));
        assert!(sm.has_pending_fetch());

        // These arrive while the fetch above is still in flight. Since
        // on_delta never awaits the fetch, both are simply buffered.
        let events = sm.on_delta(delta(103, 105), &mut book);
        assert!(events.is_empty());
        let events = sm.on_delta(delta(106, 108), &mut book);
        assert!(events.is_empty());

        let events = drain_fetches(&mut sm, &mut book).await;

        assert!(events.contains(&SequenceEvent::Synchronized));
        assert!(sm.is_synchronized());
        // last_update_id must advance to 108, not regress to the
        // snapshot's 104 followed by a stale replay of (100, 102).
        assert_eq!(sm.last_update_id(), 108);
    }

    #[test]
    fn buffer_is_bounded_and_evicts_oldest_first() {
        let source = ScriptedSource::new(vec![snapshot(1)]);
        let mut sm = SequenceManager::new(source, "BTCUSDT");

        for i in 0..(MAX_BUFFERED_DELTAS as u64 + 10) {
            sm.push_buffered(delta(i, i));
        }

        assert_eq!(sm.buffer.len(), MAX_BUFFERED_DELTAS);
        // The oldest ten entries (0..10) were evicted; the buffer now
        // starts at first_update_id 10.
        assert_eq!(sm.buffer.front().unwrap().first_update_id, 10);
    }
}
