//! Leader-Replicated fabric — spec §4.5.2.
//!
//! Used when a shared host is unavailable. One consumer is elected
//! leader via a shared mutable cell; the leader owns a local Producer
//! Host and rebroadcasts to followers over a bus (modeled here as a
//! [`tokio::sync::broadcast`] channel).

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;

use crate::model::OrderbookSlice;

/// Vacancy/staleness TTL for the leader record (spec §4.5.2, §6.4).
pub const LEADER_TTL_MS: u64 = 5_000;
/// How often the leader rewrites its record / followers re-check (spec §4.5.2).
pub const HEARTBEAT_INTERVAL_MS: u64 = 2_000;
/// How often followers ping the leader (spec §4.5.2 "Presence").
pub const FOLLOWER_PING_INTERVAL_MS: u64 = 2_000;
/// Followers not heard from in this long are pruned from the presence map.
pub const FOLLOWER_TTL_MS: u64 = 5_000;

/// One entry in the shared election cell (spec §6.4: `{tab_id, timestamp_ms}`).
#[derive(Debug, Clone, PartialEq)]
pub struct ElectionRecord {
    pub tab_id: String,
    pub heartbeat_ms: u64,
}

/// Abstracts the "shared mutable cell" of spec §4.5.2/§9. A real
/// deployment might back this with a small key-value store with 5s TTL
/// semantics (spec §9); [`InMemoryCell`] is the in-process
/// implementation used when every consumer context lives in the same
/// process.
pub trait ElectionCell: Send + Sync {
    fn read(&self) -> Option<ElectionRecord>;
    fn write(&self, record: ElectionRecord);
    fn clear(&self);
}

/// A `Mutex`-guarded cell shared across consumer contexts in one process.
#[derive(Default)]
pub struct InMemoryCell {
    inner: Mutex<Option<ElectionRecord>>,
}

impl ElectionCell for InMemoryCell {
    fn read(&self) -> Option<ElectionRecord> {
        self.inner.lock().unwrap().clone()
    }

    fn write(&self, record: ElectionRecord) {
        *self.inner.lock().unwrap() = Some(record);
    }

    fn clear(&self) {
        *self.inner.lock().unwrap() = None;
    }
}

/// Runs the election protocol of spec §4.5.2 against a shared cell.
pub struct Election<C: ElectionCell> {
    cell: C,
    tab_id: String,
}

impl<C: ElectionCell> Election<C> {
    pub fn new(cell: C, tab_id: impl Into<String>) -> Self {
        Self {
            cell,
            tab_id: tab_id.into(),
        }
    }

    /// Attempts to become leader: if the cell is empty or stale (no
    /// heartbeat within [`LEADER_TTL_MS`]), writes this tab's record
    /// and reads it back to confirm the write wasn't immediately
    /// overwritten by a racing claim (spec §4.5.2 "read-back-confirm").
    /// Returns whether this tab is leader after the attempt.
    pub fn try_claim(&self, now_ms: u64) -> bool {
        match self.cell.read() {
            Some(record) if record.tab_id == self.tab_id => true,
            Some(record) if now_ms.saturating_sub(record.heartbeat_ms) <= LEADER_TTL_MS => false,
            _ => {
                self.cell.write(ElectionRecord {
                    tab_id: self.tab_id.clone(),
                    heartbeat_ms: now_ms,
                });
                self.cell
                    .read()
                    .map(|record| record.tab_id == self.tab_id)
                    .unwrap_or(false)
            }
        }
    }

    /// Refreshes the leader's heartbeat. Call every
    /// [`HEARTBEAT_INTERVAL_MS`] while leading; a no-op (returns
    /// `false`) if no longer leader.
    pub fn heartbeat(&self, now_ms: u64) -> bool {
        match self.cell.read() {
            Some(record) if record.tab_id == self.tab_id => {
                self.cell.write(ElectionRecord {
                    tab_id: self.tab_id.clone(),
                    heartbeat_ms: now_ms,
                });
                true
            }
            _ => false,
        }
    }

    /// Clears the cell on leader termination so followers observe the
    /// vacancy immediately (spec §4.5.2, §6.4).
    pub fn release(&self) {
        if let Some(record) = self.cell.read() {
            if record.tab_id == self.tab_id {
                self.cell.clear();
            }
        }
    }
}

/// The leader's view of follower presence (spec §4.5.2 "Presence").
#[derive(Default)]
pub struct Presence {
    last_seen_ms: HashMap<String, u64>,
}

impl Presence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ping(&mut self, tab_id: impl Into<String>, now_ms: u64) {
        self.last_seen_ms.insert(tab_id.into(), now_ms);
    }

    /// Drops followers not seen in > [`FOLLOWER_TTL_MS`]; returns the
    /// surviving count (reported back as a metrics update, plus the
    /// leader itself per spec's tab_count semantics).
    pub fn prune(&mut self, now_ms: u64) -> usize {
        self.last_seen_ms
            .retain(|_, last_seen| now_ms.saturating_sub(*last_seen) <= FOLLOWER_TTL_MS);
        self.last_seen_ms.len()
    }
}

/// Slice fan-out bus: the leader publishes, followers subscribe. The
/// leader is responsible for coalescing to at most one publish per
/// display frame (the consumer bridge re-rates further downstream).
pub struct Bus {
    tx: broadcast::Sender<OrderbookSlice>,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrderbookSlice> {
        self.tx.subscribe()
    }

    pub fn publish(&self, slice: OrderbookSlice) {
        let _ = self.tx.send(slice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_claimant_wins_an_empty_cell() {
        let cell = InMemoryCell::default();
        let election = Election::new(cell, "tab-a");
        assert!(election.try_claim(0));
    }

    #[test]
    fn second_claimant_loses_while_leader_is_fresh() {
        let cell = InMemoryCell::default();
        cell.write(ElectionRecord {
            tab_id: "tab-a".to_string(),
            heartbeat_ms: 1_000,
        });
        let election = Election::new(cell, "tab-b");
        assert!(!election.try_claim(1_500));
    }

    #[test]
    fn claim_succeeds_once_leader_record_goes_stale() {
        let cell = InMemoryCell::default();
        cell.write(ElectionRecord {
            tab_id: "tab-a".to_string(),
            heartbeat_ms: 0,
        });
        let election = Election::new(cell, "tab-b");
        assert!(election.try_claim(LEADER_TTL_MS + 1));
    }

    #[test]
    fn heartbeat_is_a_noop_for_non_leaders() {
        let cell = InMemoryCell::default();
        cell.write(ElectionRecord {
            tab_id: "tab-a".to_string(),
            heartbeat_ms: 0,
        });
        let election = Election::new(cell, "tab-b");
        assert!(!election.heartbeat(100));
    }

    #[test]
    fn release_clears_cell_only_for_the_current_leader() {
        let cell = InMemoryCell::default();
        let leader = Election::new(cell, "tab-a");
        assert!(leader.try_claim(0));
        leader.release();
        assert!(leader.cell.read().is_none());
    }

    #[test]
    fn presence_prunes_stale_followers() {
        let mut presence = Presence::new();
        presence.ping("tab-a", 0);
        presence.ping("tab-b", 4_000);
        assert_eq!(presence.prune(4_500), 2);
        assert_eq!(presence.prune(FOLLOWER_TTL_MS + 4_501), 0);
    }
}
