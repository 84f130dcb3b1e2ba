//! Data model for depots, streams and transactions.
//!
//! Stream parentage mutates over time (`chstream`), so the basis graph is
//! kept as an event log of `show streams` snapshots keyed by transaction
//! id; "basis at T" resolves by binary search over that log rather than
//! through a mutable adjacency list.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Transaction id: dense integers starting at 1, per depot.
pub type TxId = u64;
/// Stable stream id.
pub type StreamId = u64;
/// Stable depot id.
pub type DepotId = u64;

/// Message used for every bookkeeping commit of transaction `tx`.
pub fn tx_message(tx: TxId) -> String {
    format!("transaction {}", tx)
}

/// Inverse of [`tx_message`].
pub fn parse_tx_message(subject: &str) -> Option<TxId> {
    subject.strip_prefix("transaction ")?.trim().parse().ok()
}

/// Kind of a source transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxKind {
    MkStream,
    ChStream,
    Promote,
    Keep,
    Defunct,
    Purge,
    Move,
    /// Anything else the source may emit; carried verbatim.
    Other(String),
}

impl TxKind {
    pub fn parse(raw: &str) -> TxKind {
        match raw {
            "mkstream" => TxKind::MkStream,
            "chstream" => TxKind::ChStream,
            "promote" => TxKind::Promote,
            "keep" => TxKind::Keep,
            "defunct" => TxKind::Defunct,
            "purge" => TxKind::Purge,
            "move" => TxKind::Move,
            other => TxKind::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            TxKind::MkStream => "mkstream",
            TxKind::ChStream => "chstream",
            TxKind::Promote => "promote",
            TxKind::Keep => "keep",
            TxKind::Defunct => "defunct",
            TxKind::Purge => "purge",
            TxKind::Move => "move",
            TxKind::Other(s) => s,
        }
    }
}

/// One parsed source transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TxId,
    pub kind: TxKind,
    pub user: String,
    /// Unix seconds, UTC (the source reports all times in UTC).
    pub time: i64,
    pub comment: String,
    /// Stream the transaction occurred in, when the history names it.
    pub stream: Option<String>,
    /// Source stream of a promote; absent on old history.
    pub from_stream: Option<String>,
    /// Destination stream of a promote.
    pub to_stream: Option<String>,
    /// Element paths touched by the transaction, depot-root relative.
    pub elements: Vec<String>,
}

impl Transaction {
    /// Bookkeeping-only placeholder for a transaction whose history XML
    /// was ill-formed: empty change set, advanced but never replayed.
    pub fn sentinel(id: TxId) -> Transaction {
        Transaction {
            id,
            kind: TxKind::Other("unreadable".to_string()),
            user: String::new(),
            time: 0,
            comment: String::new(),
            stream: None,
            from_stream: None,
            to_stream: None,
            elements: Vec::new(),
        }
    }

    pub fn is_sentinel(&self) -> bool {
        matches!(&self.kind, TxKind::Other(s) if s == "unreadable")
    }
}

/// Kind of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamKind {
    Normal,
    Workspace,
    Gated,
    Snapshot,
    Passthrough,
    Other(String),
}

impl StreamKind {
    pub fn parse(raw: &str) -> StreamKind {
        match raw {
            "normal" => StreamKind::Normal,
            "workspace" => StreamKind::Workspace,
            "gated" => StreamKind::Gated,
            "snapshot" => StreamKind::Snapshot,
            "passthrough" => StreamKind::Passthrough,
            other => StreamKind::Other(other.to_string()),
        }
    }
}

/// One stream as reported by a `show streams` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRecord {
    pub id: StreamId,
    pub name: String,
    pub kind: StreamKind,
    /// Parent stream id; the depot root stream has none.
    pub basis: Option<StreamId>,
    /// Transaction id above which the stream's view of its basis is
    /// frozen. Recorded for bookkeeping; not enforced by the engine.
    pub timelock: Option<TxId>,
}

/// Event log of stream snapshots, ordered by transaction id.
#[derive(Debug, Default)]
pub struct SnapshotLog {
    snaps: Vec<(TxId, Vec<StreamRecord>)>,
}

impl SnapshotLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the snapshot taken at `tx`. Snapshots arrive in ascending
    /// transaction order; a duplicate id replaces the earlier entry.
    pub fn insert(&mut self, tx: TxId, snapshot: Vec<StreamRecord>) {
        match self.snaps.binary_search_by_key(&tx, |(t, _)| *t) {
            Ok(i) => self.snaps[i].1 = snapshot,
            Err(i) => self.snaps.insert(i, (tx, snapshot)),
        }
    }

    /// The most recent snapshot at or before `tx`.
    pub fn at(&self, tx: TxId) -> Option<&[StreamRecord]> {
        let idx = match self.snaps.binary_search_by_key(&tx, |(t, _)| *t) {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        Some(&self.snaps[idx].1)
    }

    pub fn record_at(&self, stream: StreamId, tx: TxId) -> Option<&StreamRecord> {
        self.at(tx)?.iter().find(|r| r.id == stream)
    }

    pub fn record_by_name_at(&self, name: &str, tx: TxId) -> Option<&StreamRecord> {
        self.at(tx)?.iter().find(|r| r.name == name)
    }

    /// Effective basis of `stream` at `tx`.
    pub fn basis_at(&self, stream: StreamId, tx: TxId) -> Option<StreamId> {
        self.record_at(stream, tx)?.basis
    }

    /// Children of `stream` at `tx`, ascending by stream id.
    pub fn children_at(&self, stream: StreamId, tx: TxId) -> Vec<StreamId> {
        let mut out: Vec<StreamId> = self
            .at(tx)
            .map(|snap| {
                snap.iter()
                    .filter(|r| r.basis == Some(stream))
                    .map(|r| r.id)
                    .collect()
            })
            .unwrap_or_default();
        out.sort_unstable();
        out
    }
}

/// One stream selected for conversion, with its visible branch name.
#[derive(Debug, Clone)]
pub struct TrackedStream {
    pub id: StreamId,
    pub name: String,
    pub branch: String,
}

/// The frozen set of streams a converted repository tracks.
#[derive(Debug, Default)]
pub struct TrackedStreams {
    by_id: BTreeMap<StreamId, TrackedStream>,
}

impl TrackedStreams {
    pub fn new(streams: impl IntoIterator<Item = TrackedStream>) -> Self {
        Self {
            by_id: streams.into_iter().map(|s| (s.id, s)).collect(),
        }
    }

    pub fn get(&self, id: StreamId) -> Option<&TrackedStream> {
        self.by_id.get(&id)
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn id_by_name(&self, name: &str) -> Option<StreamId> {
        self.by_id
            .values()
            .find(|s| s.name == name)
            .map(|s| s.id)
    }

    /// All tracked streams, ascending by id (the deterministic tie-break
    /// order used throughout the engine).
    pub fn iter(&self) -> impl Iterator<Item = &TrackedStream> {
        self.by_id.values()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
