//! Transaction planner.
//!
//! Merge-walks the per-stream metadata histories into one global,
//! transaction-ordered stream of events, each naming the affected
//! streams and their contents commits. Processing must stop at the
//! minimum high-water mark across all tracked streams: past that line at
//! least one stream's contents are incomplete.
//!
//! The planner runs on its own thread and feeds the processor through a
//! bounded channel; backpressure from the processor's per-transaction
//! acknowledgment (the receive) bounds planner memory.

use std::collections::BTreeMap;

use crossbeam_channel::{bounded, Receiver};

use crate::error::{Error, Result};
use crate::gitstore::{GitStore, Oid};
use crate::model::{parse_tx_message, StreamId, StreamRecord, Transaction, TxId};
use crate::refs::RefLayout;
use crate::retrieve::read_hwm;
use crate::xml;

/// One stream's entry for a transaction.
#[derive(Debug, Clone)]
pub struct AffectedStream {
    pub stream: StreamId,
    pub info_commit: Oid,
    pub data_commit: Oid,
    pub data_tree: Oid,
}

/// One planner event: a transaction and every tracked stream it
/// affected, ascending by stream id.
#[derive(Debug, Clone)]
pub struct PlannerEvent {
    pub tx: TxId,
    pub transaction: Transaction,
    pub snapshot: Vec<StreamRecord>,
    pub affected: Vec<AffectedStream>,
}

#[derive(Debug)]
pub struct Planner {
    store: GitStore,
    /// tx -> affected streams, ascending stream id within each entry.
    by_tx: BTreeMap<TxId, Vec<AffectedStream>>,
    stop_line: TxId,
}

impl Planner {
    /// Read the per-stream histories and verify the pairing invariants:
    /// equal info/data lengths, matching `transaction <T>` messages at
    /// every ordinal position, strictly ascending transaction ids.
    pub fn load(store: &GitStore, layout: &RefLayout, streams: &[StreamId]) -> Result<Planner> {
        let mut by_tx: BTreeMap<TxId, Vec<AffectedStream>> = BTreeMap::new();
        let mut stop_line = TxId::MAX;
        let mut any = false;

        for &stream in streams {
            let info = store.log_ref(&layout.info(stream))?;
            let data = store.log_ref(&layout.data(stream))?;
            if info.len() != data.len() {
                return Err(Error::invariant_at(
                    stream,
                    0,
                    format!(
                        "info has {} commits but data has {}",
                        info.len(),
                        data.len()
                    ),
                ));
            }
            if info.is_empty() {
                // Nothing retrieved (e.g. the stream begins after the end
                // transaction); it cannot constrain the stop line.
                continue;
            }

            let mut prev_tx = 0;
            let mut last_tx = 0;
            for (i, d) in info.iter().zip(data.iter()) {
                if i.subject != d.subject {
                    return Err(Error::invariant_at(
                        stream,
                        prev_tx,
                        format!(
                            "info commit '{}' paired with data commit '{}'",
                            i.subject, d.subject
                        ),
                    ));
                }
                let tx = parse_tx_message(&i.subject).ok_or_else(|| {
                    Error::invariant_at(
                        stream,
                        prev_tx,
                        format!("unexpected commit message '{}'", i.subject),
                    )
                })?;
                if tx <= prev_tx {
                    return Err(Error::invariant_at(
                        stream,
                        tx,
                        "transaction ids not strictly ascending",
                    ));
                }
                prev_tx = tx;
                last_tx = tx;
                by_tx.entry(tx).or_default().push(AffectedStream {
                    stream,
                    info_commit: i.commit.clone(),
                    data_commit: d.commit.clone(),
                    data_tree: d.tree.clone(),
                });
            }

            // A completed retrieval leaves hwm at the tip; a crash right
            // before the hwm write leaves the (repaired, aligned) tip as
            // the effective mark.
            let hwm = read_hwm(store, layout, stream)?.unwrap_or(last_tx).max(last_tx);
            stop_line = stop_line.min(hwm);
            any = true;
        }

        if !any {
            stop_line = 0;
        }
        for affected in by_tx.values_mut() {
            affected.sort_by_key(|a| a.stream);
        }

        Ok(Planner {
            store: store.clone(),
            by_tx,
            stop_line,
        })
    }

    /// Last transaction processing may cross.
    pub fn stop_line(&self) -> TxId {
        self.stop_line
    }

    /// Transactions after `after`, up to the stop line.
    pub fn pending(&self, after: Option<TxId>) -> Vec<TxId> {
        let from = after.map(|t| t + 1).unwrap_or(0);
        self.by_tx
            .range(from..=self.stop_line)
            .map(|(tx, _)| *tx)
            .collect()
    }

    /// Build the full event for one transaction: parse `hist.xml` and
    /// `streams.xml` out of the (identical across streams, depot-wide)
    /// info commits.
    pub fn event_at(&self, tx: TxId) -> Result<PlannerEvent> {
        let affected = self
            .by_tx
            .get(&tx)
            .cloned()
            .ok_or_else(|| Error::Invariant(format!("no stream affected by transaction {}", tx)))?;
        let first = &affected[0];

        let hist_xml = self
            .store
            .show(first.info_commit.as_str(), "hist.xml")?
            .ok_or_else(|| {
                Error::invariant_at(first.stream, tx, "info commit lacks hist.xml")
            })?;
        let hist_xml = String::from_utf8_lossy(&hist_xml);
        let transaction = if hist_xml.trim().is_empty() {
            // Sentinel left by the retrieval pipeline for unreadable
            // history: a no-op except for bookkeeping.
            Transaction::sentinel(tx)
        } else {
            xml::parse_hist(&hist_xml)?
                .into_iter()
                .find(|t| t.id == tx)
                .ok_or_else(|| {
                    Error::invariant_at(first.stream, tx, "hist.xml does not mention the transaction")
                })?
        };

        let snapshot = match self.store.show(first.info_commit.as_str(), "streams.xml")? {
            Some(data) => xml::parse_streams(&String::from_utf8_lossy(&data))?,
            None => Vec::new(),
        };

        Ok(PlannerEvent {
            tx,
            transaction,
            snapshot,
            affected,
        })
    }

    /// The stream snapshot recorded at the latest transaction at or
    /// before `tx`, if any. Used on resume to seed "basis at T" queries
    /// that reach before the first pending transaction.
    pub fn snapshot_at_or_before(
        &self,
        tx: TxId,
    ) -> Result<Option<(TxId, Vec<StreamRecord>)>> {
        let (found_tx, affected) = match self.by_tx.range(..=tx).next_back() {
            Some((t, a)) => (*t, a),
            None => return Ok(None),
        };
        let first = &affected[0];
        match self.store.show(first.info_commit.as_str(), "streams.xml")? {
            Some(data) => Ok(Some((
                found_tx,
                xml::parse_streams(&String::from_utf8_lossy(&data))?,
            ))),
            None => Ok(None),
        }
    }

    /// Stream events after `after` through a bounded channel.
    pub fn spawn(
        self,
        after: Option<TxId>,
        capacity: usize,
    ) -> (Receiver<Result<PlannerEvent>>, std::thread::JoinHandle<()>) {
        let (sender, receiver) = bounded(capacity);
        let handle = std::thread::spawn(move || {
            for tx in self.pending(after) {
                let event = self.event_at(tx);
                let failed = event.is_err();
                if sender.send(event).is_err() || failed {
                    break;
                }
            }
        });
        (receiver, handle)
    }
}
