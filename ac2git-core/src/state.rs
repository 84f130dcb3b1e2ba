//! State and resume layer.
//!
//! `state/last` is the single authoritative record of where every
//! visible branch stands; everything else is derivable. Each tracked
//! stream additionally carries a `commit_history` audit chain whose
//! second parents are the historical branch tips in order, which lets
//! any branch position be reconstructed at any past transaction.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::gitstore::{GitStore, Oid, Signature};
use crate::model::{parse_tx_message, tx_message, StreamId, TrackedStreams, TxId};
use crate::refs::RefLayout;

/// Decoded `state/last`.
#[derive(Debug, Clone)]
pub struct LastState {
    pub commit: Oid,
    /// Transaction named by the state commit's message.
    pub tx: TxId,
    pub time: i64,
    /// Stream id -> visible branch tip. Streams whose branch has not
    /// been created yet carry no entry.
    pub heads: BTreeMap<StreamId, Oid>,
}

pub struct StateStore<'a> {
    store: &'a GitStore,
    layout: &'a RefLayout,
}

impl<'a> StateStore<'a> {
    pub fn new(store: &'a GitStore, layout: &'a RefLayout) -> Self {
        Self { store, layout }
    }

    pub fn read_last(&self) -> Result<Option<LastState>> {
        let commit = match self.store.read_ref(&self.layout.state_last())? {
            Some(c) => c,
            None => return Ok(None),
        };
        let (subject, time) = self.store.commit_info(commit.as_str())?;
        let tx = parse_tx_message(&subject).ok_or_else(|| {
            Error::Invariant(format!(
                "state commit {} has unexpected message '{}'",
                commit, subject
            ))
        })?;
        let mut heads = BTreeMap::new();
        for (name, _) in self.store.ls_tree(commit.as_str())? {
            let id: StreamId = name.parse().map_err(|_| {
                Error::Invariant(format!("state tree holds non-numeric entry '{}'", name))
            })?;
            let data = self
                .store
                .show(commit.as_str(), &name)?
                .unwrap_or_default();
            heads.insert(id, Oid::new(String::from_utf8_lossy(&data).trim()));
        }
        Ok(Some(LastState {
            commit,
            tx,
            time,
            heads,
        }))
    }

    /// Rewrite `state/last` for transaction `tx`. The new commit chains
    /// to the previous state commit so head-set history stays browsable;
    /// only the tip is authoritative.
    pub fn write_last(
        &self,
        tx: TxId,
        time: i64,
        heads: &BTreeMap<StreamId, Oid>,
    ) -> Result<Oid> {
        let parent = self.store.read_ref(&self.layout.state_last())?;
        let files: Vec<(String, Vec<u8>)> = heads
            .iter()
            .map(|(id, oid)| (id.to_string(), oid.as_str().as_bytes().to_vec()))
            .collect();
        let parents: Vec<Oid> = parent.into_iter().collect();
        self.store.commit_files(
            &self.layout.state_last(),
            &files,
            &tx_message(tx),
            &Signature::converter(time),
            &parents,
        )
    }

    /// Append an audit commit recording that `tip` was the stream's
    /// visible tip as of `tx`. Creates the orphan root on first use.
    pub fn append_audit(
        &self,
        stream: StreamId,
        tx: TxId,
        time: i64,
        tip: &Oid,
    ) -> Result<Oid> {
        let refname = self.layout.commit_history(stream);
        let empty = self.store.empty_tree()?;
        let prev = match self.store.read_ref(&refname)? {
            Some(c) => c,
            None => {
                let root = self.store.commit_tree(
                    &empty,
                    &[],
                    &format!("stream {}", stream),
                    &Signature::converter(0),
                )?;
                self.store.update_ref(&refname, &root)?;
                root
            }
        };
        let commit = self.store.commit_tree(
            &empty,
            &[prev, tip.clone()],
            &tx_message(tx),
            &Signature::converter(time),
        )?;
        self.store.update_ref(&refname, &commit)?;
        Ok(commit)
    }

    /// The branch tip recorded by the most recent audit commit, if any.
    pub fn latest_audit_tip(&self, stream: StreamId) -> Result<Option<Oid>> {
        let refname = self.layout.commit_history(stream);
        let commit = match self.store.read_ref(&refname)? {
            Some(c) => c,
            None => return Ok(None),
        };
        let parents = self.store.parents_of(&commit)?;
        Ok(parents.into_iter().nth(1))
    }

    /// Startup procedure: `state/last` wins over whatever the visible
    /// branch refs currently say, and audit chains that disagree with it
    /// get a correcting entry appended.
    pub fn restore(&self, tracked: &TrackedStreams) -> Result<Option<LastState>> {
        let last = match self.read_last()? {
            Some(l) => l,
            None => return Ok(None),
        };
        for stream in tracked.iter() {
            let head = match last.heads.get(&stream.id) {
                Some(h) => h,
                None => continue,
            };
            let branch = RefLayout::branch(&stream.branch);
            match self.store.read_ref(&branch)? {
                Some(current) if current == *head => {}
                current => {
                    if let Some(current) = current {
                        tracing::warn!(
                            stream = stream.id,
                            branch = %stream.branch,
                            %current,
                            recorded = %head,
                            "branch disagrees with recorded state; restoring"
                        );
                    }
                    self.store.update_ref(&branch, head)?;
                }
            }
            if self.latest_audit_tip(stream.id)?.as_ref() != Some(head) {
                tracing::warn!(
                    stream = stream.id,
                    "audit chain behind recorded state; appending correction"
                );
                self.append_audit(stream.id, last.tx, last.time, head)?;
            }
        }
        Ok(Some(last))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TrackedStream;
    use tempfile::TempDir;

    fn setup(tmp: &TempDir) -> (GitStore, RefLayout) {
        (
            GitStore::init(&tmp.path().join("repo"), None).unwrap(),
            RefLayout::new("refs/ac2git", 1),
        )
    }

    fn some_commit(store: &GitStore, refname: &str, data: &str, time: i64) -> Oid {
        store
            .commit_files(
                refname,
                &[("f".to_string(), data.as_bytes().to_vec())],
                "transaction 1",
                &Signature::converter(time),
                &[],
            )
            .unwrap()
    }

    #[test]
    fn test_state_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let (store, layout) = setup(&tmp);
        let state = StateStore::new(&store, &layout);
        assert!(state.read_last().unwrap().is_none());

        let tip = some_commit(&store, "refs/heads/main", "x", 10);
        let mut heads = BTreeMap::new();
        heads.insert(1u64, tip.clone());
        state.write_last(7, 1000, &heads).unwrap();

        let last = state.read_last().unwrap().unwrap();
        assert_eq!(last.tx, 7);
        assert_eq!(last.time, 1000);
        assert_eq!(last.heads.get(&1), Some(&tip));
    }

    #[test]
    fn test_state_commits_chain() {
        let tmp = TempDir::new().unwrap();
        let (store, layout) = setup(&tmp);
        let state = StateStore::new(&store, &layout);
        let tip = some_commit(&store, "refs/heads/main", "x", 10);
        let mut heads = BTreeMap::new();
        heads.insert(1u64, tip);
        let first = state.write_last(7, 1000, &heads).unwrap();
        let second = state.write_last(8, 1001, &heads).unwrap();
        assert_eq!(store.parents_of(&second).unwrap(), vec![first]);
    }

    #[test]
    fn test_audit_chain_shape() {
        let tmp = TempDir::new().unwrap();
        let (store, layout) = setup(&tmp);
        let state = StateStore::new(&store, &layout);

        let tip1 = some_commit(&store, "refs/heads/main", "a", 10);
        let audit1 = state.append_audit(1, 5, 100, &tip1).unwrap();
        let parents = store.parents_of(&audit1).unwrap();
        assert_eq!(parents.len(), 2);
        assert_eq!(parents[1], tip1);
        // Root is an orphan.
        assert!(store.parents_of(&parents[0]).unwrap().is_empty());

        let tip2 = some_commit(&store, "refs/heads/main", "b", 20);
        let audit2 = state.append_audit(1, 6, 200, &tip2).unwrap();
        let parents = store.parents_of(&audit2).unwrap();
        assert_eq!(parents[0], audit1);
        assert_eq!(parents[1], tip2);
        assert_eq!(state.latest_audit_tip(1).unwrap(), Some(tip2));
    }

    #[test]
    fn test_restore_state_wins() {
        let tmp = TempDir::new().unwrap();
        let (store, layout) = setup(&tmp);
        let state = StateStore::new(&store, &layout);
        let tracked = TrackedStreams::new(vec![TrackedStream {
            id: 1,
            name: "Main".into(),
            branch: "main".into(),
        }]);

        let recorded = some_commit(&store, "refs/tmp/a", "recorded", 10);
        let stray = some_commit(&store, "refs/tmp/b", "stray", 11);

        let mut heads = BTreeMap::new();
        heads.insert(1u64, recorded.clone());
        state.write_last(9, 900, &heads).unwrap();

        // Branch points somewhere else; restore must put it back and
        // append the missing audit entry.
        store.update_ref("refs/heads/main", &stray).unwrap();
        let last = state.restore(&tracked).unwrap().unwrap();
        assert_eq!(last.tx, 9);
        assert_eq!(
            store.read_ref("refs/heads/main").unwrap(),
            Some(recorded.clone())
        );
        assert_eq!(state.latest_audit_tip(1).unwrap(), Some(recorded.clone()));

        // Idempotent once consistent.
        let before = store.read_ref(&layout.commit_history(1)).unwrap();
        state.restore(&tracked).unwrap();
        assert_eq!(store.read_ref(&layout.commit_history(1)).unwrap(), before);
    }
}
