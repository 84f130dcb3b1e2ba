//! Stream id <-> name cache.
//!
//! Names change over time (`chstream`); the most recent binding wins.
//! The cache persists as a single commit whose tree holds one file per
//! stream id, and is rebuilt whenever a processed snapshot reveals a new
//! id or a rename.

use std::collections::BTreeMap;

use crate::error::Result;
use crate::gitstore::{GitStore, Oid, Signature};
use crate::model::{tx_message, StreamId, StreamRecord, TxId};
use crate::refs::RefLayout;

#[derive(Debug, Default)]
pub struct StreamNameCache {
    map: BTreeMap<StreamId, String>,
    dirty: bool,
}

impl StreamNameCache {
    /// Load the persisted cache; absent ref means an empty cache.
    pub fn load(store: &GitStore, layout: &RefLayout) -> Result<StreamNameCache> {
        let mut map = BTreeMap::new();
        if let Some(commit) = store.read_ref(&layout.stream_names())? {
            for (name, _) in store.ls_tree(commit.as_str())? {
                let id: StreamId = match name.parse() {
                    Ok(id) => id,
                    Err(_) => continue,
                };
                if let Some(data) = store.show(commit.as_str(), &name)? {
                    map.insert(id, String::from_utf8_lossy(&data).trim().to_string());
                }
            }
        }
        Ok(StreamNameCache { map, dirty: false })
    }

    /// Fold a snapshot into the cache; marks it dirty when a new id or a
    /// rename shows up.
    pub fn observe(&mut self, snapshot: &[StreamRecord]) {
        for record in snapshot {
            if self.map.get(&record.id) != Some(&record.name) {
                self.map.insert(record.id, record.name.clone());
                self.dirty = true;
            }
        }
    }

    /// Drop everything; the next observations rebuild from scratch.
    pub fn refresh(&mut self) {
        self.map.clear();
        self.dirty = true;
    }

    pub fn name(&self, id: StreamId) -> Option<&str> {
        self.map.get(&id).map(String::as_str)
    }

    pub fn id_of(&self, name: &str) -> Option<StreamId> {
        self.map
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(id, _)| *id)
    }

    /// Persist if dirty. `tx`/`time` stamp the commit so re-runs hash
    /// identically.
    pub fn save(
        &mut self,
        store: &GitStore,
        layout: &RefLayout,
        tx: TxId,
        time: i64,
    ) -> Result<Option<Oid>> {
        if !self.dirty {
            return Ok(None);
        }
        let files: Vec<(String, Vec<u8>)> = self
            .map
            .iter()
            .map(|(id, name)| (id.to_string(), name.clone().into_bytes()))
            .collect();
        let commit = store.commit_files(
            &layout.stream_names(),
            &files,
            &tx_message(tx),
            &Signature::converter(time),
            &[],
        )?;
        self.dirty = false;
        Ok(Some(commit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StreamKind;
    use tempfile::TempDir;

    fn rec(id: StreamId, name: &str) -> StreamRecord {
        StreamRecord {
            id,
            name: name.to_string(),
            kind: StreamKind::Normal,
            basis: None,
            timelock: None,
        }
    }

    #[test]
    fn test_observe_marks_dirty_on_rename() {
        let mut cache = StreamNameCache::default();
        cache.observe(&[rec(1, "Main")]);
        assert!(cache.dirty);
        cache.dirty = false;
        cache.observe(&[rec(1, "Main")]);
        assert!(!cache.dirty);
        cache.observe(&[rec(1, "Mainline")]);
        assert!(cache.dirty);
        assert_eq!(cache.name(1), Some("Mainline"));
        assert_eq!(cache.id_of("Mainline"), Some(1));
    }

    #[test]
    fn test_save_load_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = GitStore::init(&tmp.path().join("repo"), None).unwrap();
        let layout = RefLayout::new("refs/ac2git", 1);

        let mut cache = StreamNameCache::default();
        cache.observe(&[rec(1, "Main"), rec(2, "Dev")]);
        assert!(cache.save(&store, &layout, 10, 1000).unwrap().is_some());
        // Clean cache saves nothing.
        assert!(cache.save(&store, &layout, 11, 1001).unwrap().is_none());

        let loaded = StreamNameCache::load(&store, &layout).unwrap();
        assert_eq!(loaded.name(1), Some("Main"));
        assert_eq!(loaded.name(2), Some("Dev"));
        assert_eq!(loaded.id_of("Dev"), Some(2));
        assert_eq!(loaded.id_of("gone"), None);
    }
}
