//! Ref layout inside the target repository.
//!
//! Everything the converter persists lives under one namespace so a
//! plain `git branch`/`git log` view of the repository stays clean.

use crate::model::{DepotId, StreamId};

/// Builds the ref names for one depot under a configurable namespace.
#[derive(Debug, Clone)]
pub struct RefLayout {
    namespace: String,
    depot: DepotId,
}

impl RefLayout {
    pub fn new(namespace: &str, depot: DepotId) -> Self {
        Self {
            namespace: namespace.trim_end_matches('/').to_string(),
            depot,
        }
    }

    pub fn depot(&self) -> DepotId {
        self.depot
    }

    /// Metadata history of a stream.
    pub fn info(&self, stream: StreamId) -> String {
        format!(
            "{}/depots/{}/streams/{}/info",
            self.namespace, self.depot, stream
        )
    }

    /// Contents history of a stream.
    pub fn data(&self, stream: StreamId) -> String {
        format!(
            "{}/depots/{}/streams/{}/data",
            self.namespace, self.depot, stream
        )
    }

    /// High-water mark of a stream.
    pub fn hwm(&self, stream: StreamId) -> String {
        format!(
            "{}/depots/{}/streams/{}/hwm",
            self.namespace, self.depot, stream
        )
    }

    /// Audit chain of a stream's visible branch.
    pub fn commit_history(&self, stream: StreamId) -> String {
        format!(
            "{}/depots/{}/streams/{}/commit_history",
            self.namespace, self.depot, stream
        )
    }

    /// Last known heads of every tracked stream.
    pub fn state_last(&self) -> String {
        format!("{}/state/depots/{}/last", self.namespace, self.depot)
    }

    /// Stream id <-> name cache.
    pub fn stream_names(&self) -> String {
        format!("{}/cache/depots/{}/stream_names", self.namespace, self.depot)
    }

    /// A user-visible branch.
    pub fn branch(name: &str) -> String {
        format!("refs/heads/{}", name)
    }
}
