//! Processing engine.
//!
//! Consumes planner events in transaction order and emits commits on the
//! user-visible branches. Planning is a pure step: `plan_transaction`
//! turns one event plus a snapshot of the current branch tips into a
//! list of commit operations, which a separate applier executes. That
//! split keeps the merge/cherry-pick/fast-forward policy testable
//! without a repository.
//!
//! Ordering guarantees: commits land in strictly increasing transaction
//! order; within one transaction a child stream's commit comes after its
//! basis's; audit refs are appended after the branch they track; the
//! `state/last` rewrite concludes the transaction.

use std::collections::BTreeMap;

use crossbeam_channel::Receiver;

use crate::config::{EmptyChildAction, UserIdent};
use crate::convert::StopFlag;
use crate::error::{Error, Result};
use crate::gitstore::{GitStore, Oid, Signature, StoreView};
use crate::model::{
    tx_message, StreamId, StreamKind, TrackedStreams, Transaction, TxId, SnapshotLog,
};
use crate::names::StreamNameCache;
use crate::planner::{AffectedStream, PlannerEvent};
use crate::refs::RefLayout;
use crate::state::StateStore;

/// Policy knobs of the processing engine.
#[derive(Debug, Clone)]
pub struct EnginePolicy {
    pub source_stream_fast_forward: bool,
    pub empty_child_action: EmptyChildAction,
    pub mkstream_basis_parent: bool,
}

/// Reference to a commit: one that already exists, or one produced by an
/// earlier operation of the same transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitRef {
    Existing(Oid),
    New(usize),
}

/// A commit to create on a stream's visible branch.
#[derive(Debug, Clone)]
pub struct CommitOp {
    pub stream: StreamId,
    pub tree: Oid,
    pub parents: Vec<CommitRef>,
    pub message: String,
    pub sig: Signature,
}

/// One operation of a transaction's plan, applied in order.
#[derive(Debug, Clone)]
pub enum EngineOp {
    Commit(CommitOp),
    /// Advance a branch to a commit created earlier in this plan.
    FastForward { stream: StreamId, to: usize },
    /// No branch movement, but the audit chain still records the
    /// transaction against the current tip.
    Touch { stream: StreamId },
}

/// Inputs of the pure planning step.
pub struct PlanContext<'a> {
    pub tracked: &'a TrackedStreams,
    pub snapshots: &'a SnapshotLog,
    pub tips: &'a BTreeMap<StreamId, Oid>,
    pub policy: &'a EnginePolicy,
    pub users: &'a BTreeMap<String, UserIdent>,
}

impl<'a> PlanContext<'a> {
    fn signature(&self, tx: &Transaction) -> Signature {
        match self.users.get(&tx.user) {
            Some(ident) => Signature {
                name: ident.name.clone(),
                email: ident.email.clone(),
                time: tx.time,
                tz: ident.timezone.clone().unwrap_or_else(|| "+0000".to_string()),
            },
            None => {
                tracing::debug!(user = %tx.user, "no user mapping; using source username");
                Signature {
                    name: tx.user.clone(),
                    email: format!("{}@localhost", tx.user),
                    time: tx.time,
                    tz: "+0000".to_string(),
                }
            }
        }
    }
}

/// Compute the operations for one transaction.
pub fn plan_transaction(
    ev: &PlannerEvent,
    ctx: &PlanContext<'_>,
    view: &dyn StoreView,
) -> Result<Vec<EngineOp>> {
    let mut planner = TxPlanner {
        ev,
        ctx,
        view,
        affected: ev.affected.iter().map(|a| (a.stream, a)).collect(),
        ops: Vec::new(),
        new_tips: BTreeMap::new(),
    };
    planner.plan()?;
    Ok(planner.ops)
}

struct TxPlanner<'a, 'b> {
    ev: &'a PlannerEvent,
    ctx: &'a PlanContext<'b>,
    view: &'a dyn StoreView,
    affected: BTreeMap<StreamId, &'a AffectedStream>,
    ops: Vec<EngineOp>,
    new_tips: BTreeMap<StreamId, usize>,
}

impl<'a, 'b> TxPlanner<'a, 'b> {
    fn plan(&mut self) -> Result<()> {
        let tx = &self.ev.transaction;
        if tx.is_sentinel() {
            return Ok(());
        }
        use crate::model::TxKind::*;
        match &tx.kind {
            MkStream => self.plan_mkstream(),
            ChStream => self.plan_chstream(),
            _ if tx.to_stream.is_some() => self.plan_promote(),
            _ => self.plan_origin(),
        }
    }

    // ── helpers ────────────────────────────────────────────────

    fn tip(&self, stream: StreamId) -> Option<CommitRef> {
        if let Some(idx) = self.new_tips.get(&stream) {
            return Some(CommitRef::New(*idx));
        }
        self.ctx
            .tips
            .get(&stream)
            .cloned()
            .map(CommitRef::Existing)
    }

    fn data_tree(&self, stream: StreamId) -> Option<Oid> {
        self.affected.get(&stream).map(|a| a.data_tree.clone())
    }

    fn op_tree(&self, idx: usize) -> Oid {
        match &self.ops[idx] {
            EngineOp::Commit(op) => op.tree.clone(),
            // Only commit indices are recorded as new tips.
            _ => unreachable!("new tip does not reference a commit op"),
        }
    }

    fn tree_of_ref(&self, r: &CommitRef) -> Result<Oid> {
        match r {
            CommitRef::Existing(oid) => self.view.tree_of(oid.as_str()),
            CommitRef::New(idx) => Ok(self.op_tree(*idx)),
        }
    }

    /// Whether `target` is reachable from `r`, looking through pending
    /// operations that have not been applied yet.
    fn reaches(&self, r: &CommitRef, target: &Oid) -> Result<bool> {
        match r {
            CommitRef::Existing(oid) => {
                Ok(oid == target || self.view.is_ancestor(target, oid)?)
            }
            CommitRef::New(idx) => {
                if let EngineOp::Commit(op) = &self.ops[*idx] {
                    for parent in &op.parents {
                        if self.reaches(parent, target)? {
                            return Ok(true);
                        }
                    }
                }
                Ok(false)
            }
        }
    }

    fn message(&self) -> String {
        let comment = self.ev.transaction.comment.trim();
        if comment.is_empty() {
            tx_message(self.ev.tx)
        } else {
            self.ev.transaction.comment.clone()
        }
    }

    fn push_commit(&mut self, stream: StreamId, tree: Oid, parents: Vec<CommitRef>) -> usize {
        let idx = self.ops.len();
        self.ops.push(EngineOp::Commit(CommitOp {
            stream,
            tree,
            parents,
            message: self.message(),
            sig: self.ctx.signature(&self.ev.transaction),
        }));
        self.new_tips.insert(stream, idx);
        idx
    }

    /// Resolve a stream name against the snapshot at this transaction.
    fn stream_by_name(&self, name: &str) -> Option<StreamId> {
        self.ev
            .snapshot
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.id)
    }

    // ── dispatch arms ──────────────────────────────────────────

    fn plan_mkstream(&mut self) -> Result<()> {
        let tx = &self.ev.transaction;
        let stream = tx
            .stream
            .as_deref()
            .and_then(|name| self.stream_by_name(name))
            .filter(|id| self.ctx.tracked.contains(*id))
            .or_else(|| {
                // Old history may not name the stream; the affected
                // tracked stream without a branch yet is the one being
                // created.
                self.affected
                    .keys()
                    .copied()
                    .find(|id| self.ctx.tracked.contains(*id) && self.tip(*id).is_none())
            });
        let Some(stream) = stream else {
            return Ok(());
        };
        if self.tip(stream).is_some() {
            // Seen on depots with duplicated mkstream records; the branch
            // already exists, so there is nothing to create.
            tracing::warn!(
                stream,
                tx = self.ev.tx,
                "mkstream for a stream that already has a branch; ignoring"
            );
            return Ok(());
        }
        let Some(tree) = self.data_tree(stream) else {
            return Ok(());
        };
        let mut parents = Vec::new();
        if self.ctx.policy.mkstream_basis_parent {
            if let Some(basis) = self.ctx.snapshots.basis_at(stream, self.ev.tx) {
                if self.ctx.tracked.contains(basis) {
                    if let Some(tip) = self.tip(basis) {
                        parents.push(tip);
                    }
                }
            }
        }
        let idx = self.push_commit(stream, tree, parents);
        self.propagate(stream, idx)
    }

    fn plan_chstream(&mut self) -> Result<()> {
        let tx = &self.ev.transaction;
        let Some(name) = tx.stream.as_deref() else {
            return Ok(());
        };
        let Some(stream) = self.stream_by_name(name) else {
            return Ok(());
        };
        if !self.ctx.tracked.contains(stream) {
            return Ok(());
        }

        let old_basis = self.ctx.snapshots.basis_at(stream, self.ev.tx.saturating_sub(1));
        let new_basis = self
            .ev
            .snapshot
            .iter()
            .find(|r| r.id == stream)
            .and_then(|r| r.basis);

        if old_basis == new_basis {
            // Rename or timelock change only: no branch movement, audit
            // history still records the transaction.
            self.ops.push(EngineOp::Touch { stream });
            return Ok(());
        }

        let Some(tip) = self.tip(stream) else {
            return Ok(());
        };
        let tree = match self.data_tree(stream) {
            Some(t) => t,
            None => self.tree_of_ref(&tip)?,
        };
        let basis_tip = new_basis
            .filter(|b| self.ctx.tracked.contains(*b))
            .and_then(|b| self.tip(b));
        let idx = match basis_tip {
            Some(basis_tip) => self.push_commit(stream, tree, vec![tip, basis_tip]),
            None => {
                // Re-anchored onto an untracked stream: no merge target,
                // but the contents may still have shifted.
                if self.tree_of_ref(&tip)? == tree {
                    self.ops.push(EngineOp::Touch { stream });
                    return Ok(());
                }
                self.push_commit(stream, tree, vec![tip])
            }
        };
        self.propagate(stream, idx)
    }

    fn plan_promote(&mut self) -> Result<()> {
        let tx = &self.ev.transaction;
        let Some(dst) = tx
            .to_stream
            .as_deref()
            .and_then(|name| self.stream_by_name(name))
        else {
            return Ok(());
        };
        if !self.ctx.tracked.contains(dst) {
            return Ok(());
        }
        let Some(tree) = self.data_tree(dst) else {
            return Ok(());
        };

        let src = tx
            .from_stream
            .as_deref()
            .and_then(|name| self.stream_by_name(name))
            .filter(|s| self.ctx.tracked.contains(*s));

        let dst_tip = self.tip(dst);
        let src_tip = src.and_then(|s| self.tip(s));

        let idx = match (dst_tip, src_tip) {
            (Some(tip), Some(src_tip)) => {
                let idx = self.push_commit(dst, tree, vec![tip, src_tip]);
                if self.ctx.policy.source_stream_fast_forward {
                    if let Some(src) = src {
                        self.ops.push(EngineOp::FastForward { stream: src, to: idx });
                        self.new_tips.insert(src, idx);
                    }
                }
                idx
            }
            // Source untracked or unknown: single-parent cherry-pick.
            (Some(tip), None) => self.push_commit(dst, tree, vec![tip]),
            // First commit on the destination.
            (None, Some(src_tip)) => self.push_commit(dst, tree, vec![src_tip]),
            (None, None) => self.push_commit(dst, tree, vec![]),
        };
        self.propagate(dst, idx)
    }

    /// keep/defunct/purge/move and anything else without a destination:
    /// committed on the stream it occurred in, or, for a workspace, on
    /// the workspace's owning tracked stream.
    fn plan_origin(&mut self) -> Result<()> {
        let tx = &self.ev.transaction;
        let Some(name) = tx.stream.as_deref() else {
            return Ok(());
        };
        let Some(record) = self.ev.snapshot.iter().find(|r| r.name == name) else {
            return Ok(());
        };
        let target = if record.kind == StreamKind::Workspace {
            record.basis.filter(|b| self.ctx.tracked.contains(*b))
        } else if self.ctx.tracked.contains(record.id) {
            Some(record.id)
        } else {
            None
        };
        let Some(stream) = target else {
            return Ok(());
        };
        let Some(tree) = self.data_tree(stream) else {
            return Ok(());
        };
        let idx = match self.tip(stream) {
            Some(tip) => self.push_commit(stream, tree, vec![tip]),
            None => self.push_commit(stream, tree, vec![]),
        };
        self.propagate(stream, idx)
    }

    /// After a destination commit, flow the transaction down to every
    /// tracked child whose basis (at this transaction) is the
    /// destination. Depth-first, children in ascending stream id order.
    fn propagate(&mut self, parent: StreamId, parent_idx: usize) -> Result<()> {
        let children = self.ctx.snapshots.children_at(parent, self.ev.tx);
        for child in children {
            if !self.ctx.tracked.contains(child) || self.new_tips.contains_key(&child) {
                continue;
            }
            let Some(child_tree) = self.data_tree(child) else {
                continue;
            };
            let parent_tree = self.op_tree(parent_idx);
            let parent_ref = CommitRef::New(parent_idx);

            let idx = if child_tree == parent_tree {
                match self.tip(child) {
                    Some(CommitRef::Existing(tip)) => {
                        if self.reaches(&parent_ref, &tip)? {
                            // The change flowed through this child (its
                            // tip is already in the new commit's
                            // history): nothing to emit.
                            continue;
                        }
                        let tip = CommitRef::Existing(tip);
                        match self.ctx.policy.empty_child_action {
                            EmptyChildAction::Merge => {
                                self.push_commit(child, parent_tree, vec![tip, parent_ref])
                            }
                            EmptyChildAction::CherryPick => {
                                self.push_commit(child, parent_tree, vec![tip])
                            }
                        }
                    }
                    Some(new_tip @ CommitRef::New(_)) => {
                        // Committed earlier in this plan; already
                        // excluded above, kept for completeness.
                        let _ = new_tip;
                        continue;
                    }
                    None => self.push_commit(child, parent_tree, vec![parent_ref]),
                }
            } else {
                match self.tip(child) {
                    Some(tip) => self.push_commit(child, child_tree, vec![tip]),
                    None => self.push_commit(child, child_tree, vec![]),
                }
            };
            self.propagate(child, idx)?;
        }
        Ok(())
    }
}

/// Branch movements resulting from applying a plan.
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    /// Streams whose branch moved, with the new tip, in apply order.
    pub updated: Vec<(StreamId, Oid)>,
    /// Streams whose audit chain must record the unchanged tip.
    pub touched: Vec<StreamId>,
    pub commits: u64,
}

/// Execute a plan: create the commit objects and advance branch refs.
pub fn apply_ops(
    store: &GitStore,
    tracked: &TrackedStreams,
    ops: &[EngineOp],
) -> Result<ApplyOutcome> {
    let mut created: Vec<Option<Oid>> = vec![None; ops.len()];
    let mut outcome = ApplyOutcome::default();

    let resolve = |r: &CommitRef, created: &[Option<Oid>]| -> Result<Oid> {
        match r {
            CommitRef::Existing(oid) => Ok(oid.clone()),
            CommitRef::New(idx) => created
                .get(*idx)
                .and_then(|c| c.clone())
                .ok_or_else(|| Error::Invariant("plan references an unapplied commit".into())),
        }
    };

    for (i, op) in ops.iter().enumerate() {
        match op {
            EngineOp::Commit(c) => {
                let stream = tracked.get(c.stream).ok_or_else(|| {
                    Error::Invariant(format!("plan touches untracked stream {}", c.stream))
                })?;
                let mut parents = Vec::with_capacity(c.parents.len());
                for parent in &c.parents {
                    parents.push(resolve(parent, &created)?);
                }
                let commit = store.commit_tree(&c.tree, &parents, &c.message, &c.sig)?;
                store.update_ref(&RefLayout::branch(&stream.branch), &commit)?;
                created[i] = Some(commit.clone());
                outcome.updated.push((c.stream, commit));
                outcome.commits += 1;
            }
            EngineOp::FastForward { stream, to } => {
                let tracked_stream = tracked.get(*stream).ok_or_else(|| {
                    Error::Invariant(format!("plan touches untracked stream {}", stream))
                })?;
                let commit = resolve(&CommitRef::New(*to), &created)?;
                store.update_ref(&RefLayout::branch(&tracked_stream.branch), &commit)?;
                outcome.updated.push((*stream, commit));
            }
            EngineOp::Touch { stream } => outcome.touched.push(*stream),
        }
    }
    Ok(outcome)
}

/// Statistics from one processing run.
#[derive(Debug, Clone, Default)]
pub struct ProcessStats {
    pub transactions: u64,
    pub commits: u64,
    pub last_tx: Option<TxId>,
}

/// The single-threaded processor: owns the visible branches, the state
/// ref and the audit chains.
pub struct Engine<'a> {
    store: &'a GitStore,
    layout: &'a RefLayout,
    tracked: &'a TrackedStreams,
    policy: EnginePolicy,
    users: &'a BTreeMap<String, UserIdent>,
    stop: StopFlag,
    tips: BTreeMap<StreamId, Oid>,
    snapshots: SnapshotLog,
    names: StreamNameCache,
    resume_after: Option<TxId>,
}

impl<'a> Engine<'a> {
    /// Startup: restore branch refs from `state/last` (which wins over
    /// whatever the refs currently say) and load the name cache.
    pub fn new(
        store: &'a GitStore,
        layout: &'a RefLayout,
        tracked: &'a TrackedStreams,
        policy: EnginePolicy,
        users: &'a BTreeMap<String, UserIdent>,
        stop: StopFlag,
    ) -> Result<Engine<'a>> {
        let state = StateStore::new(store, layout);
        let last = state.restore(tracked)?;
        let (tips, resume_after) = match last {
            Some(last) => {
                for id in last.heads.keys() {
                    if !tracked.contains(*id) {
                        return Err(Error::Config(format!(
                            "stream {} is recorded in state but not configured; \
                             the tracked stream set is frozen per repository",
                            id
                        )));
                    }
                }
                (last.heads.clone(), Some(last.tx))
            }
            None => (BTreeMap::new(), None),
        };
        let names = StreamNameCache::load(store, layout)?;
        Ok(Engine {
            store,
            layout,
            tracked,
            policy,
            users,
            stop,
            tips,
            snapshots: SnapshotLog::new(),
            names,
            resume_after,
        })
    }

    /// Transaction processing resumes after.
    pub fn resume_after(&self) -> Option<TxId> {
        self.resume_after
    }

    /// Feed earlier snapshots so "basis at T" queries reach before the
    /// first pending transaction (used on resume).
    pub fn preload_snapshot(&mut self, tx: TxId, snapshot: Vec<crate::model::StreamRecord>) {
        self.snapshots.insert(tx, snapshot);
    }

    /// Consume planner events until the channel closes.
    pub fn process(&mut self, events: Receiver<Result<PlannerEvent>>) -> Result<ProcessStats> {
        let mut stats = ProcessStats::default();
        for event in events.iter() {
            self.stop.check()?;
            let event = event?;
            let outcome = self.handle(&event)?;
            stats.transactions += outcome.transactions;
            stats.commits += outcome.commits;
            if outcome.last_tx.is_some() {
                stats.last_tx = outcome.last_tx;
            }
        }
        Ok(stats)
    }

    /// Process one transaction end to end: plan, apply, audit, state.
    pub fn handle(&mut self, ev: &PlannerEvent) -> Result<ProcessStats> {
        if let Some(done) = self.resume_after {
            if ev.tx <= done {
                return Ok(ProcessStats::default());
            }
        }
        self.snapshots.insert(ev.tx, ev.snapshot.clone());
        self.names.observe(&ev.snapshot);

        let ctx = PlanContext {
            tracked: self.tracked,
            snapshots: &self.snapshots,
            tips: &self.tips,
            policy: &self.policy,
            users: self.users,
        };
        let ops = plan_transaction(ev, &ctx, self.store)?;
        let outcome = apply_ops(self.store, self.tracked, &ops)?;

        let time = ev.transaction.time;
        let state = StateStore::new(self.store, self.layout);
        for (stream, commit) in &outcome.updated {
            self.tips.insert(*stream, commit.clone());
            tracing::info!(
                tx = ev.tx,
                stream = *stream,
                kind = ev.transaction.kind.as_str(),
                commit = %commit,
                "branch advanced"
            );
        }
        for (stream, commit) in &outcome.updated {
            state.append_audit(*stream, ev.tx, time, commit)?;
        }
        for stream in &outcome.touched {
            if let Some(tip) = self.tips.get(stream).cloned() {
                state.append_audit(*stream, ev.tx, time, &tip)?;
            }
        }
        state.write_last(ev.tx, time, &self.tips)?;
        self.names.save(self.store, self.layout, ev.tx, time)?;
        self.resume_after = Some(ev.tx);

        Ok(ProcessStats {
            transactions: 1,
            commits: outcome.commits,
            last_tx: Some(ev.tx),
        })
    }

    /// Current branch tips (stream id -> commit).
    pub fn tips(&self) -> &BTreeMap<StreamId, Oid> {
        &self.tips
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{StreamRecord, TrackedStream, TxKind};
    use std::collections::{HashMap, HashSet};

    /// In-memory store view: commit -> tree plus an explicit ancestry
    /// relation.
    #[derive(Default)]
    struct FakeView {
        trees: HashMap<String, String>,
        ancestry: HashSet<(String, String)>,
    }

    impl FakeView {
        fn commit(&mut self, name: &str, tree: &str) {
            self.trees.insert(name.to_string(), tree.to_string());
        }

        fn ancestor(&mut self, ancestor: &str, descendant: &str) {
            self.ancestry
                .insert((ancestor.to_string(), descendant.to_string()));
        }
    }

    impl StoreView for FakeView {
        fn is_ancestor(&self, ancestor: &Oid, descendant: &Oid) -> Result<bool> {
            Ok(self
                .ancestry
                .contains(&(ancestor.as_str().to_string(), descendant.as_str().to_string())))
        }

        fn tree_of(&self, commitish: &str) -> Result<Oid> {
            self.trees
                .get(commitish)
                .cloned()
                .map(Oid::new)
                .ok_or_else(|| Error::target("tree_of", format!("unknown commit {}", commitish)))
        }
    }

    fn rec(id: StreamId, name: &str, basis: Option<StreamId>) -> StreamRecord {
        StreamRecord {
            id,
            name: name.to_string(),
            kind: crate::model::StreamKind::Normal,
            basis,
            timelock: None,
        }
    }

    fn ws(id: StreamId, name: &str, basis: StreamId) -> StreamRecord {
        StreamRecord {
            id,
            name: name.to_string(),
            kind: StreamKind::Workspace,
            basis: Some(basis),
            timelock: None,
        }
    }

    fn aff(stream: StreamId, tree: &str) -> AffectedStream {
        AffectedStream {
            stream,
            info_commit: Oid::new(format!("info-{}", stream)),
            data_commit: Oid::new(format!("data-{}", stream)),
            data_tree: Oid::new(tree),
        }
    }

    fn tx(id: TxId, kind: TxKind) -> Transaction {
        Transaction {
            id,
            kind,
            user: "joe".to_string(),
            time: 1000 + id as i64,
            comment: format!("change {}", id),
            stream: None,
            from_stream: None,
            to_stream: None,
            elements: vec!["f".to_string()],
        }
    }

    fn tracked_pair() -> TrackedStreams {
        TrackedStreams::new(vec![
            TrackedStream {
                id: 2,
                name: "Dev".into(),
                branch: "dev".into(),
            },
            TrackedStream {
                id: 3,
                name: "Test".into(),
                branch: "test".into(),
            },
        ])
    }

    fn policy(ff: bool, empty: EmptyChildAction) -> EnginePolicy {
        EnginePolicy {
            source_stream_fast_forward: ff,
            empty_child_action: empty,
            mkstream_basis_parent: false,
        }
    }

    struct Fixture {
        tracked: TrackedStreams,
        snapshots: SnapshotLog,
        tips: BTreeMap<StreamId, Oid>,
        policy: EnginePolicy,
        users: BTreeMap<String, UserIdent>,
    }

    impl Fixture {
        fn ctx(&self) -> PlanContext<'_> {
            PlanContext {
                tracked: &self.tracked,
                snapshots: &self.snapshots,
                tips: &self.tips,
                policy: &self.policy,
                users: &self.users,
            }
        }
    }

    fn commit_of(op: &EngineOp) -> &CommitOp {
        match op {
            EngineOp::Commit(c) => c,
            other => panic!("expected commit, got {:?}", other),
        }
    }

    #[test]
    fn test_promote_with_tracked_source_is_merge() {
        // Streams: Dev (2), Test (3, basis Dev). Promote Dev -> Test.
        let snapshot = vec![rec(2, "Dev", None), rec(3, "Test", Some(2))];
        let mut snapshots = SnapshotLog::new();
        snapshots.insert(10, snapshot.clone());
        let mut tips = BTreeMap::new();
        tips.insert(2u64, Oid::new("dev-tip"));
        tips.insert(3u64, Oid::new("test-tip"));
        let fixture = Fixture {
            tracked: tracked_pair(),
            snapshots,
            tips,
            policy: policy(false, EmptyChildAction::Merge),
            users: BTreeMap::new(),
        };
        let mut view = FakeView::default();
        view.commit("dev-tip", "tree-dev");
        view.commit("test-tip", "tree-old");

        let mut transaction = tx(10, TxKind::Promote);
        transaction.from_stream = Some("Dev".into());
        transaction.to_stream = Some("Test".into());
        let ev = PlannerEvent {
            tx: 10,
            transaction,
            snapshot,
            affected: vec![aff(3, "tree-new")],
        };

        let ops = plan_transaction(&ev, &fixture.ctx(), &view).unwrap();
        assert_eq!(ops.len(), 1);
        let c = commit_of(&ops[0]);
        assert_eq!(c.stream, 3);
        assert_eq!(
            c.parents,
            vec![
                CommitRef::Existing(Oid::new("test-tip")),
                CommitRef::Existing(Oid::new("dev-tip"))
            ]
        );
        assert_eq!(c.tree, Oid::new("tree-new"));
        assert_eq!(c.message, "change 10");
    }

    #[test]
    fn test_promote_fast_forward_moves_source() {
        let snapshot = vec![rec(2, "Dev", None), rec(3, "Test", Some(2))];
        let mut snapshots = SnapshotLog::new();
        snapshots.insert(10, snapshot.clone());
        let mut tips = BTreeMap::new();
        tips.insert(2u64, Oid::new("dev-tip"));
        tips.insert(3u64, Oid::new("test-tip"));
        let fixture = Fixture {
            tracked: tracked_pair(),
            snapshots,
            tips,
            policy: policy(true, EmptyChildAction::Merge),
            users: BTreeMap::new(),
        };
        let view = FakeView::default();

        let mut transaction = tx(10, TxKind::Promote);
        transaction.from_stream = Some("Dev".into());
        transaction.to_stream = Some("Test".into());
        let ev = PlannerEvent {
            tx: 10,
            transaction,
            snapshot,
            affected: vec![aff(3, "tree-new")],
        };

        let ops = plan_transaction(&ev, &fixture.ctx(), &view).unwrap();
        assert_eq!(ops.len(), 2);
        assert!(matches!(
            ops[1],
            EngineOp::FastForward { stream: 2, to: 0 }
        ));
    }

    #[test]
    fn test_promote_with_unknown_source_is_cherry_pick() {
        // Old depot history: fromStream absent entirely.
        let snapshot = vec![rec(3, "Release", None)];
        let mut snapshots = SnapshotLog::new();
        snapshots.insert(77, snapshot.clone());
        let mut tips = BTreeMap::new();
        tips.insert(3u64, Oid::new("rel-tip"));
        let fixture = Fixture {
            tracked: TrackedStreams::new(vec![TrackedStream {
                id: 3,
                name: "Release".into(),
                branch: "release".into(),
            }]),
            snapshots,
            tips,
            policy: policy(false, EmptyChildAction::Merge),
            users: BTreeMap::new(),
        };
        let view = FakeView::default();

        let mut transaction = tx(77, TxKind::Promote);
        transaction.to_stream = Some("Release".into());
        let ev = PlannerEvent {
            tx: 77,
            transaction,
            snapshot,
            affected: vec![aff(3, "tree-new")],
        };

        let ops = plan_transaction(&ev, &fixture.ctx(), &view).unwrap();
        assert_eq!(ops.len(), 1);
        let c = commit_of(&ops[0]);
        assert_eq!(c.parents, vec![CommitRef::Existing(Oid::new("rel-tip"))]);
    }

    #[test]
    fn test_empty_child_policy_merge_and_cherry_pick() {
        // P (2) with child C (3). Promote into P; C's data tree equals
        // P's new tree and C's tip is NOT an ancestor of the new commit.
        let snapshot = vec![rec(2, "P", None), rec(3, "C", Some(2))];
        for empty in [EmptyChildAction::Merge, EmptyChildAction::CherryPick] {
            let mut snapshots = SnapshotLog::new();
            snapshots.insert(20, snapshot.clone());
            let mut tips = BTreeMap::new();
            tips.insert(2u64, Oid::new("p-tip"));
            tips.insert(3u64, Oid::new("c-tip"));
            let fixture = Fixture {
                tracked: TrackedStreams::new(vec![
                    TrackedStream {
                        id: 2,
                        name: "P".into(),
                        branch: "p".into(),
                    },
                    TrackedStream {
                        id: 3,
                        name: "C".into(),
                        branch: "c".into(),
                    },
                ]),
                snapshots,
                tips,
                policy: policy(false, empty),
                users: BTreeMap::new(),
            };
            let view = FakeView::default();

            let mut transaction = tx(20, TxKind::Promote);
            transaction.to_stream = Some("P".into());
            let ev = PlannerEvent {
                tx: 20,
                transaction,
                snapshot: snapshot.clone(),
                affected: vec![aff(2, "tree-new"), aff(3, "tree-new")],
            };

            let ops = plan_transaction(&ev, &fixture.ctx(), &view).unwrap();
            assert_eq!(ops.len(), 2);
            let child = commit_of(&ops[1]);
            assert_eq!(child.stream, 3);
            assert_eq!(child.tree, Oid::new("tree-new"));
            match empty {
                EmptyChildAction::Merge => assert_eq!(
                    child.parents,
                    vec![CommitRef::Existing(Oid::new("c-tip")), CommitRef::New(0)]
                ),
                EmptyChildAction::CherryPick => {
                    assert_eq!(child.parents, vec![CommitRef::Existing(Oid::new("c-tip"))])
                }
            }
        }
    }

    #[test]
    fn test_child_change_already_flowed_through_is_noop() {
        // Promote FROM the child INTO the parent: the merge's second
        // parent is the child's tip, so nothing flows back down.
        let snapshot = vec![rec(2, "P", None), rec(3, "C", Some(2))];
        let mut snapshots = SnapshotLog::new();
        snapshots.insert(21, snapshot.clone());
        let mut tips = BTreeMap::new();
        tips.insert(2u64, Oid::new("p-tip"));
        tips.insert(3u64, Oid::new("c-tip"));
        let fixture = Fixture {
            tracked: TrackedStreams::new(vec![
                TrackedStream {
                    id: 2,
                    name: "P".into(),
                    branch: "p".into(),
                },
                TrackedStream {
                    id: 3,
                    name: "C".into(),
                    branch: "c".into(),
                },
            ]),
            snapshots,
            tips,
            policy: policy(false, EmptyChildAction::Merge),
            users: BTreeMap::new(),
        };
        let view = FakeView::default();

        let mut transaction = tx(21, TxKind::Promote);
        transaction.from_stream = Some("C".into());
        transaction.to_stream = Some("P".into());
        let ev = PlannerEvent {
            tx: 21,
            transaction,
            snapshot,
            affected: vec![aff(2, "tree-new"), aff(3, "tree-new")],
        };

        let ops = plan_transaction(&ev, &fixture.ctx(), &view).unwrap();
        // Only the destination merge; the child is skipped.
        assert_eq!(ops.len(), 1);
        assert_eq!(commit_of(&ops[0]).stream, 2);
    }

    #[test]
    fn test_diverged_child_gets_cherry_pick_of_its_own_tree() {
        let snapshot = vec![rec(2, "P", None), rec(3, "C", Some(2))];
        let mut snapshots = SnapshotLog::new();
        snapshots.insert(22, snapshot.clone());
        let mut tips = BTreeMap::new();
        tips.insert(2u64, Oid::new("p-tip"));
        tips.insert(3u64, Oid::new("c-tip"));
        let fixture = Fixture {
            tracked: TrackedStreams::new(vec![
                TrackedStream {
                    id: 2,
                    name: "P".into(),
                    branch: "p".into(),
                },
                TrackedStream {
                    id: 3,
                    name: "C".into(),
                    branch: "c".into(),
                },
            ]),
            snapshots,
            tips,
            policy: policy(false, EmptyChildAction::Merge),
            users: BTreeMap::new(),
        };
        let view = FakeView::default();

        let mut transaction = tx(22, TxKind::Promote);
        transaction.to_stream = Some("P".into());
        let ev = PlannerEvent {
            tx: 22,
            transaction,
            snapshot,
            affected: vec![aff(2, "tree-p"), aff(3, "tree-c-divergent")],
        };

        let ops = plan_transaction(&ev, &fixture.ctx(), &view).unwrap();
        assert_eq!(ops.len(), 2);
        let child = commit_of(&ops[1]);
        assert_eq!(child.tree, Oid::new("tree-c-divergent"));
        assert_eq!(child.parents, vec![CommitRef::Existing(Oid::new("c-tip"))]);
    }

    #[test]
    fn test_chstream_basis_change_is_merge() {
        // Feature (3) moves basis Dev (2) -> Main (1) at tx 99.
        let before = vec![rec(1, "Main", None), rec(2, "Dev", Some(1)), rec(3, "Feature", Some(2))];
        let after = vec![rec(1, "Main", None), rec(2, "Dev", Some(1)), rec(3, "Feature", Some(1))];
        let mut snapshots = SnapshotLog::new();
        snapshots.insert(50, before);
        snapshots.insert(99, after.clone());
        let mut tips = BTreeMap::new();
        tips.insert(1u64, Oid::new("main-tip"));
        tips.insert(2u64, Oid::new("dev-tip"));
        tips.insert(3u64, Oid::new("feat-tip"));
        let fixture = Fixture {
            tracked: TrackedStreams::new(vec![
                TrackedStream {
                    id: 1,
                    name: "Main".into(),
                    branch: "main".into(),
                },
                TrackedStream {
                    id: 2,
                    name: "Dev".into(),
                    branch: "dev".into(),
                },
                TrackedStream {
                    id: 3,
                    name: "Feature".into(),
                    branch: "feature".into(),
                },
            ]),
            snapshots,
            tips,
            policy: policy(false, EmptyChildAction::Merge),
            users: BTreeMap::new(),
        };
        let view = FakeView::default();

        let mut transaction = tx(99, TxKind::ChStream);
        transaction.stream = Some("Feature".into());
        let ev = PlannerEvent {
            tx: 99,
            transaction,
            snapshot: after,
            affected: vec![aff(3, "feat-tree-99")],
        };

        let ops = plan_transaction(&ev, &fixture.ctx(), &view).unwrap();
        assert_eq!(ops.len(), 1);
        let c = commit_of(&ops[0]);
        assert_eq!(c.stream, 3);
        assert_eq!(
            c.parents,
            vec![
                CommitRef::Existing(Oid::new("feat-tip")),
                CommitRef::Existing(Oid::new("main-tip"))
            ]
        );
        assert_eq!(c.tree, Oid::new("feat-tree-99"));
    }

    #[test]
    fn test_chstream_rename_only_touches_audit() {
        let before = vec![rec(1, "Main", None), rec(3, "Feature", Some(1))];
        let after = vec![rec(1, "Main", None), rec(3, "FeatureX", Some(1))];
        let mut snapshots = SnapshotLog::new();
        snapshots.insert(50, before);
        snapshots.insert(60, after.clone());
        let mut tips = BTreeMap::new();
        tips.insert(3u64, Oid::new("feat-tip"));
        let fixture = Fixture {
            tracked: TrackedStreams::new(vec![TrackedStream {
                id: 3,
                name: "Feature".into(),
                branch: "feature".into(),
            }]),
            snapshots,
            tips,
            policy: policy(false, EmptyChildAction::Merge),
            users: BTreeMap::new(),
        };
        let view = FakeView::default();

        let mut transaction = tx(60, TxKind::ChStream);
        transaction.stream = Some("FeatureX".into());
        let ev = PlannerEvent {
            tx: 60,
            transaction,
            snapshot: after,
            affected: vec![aff(3, "feat-tree")],
        };

        let ops = plan_transaction(&ev, &fixture.ctx(), &view).unwrap();
        assert_eq!(ops.len(), 1);
        assert!(matches!(ops[0], EngineOp::Touch { stream: 3 }));
    }

    #[test]
    fn test_mkstream_creates_orphan_root() {
        let snapshot = vec![rec(1, "Main", None)];
        let mut snapshots = SnapshotLog::new();
        snapshots.insert(1, snapshot.clone());
        let fixture = Fixture {
            tracked: TrackedStreams::new(vec![TrackedStream {
                id: 1,
                name: "Main".into(),
                branch: "Main".into(),
            }]),
            snapshots,
            tips: BTreeMap::new(),
            policy: policy(false, EmptyChildAction::Merge),
            users: BTreeMap::new(),
        };
        let view = FakeView::default();

        let mut transaction = tx(1, TxKind::MkStream);
        transaction.stream = Some("Main".into());
        let ev = PlannerEvent {
            tx: 1,
            transaction,
            snapshot,
            affected: vec![aff(1, "tree-root")],
        };

        let ops = plan_transaction(&ev, &fixture.ctx(), &view).unwrap();
        assert_eq!(ops.len(), 1);
        let c = commit_of(&ops[0]);
        assert!(c.parents.is_empty());
        assert_eq!(c.tree, Oid::new("tree-root"));
    }

    #[test]
    fn test_workspace_origin_lands_on_owning_stream() {
        let snapshot = vec![rec(2, "Dev", None), ws(9, "joe_ws", 2)];
        let mut snapshots = SnapshotLog::new();
        snapshots.insert(30, snapshot.clone());
        let mut tips = BTreeMap::new();
        tips.insert(2u64, Oid::new("dev-tip"));
        let fixture = Fixture {
            tracked: TrackedStreams::new(vec![TrackedStream {
                id: 2,
                name: "Dev".into(),
                branch: "dev".into(),
            }]),
            snapshots,
            tips,
            policy: policy(false, EmptyChildAction::Merge),
            users: BTreeMap::new(),
        };
        let view = FakeView::default();

        let mut transaction = tx(30, TxKind::Keep);
        transaction.stream = Some("joe_ws".into());
        let ev = PlannerEvent {
            tx: 30,
            transaction,
            snapshot,
            affected: vec![aff(2, "dev-tree")],
        };

        let ops = plan_transaction(&ev, &fixture.ctx(), &view).unwrap();
        assert_eq!(ops.len(), 1);
        let c = commit_of(&ops[0]);
        assert_eq!(c.stream, 2);
        assert_eq!(c.parents, vec![CommitRef::Existing(Oid::new("dev-tip"))]);
    }

    #[test]
    fn test_untracked_workspace_owner_is_ignored() {
        let snapshot = vec![rec(2, "Dev", None), ws(9, "joe_ws", 2)];
        let mut snapshots = SnapshotLog::new();
        snapshots.insert(30, snapshot.clone());
        let fixture = Fixture {
            tracked: TrackedStreams::new(vec![TrackedStream {
                id: 5,
                name: "Other".into(),
                branch: "other".into(),
            }]),
            snapshots,
            tips: BTreeMap::new(),
            policy: policy(false, EmptyChildAction::Merge),
            users: BTreeMap::new(),
        };
        let view = FakeView::default();

        let mut transaction = tx(30, TxKind::Keep);
        transaction.stream = Some("joe_ws".into());
        let ev = PlannerEvent {
            tx: 30,
            transaction,
            snapshot,
            affected: vec![],
        };

        let ops = plan_transaction(&ev, &fixture.ctx(), &view).unwrap();
        assert!(ops.is_empty());
    }

    #[test]
    fn test_sentinel_transaction_plans_nothing() {
        let fixture = Fixture {
            tracked: tracked_pair(),
            snapshots: SnapshotLog::new(),
            tips: BTreeMap::new(),
            policy: policy(false, EmptyChildAction::Merge),
            users: BTreeMap::new(),
        };
        let view = FakeView::default();
        let ev = PlannerEvent {
            tx: 40,
            transaction: Transaction::sentinel(40),
            snapshot: vec![],
            affected: vec![aff(2, "t")],
        };
        let ops = plan_transaction(&ev, &fixture.ctx(), &view).unwrap();
        assert!(ops.is_empty());
    }

    #[test]
    fn test_user_map_resolves_signature() {
        let mut users = BTreeMap::new();
        users.insert(
            "joe".to_string(),
            UserIdent {
                name: "Joe Bloggs".to_string(),
                email: "joe@x.example".to_string(),
                timezone: Some("+0100".to_string()),
            },
        );
        let fixture = Fixture {
            tracked: tracked_pair(),
            snapshots: SnapshotLog::new(),
            tips: BTreeMap::new(),
            policy: policy(false, EmptyChildAction::Merge),
            users,
        };
        let ctx = fixture.ctx();
        let sig = ctx.signature(&tx(1, TxKind::Promote));
        assert_eq!(sig.name, "Joe Bloggs");
        assert_eq!(sig.tz, "+0100");
        assert_eq!(sig.time, 1001);

        let unmapped = ctx.signature(&Transaction {
            user: "ghost".to_string(),
            ..tx(1, TxKind::Promote)
        });
        assert_eq!(unmapped.name, "ghost");
        assert_eq!(unmapped.email, "ghost@localhost");
    }
}
