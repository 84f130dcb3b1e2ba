//! Per-stream retrieval pipeline.
//!
//! For each stream three refs advance monotonically: `info` (metadata
//! history), `data` (contents history) and `hwm` (high-water mark). The
//! two histories are strictly 1:1, commit-for-commit, with the message
//! `transaction <T>` tying the N-th commit of each to the same
//! transaction.
//!
//! A stream is advanced in two passes: first `info` across every
//! candidate transaction, then `data` re-walking the same candidates,
//! which avoids checking out two very different tree shapes per
//! transaction. A crash between the passes leaves `info` ahead; startup
//! rewinds it to the `data` tip (the only sanctioned rewind) and the
//! deterministic commit recipe reproduces identical hashes on the
//! re-walk.

use std::fs;
use std::path::Path;

use crate::accurev::SourceClient;
use crate::config::Method;
use crate::convert::StopFlag;
use crate::error::{Error, Result};
use crate::gitstore::{GitStore, Oid, Signature, StoreView};
use crate::model::{parse_tx_message, tx_message, StreamId, TxId};
use crate::refs::RefLayout;
use crate::xml;

/// One stream to retrieve.
#[derive(Debug, Clone)]
pub struct StreamJob {
    pub id: StreamId,
    pub name: String,
}

/// Result of retrieving one stream.
#[derive(Debug, Clone, Default)]
pub struct StreamRetrieveStats {
    pub stream: StreamId,
    /// Transactions newly committed to the hidden refs.
    pub transactions: u64,
    /// Transactions that required a populate (vs. empty-diff commits).
    pub populated: u64,
    pub last_tx: Option<TxId>,
}

/// Outcome of the info pass for one candidate, consumed by the data
/// pass.
#[derive(Debug)]
struct InfoStep {
    tx: TxId,
    time: i64,
    /// Changed paths from the diff; `None` on the stream's initial
    /// (mkstream) populate, which has no diff.
    diff_paths: Option<Vec<String>>,
}

/// Read a stream's high-water mark.
pub fn read_hwm(store: &GitStore, layout: &RefLayout, stream: StreamId) -> Result<Option<TxId>> {
    let refname = layout.hwm(stream);
    let commit = match store.read_ref(&refname)? {
        Some(c) => c,
        None => return Ok(None),
    };
    let data = store
        .show(commit.as_str(), "hwm")?
        .ok_or_else(|| Error::Invariant(format!("{} has no hwm file", refname)))?;
    String::from_utf8_lossy(&data)
        .trim()
        .parse()
        .map(Some)
        .map_err(|_| Error::Invariant(format!("{} holds a non-numeric hwm", refname)))
}

pub struct Retriever<'a> {
    pub source: &'a dyn SourceClient,
    pub store: &'a GitStore,
    pub layout: &'a RefLayout,
    pub depot: &'a str,
    pub method: Method,
    /// Configured lower bound; a stream never starts before its
    /// mkstream transaction.
    pub start_tx: TxId,
    pub end_tx: TxId,
    pub stop: StopFlag,
}

/// Align a stream's `info` ref with its `data` ref after a crash.
/// `info` running ahead is the expected two-pass interruption shape;
/// `data` ahead of `info` means something else rewrote the refs. This is
/// the only sanctioned rewind of a hidden ref.
pub fn repair_stream(store: &GitStore, layout: &RefLayout, stream: StreamId) -> Result<()> {
    let info_ref = layout.info(stream);
    let data_ref = layout.data(stream);
    let info_count = store.rev_list_count(&info_ref)?;
    let data_count = store.rev_list_count(&data_ref)?;

    if data_count > info_count {
        return Err(Error::invariant_at(
            stream,
            0,
            format!(
                "data ref has {} commits but info ref only {}",
                data_count, info_count
            ),
        ));
    }
    if info_count > data_count {
        tracing::warn!(
            stream,
            info = info_count,
            data = data_count,
            "info ref ahead of data ref; rewinding info"
        );
        if data_count == 0 {
            store.delete_ref(&info_ref)?;
        } else {
            let target = store.nth_ancestor(&info_ref, info_count - data_count)?;
            store.update_ref(&info_ref, &target)?;
        }
    }

    if data_count > 0 {
        let (info_subject, _) = store.commit_info(&info_ref)?;
        let (data_subject, _) = store.commit_info(&data_ref)?;
        if info_subject != data_subject {
            return Err(Error::invariant_at(
                stream,
                parse_tx_message(&data_subject).unwrap_or(0),
                format!(
                    "info tip '{}' does not match data tip '{}'",
                    info_subject, data_subject
                ),
            ));
        }
    }
    Ok(())
}

impl<'a> Retriever<'a> {
    /// See [`repair_stream`].
    pub fn repair_stream(&self, job: &StreamJob) -> Result<()> {
        repair_stream(self.store, self.layout, job.id)
    }

    /// Advance one stream's hidden refs up to the end transaction.
    /// `workdir` must be private to this job.
    pub fn retrieve_stream(
        &self,
        job: &StreamJob,
        workdir: &Path,
    ) -> Result<StreamRetrieveStats> {
        let mut stats = StreamRetrieveStats {
            stream: job.id,
            ..Default::default()
        };

        self.repair_stream(job)?;

        let info_ref = self.layout.info(job.id);
        let last_done = match self.store.read_ref(&info_ref)? {
            Some(tip) => {
                let (subject, _) = self.store.commit_info(tip.as_str())?;
                Some(parse_tx_message(&subject).ok_or_else(|| {
                    Error::invariant_at(job.id, 0, format!("unexpected info tip '{}'", subject))
                })?)
            }
            None => None,
        };

        let initial_tx = match last_done {
            Some(_) => None,
            None => {
                let mkstream = self.source.mkstream_tx(self.depot, &job.name)?;
                if mkstream.is_none() {
                    tracing::info!(
                        stream = %job.name,
                        "no mkstream transaction (depot root stream); starting at the window start"
                    );
                }
                let first = mkstream.unwrap_or(1).max(self.start_tx);
                if first > self.end_tx {
                    tracing::info!(
                        stream = %job.name,
                        first,
                        end = self.end_tx,
                        "stream begins after the end transaction; nothing to retrieve"
                    );
                    return Ok(stats);
                }
                Some(first)
            }
        };

        let resume_base = last_done.or(initial_tx).unwrap_or(self.end_tx);
        let candidates: Vec<TxId> = if resume_base >= self.end_tx {
            Vec::new()
        } else {
            match self.method {
                Method::Pop | Method::Diff => (resume_base + 1..=self.end_tx).collect(),
                Method::DeepHist => self
                    .source
                    .deep_hist(self.depot, &job.name, (resume_base + 1, self.end_tx))?
                    .into_iter()
                    .filter(|t| *t > resume_base && *t <= self.end_tx)
                    .collect(),
            }
        };

        if initial_tx.is_none() && candidates.is_empty() {
            if let Some(tx) = last_done {
                let (_, time) = self.store.commit_info(&info_ref)?;
                self.ensure_hwm(job, tx, time)?;
                stats.last_tx = Some(tx);
            }
            return Ok(stats);
        }

        tracing::info!(
            stream = %job.name,
            from = initial_tx.unwrap_or(resume_base + 1),
            to = self.end_tx,
            candidates = candidates.len() + usize::from(initial_tx.is_some()),
            method = ?self.method,
            "retrieving"
        );

        let steps = self.advance_info(job, initial_tx, &candidates, last_done)?;
        self.advance_data(job, workdir, &steps, &mut stats)?;

        if let Some(last) = steps.last() {
            self.ensure_hwm(job, last.tx, last.time)?;
            stats.last_tx = Some(last.tx);
        }
        stats.transactions = steps.len() as u64;
        Ok(stats)
    }

    /// Pass 1: advance the metadata history. Each commit's tree holds
    /// `hist.xml`, `streams.xml` and (after the initial populate)
    /// `diff.xml`, all with TaskId normalized.
    fn advance_info(
        &self,
        job: &StreamJob,
        initial_tx: Option<TxId>,
        candidates: &[TxId],
        last_done: Option<TxId>,
    ) -> Result<Vec<InfoStep>> {
        let info_ref = self.layout.info(job.id);
        let mut parent = self.store.read_ref(&info_ref)?;
        let mut steps = Vec::new();

        // Base transaction for diffs: the last one whose contents were
        // populated. An empty-diff transaction leaves the stream state
        // unchanged, so the data tip's transaction is equivalent.
        let mut diff_base = last_done.unwrap_or(0);

        if let Some(tx) = initial_tx {
            self.stop.check()?;
            let (hist_xml, time) = self.hist_or_sentinel(job, tx)?;
            let streams = self.source.show_streams(self.depot, tx)?;
            let files = vec![
                ("hist.xml".to_string(), xml::normalize_task_id(&hist_xml).into_bytes()),
                (
                    "streams.xml".to_string(),
                    xml::normalize_task_id(&streams.xml).into_bytes(),
                ),
            ];
            let parents: Vec<Oid> = parent.iter().cloned().collect();
            let commit = self.store.commit_files(
                &info_ref,
                &files,
                &tx_message(tx),
                &Signature::converter(time),
                &parents,
            )?;
            parent = Some(commit);
            diff_base = tx;
            steps.push(InfoStep {
                tx,
                time,
                diff_paths: None,
            });
        }

        for &tx in candidates {
            self.stop.check()?;
            let (hist_xml, time) = self.hist_or_sentinel(job, tx)?;
            let streams = self.source.show_streams(self.depot, tx)?;
            // An unreadable transaction records an empty change set; the
            // next good diff (computed against the same base) catches up.
            let (diff_xml, diff_paths) = if hist_xml.is_empty() {
                (String::new(), Vec::new())
            } else {
                let diff = self.source.diff(&job.name, diff_base, tx)?;
                (diff.xml, diff.paths)
            };
            let files = vec![
                ("hist.xml".to_string(), xml::normalize_task_id(&hist_xml).into_bytes()),
                (
                    "streams.xml".to_string(),
                    xml::normalize_task_id(&streams.xml).into_bytes(),
                ),
                ("diff.xml".to_string(), xml::normalize_task_id(&diff_xml).into_bytes()),
            ];
            let parents: Vec<Oid> = parent.iter().cloned().collect();
            let commit = self.store.commit_files(
                &info_ref,
                &files,
                &tx_message(tx),
                &Signature::converter(time),
                &parents,
            )?;
            parent = Some(commit);
            if !diff_paths.is_empty() {
                diff_base = tx;
            }
            steps.push(InfoStep {
                tx,
                time,
                diff_paths: Some(diff_paths),
            });
        }

        Ok(steps)
    }

    /// Pass 2: re-walk the same candidates and advance the contents
    /// history, one commit per info commit.
    fn advance_data(
        &self,
        job: &StreamJob,
        workdir: &Path,
        steps: &[InfoStep],
        stats: &mut StreamRetrieveStats,
    ) -> Result<()> {
        if steps.is_empty() {
            return Ok(());
        }
        let data_ref = self.layout.data(job.id);
        let label = format!("s{}", job.id);
        let mut parent = self.store.read_ref(&data_ref)?;

        clear_dir(workdir)?;
        if let Some(tip) = &parent {
            self.store.checkout_into(tip.as_str(), workdir, &label)?;
        }

        for step in steps {
            self.stop.check()?;
            let sig = Signature::converter(step.time);
            let parents: Vec<Oid> = parent.iter().cloned().collect();
            let message = tx_message(step.tx);

            let full_populate = step.diff_paths.is_none() || self.method == Method::Pop;
            let commit = if full_populate {
                clear_dir(workdir)?;
                self.source.pop(&job.name, step.tx, workdir, true)?;
                preserve_empty_dirs(workdir)?;
                stats.populated += 1;
                self.store
                    .commit_workdir(&data_ref, workdir, &label, &message, &sig, &parents)?
            } else {
                let paths = step.diff_paths.as_deref().unwrap_or(&[]);
                if paths.is_empty() {
                    // Nothing changed; record the transaction anyway so
                    // the histories stay 1:1.
                    let tree = match &parent {
                        Some(p) => self.store.tree_of(p.as_str())?,
                        None => self.store.empty_tree()?,
                    };
                    let commit = self.store.commit_tree(&tree, &parents, &message, &sig)?;
                    self.store.update_ref(&data_ref, &commit)?;
                    commit
                } else {
                    for path in paths {
                        remove_path(&workdir.join(path))?;
                    }
                    self.source.pop(&job.name, step.tx, workdir, false)?;
                    preserve_empty_dirs(workdir)?;
                    stats.populated += 1;
                    self.store
                        .commit_workdir(&data_ref, workdir, &label, &message, &sig, &parents)?
                }
            };
            parent = Some(commit);
        }
        Ok(())
    }

    fn hist_or_sentinel(&self, job: &StreamJob, tx: TxId) -> Result<(String, i64)> {
        match self.source.hist(self.depot, tx) {
            Ok(hist) => {
                let time = hist.transactions.first().map(|t| t.time).unwrap_or(0);
                Ok((hist.xml, time))
            }
            Err(Error::Parse { context, message }) => {
                // Known for very old transactions: the server emits XML
                // nothing can parse. Record the sentinel and move on.
                tracing::warn!(
                    stream = job.id,
                    tx,
                    %context,
                    %message,
                    "unparseable history; recording sentinel"
                );
                Ok((String::new(), 0))
            }
            Err(err) => Err(err),
        }
    }

    fn ensure_hwm(&self, job: &StreamJob, tx: TxId, time: i64) -> Result<()> {
        if read_hwm(self.store, self.layout, job.id)? == Some(tx) {
            return Ok(());
        }
        let refname = self.layout.hwm(job.id);
        let parents: Vec<Oid> = self.store.read_ref(&refname)?.into_iter().collect();
        self.store.commit_files(
            &refname,
            &[("hwm".to_string(), tx.to_string().into_bytes())],
            &tx_message(tx),
            &Signature::converter(time),
            &parents,
        )?;
        Ok(())
    }
}

/// Delete every entry inside `dir`, leaving the directory itself.
pub fn clear_dir(dir: &Path) -> std::io::Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        fs::remove_dir_all(path)
    } else if path.exists() {
        fs::remove_file(path)
    } else {
        Ok(())
    }
}

/// Drop a `.gitignore` into every empty directory so the populated tree
/// keeps the source's directory structure.
pub fn preserve_empty_dirs(dir: &Path) -> std::io::Result<()> {
    let mut entries = 0usize;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        entries += 1;
        if path.is_dir() {
            preserve_empty_dirs(&path)?;
        }
    }
    if entries == 0 {
        fs::write(dir.join(".gitignore"), b"")?;
    }
    Ok(())
}
