//! Source client adapter.
//!
//! Drives the AccuRev command-line client and returns parsed, structured
//! results. The `SourceClient` trait is the seam the retrieval pipeline
//! and planner are written against; tests substitute a scripted
//! implementation.
//!
//! Transient failures (expired session, network hiccups) are retried
//! twice with exponential backoff; an expired session additionally
//! triggers a re-login when credentials are configured.

use std::path::Path;
use std::time::Duration;

use crate::command::Cmd;
use crate::error::{Error, Result};
use crate::model::{DepotId, StreamRecord, Transaction, TxId};
use crate::xml;

/// A `hist` response: raw XML plus the parsed transactions.
#[derive(Debug, Clone)]
pub struct HistResult {
    pub xml: String,
    pub transactions: Vec<Transaction>,
}

/// A `show streams` snapshot: raw XML plus the parsed records.
#[derive(Debug, Clone)]
pub struct StreamsResult {
    pub xml: String,
    pub streams: Vec<StreamRecord>,
}

/// A `diff` response: raw XML plus the changed element paths.
#[derive(Debug, Clone)]
pub struct DiffResult {
    pub xml: String,
    pub paths: Vec<String>,
}

/// Contract the conversion engine consumes from the source system.
pub trait SourceClient: Send + Sync {
    /// Metadata of one transaction, queried depot-wide (a transaction
    /// that affected a stream may not have occurred on it).
    fn hist(&self, depot: &str, tx: TxId) -> Result<HistResult>;

    /// Snapshot of all streams as of `tx`.
    fn show_streams(&self, depot: &str, tx: TxId) -> Result<StreamsResult>;

    /// Changed element paths between two transactions of one stream.
    /// Undefined for a stream's mkstream transaction.
    fn diff(&self, stream: &str, from_tx: TxId, to_tx: TxId) -> Result<DiffResult>;

    /// Materialize stream contents at `tx` into `dest`.
    fn pop(&self, stream: &str, tx: TxId, dest: &Path, overwrite: bool) -> Result<()>;

    /// Ordered transaction ids that could have affected `stream` within
    /// the inclusive range. May over-approximate, never
    /// under-approximates; does not interpret timelocks.
    fn deep_hist(&self, depot: &str, stream: &str, range: (TxId, TxId)) -> Result<Vec<TxId>>;

    /// The stream's mkstream transaction; `None` for the depot root
    /// stream, which has none.
    fn mkstream_tx(&self, depot: &str, stream: &str) -> Result<Option<TxId>>;

    /// Highest transaction id in the depot.
    fn latest_tx(&self, depot: &str) -> Result<TxId>;

    /// Stable id of a depot.
    fn depot_id(&self, depot: &str) -> Result<DepotId>;
}

/// Failure classes worth one more attempt: an expired login or a
/// flaky network between client and server.
pub fn is_transient(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    [
        "not authenticated",
        "session has expired",
        "session token",
        "network error",
        "connection refused",
        "connection reset",
        "timed out",
        "temporarily unavailable",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

fn needs_login(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("not authenticated") || lower.contains("session")
}

/// Subprocess-backed client for the real `accurev` binary.
pub struct AccurevClient {
    program: String,
    deadline: Option<Duration>,
    credentials: Option<(String, String)>,
    backoff: Duration,
}

impl AccurevClient {
    pub fn new(deadline: Option<Duration>, credentials: Option<(String, String)>) -> Self {
        Self {
            program: "accurev".to_string(),
            deadline,
            credentials,
            backoff: Duration::from_millis(500),
        }
    }

    /// Use a different executable (tests point this at a stub).
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn login(&self) -> Result<()> {
        let (user, password) = self
            .credentials
            .as_ref()
            .ok_or_else(|| Error::Config("source login required but no credentials configured".into()))?;
        let out = Cmd::new(&self.program)
            .arg("login")
            .stdin_bytes(format!("{}\n{}\n", user, password).into_bytes())
            .deadline(self.deadline)
            .run()?;
        if out.success() {
            tracing::info!(%user, "source login succeeded");
            Ok(())
        } else {
            Err(Error::source("login", out.stderr.trim().to_string()))
        }
    }

    pub fn logout(&self) -> Result<()> {
        let out = Cmd::new(&self.program)
            .arg("logout")
            .deadline(self.deadline)
            .run()?;
        if out.success() {
            Ok(())
        } else {
            Err(Error::source("logout", out.stderr.trim().to_string()))
        }
    }

    /// Run one XML-producing subcommand with the retry policy.
    fn run_xml(&self, operation: &str, args: &[String]) -> Result<String> {
        let mut delay = self.backoff;
        let mut last_stderr = String::new();
        for attempt in 0..3 {
            if attempt > 0 {
                tracing::warn!(
                    operation,
                    attempt,
                    "retrying source command after transient failure"
                );
                std::thread::sleep(delay);
                delay *= 2;
            }
            let out = Cmd::new(&self.program)
                .args(args.iter().cloned())
                .deadline(self.deadline)
                .run()?;
            if out.success() {
                return Ok(out.stdout_str());
            }
            last_stderr = out.stderr.trim().to_string();
            if !is_transient(&last_stderr) {
                break;
            }
            if needs_login(&last_stderr) && self.credentials.is_some() {
                if let Err(err) = self.login() {
                    tracing::warn!(%err, "re-login failed");
                }
            }
        }
        Err(Error::source(operation, last_stderr))
    }

    /// Transactions recorded against one stream within a range.
    fn hist_range(&self, depot: &str, stream: &str, range: (TxId, TxId)) -> Result<Vec<TxId>> {
        let xml = self.run_xml(
            "hist",
            &[
                "hist".into(),
                "-p".into(),
                depot.into(),
                "-s".into(),
                stream.into(),
                "-t".into(),
                format!("{}-{}", range.1, range.0),
                "-fx".into(),
            ],
        )?;
        let mut txs: Vec<TxId> = xml::parse_hist(&xml)?
            .into_iter()
            .map(|t| t.id)
            .filter(|id| *id >= range.0 && *id <= range.1)
            .collect();
        txs.sort_unstable();
        txs.dedup();
        Ok(txs)
    }
}

impl SourceClient for AccurevClient {
    fn hist(&self, depot: &str, tx: TxId) -> Result<HistResult> {
        let xml = self.run_xml(
            "hist",
            &[
                "hist".into(),
                "-p".into(),
                depot.into(),
                "-t".into(),
                format!("{}.1", tx),
                "-fx".into(),
            ],
        )?;
        let transactions = xml::parse_hist(&xml)?;
        Ok(HistResult { xml, transactions })
    }

    fn show_streams(&self, depot: &str, tx: TxId) -> Result<StreamsResult> {
        let xml = self.run_xml(
            "show streams",
            &[
                "show".into(),
                "-p".into(),
                depot.into(),
                "-t".into(),
                tx.to_string(),
                "-fx".into(),
                "streams".into(),
            ],
        )?;
        let streams = xml::parse_streams(&xml)?;
        Ok(StreamsResult { xml, streams })
    }

    fn diff(&self, stream: &str, from_tx: TxId, to_tx: TxId) -> Result<DiffResult> {
        let xml = self.run_xml(
            "diff",
            &[
                "diff".into(),
                "-a".into(),
                "-i".into(),
                "-v".into(),
                stream.into(),
                "-V".into(),
                stream.into(),
                "-t".into(),
                format!("{}-{}", from_tx, to_tx),
                "-fx".into(),
            ],
        )?;
        let paths = xml::parse_diff(&xml)?;
        Ok(DiffResult { xml, paths })
    }

    fn pop(&self, stream: &str, tx: TxId, dest: &Path, overwrite: bool) -> Result<()> {
        let mut args: Vec<String> = vec!["pop".into(), "-R".into()];
        if overwrite {
            args.push("-O".into());
        }
        args.extend([
            "-v".into(),
            stream.into(),
            "-L".into(),
            dest.display().to_string(),
            "-t".into(),
            tx.to_string(),
            ".".into(),
        ]);
        let mut delay = self.backoff;
        let mut last_stderr = String::new();
        for attempt in 0..3 {
            if attempt > 0 {
                std::thread::sleep(delay);
                delay *= 2;
            }
            let out = Cmd::new(&self.program)
                .args(args.iter().cloned())
                .deadline(self.deadline)
                .run()?;
            if out.success() {
                return Ok(());
            }
            last_stderr = out.stderr.trim().to_string();
            if !is_transient(&last_stderr) {
                break;
            }
        }
        Err(Error::source("pop", last_stderr))
    }

    fn deep_hist(&self, depot: &str, stream: &str, range: (TxId, TxId)) -> Result<Vec<TxId>> {
        // Union of the stream's own history with that of every stream on
        // its basis chain (as of the range end): a promote anywhere above
        // can flow down. Timelocks are deliberately not interpreted, so
        // the result over-approximates.
        let snapshot = self.show_streams(depot, range.1)?;
        let mut txs = Vec::new();
        let mut visited = std::collections::BTreeSet::new();
        let mut cursor = snapshot.streams.iter().find(|r| r.name == stream);
        while let Some(record) = cursor {
            if !visited.insert(record.id) {
                break;
            }
            txs.extend(self.hist_range(depot, &record.name, range)?);
            cursor = record
                .basis
                .and_then(|b| snapshot.streams.iter().find(|r| r.id == b));
        }
        txs.sort_unstable();
        txs.dedup();
        Ok(txs)
    }

    fn mkstream_tx(&self, depot: &str, stream: &str) -> Result<Option<TxId>> {
        let xml = self.run_xml(
            "hist",
            &[
                "hist".into(),
                "-p".into(),
                depot.into(),
                "-s".into(),
                stream.into(),
                "-k".into(),
                "mkstream".into(),
                "-t".into(),
                "now.1".into(),
                "-fx".into(),
            ],
        )?;
        let transactions = xml::parse_hist(&xml)?;
        if transactions.len() > 1 {
            tracing::warn!(stream, "multiple mkstream transactions; using the first");
        }
        Ok(transactions.first().map(|t| t.id))
    }

    fn latest_tx(&self, depot: &str) -> Result<TxId> {
        let xml = self.run_xml(
            "hist",
            &[
                "hist".into(),
                "-p".into(),
                depot.into(),
                "-t".into(),
                "now.1".into(),
                "-fx".into(),
            ],
        )?;
        xml::parse_hist(&xml)?
            .first()
            .map(|t| t.id)
            .ok_or_else(|| Error::source("hist", format!("depot '{}' has no transactions", depot)))
    }

    fn depot_id(&self, depot: &str) -> Result<DepotId> {
        let xml = self.run_xml(
            "show depots",
            &["show".into(), "-fx".into(), "depots".into()],
        )?;
        xml::parse_depots(&xml)?
            .into_iter()
            .find(|(name, _)| name == depot)
            .map(|(_, id)| id)
            .ok_or_else(|| Error::source("show depots", format!("depot '{}' not found", depot)))
    }
}
