//! Conversion configuration.
//!
//! Loaded from a JSON file. The option set mirrors what the conversion
//! engine consumes: depot, the ordered stream list (with optional branch
//! names), the transaction window, the retrieval method, the merge
//! policies, the user map and the repository path.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::model::TxId;

/// Default hidden-ref namespace inside the target repository.
pub const DEFAULT_REF_NAMESPACE: &str = "refs/ac2git";

/// A transaction bound: a number or one of the keywords
/// `first` / `highest` / `now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TxBoundRepr", into = "TxBoundRepr")]
pub enum TxBound {
    First,
    Highest,
    Now,
    At(TxId),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum TxBoundRepr {
    Num(TxId),
    Word(String),
}

impl TryFrom<TxBoundRepr> for TxBound {
    type Error = String;

    fn try_from(repr: TxBoundRepr) -> std::result::Result<Self, String> {
        match repr {
            TxBoundRepr::Num(n) => Ok(TxBound::At(n)),
            TxBoundRepr::Word(w) => match w.as_str() {
                "first" => Ok(TxBound::First),
                "highest" => Ok(TxBound::Highest),
                "now" => Ok(TxBound::Now),
                other => Err(format!(
                    "unknown transaction bound '{}' (expected a number, 'first', 'highest' or 'now')",
                    other
                )),
            },
        }
    }
}

impl From<TxBound> for TxBoundRepr {
    fn from(bound: TxBound) -> TxBoundRepr {
        match bound {
            TxBound::First => TxBoundRepr::Word("first".to_string()),
            TxBound::Highest => TxBoundRepr::Word("highest".to_string()),
            TxBound::Now => TxBoundRepr::Word("now".to_string()),
            TxBound::At(n) => TxBoundRepr::Num(n),
        }
    }
}

/// Retrieval strategy for walking a stream's transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Method {
    /// Visit every transaction; full populate each step.
    Pop,
    /// Visit every transaction; populate only the diffed paths.
    Diff,
    /// Visit only the transactions the deep-history query names.
    DeepHist,
}

/// What to commit on a child stream whose contents already match its
/// basis's new commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmptyChildAction {
    Merge,
    CherryPick,
}

/// One stream to convert; either a bare name or a name with an explicit
/// git branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamSpec {
    Name(String),
    Mapped { name: String, branch: String },
}

impl StreamSpec {
    pub fn name(&self) -> &str {
        match self {
            StreamSpec::Name(n) => n,
            StreamSpec::Mapped { name, .. } => name,
        }
    }

    pub fn branch(&self) -> &str {
        match self {
            StreamSpec::Name(n) => n,
            StreamSpec::Mapped { branch, .. } => branch,
        }
    }
}

/// Git identity for one source user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserIdent {
    pub name: String,
    pub email: String,
    /// Git-style offset (`+0100`); all source times are UTC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

fn default_method() -> Method {
    Method::Diff
}

fn default_start_tx() -> TxBound {
    TxBound::First
}

fn default_end_tx() -> TxBound {
    TxBound::Highest
}

fn default_empty_child_action() -> EmptyChildAction {
    EmptyChildAction::Merge
}

fn default_ref_namespace() -> String {
    DEFAULT_REF_NAMESPACE.to_string()
}

fn default_retrieval_jobs() -> usize {
    1
}

/// Conversion configuration, stored as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Depot to convert. One depot per run.
    pub depot: String,

    /// Ordered list of streams to convert. Frozen for the life of the
    /// converted repository.
    pub streams: Vec<StreamSpec>,

    /// Path to the git repository the conversion writes into.
    pub repo_path: PathBuf,

    #[serde(default = "default_start_tx")]
    pub start_tx: TxBound,

    #[serde(default = "default_end_tx")]
    pub end_tx: TxBound,

    #[serde(default = "default_method")]
    pub method: Method,

    /// After a merge whose source stream is tracked, also fast-forward
    /// the source's branch to the new commit.
    #[serde(default)]
    pub source_stream_fast_forward: bool,

    #[serde(default = "default_empty_child_action")]
    pub empty_child_stream_action: EmptyChildAction,

    /// Source username -> git identity.
    #[serde(default)]
    pub user_map: BTreeMap<String, UserIdent>,

    /// Source login; when unset an already-active session is assumed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default = "default_ref_namespace")]
    pub ref_namespace: String,

    /// Concurrent retrieval jobs; each gets its own work directory.
    #[serde(default = "default_retrieval_jobs")]
    pub retrieval_jobs: usize,

    /// Parent a new stream's root commit on its basis's tip instead of
    /// starting an orphan history.
    #[serde(default)]
    pub mkstream_basis_parent: bool,

    /// Wall-clock deadline for a single external command, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_timeout_secs: Option<u64>,
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Config> {
        let data = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: Config = serde_json::from_str(&data)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.depot.is_empty() {
            return Err(Error::Config("no depot specified".into()));
        }
        if self.streams.is_empty() {
            return Err(Error::Config("no streams specified".into()));
        }
        if matches!(self.start_tx, TxBound::Highest | TxBound::Now) {
            return Err(Error::Config(
                "start-tx must be a number or 'first'".into(),
            ));
        }
        if self.end_tx == TxBound::First {
            return Err(Error::Config(
                "end-tx must be a number, 'highest' or 'now'".into(),
            ));
        }
        if self.retrieval_jobs == 0 {
            return Err(Error::Config("retrieval-jobs must be at least 1".into()));
        }
        let mut seen = std::collections::BTreeSet::new();
        for spec in &self.streams {
            if !seen.insert(spec.name()) {
                return Err(Error::Config(format!(
                    "stream '{}' listed twice",
                    spec.name()
                )));
            }
        }
        Ok(())
    }

    /// An example configuration with every option populated.
    pub fn example() -> Config {
        let mut user_map = BTreeMap::new();
        user_map.insert(
            "joe_bloggs".to_string(),
            UserIdent {
                name: "Joe Bloggs".to_string(),
                email: "joe@bloggs.example".to_string(),
                timezone: Some("+0100".to_string()),
            },
        );
        user_map.insert(
            "joanna_bloggs".to_string(),
            UserIdent {
                name: "Joanna Bloggs".to_string(),
                email: "joanna@bloggs.example".to_string(),
                timezone: None,
            },
        );
        Config {
            depot: "Trunk".to_string(),
            streams: vec![
                StreamSpec::Name("Trunk".to_string()),
                StreamSpec::Mapped {
                    name: "Trunk_Dev".to_string(),
                    branch: "dev".to_string(),
                },
            ],
            repo_path: PathBuf::from("./trunk-git"),
            start_tx: TxBound::First,
            end_tx: TxBound::Highest,
            method: Method::Diff,
            source_stream_fast_forward: false,
            empty_child_stream_action: EmptyChildAction::Merge,
            user_map,
            username: Some("joe_bloggs".to_string()),
            password: None,
            ref_namespace: DEFAULT_REF_NAMESPACE.to_string(),
            retrieval_jobs: 1,
            mkstream_basis_parent: false,
            command_timeout_secs: None,
        }
    }

    /// Pretty-printed example config for `example-config`.
    pub fn example_json() -> String {
        // Serialization of a literal cannot fail.
        serde_json::to_string_pretty(&Config::example()).unwrap_or_default()
    }
}
