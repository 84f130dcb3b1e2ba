//! Target store adapter.
//!
//! Thin operations over the git plumbing commands. The adapter never
//! touches `HEAD` or the repository's own index: commits are built with
//! `hash-object`/`mktree`/`commit-tree` or through a private index file,
//! and land on arbitrary refs via `update-ref`, which is the atomic
//! commit boundary for every state change the converter makes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::command::{Cmd, CommandOutput};
use crate::error::{Error, Result};

/// A git object id (hex).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Oid(String);

impl Oid {
    pub fn new(hex: impl Into<String>) -> Self {
        Oid(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Oid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Author/committer identity for one commit. The converter always sets
/// committer equal to author.
#[derive(Debug, Clone)]
pub struct Signature {
    pub name: String,
    pub email: String,
    /// Unix seconds, UTC.
    pub time: i64,
    /// Git offset string, e.g. `+0000`.
    pub tz: String,
}

impl Signature {
    /// Fixed identity for bookkeeping commits (info/data/hwm/state/cache
    /// refs), keyed only by the transaction time so re-runs reproduce
    /// identical hashes.
    pub fn converter(time: i64) -> Self {
        Self {
            name: "ac2git".to_string(),
            email: "ac2git@localhost".to_string(),
            time,
            tz: "+0000".to_string(),
        }
    }

    fn env_pairs(&self) -> Vec<(String, String)> {
        let date = format!("@{} {}", self.time, self.tz);
        vec![
            ("GIT_AUTHOR_NAME".to_string(), self.name.clone()),
            ("GIT_AUTHOR_EMAIL".to_string(), self.email.clone()),
            ("GIT_AUTHOR_DATE".to_string(), date.clone()),
            ("GIT_COMMITTER_NAME".to_string(), self.name.clone()),
            ("GIT_COMMITTER_EMAIL".to_string(), self.email.clone()),
            ("GIT_COMMITTER_DATE".to_string(), date),
        ]
    }
}

/// One entry of a ref's history, oldest first.
#[derive(Debug, Clone)]
pub struct RefEntry {
    pub commit: Oid,
    pub tree: Oid,
    pub subject: String,
}

/// Read-only queries the processing engine needs while planning; kept as
/// a trait so the engine is testable without a repository.
pub trait StoreView {
    fn is_ancestor(&self, ancestor: &Oid, descendant: &Oid) -> Result<bool>;
    fn tree_of(&self, commitish: &str) -> Result<Oid>;
}

/// Adapter over one git repository.
#[derive(Debug, Clone)]
pub struct GitStore {
    repo_path: PathBuf,
    git_dir: PathBuf,
    deadline: Option<Duration>,
}

impl GitStore {
    /// Open an existing repository, initializing one if the path holds
    /// no `.git` yet.
    pub fn init(repo_path: &Path, deadline: Option<Duration>) -> Result<GitStore> {
        if !repo_path.exists() {
            std::fs::create_dir_all(repo_path)?;
        }
        if !repo_path.join(".git").exists() {
            let out = Cmd::new("git")
                .arg("init")
                .arg("-q")
                .current_dir(repo_path)
                .deadline(deadline)
                .run()
                .map_err(reclass)?;
            if !out.success() {
                return Err(Error::target("init", out.stderr));
            }
            tracing::info!(path = %repo_path.display(), "initialized git repository");
        }
        Self::open(repo_path, deadline)
    }

    pub fn open(repo_path: &Path, deadline: Option<Duration>) -> Result<GitStore> {
        let repo_path = repo_path
            .canonicalize()
            .map_err(|e| Error::target("open", format!("{}: {}", repo_path.display(), e)))?;
        let git_dir = repo_path.join(".git");
        if !git_dir.exists() {
            return Err(Error::target(
                "open",
                format!("{} is not a git repository", repo_path.display()),
            ));
        }
        Ok(GitStore {
            repo_path,
            git_dir,
            deadline,
        })
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    fn git(&self) -> Cmd {
        // User and system config are shut out so object hashes depend
        // only on the converter's inputs.
        Cmd::new("git")
            .env("GIT_DIR", self.git_dir.display().to_string())
            .env("GIT_CONFIG_NOSYSTEM", "1")
            .env("GIT_CONFIG_GLOBAL", "/dev/null")
            .deadline(self.deadline)
    }

    fn run(&self, cmd: Cmd, op: &str) -> Result<CommandOutput> {
        let out = cmd.run().map_err(reclass)?;
        if !out.success() {
            return Err(Error::target(op, out.stderr.trim().to_string()));
        }
        Ok(out)
    }

    // ── Objects ────────────────────────────────────────────────

    /// Write a blob, returning its id.
    pub fn hash_object(&self, data: &[u8]) -> Result<Oid> {
        let out = self.run(
            self.git()
                .args(["hash-object", "-w", "--stdin"])
                .stdin_bytes(data.to_vec()),
            "hash-object",
        )?;
        Ok(Oid::new(out.stdout_str().trim()))
    }

    /// Build a flat tree of regular files.
    pub fn mktree(&self, entries: &[(String, Oid)]) -> Result<Oid> {
        let mut input = String::new();
        for (name, oid) in entries {
            input.push_str(&format!("100644 blob {}\t{}\n", oid, name));
        }
        let out = self.run(
            self.git().arg("mktree").stdin_bytes(input.into_bytes()),
            "mktree",
        )?;
        Ok(Oid::new(out.stdout_str().trim()))
    }

    pub fn empty_tree(&self) -> Result<Oid> {
        self.mktree(&[])
    }

    /// Create a commit object; the tree and parents must already exist.
    pub fn commit_tree(
        &self,
        tree: &Oid,
        parents: &[Oid],
        message: &str,
        sig: &Signature,
    ) -> Result<Oid> {
        let mut cmd = self.git().arg("commit-tree").arg(tree.as_str());
        for parent in parents {
            cmd = cmd.arg("-p").arg(parent.as_str());
        }
        for (key, value) in sig.env_pairs() {
            cmd = cmd.env(key, value);
        }
        let out = self.run(cmd.stdin_bytes(message.as_bytes().to_vec()), "commit-tree")?;
        Ok(Oid::new(out.stdout_str().trim()))
    }

    /// Commit a literal set of files to `refname`.
    pub fn commit_files(
        &self,
        refname: &str,
        files: &[(String, Vec<u8>)],
        message: &str,
        sig: &Signature,
        parents: &[Oid],
    ) -> Result<Oid> {
        let mut entries = Vec::with_capacity(files.len());
        for (name, data) in files {
            entries.push((name.clone(), self.hash_object(data)?));
        }
        let tree = self.mktree(&entries)?;
        let commit = self.commit_tree(&tree, parents, message, sig)?;
        self.update_ref(refname, &commit)?;
        Ok(commit)
    }

    // ── Work tree ──────────────────────────────────────────────

    fn index_env(&self, workdir: &Path, index_label: &str) -> Vec<(String, String)> {
        let index = self.git_dir.join(format!("ac2git-index-{}", index_label));
        vec![
            ("GIT_INDEX_FILE".to_string(), index.display().to_string()),
            ("GIT_WORK_TREE".to_string(), workdir.display().to_string()),
        ]
    }

    /// Stage everything under `workdir` into a private index and write
    /// the resulting tree. `index_label` keeps concurrent retrieval jobs
    /// on separate index files.
    pub fn write_workdir_tree(&self, workdir: &Path, index_label: &str) -> Result<Oid> {
        let env = self.index_env(workdir, index_label);

        let mut cmd = self.git().args(["read-tree", "--empty"]);
        for (key, value) in &env {
            cmd = cmd.env(key.clone(), value.clone());
        }
        self.run(cmd, "read-tree")?;

        let mut cmd = self
            .git()
            .args(["-c", "core.autocrlf=false", "add", "-f", "-A", "."])
            .current_dir(workdir);
        for (key, value) in &env {
            cmd = cmd.env(key.clone(), value.clone());
        }
        self.run(cmd, "add")?;

        let mut cmd = self.git().arg("write-tree");
        for (key, value) in &env {
            cmd = cmd.env(key.clone(), value.clone());
        }
        let out = self.run(cmd, "write-tree")?;
        Ok(Oid::new(out.stdout_str().trim()))
    }

    /// Commit the contents of `workdir` onto `refname`. Empty trees and
    /// no-change commits are allowed; the contents history records every
    /// transaction whether or not it changed anything.
    pub fn commit_workdir(
        &self,
        refname: &str,
        workdir: &Path,
        index_label: &str,
        message: &str,
        sig: &Signature,
        parents: &[Oid],
    ) -> Result<Oid> {
        let tree = self.write_workdir_tree(workdir, index_label)?;
        let commit = self.commit_tree(&tree, parents, message, sig)?;
        self.update_ref(refname, &commit)?;
        Ok(commit)
    }

    /// Materialize a commit's tree into `workdir`.
    pub fn checkout_into(&self, commitish: &str, workdir: &Path, index_label: &str) -> Result<()> {
        let env = self.index_env(workdir, index_label);

        let mut cmd = self.git().arg("read-tree").arg(commitish);
        for (key, value) in &env {
            cmd = cmd.env(key.clone(), value.clone());
        }
        self.run(cmd, "read-tree")?;

        let mut cmd = self
            .git()
            .args(["checkout-index", "-a", "-f"])
            .current_dir(workdir);
        for (key, value) in &env {
            cmd = cmd.env(key.clone(), value.clone());
        }
        self.run(cmd, "checkout-index")?;
        Ok(())
    }

    // ── Refs ───────────────────────────────────────────────────

    pub fn read_ref(&self, refname: &str) -> Result<Option<Oid>> {
        let out = self
            .git()
            .args(["rev-parse", "--verify", "--quiet"])
            .arg(format!("{}^{{commit}}", refname))
            .run()
            .map_err(reclass)?;
        if out.success() {
            Ok(Some(Oid::new(out.stdout_str().trim())))
        } else {
            Ok(None)
        }
    }

    pub fn update_ref(&self, refname: &str, commit: &Oid) -> Result<()> {
        self.run(
            self.git().arg("update-ref").arg(refname).arg(commit.as_str()),
            "update-ref",
        )?;
        Ok(())
    }

    pub fn delete_ref(&self, refname: &str) -> Result<()> {
        self.run(self.git().args(["update-ref", "-d"]).arg(refname), "update-ref -d")?;
        Ok(())
    }

    // ── Queries ────────────────────────────────────────────────

    /// First-parent history of a ref, oldest first. A missing ref is an
    /// empty history. First-parent is the right walk for every chain the
    /// converter keeps: hidden refs are linear, and on visible branches
    /// it yields the stream's own commit sequence without pulling in
    /// merge sources.
    pub fn log_ref(&self, refname: &str) -> Result<Vec<RefEntry>> {
        if self.read_ref(refname)?.is_none() {
            return Ok(Vec::new());
        }
        let out = self.run(
            self.git()
                .args(["log", "--reverse", "--first-parent", "--format=%H %T %s"])
                .arg(refname),
            "log",
        )?;
        let mut entries = Vec::new();
        for line in out.stdout_str().lines() {
            let mut parts = line.splitn(3, ' ');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(commit), Some(tree), subject) => entries.push(RefEntry {
                    commit: Oid::new(commit),
                    tree: Oid::new(tree),
                    subject: subject.unwrap_or("").to_string(),
                }),
                _ => return Err(Error::target("log", format!("unparseable line: {}", line))),
            }
        }
        Ok(entries)
    }

    pub fn rev_list_count(&self, refname: &str) -> Result<u64> {
        if self.read_ref(refname)?.is_none() {
            return Ok(0);
        }
        let out = self.run(
            self.git().args(["rev-list", "--count"]).arg(refname),
            "rev-list",
        )?;
        out.stdout_str()
            .trim()
            .parse()
            .map_err(|e| Error::target("rev-list", format!("bad count: {}", e)))
    }

    /// `commitish~n`.
    pub fn nth_ancestor(&self, commitish: &str, n: u64) -> Result<Oid> {
        let out = self.run(
            self.git().arg("rev-parse").arg(format!("{}~{}", commitish, n)),
            "rev-parse",
        )?;
        Ok(Oid::new(out.stdout_str().trim()))
    }

    /// Parents of a commit, in order.
    pub fn parents_of(&self, commit: &Oid) -> Result<Vec<Oid>> {
        let out = self.run(
            self.git()
                .args(["rev-list", "--parents", "-n", "1"])
                .arg(commit.as_str()),
            "rev-list --parents",
        )?;
        let stdout = out.stdout_str();
        let mut tokens = stdout.split_whitespace();
        tokens.next(); // the commit itself
        Ok(tokens.map(Oid::new).collect())
    }

    /// Subject line and committer time of a commit.
    pub fn commit_info(&self, commitish: &str) -> Result<(String, i64)> {
        let out = self.run(
            self.git()
                .args(["show", "-s", "--format=%ct %s"])
                .arg(commitish),
            "show -s",
        )?;
        let stdout = out.stdout_str();
        let line = stdout.trim();
        let (time, subject) = line
            .split_once(' ')
            .unwrap_or((line, ""));
        let time = time
            .parse()
            .map_err(|e| Error::target("show -s", format!("bad commit time: {}", e)))?;
        Ok((subject.to_string(), time))
    }

    /// Blob contents at `commitish:path`, or `None` when absent.
    pub fn show(&self, commitish: &str, path: &str) -> Result<Option<Vec<u8>>> {
        let out = self
            .git()
            .arg("cat-file")
            .arg("blob")
            .arg(format!("{}:{}", commitish, path))
            .run()
            .map_err(reclass)?;
        if out.success() {
            Ok(Some(out.stdout))
        } else {
            Ok(None)
        }
    }

    /// Names and blob ids of a flat tree.
    pub fn ls_tree(&self, commitish: &str) -> Result<Vec<(String, Oid)>> {
        let out = self.run(self.git().arg("ls-tree").arg(commitish), "ls-tree")?;
        let mut entries = Vec::new();
        for line in out.stdout_str().lines() {
            // <mode> SP <type> SP <oid> TAB <name>
            let (meta, name) = line
                .split_once('\t')
                .ok_or_else(|| Error::target("ls-tree", format!("unparseable line: {}", line)))?;
            let oid = meta
                .split_whitespace()
                .nth(2)
                .ok_or_else(|| Error::target("ls-tree", format!("unparseable line: {}", line)))?;
            entries.push((name.to_string(), Oid::new(oid)));
        }
        Ok(entries)
    }

    /// Whether the trees of two commit-ish (or tree) ids are identical.
    /// Content addressing makes tree-hash equality the diff result.
    pub fn diff_tree_empty(&self, a: &str, b: &str) -> Result<bool> {
        Ok(StoreView::tree_of(self, a)? == StoreView::tree_of(self, b)?)
    }
}

impl StoreView for GitStore {
    fn is_ancestor(&self, ancestor: &Oid, descendant: &Oid) -> Result<bool> {
        let out = self
            .git()
            .args(["merge-base", "--is-ancestor"])
            .arg(ancestor.as_str())
            .arg(descendant.as_str())
            .run()
            .map_err(reclass)?;
        match out.status {
            0 => Ok(true),
            1 => Ok(false),
            _ => Err(Error::target("merge-base", out.stderr.trim().to_string())),
        }
    }

    fn tree_of(&self, commitish: &str) -> Result<Oid> {
        let out = self.run(
            self.git()
                .arg("rev-parse")
                .arg(format!("{}^{{tree}}", commitish)),
            "rev-parse",
        )?;
        Ok(Oid::new(out.stdout_str().trim()))
    }
}

/// Failures spawning or timing out `git` are target-store failures, not
/// source-client ones.
fn reclass(err: Error) -> Error {
    match err {
        Error::Source { operation, stderr } => Error::Target {
            operation,
            message: stderr,
        },
        other => other,
    }
}
