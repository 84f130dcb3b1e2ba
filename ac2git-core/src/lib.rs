//! AccuRev to Git conversion engine.
//!
//! Core functionality for ac2git including:
//! - Source client adapter over the `accurev` command line (hist,
//!   show streams, diff, pop, deep history)
//! - Target store adapter over `git` plumbing (refs as durable,
//!   content-addressed indices)
//! - Per-stream retrieval pipeline (info/data/hwm refs, pop / diff /
//!   deep-hist strategies, interrupt-safe resume)
//! - Transaction planner (global merge-walk, min-hwm stop line)
//! - Processing engine (merge / cherry-pick / fast-forward policy,
//!   stream-basis changes, child propagation)
//! - State and resume layer (`state/last`, commit-history audit chains)
//! - Stream id/name cache

pub mod accurev;
pub mod command;
pub mod config;
pub mod convert;
pub mod engine;
pub mod error;
pub mod gitstore;
pub mod model;
pub mod names;
pub mod planner;
pub mod refs;
pub mod retrieve;
pub mod state;
pub mod xml;

pub use accurev::{AccurevClient, DiffResult, HistResult, SourceClient, StreamsResult};
pub use config::{Config, EmptyChildAction, Method, StreamSpec, TxBound, UserIdent};
pub use convert::{Converter, ConvertStats, StopFlag};
pub use engine::{Engine, EnginePolicy, ProcessStats};
pub use error::{Error, Result};
pub use gitstore::{GitStore, Oid, Signature};
pub use model::{DepotId, StreamId, StreamKind, TrackedStream, TrackedStreams, Transaction, TxId, TxKind};
pub use planner::{Planner, PlannerEvent};
pub use refs::RefLayout;
pub use retrieve::{read_hwm, Retriever, StreamJob, StreamRetrieveStats};
pub use state::{LastState, StateStore};
