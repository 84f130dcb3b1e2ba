//! Conversion orchestrator.
//!
//! One coordinator drives the phases in order: resolve the tracked
//! streams, retrieve every stream's hidden histories (optionally fanned
//! out across worker threads with private work directories), then run
//! the planner thread against the single-threaded processor over a
//! bounded channel.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::accurev::SourceClient;
use crate::config::{Config, TxBound};
use crate::engine::{Engine, EnginePolicy, ProcessStats};
use crate::error::{Error, Result};
use crate::gitstore::GitStore;
use crate::model::{StreamId, TrackedStream, TrackedStreams, TxId};
use crate::planner::Planner;
use crate::refs::RefLayout;
use crate::retrieve::{Retriever, StreamJob, StreamRetrieveStats};

/// Cooperative cancellation, checked between transactions. An in-flight
/// external command is allowed to finish; whatever half-state remains is
/// repaired on the next startup.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_set() {
            Err(Error::Interrupted)
        } else {
            Ok(())
        }
    }
}

/// Combined result of a full conversion run.
#[derive(Debug, Default)]
pub struct ConvertStats {
    pub retrieve: Vec<StreamRetrieveStats>,
    pub process: ProcessStats,
    pub elapsed_ms: u64,
}

pub struct Converter<'a> {
    config: &'a Config,
    source: &'a dyn SourceClient,
    store: GitStore,
    layout: RefLayout,
    tracked: TrackedStreams,
    start_tx: TxId,
    end_tx: TxId,
    stop: StopFlag,
}

impl<'a> Converter<'a> {
    pub fn new(
        config: &'a Config,
        source: &'a dyn SourceClient,
        stop: StopFlag,
    ) -> Result<Converter<'a>> {
        let deadline = config.command_timeout_secs.map(Duration::from_secs);
        let store = GitStore::init(&config.repo_path, deadline)?;

        let depot_id = source.depot_id(&config.depot)?;
        let layout = RefLayout::new(&config.ref_namespace, depot_id);

        let end_tx = match config.end_tx {
            TxBound::At(tx) => tx,
            TxBound::Highest | TxBound::Now => source.latest_tx(&config.depot)?,
            TxBound::First => return Err(Error::Config("end-tx cannot be 'first'".into())),
        };
        let start_tx = match config.start_tx {
            TxBound::At(tx) => tx,
            TxBound::First => 1,
            _ => return Err(Error::Config("start-tx must be a number or 'first'".into())),
        };
        if start_tx > end_tx {
            return Err(Error::Config(format!(
                "start-tx {} is past end-tx {}",
                start_tx, end_tx
            )));
        }

        // Resolve configured stream names to stable ids as of the end
        // transaction.
        let snapshot = source.show_streams(&config.depot, end_tx)?;
        let mut streams = Vec::new();
        for spec in &config.streams {
            let record = snapshot
                .streams
                .iter()
                .find(|r| r.name == spec.name())
                .ok_or_else(|| {
                    Error::Config(format!(
                        "stream '{}' not found in depot '{}'",
                        spec.name(),
                        config.depot
                    ))
                })?;
            streams.push(TrackedStream {
                id: record.id,
                name: record.name.clone(),
                branch: spec.branch().to_string(),
            });
        }
        let tracked = TrackedStreams::new(streams);

        tracing::info!(
            depot = %config.depot,
            depot_id,
            streams = tracked.len(),
            start = start_tx,
            end = end_tx,
            "converter ready"
        );

        Ok(Converter {
            config,
            source,
            store,
            layout,
            tracked,
            start_tx,
            end_tx,
            stop,
        })
    }

    pub fn tracked(&self) -> &TrackedStreams {
        &self.tracked
    }

    pub fn store(&self) -> &GitStore {
        &self.store
    }

    pub fn layout(&self) -> &RefLayout {
        &self.layout
    }

    fn work_area(&self, stream: StreamId) -> Result<PathBuf> {
        let dir = self
            .store
            .repo_path()
            .join(".git")
            .join(format!("ac2git-work-{}", stream));
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Phase one: advance every tracked stream's hidden refs. A failure
    /// is contained to its stream; the remaining streams still run, and
    /// the first error is reported once all jobs have finished.
    pub fn retrieve(&self) -> Result<Vec<StreamRetrieveStats>> {
        let retriever = Retriever {
            source: self.source,
            store: &self.store,
            layout: &self.layout,
            depot: &self.config.depot,
            method: self.config.method,
            start_tx: self.start_tx,
            end_tx: self.end_tx,
            stop: self.stop.clone(),
        };
        let jobs: Vec<StreamJob> = self
            .tracked
            .iter()
            .map(|s| StreamJob {
                id: s.id,
                name: s.name.clone(),
            })
            .collect();

        let stats = Mutex::new(Vec::new());
        let first_error: Mutex<Option<Error>> = Mutex::new(None);

        let run_job = |job: &StreamJob| {
            let result = self
                .work_area(job.id)
                .and_then(|workdir| retriever.retrieve_stream(job, &workdir));
            match result {
                Ok(s) => stats.lock().unwrap().push(s),
                Err(err) => {
                    tracing::error!(stream = job.id, name = %job.name, %err, "retrieval failed");
                    let mut slot = first_error.lock().unwrap();
                    // An interruption outranks per-stream failures: the
                    // run is restartable, not broken.
                    if slot.is_none() || matches!(err, Error::Interrupted) {
                        *slot = Some(err);
                    }
                }
            }
        };

        let workers = self.config.retrieval_jobs.min(jobs.len().max(1));
        if workers <= 1 {
            for job in &jobs {
                if self.stop.is_set() {
                    break;
                }
                run_job(job);
            }
        } else {
            // Streams touch disjoint refs, so jobs are independent; each
            // worker pulls from a shared queue.
            let (sender, receiver) = crossbeam_channel::unbounded::<StreamJob>();
            for job in &jobs {
                let _ = sender.send(job.clone());
            }
            drop(sender);
            std::thread::scope(|scope| {
                for _ in 0..workers {
                    let receiver = receiver.clone();
                    let run_job = &run_job;
                    let stop = self.stop.clone();
                    scope.spawn(move || {
                        while let Ok(job) = receiver.recv() {
                            if stop.is_set() {
                                break;
                            }
                            run_job(&job);
                        }
                    });
                }
            });
        }

        if self.stop.is_set() {
            return Err(Error::Interrupted);
        }
        if let Some(err) = first_error.into_inner().unwrap() {
            return Err(err);
        }
        let mut stats = stats.into_inner().unwrap();
        stats.sort_by_key(|s| s.stream);
        Ok(stats)
    }

    /// Phase two: planner thread feeding the single-threaded processor.
    pub fn process(&self) -> Result<ProcessStats> {
        let stream_ids: Vec<StreamId> = self.tracked.iter().map(|s| s.id).collect();
        // A crashed retrieval may have left info ahead of data; align
        // before planning so the 1:1 pairing holds.
        for &stream in &stream_ids {
            crate::retrieve::repair_stream(&self.store, &self.layout, stream)?;
        }
        let planner = Planner::load(&self.store, &self.layout, &stream_ids)?;

        let policy = EnginePolicy {
            source_stream_fast_forward: self.config.source_stream_fast_forward,
            empty_child_action: self.config.empty_child_stream_action,
            mkstream_basis_parent: self.config.mkstream_basis_parent,
        };
        let mut engine = Engine::new(
            &self.store,
            &self.layout,
            &self.tracked,
            policy,
            &self.config.user_map,
            self.stop.clone(),
        )?;

        let after = engine.resume_after();
        if let Some(done) = after {
            // Seed the basis log so chstream comparisons can look before
            // the first pending transaction.
            if let Some((tx, snapshot)) = planner.snapshot_at_or_before(done)? {
                engine.preload_snapshot(tx, snapshot);
            }
            tracing::info!(after = done, "resuming processing");
        }

        let (events, planner_thread) = planner.spawn(after, 64);
        let result = engine.process(events);
        // The planner thread ends once its channel is drained or closed.
        let _ = planner_thread.join();
        result
    }

    /// Full conversion: retrieve, then process.
    pub fn run(&self) -> Result<ConvertStats> {
        let started = std::time::Instant::now();
        tracing::info!(
            at = %chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
            "conversion starting"
        );
        let retrieve = self.retrieve()?;
        let process = self.process()?;
        Ok(ConvertStats {
            retrieve,
            process,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_flag() {
        let stop = StopFlag::new();
        assert!(!stop.is_set());
        assert!(stop.check().is_ok());
        stop.trigger();
        assert!(stop.is_set());
        assert!(matches!(stop.check(), Err(Error::Interrupted)));
        // Clones share the flag.
        let clone = stop.clone();
        assert!(clone.is_set());
    }
}
