// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Background dump/compaction scheduler.
//!
//! Two heaps rank ranges by how urgently they need attention: the dump heap
//! by oldest dirty data first, the compaction heap by run count. A small
//! worker pool drains a task queue fed by the host thread; completions flow
//! back over a channel so state transitions (`Range::complete_dump`,
//! `Range::complete_compaction`) happen under the host thread's control, not
//! a worker's.

use crate::{
    fs::FileSystem,
    iters::{mem_iter, run_iter},
    range::Range,
    run::{id::RangeId, writer::RunWriter, Run},
    stop_signal::StopSignal,
    upsert::UpsertMerge,
    value::SeqNo,
    write_iter::write_iter,
    Config, Error, Result, UserKey,
};
use crossbeam_channel::{Receiver, Sender};
use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    ops::Bound,
    sync::{
        atomic::{AtomicU64, Ordering as AtomicOrdering},
        Arc, Condvar, Mutex,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

/// Floor for the exponential failure backoff.
const THROTTLE_MIN: Duration = Duration::from_secs(1);

/// Ceiling for the exponential failure backoff.
const THROTTLE_MAX: Duration = Duration::from_secs(60);

struct DumpEntry {
    min_lsn: SeqNo,
    range: Arc<Range>,
}

impl PartialEq for DumpEntry {
    fn eq(&self, other: &Self) -> bool {
        self.min_lsn == other.min_lsn
    }
}

impl Eq for DumpEntry {}

impl PartialOrd for DumpEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// `BinaryHeap` is a max-heap; reverse so the range with the *lowest* min_lsn
// (the oldest dirty data) pops first.
impl Ord for DumpEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.min_lsn.cmp(&self.min_lsn)
    }
}

struct CompactEntry {
    run_count: usize,
    range: Arc<Range>,
}

impl PartialEq for CompactEntry {
    fn eq(&self, other: &Self) -> bool {
        self.run_count == other.run_count
    }
}

impl Eq for CompactEntry {}

impl PartialOrd for CompactEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CompactEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.run_count.cmp(&other.run_count)
    }
}

enum TaskKind {
    Dump,
    Compaction,
}

struct Task {
    kind: TaskKind,
    range: Arc<Range>,
    oldest_vlsn: SeqNo,
}

/// Outcome of a worker running one task, sent back to the host thread.
pub enum Completion {
    /// A dump finished: the range's frozen mems can be retired in favor of `run`.
    Dumped {
        /// The range the dump ran against.
        range: Arc<Range>,
        /// The newly-written run replacing the range's frozen mems.
        run: Arc<Run>,
    },
    /// A compaction finished: the range's runs collapse into `run`.
    Compacted {
        /// The range the compaction ran against.
        range: Arc<Range>,
        /// The single run replacing the range's prior runs.
        run: Arc<Run>,
    },
    /// A compaction finished by splitting the range into two successors.
    /// `left_id`/`right_id` were already minted (via the index's shared
    /// range-id counter, see [`crate::index::Index::range_id_allocator`])
    /// before the runs were written, since their file names embed them.
    Split {
        /// The range the compaction ran against; still the authoritative
        /// range until the host calls
        /// [`crate::index::Index::complete_split`].
        range: Arc<Range>,
        /// The key at which the range was split: `< split_key` goes left,
        /// `>= split_key` goes right.
        split_key: UserKey,
        /// Id minted for the left child.
        left_id: RangeId,
        /// Id minted for the right child.
        right_id: RangeId,
        /// The left child's sole run.
        left_run: Arc<Run>,
        /// The right child's sole run.
        right_run: Arc<Run>,
    },
    /// A task failed; the scheduler should throttle before trying again.
    Failed {
        /// The range the failed task was running against.
        range: Arc<Range>,
        /// The error the task failed with.
        error: Error,
    },
}

/// Builds the `(range_id).(run_id).run` path a dump/compaction task writes to.
fn run_path(dir: &std::path::Path, range_id: u64, run_id: u64) -> std::path::PathBuf {
    dir.join(format!("{range_id}.{run_id}.run"))
}

/// Checks the split condition for a range about to be compacted: at least
/// one prior compaction, the oldest run at least `4/3` of the range size
/// target, and a median-page key distinct from both the oldest run's own
/// min key and the range's current lower bound (otherwise splitting would
/// produce a degenerate, same-span child).
///
/// Returns the key to split at, if eligible.
fn split_plan(range: &Range, config: &Config) -> Option<UserKey> {
    if range.n_compactions() < 1 {
        return None;
    }

    let runs = range.runs();
    let oldest = runs.last()?;
    let meta = oldest.metadata();

    if meta.total_bytes.saturating_mul(3) < config.range_size.saturating_mul(4) {
        return None;
    }

    let page_count = oldest.page_count();
    if page_count == 0 {
        return None;
    }

    let median_key = oldest.page_index.get(page_count / 2)?.min_key.clone();

    if median_key == meta.min_key {
        return None;
    }

    if let Bound::Included(begin) | Bound::Excluded(begin) = &range.begin {
        if *begin == median_key {
            return None;
        }
    }

    Some(median_key)
}

impl Task {
    fn execute(
        &self,
        config: &Config,
        executor: &dyn UpsertMerge,
        range_ids: &AtomicU64,
    ) -> Result<Completion> {
        let is_last_level = matches!(self.kind, TaskKind::Compaction);

        let split_key = match self.kind {
            TaskKind::Dump => None,
            TaskKind::Compaction => split_plan(&self.range, config),
        };

        let sources = match self.kind {
            TaskKind::Dump => self
                .range
                .frozen_mems()
                .into_iter()
                .map(|mem| mem_iter(&mem, SeqNo::MAX))
                .collect::<Vec<_>>(),
            TaskKind::Compaction => {
                let mut sources = Vec::new();
                if let Some(active) = self.range.active_mem() {
                    sources.push(mem_iter(&active, SeqNo::MAX));
                }
                for mem in self.range.frozen_mems() {
                    sources.push(mem_iter(&mem, SeqNo::MAX));
                }
                for run in self.range.runs() {
                    sources.push(run_iter(run, SeqNo::MAX));
                }
                sources
            }
        };

        let Some(split_key) = split_key else {
            let run_id = self.range.next_run_id();
            let path = run_path(&config.path, self.range.id, run_id);
            let file = crate::fs::StdFileSystem::create(&path)?;

            let mut writer = RunWriter::new(file, config.page_size, config.page_compression);
            for item in write_iter(sources, self.oldest_vlsn, is_last_level, executor) {
                writer.write(item?)?;
            }
            writer.finish()?;

            let run = Arc::new(Run::recover(
                &path,
                self.range.id,
                run_id,
                config.descriptor_table.clone(),
            )?);

            return Ok(match self.kind {
                TaskKind::Dump => Completion::Dumped {
                    range: self.range.clone(),
                    run,
                },
                TaskKind::Compaction => Completion::Compacted {
                    range: self.range.clone(),
                    run,
                },
            });
        };

        // The split's children get fresh range ids up front, since their run
        // files' names embed the final range id they'll be recovered under.
        let left_id = range_ids.fetch_add(1, AtomicOrdering::AcqRel);
        let right_id = range_ids.fetch_add(1, AtomicOrdering::AcqRel);

        let left_path = run_path(&config.path, left_id, 0);
        let right_path = run_path(&config.path, right_id, 0);

        let left_file = crate::fs::StdFileSystem::create(&left_path)?;
        let right_file = crate::fs::StdFileSystem::create(&right_path)?;

        let mut left_writer = RunWriter::new(left_file, config.page_size, config.page_compression);
        let mut right_writer =
            RunWriter::new(right_file, config.page_size, config.page_compression);

        // The merged stream is already sorted by ascending key, so a single
        // pass-through partition suffices.
        for item in write_iter(sources, self.oldest_vlsn, is_last_level, executor) {
            let item = item?;
            if item.key.user_key < split_key {
                left_writer.write(item)?;
            } else {
                right_writer.write(item)?;
            }
        }

        left_writer.finish()?;
        right_writer.finish()?;

        let left_run = Arc::new(Run::recover(
            &left_path,
            left_id,
            0,
            config.descriptor_table.clone(),
        )?);
        let right_run = Arc::new(Run::recover(
            &right_path,
            right_id,
            0,
            config.descriptor_table.clone(),
        )?);

        Ok(Completion::Split {
            range: self.range.clone(),
            split_key,
            left_id,
            right_id,
            left_run,
            right_run,
        })
    }
}

/// Two-heap dump/compaction scheduler: a dump heap keyed by oldest dirty
/// data, a compaction heap keyed by run count, and a small worker pool that
/// drains tasks built from whichever heap the host's main loop decided to
/// pop from.
pub struct Scheduler {
    dump_heap: Mutex<BinaryHeap<DumpEntry>>,
    compact_heap: Mutex<BinaryHeap<CompactEntry>>,

    task_tx: Sender<Task>,
    completion_rx: Receiver<Completion>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stop: StopSignal,

    compact_wm: usize,

    checkpoint_lsn: AtomicU64,
    checkpoint_cond: Condvar,
    checkpoint_mutex: Mutex<()>,

    failure_streak: AtomicU64,
    throttled_until: Mutex<Option<Instant>>,
    last_error: Mutex<Option<String>>,
}

impl Scheduler {
    /// Spawns `config.threads` worker threads, each running tasks popped
    /// from the shared task queue until the returned scheduler is dropped
    /// or [`Scheduler::shutdown`] is called.
    ///
    /// `range_id_allocator` should be the same counter backing the host's
    /// [`crate::index::Index`] (see
    /// [`crate::index::Index::range_id_allocator`]), so ids a worker mints
    /// for a compaction split's children never collide with ids the index
    /// mints directly.
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        executor: Arc<dyn UpsertMerge>,
        range_id_allocator: Arc<AtomicU64>,
    ) -> Self {
        let (task_tx, task_rx) = crossbeam_channel::unbounded::<Task>();
        let (completion_tx, completion_rx) = crossbeam_channel::unbounded::<Completion>();
        let stop = StopSignal::default();

        let workers = (0..config.threads)
            .map(|id| {
                let task_rx = task_rx.clone();
                let completion_tx = completion_tx.clone();
                let config = config.clone();
                let executor = executor.clone();
                let range_ids = range_id_allocator.clone();
                let stop = stop.clone();

                std::thread::Builder::new()
                    .name(format!("lsm-tree-worker-{id}"))
                    .spawn(move || {
                        worker_loop(&task_rx, &completion_tx, &config, &*executor, &range_ids, &stop)
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self {
            dump_heap: Mutex::new(BinaryHeap::new()),
            compact_heap: Mutex::new(BinaryHeap::new()),
            task_tx,
            completion_rx,
            workers: Mutex::new(workers),
            stop,
            compact_wm: config.compact_wm,
            checkpoint_lsn: AtomicU64::new(0),
            checkpoint_cond: Condvar::new(),
            checkpoint_mutex: Mutex::new(()),
            failure_streak: AtomicU64::new(0),
            throttled_until: Mutex::new(None),
            last_error: Mutex::new(None),
        }
    }

    /// Registers (or re-registers) `range` as a dump candidate, per its
    /// current `min_lsn`. Call whenever a range's mem is frozen.
    pub fn notify_dirty(&self, range: Arc<Range>) {
        let Some(min_lsn) = range.min_lsn() else {
            return;
        };

        self.dump_heap
            .lock()
            .expect("lock is poisoned")
            .push(DumpEntry { min_lsn, range });
    }

    /// Registers (or re-registers) `range` as a compaction candidate, per
    /// its current run count. Call whenever a dump completes.
    pub fn notify_run_added(&self, range: Arc<Range>) {
        let run_count = range.runs().len();

        self.compact_heap
            .lock()
            .expect("lock is poisoned")
            .push(CompactEntry { run_count, range });
    }

    /// Returns `true` if the scheduler is currently throttled after a task
    /// failure, and thus should not have new tasks submitted.
    #[must_use]
    pub fn is_throttled(&self) -> bool {
        match *self.throttled_until.lock().expect("lock is poisoned") {
            Some(until) => Instant::now() < until,
            None => false,
        }
    }

    /// The last error surfaced by a failed task, if the scheduler is (or was
    /// last) throttled because of one.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().expect("lock is poisoned").clone()
    }

    /// Main-loop step: decide whether to pop the dump heap or the compaction
    /// heap, and submit a task for the winner. `quota_saturated` and
    /// `oldest_vlsn` are supplied by the caller (quota and transaction
    /// manager, respectively). Returns `false` if there was nothing to do.
    pub fn tick(&self, quota_saturated: bool, oldest_vlsn: SeqNo) -> bool {
        if self.is_throttled() {
            return false;
        }

        let dirty_below_checkpoint = {
            let heap = self.dump_heap.lock().expect("lock is poisoned");
            heap.peek()
                .is_some_and(|e| e.min_lsn <= self.checkpoint_lsn.load(AtomicOrdering::Acquire))
        };

        if quota_saturated || dirty_below_checkpoint {
            if let Some(entry) = self.dump_heap.lock().expect("lock is poisoned").pop() {
                self.submit(TaskKind::Dump, entry.range, oldest_vlsn);
                return true;
            }
        }

        let top_run_count = self
            .compact_heap
            .lock()
            .expect("lock is poisoned")
            .peek()
            .map(|e| e.run_count);

        if top_run_count.is_some_and(|n| n >= self.compact_wm) {
            if let Some(entry) = self.compact_heap.lock().expect("lock is poisoned").pop() {
                self.submit(TaskKind::Compaction, entry.range, oldest_vlsn);
                return true;
            }
        }

        false
    }

    fn submit(&self, kind: TaskKind, range: Arc<Range>, oldest_vlsn: SeqNo) {
        let task = Task {
            kind,
            range,
            oldest_vlsn,
        };

        // The queue is unbounded and workers never block on it, so a send
        // can only fail if every worker thread has already exited.
        let _ = self.task_tx.send(task);
    }

    /// Drains and returns all completions posted by workers since the last
    /// call, applying neither success nor failure side effects - the caller
    /// (which owns the index) is responsible for calling
    /// [`Range::complete_dump`]/[`Range::complete_compaction`] and
    /// re-registering the range via [`Scheduler::notify_dirty`]/
    /// [`Scheduler::notify_run_added`].
    pub fn poll_completions(&self) -> Vec<Completion> {
        let mut out = Vec::new();

        while let Ok(completion) = self.completion_rx.try_recv() {
            if let Completion::Failed { ref error, .. } = completion {
                self.on_failure(error);
            } else {
                self.on_success();
            }

            out.push(completion);
        }

        out
    }

    fn on_success(&self) {
        self.failure_streak.store(0, AtomicOrdering::Release);
        *self.throttled_until.lock().expect("lock is poisoned") = None;
        self.checkpoint_cond.notify_all();
    }

    fn on_failure(&self, error: &Error) {
        let streak = self.failure_streak.fetch_add(1, AtomicOrdering::AcqRel);
        let exponent = u32::try_from(streak.min(6)).unwrap_or(6);
        let delay = THROTTLE_MIN.saturating_mul(1u32 << exponent).min(THROTTLE_MAX);

        *self.throttled_until.lock().expect("lock is poisoned") = Some(Instant::now() + delay);
        *self.last_error.lock().expect("lock is poisoned") = Some(format!("{error:?}"));

        log::warn!("Scheduler task failed, throttling for {delay:?}: {error:?}");

        // A pending checkpoint must be signaled regardless of throttling, so
        // a waiter sees the failure instead of hanging forever.
        self.checkpoint_cond.notify_all();
    }

    /// Requests a checkpoint at the current `lsn`, blocking until every mem
    /// dirtier than `lsn` has been dumped, or the scheduler is throttled (in
    /// which case the last task error is returned).
    ///
    /// # Errors
    ///
    /// Returns the last scheduler error if a task failure throttles progress
    /// before the checkpoint condition is met.
    pub fn checkpoint(&self, lsn: SeqNo, dirty_floor: impl Fn() -> Option<SeqNo>) -> Result<()> {
        self.checkpoint_lsn.store(lsn, AtomicOrdering::Release);

        let guard = self.checkpoint_mutex.lock().expect("lock is poisoned");

        let (_guard, timed_out) = self
            .checkpoint_cond
            .wait_timeout_while(guard, Duration::from_secs(60), |_: &mut ()| {
                let floor_ok = dirty_floor().is_none_or(|floor| floor > lsn);
                !floor_ok && !self.is_throttled()
            })
            .expect("lock is poisoned");

        if self.is_throttled() {
            return Err(Error::Unrecoverable);
        }

        if timed_out.timed_out() {
            log::warn!("Checkpoint wait timed out after 60s");
        }

        Ok(())
    }

    /// Signals every worker thread to exit once its current task completes,
    /// then joins them.
    pub fn shutdown(&self) {
        self.stop.send();

        for handle in self.workers.lock().expect("lock is poisoned").drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    task_rx: &Receiver<Task>,
    completion_tx: &Sender<Completion>,
    config: &Config,
    executor: &dyn UpsertMerge,
    range_ids: &AtomicU64,
    stop: &StopSignal,
) {
    while let Ok(task) = task_rx.recv_timeout(Duration::from_millis(250)) {
        let range = task.range.clone();

        let completion = match task.execute(config, executor, range_ids) {
            Ok(completion) => completion,
            Err(error) => Completion::Failed { range, error },
        };

        if completion_tx.send(completion).is_err() {
            break;
        }

        if stop.is_stopped() {
            break;
        }
    }
}
