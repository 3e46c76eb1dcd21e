// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Rebuilds an [`Index`] from the run files left on disk, and garbage
//! collects files that no longer belong to any live range.
//!
//! Run files are named `<range_id>.<run_id>.run`. Unlike a manifest-based
//! engine, a range's key bounds are never persisted directly - they are
//! reconstructed from the union of its runs' `[min_key, max_key]` spans,
//! then stitched against neighboring ranges so the tree tiles the whole key
//! space with no gaps.

use crate::{
    descriptor_table::FileDescriptorTable,
    fs::{FileSystem, StdFileSystem},
    index::Index,
    range::Range,
    run::{id::RangeId, Run},
    Error, Result, UserKey,
};
use std::{
    collections::BTreeMap,
    ops::Bound,
    path::{Path, PathBuf},
    sync::Arc,
};

struct RunDescriptor {
    range_id: RangeId,
    run_id: u64,
    path: PathBuf,
}

/// Parses a `<range_id>.<run_id>.run` file name. Returns `None` for anything
/// else found in the directory (stray files are left alone).
fn parse_run_file(path: &Path) -> Option<RunDescriptor> {
    let name = path.file_name()?.to_str()?;
    let mut parts = name.split('.');

    let range_id = parts.next()?.parse().ok()?;
    let run_id = parts.next()?.parse().ok()?;

    if parts.next() != Some("run") || parts.next().is_some() {
        return None;
    }

    Some(RunDescriptor {
        range_id,
        run_id,
        path: path.to_path_buf(),
    })
}

struct RangeSpan {
    range_id: RangeId,
    min_key: UserKey,
    max_key: UserKey,
    /// Newest first, matching [`Range::runs`]'s convention.
    runs: Vec<Arc<Run>>,
}

impl RangeSpan {
    fn overlaps(&self, other: &Self) -> bool {
        self.min_key <= other.max_key && other.min_key <= self.max_key
    }
}

fn scan_run_files(dir: &Path) -> Result<Vec<RunDescriptor>> {
    Ok(StdFileSystem::read_dir(dir)?
        .into_iter()
        .filter(|entry| !entry.is_dir())
        .filter_map(|entry| parse_run_file(entry.path()))
        .collect())
}

fn load_range(
    range_id: RangeId,
    mut descriptors: Vec<RunDescriptor>,
    descriptor_table: &Arc<FileDescriptorTable>,
) -> Result<RangeSpan> {
    descriptors.sort_by_key(|d| d.run_id);

    for (expected, descriptor) in descriptors.iter().enumerate() {
        #[allow(clippy::cast_possible_truncation)]
        if descriptor.run_id != expected as u64 {
            log::error!(
                "range {range_id} is missing run {expected}, found {} runs on disk",
                descriptors.len()
            );
            return Err(Error::Unrecoverable);
        }
    }

    let mut runs = Vec::with_capacity(descriptors.len());
    for descriptor in &descriptors {
        let run = Run::recover(
            &descriptor.path,
            range_id,
            descriptor.run_id,
            descriptor_table.clone(),
        )?;
        runs.push(Arc::new(run));
    }

    let min_key = runs
        .iter()
        .map(|r| r.metadata().min_key.clone())
        .min()
        .ok_or(Error::Unrecoverable)?;
    let max_key = runs
        .iter()
        .map(|r| r.metadata().max_key.clone())
        .max()
        .ok_or(Error::Unrecoverable)?;

    // Newest run has the highest id; `Range::runs` expects newest first.
    runs.reverse();

    Ok(RangeSpan {
        range_id,
        min_key,
        max_key,
        runs,
    })
}

/// Drops ranges whose key span is already fully covered by a more recently
/// created range, per the "prefer newest range ids, discard older overlaps"
/// rule for a range left over from a compaction split that crashed before
/// its predecessor's files were unlinked.
fn resolve_overlaps(mut spans: Vec<RangeSpan>) -> Vec<RangeSpan> {
    spans.sort_by_key(|s| std::cmp::Reverse(s.range_id));

    let mut accepted: Vec<RangeSpan> = Vec::new();

    for span in spans {
        if accepted.iter().any(|a| a.overlaps(&span)) {
            log::warn!(
                "range {} overlaps a more recent range, discarding as a stale compaction predecessor",
                span.range_id
            );
            continue;
        }

        accepted.push(span);
    }

    accepted.sort_by(|a, b| a.min_key.cmp(&b.min_key));
    accepted
}

/// Rebuilds an [`Index`] from the run files found under `dir`.
///
/// # Errors
///
/// Returns [`Error::Unrecoverable`] if a range is missing an expected run
/// file, or if an underlying run file fails to open or validate.
pub fn recover(dir: &Path, descriptor_table: &Arc<FileDescriptorTable>) -> Result<Index> {
    let descriptors = scan_run_files(dir)?;

    let mut by_range: BTreeMap<RangeId, Vec<RunDescriptor>> = BTreeMap::new();
    for descriptor in descriptors {
        by_range.entry(descriptor.range_id).or_default().push(descriptor);
    }

    let mut spans = Vec::with_capacity(by_range.len());
    for (range_id, descriptors) in by_range {
        spans.push(load_range(range_id, descriptors, descriptor_table)?);
    }

    if spans.is_empty() {
        return Ok(Index::new());
    }

    let spans = resolve_overlaps(spans);
    let n = spans.len();

    let mut ranges = Vec::with_capacity(n);

    for (i, span) in spans.into_iter().enumerate() {
        let begin = if i == 0 {
            Bound::Unbounded
        } else {
            Bound::Included(span.min_key.clone())
        };

        let range = Arc::new(Range::new(span.range_id, begin, Bound::Unbounded));
        let run_count = span.runs.len();

        #[allow(clippy::cast_possible_truncation)]
        let next_run_id = run_count as u64;
        range.recover_runs(span.runs, next_run_id);

        ranges.push(range);
    }

    // Second pass: each range's `end` is its successor's `begin`; the last
    // range's `end` stays `Unbounded` (already set above).
    for i in 0..n.saturating_sub(1) {
        let Some(next_begin) = (match &ranges[i + 1].begin {
            Bound::Included(key) | Bound::Excluded(key) => Some(key.clone()),
            Bound::Unbounded => None,
        }) else {
            continue;
        };

        ranges[i] = Arc::new(Range::new(
            ranges[i].id,
            ranges[i].begin.clone(),
            Bound::Excluded(next_begin),
        ));
    }

    Ok(Index::from_ranges(ranges))
}

/// Unlinks every run file under `dir` that does not belong to a range
/// currently present in `index`. Safe to run only after a successful
/// checkpoint, since it trusts `index` as the complete set of live ranges.
///
/// # Errors
///
/// Returns an error if the directory cannot be scanned or a stale file
/// cannot be removed.
pub fn gc(dir: &Path, index: &Index) -> Result<usize> {
    let live: std::collections::HashSet<RangeId> = index.ranges().iter().map(|r| r.id).collect();

    let mut removed = 0;
    for descriptor in scan_run_files(dir)? {
        if !live.contains(&descriptor.range_id) {
            log::info!("gc: removing orphaned run file {:?}", descriptor.path);
            StdFileSystem::remove_file(&descriptor.path)?;
            removed += 1;
        }
    }

    Ok(removed)
}
