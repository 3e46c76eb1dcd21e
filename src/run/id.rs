// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Identifies a range (a contiguous partition of the keyspace) within the engine.
pub type RangeId = u64;

/// Identifies a single run within its owning range.
///
/// Run file names embed both IDs: `<range_id>.<run_id>.run`.
pub type RunId = u64;

/// Globally unique ID of a run, used as a cache/descriptor-table key.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct GlobalRunId(RangeId, RunId);

impl GlobalRunId {
    /// Returns the owning range's ID.
    #[must_use]
    pub fn range_id(&self) -> RangeId {
        self.0
    }

    /// Returns the run's ID, unique within its range.
    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.1
    }
}

impl From<(RangeId, RunId)> for GlobalRunId {
    fn from((range_id, run_id): (RangeId, RunId)) -> Self {
        Self(range_id, run_id)
    }
}

impl std::fmt::Display for GlobalRunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.0, self.1)
    }
}
