//! Student/teacher weight merging.
//!
//! The student's weights are copied in full under the target prefix, then
//! every teacher weight is classified into exactly one bucket:
//!
//! 1. **replaced**: under the replace prefix, superseded by the student
//! 2. **skipped**: under a skip prefix, or colliding with a key already
//!    placed (the student copy wins)
//! 3. **appended**: copied through unchanged
//!
//! Tensors are never read or copied; only handles move.

use graft_core::{PrefixSpec, StateDict};
use tracing::trace;

use crate::NormalizedPrefixes;

/// Why a teacher weight was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Key falls under a skip prefix.
    Prefix,
    /// Key already present in the merged dict.
    Collision,
}

/// What happened to a single teacher weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeacherDisposition {
    /// Superseded by the student.
    Replaced,
    /// Dropped.
    Skipped(SkipReason),
    /// Copied into the merged dict.
    Appended,
}

/// Counters describing a merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Teacher weights dropped by a skip prefix or a key collision.
    pub skipped: usize,
    /// Teacher weights superseded by the student.
    pub replaced: usize,
    /// Teacher weights copied through.
    pub appended: usize,
    /// Student weights copied in.
    pub student: usize,
}

impl MergeStats {
    /// Number of teacher weights classified. Always equals the teacher's size.
    pub fn teacher_total(&self) -> usize {
        self.skipped + self.replaced + self.appended
    }

    fn record(&mut self, disposition: TeacherDisposition) {
        match disposition {
            TeacherDisposition::Replaced => self.replaced += 1,
            TeacherDisposition::Skipped(_) => self.skipped += 1,
            TeacherDisposition::Appended => self.appended += 1,
        }
    }
}

/// Merged state dict and its accounting.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// The merged weights.
    pub merged: StateDict,
    /// Merge counters.
    pub stats: MergeStats,
}

impl MergeOutcome {
    /// The `(merged, skipped, replaced, appended)` tuple.
    pub fn into_parts(self) -> (StateDict, usize, usize, usize) {
        (
            self.merged,
            self.stats.skipped,
            self.stats.replaced,
            self.stats.appended,
        )
    }
}

/// Merger with prefixes normalized once, reusable across many students.
#[derive(Debug, Clone)]
pub struct WeightMerger {
    prefixes: NormalizedPrefixes,
}

impl WeightMerger {
    /// Create a merger for the given prefix rules.
    pub fn new(spec: &PrefixSpec) -> Self {
        Self {
            prefixes: NormalizedPrefixes::new(spec),
        }
    }

    /// The normalized prefixes in effect.
    pub fn prefixes(&self) -> &NormalizedPrefixes {
        &self.prefixes
    }

    /// Merge `student` into `teacher`. Neither input is modified.
    pub fn merge(&self, student: &StateDict, teacher: &StateDict) -> MergeOutcome {
        let mut merged: StateDict = student
            .iter()
            .map(|(key, value)| (self.prefixes.rewrite_student_key(key), value.clone()))
            .collect();

        let mut stats = MergeStats {
            student: student.len(),
            ..MergeStats::default()
        };

        for (key, value) in teacher {
            let disposition = self.classify(key, &merged);
            trace!(key = %key, ?disposition, "Teacher weight");
            if disposition == TeacherDisposition::Appended {
                merged.insert(key.clone(), value.clone());
            }
            stats.record(disposition);
        }

        MergeOutcome { merged, stats }
    }

    /// Classify a teacher key against the weights placed so far.
    pub fn classify(&self, key: &str, merged: &StateDict) -> TeacherDisposition {
        if self.prefixes.is_replaced(key) {
            TeacherDisposition::Replaced
        } else if self.prefixes.skip_match(key).is_some() {
            TeacherDisposition::Skipped(SkipReason::Prefix)
        } else if merged.contains_key(key) {
            TeacherDisposition::Skipped(SkipReason::Collision)
        } else {
            TeacherDisposition::Appended
        }
    }
}

/// One-shot merge of a student state dict into a teacher state dict.
pub fn merge_state_dicts(student: &StateDict, teacher: &StateDict, spec: &PrefixSpec) -> MergeOutcome {
    WeightMerger::new(spec).merge(student, teacher)
}
