//! Process appearance/disappearance tracking by snapshot diffing.

use chrono::Utc;
use std::collections::HashMap;

use crate::ring::RingBuffer;
use crate::types::{ChangeKind, ProcessChange, ProcessInfo};

/// Diffs successive process snapshots into `new`/`gone` changes. The first
/// update after construction is a cold start and emits nothing — a freshly
/// started agent would otherwise report every process on the host as new.
pub struct ProcessTracker {
    last: HashMap<i32, (String, String)>,
    changes: RingBuffer<ProcessChange>,
    first_run: bool,
}

impl ProcessTracker {
    pub fn new(buffer_len: usize) -> Self {
        Self {
            last: HashMap::new(),
            changes: RingBuffer::new(buffer_len.max(1)),
            first_run: true,
        }
    }

    /// Replaces the snapshot and returns the observed transitions, which
    /// are also appended to the internal ring.
    pub fn update(&mut self, current: &[ProcessInfo]) -> Vec<ProcessChange> {
        let now = Utc::now();
        let mut changes = Vec::new();
        let mut next = HashMap::with_capacity(current.len());

        for proc_ in current {
            next.insert(proc_.pid, (proc_.name.clone(), proc_.cmdline.clone()));
            if !self.last.contains_key(&proc_.pid) && !self.first_run {
                changes.push(ProcessChange {
                    timestamp: now,
                    kind: ChangeKind::New,
                    pid: proc_.pid,
                    name: proc_.name.clone(),
                    cmdline: proc_.cmdline.clone(),
                });
            }
        }

        for (pid, (name, cmdline)) in &self.last {
            if !next.contains_key(pid) {
                changes.push(ProcessChange {
                    timestamp: now,
                    kind: ChangeKind::Gone,
                    pid: *pid,
                    name: name.clone(),
                    cmdline: cmdline.clone(),
                });
            }
        }

        for change in &changes {
            self.changes.push(change.clone());
        }

        self.last = next;
        self.first_run = false;
        changes
    }

    pub fn recent_changes(&self, n: usize) -> Vec<ProcessChange> {
        self.changes.recent(n)
    }

    pub fn snapshot_len(&self) -> usize {
        self.last.len()
    }
}
