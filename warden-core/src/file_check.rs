//! File occupancy detection: which other processes hold open the files a
//! guarded target depends on.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::proc_source::{is_special_path, normalize_path, ProcessSource};

/// One process found sharing a file with a guarded target.
#[derive(Debug, Clone)]
pub struct FileConflict {
    pub pid: i32,
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone)]
struct Opener {
    pid: i32,
    name: String,
}

/// Snapshot-based checker. `refresh` walks every process's open-file table
/// and indexes path → openers; queries then run against the snapshot, which
/// is intentionally stale up to the caller's refresh interval — open-file
/// enumeration is far too heavy for the per-second path.
pub struct FileChecker {
    source: Arc<dyn ProcessSource>,
    index: RwLock<HashMap<String, Vec<Opener>>>,
}

impl FileChecker {
    pub fn new(source: Arc<dyn ProcessSource>) -> Self {
        Self {
            source,
            index: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuilds the snapshot. `exclude` (the guarded set) is enumerated too
    /// — their rows are filtered at query time, but the paths they open are
    /// what conflicts are matched against.
    pub fn refresh(&self) {
        let Ok(procs) = self.source.list_all() else {
            return;
        };

        let mut index: HashMap<String, Vec<Opener>> = HashMap::new();
        for proc_ in &procs {
            if proc_.pid == 0 {
                continue;
            }
            let name = if proc_.name.is_empty() {
                "unknown".to_string()
            } else {
                proc_.name.clone()
            };
            for path in self.source.open_files(proc_.pid) {
                index.entry(path).or_default().push(Opener {
                    pid: proc_.pid,
                    name: name.clone(),
                });
            }
        }
        *self.index.write() = index;
    }

    /// Files `pid` holds open, normalized and filtered — the auto-discovery
    /// input for a guarded target's watch set.
    pub fn files_opened_by(&self, pid: i32) -> Vec<String> {
        self.source.open_files(pid)
    }

    /// Intersects the target's file list with the snapshot. Deduplicates by
    /// `(pid, path)`; the target itself and `exclude` members never appear.
    pub fn find_conflicts(
        &self,
        target_pid: i32,
        target_files: &[String],
        exclude: &HashSet<i32>,
    ) -> Vec<FileConflict> {
        let index = self.index.read();
        let mut seen: HashSet<(i32, String)> = HashSet::new();
        let mut out = Vec::new();

        for path in target_files {
            let Some(openers) = index.get(path.as_str()) else {
                continue;
            };
            for opener in openers {
                if opener.pid == target_pid || exclude.contains(&opener.pid) {
                    continue;
                }
                if !seen.insert((opener.pid, path.clone())) {
                    continue;
                }
                out.push(FileConflict {
                    pid: opener.pid,
                    name: opener.name.clone(),
                    path: path.clone(),
                });
            }
        }
        out
    }

    /// Single-file form for callers that maintain their own target list.
    pub fn check_file(&self, path: &str, exclude_pid: i32) -> Vec<FileConflict> {
        let path = normalize_path(path);
        if path.is_empty() || is_special_path(&path) {
            return Vec::new();
        }
        let index = self.index.read();
        let Some(openers) = index.get(&path) else {
            return Vec::new();
        };
        openers
            .iter()
            .filter(|o| o.pid != exclude_pid)
            .map(|o| FileConflict {
                pid: o.pid,
                name: o.name.clone(),
                path: path.clone(),
            })
            .collect()
    }

    pub fn indexed_paths(&self) -> usize {
        self.index.read().len()
    }
}
