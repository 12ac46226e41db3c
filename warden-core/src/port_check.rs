//! Port occupancy queries: who listens on, or is connected to, a port the
//! operator cares about.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::proc_source::{ConnectionEntry, ProcessSource};

const NAME_CACHE_CAP: usize = 500;

/// One process found occupying a probed port.
#[derive(Debug, Clone)]
pub struct PortConflict {
    pub pid: i32,
    pub name: String,
    pub port: u16,
    pub status: String,
}

/// Small insertion-bounded LRU used to amortize PID → name lookups across
/// repeated checks.
struct NameCache {
    map: HashMap<i32, String>,
    order: VecDeque<i32>,
    cap: usize,
}

impl NameCache {
    fn new(cap: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    fn get(&mut self, pid: i32) -> Option<String> {
        if let Some(name) = self.map.get(&pid).cloned() {
            // Refresh recency.
            self.order.retain(|p| *p != pid);
            self.order.push_back(pid);
            Some(name)
        } else {
            None
        }
    }

    fn insert(&mut self, pid: i32, name: String) {
        if self.map.len() >= self.cap && !self.map.contains_key(&pid) {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            }
        }
        self.order.retain(|p| *p != pid);
        self.order.push_back(pid);
        self.map.insert(pid, name);
    }
}

pub struct PortChecker {
    source: Arc<dyn ProcessSource>,
    names: Mutex<NameCache>,
}

impl PortChecker {
    pub fn new(source: Arc<dyn ProcessSource>) -> Self {
        Self {
            source,
            names: Mutex::new(NameCache::new(NAME_CACHE_CAP)),
        }
    }

    fn process_name(&self, pid: i32) -> String {
        if let Some(name) = self.names.lock().get(pid) {
            return name;
        }
        let name = self
            .source
            .probe(pid)
            .map(|p| p.name)
            .unwrap_or_else(|_| "unknown".into());
        self.names.lock().insert(pid, name.clone());
        name
    }

    /// Connection rows relevant to conflict reporting: kernel rows are
    /// dropped, only LISTEN and ESTABLISHED survive.
    fn reportable(conn: &ConnectionEntry) -> bool {
        conn.pid != 0 && (conn.status == "LISTEN" || conn.status == "ESTABLISHED")
    }

    /// One connection enumeration for callers that probe many ports against
    /// the same table. `None` when the platform query fails; the caller is
    /// expected to skip its pass and retry next tick.
    pub fn snapshot(&self) -> Option<Vec<ConnectionEntry>> {
        self.source.all_connections().ok()
    }

    /// Every distinct process outside `exclude` whose connection touches
    /// `port` on either end.
    pub fn check_port(&self, port: u16, exclude: &HashSet<i32>) -> Vec<PortConflict> {
        let Ok(conns) = self.source.all_connections() else {
            return Vec::new();
        };
        self.conflicts_in(&conns, port, exclude)
    }

    /// Batch form: one connection enumeration, results indexed by port.
    pub fn check_ports(
        &self,
        ports: &[u16],
        exclude: &HashSet<i32>,
    ) -> HashMap<u16, Vec<PortConflict>> {
        let mut result: HashMap<u16, Vec<PortConflict>> =
            ports.iter().map(|p| (*p, Vec::new())).collect();
        let Ok(conns) = self.source.all_connections() else {
            return result;
        };
        for port in ports {
            result.insert(*port, self.conflicts_in(&conns, *port, exclude));
        }
        result
    }

    /// Conflict scan against an already-enumerated connection table.
    pub fn conflicts_in(
        &self,
        conns: &[ConnectionEntry],
        port: u16,
        exclude: &HashSet<i32>,
    ) -> Vec<PortConflict> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for conn in conns {
            if conn.local_port != port && conn.remote_port != port {
                continue;
            }
            if !Self::reportable(conn) || exclude.contains(&conn.pid) {
                continue;
            }
            if !seen.insert(conn.pid) {
                continue;
            }
            out.push(PortConflict {
                pid: conn.pid,
                name: self.process_name(conn.pid),
                port,
                status: conn.status.clone(),
            });
        }
        out
    }

    /// Ports `pid` currently listens on.
    pub fn listening_ports(&self, pid: i32) -> Vec<u16> {
        self.source.listening_ports(pid)
    }
}
