// QuillDB
// Copyright (C) 2025 QuillDB contributors

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Deadlock Detection and Resolution
//!
//! A wait-for graph over transactions, checked synchronously whenever an
//! edge is added and periodically by a background service. Detection
//! snapshots the graph under the lock and runs DFS outside it, collecting
//! every simple cycle; the youngest transaction in a cycle (latest start
//! time) is selected as the victim.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// A wait-for relationship between two transactions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitForEdge {
    /// Transaction that is waiting
    pub waiter: String,
    /// Transaction that is being waited for
    pub holder: String,
    /// Resource being waited for
    pub resource: String,
}

/// A cycle in the wait-for graph representing a deadlock
#[derive(Debug, Clone)]
pub struct DeadlockCycle {
    /// Transactions involved, in cycle order
    pub transactions: Vec<String>,
    /// Resources involved in the cycle
    pub resources: Vec<String>,
}

/// Statistics about deadlock detection
#[derive(Debug, Clone, Default)]
pub struct DeadlockStatistics {
    pub deadlocks_detected: u64,
    pub victims_aborted: u64,
    pub active_edges: usize,
}

/// The adjacency structure, snapshotted before each detection run
#[derive(Debug, Clone, Default)]
struct WaitForGraph {
    /// waiter -> (holder -> edge)
    edges: HashMap<String, HashMap<String, WaitForEdge>>,
}

impl WaitForGraph {
    fn add_edge(&mut self, edge: WaitForEdge) {
        self.edges.entry(edge.waiter.clone()).or_default().insert(edge.holder.clone(), edge);
    }

    fn remove_waiter(&mut self, waiter: &str) {
        self.edges.remove(waiter);
    }

    fn remove_transaction(&mut self, tx_id: &str) {
        self.edges.remove(tx_id);
        for holders in self.edges.values_mut() {
            holders.remove(tx_id);
        }
        self.edges.retain(|_, holders| !holders.is_empty());
    }

    fn edge_count(&self) -> usize {
        self.edges.values().map(|h| h.len()).sum()
    }

    fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Collect every simple cycle via DFS with a per-branch path list.
    /// Cycles are deduplicated by their rotated-to-minimum sequence.
    fn detect_cycles(&self) -> Vec<DeadlockCycle> {
        let mut cycles = Vec::new();
        let mut seen: HashSet<Vec<String>> = HashSet::new();

        for start in self.edges.keys() {
            let mut path = Vec::new();
            self.dfs(start, &mut path, &mut cycles, &mut seen);
        }

        cycles
    }

    fn dfs(&self, node: &str, path: &mut Vec<String>, cycles: &mut Vec<DeadlockCycle>, seen: &mut HashSet<Vec<String>>) {
        if let Some(position) = path.iter().position(|p| p == node) {
            let cycle: Vec<String> = path[position..].to_vec();
            let normalized = Self::normalize(&cycle);
            if seen.insert(normalized) {
                let resources = self.cycle_resources(&cycle);
                cycles.push(DeadlockCycle {
                    transactions: cycle,
                    resources,
                });
            }
            return;
        }

        let Some(holders) = self.edges.get(node) else {
            return;
        };

        path.push(node.to_string());
        for holder in holders.keys() {
            self.dfs(holder, path, cycles, seen);
        }
        path.pop();
    }

    /// Rotate a cycle so its smallest member comes first, making sequence
    /// equality independent of the DFS entry point
    fn normalize(cycle: &[String]) -> Vec<String> {
        let Some(min_index) = cycle.iter().enumerate().min_by(|a, b| a.1.cmp(b.1)).map(|(i, _)| i) else {
            return Vec::new();
        };
        let mut rotated = Vec::with_capacity(cycle.len());
        rotated.extend_from_slice(&cycle[min_index..]);
        rotated.extend_from_slice(&cycle[..min_index]);
        rotated
    }

    fn cycle_resources(&self, transactions: &[String]) -> Vec<String> {
        let members: HashSet<&String> = transactions.iter().collect();
        let mut resources = HashSet::new();

        for tx in transactions {
            if let Some(holders) = self.edges.get(tx) {
                for (holder, edge) in holders {
                    if members.contains(holder) {
                        resources.insert(edge.resource.clone());
                    }
                }
            }
        }

        let mut resources: Vec<String> = resources.into_iter().collect();
        resources.sort();
        resources
    }
}

/// Callback invoked with the cycle and the chosen victim
pub type VictimHandler = Box<dyn Fn(&DeadlockCycle, &str) + Send + Sync>;

/// DeadlockDetector owns the wait-for graph and victim selection.
pub struct DeadlockDetector {
    graph: RwLock<WaitForGraph>,
    /// Start times used to find the youngest transaction in a cycle
    start_times: RwLock<HashMap<String, u64>>,
    statistics: Mutex<DeadlockStatistics>,
    detection_interval: Duration,
    on_victim: RwLock<Option<VictimHandler>>,
    /// Guards against overlapping detection runs
    detecting: AtomicBool,
}

impl DeadlockDetector {
    pub fn new(detection_interval: Duration) -> Self {
        Self {
            graph: RwLock::new(WaitForGraph::default()),
            start_times: RwLock::new(HashMap::new()),
            statistics: Mutex::new(DeadlockStatistics::default()),
            detection_interval,
            on_victim: RwLock::new(None),
            detecting: AtomicBool::new(false),
        }
    }

    /// Install the sink notified when a victim is selected
    pub fn set_victim_handler(&self, handler: VictimHandler) {
        *self.on_victim.write().unwrap() = Some(handler);
    }

    /// Remember a transaction's start time for victim selection
    pub fn register_transaction(&self, tx_id: &str, start_time: u64) {
        self.start_times.write().unwrap().insert(tx_id.to_string(), start_time);
    }

    /// Forget a transaction entirely: its start time and all of its edges
    pub fn remove_transaction(&self, tx_id: &str) {
        self.start_times.write().unwrap().remove(tx_id);
        let mut graph = self.graph.write().unwrap();
        graph.remove_transaction(tx_id);
        self.statistics.lock().unwrap().active_edges = graph.edge_count();
    }

    /// Add `waiter -> holder` edges for every current holder, then run a
    /// synchronous detection pass.
    pub fn add_wait_edges(&self, waiter: &str, holders: &[String], resource: &str) {
        {
            let mut graph = self.graph.write().unwrap();
            for holder in holders {
                if holder != waiter {
                    graph.add_edge(WaitForEdge {
                        waiter: waiter.to_string(),
                        holder: holder.clone(),
                        resource: resource.to_string(),
                    });
                }
            }
            self.statistics.lock().unwrap().active_edges = graph.edge_count();
        }

        self.detect_and_resolve();
    }

    /// Drop every edge the waiter added; called on grant, timeout and
    /// cancellation.
    pub fn remove_wait_edges(&self, waiter: &str) {
        let mut graph = self.graph.write().unwrap();
        graph.remove_waiter(waiter);
        self.statistics.lock().unwrap().active_edges = graph.edge_count();
    }

    /// Whether a detection pass would have anything to look at
    pub fn has_edges(&self) -> bool {
        !self.graph.read().unwrap().is_empty()
    }

    pub fn detection_interval(&self) -> Duration {
        self.detection_interval
    }

    /// Snapshot the graph, detect all cycles, select victims and notify the
    /// sink. Returns the victims chosen in this pass.
    pub fn detect_and_resolve(&self) -> Vec<String> {
        // Snapshot-then-detect keeps runs from overlapping and from holding
        // the graph lock during DFS
        if self.detecting.swap(true, Ordering::Acquire) {
            return Vec::new();
        }

        let snapshot = self.graph.read().unwrap().clone();
        let cycles = snapshot.detect_cycles();

        let mut victims = Vec::new();
        if !cycles.is_empty() {
            let start_times = self.start_times.read().unwrap();
            let mut stats = self.statistics.lock().unwrap();

            for cycle in &cycles {
                stats.deadlocks_detected += 1;
                let victim = self.youngest(&cycle.transactions, &start_times);
                tracing::warn!(victim = %victim, cycle = ?cycle.transactions, "deadlock detected");
                stats.victims_aborted += 1;
                victims.push((cycle.clone(), victim));
            }
        }

        self.detecting.store(false, Ordering::Release);

        let handler = self.on_victim.read().unwrap();
        let mut chosen = Vec::new();
        for (cycle, victim) in victims {
            if let Some(handler) = handler.as_ref() {
                handler(&cycle, &victim);
            }
            chosen.push(victim);
        }
        chosen
    }

    /// The youngest transaction is the one with the latest start time;
    /// ties break on the id so selection is deterministic.
    fn youngest(&self, transactions: &[String], start_times: &HashMap<String, u64>) -> String {
        transactions
            .iter()
            .max_by_key(|tx| (start_times.get(*tx).copied().unwrap_or(0), (*tx).clone()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn statistics(&self) -> DeadlockStatistics {
        self.statistics.lock().unwrap().clone()
    }
}

/// Background service running periodic detection, owned by the database and
/// stopped deterministically on close.
pub struct DeadlockDetectionService {
    detector: Arc<DeadlockDetector>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl DeadlockDetectionService {
    pub fn new(detector: Arc<DeadlockDetector>) -> Self {
        Self {
            detector,
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let detector = self.detector.clone();
        let running = self.running.clone();
        let interval = detector.detection_interval();

        let handle = std::thread::spawn(move || {
            while running.load(Ordering::Acquire) {
                if detector.has_edges() {
                    detector.detect_and_resolve();
                }
                std::thread::sleep(interval);
            }
        });

        *self.handle.lock().unwrap() = Some(handle);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for DeadlockDetectionService {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> DeadlockDetector {
        DeadlockDetector::new(Duration::from_millis(10))
    }

    #[test]
    fn test_no_cycle_no_victim() {
        let d = detector();
        d.register_transaction("T1", 1);
        d.register_transaction("T2", 2);

        d.add_wait_edges("T1", &["T2".to_string()], "r1");
        assert!(d.detect_and_resolve().is_empty());
    }

    #[test]
    fn test_two_cycle_selects_youngest() {
        let d = detector();
        d.register_transaction("T1", 100);
        d.register_transaction("T2", 200);

        d.add_wait_edges("T1", &["T2".to_string()], "a");
        let victims = d.detect_and_resolve();
        assert!(victims.is_empty());

        d.add_wait_edges("T2", &["T1".to_string()], "b");
        let victims = d.detect_and_resolve();
        // T2 started later, so it is the youngest
        assert_eq!(victims, vec!["T2".to_string()]);
    }

    #[test]
    fn test_three_cycle_detected() {
        let d = detector();
        for (tx, start) in [("T1", 10), ("T2", 20), ("T3", 30)] {
            d.register_transaction(tx, start);
        }

        d.add_wait_edges("T1", &["T2".to_string()], "a");
        d.add_wait_edges("T2", &["T3".to_string()], "b");
        d.add_wait_edges("T3", &["T1".to_string()], "c");

        let victims = d.detect_and_resolve();
        assert_eq!(victims, vec!["T3".to_string()]);
        assert!(d.statistics().deadlocks_detected >= 1);
    }

    #[test]
    fn test_overlapping_cycles_deduplicated() {
        let d = detector();
        for (tx, start) in [("T1", 1), ("T2", 2), ("T3", 3), ("T4", 4), ("T5", 5)] {
            d.register_transaction(tx, start);
        }

        // Two disjoint cycles: T1 <-> T2 and T3 -> T4 -> T5 -> T3
        {
            let mut graph = d.graph.write().unwrap();
            for (w, h, r) in [("T1", "T2", "a"), ("T2", "T1", "b"), ("T3", "T4", "c"), ("T4", "T5", "d"), ("T5", "T3", "e")] {
                graph.add_edge(WaitForEdge {
                    waiter: w.to_string(),
                    holder: h.to_string(),
                    resource: r.to_string(),
                });
            }
        }

        let victims = d.detect_and_resolve();
        let unique: HashSet<&String> = victims.iter().collect();
        assert_eq!(unique.len(), 2);
        assert!(victims.contains(&"T2".to_string()));
        assert!(victims.contains(&"T5".to_string()));
    }

    #[test]
    fn test_remove_transaction_breaks_cycle() {
        let d = detector();
        d.register_transaction("T1", 1);
        d.register_transaction("T2", 2);

        d.add_wait_edges("T1", &["T2".to_string()], "a");
        d.add_wait_edges("T2", &["T1".to_string()], "b");
        d.remove_transaction("T2");

        assert!(d.detect_and_resolve().is_empty());
        assert_eq!(d.statistics().active_edges, 0);
    }

    #[test]
    fn test_victim_handler_receives_cycle() {
        let d = Arc::new(detector());
        let observed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let sink = observed.clone();
        d.set_victim_handler(Box::new(move |cycle, victim| {
            assert!(cycle.transactions.contains(&victim.to_string()));
            sink.lock().unwrap().push(victim.to_string());
        }));

        d.register_transaction("T1", 1);
        d.register_transaction("T2", 2);
        d.add_wait_edges("T1", &["T2".to_string()], "a");
        // Closing the cycle runs a synchronous detection pass
        d.add_wait_edges("T2", &["T1".to_string()], "b");

        assert_eq!(observed.lock().unwrap().as_slice(), &["T2".to_string()]);
    }

    #[test]
    fn test_service_detects_in_background() {
        let d = Arc::new(detector());
        let observed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = observed.clone();
        d.set_victim_handler(Box::new(move |_cycle, victim| {
            sink.lock().unwrap().push(victim.to_string());
        }));

        let service = DeadlockDetectionService::new(d.clone());
        service.start();
        assert!(service.is_running());

        d.register_transaction("T1", 1);
        d.register_transaction("T2", 2);
        {
            let mut graph = d.graph.write().unwrap();
            graph.add_edge(WaitForEdge {
                waiter: "T1".to_string(),
                holder: "T2".to_string(),
                resource: "a".to_string(),
            });
            graph.add_edge(WaitForEdge {
                waiter: "T2".to_string(),
                holder: "T1".to_string(),
                resource: "b".to_string(),
            });
        }

        // The periodic pass fires within one detection interval
        std::thread::sleep(Duration::from_millis(100));
        service.stop();
        assert!(!service.is_running());
        assert!(!observed.lock().unwrap().is_empty());
    }
}
