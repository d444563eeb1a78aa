//! Bounded in-memory routing history

use std::collections::{BTreeMap, VecDeque};

use cr_common::{HistoryEntry, RoutingResult};
use parking_lot::Mutex;
use serde::Serialize;

/// Per-command success summary over the retained history
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandSummary {
    pub total: u64,
    pub successes: u64,
    pub fallbacks: u64,
    pub success_rate: f64,
    pub avg_response_time_ms: f64,
}

pub struct RoutingHistory {
    capacity: usize,
    entries: Mutex<VecDeque<HistoryEntry>>,
}

impl RoutingHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Append, evicting the oldest entry when full
    pub fn record(&self, result: &RoutingResult) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(HistoryEntry::from(result));
    }

    /// Up to `limit` entries, newest first
    pub fn recent(&self, limit: usize) -> Vec<HistoryEntry> {
        self.entries.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn summary(&self) -> BTreeMap<String, CommandSummary> {
        let entries = self.entries.lock();
        let mut totals: BTreeMap<String, (u64, u64, u64, u64)> = BTreeMap::new();
        for entry in entries.iter() {
            let t = totals.entry(entry.command_type.clone()).or_default();
            t.0 += 1;
            if entry.success {
                t.1 += 1;
            }
            if entry.fallback {
                t.2 += 1;
            }
            t.3 += entry.response_time_ms;
        }

        totals
            .into_iter()
            .map(|(command_type, (total, successes, fallbacks, time_ms))| {
                let summary = CommandSummary {
                    total,
                    successes,
                    fallbacks,
                    success_rate: successes as f64 * 100.0 / total as f64,
                    avg_response_time_ms: time_ms as f64 / total as f64,
                };
                (command_type, summary)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
