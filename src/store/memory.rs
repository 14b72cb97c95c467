//! Process-local timestamp store.

use async_trait::async_trait;
use dashmap::DashMap;

use super::{encode_member, Admission, TimestampStore};
use crate::error::Result;

/// One `(timestamp, weight)` entry in a series.
#[derive(Debug, Clone)]
struct Entry {
    t: f64,
    weight: f64,
    member: String,
}

/// Per-key series: entries sorted ascending by timestamp, with the live
/// weight sum maintained incrementally so counting stays O(1).
#[derive(Debug, Default)]
struct Series {
    entries: Vec<Entry>,
    total_weight: f64,
}

impl Series {
    /// Insert keeping ascending timestamp order. Equal timestamps keep
    /// arrival order.
    fn insert(&mut self, t: f64, weight: f64, member: String) {
        let idx = self.entries.partition_point(|e| e.t <= t);
        self.entries.insert(idx, Entry { t, weight, member });
        self.total_weight += weight;
    }

    /// Drop entries with timestamp strictly below `cutoff`. Stale entries
    /// live at the front, so this walks only what it removes.
    fn prune(&mut self, cutoff: f64) {
        let stale = self.entries.partition_point(|e| e.t < cutoff);
        if stale > 0 {
            for entry in self.entries.drain(..stale) {
                self.total_weight -= entry.weight;
            }
            if self.entries.is_empty() {
                self.total_weight = 0.0;
            }
        }
    }

    fn oldest(&self) -> Option<f64> {
        self.entries.first().map(|e| e.t)
    }

    fn approximate_bytes(&self) -> u64 {
        let entries: usize = self
            .entries
            .iter()
            .map(|e| std::mem::size_of::<Entry>() + e.member.len())
            .sum();
        (std::mem::size_of::<Series>() + entries) as u64
    }
}

/// In-memory store keyed by a sharded map, so operations on distinct
/// keys never serialize against each other.
#[derive(Debug, Default)]
pub struct MemoryStore {
    series: DashMap<String, Series>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop series that pruned down to empty so idle keys do not
    /// accumulate.
    fn drop_if_empty(&self, key: &str) {
        self.series.remove_if(key, |_, s| s.entries.is_empty());
    }
}

#[async_trait]
impl TimestampStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn check_and_admit(
        &self,
        key: &str,
        cutoff: f64,
        now: f64,
        weight: f64,
        limit: f64,
        _weighted: bool,
    ) -> Result<Admission> {
        let admission = {
            let mut series = self.series.entry(key.to_string()).or_default();
            series.prune(cutoff);
            let load = series.total_weight;

            if load + weight <= limit {
                let member = encode_member(now, weight);
                series.insert(now, weight, member.clone());
                Admission {
                    admitted: true,
                    load: series.total_weight,
                    oldest: series.oldest(),
                    member: Some(member),
                }
            } else {
                Admission {
                    admitted: false,
                    load,
                    oldest: series.oldest(),
                    member: None,
                }
            }
        };
        self.drop_if_empty(key);
        Ok(admission)
    }

    async fn add(&self, key: &str, t: f64, weight: f64) -> Result<String> {
        let member = encode_member(t, weight);
        self.series
            .entry(key.to_string())
            .or_default()
            .insert(t, weight, member.clone());
        Ok(member)
    }

    async fn prune(&self, key: &str, cutoff: f64) -> Result<()> {
        if let Some(mut series) = self.series.get_mut(key) {
            series.prune(cutoff);
        }
        self.drop_if_empty(key);
        Ok(())
    }

    async fn load(&self, key: &str, cutoff: f64, _weighted: bool) -> Result<f64> {
        let load = match self.series.get_mut(key) {
            Some(mut series) => {
                series.prune(cutoff);
                series.total_weight
            }
            None => 0.0,
        };
        self.drop_if_empty(key);
        Ok(load)
    }

    async fn oldest(&self, key: &str, cutoff: f64) -> Result<Option<f64>> {
        let oldest = match self.series.get_mut(key) {
            Some(mut series) => {
                series.prune(cutoff);
                series.oldest()
            }
            None => None,
        };
        self.drop_if_empty(key);
        Ok(oldest)
    }

    async fn remove(&self, key: &str, member: &str) -> Result<bool> {
        let removed = match self.series.get_mut(key) {
            Some(mut series) => {
                if let Some(idx) = series.entries.iter().position(|e| e.member == member) {
                    let entry = series.entries.remove(idx);
                    series.total_weight -= entry.weight;
                    if series.entries.is_empty() {
                        series.total_weight = 0.0;
                    }
                    true
                } else {
                    false
                }
            }
            None => false,
        };
        self.drop_if_empty(key);
        Ok(removed)
    }

    async fn clear(&self, key: &str) -> Result<()> {
        self.series.remove(key);
        Ok(())
    }

    async fn all_keys(&self) -> Result<Vec<String>> {
        Ok(self.series.iter().map(|e| e.key().clone()).collect())
    }

    async fn report_memory(&self) -> Result<u64> {
        Ok(self
            .series
            .iter()
            .map(|e| e.key().len() as u64 + e.value().approximate_bytes())
            .sum())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
