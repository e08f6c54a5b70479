//! Per-tenant timing statistics, collected by workers and merged by
//! policies. Mirrors `infbench.profCollection` / `mergePerClientStats` from
//! the original benchmark closely enough that `nShot`'s warm-run report
//! reads the same way.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Accumulated timing samples for one named event (e.g. `t_model_run`).
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    pub count: u64,
    pub total: Duration,
    pub min: Option<Duration>,
    pub max: Option<Duration>,
}

impl EventStats {
    fn record(&mut self, d: Duration) {
        self.count += 1;
        self.total += d;
        self.min = Some(self.min.map_or(d, |m| m.min(d)));
        self.max = Some(self.max.map_or(d, |m| m.max(d)));
    }

    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total / self.count as u32
        }
    }

    fn merge(&mut self, other: &EventStats) {
        self.count += other.count;
        self.total += other.total;
        self.min = match (self.min, other.min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, None) => a,
            (None, b) => b,
        };
        self.max = match (self.max, other.max) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, None) => a,
            (None, b) => b,
        };
    }
}

/// A named collection of `EventStats` for one tenant.
#[derive(Debug, Clone, Default)]
pub struct ProfCollection {
    events: HashMap<String, EventStats>,
}

impl ProfCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, name: &str, d: Duration) {
        self.events.entry(name.to_string()).or_default().record(d);
    }

    pub fn merge(&mut self, other: &ProfCollection) {
        for (name, stats) in &other.events {
            self.events.entry(name.clone()).or_default().merge(stats);
        }
    }

    pub fn get(&self, name: &str) -> Option<&EventStats> {
        self.events.get(name)
    }

    pub fn report(&self) -> HashMap<String, EventStats> {
        self.events.clone()
    }
}

/// RAII timer that records its elapsed duration into `stats` under `name`
/// when dropped, matching `infbench.timer`'s context-manager usage.
pub struct Timer<'a> {
    name: &'static str,
    start: Instant,
    stats: Option<&'a mut ProfCollection>,
}

impl<'a> Timer<'a> {
    pub fn new(name: &'static str, stats: Option<&'a mut ProfCollection>) -> Self {
        Self {
            name,
            start: Instant::now(),
            stats,
        }
    }
}

impl Drop for Timer<'_> {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        if let Some(stats) = self.stats.as_deref_mut() {
            stats.record(self.name, elapsed);
        }
    }
}

/// Merge `delta` into `base`, keyed by tenant id. Mirrors
/// `rayBench.mergePerClientStats`.
pub fn merge_per_tenant(base: &mut HashMap<String, ProfCollection>, delta: HashMap<String, ProfCollection>) {
    for (tenant, d) in delta {
        base.entry(tenant).or_default().merge(&d);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_accumulates_counts() {
        let mut a = ProfCollection::new();
        a.record("t_e2e", Duration::from_millis(10));
        let mut b = ProfCollection::new();
        b.record("t_e2e", Duration::from_millis(20));
        a.merge(&b);
        let e = a.get("t_e2e").unwrap();
        assert_eq!(e.count, 2);
        assert_eq!(e.total, Duration::from_millis(30));
    }

    #[test]
    fn merge_per_tenant_is_idempotent_on_empty_delta() {
        let mut base = HashMap::new();
        base.insert("a".to_string(), {
            let mut p = ProfCollection::new();
            p.record("x", Duration::from_millis(1));
            p
        });
        let before = base.get("a").unwrap().get("x").unwrap().count;
        merge_per_tenant(&mut base, HashMap::new());
        assert_eq!(base.get("a").unwrap().get("x").unwrap().count, before);
    }
}
