//! Per-operation timing.
//!
//! ```rust
//! use context_memory_core::profiler::Profiler;
//!
//! let profiler = Profiler::new();
//! {
//!     let _span = profiler.span("get_context");
//! }
//! assert_eq!(profiler.stats()[0].count, 1);
//! ```

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationStats {
    pub operation: String,
    pub count: u64,
    pub total_time: Duration,
    pub avg_time: Duration,
}

#[derive(Default)]
pub struct Profiler {
    totals: Mutex<BTreeMap<String, (u64, Duration)>>,
}

impl Profiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start timing `operation`; the elapsed time is recorded when the
    /// guard drops, including on early return.
    pub fn span<'a>(&'a self, operation: &str) -> SpanGuard<'a> {
        SpanGuard {
            profiler: self,
            operation: operation.to_string(),
            started: Instant::now(),
        }
    }

    pub fn record(&self, operation: &str, elapsed: Duration) {
        let mut totals = self.totals.lock();
        let slot = totals.entry(operation.to_string()).or_default();
        slot.0 += 1;
        slot.1 += elapsed;
    }

    /// Stats sorted by operation name.
    pub fn stats(&self) -> Vec<OperationStats> {
        self.totals
            .lock()
            .iter()
            .map(|(op, &(count, total))| OperationStats {
                operation: op.clone(),
                count,
                total_time: total,
                avg_time: average(total, count),
            })
            .collect()
    }

    pub fn reset(&self) {
        self.totals.lock().clear();
    }
}

fn average(total: Duration, count: u64) -> Duration {
    if count == 0 {
        return Duration::ZERO;
    }
    match u32::try_from(count) {
        Ok(n) => total / n,
        Err(_) => total.div_f64(count as f64),
    }
}

pub struct SpanGuard<'a> {
    profiler: &'a Profiler,
    operation: String,
    started: Instant,
}

impl Drop for SpanGuard<'_> {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        tracing::trace!(operation = %self.operation, elapsed_ms = elapsed.as_millis() as u64, "operation finished");
        self.profiler.record(&self.operation, elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_count_and_average() {
        let p = Profiler::new();
        p.record("b", Duration::from_millis(10));
        p.record("b", Duration::from_millis(30));
        p.record("a", Duration::from_millis(5));
        let stats = p.stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].operation, "a");
        assert_eq!(stats[1].count, 2);
        assert_eq!(stats[1].total_time, Duration::from_millis(40));
        assert_eq!(stats[1].avg_time, Duration::from_millis(20));
    }

    #[test]
    fn test_average_past_u32_count() {
        let count = u64::from(u32::MAX) + 1;
        assert_eq!(average(Duration::from_secs(count), count), Duration::from_secs(1));
        assert_eq!(average(Duration::from_secs(9), 0), Duration::ZERO);
    }

    #[test]
    fn test_guard_records_on_early_return() {
        fn work(p: &Profiler, bail: bool) -> Option<()> {
            let _span = p.span("work");
            if bail {
                return None;
            }
            Some(())
        }
        let p = Profiler::new();
        work(&p, true);
        work(&p, false);
        assert_eq!(p.stats()[0].count, 2);
        p.reset();
        assert!(p.stats().is_empty());
    }
}
