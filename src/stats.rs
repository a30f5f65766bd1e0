//! Human-readable health and profiling reports for `ctxmem health`.

use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

use context_memory_core::cache::TierHealth;
use context_memory_core::profiler::OperationStats;

use crate::engine::IndexHealth;

/// Render the index health report.
pub fn render_health(path: &Path, health: &IndexHealth) -> String {
    let s = &health.storage;
    let mut out = String::new();
    let _ = writeln!(out, "Context Memory: Index Health");
    let _ = writeln!(out, "============================");
    let _ = writeln!(out);
    let _ = writeln!(out, "  Knowledge base: {}", path.display());
    let _ = writeln!(out, "  Backend:        {}", s.backend);
    if let Some(size) = s.size_bytes {
        let _ = writeln!(out, "  Size:           {}", format_bytes(size));
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "  Documents:      {}", s.documents);
    let _ = writeln!(out, "  Chunks:         {}", s.chunks);
    let _ = writeln!(
        out,
        "  Embedded:       {} / {} ({}%)",
        s.embedded,
        s.chunks,
        if s.chunks > 0 { s.embedded * 100 / s.chunks } else { 0 }
    );
    let _ = writeln!(out, "  Tombstones:     {}", s.tombstones);
    if !s.models.is_empty() {
        let _ = writeln!(out, "  Models:         {}", s.models.join(", "));
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "  {:<6} {:>8} {:>8} {:>8} {:>8} {:>9}", "TIER", "SIZE", "CAP", "HITS", "MISSES", "HIT RATE");
    let _ = writeln!(out, "  {}", "-".repeat(52));
    tier_row(&mut out, "L1", &health.cache.l1);
    tier_row(&mut out, "L2", &health.cache.l2);
    out
}

fn tier_row(out: &mut String, name: &str, t: &TierHealth) {
    let _ = writeln!(
        out,
        "  {:<6} {:>8} {:>8} {:>8} {:>8} {:>8.1}%",
        name,
        t.size,
        t.capacity,
        t.hits,
        t.misses,
        t.hit_rate * 100.0
    );
}

/// Render per-operation timings, or nothing when no operation ran.
pub fn render_profile(stats: &[OperationStats]) -> String {
    if stats.is_empty() {
        return String::new();
    }
    let mut out = String::new();
    let _ = writeln!(out, "  {:<28} {:>7} {:>12} {:>12}", "OPERATION", "COUNT", "TOTAL", "AVG");
    let _ = writeln!(out, "  {}", "-".repeat(62));
    for s in stats {
        let _ = writeln!(
            out,
            "  {:<28} {:>7} {:>12} {:>12}",
            s.operation,
            s.count,
            format_duration(s.total_time),
            format_duration(s.avg_time)
        );
    }
    out
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

fn format_duration(d: Duration) -> String {
    let micros = d.as_micros();
    if micros < 1000 {
        format!("{micros} µs")
    } else if micros < 1_000_000 {
        format!("{:.1} ms", micros as f64 / 1000.0)
    } else {
        format!("{:.2} s", d.as_secs_f64())
    }
}
