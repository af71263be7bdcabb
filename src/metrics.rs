// src/metrics.rs
//! API and process metrics, rendered as Prometheus text.
//!
//! Registry metrics live with the registry; everything here is gated
//! behind the metrics secret. Counters only — token and account values
//! must never appear in the exposition.

use lazy_static::lazy_static;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

lazy_static! {
    static ref PROCESS_START: Instant = Instant::now();
}

/// Pins the process start marker; call early in main so uptime counts from
/// launch rather than the first scrape.
pub fn init_process_start() {
    lazy_static::initialize(&PROCESS_START);
}

#[derive(Default)]
pub struct ApiMetrics {
    pub tokens_issued: AtomicU64,
    pub auth_denied: AtomicU64,
    pub auth_unavailable: AtomicU64,
    pub validate_ok: AtomicU64,
    pub validate_mismatch: AtomicU64,
    pub validate_expired: AtomicU64,
    pub validate_not_found: AtomicU64,
    pub pdata_reads: AtomicU64,
    pub pdata_writes: AtomicU64,
}

impl ApiMetrics {
    pub fn write_prometheus(&self, w: &mut String) {
        let _ = writeln!(w, "# TYPE lodestar_api_tokens_issued_total counter");
        let _ = writeln!(
            w,
            "lodestar_api_tokens_issued_total {}",
            self.tokens_issued.load(Ordering::Relaxed)
        );
        let _ = writeln!(w, "# TYPE lodestar_api_auth_failures_total counter");
        let _ = writeln!(
            w,
            "lodestar_api_auth_failures_total{{reason=\"denied\"}} {}",
            self.auth_denied.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            w,
            "lodestar_api_auth_failures_total{{reason=\"unavailable\"}} {}",
            self.auth_unavailable.load(Ordering::Relaxed)
        );
        let _ = writeln!(w, "# TYPE lodestar_api_token_validations_total counter");
        let _ = writeln!(
            w,
            "lodestar_api_token_validations_total{{result=\"ok\"}} {}",
            self.validate_ok.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            w,
            "lodestar_api_token_validations_total{{result=\"mismatch\"}} {}",
            self.validate_mismatch.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            w,
            "lodestar_api_token_validations_total{{result=\"expired\"}} {}",
            self.validate_expired.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            w,
            "lodestar_api_token_validations_total{{result=\"not_found\"}} {}",
            self.validate_not_found.load(Ordering::Relaxed)
        );
        let _ = writeln!(w, "# TYPE lodestar_api_pdata_ops_total counter");
        let _ = writeln!(
            w,
            "lodestar_api_pdata_ops_total{{op=\"read\"}} {}",
            self.pdata_reads.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            w,
            "lodestar_api_pdata_ops_total{{op=\"write\"}} {}",
            self.pdata_writes.load(Ordering::Relaxed)
        );
    }
}

pub fn write_process_metrics(w: &mut String) {
    let _ = writeln!(w, "# TYPE lodestar_process_uptime_seconds gauge");
    let _ = writeln!(
        w,
        "lodestar_process_uptime_seconds {:.3}",
        PROCESS_START.elapsed().as_secs_f64()
    );
    if let Some(rss) = rss_bytes() {
        let _ = writeln!(w, "# TYPE lodestar_process_resident_memory_bytes gauge");
        let _ = writeln!(w, "lodestar_process_resident_memory_bytes {}", rss);
    }
}

/// Resident set size from /proc; absent on non-Linux hosts.
fn rss_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(pages * 4096)
}
