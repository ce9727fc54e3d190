//! Aggregate pipeline metrics, updated lock-free from concurrent runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

use crate::error::FailureKind;

#[derive(Debug, Default)]
pub struct Metrics {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    processing_ms: AtomicU64,
    tokens: AtomicU64,
    /// Compression ratios summed in millionths.
    compression_micros: AtomicU64,
    failures: DashMap<&'static str, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub runs_started: u64,
    pub runs_completed: u64,
    pub runs_failed: u64,
    pub average_processing_ms: f64,
    pub average_compression_ratio: f64,
    pub total_tokens: u64,
    pub failures_by_code: BTreeMap<String, u64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_start(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self, processing_ms: u64, tokens: usize, compression_ratio: f64) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.processing_ms.fetch_add(processing_ms, Ordering::Relaxed);
        self.tokens.fetch_add(tokens as u64, Ordering::Relaxed);
        let micros = (compression_ratio.clamp(0.0, 1.0) * 1_000_000.0).round() as u64;
        self.compression_micros.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn record_failure(&self, kind: FailureKind) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        *self.failures.entry(kind.code()).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let completed = self.completed.load(Ordering::Relaxed);
        let average = |total: f64| {
            if completed == 0 {
                0.0
            } else {
                total / completed as f64
            }
        };
        MetricsSnapshot {
            runs_started: self.started.load(Ordering::Relaxed),
            runs_completed: completed,
            runs_failed: self.failed.load(Ordering::Relaxed),
            average_processing_ms: average(self.processing_ms.load(Ordering::Relaxed) as f64),
            average_compression_ratio: average(
                self.compression_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            ),
            total_tokens: self.tokens.load(Ordering::Relaxed),
            failures_by_code: self
                .failures
                .iter()
                .map(|e| (e.key().to_string(), *e.value()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn averages_over_completed_runs() {
        let m = Metrics::new();
        assert_eq!(m.snapshot().average_processing_ms, 0.0);
        m.record_start();
        m.record_start();
        m.record_start();
        m.record_success(100, 50, 1.0);
        m.record_success(300, 70, 0.5);
        m.record_failure(FailureKind::StageTimeout);
        let s = m.snapshot();
        assert_eq!(s.runs_started, 3);
        assert_eq!(s.runs_completed, 2);
        assert_eq!(s.average_processing_ms, 200.0);
        assert_eq!(s.average_compression_ratio, 0.75);
        assert_eq!(s.total_tokens, 120);
        assert_eq!(s.failures_by_code["STAGE_TIMEOUT"], 1);
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let m = Arc::new(Metrics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = m.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        m.record_failure(FailureKind::ParseFailure);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let s = m.snapshot();
        assert_eq!(s.runs_failed, 8000);
        assert_eq!(s.failures_by_code["PARSE_FAILURE"], 8000);
    }
}
