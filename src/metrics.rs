/// Module des métriques du moteur
///
/// ARCHITECTURE:
/// Compteurs et jauges atomiques partagés par Arc, histogrammes à buckets
/// fixes. Aucune dépendance à un collecteur externe: les snapshots sont
/// sérialisés en JSON par les endpoints /health et /metrics.
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Bornes (ms) partagées par les histogrammes de latence et de MTTR
const BUCKET_BOUNDS_MS: [u64; 14] = [
    5, 10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 15_000, 60_000, 300_000, 3_600_000,
];

/// Histogramme à buckets fixes, sans verrou
pub struct Histogram {
    counts: Vec<AtomicU64>,
    sum_ms: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        let mut counts = Vec::with_capacity(BUCKET_BOUNDS_MS.len() + 1);
        for _ in 0..=BUCKET_BOUNDS_MS.len() {
            counts.push(AtomicU64::new(0));
        }
        Histogram {
            counts,
            sum_ms: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Enregistre une observation en millisecondes
    pub fn record(&self, value_ms: u64) {
        let idx = BUCKET_BOUNDS_MS
            .iter()
            .position(|&b| value_ms <= b)
            .unwrap_or(BUCKET_BOUNDS_MS.len());
        self.counts[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(value_ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        let buckets = BUCKET_BOUNDS_MS
            .iter()
            .enumerate()
            .map(|(i, &bound)| BucketCount {
                le_ms: bound,
                count: self.counts[i].load(Ordering::Relaxed),
            })
            .collect();
        HistogramSnapshot {
            count: self.count.load(Ordering::Relaxed),
            sum_ms: self.sum_ms.load(Ordering::Relaxed),
            overflow: self.counts[BUCKET_BOUNDS_MS.len()].load(Ordering::Relaxed),
            buckets,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BucketCount {
    pub le_ms: u64,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum_ms: u64,
    pub overflow: u64,
    pub buckets: Vec<BucketCount>,
}

/// Registre des compteurs, jauges et histogrammes du moteur
pub struct Metrics {
    // Compteurs d'ingestion
    pub stream_messages_total: AtomicU64,
    pub candles_ingested_total: AtomicU64,
    pub late_fills_total: AtomicU64,
    pub rejected_candles_total: AtomicU64,
    pub decode_failures_total: AtomicU64,
    pub reconnects_total: AtomicU64,

    // Compteurs de gaps
    pub gaps_detected_total: AtomicU64,
    pub gaps_merged_total: AtomicU64,
    pub gaps_repaired_total: AtomicU64,

    // Compteurs de l'API delta
    pub delta_requests_total: AtomicU64,
    pub delta_truncated_total: AtomicU64,

    // Compteurs du hub (par type d'événement)
    pub push_snapshots_total: AtomicU64,
    pub push_appends_total: AtomicU64,
    pub push_partials_total: AtomicU64,
    pub push_partial_closes_total: AtomicU64,
    pub push_repairs_total: AtomicU64,
    pub push_gap_events_total: AtomicU64,
    pub push_heartbeats_total: AtomicU64,
    pub push_errors_total: AtomicU64,
    pub push_coalesced_total: AtomicU64,
    pub push_dropped_total: AtomicU64,
    pub push_subscriber_overflows_total: AtomicU64,

    // Jauges
    pub stream_lag_ms: AtomicI64,
    pub orchestrator_queue_depth: AtomicI64,
    pub open_gap_count: AtomicI64,
    /// Ratio de complétude multiplié par 10 000 (4 décimales)
    pub completeness_ratio_e4: AtomicI64,

    // Histogrammes
    pub partial_close_latency: Histogram,
    pub gap_mttr: Histogram,
    pub delta_latency: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics {
            stream_messages_total: AtomicU64::new(0),
            candles_ingested_total: AtomicU64::new(0),
            late_fills_total: AtomicU64::new(0),
            rejected_candles_total: AtomicU64::new(0),
            decode_failures_total: AtomicU64::new(0),
            reconnects_total: AtomicU64::new(0),
            gaps_detected_total: AtomicU64::new(0),
            gaps_merged_total: AtomicU64::new(0),
            gaps_repaired_total: AtomicU64::new(0),
            delta_requests_total: AtomicU64::new(0),
            delta_truncated_total: AtomicU64::new(0),
            push_snapshots_total: AtomicU64::new(0),
            push_appends_total: AtomicU64::new(0),
            push_partials_total: AtomicU64::new(0),
            push_partial_closes_total: AtomicU64::new(0),
            push_repairs_total: AtomicU64::new(0),
            push_gap_events_total: AtomicU64::new(0),
            push_heartbeats_total: AtomicU64::new(0),
            push_errors_total: AtomicU64::new(0),
            push_coalesced_total: AtomicU64::new(0),
            push_dropped_total: AtomicU64::new(0),
            push_subscriber_overflows_total: AtomicU64::new(0),
            stream_lag_ms: AtomicI64::new(0),
            orchestrator_queue_depth: AtomicI64::new(0),
            open_gap_count: AtomicI64::new(0),
            completeness_ratio_e4: AtomicI64::new(10_000),
            partial_close_latency: Histogram::new(),
            gap_mttr: Histogram::new(),
            delta_latency: Histogram::new(),
        }
    }

    /// Incrémente le compteur push correspondant au type d'événement
    pub fn count_push_event(&self, kind: &str) {
        let counter = match kind {
            "snapshot" => &self.push_snapshots_total,
            "append" => &self.push_appends_total,
            "partial_update" => &self.push_partials_total,
            "partial_close" => &self.push_partial_closes_total,
            "repair" => &self.push_repairs_total,
            "gap_detected" | "gap_repaired" => &self.push_gap_events_total,
            "heartbeat" => &self.push_heartbeats_total,
            _ => &self.push_errors_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_completeness(&self, present: i64, expected: i64) {
        let ratio = if expected > 0 {
            (present * 10_000) / expected
        } else {
            10_000
        };
        self.completeness_ratio_e4.store(ratio, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: CountersSnapshot {
                stream_messages_total: self.stream_messages_total.load(Ordering::Relaxed),
                candles_ingested_total: self.candles_ingested_total.load(Ordering::Relaxed),
                late_fills_total: self.late_fills_total.load(Ordering::Relaxed),
                rejected_candles_total: self.rejected_candles_total.load(Ordering::Relaxed),
                decode_failures_total: self.decode_failures_total.load(Ordering::Relaxed),
                reconnects_total: self.reconnects_total.load(Ordering::Relaxed),
                gaps_detected_total: self.gaps_detected_total.load(Ordering::Relaxed),
                gaps_merged_total: self.gaps_merged_total.load(Ordering::Relaxed),
                gaps_repaired_total: self.gaps_repaired_total.load(Ordering::Relaxed),
                delta_requests_total: self.delta_requests_total.load(Ordering::Relaxed),
                delta_truncated_total: self.delta_truncated_total.load(Ordering::Relaxed),
                push_snapshots_total: self.push_snapshots_total.load(Ordering::Relaxed),
                push_appends_total: self.push_appends_total.load(Ordering::Relaxed),
                push_partials_total: self.push_partials_total.load(Ordering::Relaxed),
                push_partial_closes_total: self.push_partial_closes_total.load(Ordering::Relaxed),
                push_repairs_total: self.push_repairs_total.load(Ordering::Relaxed),
                push_gap_events_total: self.push_gap_events_total.load(Ordering::Relaxed),
                push_heartbeats_total: self.push_heartbeats_total.load(Ordering::Relaxed),
                push_errors_total: self.push_errors_total.load(Ordering::Relaxed),
                push_coalesced_total: self.push_coalesced_total.load(Ordering::Relaxed),
                push_dropped_total: self.push_dropped_total.load(Ordering::Relaxed),
                push_subscriber_overflows_total: self
                    .push_subscriber_overflows_total
                    .load(Ordering::Relaxed),
            },
            gauges: GaugesSnapshot {
                stream_lag_ms: self.stream_lag_ms.load(Ordering::Relaxed),
                orchestrator_queue_depth: self.orchestrator_queue_depth.load(Ordering::Relaxed),
                open_gap_count: self.open_gap_count.load(Ordering::Relaxed),
                completeness_ratio: self.completeness_ratio_e4.load(Ordering::Relaxed) as f64
                    / 10_000.0,
            },
            histograms: HistogramsSnapshot {
                partial_close_latency: self.partial_close_latency.snapshot(),
                gap_mttr: self.gap_mttr.snapshot(),
                delta_latency: self.delta_latency.snapshot(),
            },
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CountersSnapshot {
    pub stream_messages_total: u64,
    pub candles_ingested_total: u64,
    pub late_fills_total: u64,
    pub rejected_candles_total: u64,
    pub decode_failures_total: u64,
    pub reconnects_total: u64,
    pub gaps_detected_total: u64,
    pub gaps_merged_total: u64,
    pub gaps_repaired_total: u64,
    pub delta_requests_total: u64,
    pub delta_truncated_total: u64,
    pub push_snapshots_total: u64,
    pub push_appends_total: u64,
    pub push_partials_total: u64,
    pub push_partial_closes_total: u64,
    pub push_repairs_total: u64,
    pub push_gap_events_total: u64,
    pub push_heartbeats_total: u64,
    pub push_errors_total: u64,
    pub push_coalesced_total: u64,
    pub push_dropped_total: u64,
    pub push_subscriber_overflows_total: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GaugesSnapshot {
    pub stream_lag_ms: i64,
    pub orchestrator_queue_depth: i64,
    pub open_gap_count: i64,
    pub completeness_ratio: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistogramsSnapshot {
    pub partial_close_latency: HistogramSnapshot,
    pub gap_mttr: HistogramSnapshot,
    pub delta_latency: HistogramSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub counters: CountersSnapshot,
    pub gauges: GaugesSnapshot,
    pub histograms: HistogramsSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogramme_buckets() {
        let h = Histogram::new();
        h.record(3);
        h.record(100);
        h.record(10_000_000); // au-delà de la dernière borne

        let snap = h.snapshot();
        assert_eq!(snap.count, 3);
        assert_eq!(snap.overflow, 1);
        assert_eq!(snap.buckets[0].count, 1); // <= 5 ms
    }

    #[test]
    fn test_completude() {
        let m = Metrics::new();
        m.set_completeness(99, 100);
        let snap = m.snapshot();
        assert!((snap.gauges.completeness_ratio - 0.99).abs() < 1e-9);
    }

    #[test]
    fn test_compteurs_push_par_type() {
        let m = Metrics::new();
        m.count_push_event("append");
        m.count_push_event("append");
        m.count_push_event("heartbeat");
        let snap = m.snapshot();
        assert_eq!(snap.counters.push_appends_total, 2);
        assert_eq!(snap.counters.push_heartbeats_total, 1);
    }
}
