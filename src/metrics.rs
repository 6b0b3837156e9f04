//! Prometheus counters for cache activity.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

/// Counters and gauges describing cache activity, in their own registry.
#[derive(Clone)]
pub struct CacheMetrics {
    registry: Registry,
    pub objects_evicted: IntCounterVec,
    pub bytes_evicted: IntCounterVec,
    pub reservations: IntCounterVec,
    pub objects_saved: IntCounterVec,
    pub bytes_saved: IntCounterVec,
    pub restores: IntCounter,
    pub restore_failures: IntCounter,
    pub integrity_failures: IntCounterVec,
    pub used_bytes: IntGaugeVec,
    pub available_bytes: IntGaugeVec,
}

impl std::fmt::Debug for CacheMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheMetrics").finish_non_exhaustive()
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounterVec> {
    let c = IntCounterVec::new(Opts::new(name, help).namespace("archive_cache"), &["volume"])?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

fn gauge_vec(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntGaugeVec> {
    let g = IntGaugeVec::new(Opts::new(name, help).namespace("archive_cache"), &["volume"])?;
    registry.register(Box::new(g.clone()))?;
    Ok(g)
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let c = IntCounter::with_opts(Opts::new(name, help).namespace("archive_cache"))?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

impl CacheMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        Ok(Self {
            objects_evicted: counter_vec(&registry, "objects_evicted_total", "Objects removed by eviction or uncache")?,
            bytes_evicted: counter_vec(&registry, "bytes_evicted_total", "Bytes freed by eviction or uncache")?,
            reservations: counter_vec(&registry, "reservations_total", "Space reservations granted")?,
            objects_saved: counter_vec(&registry, "objects_saved_total", "Objects written through reservations")?,
            bytes_saved: counter_vec(&registry, "bytes_saved_total", "Bytes written through reservations")?,
            restores: counter(&registry, "restores_total", "Objects restored from long-term storage")?,
            restore_failures: counter(&registry, "restore_failures_total", "Failed restorations")?,
            integrity_failures: counter_vec(&registry, "integrity_failures_total", "Objects failing an integrity check")?,
            used_bytes: gauge_vec(&registry, "used_bytes", "Bytes used by catalogued objects")?,
            available_bytes: gauge_vec(&registry, "available_bytes", "Unreserved free bytes")?,
            registry,
        })
    }

    pub fn record_eviction(&self, volume: &str, objects: u64, bytes: u64) {
        self.objects_evicted.with_label_values(&[volume]).inc_by(objects);
        self.bytes_evicted.with_label_values(&[volume]).inc_by(bytes);
    }

    pub fn record_save(&self, volume: &str, bytes: u64) {
        self.objects_saved.with_label_values(&[volume]).inc();
        self.bytes_saved.with_label_values(&[volume]).inc_by(bytes);
    }

    pub fn record_space(&self, volume: &str, used: u64, available: i64) {
        self.used_bytes.with_label_values(&[volume]).set(used as i64);
        self.available_bytes.with_label_values(&[volume]).set(available);
    }

    /// Text exposition of everything registered.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::warn!(error = %e, "failed to encode metrics");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}
