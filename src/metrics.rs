//! Prometheus metrics for the request path

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Registry plus the gateway's counters. Cheap to clone via `Arc` at the
/// call sites.
pub struct GatewayMetrics {
    registry: Registry,
    pub requests_total: IntCounterVec,
    pub cache_decisions: IntCounterVec,
    pub coalesced_requests: IntCounter,
    pub events_dropped: IntCounter,
    pub upstream_latency_seconds: Histogram,
}

impl GatewayMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("gateway_requests_total", "Requests by endpoint and status"),
            &["endpoint", "status"],
        )?;
        let cache_decisions = IntCounterVec::new(
            Opts::new("gateway_cache_decisions_total", "Cache lookups by decision"),
            &["decision"],
        )?;
        let coalesced_requests = IntCounter::new(
            "gateway_coalesced_requests_total",
            "Requests served by attaching to an in-flight call",
        )?;
        let events_dropped = IntCounter::new(
            "gateway_events_dropped_total",
            "Observability events dropped after queue and fallback failed",
        )?;
        let upstream_latency_seconds = Histogram::with_opts(HistogramOpts::new(
            "gateway_upstream_latency_seconds",
            "Upstream call latency",
        ))?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(cache_decisions.clone()))?;
        registry.register(Box::new(coalesced_requests.clone()))?;
        registry.register(Box::new(events_dropped.clone()))?;
        registry.register(Box::new(upstream_latency_seconds.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            cache_decisions,
            coalesced_requests,
            events_dropped,
            upstream_latency_seconds,
        })
    }

    /// Render the registry in the Prometheus text format.
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_render() {
        let metrics = GatewayMetrics::new().unwrap();
        metrics.requests_total.with_label_values(&["chat", "200"]).inc();
        metrics.cache_decisions.with_label_values(&["semantic"]).inc();
        metrics.coalesced_requests.inc_by(9);

        let text = metrics.gather();
        assert!(text.contains("gateway_requests_total"));
        assert!(text.contains("gateway_coalesced_requests_total 9"));
    }
}
