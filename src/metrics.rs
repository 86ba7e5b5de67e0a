//! Prometheus-style counters and gauges for the queue fabric, caches and
//! trust engine.
//!
//! Relevant sources for metric naming conventions:
//! - <https://prometheus.io/docs/practices/naming/>
//! - <https://prometheus.io/docs/practices/instrumentation/>

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

const PROMETHEUS_PREFIX: &str = "rainsd";

/// The process-wide metrics registry and the gauges/counters it holds.
pub struct Metrics {
    registry: Registry,

    pub prio_queue_depth: Gauge,
    pub normal_queue_depth: Gauge,
    pub notification_queue_depth: Gauge,

    pub sections_verified: Counter,
    pub sections_dropped_unverified: Counter,
    pub sections_parked_pending_key: Counter,

    pub zone_key_cache_size: Gauge,
    pub assertion_cache_size: Gauge,
    pub negative_assertion_cache_size: Gauge,
    pub pending_key_cache_size: Gauge,
    pub pending_query_cache_size: Gauge,

    pub cache_evictions: Counter,
    pub delegation_queries_sent: Counter,
    pub send_retries_exhausted: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix(PROMETHEUS_PREFIX);

        macro_rules! register_gauge {
            ($name:literal, $help:literal) => {{
                let gauge = Gauge::default();
                registry.register($name, $help, gauge.clone());
                gauge
            }};
        }
        macro_rules! register_counter {
            ($name:literal, $help:literal) => {{
                let counter = Counter::default();
                registry.register($name, $help, counter.clone());
                counter
            }};
        }

        Metrics {
            prio_queue_depth: register_gauge!("prio_queue_depth", "Messages waiting in the priority queue"),
            normal_queue_depth: register_gauge!("normal_queue_depth", "Messages waiting in the normal queue"),
            notification_queue_depth: register_gauge!(
                "notification_queue_depth",
                "Messages waiting in the notification queue"
            ),
            sections_verified: register_counter!(
                "sections_verified_total",
                "Signable sections that verified under a matched key"
            ),
            sections_dropped_unverified: register_counter!(
                "sections_dropped_unverified_total",
                "Sections dropped for having no verifying signature"
            ),
            sections_parked_pending_key: register_counter!(
                "sections_parked_pending_key_total",
                "Sections parked awaiting a delegation key"
            ),
            zone_key_cache_size: register_gauge!("zone_key_cache_size", "Entries in the zone-key cache"),
            assertion_cache_size: register_gauge!("assertion_cache_size", "Entries in the assertion cache"),
            negative_assertion_cache_size: register_gauge!(
                "negative_assertion_cache_size",
                "Entries in the negative-assertion cache"
            ),
            pending_key_cache_size: register_gauge!(
                "pending_key_cache_size",
                "Entries in the pending-key cache"
            ),
            pending_query_cache_size: register_gauge!(
                "pending_query_cache_size",
                "Entries in the pending-query cache"
            ),
            cache_evictions: register_counter!("cache_evictions_total", "LRU evictions across all caches"),
            delegation_queries_sent: register_counter!(
                "delegation_queries_sent_total",
                "Delegation queries issued upstream"
            ),
            send_retries_exhausted: register_counter!(
                "send_retries_exhausted_total",
                "sendTo calls that exhausted their retry budget"
            ),
        }
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_registered_metrics_by_name() {
        let metrics = Metrics::new();
        metrics.prio_queue_depth.set(3);
        let text = metrics.encode().unwrap();
        assert!(text.contains("rainsd_prio_queue_depth"));
    }
}
