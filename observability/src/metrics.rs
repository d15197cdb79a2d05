use std::sync::{Arc, Mutex};
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Cache label values used across repositories.
pub mod cache {
    pub const REFS: &str = "refs";
    pub const PACKAGES: &str = "packages";
    pub const BLOBS: &str = "blobs";
    pub const MANIFESTS: &str = "manifests";
}

/// Shared metrics facade backed by a dedicated prometheus registry.
///
/// Cloning is cheap; all clones share the same counters.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Registry,
    reset_lock: Mutex<()>,

    cache_events: IntCounterVec,
    cache_bytes: IntCounterVec,
    upstream_requests: IntCounterVec,
    upstream_duration: HistogramVec,
    storage_ops: IntCounterVec,
    storage_bytes: IntCounterVec,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let cache_events = IntCounterVec::new(
            Opts::new(
                "repoxy_cache_events_total",
                "Cache lookup results grouped by repository and cache name",
            ),
            &["type", "repo", "cache", "result"],
        )
        .expect("metric can be created");

        let cache_bytes = IntCounterVec::new(
            Opts::new(
                "repoxy_cache_bytes_total",
                "Bytes written to or served from caches",
            ),
            &["type", "repo", "cache", "action"],
        )
        .expect("metric can be created");

        let upstream_requests = IntCounterVec::new(
            Opts::new(
                "repoxy_upstream_requests_total",
                "Upstream round trips initiated by repositories",
            ),
            &["type", "repo", "target", "status"],
        )
        .expect("metric can be created");

        let upstream_duration = HistogramVec::new(
            HistogramOpts::new(
                "repoxy_upstream_request_duration_seconds",
                "Latency of upstream requests",
            ),
            &["type", "repo", "target", "status"],
        )
        .expect("metric can be created");

        let storage_ops = IntCounterVec::new(
            Opts::new(
                "repoxy_storage_operations_total",
                "Count of common storage operations",
            ),
            &["type", "repo", "op", "result"],
        )
        .expect("metric can be created");

        let storage_bytes = IntCounterVec::new(
            Opts::new(
                "repoxy_storage_bytes_total",
                "Bytes written via common storage operations",
            ),
            &["type", "repo", "op"],
        )
        .expect("metric can be created");

        for collector in [
            Box::new(cache_events.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(cache_bytes.clone()),
            Box::new(upstream_requests.clone()),
            Box::new(upstream_duration.clone()),
            Box::new(storage_ops.clone()),
            Box::new(storage_bytes.clone()),
        ] {
            registry
                .register(collector)
                .expect("metric can be registered");
        }

        Self {
            inner: Arc::new(Inner {
                registry,
                reset_lock: Mutex::new(()),
                cache_events,
                cache_bytes,
                upstream_requests,
                upstream_duration,
                storage_ops,
                storage_bytes,
            }),
        }
    }

    /// Increment the cache hit counter for the provided repository and cache.
    pub fn record_cache_hit(&self, repo_type: &str, repo_name: &str, cache: &str) {
        self.record_cache_event(repo_type, repo_name, cache, "hit");
    }

    /// Increment the cache miss counter for the provided repository and cache.
    pub fn record_cache_miss(&self, repo_type: &str, repo_name: &str, cache: &str) {
        self.record_cache_event(repo_type, repo_name, cache, "miss");
    }

    /// Increment the cache error counter for the provided repository and cache.
    pub fn record_cache_error(&self, repo_type: &str, repo_name: &str, cache: &str) {
        self.record_cache_event(repo_type, repo_name, cache, "error");
    }

    fn record_cache_event(&self, repo_type: &str, repo_name: &str, cache: &str, result: &str) {
        self.inner
            .cache_events
            .with_label_values(&[
                normalize(repo_type, "unknown"),
                normalize(repo_name, "shared"),
                normalize(cache, "unknown"),
                result,
            ])
            .inc();
    }

    /// Track bytes flowing to or from caches for the given action
    /// (`serve`/`store`).
    pub fn record_cache_bytes(
        &self,
        repo_type: &str,
        repo_name: &str,
        cache: &str,
        action: &str,
        n: u64,
    ) {
        if n == 0 {
            return;
        }
        self.inner
            .cache_bytes
            .with_label_values(&[
                normalize(repo_type, "unknown"),
                normalize(repo_name, "shared"),
                normalize(cache, "unknown"),
                normalize(action, "unknown"),
            ])
            .inc_by(n);
    }

    /// Record an upstream request result and latency. `status` is `None` on
    /// transport failure; the duration histogram is only observed for
    /// completed requests.
    pub fn observe_upstream(
        &self,
        repo_type: &str,
        repo_name: &str,
        target: &str,
        status: Option<u16>,
        elapsed: Duration,
    ) {
        let status_label = match status {
            Some(code) => code.to_string(),
            None => "error".to_string(),
        };
        let labels = [
            normalize(repo_type, "unknown"),
            normalize(repo_name, "shared"),
            normalize(target, "unknown"),
            status_label.as_str(),
        ];
        self.inner
            .upstream_requests
            .with_label_values(&labels)
            .inc();
        if status.is_some() {
            self.inner
                .upstream_duration
                .with_label_values(&labels)
                .observe(elapsed.as_secs_f64());
        }
    }

    /// Count a storage engine operation with its result (`success`/`error`).
    pub fn record_storage_op(&self, repo_type: &str, repo_name: &str, op: &str, result: &str) {
        self.inner
            .storage_ops
            .with_label_values(&[
                normalize(repo_type, "unknown"),
                normalize(repo_name, "shared"),
                op,
                result,
            ])
            .inc();
    }

    /// Track bytes written by a storage engine operation.
    pub fn record_storage_bytes(&self, repo_type: &str, repo_name: &str, op: &str, n: u64) {
        if n == 0 {
            return;
        }
        self.inner
            .storage_bytes
            .with_label_values(&[
                normalize(repo_type, "unknown"),
                normalize(repo_name, "shared"),
                op,
            ])
            .inc_by(n);
    }

    /// Reinitialize all metrics. Intended for tests that assert on counter
    /// values.
    pub fn reset(&self) {
        let _guard = self.inner.reset_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.inner.cache_events.reset();
        self.inner.cache_bytes.reset();
        self.inner.upstream_requests.reset();
        self.inner.upstream_duration.reset();
        self.inner.storage_ops.reset();
        self.inner.storage_bytes.reset();
    }

    /// Gather all metrics and encode to the prometheus text format.
    pub fn encode_text(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        if let Err(error) = encoder.encode(&families, &mut buffer) {
            tracing::warn!(%error, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    /// Sum of a counter vec across all label values; used by tests.
    pub fn cache_event_count(&self) -> u64 {
        sum_counter(&self.inner.cache_events)
    }

    /// Sum of upstream request counts across all label values; used by tests.
    pub fn upstream_request_count(&self) -> u64 {
        sum_counter(&self.inner.upstream_requests)
    }
}

fn sum_counter(vec: &IntCounterVec) -> u64 {
    use prometheus::core::Collector;
    vec.collect()
        .iter()
        .flat_map(|family| family.get_metric())
        .map(|metric| metric.get_counter().get_value() as u64)
        .sum()
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.is_empty() {
        fallback
    } else {
        value
    }
}
