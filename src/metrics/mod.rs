use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

// ============================================================================
// Metrics Module - Prometheus metrics for the event store
// ============================================================================
//
// Provides metrics for:
// - Appends (outcome, events written, conflicts, latency)
// - Stream and global reads
// - Stream version cache hits and misses
// - Subscription lifecycle and delivery
//
// Every store owns its own Registry; render it with gather_text().
// ============================================================================

pub struct EventStoreMetrics {
    registry: Registry,

    // Append Metrics
    pub appends_total: IntCounterVec,
    pub events_appended: IntCounter,
    pub concurrency_conflicts: IntCounter,
    pub append_duration: Histogram,

    // Read Metrics
    pub reads_total: IntCounterVec,
    pub events_read: IntCounter,

    // Version Cache Metrics
    pub version_cache: IntCounterVec,

    // Subscription Metrics
    pub active_subscriptions: IntGauge,
    pub subscription_failures: IntCounterVec,
    pub events_delivered: IntCounter,
}

impl EventStoreMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        // Append Metrics
        let appends_total = IntCounterVec::new(
            Opts::new("event_store_appends_total", "Total append calls by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(appends_total.clone()))?;

        let events_appended = IntCounter::new(
            "event_store_events_appended_total",
            "Total events persisted",
        )?;
        registry.register(Box::new(events_appended.clone()))?;

        let concurrency_conflicts = IntCounter::new(
            "event_store_concurrency_conflicts_total",
            "Appends rejected on expected version mismatch",
        )?;
        registry.register(Box::new(concurrency_conflicts.clone()))?;

        let append_duration = Histogram::with_opts(
            HistogramOpts::new("event_store_append_duration_seconds", "Append latency")
                .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;
        registry.register(Box::new(append_duration.clone()))?;

        // Read Metrics
        let reads_total = IntCounterVec::new(
            Opts::new("event_store_reads_total", "Total read calls by kind"),
            &["kind"],
        )?;
        registry.register(Box::new(reads_total.clone()))?;

        let events_read = IntCounter::new(
            "event_store_events_read_total",
            "Total events returned by reads",
        )?;
        registry.register(Box::new(events_read.clone()))?;

        // Version Cache Metrics
        let version_cache = IntCounterVec::new(
            Opts::new("event_store_version_cache_total", "Stream version cache lookups"),
            &["result"],
        )?;
        registry.register(Box::new(version_cache.clone()))?;

        // Subscription Metrics
        let active_subscriptions = IntGauge::new(
            "event_store_active_subscriptions",
            "Subscriptions currently delivering",
        )?;
        registry.register(Box::new(active_subscriptions.clone()))?;

        let subscription_failures = IntCounterVec::new(
            Opts::new(
                "event_store_subscription_failures_total",
                "Subscriptions deactivated by failure",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(subscription_failures.clone()))?;

        let events_delivered = IntCounter::new(
            "event_store_events_delivered_total",
            "Events acknowledged by subscription handlers",
        )?;
        registry.register(Box::new(events_delivered.clone()))?;

        Ok(Self {
            registry,
            appends_total,
            events_appended,
            concurrency_conflicts,
            append_duration,
            reads_total,
            events_read,
            version_cache,
            active_subscriptions,
            subscription_failures,
            events_delivered,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every metric in the Prometheus text exposition format.
    pub fn gather_text(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    pub fn record_append(&self, event_count: usize, duration_secs: f64) {
        self.appends_total.with_label_values(&["success"]).inc();
        self.events_appended.inc_by(event_count as u64);
        self.append_duration.observe(duration_secs);
    }

    pub fn record_conflict(&self) {
        self.appends_total.with_label_values(&["conflict"]).inc();
        self.concurrency_conflicts.inc();
    }

    pub fn record_append_failure(&self) {
        self.appends_total.with_label_values(&["error"]).inc();
    }

    pub fn record_read(&self, kind: &str, event_count: usize) {
        self.reads_total.with_label_values(&[kind]).inc();
        self.events_read.inc_by(event_count as u64);
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.version_cache.with_label_values(&[result]).inc();
    }

    pub fn record_subscription_failure(&self, reason: &str) {
        self.subscription_failures.with_label_values(&[reason]).inc();
    }
}

impl Default for EventStoreMetrics {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics")
    }
}
