//! Metrics and tracing setup for the farm.
//!
//! [`FarmMetrics`] owns its own `prometheus` registry and is handed to each
//! farm as an `Arc`; there is no process-wide singleton, so tests can build
//! as many independent instances as they like.

use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramTimer, HistogramVec, IntCounter, IntCounterVec, Opts,
    Registry, TextEncoder,
};

// ────────────────────────── Tracing ──────────────────────────

/// Initialize the tracing subscriber with env-filter.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

// ────────────────────────── Prometheus metrics ──────────────────────────

/// All Prometheus metrics for one node. Farm-scoped series carry a `farm` label.
pub struct FarmMetrics {
    pub registry: Registry,

    // ── Operations ──
    pub ops: IntCounterVec,
    pub op_latency_secs: HistogramVec,
    pub partial_writes: IntCounterVec,
    pub rate_limited: IntCounterVec,

    // ── Repair ──
    pub repairs_scheduled: IntCounterVec,
    pub repairs_completed: IntCounterVec,
    pub repair_failures: IntCounterVec,
    pub repair_corrections: IntCounterVec,

    // ── Sweeper ──
    pub sweeps: IntCounterVec,
    pub sweeper_expired: IntCounter,
    pub sweeper_purged: IntCounter,

    // ── Background pool ──
    pub background_failures: IntCounter,
    pub background_dropped: IntCounter,
}

// Manual Debug impl because prometheus types don't derive Debug.
impl std::fmt::Debug for FarmMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FarmMetrics").finish_non_exhaustive()
    }
}

/// Default histogram buckets (seconds) for farm operation latency.
const LATENCY_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];

fn register<C: Collector + Clone + 'static>(registry: &Registry, c: C) -> prometheus::Result<C> {
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

fn by_farm(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounterVec> {
    register(registry, IntCounterVec::new(Opts::new(name, help), &["farm"])?)
}

impl FarmMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let ops = register(
            &registry,
            IntCounterVec::new(
                Opts::new("farm_ops_total", "Farm operations, by farm and op"),
                &["farm", "op"],
            )?,
        )?;
        let op_latency_secs = register(
            &registry,
            HistogramVec::new(
                HistogramOpts::new(
                    "farm_op_latency_seconds",
                    "Farm operation latency in seconds",
                )
                .buckets(LATENCY_BUCKETS.to_vec()),
                &["farm", "op"],
            )?,
        )?;
        let partial_writes = by_farm(
            &registry,
            "farm_partial_writes_total",
            "Writes that failed or diverged on some replicas",
        )?;
        let rate_limited = by_farm(
            &registry,
            "farm_rate_limited_total",
            "Fan-outs rejected by the rate limiter",
        )?;

        let repairs_scheduled = by_farm(
            &registry,
            "farm_repairs_scheduled_total",
            "Background repairs scheduled",
        )?;
        let repairs_completed = by_farm(
            &registry,
            "farm_repairs_completed_total",
            "Repairs that finished without error",
        )?;
        let repair_failures = by_farm(
            &registry,
            "farm_repair_failures_total",
            "Repairs that timed out or reported write errors",
        )?;
        let repair_corrections = by_farm(
            &registry,
            "farm_repair_corrections_total",
            "Corrective writes issued by repair",
        )?;

        let sweeps = register(
            &registry,
            IntCounterVec::new(
                Opts::new("farm_sweeps_total", "Expiry sweeps run, by kind"),
                &["kind"],
            )?,
        )?;
        let sweeper_expired = register(
            &registry,
            IntCounter::with_opts(Opts::new(
                "farm_sweeper_expired_total",
                "Expired entries deleted by the sweeper",
            ))?,
        )?;
        let sweeper_purged = register(
            &registry,
            IntCounter::with_opts(Opts::new(
                "farm_sweeper_purged_total",
                "Expired records physically removed from replicas",
            ))?,
        )?;

        let background_failures = register(
            &registry,
            IntCounter::with_opts(Opts::new(
                "farm_background_failures_total",
                "Background tasks that reported an error",
            ))?,
        )?;
        let background_dropped = register(
            &registry,
            IntCounter::with_opts(Opts::new(
                "farm_background_dropped_total",
                "Background tasks dropped because the pool was full",
            ))?,
        )?;

        Ok(Self {
            registry,
            ops,
            op_latency_secs,
            partial_writes,
            rate_limited,
            repairs_scheduled,
            repairs_completed,
            repair_failures,
            repair_corrections,
            sweeps,
            sweeper_expired,
            sweeper_purged,
            background_failures,
            background_dropped,
        })
    }

    /// Count one operation and start its latency timer. The timer records
    /// the elapsed time when dropped.
    pub fn start_op(&self, farm: &str, op: &str) -> HistogramTimer {
        self.ops.with_label_values(&[farm, op]).inc();
        self.op_latency_secs
            .with_label_values(&[farm, op])
            .start_timer()
    }

    /// Encode all registered metrics in Prometheus text exposition format.
    pub fn encode(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

// ────────────────────────── Tests ──────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Histogram;

    #[test]
    fn test_metrics_are_independent() {
        let a = FarmMetrics::new().unwrap();
        let b = FarmMetrics::new().unwrap();

        a.partial_writes.with_label_values(&["data"]).inc();
        a.partial_writes.with_label_values(&["data"]).inc();
        assert_eq!(a.partial_writes.with_label_values(&["data"]).get(), 2);
        assert_eq!(b.partial_writes.with_label_values(&["data"]).get(), 0);
    }

    #[test]
    fn test_encode_format() {
        let m = FarmMetrics::new().unwrap();
        m.repairs_scheduled.with_label_values(&["counter"]).inc();
        m.sweeper_expired.inc();

        let output = m.encode().unwrap();
        assert!(output.contains("farm_repairs_scheduled_total{farm=\"counter\"} 1"));
        assert!(output.contains("farm_sweeper_expired_total 1"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }

    #[test]
    fn test_start_op_counts_and_times() {
        let m = FarmMetrics::new().unwrap();
        {
            let _t = m.start_op("data", "insert");
        }
        {
            let _t = m.start_op("data", "insert");
        }
        assert_eq!(m.ops.with_label_values(&["data", "insert"]).get(), 2);

        let h: Histogram = m.op_latency_secs.with_label_values(&["data", "insert"]);
        assert_eq!(h.get_sample_count(), 2);
    }
}
