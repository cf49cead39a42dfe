use crate::Error;

use prometheus::{histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry};
use tokio::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    pub ticks: IntCounter,
    pub failures: IntCounterVec,
    pub tick_duration: HistogramVec,
    pub starved_pods: IntGauge,
    pub evictions: IntCounterVec,
    pub infeasible: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        let tick_duration = HistogramVec::new(
            histogram_opts!(
                "rescheduler_tick_duration_seconds",
                "The duration of one control loop tick in seconds"
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60., 300.]),
            &[],
        )
        .unwrap();
        let failures = IntCounterVec::new(
            opts!("rescheduler_tick_failures_total", "tick errors by kind"),
            &["error"],
        )
        .unwrap();
        let evictions = IntCounterVec::new(
            opts!("rescheduler_evictions_total", "evictions by outcome"),
            &["outcome"],
        )
        .unwrap();
        let ticks = IntCounter::new("rescheduler_ticks_total", "control loop ticks").unwrap();
        let starved_pods =
            IntGauge::new("rescheduler_starved_pods", "critical pods starved at the last tick").unwrap();
        let infeasible = IntCounter::new(
            "rescheduler_infeasible_total",
            "starved pods for which no victims could be found",
        )
        .unwrap();
        Metrics {
            ticks,
            failures,
            tick_duration,
            starved_pods,
            evictions,
            infeasible,
        }
    }
}

impl Metrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.tick_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.ticks.clone()))?;
        registry.register(Box::new(self.starved_pods.clone()))?;
        registry.register(Box::new(self.evictions.clone()))?;
        registry.register(Box::new(self.infeasible.clone()))?;
        Ok(self)
    }

    pub fn tick_failure(&self, e: &Error) {
        self.failures.with_label_values(&[e.metric_label().as_ref()]).inc()
    }

    pub fn eviction(&self, outcome: &str) {
        self.evictions.with_label_values(&[outcome]).inc()
    }

    pub fn count_and_measure(&self) -> TickMeasurer {
        self.ticks.inc();
        TickMeasurer {
            start: Instant::now(),
            metric: self.tick_duration.clone(),
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct TickMeasurer {
    start: Instant,
    metric: HistogramVec,
}

impl Drop for TickMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric.with_label_values(&[]).observe(duration);
    }
}
