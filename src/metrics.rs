use crate::registry::TickReport;
use crate::result::Status;
use prometheus::core::Collector;
use prometheus::{
    opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, IntGauge, Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub smokerd_checks_configured: IntGauge,
    pub smokerd_check_status: GaugeVec,
    pub smokerd_check_runs_total: CounterVec,
    pub smokerd_check_deadlocks_total: CounterVec,
    pub smokerd_executors_in_flight: IntGauge,
    pub smokerd_executors_waiting: IntGauge,
    pub smokerd_gate_capacity: IntGauge,
    pub smokerd_forced_requests_total: Counter,
    pub smokerd_scrape_count_total: Counter,
    pub smokerd_last_tick_timestamp_seconds: Gauge,
}

/// Gauge value for a status: 0 OK, 1 WARN, 2 ERROR.
fn status_value(status: Status) -> f64 {
    match status {
        Status::Ok => 0.0,
        Status::Warn => 1.0,
        Status::Error => 2.0,
    }
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let smokerd_checks_configured = IntGauge::with_opts(opts!(
            "smokerd_checks_configured",
            "Number of loaded checks"
        ))?;
        let smokerd_check_status = GaugeVec::new(
            opts!(
                "smokerd_check_status",
                "Last result per check (0 OK, 1 WARN, 2 ERROR)"
            ),
            &["check"],
        )?;
        let smokerd_check_runs_total = CounterVec::new(
            opts!("smokerd_check_runs_total", "Completed check runs by status"),
            &["check", "status"],
        )?;
        let smokerd_check_deadlocks_total = CounterVec::new(
            opts!(
                "smokerd_check_deadlocks_total",
                "Runs whose process tree survived SIGKILL"
            ),
            &["check"],
        )?;
        let smokerd_executors_in_flight = IntGauge::with_opts(opts!(
            "smokerd_executors_in_flight",
            "Checks currently executing"
        ))?;
        let smokerd_executors_waiting = IntGauge::with_opts(opts!(
            "smokerd_executors_waiting",
            "Checks waiting for a free execution slot"
        ))?;
        let smokerd_gate_capacity = IntGauge::with_opts(opts!(
            "smokerd_gate_capacity",
            "Maximum number of concurrently executing checks"
        ))?;
        let smokerd_forced_requests_total = Counter::with_opts(opts!(
            "smokerd_forced_requests_total",
            "Accepted forced-run requests"
        ))?;
        let smokerd_scrape_count_total = Counter::with_opts(opts!(
            "smokerd_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;
        let smokerd_last_tick_timestamp_seconds = Gauge::with_opts(opts!(
            "smokerd_last_tick_timestamp_seconds",
            "Unix timestamp of the last scheduler tick"
        ))?;

        register(&registry, &smokerd_checks_configured)?;
        register(&registry, &smokerd_check_status)?;
        register(&registry, &smokerd_check_runs_total)?;
        register(&registry, &smokerd_check_deadlocks_total)?;
        register(&registry, &smokerd_executors_in_flight)?;
        register(&registry, &smokerd_executors_waiting)?;
        register(&registry, &smokerd_gate_capacity)?;
        register(&registry, &smokerd_forced_requests_total)?;
        register(&registry, &smokerd_scrape_count_total)?;
        register(&registry, &smokerd_last_tick_timestamp_seconds)?;

        Ok(Arc::new(Self {
            registry,
            smokerd_checks_configured,
            smokerd_check_status,
            smokerd_check_runs_total,
            smokerd_check_deadlocks_total,
            smokerd_executors_in_flight,
            smokerd_executors_waiting,
            smokerd_gate_capacity,
            smokerd_forced_requests_total,
            smokerd_scrape_count_total,
            smokerd_last_tick_timestamp_seconds,
        }))
    }

    pub fn update_from_tick(&self, report: &TickReport) {
        for (check, status) in &report.completed {
            self.smokerd_check_status
                .with_label_values(&[check])
                .set(status_value(*status));
            self.smokerd_check_runs_total
                .with_label_values(&[check, status.as_str()])
                .inc();
        }
        for check in &report.deadlocked {
            self.smokerd_check_deadlocks_total
                .with_label_values(&[check])
                .inc();
        }
        self.smokerd_last_tick_timestamp_seconds
            .set(now_unix() as f64);
    }

    pub fn set_gate(&self, capacity: usize, in_flight: usize, waiting: usize) {
        self.smokerd_gate_capacity.set(capacity as i64);
        self.smokerd_executors_in_flight.set(in_flight as i64);
        self.smokerd_executors_waiting.set(waiting as i64);
    }

    pub fn set_checks_configured(&self, count: usize) {
        self.smokerd_checks_configured.set(count as i64);
    }

    pub fn inc_forced_request(&self) {
        self.smokerd_forced_requests_total.inc();
    }

    pub fn inc_scrape_count(&self) {
        self.smokerd_scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_report_is_exported() {
        let metrics = Metrics::new().unwrap();
        metrics.set_checks_configured(2);
        metrics.set_gate(6, 1, 0);
        metrics.update_from_tick(&TickReport {
            launched: vec![],
            completed: vec![
                ("disk".to_string(), Status::Warn),
                ("ssh".to_string(), Status::Ok),
            ],
            deadlocked: vec!["disk".to_string()],
        });

        let text = String::from_utf8(metrics.encode_metrics().unwrap()).unwrap();
        assert!(text.contains("smokerd_checks_configured 2"));
        assert!(text.contains("smokerd_gate_capacity 6"));
        assert!(text.contains("smokerd_check_status{check=\"disk\"} 1"));
        assert!(text.contains("smokerd_check_runs_total{check=\"ssh\",status=\"OK\"} 1"));
        assert!(text.contains("smokerd_check_deadlocks_total{check=\"disk\"} 1"));
    }
}
