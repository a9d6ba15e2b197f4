use crate::error::FailureKind;
use anyhow::Context;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Process wide counters, exported in the Prometheus text format on `/metrics`.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    polls: IntCounter,
    poll_failures: IntCounterVec,
    notifications: IntCounter,
    workers: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let polls = IntCounter::new(
            "tag_tracker_polls_total",
            "Registry poll cycles attempted.",
        )?;
        registry.register(Box::new(polls.clone()))?;

        let poll_failures = IntCounterVec::new(
            Opts::new(
                "tag_tracker_poll_failures_total",
                "Registry poll cycles that produced no tag list.",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(poll_failures.clone()))?;
        // Export every kind from the start so a missing series means zero
        for kind in FailureKind::ALL {
            poll_failures.with_label_values(&[kind.as_str()]);
        }

        let notifications = IntCounter::new(
            "tag_tracker_notifications_total",
            "Newer tags reported to subscribers.",
        )?;
        registry.register(Box::new(notifications.clone()))?;

        let workers = IntGauge::new("tag_tracker_workers", "Image workers currently polling.")?;
        registry.register(Box::new(workers.clone()))?;

        Ok(Metrics {
            registry,
            polls,
            poll_failures,
            notifications,
            workers,
        })
    }

    pub fn record_poll(&self) {
        self.polls.inc();
    }

    pub fn record_poll_failure(&self, kind: FailureKind) {
        self.poll_failures.with_label_values(&[kind.as_str()]).inc();
    }

    pub fn record_notification(&self) {
        self.notifications.inc();
    }

    pub fn worker_started(&self) {
        self.workers.inc();
    }

    pub fn worker_stopped(&self) {
        self.workers.dec();
    }

    #[cfg(test)]
    pub fn poll_failures(&self, kind: FailureKind) -> u64 {
        self.poll_failures.with_label_values(&[kind.as_str()]).get()
    }

    #[cfg(test)]
    pub fn notifications(&self) -> u64 {
        self.notifications.get()
    }

    #[cfg(test)]
    pub fn workers(&self) -> i64 {
        self.workers.get()
    }

    pub fn encode_text(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .context("Failed to encode metrics")?;
        String::from_utf8(buffer).context("Encoded metrics are not valid UTF-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_includes_every_failure_kind() {
        let metrics = Metrics::new().unwrap();
        metrics.record_poll();
        metrics.record_poll_failure(FailureKind::Forbidden);
        metrics.record_poll_failure(FailureKind::Forbidden);
        metrics.record_notification();
        metrics.worker_started();

        let encoded = metrics.encode_text().unwrap();
        assert!(encoded.contains("# TYPE tag_tracker_polls_total counter\n"));
        assert!(encoded.contains("tag_tracker_polls_total 1\n"));
        assert!(encoded.contains("tag_tracker_poll_failures_total{kind=\"forbidden\"} 2\n"));
        assert!(encoded.contains("tag_tracker_poll_failures_total{kind=\"unauthorized\"} 0\n"));
        assert!(encoded.contains("tag_tracker_poll_failures_total{kind=\"rate_limited\"} 0\n"));
        assert!(encoded.contains("tag_tracker_notifications_total 1\n"));
        assert!(encoded.contains("# TYPE tag_tracker_workers gauge\n"));
        assert!(encoded.contains("tag_tracker_workers 1\n"));
    }

    #[test]
    fn test_worker_gauge() {
        let metrics = Metrics::new().unwrap();
        metrics.worker_started();
        metrics.worker_started();
        metrics.worker_stopped();
        assert_eq!(metrics.workers(), 1);
    }

    #[test]
    fn test_instances_do_not_share_counters() {
        let first = Metrics::new().unwrap();
        let second = Metrics::new().unwrap();
        first.record_notification();
        assert_eq!(first.notifications(), 1);
        assert_eq!(second.notifications(), 0);
    }
}
