//! Per-endpoint completion pipeline metrics.
//!
//! Pipeline counters cover the event queue as a whole. Queue statistics are
//! kept per [`QueueType`] and can be read with or without resetting them.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::buffer::{BufferEvent, QueueType};

/// Statistics for one queue type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Operations submitted.
    pub adds: u64,
    /// Cancellations requested.
    pub dels: u64,
    /// Events with a success status.
    pub successful_events: u64,
    /// Events with a failure status, cancellations included.
    pub failed_events: u64,
    /// Bytes moved by successful events.
    pub total_bytes: u64,
    /// Summed time from submit to terminal event, in nanoseconds.
    pub time_in_queue_ns: u64,
    /// Longest time from submit to terminal event, in nanoseconds.
    pub max_time_in_queue_ns: u64,
}

#[derive(Default)]
struct QueueCounters {
    adds: AtomicU64,
    dels: AtomicU64,
    successful_events: AtomicU64,
    failed_events: AtomicU64,
    total_bytes: AtomicU64,
    time_in_queue_ns: AtomicU64,
    max_time_in_queue_ns: AtomicU64,
}

impl QueueCounters {
    fn read(&self, reset: bool) -> QueueStats {
        let take = |counter: &AtomicU64| {
            if reset {
                counter.swap(0, Ordering::Relaxed)
            } else {
                counter.load(Ordering::Relaxed)
            }
        };
        QueueStats {
            adds: take(&self.adds),
            dels: take(&self.dels),
            successful_events: take(&self.successful_events),
            failed_events: take(&self.failed_events),
            total_bytes: take(&self.total_bytes),
            time_in_queue_ns: take(&self.time_in_queue_ns),
            max_time_in_queue_ns: take(&self.max_time_in_queue_ns),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
/// Snapshot of endpoint metrics at a point in time.
pub struct MetricsSnapshot {
    /// Buffer events published to the event queue.
    pub events_produced: u64,
    /// Buffer events popped by the consumer.
    pub events_delivered: u64,
    /// Raw completions that produced no event.
    pub completions_ignored: u64,
    /// Active receives whose reply arrived before the send completion.
    pub replies_reconciled: u64,
    /// Terminal events carrying the cancelled status.
    pub cancellations: u64,
    /// Event queue slots added by provisioning.
    pub slots_appended: u64,
    /// Provisioning attempts that failed to grow the queue.
    pub provision_failures: u64,
    /// Completions that found no provisioned slot.
    pub protocol_violations: u64,
    /// Event waits that reached their deadline.
    pub wait_timeouts: u64,
}

/// Thread-safe endpoint metrics collector.
pub struct FabricMetrics {
    events_produced: AtomicU64,
    events_delivered: AtomicU64,
    completions_ignored: AtomicU64,
    replies_reconciled: AtomicU64,
    cancellations: AtomicU64,
    slots_appended: AtomicU64,
    provision_failures: AtomicU64,
    protocol_violations: AtomicU64,
    wait_timeouts: AtomicU64,
    queues: [QueueCounters; 6],
}

impl Default for FabricMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FabricMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FabricMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl FabricMetrics {
    /// Creates a collector with every counter at zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            events_produced: AtomicU64::new(0),
            events_delivered: AtomicU64::new(0),
            completions_ignored: AtomicU64::new(0),
            replies_reconciled: AtomicU64::new(0),
            cancellations: AtomicU64::new(0),
            slots_appended: AtomicU64::new(0),
            provision_failures: AtomicU64::new(0),
            protocol_violations: AtomicU64::new(0),
            wait_timeouts: AtomicU64::new(0),
            queues: Default::default(),
        }
    }

    fn queue(&self, qtype: QueueType) -> &QueueCounters {
        &self.queues[qtype as usize]
    }

    pub(crate) fn record_add(&self, qtype: QueueType) {
        self.queue(qtype).adds.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_del(&self, qtype: QueueType) {
        self.queue(qtype).dels.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_event(&self, qtype: QueueType, event: &BufferEvent) {
        let queue = self.queue(qtype);
        if event.is_success() {
            queue.successful_events.fetch_add(1, Ordering::Relaxed);
            queue.total_bytes.fetch_add(event.length, Ordering::Relaxed);
        } else {
            queue.failed_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_retired(&self, qtype: QueueType, elapsed_ns: u64) {
        let queue = self.queue(qtype);
        queue.time_in_queue_ns.fetch_add(elapsed_ns, Ordering::Relaxed);
        queue.max_time_in_queue_ns.fetch_max(elapsed_ns, Ordering::Relaxed);
    }

    /// Statistics for one queue type; `reset` zeroes them after reading.
    pub fn queue_stats(&self, qtype: QueueType, reset: bool) -> QueueStats {
        self.queue(qtype).read(reset)
    }

    pub(crate) fn inc_events_produced(&self) {
        self.events_produced.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_events_delivered(&self) {
        self.events_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_completions_ignored(&self) {
        self.completions_ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_replies_reconciled(&self) {
        self.replies_reconciled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_cancellations(&self) {
        self.cancellations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_slots_appended(&self, slots: u64) {
        self.slots_appended.fetch_add(slots, Ordering::Relaxed);
    }

    pub(crate) fn inc_provision_failures(&self) {
        self.provision_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_protocol_violations(&self) {
        self.protocol_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_wait_timeouts(&self) {
        self.wait_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_produced: self.events_produced.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            completions_ignored: self.completions_ignored.load(Ordering::Relaxed),
            replies_reconciled: self.replies_reconciled.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
            slots_appended: self.slots_appended.load(Ordering::Relaxed),
            provision_failures: self.provision_failures.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
            wait_timeouts: self.wait_timeouts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_metrics_new() {
        let metrics = FabricMetrics::new();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_inc_counters() {
        let metrics = FabricMetrics::new();
        metrics.inc_events_produced();
        metrics.inc_events_produced();
        metrics.inc_events_delivered();
        metrics.inc_completions_ignored();
        metrics.inc_replies_reconciled();
        metrics.inc_cancellations();
        metrics.add_slots_appended(5);
        metrics.inc_provision_failures();
        metrics.inc_protocol_violations();
        metrics.inc_wait_timeouts();

        let snap = metrics.snapshot();
        assert_eq!(snap.events_produced, 2);
        assert_eq!(snap.events_delivered, 1);
        assert_eq!(snap.completions_ignored, 1);
        assert_eq!(snap.replies_reconciled, 1);
        assert_eq!(snap.cancellations, 1);
        assert_eq!(snap.slots_appended, 5);
        assert_eq!(snap.provision_failures, 1);
        assert_eq!(snap.protocol_violations, 1);
        assert_eq!(snap.wait_timeouts, 1);
    }

    #[test]
    fn test_queue_stats_by_type() {
        let metrics = FabricMetrics::new();
        metrics.record_add(QueueType::MsgRecv);
        metrics.record_add(QueueType::MsgRecv);
        metrics.record_add(QueueType::MsgSend);
        metrics.record_del(QueueType::MsgRecv);
        let ok = BufferEvent {
            length: 100,
            ..Default::default()
        };
        let failed = BufferEvent {
            status: crate::buffer::STATUS_CANCELED,
            length: 7,
            ..Default::default()
        };
        metrics.record_event(QueueType::MsgRecv, &ok);
        metrics.record_event(QueueType::MsgRecv, &failed);
        metrics.record_retired(QueueType::MsgRecv, 30);
        metrics.record_retired(QueueType::MsgRecv, 10);

        let recv = metrics.queue_stats(QueueType::MsgRecv, false);
        assert_eq!(recv.adds, 2);
        assert_eq!(recv.dels, 1);
        assert_eq!(recv.successful_events, 1);
        assert_eq!(recv.failed_events, 1);
        assert_eq!(recv.total_bytes, 100);
        assert_eq!(recv.time_in_queue_ns, 40);
        assert_eq!(recv.max_time_in_queue_ns, 30);

        let send = metrics.queue_stats(QueueType::MsgSend, false);
        assert_eq!(send.adds, 1);
        assert_eq!(send.successful_events, 0);
    }

    #[test]
    fn test_queue_stats_reset() {
        let metrics = FabricMetrics::new();
        metrics.record_add(QueueType::ActiveBulkRecv);
        metrics.record_retired(QueueType::ActiveBulkRecv, 5);
        let first = metrics.queue_stats(QueueType::ActiveBulkRecv, true);
        assert_eq!(first.adds, 1);
        assert_eq!(first.max_time_in_queue_ns, 5);
        assert_eq!(
            metrics.queue_stats(QueueType::ActiveBulkRecv, false),
            QueueStats::default()
        );
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = FabricMetrics::new();
        metrics.inc_events_delivered();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["events_delivered"], 1);
    }

    #[test]
    fn test_concurrent_metrics() {
        let metrics = Arc::new(FabricMetrics::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        metrics.inc_events_produced();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(metrics.snapshot().events_produced, 4000);
    }
}
