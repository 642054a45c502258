//! Completion translation: raw fabric completions in, buffer events out.
//!
//! [`translate`] is the per-completion state machine. It turns one
//! [`RawCompletion`] into at most one [`BufferEvent`], reconciling active
//! receives whose reply arrives before the send completion.
//! [`CompletionTranslator`] is the [`CompletionSink`] an endpoint attaches to
//! the fabric; it runs the state machine under the producer lock and
//! publishes the result to the endpoint's event queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::addr::EndpointAddr;
use crate::bev_queue::BevProducer;
use crate::buffer::{BufferEvent, BufferId, InflightOp, QueueType, STATUS_CANCELED};
use crate::fabric::{decode_sender, CompletionKind, CompletionSink, RawCompletion};
use crate::metrics::FabricMetrics;
use crate::semaphore::Semaphore;

/// Outcome of translating one raw completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Translation {
    /// Publish this event.
    Emit {
        /// The event to publish.
        event: BufferEvent,
        /// True if the event carries a reply saved earlier.
        reconciled: bool,
    },
    /// Reply data was saved; the event follows with the send completion.
    Deferred,
    /// The completion produces no event.
    Ignored,
}

/// Nanoseconds since the UNIX epoch.
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Translates one completion for the buffer described by `op`.
pub fn translate(completion: &RawCompletion, op: &mut InflightOp, timestamp_ns: u64) -> Translation {
    let mut event = BufferEvent {
        buffer_id: completion.buffer_id,
        timestamp_ns,
        status: completion.status,
        length: completion.length,
        offset: completion.offset,
        sender: None,
        unlinked: completion.unlinked,
    };

    match completion.kind {
        CompletionKind::Ack => return Translation::Ignored,
        CompletionKind::Send if op.qtype == QueueType::ActiveBulkRecv => {
            if !completion.unlinked {
                return Translation::Ignored;
            }
            if op.scratch.reply_seen {
                event.status = op.scratch.status;
                event.length = op.scratch.length;
                event.offset = op.scratch.offset;
                return Translation::Emit {
                    event,
                    reconciled: true,
                };
            }
            event.status = STATUS_CANCELED;
            event.length = 0;
            event.offset = 0;
        }
        CompletionKind::Reply if !completion.unlinked => {
            op.scratch.reply_seen = true;
            op.scratch.status = completion.status;
            op.scratch.length = completion.length;
            op.scratch.offset = completion.offset;
            return Translation::Deferred;
        }
        CompletionKind::Unlink => {
            event.status = STATUS_CANCELED;
            event.unlinked = true;
        }
        CompletionKind::Put if op.qtype == QueueType::MsgRecv => {
            event.sender = completion
                .peer
                .map(|peer| decode_sender(peer, completion.routing_tag));
        }
        _ => {}
    }

    Translation::Emit {
        event,
        reconciled: false,
    }
}

/// The fabric-facing producer of one endpoint's buffer events.
pub struct CompletionTranslator {
    addr: EndpointAddr,
    producer: Mutex<Option<BevProducer<BufferEvent>>>,
    inflight: Arc<DashMap<BufferId, InflightOp>>,
    sem: Arc<Semaphore>,
    metrics: Arc<FabricMetrics>,
    failed: AtomicBool,
}

impl CompletionTranslator {
    pub(crate) fn new(
        addr: EndpointAddr,
        producer: BevProducer<BufferEvent>,
        inflight: Arc<DashMap<BufferId, InflightOp>>,
        sem: Arc<Semaphore>,
        metrics: Arc<FabricMetrics>,
    ) -> Self {
        Self {
            addr,
            producer: Mutex::new(Some(producer)),
            inflight,
            sem,
            metrics,
            failed: AtomicBool::new(false),
        }
    }

    /// Returns true once a completion found no provisioned slot.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub(crate) fn take_producer(&self) -> Option<BevProducer<BufferEvent>> {
        self.producer.lock().take()
    }

    /// Translates and publishes under the producer lock. Returns true if the consumer must be woken.
    fn produce(&self, completion: &RawCompletion) -> bool {
        let mut guard = self.producer.lock();
        let Some(producer) = guard.as_mut() else {
            warn!(endpoint = %self.addr, buffer = %completion.buffer_id, "completion after endpoint stop");
            return false;
        };

        let translation = match self.inflight.get_mut(&completion.buffer_id) {
            Some(mut op) => translate(completion, &mut op, now_ns()),
            None => {
                warn!(
                    endpoint = %self.addr,
                    buffer = %completion.buffer_id,
                    kind = ?completion.kind,
                    "completion for a buffer with no operation in flight"
                );
                Translation::Ignored
            }
        };

        let (event, reconciled) = match translation {
            Translation::Emit { event, reconciled } => (event, reconciled),
            Translation::Deferred => {
                debug!(buffer = %completion.buffer_id, "reply arrived before send completion");
                return false;
            }
            Translation::Ignored => {
                self.metrics.inc_completions_ignored();
                return false;
            }
        };

        match producer.reserve_next() {
            Some(slot) => {
                *slot = event;
                producer.publish();
            }
            None => {
                self.failed.store(true, Ordering::Release);
                self.metrics.inc_protocol_violations();
                error!(
                    endpoint = %self.addr,
                    buffer = %event.buffer_id,
                    "buffer event queue full: completion arrived without a provisioned slot"
                );
                return true;
            }
        }

        self.metrics.inc_events_produced();
        if reconciled {
            self.metrics.inc_replies_reconciled();
        }
        if event.is_canceled() {
            self.metrics.inc_cancellations();
        }
        true
    }
}

impl CompletionSink for CompletionTranslator {
    fn on_completion(&self, completion: RawCompletion) {
        if self.produce(&completion) {
            self.sem.up();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Nid;
    use crate::bev_queue::BevQueue;
    use crate::fabric::{sender_tag, PeerId};

    fn completion(kind: CompletionKind, unlinked: bool) -> RawCompletion {
        RawCompletion {
            unlinked,
            ..RawCompletion::new(kind, BufferId(1))
        }
    }

    fn emitted(t: Translation) -> BufferEvent {
        match t {
            Translation::Emit { event, .. } => event,
            other => panic!("expected an event, got {:?}", other),
        }
    }

    #[test]
    fn test_ack_is_ignored() {
        let mut op = InflightOp::new(QueueType::MsgSend, 1);
        let t = translate(&completion(CompletionKind::Ack, false), &mut op, 0);
        assert_eq!(t, Translation::Ignored);
    }

    #[test]
    fn test_active_recv_in_order() {
        let mut op = InflightOp::new(QueueType::ActiveBulkRecv, 1);
        let send = completion(CompletionKind::Send, false);
        assert_eq!(translate(&send, &mut op, 0), Translation::Ignored);

        let reply = RawCompletion {
            length: 4096,
            ..completion(CompletionKind::Reply, true)
        };
        let ev = emitted(translate(&reply, &mut op, 5));
        assert_eq!(ev.length, 4096);
        assert_eq!(ev.timestamp_ns, 5);
        assert!(ev.unlinked);
        assert!(ev.is_success());
    }

    #[test]
    fn test_active_recv_reply_first() {
        let mut op = InflightOp::new(QueueType::ActiveBulkRecv, 1);
        let reply = RawCompletion {
            length: 100,
            offset: 3,
            status: 0,
            ..completion(CompletionKind::Reply, false)
        };
        assert_eq!(translate(&reply, &mut op, 0), Translation::Deferred);
        assert!(op.scratch.reply_seen);

        let send = RawCompletion {
            status: -5,
            ..completion(CompletionKind::Send, true)
        };
        match translate(&send, &mut op, 0) {
            Translation::Emit { event, reconciled } => {
                assert!(reconciled);
                assert_eq!((event.length, event.offset, event.status), (100, 3, 0));
                assert!(event.unlinked);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_active_recv_terminal_send_without_reply_is_canceled() {
        let mut op = InflightOp::new(QueueType::ActiveBulkRecv, 1);
        let send = RawCompletion {
            length: 12,
            ..completion(CompletionKind::Send, true)
        };
        let ev = emitted(translate(&send, &mut op, 0));
        assert!(ev.is_canceled());
        assert_eq!(ev.length, 0);
    }

    #[test]
    fn test_unlink_forces_canceled() {
        let mut op = InflightOp::new(QueueType::PassiveBulkRecv, 1);
        let unlink = RawCompletion {
            status: 0,
            ..completion(CompletionKind::Unlink, false)
        };
        let ev = emitted(translate(&unlink, &mut op, 0));
        assert_eq!(ev.status, STATUS_CANCELED);
        assert!(ev.unlinked);
    }

    #[test]
    fn test_message_receive_decodes_sender() {
        let sender = EndpointAddr::parse("127.0.0.1@tcp:12345:30:10").unwrap();
        let mut op = InflightOp::new(QueueType::MsgRecv, 4);
        let put = RawCompletion {
            length: 20,
            offset: 40,
            routing_tag: sender_tag(&sender),
            peer: Some(PeerId {
                nid: sender.nid,
                pid: sender.pid,
            }),
            ..completion(CompletionKind::Put, false)
        };
        let ev = emitted(translate(&put, &mut op, 0));
        assert_eq!(ev.sender, Some(sender));
        assert_eq!(ev.offset, 40);
        assert!(!ev.unlinked);
    }

    #[test]
    fn test_passive_put_has_no_sender() {
        let mut op = InflightOp::new(QueueType::PassiveBulkRecv, 1);
        let put = RawCompletion {
            peer: Some(PeerId {
                nid: Nid::LOOPBACK,
                pid: 1,
            }),
            ..completion(CompletionKind::Put, true)
        };
        assert_eq!(emitted(translate(&put, &mut op, 0)).sender, None);
    }

    fn translator(capacity: usize) -> (CompletionTranslator, crate::bev_queue::BevConsumer<BufferEvent>) {
        let (producer, consumer) = BevQueue::new::<BufferEvent>(capacity).unwrap();
        let addr = EndpointAddr::new(Nid::LOOPBACK, 1, 30, 1);
        let t = CompletionTranslator::new(
            addr,
            producer,
            Arc::new(DashMap::new()),
            Arc::new(Semaphore::new(0)),
            Arc::new(FabricMetrics::new()),
        );
        (t, consumer)
    }

    #[test]
    fn test_sink_publishes_and_signals() {
        let (t, mut consumer) = translator(2);
        t.inflight.insert(BufferId(1), InflightOp::new(QueueType::MsgSend, 1));
        t.on_completion(completion(CompletionKind::Send, true));
        assert_eq!(t.sem.value(), 1);
        let ev = consumer.pop().unwrap();
        assert_eq!(ev.buffer_id, BufferId(1));
        assert_eq!(t.metrics.snapshot().events_produced, 1);
    }

    #[test]
    fn test_sink_overflow_marks_failed() {
        let (t, _consumer) = translator(2);
        t.inflight.insert(BufferId(1), InflightOp::new(QueueType::MsgRecv, 1));
        t.on_completion(completion(CompletionKind::Put, false));
        assert!(!t.is_failed());
        t.on_completion(completion(CompletionKind::Put, false));
        assert!(t.is_failed());
        assert_eq!(t.sem.value(), 2);
        assert_eq!(t.metrics.snapshot().protocol_violations, 1);
    }

    #[test]
    fn test_sink_ignores_unknown_buffer() {
        let (t, consumer) = translator(2);
        t.on_completion(completion(CompletionKind::Put, true));
        assert_eq!(t.sem.value(), 0);
        assert!(consumer.is_empty());
        assert_eq!(t.metrics.snapshot().completions_ignored, 1);
    }
}
