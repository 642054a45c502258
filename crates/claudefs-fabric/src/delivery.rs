//! Event delivery: the single consumer of an endpoint's buffer events.
//!
//! [`EventDelivery`] runs one dedicated thread per endpoint. The thread sleeps
//! on the endpoint's semaphore, drains every pending event into a
//! [`BufferEventSink`], and exits once shutdown has been requested and every
//! outstanding buffer has delivered its terminal event.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::buffer::BufferEvent;
use crate::endpoint::CoreEndpoint;
use crate::error::{FabricError, FabricResult};

/// Receives buffer events from the delivery thread.
pub trait BufferEventSink: Send + 'static {
    /// Hands one event upward.
    fn deliver(&mut self, event: BufferEvent);
}

impl<F> BufferEventSink for F
where
    F: FnMut(BufferEvent) + Send + 'static,
{
    fn deliver(&mut self, event: BufferEvent) {
        self(event)
    }
}

/// Forwards events into a tokio channel for async consumers.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<BufferEvent>,
}

impl ChannelSink {
    /// Creates the sink and the receiver that observes its events.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BufferEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl BufferEventSink for ChannelSink {
    fn deliver(&mut self, event: BufferEvent) {
        if self.tx.send(event).is_err() {
            warn!(buffer = %event.buffer_id, "event receiver dropped, discarding event");
        }
    }
}

/// How the delivery thread should finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Wait for application buffers to complete on their own.
    Drain,
    /// Cancel outstanding buffers, then drain their cancellation events.
    Abort,
}

const RUNNING: u8 = 0;
const SHUTDOWN: u8 = 1;

/// Handle to a running delivery thread.
pub struct EventDelivery {
    endpoint: Arc<CoreEndpoint>,
    state: Arc<AtomicU8>,
    thread: Option<JoinHandle<FabricResult<()>>>,
}

impl EventDelivery {
    /// Starts the delivery thread for `endpoint`.
    pub fn spawn<S: BufferEventSink>(
        endpoint: Arc<CoreEndpoint>,
        sink: S,
        wait_timeout: Duration,
    ) -> FabricResult<Self> {
        let state = Arc::new(AtomicU8::new(RUNNING));
        let thread = {
            let endpoint = Arc::clone(&endpoint);
            let state = Arc::clone(&state);
            std::thread::Builder::new()
                .name(format!("bev-{}", endpoint.addr().tmid.unwrap_or(0)))
                .spawn(move || run(endpoint, sink, state, wait_timeout))?
        };
        Ok(Self {
            endpoint,
            state,
            thread: Some(thread),
        })
    }

    /// The endpoint being served.
    pub fn endpoint(&self) -> &Arc<CoreEndpoint> {
        &self.endpoint
    }

    /// Returns true while the delivery thread is running.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |t| !t.is_finished())
    }

    /// Requests shutdown and joins the thread; the endpoint is stopped on success.
    ///
    /// Receive buffers supplied by an attached pool are cancelled in either mode.
    pub fn shutdown(mut self, mode: ShutdownMode) -> FabricResult<()> {
        self.state.store(SHUTDOWN, Ordering::Release);
        let released = self.endpoint.detach_pool();
        if released > 0 {
            info!(endpoint = %self.endpoint.addr(), released, "cancelling pool receive buffers");
        }
        if mode == ShutdownMode::Abort {
            let cancelled = self.endpoint.cancel_all();
            info!(endpoint = %self.endpoint.addr(), cancelled, "aborting outstanding buffers");
        }
        self.endpoint.wake();
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| FabricError::Fabric {
                reason: "delivery thread panicked".to_string(),
            })?,
            None => Ok(()),
        }
    }
}

impl Drop for EventDelivery {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.state.store(SHUTDOWN, Ordering::Release);
            self.endpoint.wake();
        }
    }
}

fn run<S: BufferEventSink>(
    endpoint: Arc<CoreEndpoint>,
    mut sink: S,
    state: Arc<AtomicU8>,
    wait_timeout: Duration,
) -> FabricResult<()> {
    info!(endpoint = %endpoint.addr(), "delivery loop started");
    loop {
        if endpoint.wait_wakeup(Instant::now() + wait_timeout) {
            while let Some(event) = endpoint.next_event() {
                sink.deliver(event);
            }
        }

        if endpoint.is_stopped() && endpoint.outstanding() > 0 {
            let err = FabricError::ProtocolViolation {
                reason: format!("endpoint {} lost a completion event", endpoint.addr()),
            };
            error!(endpoint = %endpoint.addr(), error = %err, "delivery loop aborted");
            return Err(err);
        }

        if state.load(Ordering::Acquire) == SHUTDOWN
            && endpoint.outstanding() == 0
            && endpoint.is_queue_empty()
        {
            endpoint.stop()?;
            info!(endpoint = %endpoint.addr(), "delivery loop exited");
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_forwards() {
        let (mut sink, mut rx) = ChannelSink::new();
        let event = BufferEvent {
            length: 9,
            ..Default::default()
        };
        sink.deliver(event);
        assert_eq!(rx.recv().await, Some(event));
    }

    #[test]
    fn test_channel_sink_tolerates_dropped_receiver() {
        let (mut sink, rx) = ChannelSink::new();
        drop(rx);
        sink.deliver(BufferEvent::default());
    }

    fn feed<S: BufferEventSink>(sink: &mut S, length: u64) {
        sink.deliver(BufferEvent {
            length,
            ..Default::default()
        });
    }

    #[test]
    fn test_closure_sink() {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut sink = move |e: BufferEvent| {
            let _ = tx.send(e.length);
        };
        feed(&mut sink, 3);
        feed(&mut sink, 4);
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![3, 4]);
    }
}
