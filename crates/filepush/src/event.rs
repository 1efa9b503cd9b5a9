//! One-way notifications from a pump thread to its owner.
//!
//! The worker side never blocks: events go through an unbounded channel and are
//! dispatched to listeners only when the owner drains its [`EventReceiver`].
//! Every envelope holds a reference to the sending pump's shared state, so that
//! state outlives the delivery even if the pump itself is dropped meanwhile.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::trace;

/// Granularity of [`EventReceiver::recv_timeout`] polling.
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PumpEvent {
    /// The worker thread is up.
    Started,
    /// The copy loop exited, for a stop, a pause or a fatal error.
    Stopped,
    /// No data was available. In stream mode this means a buffer underrun.
    Eof,
    /// Reading failed for good, or the EOF retry budget ran out.
    ReadError,
    /// Writing to the sink failed for good.
    WriteError,
    /// A write to the decoder failed in stream mode; the owner should flush it.
    FlushDecoder,
}

impl fmt::Display for PumpEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Eof => "eof",
            Self::ReadError => "read-error",
            Self::WriteError => "write-error",
            Self::FlushDecoder => "flush-decoder",
        };
        f.write_str(name)
    }
}

/// An event in flight, together with the state of the pump that sent it.
pub struct EventEnvelope<O> {
    event: PumpEvent,
    position: u64,
    origin: Arc<O>,
}

impl<O> EventEnvelope<O> {
    pub fn event(&self) -> PumpEvent {
        self.event
    }

    /// Logical position of the pump when the event was sent.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Shared state of the sending pump, alive at least until this envelope is dropped.
    pub fn origin(&self) -> &Arc<O> {
        &self.origin
    }
}

impl<O> fmt::Debug for EventEnvelope<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEnvelope")
            .field("event", &self.event)
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

/// Worker-side half of the channel.
pub struct EventSender<O> {
    tx: mpsc::UnboundedSender<EventEnvelope<O>>,
    origin: Arc<O>,
}

impl<O> Clone for EventSender<O> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            origin: self.origin.clone(),
        }
    }
}

impl<O> EventSender<O> {
    /// Queue `event` for the owner. Never blocks; events sent after the
    /// receiver is gone are dropped.
    pub fn send(&self, event: PumpEvent, position: u64) {
        let envelope = EventEnvelope {
            event,
            position,
            origin: self.origin.clone(),
        };
        if self.tx.send(envelope).is_err() {
            trace!(%event, "event receiver dropped, discarding event");
        }
    }
}

type Listener<O> = Box<dyn FnMut(&EventEnvelope<O>) + Send>;

/// Owner-side half of the channel. Dispatches to its listeners synchronously,
/// in arrival order.
pub struct EventReceiver<O> {
    rx: mpsc::UnboundedReceiver<EventEnvelope<O>>,
    listeners: Vec<Listener<O>>,
}

impl<O> EventReceiver<O> {
    /// Register a listener called for every event received from now on.
    pub fn subscribe<F>(&mut self, listener: F)
    where
        F: FnMut(&EventEnvelope<O>) + Send + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    /// Deliver one envelope to all listeners, then release it.
    pub fn receive(&mut self, envelope: EventEnvelope<O>) -> PumpEvent {
        for listener in &mut self.listeners {
            listener(&envelope);
        }
        envelope.event
    }

    /// Deliver everything already queued without waiting. Returns the number of events.
    pub fn dispatch_pending(&mut self) -> usize {
        let mut delivered = 0;
        while let Ok(envelope) = self.rx.try_recv() {
            self.receive(envelope);
            delivered += 1;
        }
        delivered
    }

    /// Wait for the next event from a plain thread.
    ///
    /// Returns `None` once every sender is gone. Must not be called from
    /// within an async runtime; use [`EventReceiver::next`] there.
    pub fn blocking_next(&mut self) -> Option<PumpEvent> {
        let envelope = self.rx.blocking_recv()?;
        Some(self.receive(envelope))
    }

    /// Like [`EventReceiver::blocking_next`], giving up after `timeout`.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<PumpEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.rx.try_recv() {
                Ok(envelope) => return Some(self.receive(envelope)),
                Err(mpsc::error::TryRecvError::Disconnected) => return None,
                Err(mpsc::error::TryRecvError::Empty) => {
                    if Instant::now() >= deadline {
                        return None;
                    }
                    std::thread::sleep(RECV_POLL_INTERVAL);
                }
            }
        }
    }

    /// Wait for the next event from async code.
    pub async fn next(&mut self) -> Option<PumpEvent> {
        let envelope = self.rx.recv().await?;
        Some(self.receive(envelope))
    }
}

/// Create a channel whose envelopes keep `origin` alive until delivered.
pub fn event_channel<O>(origin: Arc<O>) -> (EventSender<O>, EventReceiver<O>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        EventSender { tx, origin },
        EventReceiver {
            rx,
            listeners: Vec::new(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn delivers_in_arrival_order() {
        let (tx, mut rx) = event_channel(Arc::new(()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        rx.subscribe(move |envelope| sink.lock().push((envelope.event(), envelope.position())));

        tx.send(PumpEvent::Started, 0);
        tx.send(PumpEvent::Eof, 188);
        tx.send(PumpEvent::Stopped, 376);

        assert_eq!(rx.dispatch_pending(), 3);
        assert_eq!(
            *seen.lock(),
            vec![
                (PumpEvent::Started, 0),
                (PumpEvent::Eof, 188),
                (PumpEvent::Stopped, 376)
            ]
        );
    }

    #[test]
    fn envelope_keeps_origin_alive_until_received() {
        let origin = Arc::new(String::from("pump"));
        let weak = Arc::downgrade(&origin);
        let (tx, mut rx) = event_channel(origin);

        tx.send(PumpEvent::Stopped, 0);
        drop(tx);
        // Only the queued envelope holds the origin now
        assert!(weak.upgrade().is_some());

        assert_eq!(rx.blocking_next(), Some(PumpEvent::Stopped));
        assert!(weak.upgrade().is_none());
        assert_eq!(rx.blocking_next(), None);
    }

    #[test]
    fn send_after_receiver_drop_is_ignored() {
        let (tx, rx) = event_channel(Arc::new(()));
        drop(rx);
        tx.send(PumpEvent::ReadError, 0);
    }

    #[test]
    fn recv_timeout_gives_up() {
        let (_tx, mut rx) = event_channel(Arc::new(()));
        assert_eq!(rx.recv_timeout(Duration::from_millis(10)), None);
    }
}
