//! Demultiplexer to sink copy loop for recording and network streaming.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::{RecorderConfig, SessionConfig};
use crate::control::{PauseController, PumpState};
use crate::error::{IoClass, PumpError, classify};
use crate::event::{EventReceiver, EventSender, PumpEvent, event_channel};
use crate::framing::{InterleavedFramer, ReplyQueue};
use crate::interrupt::WorkerInterrupter;
use crate::sink::RecordSink;
use crate::source::DemuxSource;

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(10);
const READ_ERROR_DELAY: Duration = Duration::from_secs(1);

/// State shared between a recorder, its worker and in-flight events.
pub struct RecorderShared {
    control: PauseController,
    interrupter: WorkerInterrupter,
    overflow_count: AtomicU64,
    decrypt_errors: AtomicU64,
    replies: ReplyQueue,
}

impl RecorderShared {
    pub fn overflow_count(&self) -> u64 {
        self.overflow_count.load(Ordering::Relaxed)
    }

    pub fn decrypt_error_count(&self) -> u64 {
        self.decrypt_errors.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> PumpState {
        self.control.state()
    }
}

pub type RecorderEvents = EventReceiver<RecorderShared>;

/// What the worker borrows for the duration of a run and hands back on exit.
struct RecorderParts {
    sink: Box<dyn RecordSink>,
    buffer: Vec<u8>,
    framer: InterleavedFramer,
}

/// Recording pump: reads a demultiplexer and writes every batch to a
/// [`RecordSink`], optionally wrapped in interleaved frames.
///
/// Unlike [`PumpThread`](crate::PumpThread) it has no pause support.
pub struct RecorderPumpThread {
    config: RecorderConfig,
    shared: Arc<RecorderShared>,
    events_tx: EventSender<RecorderShared>,
    events_rx: Option<RecorderEvents>,
    parts: Option<RecorderParts>,
    worker: Option<JoinHandle<RecorderParts>>,
}

impl RecorderPumpThread {
    pub fn new(config: RecorderConfig, sink: Box<dyn RecordSink>) -> Result<Self, PumpError> {
        config.validate()?;
        let replies = ReplyQueue::default();
        let shared = Arc::new(RecorderShared {
            control: PauseController::new(),
            interrupter: WorkerInterrupter::new(),
            overflow_count: AtomicU64::new(0),
            decrypt_errors: AtomicU64::new(0),
            replies: replies.clone(),
        });
        let (events_tx, events_rx) = event_channel(shared.clone());
        let framer = InterleavedFramer::new(config.session, replies, config.frame_window());
        let parts = RecorderParts {
            sink,
            buffer: vec![0u8; config.buffer_size],
            framer,
        };
        Ok(Self {
            config,
            shared,
            events_tx,
            events_rx: Some(events_rx),
            parts: Some(parts),
            worker: None,
        })
    }

    pub fn events(&mut self) -> Result<RecorderEvents, PumpError> {
        self.events_rx.take().ok_or(PumpError::EventsTaken)
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn shared(&self) -> &Arc<RecorderShared> {
        &self.shared
    }

    pub fn state(&self) -> PumpState {
        self.shared.state()
    }

    /// Number of overflow conditions reported by the source so far.
    pub fn overflow_count(&self) -> u64 {
        self.shared.overflow_count()
    }

    /// Number of media units that arrived still scrambled.
    pub fn decrypt_error_count(&self) -> u64 {
        self.shared.decrypt_error_count()
    }

    /// Session used for framing. Takes effect at the next `start`.
    pub fn set_session(&mut self, session: SessionConfig) {
        if self.worker.is_some() && self.state() != PumpState::Stopped {
            warn!("session changed while recording, applies from the next start");
        }
        self.config.session = session;
    }

    /// Queue protocol-reply bytes to go out ahead of the next framed batch.
    pub fn push_reply(&self, reply: &[u8]) {
        let mut replies = self.shared.replies.lock();
        replies.extend_from_slice(reply);
        debug!(bytes = reply.len(), queued = replies.len(), "pushed reply");
    }

    pub fn start(&mut self, source: Arc<dyn DemuxSource>) -> Result<(), PumpError> {
        self.shared.control.begin_run()?;
        self.reap();
        let Some(mut parts) = self.parts.take() else {
            self.shared.control.abort_run();
            return Err(PumpError::SinkLost);
        };
        parts.framer.set_session(self.config.session);

        let worker = RecorderWorker {
            interleaved: self.config.session.protocol.is_interleaved(),
            idle_delay: self.config.idle_delay(),
            shared: self.shared.clone(),
            events: self.events_tx.clone(),
            source,
        };

        let spawned = thread::Builder::new()
            .name("filepush-rec".into())
            .spawn(move || worker.run(parts));
        match spawned {
            Ok(handle) => {
                self.shared.interrupter.attach(&handle);
                self.worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                // The closure owning the parts is gone with the failed spawn.
                self.shared.control.abort_run();
                Err(PumpError::Spawn(e))
            }
        }
    }

    /// Stop the worker and wait for it to exit. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if self.worker.is_none() {
            return;
        }
        if self.shared.control.request_stop() {
            debug!("stopping recorder thread");
        }
        if !self.reap() {
            self.shared.control.abort_run();
        }
    }

    /// Wait for the worker to finish. Returns `false` if it panicked, in
    /// which case the sink is gone with it.
    fn reap(&mut self) -> bool {
        let Some(handle) = self.worker.take() else {
            return true;
        };
        while !handle.is_finished() {
            self.shared.interrupter.interrupt();
            thread::sleep(STOP_POLL_INTERVAL);
        }
        self.shared.interrupter.detach();
        match handle.join() {
            Ok(parts) => {
                self.parts = Some(parts);
                true
            }
            Err(_) => {
                warn!("recorder thread panicked");
                false
            }
        }
    }
}

impl Drop for RecorderPumpThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Marks the recorder Stopped if the worker unwinds before it can park.
struct UnwindGuard {
    shared: Arc<RecorderShared>,
    events: EventSender<RecorderShared>,
    written: u64,
}

impl Drop for UnwindGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            self.shared.control.worker_lost();
            self.events.send(PumpEvent::Stopped, self.written);
        }
    }
}

struct RecorderWorker {
    interleaved: bool,
    idle_delay: Duration,
    shared: Arc<RecorderShared>,
    events: EventSender<RecorderShared>,
    source: Arc<dyn DemuxSource>,
}

impl RecorderWorker {
    fn run(self, mut parts: RecorderParts) -> RecorderParts {
        let mut unwind = UnwindGuard {
            shared: self.shared.clone(),
            events: self.events.clone(),
            written: 0,
        };
        debug!(interleaved = self.interleaved, "START recorder thread");
        self.events.send(PumpEvent::Started, 0);

        loop {
            self.record(&mut parts, &mut unwind.written);
            if let Err(e) = parts.sink.flush() {
                warn!(error = %e, "flushing sink failed");
            }
            self.events.send(PumpEvent::Stopped, unwind.written);
            if !self.shared.control.park() {
                break;
            }
        }

        debug!(written = unwind.written, "STOP recorder thread");
        parts
    }

    fn halted(&self) -> bool {
        self.shared.control.should_halt()
    }

    fn record(&self, parts: &mut RecorderParts, written: &mut u64) {
        let RecorderParts {
            sink,
            buffer,
            framer,
        } = parts;

        while !self.halted() {
            let read = if self.interleaved {
                let read = framer.fill(self.source.as_ref(), buffer);
                self.shared
                    .decrypt_errors
                    .store(framer.decrypt_errors(), Ordering::Relaxed);
                read
            } else {
                self.source.read(buffer)
            };

            let len = match read {
                Ok(0) => {
                    self.shared.control.nap(self.idle_delay);
                    continue;
                }
                Ok(n) => n,
                Err(e) => {
                    if self.halted() {
                        break;
                    }
                    match classify(&e) {
                        IoClass::Retry => continue,
                        IoClass::Overflow => {
                            let overflows = &self.shared.overflow_count;
                            let count = overflows.fetch_add(1, Ordering::Relaxed) + 1;
                            warn!(count, "demux overflow");
                            continue;
                        }
                        IoClass::Fatal => {
                            debug!(error = %e, "demux read error");
                            self.shared.control.nap(READ_ERROR_DELAY);
                            self.events.send(PumpEvent::ReadError, *written);
                            break;
                        }
                    }
                }
            };

            let halted = || self.halted();
            match sink.write_data(&buffer[..len], &halted) {
                Ok(n) => *written += n as u64,
                Err(_) if self.halted() => break,
                Err(e) => {
                    debug!(error = %e, "recorder write error");
                    self.events.send(PumpEvent::WriteError, *written);
                    break;
                }
            }
        }
    }
}
