//! Source to sink copy loop for playback.
//!
//! A [`PumpThread`] owns one worker thread that reads block-aligned chunks
//! from a [`TsSource`], optionally follows a [`SpanProvider`] through a
//! piecewise-virtual timeline, and writes every chunk to a [`Sink`]. EOF is
//! retried with a bounded budget whose size depends on whether the source is
//! a finite file or a live stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::config::PumpConfig;
use crate::control::{PauseController, PumpState};
use crate::error::{IoClass, PumpError, classify};
use crate::event::{EventReceiver, EventSender, PumpEvent, event_channel};
use crate::interrupt::WorkerInterrupter;
use crate::sink::Sink;
use crate::source::TsSource;
use crate::span::SpanProvider;

/// How often `stop()` re-sends the interrupt while waiting for the worker.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Hook run on every block read before it is written.
///
/// A block is filtered once per write attempt. If a pause or stop interrupts
/// a write that the sink has not fully accepted, the block is read and
/// filtered again after a resume.
pub trait DataFilter: Send {
    fn filter(&mut self, data: &mut [u8]);
}

impl<F> DataFilter for F
where
    F: FnMut(&mut [u8]) + Send,
{
    fn filter(&mut self, data: &mut [u8]) {
        self(data)
    }
}

/// State shared between a pump, its worker and in-flight events.
pub struct PumpShared {
    control: PauseController,
    interrupter: WorkerInterrupter,
    position: AtomicU64,
    stream_mode: AtomicBool,
    commit_on_eof: AtomicBool,
    span_provider: Mutex<Option<Arc<dyn SpanProvider>>>,
    filter: Mutex<Option<Box<dyn DataFilter>>>,
}

impl PumpShared {
    /// Logical position of the next read.
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    pub fn state(&self) -> PumpState {
        self.control.state()
    }

    pub fn stream_mode(&self) -> bool {
        self.stream_mode.load(Ordering::Relaxed)
    }
}

pub type PumpEvents = EventReceiver<PumpShared>;

/// Playback pump: copies a positioned source into a sink on its own thread.
pub struct PumpThread {
    config: PumpConfig,
    shared: Arc<PumpShared>,
    events_tx: EventSender<PumpShared>,
    events_rx: Option<PumpEvents>,
    buffer: Option<Vec<u8>>,
    worker: Option<JoinHandle<Vec<u8>>>,
}

impl PumpThread {
    pub fn new(config: PumpConfig) -> Result<Self, PumpError> {
        config.validate()?;
        let shared = Arc::new(PumpShared {
            control: PauseController::new(),
            interrupter: WorkerInterrupter::new(),
            position: AtomicU64::new(0),
            stream_mode: AtomicBool::new(config.stream_mode),
            commit_on_eof: AtomicBool::new(config.commit_on_eof),
            span_provider: Mutex::new(None),
            filter: Mutex::new(None),
        });
        let (events_tx, events_rx) = event_channel(shared.clone());
        let buffer = vec![0u8; config.buffer_size];
        Ok(Self {
            config,
            shared,
            events_tx,
            events_rx: Some(events_rx),
            buffer: Some(buffer),
            worker: None,
        })
    }

    /// Take the owner side of the event channel. Only possible once.
    pub fn events(&mut self) -> Result<PumpEvents, PumpError> {
        self.events_rx.take().ok_or(PumpError::EventsTaken)
    }

    pub fn config(&self) -> &PumpConfig {
        &self.config
    }

    pub fn shared(&self) -> &Arc<PumpShared> {
        &self.shared
    }

    pub fn position(&self) -> u64 {
        self.shared.position()
    }

    pub fn state(&self) -> PumpState {
        self.shared.state()
    }

    pub fn enable_commit_on_eof(&self, enabled: bool) {
        self.shared.commit_on_eof.store(enabled, Ordering::Relaxed);
    }

    pub fn set_stream_mode(&self, enabled: bool) {
        self.shared.stream_mode.store(enabled, Ordering::Relaxed);
    }

    pub fn set_span_provider(&self, provider: Option<Arc<dyn SpanProvider>>) {
        *self.shared.span_provider.lock() = provider;
    }

    pub fn set_filter(&self, filter: Option<Box<dyn DataFilter>>) {
        *self.shared.filter.lock() = filter;
    }

    /// Start pumping `source` into `sink` from position 0.
    pub fn start(
        &mut self,
        source: Arc<dyn TsSource>,
        sink: Arc<dyn Sink>,
    ) -> Result<(), PumpError> {
        self.shared.control.begin_run()?;
        // A previous run that ended on its own still has to be reaped.
        self.reap();
        self.shared.position.store(0, Ordering::Release);

        let buffer = self
            .buffer
            .take()
            .unwrap_or_else(|| vec![0u8; self.config.buffer_size]);
        let worker = Worker {
            config: self.config.clone(),
            shared: self.shared.clone(),
            events: self.events_tx.clone(),
            source,
            sink,
            buffer,
            position: 0,
        };

        let spawned = thread::Builder::new()
            .name("filepush".into())
            .spawn(move || worker.run());
        match spawned {
            Ok(handle) => {
                self.shared.interrupter.attach(&handle);
                self.worker = Some(handle);
                Ok(())
            }
            Err(e) => {
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
            debug!("stopping thread");
        }
        if !self.reap() {
            self.shared.control.abort_run();
        }
    }

    /// Pause the worker, returning once it is parked.
    pub fn pause(&self) {
        let shared = &self.shared;
        if shared.control.pause(&|| shared.interrupter.interrupt()) {
            debug!(position = shared.position(), "pump paused");
        }
    }

    pub fn resume(&self) {
        if self.shared.control.resume() {
            debug!(position = self.shared.position(), "pump resumed");
        }
    }

    /// Wait for the worker to finish. Returns `false` if it panicked.
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
            Ok(buffer) => {
                self.buffer = Some(buffer);
                true
            }
            Err(_) => {
                warn!("pump thread panicked");
                false
            }
        }
    }
}

impl Drop for PumpThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Everything the worker thread owns while running.
struct Worker {
    config: PumpConfig,
    shared: Arc<PumpShared>,
    events: EventSender<PumpShared>,
    source: Arc<dyn TsSource>,
    sink: Arc<dyn Sink>,
    buffer: Vec<u8>,
    position: u64,
}

/// Marks the pump Stopped if the worker unwinds before it can park.
struct UnwindGuard {
    shared: Arc<PumpShared>,
    events: EventSender<PumpShared>,
}

impl Drop for UnwindGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            self.shared.control.worker_lost();
            self.events.send(PumpEvent::Stopped, self.shared.position());
        }
    }
}

/// Outcome of the write half of one iteration.
enum WriteOutcome {
    Complete,
    Halted,
    Failed,
}

impl Worker {
    fn run(mut self) -> Vec<u8> {
        let _unwind = UnwindGuard {
            shared: self.shared.clone(),
            events: self.events.clone(),
        };
        debug!("START thread");
        self.send(PumpEvent::Started);
        loop {
            self.pump();
            self.send(PumpEvent::Stopped);
            if !self.shared.control.park() {
                break;
            }
        }
        debug!(position = self.position, "STOP thread");
        self.buffer
    }

    fn send(&self, event: PumpEvent) {
        self.events.send(event, self.position);
    }

    fn halted(&self) -> bool {
        self.shared.control.should_halt()
    }

    fn commit_position(&mut self, position: u64) {
        self.position = position;
        self.shared.position.store(position, Ordering::Release);
    }

    /// One run of the copy loop, until stop, pause or a fatal error.
    fn pump(&mut self) {
        let block = self.config.block_size;
        let mut eof_count = 0u32;
        let mut bytes_since_span = 0u64;
        let mut span_remaining = 0u64;

        while !self.halted() {
            let provider = self.shared.span_provider.lock().clone();

            if let Some(provider) = &provider
                && span_remaining == 0
            {
                let span = provider.next_span(self.position, bytes_since_span, block);
                assert!(
                    span.length % block as u64 == 0,
                    "span length {} is not a multiple of the block size {block}",
                    span.length
                );
                trace!(offset = span.offset, length = span.length, "next span");
                self.commit_position(span.offset);
                bytes_since_span = 0;
                span_remaining = span.length;
            }

            let mut max_read = self.buffer.len();
            if provider.is_some() {
                max_read = max_read.min(usize::try_from(span_remaining).unwrap_or(usize::MAX));
            }
            max_read -= max_read % block;

            let read = if max_read > 0 {
                let started = Instant::now();
                let read = self
                    .source
                    .read_at(self.position, &mut self.buffer[..max_read]);
                trace!(
                    result = ?read.as_ref().map_err(|e| e.kind()),
                    elapsed_us = started.elapsed().as_micros() as u64,
                    "read"
                );
                read
            } else {
                Ok(0)
            };

            let mut produced = match read {
                Ok(n) => n.min(max_read),
                Err(e) => {
                    if self.halted() {
                        break;
                    }
                    match classify(&e) {
                        IoClass::Retry => continue,
                        IoClass::Overflow => {
                            warn!("OVERFLOW while playback?");
                            continue;
                        }
                        IoClass::Fatal => {
                            debug!(error = %e, "read error");
                            self.shared.control.nap(self.config.read_error_delay());
                            self.send(PumpEvent::ReadError);
                            break;
                        }
                    }
                }
            };

            // A short read may end mid-block; the tail is dropped, not re-read.
            produced -= produced % block;

            if produced == 0 {
                if self.shared.commit_on_eof.load(Ordering::Relaxed) {
                    match self.sink.wait_readable(self.config.drain_poll_timeout()) {
                        Ok(false) => {
                            debug!("wait for driver eof timeout");
                            continue;
                        }
                        Ok(true) => debug!("wait for driver eof ok"),
                        Err(e) => {
                            debug!(error = %e, "wait for driver eof aborted");
                            if self.halted() {
                                break;
                            }
                        }
                    }
                }

                if self.halted() {
                    break;
                }

                self.send(PumpEvent::Eof);
                eof_count += 1;

                let stream_mode = self.shared.stream_mode();
                if eof_count < self.config.eof_retries(stream_mode) {
                    if stream_mode {
                        debug!(eof_count, "reached EOF, but we are in stream mode. delaying");
                    } else {
                        debug!(eof_count, "reached EOF, but the file may grow. delaying");
                    }
                    self.shared.control.nap(self.config.eof_retry_delay());
                    continue;
                }
                self.send(PumpEvent::ReadError);
                break;
            }

            if self.halted() {
                break;
            }
            if let Some(filter) = self.shared.filter.lock().as_mut() {
                filter.filter(&mut self.buffer[..produced]);
            }

            let outcome = self.write_block(produced);
            if matches!(outcome, WriteOutcome::Halted) {
                // Not committed: the block is pumped again after a resume.
                break;
            }

            eof_count = 0;
            self.commit_position(self.position + produced as u64);
            bytes_since_span += produced as u64;
            if provider.is_some() {
                span_remaining = span_remaining.saturating_sub(produced as u64);
            }

            if matches!(outcome, WriteOutcome::Failed) {
                break;
            }
        }
    }

    /// Write `buffer[..len]` through the partial-write loop.
    fn write_block(&mut self, len: usize) -> WriteOutcome {
        let started = Instant::now();
        let mut written = 0;
        while written < len {
            match self.sink.write(&self.buffer[written..len]) {
                Ok(0) => {
                    debug!("write returned zero bytes");
                    self.send(PumpEvent::WriteError);
                    return WriteOutcome::Failed;
                }
                Ok(n) => {
                    written += n;
                    if written < len && self.halted() {
                        return WriteOutcome::Halted;
                    }
                }
                Err(e) => {
                    if self.shared.stream_mode() {
                        debug!("error writing on demuxer. Flush the decoder!");
                        self.send(PumpEvent::FlushDecoder);
                    }
                    if self.halted() {
                        return WriteOutcome::Halted;
                    }
                    if classify(&e) == IoClass::Retry {
                        continue;
                    }
                    debug!(error = %e, "write error");
                    self.send(PumpEvent::WriteError);
                    return WriteOutcome::Failed;
                }
            }
        }
        trace!(
            bytes = len,
            elapsed_us = started.elapsed().as_micros() as u64,
            "write"
        );
        WriteOutcome::Complete
    }
}
