use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use filepush::{
    FdSink, FileSource, PumpConfig, PumpEvent, PumpThread, RecorderConfig, RecorderPumpThread,
    Sink, SinkWriter, Span, SpanList, StreamProtocol,
};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};

pub struct PlayOptions {
    pub input: PathBuf,
    pub output: Option<PathBuf>,
    pub spans: Vec<Span>,
    pub follow: bool,
    pub stats: bool,
}

pub struct RecordOptions {
    pub input: PathBuf,
    pub output: Option<PathBuf>,
    pub reply: Option<PathBuf>,
    pub duration: Option<Duration>,
}

/// Packet counters gathered from every block that passes through the pump.
#[derive(Debug, Default, Serialize)]
pub struct PidStats {
    pub packets: u64,
    pub scrambled: u64,
    pub sync_errors: u64,
    pub pids: BTreeMap<u16, u64>,
}

impl PidStats {
    pub fn observe(&mut self, data: &[u8]) {
        for packet in ts::packets(data) {
            self.packets += 1;
            if !packet.has_sync_byte() {
                self.sync_errors += 1;
                continue;
            }
            if packet.is_scrambled() {
                self.scrambled += 1;
            }
            *self.pids.entry(packet.pid()).or_default() += 1;
        }
    }
}

fn open_sink(output: Option<&Path>) -> Result<Arc<dyn Sink>> {
    Ok(match output {
        Some(path) => {
            let file = File::options()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?;
            info!(path = %path.display(), "writing to file");
            Arc::new(FdSink::new(file))
        }
        None => Arc::new(FdSink::new(io::stdout())),
    })
}

/// Play `opts.input` until it ends, fails or Ctrl-C is pressed.
pub async fn play(config: PumpConfig, opts: PlayOptions) -> Result<()> {
    let source = Arc::new(FileSource::open(&opts.input)?);
    let sink = open_sink(opts.output.as_deref())?;
    let stream_mode = config.stream_mode;
    let block_size = config.block_size;

    let mut pump = PumpThread::new(config)?;
    if !opts.spans.is_empty() {
        let spans = SpanList::new(opts.spans, block_size)?;
        info!(
            spans = spans.spans().len(),
            bytes = spans.total_len(),
            "playing cut list"
        );
        pump.set_span_provider(Some(Arc::new(spans)));
    }

    let stats = opts.stats.then(|| Arc::new(Mutex::new(PidStats::default())));
    if let Some(stats) = &stats {
        let stats = stats.clone();
        pump.set_filter(Some(Box::new(move |data: &mut [u8]| {
            stats.lock().observe(data)
        })));
    }

    let mut events = pump.events()?;
    events.subscribe(|envelope| {
        debug!(event = %envelope.event(), position = envelope.position(), "pump event")
    });

    info!(input = %opts.input.display(), stream_mode, "starting playback");
    pump.start(source, sink)?;

    let mut saw_eof = false;
    let mut failure = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            event = events.next() => match event {
                Some(PumpEvent::Eof) => {
                    saw_eof = true;
                    if !stream_mode && !opts.follow {
                        break;
                    }
                }
                Some(PumpEvent::FlushDecoder) => {
                    warn!("output rejected data, decoder needs a flush")
                }
                Some(event @ PumpEvent::WriteError) => failure = Some(event),
                Some(event @ PumpEvent::ReadError) if !saw_eof => failure = Some(event),
                Some(PumpEvent::Stopped) | None => break,
                Some(_) => {}
            }
        }
    }

    let pump = tokio::task::spawn_blocking(move || {
        pump.stop();
        pump
    })
    .await?;
    let position = pump.position();
    info!(position, "playback finished");

    if let Some(stats) = stats {
        let stats = stats.lock();
        eprintln!("{}", serde_json::to_string_pretty(&*stats)?);
    }

    match failure {
        Some(event) => Err(AppError::Transfer { event, position }),
        None => Ok(()),
    }
}

/// Record `opts.input` until Ctrl-C, the optional duration, or a fatal error.
pub async fn record(config: RecorderConfig, opts: RecordOptions) -> Result<()> {
    let source = Arc::new(FileSource::open(&opts.input)?);
    let sink = open_sink(opts.output.as_deref())?;
    let interleaved = config.session.protocol == StreamProtocol::RtspTcp;

    let mut recorder = RecorderPumpThread::new(config, Box::new(SinkWriter::new(sink)))?;
    if let Some(reply) = &opts.reply {
        let bytes = tokio::fs::read(reply).await?;
        recorder.push_reply(&bytes);
    }

    let written = Arc::new(AtomicU64::new(0));
    let mut events = recorder.events()?;
    let counter = written.clone();
    events.subscribe(move |envelope| {
        debug!(event = %envelope.event(), written = envelope.position(), "recorder event");
        counter.store(envelope.position(), Ordering::Relaxed);
    });

    info!(input = %opts.input.display(), interleaved, "starting recording");
    recorder.start(source)?;

    let deadline = async {
        match opts.duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut failure = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            _ = &mut deadline => {
                info!("recording duration reached");
                break;
            }
            event = events.next() => match event {
                Some(event @ (PumpEvent::ReadError | PumpEvent::WriteError)) => {
                    failure = Some(event)
                }
                Some(PumpEvent::Stopped) | None => break,
                Some(_) => {}
            }
        }
    }

    let recorder = tokio::task::spawn_blocking(move || {
        recorder.stop();
        recorder
    })
    .await?;
    events.dispatch_pending();

    let written = written.load(Ordering::Relaxed);
    info!(
        written,
        overflows = recorder.overflow_count(),
        decrypt_errors = recorder.decrypt_error_count(),
        "recording finished"
    );

    match failure {
        Some(event) => Err(AppError::Transfer {
            event,
            position: written,
        }),
        None => Ok(()),
    }
}
