//! Threaded transport stream pumps.
//!
//! Two copy loops move bytes from a source into a sink on a dedicated worker
//! thread:
//!
//! - [`PumpThread`] plays back a positioned source (a recording, or a
//!   piecewise-virtual timeline described by a [`SpanProvider`]) into a
//!   playback device, with live pause/resume and EOF handling that differs
//!   between finite files and live streams.
//! - [`RecorderPumpThread`] drains a demultiplexer into a [`RecordSink`],
//!   optionally repackaging transport stream packets into interleaved frames
//!   and flagging packets that arrived still scrambled.
//!
//! Both report asynchronously through an [`EventReceiver`]; failures inside
//! the copy loop never surface as return values.

pub mod config;
pub mod control;
pub mod error;
pub mod event;
pub mod framing;
pub mod interrupt;
pub mod pump;
pub mod recorder;
pub mod sink;
pub mod source;
pub mod span;

pub use config::{PumpConfig, RecorderConfig, SessionConfig, StreamProtocol};
pub use control::{PauseController, PumpState};
pub use error::{IoClass, PumpError, classify};
pub use event::{EventEnvelope, EventReceiver, EventSender, PumpEvent, event_channel};
pub use framing::{FrameHeader, InterleavedFramer, ReplyQueue};
pub use interrupt::WorkerInterrupter;
pub use pump::{DataFilter, PumpEvents, PumpShared, PumpThread};
pub use recorder::{RecorderEvents, RecorderPumpThread, RecorderShared};
pub use sink::{FdSink, RecordSink, Sink, SinkWriter};
pub use source::{DemuxSource, FileSource, TsSource};
pub use span::{Span, SpanList, SpanProvider};
