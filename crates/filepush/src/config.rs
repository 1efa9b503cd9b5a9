use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::PumpError;
use ts::TS_PACKET_SIZE;

/// Default number of packets held by one pump buffer.
const DEFAULT_BUFFER_PACKETS: usize = 256;

/// Configuration for a [`PumpThread`](crate::PumpThread).
///
/// Durations are kept in milliseconds so the struct can be loaded from plain
/// JSON; use the accessor methods to get [`Duration`]s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpConfig {
    /// Alignment unit for every read, in bytes.
    pub block_size: usize,

    /// Capacity of the copy buffer. Should be a multiple of `block_size`.
    pub buffer_size: usize,

    /// Treat EOF as a buffer underrun of a live stream instead of the end of a file.
    pub stream_mode: bool,

    /// Wait for the sink to report drain completion before signalling EOF.
    pub commit_on_eof: bool,

    /// How long one drain poll may block.
    pub drain_poll_timeout_ms: u64,

    /// Pause between two consecutive EOF retries.
    pub eof_retry_delay_ms: u64,

    /// Pause before a fatal read error is reported.
    pub read_error_delay_ms: u64,

    /// EOF events tolerated in stream mode before giving up.
    pub stream_eof_retries: u32,

    /// EOF events tolerated in file mode before giving up.
    pub file_eof_retries: u32,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            block_size: TS_PACKET_SIZE,
            buffer_size: TS_PACKET_SIZE * DEFAULT_BUFFER_PACKETS,
            stream_mode: false,
            commit_on_eof: false,
            drain_poll_timeout_ms: 250,
            eof_retry_delay_ms: 1000,
            read_error_delay_ms: 1000,
            stream_eof_retries: 5,
            file_eof_retries: 10,
        }
    }
}

impl PumpConfig {
    pub fn new(block_size: usize, buffer_size: usize) -> Self {
        Self {
            block_size,
            buffer_size,
            ..Default::default()
        }
    }

    pub fn with_stream_mode(mut self, stream_mode: bool) -> Self {
        self.stream_mode = stream_mode;
        self
    }

    pub fn with_commit_on_eof(mut self, commit_on_eof: bool) -> Self {
        self.commit_on_eof = commit_on_eof;
        self
    }

    pub fn with_eof_retry_delay(mut self, delay: Duration) -> Self {
        self.eof_retry_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_read_error_delay(mut self, delay: Duration) -> Self {
        self.read_error_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn drain_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_poll_timeout_ms)
    }

    pub fn eof_retry_delay(&self) -> Duration {
        Duration::from_millis(self.eof_retry_delay_ms)
    }

    pub fn read_error_delay(&self) -> Duration {
        Duration::from_millis(self.read_error_delay_ms)
    }

    /// EOF budget for the given mode.
    pub fn eof_retries(&self, stream_mode: bool) -> u32 {
        if stream_mode {
            self.stream_eof_retries
        } else {
            self.file_eof_retries
        }
    }

    pub fn validate(&self) -> Result<(), PumpError> {
        if self.block_size == 0 {
            return Err(PumpError::invalid_config("block_size must be non-zero"));
        }
        if self.buffer_size < self.block_size {
            return Err(PumpError::invalid_config(format!(
                "buffer_size ({}) is smaller than one block ({})",
                self.buffer_size, self.block_size
            )));
        }
        if self.stream_eof_retries == 0 || self.file_eof_retries == 0 {
            return Err(PumpError::invalid_config("EOF retry budgets must be at least 1"));
        }
        if self.buffer_size % self.block_size != 0 {
            warn!(
                block_size = self.block_size,
                buffer_size = self.buffer_size,
                "buffer size is not a multiple of the block size, the tail will never be filled"
            );
        }
        Ok(())
    }
}

/// How the recorder obtains each batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamProtocol {
    /// Plain reads, no framing.
    #[default]
    Raw,
    /// RTSP with media over UDP; the recorder still forwards raw packets.
    RtspUdp,
    /// RTSP with media interleaved on the control connection.
    RtspTcp,
}

impl StreamProtocol {
    pub fn is_interleaved(self) -> bool {
        matches!(self, Self::RtspTcp)
    }
}

/// Session identity stamped into every interleaved frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub protocol: StreamProtocol,
    pub channel: u8,
    pub stream_id: u16,
    pub session_id: u32,
}

/// Configuration for a [`RecorderPumpThread`](crate::RecorderPumpThread).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Capacity of the batch buffer.
    pub buffer_size: usize,

    /// Longest time one framing pass keeps batching reads.
    pub frame_window_ms: u64,

    /// Back-off after a read returned no data.
    pub idle_delay_ms: u64,

    pub session: SessionConfig,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            buffer_size: TS_PACKET_SIZE * DEFAULT_BUFFER_PACKETS,
            frame_window_ms: 50,
            idle_delay_ms: 10,
            session: SessionConfig::default(),
        }
    }
}

impl RecorderConfig {
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn frame_window(&self) -> Duration {
        Duration::from_millis(self.frame_window_ms)
    }

    pub fn idle_delay(&self) -> Duration {
        Duration::from_millis(self.idle_delay_ms)
    }

    pub fn validate(&self) -> Result<(), PumpError> {
        if self.buffer_size == 0 {
            return Err(PumpError::invalid_config("buffer_size must be non-zero"));
        }
        if self.session.protocol.is_interleaved()
            && self.buffer_size < crate::framing::FRAME_HEADER_LEN + TS_PACKET_SIZE
        {
            return Err(PumpError::invalid_config(format!(
                "buffer_size ({}) cannot hold a single interleaved frame",
                self.buffer_size
            )));
        }
        Ok(())
    }
}
