use clap::{Parser, Subcommand};
use filepush::Span;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "filepush")]
#[command(author, version, about = "Pump transport streams between files, devices and sockets")]
pub struct Args {
    /// Path to a JSON config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Play a recording into a playback device, file or stdout
    Play {
        /// Recording to read
        input: PathBuf,

        /// Destination (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Only play OFFSET:LENGTH (bytes, block aligned); repeat for a cut list
        #[arg(long = "span", value_name = "OFFSET:LENGTH", value_parser = parse_span)]
        spans: Vec<Span>,

        /// Treat EOF as an underrun of a live stream
        #[arg(long)]
        stream_mode: bool,

        /// Wait for the output to drain before reporting EOF
        #[arg(long)]
        commit_on_eof: bool,

        /// Keep waiting for the input to grow instead of ending at the first EOF
        #[arg(long)]
        follow: bool,

        /// Read alignment in bytes
        #[arg(long)]
        block_size: Option<usize>,

        /// Copy buffer size in bytes
        #[arg(long)]
        buffer_size: Option<usize>,

        /// Print per-PID packet statistics when done
        #[arg(long)]
        stats: bool,
    },

    /// Record a demultiplexer (or any readable node) into a file, socket or stdout
    Record {
        /// Device or file to read
        input: PathBuf,

        /// Destination (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Wrap packets in RTSP interleaved frames
        #[arg(long)]
        interleaved: bool,

        /// Interleaved channel byte
        #[arg(long)]
        channel: Option<u8>,

        /// Stream id stamped into every frame
        #[arg(long)]
        stream_id: Option<u16>,

        /// Session id stamped into every frame
        #[arg(long)]
        session_id: Option<u32>,

        /// File whose content is sent ahead of the first frame
        #[arg(long)]
        reply: Option<PathBuf>,

        /// Batch buffer size in bytes
        #[arg(long)]
        buffer_size: Option<usize>,

        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,
    },
}

/// Parse `OFFSET:LENGTH`, both decimal byte counts.
pub fn parse_span(value: &str) -> Result<Span, String> {
    let (offset, length) = value
        .split_once(':')
        .ok_or_else(|| format!("expected OFFSET:LENGTH, got '{value}'"))?;
    let offset = offset
        .trim()
        .parse::<u64>()
        .map_err(|e| format!("invalid span offset '{offset}': {e}"))?;
    let length = length
        .trim()
        .parse::<u64>()
        .map_err(|e| format!("invalid span length '{length}': {e}"))?;
    Ok(Span::new(offset, length))
}
