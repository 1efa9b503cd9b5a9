mod cli;
mod commands;
mod config;
mod error;

use crate::{
    cli::{Args, Commands},
    commands::{PlayOptions, RecordOptions},
    config::AppConfig,
    error::Result,
};
use clap::Parser;
use filepush::StreamProtocol;
use std::{io, process, time::Duration};
use tracing::{Level, error};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!("Application error: {}", e);
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    init_logging(args.verbose, args.quiet);
    let mut config = AppConfig::load(args.config.as_deref())?;

    match args.command {
        Commands::Play {
            input,
            output,
            spans,
            stream_mode,
            commit_on_eof,
            follow,
            block_size,
            buffer_size,
            stats,
        } => {
            let pump = &mut config.pump;
            pump.stream_mode |= stream_mode;
            pump.commit_on_eof |= commit_on_eof;
            if let Some(block_size) = block_size {
                pump.block_size = block_size;
            }
            if let Some(buffer_size) = buffer_size {
                pump.buffer_size = buffer_size;
            }
            let opts = PlayOptions {
                input,
                output,
                spans,
                follow,
                stats,
            };
            commands::play(config.pump, opts).await
        }

        Commands::Record {
            input,
            output,
            interleaved,
            channel,
            stream_id,
            session_id,
            reply,
            buffer_size,
            duration,
        } => {
            let recorder = &mut config.recorder;
            if interleaved {
                recorder.session.protocol = StreamProtocol::RtspTcp;
            }
            if let Some(channel) = channel {
                recorder.session.channel = channel;
            }
            if let Some(stream_id) = stream_id {
                recorder.session.stream_id = stream_id;
            }
            if let Some(session_id) = session_id {
                recorder.session.session_id = session_id;
            }
            if let Some(buffer_size) = buffer_size {
                recorder.buffer_size = buffer_size;
            }
            let opts = RecordOptions {
                input,
                output,
                reply,
                duration: duration.map(Duration::from_secs),
            };
            commands::record(config.recorder, opts).await
        }
    }
}

/// Logs go to stderr; stdout may be carrying the stream itself.
fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(io::stderr)
                .with_target(false)
                .with_thread_names(verbose),
        )
        .init();
}
