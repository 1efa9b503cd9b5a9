//! Transport Stream (TS) packet helpers for MPEG-2 Transport Stream data
//!
//! This crate provides zero-copy views over 188-byte transport stream packets:
//! reading the fixed header (PID, scrambling control, continuity counter) and
//! rewriting the PID in place.

pub mod error;
pub mod packet;

pub use error::TsError;
pub use packet::{
    PID_CAT, PID_NULL, PID_PAT, PacketMut, PacketRef, SYNC_BYTE, TS_PACKET_SIZE, packets,
    packets_mut,
};

/// Result type for TS operations
pub type Result<T> = std::result::Result<T, TsError>;
