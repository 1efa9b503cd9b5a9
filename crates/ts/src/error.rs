use thiserror::Error;

/// Errors raised when viewing raw bytes as transport stream packets
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TsError {
    #[error("invalid packet size: {0} (expected 188)")]
    InvalidPacketSize(usize),

    #[error("invalid sync byte: {0:#04x}")]
    InvalidSyncByte(u8),
}
