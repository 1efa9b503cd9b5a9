//! Interleaved-protocol framing for the recorder.
//!
//! Media units read from the demultiplexer are batched into frames of the
//! form used for RTSP interleaved transport, each prefixed by a 16-byte
//! header (all multi-byte fields big-endian):
//!
//! ```text
//! [0]     0x24 interleave marker
//! [1]     channel
//! [2..4]  payload length + 12
//! [4..6]  0x8021 tag
//! [6..8]  stream id
//! [8..12] frame sequence number
//! [12..16] session id
//! [16..]  payload: 1..=7 transport stream packets
//! ```
//!
//! Protocol replies queued by the session layer are emitted ahead of the
//! first frame of the next batch.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tracing::debug;
use ts::{PID_NULL, TS_PACKET_SIZE};

use crate::config::SessionConfig;
use crate::source::DemuxSource;

pub const INTERLEAVE_MARKER: u8 = 0x24;
pub const FRAME_HEADER_LEN: usize = 16;
pub const FRAME_TAG: u16 = 0x8021;
/// Header bytes after the 4-byte interleave prefix, counted in the length field.
pub const FRAME_LENGTH_BIAS: usize = FRAME_HEADER_LEN - 4;
pub const MAX_UNITS_PER_READ: usize = 7;

/// Passes slower than this are always logged.
const SLOW_PASS: Duration = Duration::from_secs(1);
/// Passes of the first few reads of a session are always logged.
const VERBOSE_READS: u64 = 5;
/// Log one in this many decryption failures.
const DECRYPT_LOG_EVERY: u64 = 100;

/// Pending reply bytes, filled by the owner and drained by the worker.
pub type ReplyQueue = Arc<Mutex<BytesMut>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub channel: u8,
    pub payload_len: usize,
    pub stream_id: u16,
    pub sequence: u32,
    pub session_id: u32,
}

impl FrameHeader {
    pub fn encode(&self, dst: &mut [u8]) {
        let length = (self.payload_len + FRAME_LENGTH_BIAS) as u16;
        dst[0] = INTERLEAVE_MARKER;
        dst[1] = self.channel;
        dst[2..4].copy_from_slice(&length.to_be_bytes());
        dst[4..6].copy_from_slice(&FRAME_TAG.to_be_bytes());
        dst[6..8].copy_from_slice(&self.stream_id.to_be_bytes());
        dst[8..12].copy_from_slice(&self.sequence.to_be_bytes());
        dst[12..16].copy_from_slice(&self.session_id.to_be_bytes());
    }

    /// Decode a header, or `None` if `src` is short or lacks the marker and tag.
    pub fn decode(src: &[u8]) -> Option<Self> {
        if src.len() < FRAME_HEADER_LEN || src[0] != INTERLEAVE_MARKER {
            return None;
        }
        if u16::from_be_bytes([src[4], src[5]]) != FRAME_TAG {
            return None;
        }
        let length = u16::from_be_bytes([src[2], src[3]]) as usize;
        Some(Self {
            channel: src[1],
            payload_len: length.checked_sub(FRAME_LENGTH_BIAS)?,
            stream_id: u16::from_be_bytes([src[6], src[7]]),
            sequence: u32::from_be_bytes([src[8], src[9], src[10], src[11]]),
            session_id: u32::from_be_bytes([src[12], src[13], src[14], src[15]]),
        })
    }
}

/// Builds interleaved batches for one recording session.
pub struct InterleavedFramer {
    session: SessionConfig,
    replies: ReplyQueue,
    window: Duration,
    frame_seq: u32,
    packet_no: u64,
    decrypt_errors: u64,
}

impl InterleavedFramer {
    pub fn new(session: SessionConfig, replies: ReplyQueue, window: Duration) -> Self {
        Self {
            session,
            replies,
            window,
            frame_seq: 0,
            packet_no: 0,
            decrypt_errors: 0,
        }
    }

    pub fn session(&self) -> &SessionConfig {
        &self.session
    }

    /// Install the session for the next batches. A different session or
    /// stream starts over with a single-unit first read.
    pub fn set_session(&mut self, session: SessionConfig) {
        if session.session_id != self.session.session_id
            || session.stream_id != self.session.stream_id
        {
            debug!(
                session_id = session.session_id,
                stream_id = session.stream_id,
                reads = self.packet_no,
                "new session"
            );
            self.packet_no = 0;
        }
        self.session = session;
    }

    /// Sequence number the next frame will carry.
    pub fn frame_seq(&self) -> u32 {
        self.frame_seq
    }

    /// Number of successful reads so far.
    pub fn packet_no(&self) -> u64 {
        self.packet_no
    }

    pub fn decrypt_errors(&self) -> u64 {
        self.decrypt_errors
    }

    /// Fill `buf` with queued replies followed by as many frames as the
    /// batching rules allow.
    ///
    /// Returns the number of bytes produced. If nothing at all was produced,
    /// the result of the last read is returned instead, so a read error is
    /// not masked as an empty batch.
    pub fn fill(&mut self, source: &dyn DemuxSource, buf: &mut [u8]) -> io::Result<usize> {
        let started = Instant::now();
        let mut pos = self.take_reply(buf);
        let mut last: io::Result<usize> = Ok(0);

        while buf.len() - pos >= TS_PACKET_SIZE + FRAME_HEADER_LEN {
            let room = buf.len() - pos - FRAME_HEADER_LEN;
            let want = if self.packet_no == 0 {
                TS_PACKET_SIZE
            } else {
                room.min(TS_PACKET_SIZE * MAX_UNITS_PER_READ) / TS_PACKET_SIZE * TS_PACKET_SIZE
            };

            let frame = &mut buf[pos..pos + FRAME_HEADER_LEN + want];
            let bytes = match source.read(&mut frame[FRAME_HEADER_LEN..]) {
                Ok(n) if n > 0 => n,
                other => {
                    last = other;
                    break;
                }
            };
            self.packet_no += 1;

            self.mark_undecrypted(&mut frame[FRAME_HEADER_LEN..FRAME_HEADER_LEN + bytes]);
            FrameHeader {
                channel: self.session.channel,
                payload_len: bytes,
                stream_id: self.session.stream_id,
                sequence: self.frame_seq,
                session_id: self.session.session_id,
            }
            .encode(&mut frame[..FRAME_HEADER_LEN]);
            self.frame_seq = self.frame_seq.wrapping_add(1);
            pos += FRAME_HEADER_LEN + bytes;
            last = Ok(bytes);

            if bytes != want || started.elapsed() > self.window {
                break;
            }
        }

        let elapsed = started.elapsed();
        if elapsed > SLOW_PASS || self.packet_no < VERBOSE_READS {
            debug!(
                produced = pos,
                last_read = ?last.as_ref().map_err(|e| e.kind()),
                elapsed_ms = elapsed.as_millis() as u64,
                reads = self.packet_no,
                "framing pass"
            );
        }

        if pos == 0 {
            return last;
        }
        Ok(pos)
    }

    /// Copy queued reply bytes to the start of `buf`. Whatever does not fit
    /// stays queued for the next pass.
    fn take_reply(&self, buf: &mut [u8]) -> usize {
        let mut replies = self.replies.lock();
        if replies.is_empty() {
            return 0;
        }
        let len = replies.len().min(buf.len());
        buf[..len].copy_from_slice(&replies[..len]);
        replies.advance(len);
        debug!(bytes = len, remaining = replies.len(), "added reply");
        len
    }

    /// Force the PID of every still-scrambled packet in `payload` to the null PID.
    fn mark_undecrypted(&mut self, payload: &mut [u8]) {
        for mut packet in ts::packets_mut(payload) {
            if !packet.is_scrambled() {
                continue;
            }
            if self.decrypt_errors % DECRYPT_LOG_EVERY == 0 {
                debug!(
                    errors = self.decrypt_errors + 1,
                    pid = packet.pid(),
                    "decrypt errors"
                );
            }
            self.decrypt_errors += 1;
            packet.set_pid(PID_NULL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Serves scripted reads, each truncated to the caller's buffer.
    struct ScriptedDemux {
        reads: Mutex<VecDeque<io::Result<Vec<u8>>>>,
        requested: Mutex<Vec<usize>>,
    }

    impl ScriptedDemux {
        fn new(reads: Vec<io::Result<Vec<u8>>>) -> Self {
            Self {
                reads: Mutex::new(reads.into()),
                requested: Mutex::new(Vec::new()),
            }
        }
    }

    impl DemuxSource for ScriptedDemux {
        fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
            self.requested.lock().push(buf.len());
            match self.reads.lock().pop_front() {
                Some(Ok(data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok(n)
                }
                Some(Err(e)) => Err(e),
                None => Ok(0),
            }
        }
    }

    fn units(count: usize, pid: u16, scrambled: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(count * TS_PACKET_SIZE);
        for cc in 0..count {
            let mut unit = vec![0xAAu8; TS_PACKET_SIZE];
            unit[0] = ts::SYNC_BYTE;
            unit[1] = 0x40 | (pid >> 8) as u8;
            unit[2] = pid as u8;
            let flags: u8 = if scrambled { 0x90 } else { 0x10 };
            unit[3] = flags | (cc as u8 & 0x0F);
            out.extend(unit);
        }
        out
    }

    fn framer(session: SessionConfig) -> (InterleavedFramer, ReplyQueue) {
        let replies = ReplyQueue::default();
        let framer = InterleavedFramer::new(session, replies.clone(), Duration::from_secs(5));
        (framer, replies)
    }

    fn session() -> SessionConfig {
        SessionConfig {
            protocol: crate::StreamProtocol::RtspTcp,
            channel: 2,
            stream_id: 0x0102,
            session_id: 0xDEADBEEF,
        }
    }

    #[test]
    fn header_layout() {
        let mut out = [0u8; FRAME_HEADER_LEN];
        FrameHeader {
            channel: 1,
            payload_len: 3 * TS_PACKET_SIZE,
            stream_id: 0x0A0B,
            sequence: 0x01020304,
            session_id: 0x11223344,
        }
        .encode(&mut out);
        assert_eq!(
            out,
            [
                0x24, 0x01, 0x02, 0x40, 0x80, 0x21, 0x0A, 0x0B, 0x01, 0x02, 0x03, 0x04, 0x11,
                0x22, 0x33, 0x44
            ]
        );
        let decoded = FrameHeader::decode(&out).unwrap();
        assert_eq!(decoded.payload_len, 3 * TS_PACKET_SIZE);
        assert!(FrameHeader::decode(&out[..8]).is_none());
    }

    #[test]
    fn first_read_is_a_single_unit() {
        let source = ScriptedDemux::new(vec![
            Ok(units(1, 0x100, false)),
            Ok(units(7, 0x100, false)),
            Ok(units(2, 0x100, false)),
        ]);
        let (mut framer, _) = framer(session());
        let mut buf = vec![0u8; 64 * 1024];

        let produced = framer.fill(&source, &mut buf).unwrap();
        // 1 unit, then 7 units, then a short read of 2 ends the batch
        assert_eq!(
            *source.requested.lock(),
            vec![TS_PACKET_SIZE, 7 * TS_PACKET_SIZE, 7 * TS_PACKET_SIZE]
        );
        assert_eq!(produced, 3 * FRAME_HEADER_LEN + 10 * TS_PACKET_SIZE);

        let mut offset = 0;
        for (seq, count) in [(0u32, 1usize), (1, 7), (2, 2)] {
            let header = FrameHeader::decode(&buf[offset..]).unwrap();
            assert_eq!(header.sequence, seq);
            assert_eq!(header.channel, 2);
            assert_eq!(header.stream_id, 0x0102);
            assert_eq!(header.session_id, 0xDEADBEEF);
            assert_eq!(header.payload_len, count * TS_PACKET_SIZE);
            assert_eq!(
                u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize,
                count * TS_PACKET_SIZE + 12
            );
            offset += FRAME_HEADER_LEN + header.payload_len;
        }
        assert_eq!(framer.frame_seq(), 3);
        assert_eq!(framer.packet_no(), 3);
    }

    #[test]
    fn new_session_starts_with_a_single_unit() {
        let (mut framer, _) = framer(session());
        let mut buf = vec![0u8; 64 * 1024];
        let first = ScriptedDemux::new(vec![
            Ok(units(1, 0x100, false)),
            Ok(units(2, 0x100, false)),
        ]);
        framer.fill(&first, &mut buf).unwrap();
        assert_eq!(framer.packet_no(), 2);

        // Same ids: the session carries on with full-size reads
        framer.set_session(SessionConfig {
            channel: 5,
            ..session()
        });
        assert_eq!(framer.packet_no(), 2);

        framer.set_session(SessionConfig {
            session_id: 0x0BADF00D,
            ..session()
        });
        assert_eq!(framer.packet_no(), 0);
        let second = ScriptedDemux::new(vec![Ok(units(1, 0x100, false))]);
        framer.fill(&second, &mut buf).unwrap();
        assert_eq!(second.requested.lock()[0], TS_PACKET_SIZE);
        let header = FrameHeader::decode(&buf).unwrap();
        assert_eq!(header.session_id, 0x0BADF00D);
    }

    #[test]
    fn queued_reply_leads_the_batch() {
        let reply = b"RTSP/1.0 200 OK\r\nCSeq: 3\r\n\r\n".to_vec();
        let source = ScriptedDemux::new(vec![Ok(units(1, 0x100, false))]);
        let (mut framer, replies) = framer(session());
        replies.lock().extend_from_slice(&reply);
        let mut buf = vec![0u8; 4096];

        let produced = framer.fill(&source, &mut buf).unwrap();
        assert_eq!(&buf[..reply.len()], &reply[..]);
        assert_eq!(buf[reply.len()], INTERLEAVE_MARKER);
        assert_eq!(produced, reply.len() + FRAME_HEADER_LEN + TS_PACKET_SIZE);
        assert!(replies.lock().is_empty());
    }

    #[test]
    fn oversized_reply_is_split_across_passes() {
        let source = ScriptedDemux::new(vec![]);
        let (mut framer, replies) = framer(session());
        replies.lock().extend_from_slice(&[7u8; 300]);
        let mut buf = vec![0u8; 256];

        assert_eq!(framer.fill(&source, &mut buf).unwrap(), 256);
        assert_eq!(replies.lock().len(), 44);
        assert_eq!(framer.fill(&source, &mut buf).unwrap(), 44);
        assert!(replies.lock().is_empty());
    }

    #[test]
    fn scrambled_units_are_marked_null() {
        let mut data = units(2, 0x0200, true);
        data.extend(units(1, 0x0300, false));
        let source = ScriptedDemux::new(vec![Ok(units(1, 0x0111, false)), Ok(data)]);
        let (mut framer, _) = framer(session());
        let mut buf = vec![0u8; 4096];

        framer.fill(&source, &mut buf).unwrap();
        let start = 2 * FRAME_HEADER_LEN + TS_PACKET_SIZE;
        let payload = &buf[start..start + 3 * TS_PACKET_SIZE];
        let pids: Vec<u16> = ts::packets(payload).map(|p| p.pid()).collect();
        assert_eq!(pids, vec![PID_NULL, PID_NULL, 0x0300]);
        // Flags of byte 1 survive the rewrite
        assert!(ts::packets(payload).all(|p| p.payload_unit_start_indicator()));
        assert_eq!(framer.decrypt_errors(), 2);
    }

    #[test]
    fn read_error_is_propagated_when_nothing_was_produced() {
        let source = ScriptedDemux::new(vec![Err(io::Error::from(io::ErrorKind::Interrupted))]);
        let (mut framer, _) = framer(session());
        let mut buf = vec![0u8; 4096];

        let err = framer.fill(&source, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
        assert_eq!(framer.packet_no(), 0);
    }

    #[test]
    fn error_after_data_returns_the_data() {
        let source = ScriptedDemux::new(vec![
            Ok(units(1, 0x100, false)),
            Err(io::Error::other("device gone")),
        ]);
        let (mut framer, _) = framer(session());
        let mut buf = vec![0u8; 4096];
        assert_eq!(
            framer.fill(&source, &mut buf).unwrap(),
            FRAME_HEADER_LEN + TS_PACKET_SIZE
        );
    }

    #[test]
    fn batch_stops_when_buffer_is_full() {
        let source = ScriptedDemux::new(
            (0..10).map(|_| Ok(units(7, 0x100, false))).collect(),
        );
        let (mut framer, _) = framer(session());
        // Room for the first single-unit frame plus one 2-unit frame
        let mut buf = vec![0u8; 2 * FRAME_HEADER_LEN + 3 * TS_PACKET_SIZE + 100];

        let produced = framer.fill(&source, &mut buf).unwrap();
        assert_eq!(produced, 2 * FRAME_HEADER_LEN + 3 * TS_PACKET_SIZE);
        assert_eq!(
            *source.requested.lock(),
            vec![TS_PACKET_SIZE, 2 * TS_PACKET_SIZE]
        );
    }
}
