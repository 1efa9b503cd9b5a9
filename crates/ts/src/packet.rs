use crate::{Result, TsError};

/// Size of one transport stream packet
pub const TS_PACKET_SIZE: usize = 188;

/// Sync byte that starts every packet
pub const SYNC_BYTE: u8 = 0x47;

/// PAT PID (always 0x0000)
pub const PID_PAT: u16 = 0x0000;

/// CAT PID (always 0x0001)
pub const PID_CAT: u16 = 0x0001;

/// NULL PID (always 0x1FFF)
pub const PID_NULL: u16 = 0x1FFF;

#[inline]
fn header_pid(data: &[u8]) -> u16 {
    ((data[1] as u16 & 0x1F) << 8) | data[2] as u16
}

fn check_size(len: usize) -> Result<()> {
    if len != TS_PACKET_SIZE {
        return Err(TsError::InvalidPacketSize(len));
    }
    Ok(())
}

/// Borrowed view over a single 188-byte packet.
///
/// Only the fixed 4-byte header is interpreted; the adaptation field and
/// payload are left opaque.
#[derive(Debug, Clone, Copy)]
pub struct PacketRef<'a> {
    data: &'a [u8],
}

impl<'a> PacketRef<'a> {
    /// Wrap `data`, which must be exactly one packet long. The sync byte is not checked.
    pub fn new(data: &'a [u8]) -> Result<Self> {
        check_size(data.len())?;
        Ok(Self { data })
    }

    /// Like [`PacketRef::new`], but also rejects a missing sync byte.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let packet = Self::new(data)?;
        if !packet.has_sync_byte() {
            return Err(TsError::InvalidSyncByte(data[0]));
        }
        Ok(packet)
    }

    pub fn has_sync_byte(&self) -> bool {
        self.data[0] == SYNC_BYTE
    }

    pub fn transport_error_indicator(&self) -> bool {
        (self.data[1] & 0x80) != 0
    }

    pub fn payload_unit_start_indicator(&self) -> bool {
        (self.data[1] & 0x40) != 0
    }

    pub fn pid(&self) -> u16 {
        header_pid(self.data)
    }

    /// Raw two-bit transport scrambling control field.
    pub fn scrambling_control(&self) -> u8 {
        (self.data[3] >> 6) & 0x03
    }

    /// The high scrambling bit is still set, i.e. the packet left the
    /// descrambler encrypted.
    pub fn is_scrambled(&self) -> bool {
        (self.data[3] & 0x80) != 0
    }

    pub fn continuity_counter(&self) -> u8 {
        self.data[3] & 0x0F
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }
}

/// Mutable view over a single 188-byte packet, used to rewrite header fields
/// in place.
#[derive(Debug)]
pub struct PacketMut<'a> {
    data: &'a mut [u8],
}

impl<'a> PacketMut<'a> {
    pub fn new(data: &'a mut [u8]) -> Result<Self> {
        check_size(data.len())?;
        Ok(Self { data })
    }

    pub fn as_ref(&self) -> PacketRef<'_> {
        PacketRef { data: self.data }
    }

    pub fn pid(&self) -> u16 {
        header_pid(self.data)
    }

    pub fn is_scrambled(&self) -> bool {
        (self.data[3] & 0x80) != 0
    }

    /// Overwrite the 13-bit PID, keeping the error/start/priority flags of byte 1.
    pub fn set_pid(&mut self, pid: u16) {
        self.data[1] = (self.data[1] & 0xE0) | ((pid >> 8) as u8 & 0x1F);
        self.data[2] = (pid & 0xFF) as u8;
    }
}

/// Iterate over the complete packets of `buf`. A trailing partial packet is skipped.
pub fn packets(buf: &[u8]) -> impl Iterator<Item = PacketRef<'_>> {
    buf.chunks_exact(TS_PACKET_SIZE).map(|data| PacketRef { data })
}

/// Mutable counterpart of [`packets`].
pub fn packets_mut(buf: &mut [u8]) -> impl Iterator<Item = PacketMut<'_>> {
    buf.chunks_exact_mut(TS_PACKET_SIZE).map(|data| PacketMut { data })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(pid: u16, byte3: u8) -> Vec<u8> {
        let mut data = vec![0u8; TS_PACKET_SIZE];
        data[0] = SYNC_BYTE;
        data[1] = 0x40 | ((pid >> 8) as u8 & 0x1F); // PUSI set
        data[2] = (pid & 0xFF) as u8;
        data[3] = byte3;
        data
    }

    #[test]
    fn test_invalid_sync_byte() {
        let mut data = vec![0u8; TS_PACKET_SIZE];
        data[0] = 0x46; // Wrong sync byte
        assert!(matches!(
            PacketRef::parse(&data),
            Err(TsError::InvalidSyncByte(0x46))
        ));
        // The unchecked constructor still accepts it
        assert!(PacketRef::new(&data).is_ok());
    }

    #[test]
    fn test_invalid_packet_size() {
        let data = vec![SYNC_BYTE; 187];
        assert!(matches!(
            PacketRef::new(&data),
            Err(TsError::InvalidPacketSize(187))
        ));
    }

    #[test]
    fn test_header_fields() {
        let data = packet(0x0100, 0x9A); // scrambled (10), payload only, cc = 10
        let packet = PacketRef::parse(&data).unwrap();
        assert_eq!(packet.pid(), 0x0100);
        assert!(packet.payload_unit_start_indicator());
        assert!(!packet.transport_error_indicator());
        assert_eq!(packet.scrambling_control(), 0b10);
        assert!(packet.is_scrambled());
        assert_eq!(packet.continuity_counter(), 0x0A);
    }

    #[test]
    fn test_set_pid_keeps_flags() {
        let mut data = packet(0x0123, 0x10);
        data[1] |= 0x80; // TEI
        let mut packet = PacketMut::new(&mut data).unwrap();
        packet.set_pid(PID_NULL);
        assert_eq!(packet.pid(), PID_NULL);
        assert!(packet.as_ref().transport_error_indicator());
        assert!(packet.as_ref().payload_unit_start_indicator());
        assert_eq!(data[1], 0xDF);
        assert_eq!(data[2], 0xFF);
    }

    #[test]
    fn test_packets_skips_partial_tail() {
        let mut buf = packet(PID_PAT, 0x10);
        buf.extend(packet(PID_CAT, 0x10));
        buf.extend([SYNC_BYTE; 50]);
        let pids: Vec<u16> = packets(&buf).map(|p| p.pid()).collect();
        assert_eq!(pids, vec![PID_PAT, PID_CAT]);

        for mut p in packets_mut(&mut buf) {
            p.set_pid(0x0042);
        }
        assert!(packets(&buf).all(|p| p.pid() == 0x0042));
        assert_eq!(buf[2 * TS_PACKET_SIZE..], [SYNC_BYTE; 50]);
    }
}
