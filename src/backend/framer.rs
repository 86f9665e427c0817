//! Binary telemetry framing
//!
//! Telemetry records share the serial stream with the ASCII control protocol,
//! so record boundaries are found by scanning for a magic marker at any byte
//! offset rather than by trusting a fixed position.
//!
//! # Wire layout (little-endian)
//!
//! | offset | size | field |
//! |--------|------|-------|
//! | 0 | 4 | magic `0xDEADBEEF` |
//! | 4 | 4 | payload length in bytes |
//! | 8 | 4 | packet sequence id |
//! | 12 | n | `n / 4` unsigned 32-bit samples |
//!
//! [`extract`] is a pure function over a byte slice. [`PacketBuffer`] owns the
//! accumulation arena used by a device's read path and trims consumed bytes.

/// Marker opening every telemetry record
pub const MAGIC: u32 = 0xDEAD_BEEF;

/// Size of the record header in bytes
pub const HEADER_LEN: usize = 12;

/// Size of one sample in bytes
pub const SAMPLE_LEN: usize = 4;

/// Largest payload accepted before a header is treated as noise
pub const MAX_PAYLOAD_BYTES: u32 = 64 * 1024;

const MAGIC_BYTES: [u8; 4] = MAGIC.to_le_bytes();

/// Header of a telemetry record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Magic marker, always [`MAGIC`] for parsed packets
    pub magic: u32,
    /// Payload length in bytes
    pub payload_size: u32,
    /// Monotonically increasing sequence id
    pub packet_id: u32,
}

/// One telemetry record: a header and one sample per configured node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub header: PacketHeader,
    pub payload: Vec<u32>,
}

impl DataPacket {
    /// Build a packet carrying the given samples
    pub fn new(packet_id: u32, payload: Vec<u32>) -> Self {
        Self {
            header: PacketHeader {
                magic: MAGIC,
                payload_size: (payload.len() * SAMPLE_LEN) as u32,
                packet_id,
            },
            payload,
        }
    }

    /// Sequence id of this packet
    pub fn id(&self) -> u32 {
        self.header.packet_id
    }

    /// Serialize to the wire layout
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.payload.len() * SAMPLE_LEN);
        bytes.extend_from_slice(&self.header.magic.to_le_bytes());
        bytes.extend_from_slice(&self.header.payload_size.to_le_bytes());
        bytes.extend_from_slice(&self.header.packet_id.to_le_bytes());
        for sample in &self.payload {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        bytes
    }
}

fn read_u32(buffer: &[u8], at: usize) -> Option<u32> {
    let bytes = buffer.get(at..at + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn find_marker(buffer: &[u8], from: usize) -> Option<usize> {
    buffer
        .get(from..)?
        .windows(MAGIC_BYTES.len())
        .position(|w| w == MAGIC_BYTES)
        .map(|pos| from + pos)
}

/// Extract the first complete telemetry record from `buffer`
///
/// Returns the packet and the number of bytes that remain in the buffer after
/// the packet's end. Bytes before the marker are noise and belong to the
/// consumed prefix. Returns `None` when no marker is present, or when the
/// first marker is followed by an incomplete header or payload; the caller
/// should wait for more bytes and retry with the same buffer.
pub fn extract(buffer: &[u8]) -> Option<(DataPacket, usize)> {
    let mut search_from = 0;

    while let Some(offset) = find_marker(buffer, search_from) {
        if buffer.len() - offset < HEADER_LEN {
            return None;
        }

        let payload_size = read_u32(buffer, offset + 4)?;
        let packet_id = read_u32(buffer, offset + 8)?;

        if payload_size > MAX_PAYLOAD_BYTES {
            tracing::debug!(
                "Skipping marker at offset {} with implausible payload size {}",
                offset,
                payload_size
            );
            search_from = offset + 1;
            continue;
        }

        let payload_start = offset + HEADER_LEN;
        let end = payload_start + payload_size as usize;
        if end > buffer.len() {
            return None;
        }

        let sample_bytes = (payload_size as usize / SAMPLE_LEN) * SAMPLE_LEN;
        let payload = buffer[payload_start..payload_start + sample_bytes]
            .chunks_exact(SAMPLE_LEN)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        let packet = DataPacket {
            header: PacketHeader {
                magic: MAGIC,
                payload_size,
                packet_id,
            },
            payload,
        };
        return Some((packet, buffer.len() - end));
    }

    None
}

/// Accumulation buffer for a device's receive stream
///
/// Bytes are appended as they are read from the link; complete packets are
/// taken from the front, discarding any noise that preceded them.
#[derive(Debug, Default)]
pub struct PacketBuffer {
    bytes: Vec<u8>,
}

impl PacketBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
    }

    /// Number of buffered bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Check if the buffer holds no bytes
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Buffered bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Drop all buffered bytes
    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    /// Take the next complete packet, trimming everything up to its end
    pub fn next_packet(&mut self) -> Option<DataPacket> {
        match extract(&self.bytes) {
            Some((packet, remaining)) => {
                let consumed = self.bytes.len() - remaining;
                self.bytes.drain(..consumed);
                Some(packet)
            }
            None => {
                self.discard_noise();
                None
            }
        }
    }

    /// Iterate over every complete packet currently buffered
    pub fn drain_packets(&mut self) -> impl Iterator<Item = DataPacket> + '_ {
        std::iter::from_fn(move || self.next_packet())
    }

    /// Drop leading bytes that can never become part of a packet
    ///
    /// Keeps everything from the first marker on, or the last three bytes
    /// when no marker is present since they may start a split marker.
    fn discard_noise(&mut self) {
        let keep_from = match find_marker(&self.bytes, 0) {
            Some(offset) => offset,
            None => self.bytes.len().saturating_sub(MAGIC_BYTES.len() - 1),
        };
        if keep_from > 0 {
            self.bytes.drain(..keep_from);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_layout() {
        let bytes = DataPacket::new(7, vec![1, 2]).encode();
        assert_eq!(&bytes[0..4], &[0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(read_u32(&bytes, 4), Some(8));
        assert_eq!(read_u32(&bytes, 8), Some(7));
        assert_eq!(bytes.len(), HEADER_LEN + 8);
    }

    #[test]
    fn test_extract_with_noise() {
        let packet = DataPacket::new(42, vec![10, 20, 30]);
        let mut buffer = vec![0x00, 0x11, 0xEF, 0xBE];
        buffer.extend(packet.encode());
        buffer.extend([0x55, 0x66]);

        let (extracted, remaining) = extract(&buffer).expect("packet");
        assert_eq!(extracted, packet);
        assert_eq!(remaining, 2);
    }

    #[test]
    fn test_no_marker() {
        assert!(extract(&[]).is_none());
        assert!(extract(&[1, 2, 3]).is_none());
        assert!(extract(&[0u8; 64]).is_none());
    }

    #[test]
    fn test_incomplete_header() {
        let bytes = DataPacket::new(1, vec![5]).encode();
        assert!(extract(&bytes[..HEADER_LEN - 1]).is_none());
    }

    #[test]
    fn test_incomplete_payload() {
        let bytes = DataPacket::new(1, vec![5, 6, 7]).encode();
        assert!(extract(&bytes[..bytes.len() - 1]).is_none());
    }

    #[test]
    fn test_oversized_payload_is_skipped() {
        let mut buffer = MAGIC_BYTES.to_vec();
        buffer.extend((MAX_PAYLOAD_BYTES + 1).to_le_bytes());
        buffer.extend(0u32.to_le_bytes());
        let packet = DataPacket::new(3, vec![99]);
        buffer.extend(packet.encode());

        let (extracted, remaining) = extract(&buffer).expect("packet after bogus header");
        assert_eq!(extracted, packet);
        assert_eq!(remaining, 0);
    }

    #[test]
    fn test_empty_payload() {
        let packet = DataPacket::new(9, Vec::new());
        let (extracted, remaining) = extract(&packet.encode()).expect("packet");
        assert!(extracted.payload.is_empty());
        assert_eq!(remaining, 0);
    }

    #[test]
    fn test_buffer_drains_all_packets() {
        let mut buffer = PacketBuffer::new();
        buffer.extend(b"ID_G,1\n");
        for id in 0..3 {
            buffer.extend(&DataPacket::new(id, vec![id * 10]).encode());
        }
        let partial = DataPacket::new(3, vec![30]).encode();
        buffer.extend(&partial[..6]);

        let ids: Vec<u32> = buffer.drain_packets().map(|p| p.id()).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(buffer.as_slice(), &partial[..6]);

        buffer.extend(&partial[6..]);
        let packet = buffer.next_packet().expect("completed packet");
        assert_eq!(packet.payload, vec![30]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_buffer_discards_noise_without_marker() {
        let mut buffer = PacketBuffer::new();
        buffer.extend(&[1, 2, 3, 4, 5, 0xEF, 0xBE, 0xAD]);
        assert!(buffer.next_packet().is_none());
        assert_eq!(buffer.as_slice(), &[0xEF, 0xBE, 0xAD]);

        buffer.extend(&[0xDE]);
        buffer.extend(&8u32.to_le_bytes());
        buffer.extend(&1u32.to_le_bytes());
        buffer.extend(&[1, 0, 0, 0, 2, 0, 0, 0]);
        let packet = buffer.next_packet().expect("packet spanning split marker");
        assert_eq!(packet.payload, vec![1, 2]);
    }

    proptest! {
        #[test]
        fn test_single_packet_in_noise(
            leading in prop::collection::vec(0u8..0xEF, 0..64),
            trailing in prop::collection::vec(any::<u8>(), 0..64),
            id in any::<u32>(),
            payload in prop::collection::vec(any::<u32>(), 0..16),
        ) {
            let packet = DataPacket::new(id, payload);
            let mut buffer = leading;
            buffer.extend(packet.encode());
            buffer.extend(&trailing);

            let (extracted, remaining) = extract(&buffer).expect("packet");
            prop_assert_eq!(extracted, packet);
            prop_assert_eq!(remaining, trailing.len());
        }

        #[test]
        fn test_truncated_packet_is_not_consumed(
            leading in prop::collection::vec(0u8..0xEF, 0..32),
            payload in prop::collection::vec(any::<u32>(), 1..16),
            cut in 1usize..12,
        ) {
            let encoded = DataPacket::new(1, payload).encode();
            let cut = cut.min(encoded.len() - MAGIC_BYTES.len());
            let mut buffer = leading;
            buffer.extend(&encoded[..encoded.len() - cut]);
            prop_assert!(extract(&buffer).is_none());
        }
    }
}
