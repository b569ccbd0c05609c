//! Packet framing for the multicast feed.
//!
//! ```text
//! offset 0  : u32 sequence_number   (LE)
//! offset 4  : u64 sending_time ns   (LE)
//! offset 12 : repeated { u16 message_size (LE); message_size bytes }
//! ```
//!
//! `message_size` is the exact payload length. No padding is inserted between messages.

use bytes::{BufMut, Bytes, BytesMut};

pub const PACKET_HEADER_LEN: usize = 12;
pub const MESSAGE_SIZE_LEN: usize = 2;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("packet of {len} bytes is shorter than the {PACKET_HEADER_LEN}-byte header")]
    TruncatedHeader { len: usize },
    #[error("missing message size field at offset {offset}")]
    MissingSizeField { offset: usize },
    #[error("message at offset {offset} declares {declared} bytes but only {remaining} remain")]
    MessageOverrun { offset: usize, declared: usize, remaining: usize },
    #[error("payload of {len} bytes does not fit a 16-bit size field")]
    PayloadTooLarge { len: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub sequence: u32,
    pub sending_time: u64,
}

/// Bytes a packet carrying `payloads` occupies.
pub fn framed_len<B: AsRef<[u8]>>(payloads: &[B]) -> usize {
    PACKET_HEADER_LEN + payloads.iter().map(|p| MESSAGE_SIZE_LEN + p.as_ref().len()).sum::<usize>()
}

pub fn write_header(out: &mut BytesMut, header: PacketHeader) {
    out.put_u32_le(header.sequence);
    out.put_u64_le(header.sending_time);
}

/// One packet: header, then each payload behind its size prefix, in order.
pub fn frame_packet<B: AsRef<[u8]>>(
    sequence: u32,
    sending_time: u64,
    payloads: &[B],
) -> Result<Bytes, FramingError> {
    let mut out = BytesMut::with_capacity(framed_len(payloads));
    write_header(&mut out, PacketHeader { sequence, sending_time });
    for payload in payloads {
        let payload = payload.as_ref();
        let size = u16::try_from(payload.len())
            .map_err(|_| FramingError::PayloadTooLarge { len: payload.len() })?;
        out.put_u16_le(size);
        out.put_slice(payload);
    }
    Ok(out.freeze())
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParsedPacket<'a> {
    pub header: PacketHeader,
    pub messages: Vec<&'a [u8]>,
}

pub fn parse_header(packet: &[u8]) -> Result<PacketHeader, FramingError> {
    if packet.len() < PACKET_HEADER_LEN {
        return Err(FramingError::TruncatedHeader { len: packet.len() });
    }
    let mut seq = [0u8; 4];
    seq.copy_from_slice(&packet[0..4]);
    let mut ts = [0u8; 8];
    ts.copy_from_slice(&packet[4..12]);
    Ok(PacketHeader { sequence: u32::from_le_bytes(seq), sending_time: u64::from_le_bytes(ts) })
}

/// Splits a packet into its messages. Any framing fault rejects the whole packet.
pub fn parse_packet(packet: &[u8]) -> Result<ParsedPacket<'_>, FramingError> {
    let header = parse_header(packet)?;
    let mut messages = Vec::new();
    let mut offset = PACKET_HEADER_LEN;
    while offset < packet.len() {
        if packet.len() - offset < MESSAGE_SIZE_LEN {
            return Err(FramingError::MissingSizeField { offset });
        }
        let declared = u16::from_le_bytes([packet[offset], packet[offset + 1]]) as usize;
        let start = offset + MESSAGE_SIZE_LEN;
        let remaining = packet.len() - start;
        if declared > remaining {
            return Err(FramingError::MessageOverrun { offset, declared, remaining });
        }
        messages.push(&packet[start..start + declared]);
        offset = start + declared;
    }
    Ok(ParsedPacket { header, messages })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_message_packet_layout() {
        let a = vec![0xAAu8; 57];
        let b = vec![0xBBu8; 30];
        let packet = frame_packet(12345, 987654321, &[a.clone(), b.clone()]).unwrap();

        assert_eq!(packet.len(), 12 + 2 + 57 + 2 + 30);
        assert_eq!(&packet[0..4], &12345u32.to_le_bytes());
        assert_eq!(&packet[4..12], &987654321u64.to_le_bytes());
        assert_eq!(&packet[12..14], &57u16.to_le_bytes());
        assert_eq!(&packet[14..71], a.as_slice());
        assert_eq!(&packet[71..73], &30u16.to_le_bytes());
        assert_eq!(&packet[73..], b.as_slice());
    }

    #[test]
    fn test_parse_reconstructs_payloads() {
        let payloads: Vec<Vec<u8>> = vec![vec![1, 2, 3], vec![], vec![9; 200]];
        let packet = frame_packet(7, 8, &payloads).unwrap();
        let parsed = parse_packet(&packet).unwrap();
        assert_eq!(parsed.header, PacketHeader { sequence: 7, sending_time: 8 });
        let messages: Vec<Vec<u8>> = parsed.messages.iter().map(|m| m.to_vec()).collect();
        assert_eq!(messages, payloads);
    }

    #[test]
    fn test_header_only_packet() {
        let packet = frame_packet::<Vec<u8>>(1, 2, &[]).unwrap();
        assert_eq!(packet.len(), PACKET_HEADER_LEN);
        assert!(parse_packet(&packet).unwrap().messages.is_empty());
    }

    #[test]
    fn test_malformed_packets() {
        assert_eq!(parse_packet(&[0; 5]), Err(FramingError::TruncatedHeader { len: 5 }));

        let mut packet = frame_packet(1, 1, &[vec![1u8; 4]]).unwrap().to_vec();
        packet.push(0x01);
        assert_eq!(parse_packet(&packet), Err(FramingError::MissingSizeField { offset: 18 }));

        let mut overrun = frame_packet(1, 1, &[vec![1u8; 4]]).unwrap().to_vec();
        overrun[12] = 10;
        assert_eq!(
            parse_packet(&overrun),
            Err(FramingError::MessageOverrun { offset: 12, declared: 10, remaining: 4 })
        );
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let big = vec![0u8; u16::MAX as usize + 1];
        assert_eq!(
            frame_packet(1, 1, &[big]),
            Err(FramingError::PayloadTooLarge { len: u16::MAX as usize + 1 })
        );
    }
}
