use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::framer::{frame_packet, FramingError, MESSAGE_SIZE_LEN, PACKET_HEADER_LEN};
use crate::transport::DatagramSink;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatcherConfig {
    /// Messages per packet before an automatic flush.
    pub batch_size: usize,
    /// Upper bound on a whole packet, header included.
    pub max_packet_bytes: usize,
    pub sequence_base: u32,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        BatcherConfig { batch_size: 8, max_packet_bytes: 1420, sequence_base: 1 }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatcherStats {
    pub packets: u64,
    pub messages: u64,
    pub bytes: u64,
    pub send_errors: u64,
}

/// Accumulates encoded payloads and emits them as sequenced packets on one channel.
pub struct Batcher<S: DatagramSink> {
    channel: &'static str,
    sink: S,
    config: BatcherConfig,
    pending: Vec<Bytes>,
    pending_bytes: usize,
    next_sequence: u32,
    stats: BatcherStats,
}

impl<S: DatagramSink> Batcher<S> {
    pub fn new(channel: &'static str, sink: S, config: BatcherConfig) -> Self {
        let config = BatcherConfig { batch_size: config.batch_size.max(1), ..config };
        Batcher {
            channel,
            sink,
            pending: Vec::with_capacity(config.batch_size),
            pending_bytes: PACKET_HEADER_LEN,
            next_sequence: config.sequence_base,
            config,
            stats: BatcherStats::default(),
        }
    }

    /// Queues one payload, flushing first if it would push the packet past
    /// `max_packet_bytes`, and after if the batch is then full.
    pub fn push(&mut self, payload: Bytes, now_ns: u64) -> Result<(), FramingError> {
        if payload.len() > u16::MAX as usize {
            return Err(FramingError::PayloadTooLarge { len: payload.len() });
        }
        let framed = MESSAGE_SIZE_LEN + payload.len();
        if !self.pending.is_empty() && self.pending_bytes + framed > self.config.max_packet_bytes {
            self.flush(now_ns);
        }
        if PACKET_HEADER_LEN + framed > self.config.max_packet_bytes {
            warn!(channel = self.channel, len = payload.len(), "Payload exceeds max packet size; sending alone");
        }
        self.pending_bytes += framed;
        self.pending.push(payload);
        if self.pending.len() >= self.config.batch_size {
            self.flush(now_ns);
        }
        Ok(())
    }

    /// Frames and sends everything queued. Returns whether a packet went out.
    pub fn flush(&mut self, now_ns: u64) -> bool {
        if self.pending.is_empty() {
            return false;
        }
        let sequence = self.take_sequence();
        let payloads = std::mem::take(&mut self.pending);
        self.pending_bytes = PACKET_HEADER_LEN;

        let packet = match frame_packet(sequence, now_ns, &payloads) {
            Ok(packet) => packet,
            Err(e) => {
                error!(channel = self.channel, sequence, error = %e, "Dropping unframeable batch");
                return false;
            }
        };

        match self.sink.send(&packet) {
            Ok(()) => {
                self.stats.packets += 1;
                self.stats.messages += payloads.len() as u64;
                self.stats.bytes += packet.len() as u64;
                metrics::counter!("mdfeed_cme_packets_total", "channel" => self.channel).increment(1);
                metrics::counter!("mdfeed_cme_bytes_total", "channel" => self.channel)
                    .increment(packet.len() as u64);
                debug!(channel = self.channel, sequence, messages = payloads.len(), len = packet.len(), "Sent packet");
            }
            Err(e) => {
                self.stats.send_errors += 1;
                metrics::counter!("mdfeed_cme_send_errors_total", "channel" => self.channel).increment(1);
                warn!(channel = self.channel, sequence, error = %e, "Packet send failed");
            }
        }
        self.pending = payloads;
        self.pending.clear();
        true
    }

    fn take_sequence(&mut self) -> u32 {
        let sequence = self.next_sequence;
        self.next_sequence = match sequence.checked_add(1) {
            Some(next) => next,
            None => {
                warn!(channel = self.channel, base = self.config.sequence_base, "Packet sequence exhausted; wrapping to base");
                self.config.sequence_base
            }
        };
        sequence
    }

    /// Sequence the next packet will carry.
    pub fn next_sequence(&self) -> u32 {
        self.next_sequence
    }

    pub fn reset_sequence(&mut self) {
        self.next_sequence = self.config.sequence_base;
    }

    /// Resumes numbering at `sequence`, e.g. after a restart.
    pub fn set_next_sequence(&mut self, sequence: u32) {
        self.next_sequence = sequence;
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> BatcherStats {
        self.stats
    }

    pub fn config(&self) -> &BatcherConfig {
        &self.config
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cme::framer::parse_packet;
    use std::io;

    #[derive(Default)]
    struct VecSink {
        packets: Vec<Vec<u8>>,
        fail: bool,
    }

    impl DatagramSink for VecSink {
        fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::Other, "down"));
            }
            self.packets.push(bytes.to_vec());
            Ok(())
        }
    }

    fn cfg(batch_size: usize) -> BatcherConfig {
        BatcherConfig { batch_size, ..BatcherConfig::default() }
    }

    #[test]
    fn test_flushes_when_batch_full() {
        let mut b = Batcher::new("test", VecSink::default(), cfg(3));
        for i in 0..7u8 {
            b.push(Bytes::from(vec![i; 10]), 100).unwrap();
        }
        assert_eq!(b.sink().packets.len(), 2);
        assert_eq!(b.pending_len(), 1);

        assert!(b.flush(200));
        assert!(!b.flush(300));
        let packets = &b.sink().packets;
        assert_eq!(packets.len(), 3);

        let sequences: Vec<u32> =
            packets.iter().map(|p| parse_packet(p).unwrap().header.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        let last = parse_packet(&packets[2]).unwrap();
        assert_eq!(last.header.sending_time, 200);
        assert_eq!(last.messages, vec![&[6u8; 10][..]]);
        assert_eq!(b.stats().messages, 7);
        assert_eq!(b.next_sequence(), 4);
    }

    #[test]
    fn test_mtu_guard_splits_packets() {
        let config = BatcherConfig { batch_size: 10, max_packet_bytes: 100, sequence_base: 50 };
        let mut b = Batcher::new("test", VecSink::default(), config);
        // 12 + 2 * (2 + 40) = 96 fits, a third would not
        for _ in 0..3 {
            b.push(Bytes::from(vec![0u8; 40]), 1).unwrap();
        }
        assert_eq!(b.sink().packets.len(), 1);
        assert_eq!(b.sink().packets[0].len(), 96);
        assert_eq!(parse_packet(&b.sink().packets[0]).unwrap().header.sequence, 50);
        assert_eq!(b.pending_len(), 1);
    }

    #[test]
    fn test_send_failure_counts_and_consumes_sequence() {
        let sink = VecSink { fail: true, ..VecSink::default() };
        let mut b = Batcher::new("test", sink, cfg(1));
        b.push(Bytes::from_static(b"abc"), 1).unwrap();
        assert_eq!(b.stats().send_errors, 1);
        assert_eq!(b.stats().packets, 0);
        assert_eq!(b.next_sequence(), 2);
        assert_eq!(b.pending_len(), 0);
    }

    #[test]
    fn test_sequence_wraps_to_base() {
        let mut b = Batcher::new("test", VecSink::default(), cfg(1));
        b.set_next_sequence(u32::MAX);
        b.push(Bytes::from_static(b"a"), 1).unwrap();
        b.push(Bytes::from_static(b"b"), 2).unwrap();

        let sequences: Vec<u32> =
            b.sink().packets.iter().map(|p| parse_packet(p).unwrap().header.sequence).collect();
        assert_eq!(sequences, vec![u32::MAX, 1]);
        assert_eq!(b.next_sequence(), 2);

        b.reset_sequence();
        assert_eq!(b.next_sequence(), 1);
    }

    #[test]
    fn test_rejects_oversized_payload() {
        let mut b = Batcher::new("test", VecSink::default(), cfg(2));
        let err = b.push(Bytes::from(vec![0u8; 70_000]), 1).unwrap_err();
        assert_eq!(err, FramingError::PayloadTooLarge { len: 70_000 });
        assert_eq!(b.pending_len(), 0);
    }
}
