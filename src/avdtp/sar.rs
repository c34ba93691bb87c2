//! Signaling message reassembly
//!
//! Inbound fragments accumulate into one buffer per channel. The packet
//! types form a regular language per direction, `SINGLE | START CONT*
//! END`; anything out of that order discards the reassembly in
//! progress. A completed reassembly is normalized to the SINGLE layout
//! (header octet, signal octet, body) so the parser never sees the
//! fragment count octet.

use heapless::Vec;

use super::types::PacketType;
use crate::config::AVDTP_SIG_BUFFER_SIZE;

pub(crate) struct Reassembler {
    buffer: Vec<u8, AVDTP_SIG_BUFFER_SIZE>,
    in_progress: bool,
}

impl Reassembler {
    pub(crate) fn new() -> Self {
        Self {
            buffer: Vec::new(),
            in_progress: false,
        }
    }

    /// Drop any reassembly in progress.
    pub(crate) fn reset(&mut self) {
        self.buffer.clear();
        self.in_progress = false;
    }

    /// Feed one transport packet. Returns the completed message when
    /// the fragment finished one.
    pub(crate) fn add_fragment(&mut self, data: &[u8]) -> Option<Vec<u8, AVDTP_SIG_BUFFER_SIZE>> {
        if data.is_empty() {
            warn!("[avdtp] Empty signaling packet dropped");
            return None;
        }
        let packet_type = PacketType::from(data[0] >> 2);
        if data.len() < packet_type.min_len() {
            warn!("[avdtp] Bad length during reassembly");
            return None;
        }

        match packet_type {
            PacketType::Single => {
                if self.in_progress {
                    warn!("[avdtp] Got single during reassembly");
                    self.reset();
                }
                Vec::from_slice(data).ok()
            }
            PacketType::Start => {
                if self.in_progress {
                    warn!("[avdtp] Got start during reassembly");
                }
                self.reset();
                if data.len() - 1 > AVDTP_SIG_BUFFER_SIZE {
                    warn!("[avdtp] Start fragment larger than reassembly buffer");
                    return None;
                }
                // Normalize: drop the fragment count octet so the
                // assembled message reads like a SINGLE packet.
                self.buffer.push(data[0]).ok()?;
                self.buffer.extend_from_slice(&data[2..]).ok()?;
                self.in_progress = true;
                None
            }
            PacketType::Continue => {
                if !self.in_progress {
                    warn!("[avdtp] Continue fragment out of order");
                    return None;
                }
                if self.buffer.extend_from_slice(&data[1..]).is_err() {
                    warn!("[avdtp] Fragmented message too big");
                    self.reset();
                }
                None
            }
            PacketType::End => {
                if !self.in_progress {
                    warn!("[avdtp] End fragment out of order");
                    return None;
                }
                if self.buffer.extend_from_slice(&data[1..]).is_err() {
                    warn!("[avdtp] Fragmented message too big");
                    self.reset();
                    return None;
                }
                self.in_progress = false;
                Some(core::mem::take(&mut self.buffer))
            }
        }
    }
}

/// Number of subsequent packets a START fragment announces for a body
/// of `len` octets at the given MTU.
pub(crate) fn number_of_signal_packets(len: usize, peer_mtu: usize) -> u8 {
    ((len + PacketType::Start.min_len() - peer_mtu) / (peer_mtu - 1) + 2) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avdtp::types::{MessageType, SignalId};
    use crate::avdtp::signal::SignalHeader;

    fn header(packet_type: PacketType) -> u8 {
        SignalHeader {
            label: 5,
            packet_type,
            message_type: MessageType::Command,
        }
        .to_byte()
    }

    #[test]
    fn single_passes_through() {
        let mut reassembler = Reassembler::new();
        let packet = [header(PacketType::Single), SignalId::Discover as u8, 0xaa];
        let out = reassembler.add_fragment(&packet).unwrap();
        assert_eq!(out.as_slice(), &packet);
    }

    #[test]
    fn start_cont_end_reassemble_normalized() {
        let mut reassembler = Reassembler::new();
        // START: header, nosp=3, signal, body
        assert!(reassembler
            .add_fragment(&[header(PacketType::Start), 3, SignalId::SetConfiguration as u8, 1, 2])
            .is_none());
        assert!(reassembler.add_fragment(&[header(PacketType::Continue), 3, 4]).is_none());
        let out = reassembler
            .add_fragment(&[header(PacketType::End), 5, 6])
            .unwrap();
        assert_eq!(
            out.as_slice(),
            &[
                header(PacketType::Start),
                SignalId::SetConfiguration as u8,
                1,
                2,
                3,
                4,
                5,
                6
            ]
        );
    }

    #[test]
    fn orphan_fragments_dropped() {
        let mut reassembler = Reassembler::new();
        assert!(reassembler.add_fragment(&[header(PacketType::Continue), 1]).is_none());
        assert!(reassembler.add_fragment(&[header(PacketType::End), 1]).is_none());
    }

    #[test]
    fn single_discards_reassembly_in_progress() {
        let mut reassembler = Reassembler::new();
        assert!(reassembler
            .add_fragment(&[header(PacketType::Start), 2, SignalId::Discover as u8, 1])
            .is_none());
        let single = [header(PacketType::Single), SignalId::Discover as u8];
        assert!(reassembler.add_fragment(&single).is_some());
        // The earlier reassembly is gone.
        assert!(reassembler.add_fragment(&[header(PacketType::End), 9]).is_none());
    }

    #[test]
    fn oversized_reassembly_dropped() {
        let mut reassembler = Reassembler::new();
        assert!(reassembler
            .add_fragment(&[header(PacketType::Start), 9, SignalId::GetCapabilities as u8, 0])
            .is_none());
        let chunk = [0u8; 201];
        let mut fragment = heapless::Vec::<u8, 256>::new();
        fragment.push(header(PacketType::Continue)).unwrap();
        fragment.extend_from_slice(&chunk).unwrap();
        assert!(reassembler.add_fragment(&fragment).is_none());
        assert!(reassembler.add_fragment(&fragment).is_none());
        // The third continue exceeds the buffer and the whole
        // reassembly is dropped, so a following END is an orphan.
        assert!(reassembler.add_fragment(&fragment).is_none());
        assert!(reassembler
            .add_fragment(&[header(PacketType::End), 1, 2, 3])
            .is_none());
    }

    #[test]
    fn short_fragment_dropped() {
        let mut reassembler = Reassembler::new();
        // START needs header, nosp and signal octets.
        assert!(reassembler.add_fragment(&[header(PacketType::Start), 2]).is_none());
        assert!(reassembler.add_fragment(&[header(PacketType::Single)]).is_none());
    }

    #[test]
    fn nosp_arithmetic() {
        // 100 byte body at MTU 48: START carries 45, then 2 * 27... the
        // original arithmetic counts the packets after the first.
        assert_eq!(number_of_signal_packets(100, 48), 3);
        // Just over a single packet.
        assert_eq!(number_of_signal_packets(47, 48), 2);
    }
}
