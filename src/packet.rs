use std::collections::VecDeque;
use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::chunk::chunk_header::*;
use crate::chunk::Chunk;
use crate::error::{Error, Result};
use crate::util::*;

/// Packet represents an SCTP packet
///
/// An SCTP packet is composed of a common header and chunks.  A chunk
/// contains either control information or user data.
///
///
///SCTP Packet Format
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                        Common Header                          |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                          Chunk #1                             |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                           ...                                 |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                          Chunk #n                             |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///
///
///SCTP Common Header Format
///
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|     Source Port Number        |     Destination Port Number   |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                      Verification Tag                         |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                           Checksum                            |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///
/// ## Specifications
///
/// * [RFC 4960 §3]
///
/// [RFC 4960 §3]: https://tools.ietf.org/html/rfc4960#section-3
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub(crate) struct Packet {
    pub(crate) source_port: u16,
    pub(crate) destination_port: u16,
    pub(crate) verification_tag: u32,
    pub(crate) chunks: Vec<Chunk>,
}

/// The common header fields shared by every packet of an association.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct PacketHeader {
    pub(crate) source_port: u16,
    pub(crate) destination_port: u16,
    pub(crate) verification_tag: u32,
}

/// makes packet printable
impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut res = format!(
            "Packet:
        source_port: {}
        destination_port: {}
        verification_tag: {}
        ",
            self.source_port, self.destination_port, self.verification_tag,
        );
        for chunk in &self.chunks {
            res += format!("Chunk: {chunk}").as_str();
        }
        write!(f, "{res}")
    }
}

pub(crate) const PACKET_HEADER_SIZE: usize = 12;

impl Packet {
    pub(crate) fn new(header: PacketHeader, chunks: Vec<Chunk>) -> Self {
        Packet {
            source_port: header.source_port,
            destination_port: header.destination_port,
            verification_tag: header.verification_tag,
            chunks,
        }
    }

    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        if raw.len() < PACKET_HEADER_SIZE {
            return Err(Error::ErrPacketRawTooSmall);
        }

        let reader = &mut raw.clone();

        let source_port = reader.get_u16();
        let destination_port = reader.get_u16();
        let verification_tag = reader.get_u32();
        let their_checksum = reader.get_u32_le();
        let our_checksum = generate_packet_checksum(raw);

        if their_checksum != our_checksum {
            return Err(Error::ErrChecksumMismatch {
                theirs: their_checksum,
                ours: our_checksum,
            });
        }

        let mut chunks = vec![];
        let mut offset = PACKET_HEADER_SIZE;
        // The padding of the last chunk may be missing.
        while offset < raw.len() {
            let rest = raw.slice(offset..);
            // Walk by the declared length, not the re-serialized one: senders
            // differ on whether the last parameter's padding is counted.
            let header = ChunkHeader::unmarshal(&rest)?;
            let c = Chunk::unmarshal(&rest)?;

            let chunk_length = CHUNK_HEADER_SIZE + header.value_length();
            offset += chunk_length + get_padding_size(chunk_length);
            chunks.push(c);
        }

        Ok(Packet {
            source_port,
            destination_port,
            verification_tag,
            chunks,
        })
    }

    pub(crate) fn marshal_to(&self, writer: &mut BytesMut) -> Result<usize> {
        // Populate static headers
        // 8-12 is Checksum which will be populated when packet is complete
        writer.put_u16(self.source_port);
        writer.put_u16(self.destination_port);
        writer.put_u32(self.verification_tag);

        // This is where the checksum will be written
        let checksum_pos = writer.len();
        writer.extend_from_slice(&FOUR_ZEROES);

        // Populate chunks
        for c in &self.chunks {
            c.marshal_to(writer)?;

            let padding_needed = get_padding_size(writer.len());
            if padding_needed != 0 {
                writer.put_bytes(0, padding_needed);
            }
        }

        let mut digest = ISCSI_CRC.digest();
        digest.update(&writer[checksum_pos - 8..]);
        let checksum = digest.finalize();

        // Checksum is already in BigEndian
        // Using LittleEndian stops it from being flipped
        let checksum_place = &mut writer[checksum_pos..checksum_pos + 4];
        checksum_place.copy_from_slice(&checksum.to_le_bytes());

        Ok(writer.len())
    }

    pub(crate) fn marshal(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.length());
        self.marshal_to(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Serialized size including chunk padding.
    pub(crate) fn length(&self) -> usize {
        PACKET_HEADER_SIZE
            + self
                .chunks
                .iter()
                .map(|c| c.length() + get_padding_size(c.length()))
                .sum::<usize>()
    }

    pub(crate) fn check_packet(&self) -> Result<()> {
        // All packets must adhere to these rules

        // This is the SCTP sender's port number.  It can be used by the
        // receiver in combination with the source IP address, the SCTP
        // destination port, and possibly the destination IP address to
        // identify the association to which this packet belongs.  The port
        // number 0 MUST NOT be used.
        if self.source_port == 0 {
            return Err(Error::ErrSctpPacketSourcePortZero);
        }

        // This is the SCTP port number to which this packet is destined.
        // The receiving host will use this port number to de-multiplex the
        // SCTP packet to the correct receiving endpoint/application.  The
        // port number 0 MUST NOT be used.
        if self.destination_port == 0 {
            return Err(Error::ErrSctpPacketDestinationPortZero);
        }

        // Check values on the packet that are specific to a particular chunk type
        for c in &self.chunks {
            if let Chunk::Init(_) = c {
                // An INIT or INIT ACK chunk MUST NOT be bundled with any other chunk.
                // They MUST be the only chunks present in the SCTP packets that carry
                // them.
                if self.chunks.len() != 1 {
                    return Err(Error::ErrInitChunkBundled);
                }

                // A packet containing an INIT chunk MUST have a zero Verification
                // Tag.
                if self.verification_tag != 0 {
                    return Err(Error::ErrInitChunkVerifyTagNotZero);
                }
            }
        }

        Ok(())
    }
}

fn must_travel_alone(c: &Chunk) -> bool {
    matches!(c, Chunk::Init(_) | Chunk::InitAck(_))
}

/// Takes chunks from the front of `chunks` and packs them into one packet no
/// larger than `mtu`. Chunks are first ordered by [`Chunk::priority`], keeping
/// the relative order within a class. Whatever does not fit stays queued for
/// the next call. A single chunk larger than `mtu` is still emitted on its own.
pub(crate) fn bundle_chunks(
    header: PacketHeader,
    chunks: &mut VecDeque<Chunk>,
    mtu: usize,
) -> Option<Packet> {
    chunks.make_contiguous().sort_by_key(|c| c.priority());

    let first = chunks.pop_front()?;
    let mut size = PACKET_HEADER_SIZE + first.length() + get_padding_size(first.length());
    let alone = must_travel_alone(&first);
    let mut bundled = vec![first];

    while !alone {
        let next_len = match chunks.front() {
            Some(c) if !must_travel_alone(c) => c.length() + get_padding_size(c.length()),
            _ => break,
        };
        if size + next_len > mtu {
            break;
        }
        if let Some(c) = chunks.pop_front() {
            size += next_len;
            bundled.push(c);
        }
    }

    Some(Packet::new(header, bundled))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::chunk::chunk_abort::ChunkAbort;
    use crate::chunk::chunk_init::ChunkInit;
    use crate::chunk::chunk_payload_data::ChunkPayloadData;
    use crate::chunk::chunk_selective_ack::ChunkSelectiveAck;
    use crate::chunk::chunk_shutdown_ack::ChunkShutdownAck;

    fn data_chunk(tsn: u32, len: usize) -> Chunk {
        Chunk::PayloadData(ChunkPayloadData {
            beginning_fragment: true,
            ending_fragment: true,
            tsn,
            user_data: Bytes::from(vec![0xab; len]),
            ..Default::default()
        })
    }

    fn header() -> PacketHeader {
        PacketHeader {
            source_port: 5000,
            destination_port: 5000,
            verification_tag: 0x1234,
        }
    }

    #[test]
    fn test_packet_unmarshal() -> Result<()> {
        let result = Packet::unmarshal(&Bytes::new());
        assert_eq!(
            result,
            Err(Error::ErrPacketRawTooSmall),
            "Unmarshal should fail when a packet is too small to be SCTP"
        );

        let header_only = Bytes::from_static(&[
            0x13, 0x88, 0x13, 0x88, 0x00, 0x00, 0x00, 0x00, 0x06, 0xa9, 0x00, 0xe1,
        ]);
        let pkt = Packet::unmarshal(&header_only)?;
        assert_eq!(pkt.source_port, 5000);
        assert_eq!(pkt.destination_port, 5000);
        assert_eq!(pkt.verification_tag, 0);
        assert!(pkt.chunks.is_empty());

        let raw_chunk = Bytes::from_static(&[
            0x13, 0x88, 0x13, 0x88, 0x00, 0x00, 0x00, 0x00, 0x81, 0x46, 0x9d, 0xfc, 0x01, 0x00,
            0x00, 0x56, 0x55, 0xb9, 0x64, 0xa5, 0x00, 0x02, 0x00, 0x00, 0x04, 0x00, 0x08, 0x00,
            0xe8, 0x6d, 0x10, 0x30, 0xc0, 0x00, 0x00, 0x04, 0x80, 0x08, 0x00, 0x09, 0xc0, 0x0f,
            0xc1, 0x80, 0x82, 0x00, 0x00, 0x00, 0x80, 0x02, 0x00, 0x24, 0x9f, 0xeb, 0xbb, 0x5c,
            0x50, 0xc9, 0xbf, 0x75, 0x9c, 0xb1, 0x2c, 0x57, 0x4f, 0xa4, 0x5a, 0x51, 0xba, 0x60,
            0x17, 0x78, 0x27, 0x94, 0x5c, 0x31, 0xe6, 0x5d, 0x5b, 0x09, 0x47, 0xe2, 0x22, 0x06,
            0x80, 0x04, 0x00, 0x06, 0x00, 0x01, 0x00, 0x00, 0x80, 0x03, 0x00, 0x06, 0x80, 0xc1,
            0x00, 0x00,
        ]);

        let pkt = Packet::unmarshal(&raw_chunk)?;
        assert_eq!(pkt.chunks.len(), 1);
        assert!(matches!(pkt.chunks[0], Chunk::Init(_)));
        pkt.check_packet()?;

        Ok(())
    }

    #[test]
    fn test_packet_checksum_mismatch() {
        let corrupted = Bytes::from_static(&[
            0x13, 0x88, 0x13, 0x88, 0x00, 0x00, 0x00, 0x00, 0x06, 0xa9, 0x00, 0xe2,
        ]);
        let err = Packet::unmarshal(&corrupted).unwrap_err();
        assert!(matches!(err, Error::ErrChecksumMismatch { .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::TransportLoss);
    }

    #[test]
    fn test_packet_marshal() -> Result<()> {
        let header_only = Bytes::from_static(&[
            0x13, 0x88, 0x13, 0x88, 0x00, 0x00, 0x00, 0x00, 0x06, 0xa9, 0x00, 0xe1,
        ]);
        let pkt = Packet::unmarshal(&header_only)?;
        let header_only_marshaled = pkt.marshal()?;
        assert_eq!(header_only, header_only_marshaled);

        Ok(())
    }

    #[test]
    fn test_packet_round_trip_with_padding() -> Result<()> {
        let pkt = Packet::new(
            header(),
            vec![
                Chunk::SelectiveAck(ChunkSelectiveAck {
                    cumulative_tsn_ack: 3,
                    advertised_receiver_window_credit: 1 << 20,
                    ..Default::default()
                }),
                data_chunk(4, 5),
                data_chunk(5, 1),
            ],
        );
        let raw = pkt.marshal()?;
        assert_eq!(raw.len() % 4, 0, "packet must be padded to 4 bytes");
        assert_eq!(raw.len(), pkt.length());
        assert_eq!(Packet::unmarshal(&raw)?, pkt);

        Ok(())
    }

    #[test]
    fn test_check_packet() {
        let init = Chunk::Init(ChunkInit {
            initiate_tag: 1,
            advertised_receiver_window_credit: 1500,
            num_outbound_streams: 1,
            num_inbound_streams: 1,
            ..Default::default()
        });

        let tests = vec![
            (
                Packet {
                    source_port: 0,
                    destination_port: 1,
                    ..Default::default()
                },
                Err(Error::ErrSctpPacketSourcePortZero),
            ),
            (
                Packet {
                    source_port: 1,
                    destination_port: 0,
                    ..Default::default()
                },
                Err(Error::ErrSctpPacketDestinationPortZero),
            ),
            (
                Packet {
                    source_port: 1,
                    destination_port: 1,
                    verification_tag: 0,
                    chunks: vec![init.clone(), data_chunk(1, 1)],
                },
                Err(Error::ErrInitChunkBundled),
            ),
            (
                Packet {
                    source_port: 1,
                    destination_port: 1,
                    verification_tag: 7,
                    chunks: vec![init.clone()],
                },
                Err(Error::ErrInitChunkVerifyTagNotZero),
            ),
            (
                Packet {
                    source_port: 1,
                    destination_port: 1,
                    verification_tag: 0,
                    chunks: vec![init],
                },
                Ok(()),
            ),
        ];

        for (pkt, expected) in tests {
            assert_eq!(pkt.check_packet(), expected, "{pkt}");
        }
    }

    #[test]
    fn test_bundle_chunks_orders_by_priority() {
        let mut chunks: VecDeque<Chunk> = VecDeque::new();
        chunks.push_back(data_chunk(1, 8));
        chunks.push_back(Chunk::SelectiveAck(ChunkSelectiveAck::default()));
        chunks.push_back(data_chunk(2, 8));
        chunks.push_back(Chunk::Abort(ChunkAbort::default()));

        let pkt = bundle_chunks(header(), &mut chunks, 1228).expect("a packet");
        assert!(chunks.is_empty());
        assert_eq!(pkt.verification_tag, 0x1234);

        let kinds: Vec<_> = pkt.chunks.iter().map(|c| c.typ().to_string()).collect();
        assert_eq!(kinds, vec!["ABORT", "SACK", "DATA", "DATA"]);
        match (&pkt.chunks[2], &pkt.chunks[3]) {
            (Chunk::PayloadData(a), Chunk::PayloadData(b)) => {
                assert_eq!((a.tsn, b.tsn), (1, 2), "order within a class is kept")
            }
            _ => panic!("expected two DATA chunks"),
        }
    }

    #[test]
    fn test_bundle_chunks_respects_mtu() {
        // 12 header + 16 DATA header + 100 payload = 128 bytes per single-chunk packet
        let mut chunks: VecDeque<Chunk> = (0..5).map(|tsn| data_chunk(tsn, 100)).collect();

        let mut packets = vec![];
        while let Some(pkt) = bundle_chunks(header(), &mut chunks, 12 + 2 * 116) {
            assert!(pkt.length() <= 12 + 2 * 116);
            packets.push(pkt);
        }
        let counts: Vec<_> = packets.iter().map(|p| p.chunks.len()).collect();
        assert_eq!(counts, vec![2, 2, 1]);
    }

    #[test]
    fn test_bundle_oversized_chunk_goes_alone() {
        let mut chunks: VecDeque<Chunk> = VecDeque::new();
        chunks.push_back(data_chunk(1, 2000));
        chunks.push_back(Chunk::ShutdownAck(ChunkShutdownAck {}));
        chunks.push_back(data_chunk(2, 10));

        let first = bundle_chunks(header(), &mut chunks, 1228).expect("a packet");
        assert_eq!(first.chunks, vec![Chunk::ShutdownAck(ChunkShutdownAck {})]);

        let second = bundle_chunks(header(), &mut chunks, 1228).expect("a packet");
        assert_eq!(second.chunks.len(), 1);
        assert!(second.length() > 1228);

        let third = bundle_chunks(header(), &mut chunks, 1228).expect("a packet");
        assert_eq!(third.chunks.len(), 1);
        assert!(bundle_chunks(header(), &mut chunks, 1228).is_none());
    }

    #[test]
    fn test_bundle_init_travels_alone() {
        let mut chunks: VecDeque<Chunk> = VecDeque::new();
        chunks.push_back(Chunk::Init(ChunkInit {
            initiate_tag: 1,
            ..Default::default()
        }));
        chunks.push_back(Chunk::SelectiveAck(ChunkSelectiveAck::default()));

        let first = bundle_chunks(header(), &mut chunks, 1228).expect("a packet");
        assert_eq!(first.chunks.len(), 1);
        assert_eq!(chunks.len(), 1);
    }
}
