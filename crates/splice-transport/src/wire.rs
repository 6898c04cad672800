//! # Splice Wire Format
//!
//! Fixed-size datagrams with a 7-byte common header. Every control packet is
//! padded to [`MSG_PACKET_LEN`]; every data packet is exactly
//! [`DATA_PACKET_LEN`]. Multi-byte fields are big-endian.
//!
//! ## Common header
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |      src      |      dst      |     type      |   seq (32)    ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ...             seq             |  payload (zero padded) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! ## Splice update
//!
//! Same leading fields; the `seq` slot carries the switchover sequence and
//! the first four payload bytes carry the ratio vector.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::io;
use thiserror::Error;

// ─── Constants ───────────────────────────────────────────────────────────────

/// `src` + `dst` + `type` + `seq`.
pub const HEADER_LEN: usize = 7;

/// Fixed length of every non-data packet.
pub const MSG_PACKET_LEN: usize = 128;

/// Payload bytes carried by one data packet.
pub const DATA_LEN: usize = 1024;

/// Fixed length of a data packet.
pub const DATA_PACKET_LEN: usize = HEADER_LEN + DATA_LEN;

/// Node id used by the client.
pub const CLIENT_ID: u8 = 8;

/// The protocol is wired for exactly four sources (ids 0..=3).
pub const SOURCE_COUNT: usize = 4;

/// Longest filename a request may carry.
pub const MAX_FILENAME_LEN: usize = 50;

/// Requesting this name asks the servers for the synthetic test stream.
pub const TEST_FILENAME: &str = "/dev/urandom";

/// True if `id` names one of the four sources.
#[inline]
pub fn is_source_id(id: u8) -> bool {
    (id as usize) < SOURCE_COUNT
}

// ─── Packet Type ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Client asks for a file, payload is the filename.
    Request = 1,
    /// File available, data follows.
    RequestAck = 2,
    /// File not available on this source.
    RequestNak = 3,
    /// Streamed data.
    Data = 4,
    /// Retransmission request for the sequence in the header.
    Nak = 5,
    /// Normal end of stream.
    Fin = 6,
    /// Peer aborts the session.
    Fail = 7,
    /// New splice ratios with their switchover sequence.
    SpliceUpdate = 8,
    /// Source acknowledges a splice update.
    SpliceAck = 9,
    /// Requested per-source transmit rate.
    RateChange = 10,
}

impl PacketType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(PacketType::Request),
            2 => Some(PacketType::RequestAck),
            3 => Some(PacketType::RequestNak),
            4 => Some(PacketType::Data),
            5 => Some(PacketType::Nak),
            6 => Some(PacketType::Fin),
            7 => Some(PacketType::Fail),
            8 => Some(PacketType::SpliceUpdate),
            9 => Some(PacketType::SpliceAck),
            10 => Some(PacketType::RateChange),
            _ => None,
        }
    }

    /// Exact on-wire size of a packet of this type.
    #[inline]
    pub fn wire_len(self) -> usize {
        match self {
            PacketType::Data => DATA_PACKET_LEN,
            _ => MSG_PACKET_LEN,
        }
    }

    /// Payload room after the header.
    #[inline]
    pub fn payload_capacity(self) -> usize {
        self.wire_len() - HEADER_LEN
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketType::Request => "REQ",
            PacketType::RequestAck => "REQACK",
            PacketType::RequestNak => "REQNAK",
            PacketType::Data => "DATA",
            PacketType::Nak => "NAK",
            PacketType::Fin => "FIN",
            PacketType::Fail => "FAIL",
            PacketType::SpliceUpdate => "SPLICE",
            PacketType::SpliceAck => "SPLICE_ACK",
            PacketType::RateChange => "RATE",
        };
        f.write_str(name)
    }
}

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Packet construction and body parsing failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("{len}-byte payload does not fit a {packet_type} packet ({capacity} bytes)")]
    PayloadTooLarge {
        packet_type: PacketType,
        len: usize,
        capacity: usize,
    },
    #[error("filename of {0} bytes is too long")]
    FilenameTooLong(usize),
    #[error("request carries an empty or non-UTF-8 filename")]
    InvalidFilename,
    #[error("{0} body is truncated")]
    Truncated(PacketType),
    #[error("datagram too short for a header or has an unknown type tag")]
    Malformed,
}

// ─── Packet Header ──────────────────────────────────────────────────────────

/// Decoded common header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub src: u8,
    pub dst: u8,
    pub packet_type: PacketType,
    pub seq: u32,
}

impl PacketHeader {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.src);
        buf.put_u8(self.dst);
        buf.put_u8(self.packet_type as u8);
        buf.put_u32(self.seq);
    }

    /// Returns `None` on a short buffer or an unknown type tag.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < HEADER_LEN {
            return None;
        }
        let src = buf.get_u8();
        let dst = buf.get_u8();
        let packet_type = PacketType::from_byte(buf.get_u8())?;
        let seq = buf.get_u32();
        Some(PacketHeader {
            src,
            dst,
            packet_type,
            seq,
        })
    }
}

/// Build a fixed-size packet. The payload is copied after the header and the
/// rest of the packet is zero filled.
pub fn encode(
    src: u8,
    dst: u8,
    packet_type: PacketType,
    seq: u32,
    payload: &[u8],
) -> Result<Bytes, WireError> {
    let capacity = packet_type.payload_capacity();
    if payload.len() > capacity {
        return Err(WireError::PayloadTooLarge {
            packet_type,
            len: payload.len(),
            capacity,
        });
    }
    let mut buf = BytesMut::with_capacity(packet_type.wire_len());
    PacketHeader {
        src,
        dst,
        packet_type,
        seq,
    }
    .encode(&mut buf);
    buf.put_slice(payload);
    buf.resize(packet_type.wire_len(), 0);
    Ok(buf.freeze())
}

/// Split a datagram into its header and the payload area. Performs no size
/// or destination checks; see [`validate`].
pub fn decode(buf: &[u8]) -> Option<(PacketHeader, &[u8])> {
    let mut cursor = buf;
    let header = PacketHeader::decode(&mut cursor)?;
    Some((header, cursor))
}

// ─── Receive Classification ─────────────────────────────────────────────────

/// Outcome of checking one received datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxStatus {
    Ok,
    /// The bounded read elapsed without a datagram.
    Timeout,
    /// The socket reported an error.
    Error,
    /// Size does not match the fixed length of the declared type.
    CorruptedSize,
    /// Well formed, but addressed to another node.
    WrongDestination,
    /// The peer sent FAIL.
    PeerTerminated,
}

impl RxStatus {
    /// Failures the caller retries, counting them against its error budget.
    pub fn is_transient(self) -> bool {
        !matches!(self, RxStatus::Ok | RxStatus::PeerTerminated)
    }
}

/// Check a received datagram against the fixed-size rules.
pub fn validate(buf: &[u8], expected_dst: u8) -> RxStatus {
    let Some((header, _)) = decode(buf) else {
        return RxStatus::CorruptedSize;
    };
    if buf.len() != header.packet_type.wire_len() {
        return RxStatus::CorruptedSize;
    }
    // Destination wins: a FAIL meant for another node does not end our session.
    if header.dst != expected_dst {
        return RxStatus::WrongDestination;
    }
    if header.packet_type == PacketType::Fail {
        return RxStatus::PeerTerminated;
    }
    RxStatus::Ok
}

/// Classify the result of a socket read, then the datagram it produced.
pub fn classify_recv(result: &io::Result<usize>, buf: &[u8], expected_dst: u8) -> RxStatus {
    match result {
        Ok(len) => validate(&buf[..(*len).min(buf.len())], expected_dst),
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
            RxStatus::Timeout
        }
        Err(_) => RxStatus::Error,
    }
}

// ─── Message Bodies ─────────────────────────────────────────────────────────

/// Ratio change, applied by every source once its sequence counter reaches
/// `sseq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpliceUpdate {
    pub sseq: u32,
    pub ratios: [u8; SOURCE_COUNT],
}

/// Stream description returned with a REQUEST_ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamInfo {
    /// Stream length in bytes.
    pub total_len: u64,
    /// Number of data sequences (1..=total_packets).
    pub total_packets: u32,
}

impl StreamInfo {
    pub const ENCODED_LEN: usize = 12;

    pub fn for_len(total_len: u64) -> Self {
        let total_packets = total_len.div_ceil(DATA_LEN as u64);
        Self {
            total_len,
            total_packets: total_packets.min(u32::MAX as u64) as u32,
        }
    }
}

/// A typed packet body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request { filename: String },
    RequestAck(StreamInfo),
    RequestNak,
    Data { seq: u32, payload: Bytes },
    Nak { seq: u32 },
    Fin,
    Fail,
    SpliceUpdate(SpliceUpdate),
    /// Echoes the switchover sequence being acknowledged.
    SpliceAck { sseq: u32 },
    RateChange { rate_kbps: u32 },
}

impl Message {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Message::Request { .. } => PacketType::Request,
            Message::RequestAck(_) => PacketType::RequestAck,
            Message::RequestNak => PacketType::RequestNak,
            Message::Data { .. } => PacketType::Data,
            Message::Nak { .. } => PacketType::Nak,
            Message::Fin => PacketType::Fin,
            Message::Fail => PacketType::Fail,
            Message::SpliceUpdate(_) => PacketType::SpliceUpdate,
            Message::SpliceAck { .. } => PacketType::SpliceAck,
            Message::RateChange { .. } => PacketType::RateChange,
        }
    }

    /// Serialize into a fixed-size datagram from `src` to `dst`.
    pub fn encode(&self, src: u8, dst: u8) -> Result<Bytes, WireError> {
        let ty = self.packet_type();
        match self {
            Message::Request { filename } => {
                if filename.len() > MAX_FILENAME_LEN {
                    return Err(WireError::FilenameTooLong(filename.len()));
                }
                if filename.is_empty() {
                    return Err(WireError::InvalidFilename);
                }
                encode(src, dst, ty, 0, filename.as_bytes())
            }
            Message::RequestAck(info) => {
                let mut body = [0u8; StreamInfo::ENCODED_LEN];
                let mut cursor = &mut body[..];
                cursor.put_u64(info.total_len);
                cursor.put_u32(info.total_packets);
                encode(src, dst, ty, 0, &body)
            }
            Message::Data { seq, payload } => encode(src, dst, ty, *seq, payload),
            Message::Nak { seq } => encode(src, dst, ty, *seq, &[]),
            Message::SpliceUpdate(update) => encode(src, dst, ty, update.sseq, &update.ratios),
            Message::SpliceAck { sseq } => encode(src, dst, ty, *sseq, &[]),
            Message::RateChange { rate_kbps } => {
                encode(src, dst, ty, 0, &rate_kbps.to_be_bytes())
            }
            Message::RequestNak | Message::Fin | Message::Fail => encode(src, dst, ty, 0, &[]),
        }
    }

    /// Interpret the payload area according to the header's type.
    pub fn decode(header: &PacketHeader, mut payload: &[u8]) -> Result<Self, WireError> {
        let ty = header.packet_type;
        let msg = match ty {
            PacketType::Request => {
                let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
                if end > MAX_FILENAME_LEN {
                    return Err(WireError::FilenameTooLong(end));
                }
                let filename = std::str::from_utf8(&payload[..end])
                    .map_err(|_| WireError::InvalidFilename)?;
                if filename.is_empty() {
                    return Err(WireError::InvalidFilename);
                }
                Message::Request {
                    filename: filename.to_string(),
                }
            }
            PacketType::RequestAck => {
                if payload.remaining() < StreamInfo::ENCODED_LEN {
                    return Err(WireError::Truncated(ty));
                }
                Message::RequestAck(StreamInfo {
                    total_len: payload.get_u64(),
                    total_packets: payload.get_u32(),
                })
            }
            PacketType::RequestNak => Message::RequestNak,
            PacketType::Data => {
                if payload.len() < DATA_LEN {
                    return Err(WireError::Truncated(ty));
                }
                Message::Data {
                    seq: header.seq,
                    payload: Bytes::copy_from_slice(&payload[..DATA_LEN]),
                }
            }
            PacketType::Nak => Message::Nak { seq: header.seq },
            PacketType::Fin => Message::Fin,
            PacketType::Fail => Message::Fail,
            PacketType::SpliceUpdate => {
                if payload.remaining() < SOURCE_COUNT {
                    return Err(WireError::Truncated(ty));
                }
                let mut ratios = [0u8; SOURCE_COUNT];
                payload.copy_to_slice(&mut ratios);
                Message::SpliceUpdate(SpliceUpdate {
                    sseq: header.seq,
                    ratios,
                })
            }
            PacketType::SpliceAck => Message::SpliceAck { sseq: header.seq },
            PacketType::RateChange => {
                if payload.remaining() < 4 {
                    return Err(WireError::Truncated(ty));
                }
                Message::RateChange {
                    rate_kbps: payload.get_u32(),
                }
            }
        };
        Ok(msg)
    }
}

/// Decode header and typed body of a datagram that already passed
/// [`validate`].
pub fn parse(buf: &[u8]) -> Result<(PacketHeader, Message), WireError> {
    let (header, payload) = decode(buf).ok_or(WireError::Malformed)?;
    let msg = Message::decode(&header, payload)?;
    Ok((header, msg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_big_endian() {
        let pkt = encode(2, CLIENT_ID, PacketType::Nak, 0x0102_0304, &[]).unwrap();
        assert_eq!(&pkt[..HEADER_LEN], &[2, 8, 5, 1, 2, 3, 4]);
        assert_eq!(pkt.len(), MSG_PACKET_LEN);
        assert!(pkt[HEADER_LEN..].iter().all(|&b| b == 0));
    }

    #[test]
    fn data_packet_is_full_size() {
        let pkt = encode(0, CLIENT_ID, PacketType::Data, 9, b"abc").unwrap();
        assert_eq!(pkt.len(), DATA_PACKET_LEN);
        let (hdr, payload) = decode(&pkt).unwrap();
        assert_eq!(hdr.seq, 9);
        assert_eq!(&payload[..3], b"abc");
        assert_eq!(payload.len(), DATA_LEN);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let payload = vec![1u8; MSG_PACKET_LEN - HEADER_LEN + 1];
        let err = encode(CLIENT_ID, 0, PacketType::Request, 0, &payload).unwrap_err();
        assert_eq!(
            err,
            WireError::PayloadTooLarge {
                packet_type: PacketType::Request,
                len: MSG_PACKET_LEN - HEADER_LEN + 1,
                capacity: MSG_PACKET_LEN - HEADER_LEN,
            }
        );

        let exact = vec![1u8; DATA_LEN];
        assert!(encode(0, CLIENT_ID, PacketType::Data, 1, &exact).is_ok());
        let over = vec![1u8; DATA_LEN + 1];
        assert!(encode(0, CLIENT_ID, PacketType::Data, 1, &over).is_err());
    }

    #[test]
    fn decode_rejects_short_and_unknown() {
        assert!(decode(&[0, 8, 4, 0, 0, 0]).is_none());
        assert!(decode(&[0, 8, 42, 0, 0, 0, 1]).is_none());
    }

    #[test]
    fn validate_size_rules() {
        let data = encode(1, CLIENT_ID, PacketType::Data, 5, &[]).unwrap();
        assert_eq!(validate(&data, CLIENT_ID), RxStatus::Ok);

        // Data type in a control-sized datagram.
        let mut short = data[..MSG_PACKET_LEN].to_vec();
        assert_eq!(validate(&short, CLIENT_ID), RxStatus::CorruptedSize);

        // Control type in a data-sized datagram.
        short[2] = PacketType::Fin as u8;
        let mut long = short.clone();
        long.resize(DATA_PACKET_LEN, 0);
        assert_eq!(validate(&long, CLIENT_ID), RxStatus::CorruptedSize);
        assert_eq!(validate(&short, CLIENT_ID), RxStatus::Ok);

        assert_eq!(validate(&[], CLIENT_ID), RxStatus::CorruptedSize);
    }

    #[test]
    fn validate_destination_and_fail() {
        let fin = Message::Fin.encode(CLIENT_ID, 2).unwrap();
        assert_eq!(validate(&fin, 2), RxStatus::Ok);
        assert_eq!(validate(&fin, 3), RxStatus::WrongDestination);

        let fail = Message::Fail.encode(1, CLIENT_ID).unwrap();
        assert_eq!(validate(&fail, CLIENT_ID), RxStatus::PeerTerminated);
        assert!(!RxStatus::PeerTerminated.is_transient());
        assert!(RxStatus::WrongDestination.is_transient());
    }

    #[test]
    fn misaddressed_fail_is_wrong_destination() {
        let fail = Message::Fail.encode(1, 2).unwrap();
        assert_eq!(validate(&fail, CLIENT_ID), RxStatus::WrongDestination);
        assert_eq!(validate(&fail, 2), RxStatus::PeerTerminated);
    }

    #[test]
    fn classify_socket_errors() {
        let timeout: io::Result<usize> = Err(io::Error::from(io::ErrorKind::WouldBlock));
        assert_eq!(classify_recv(&timeout, &[], CLIENT_ID), RxStatus::Timeout);
        let timed_out: io::Result<usize> = Err(io::Error::from(io::ErrorKind::TimedOut));
        assert_eq!(classify_recv(&timed_out, &[], CLIENT_ID), RxStatus::Timeout);
        let refused: io::Result<usize> = Err(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert_eq!(classify_recv(&refused, &[], CLIENT_ID), RxStatus::Error);

        let mut buf = vec![0u8; DATA_PACKET_LEN];
        let fin = Message::Fin.encode(0, CLIENT_ID).unwrap();
        buf[..fin.len()].copy_from_slice(&fin);
        assert_eq!(classify_recv(&Ok(fin.len()), &buf, CLIENT_ID), RxStatus::Ok);
    }

    #[test]
    fn request_filename_limits() {
        let long = "x".repeat(MAX_FILENAME_LEN + 1);
        assert_eq!(
            Message::Request { filename: long }.encode(CLIENT_ID, 0),
            Err(WireError::FilenameTooLong(MAX_FILENAME_LEN + 1))
        );

        let pkt = Message::Request {
            filename: "pic.bmp".into(),
        }
        .encode(CLIENT_ID, 3)
        .unwrap();
        let (hdr, msg) = parse(&pkt).unwrap();
        assert_eq!(hdr.dst, 3);
        assert_eq!(
            msg,
            Message::Request {
                filename: "pic.bmp".into()
            }
        );
    }

    #[test]
    fn splice_update_layout() {
        let update = SpliceUpdate {
            sseq: 1200,
            ratios: [40, 30, 20, 10],
        };
        let pkt = Message::SpliceUpdate(update).encode(CLIENT_ID, 1).unwrap();
        assert_eq!(&pkt[3..7], &1200u32.to_be_bytes());
        assert_eq!(&pkt[7..11], &[40, 30, 20, 10]);
        let (_, msg) = parse(&pkt).unwrap();
        assert_eq!(msg, Message::SpliceUpdate(update));
    }

    #[test]
    fn request_ack_carries_stream_info() {
        let info = StreamInfo::for_len(3 * DATA_LEN as u64 + 1);
        assert_eq!(info.total_packets, 4);
        let pkt = Message::RequestAck(info).encode(2, CLIENT_ID).unwrap();
        let (hdr, msg) = parse(&pkt).unwrap();
        assert_eq!(hdr.src, 2);
        assert_eq!(msg, Message::RequestAck(info));
    }

    #[test]
    fn rate_change_and_nak_fields() {
        let pkt = Message::RateChange { rate_kbps: 15 }.encode(CLIENT_ID, 0).unwrap();
        assert_eq!(parse(&pkt).unwrap().1, Message::RateChange { rate_kbps: 15 });

        let pkt = Message::Nak { seq: 77 }.encode(CLIENT_ID, 0).unwrap();
        let (hdr, msg) = parse(&pkt).unwrap();
        assert_eq!(hdr.seq, 77);
        assert_eq!(msg, Message::Nak { seq: 77 });
    }

    #[test]
    fn truncated_data_body() {
        let hdr = PacketHeader {
            src: 0,
            dst: CLIENT_ID,
            packet_type: PacketType::Data,
            seq: 1,
        };
        assert_eq!(
            Message::decode(&hdr, &[0u8; 10]),
            Err(WireError::Truncated(PacketType::Data))
        );
    }
}
