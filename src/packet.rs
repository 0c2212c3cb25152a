//! Wire format shared by the transport engines and the network simulator.
//!
//! Every packet is self-describing: a universal header carrying its own
//! size, the transmission id, the type bit, and the payload length, followed
//! by a type-specific header (again carrying its own size) and the payload.
//! The size prefixes let the format grow new fields without breaking older
//! readers, which skip past whatever they do not understand. All integers
//! are little-endian.
//!
//! ```text
//! offset  size  field
//! 0       8     bytes_in_universal_header   (= 16)
//! 8       4     transmission_id (low 31 bits) | type (high bit)
//! 12      4     bytes_in_payload
//! 16      8     bytes_in_type_header        (= 16)
//! 24      4     index_in_transmission       | first_packet_index
//! 28      4     n_packets_in_transmission   | n_bits_in_bitmap
//! 32      N     payload                     (N ≤ 1024)
//! ```

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::{TransmissionId, MAX_PAYLOAD_SIZE};

pub(crate) const UNIVERSAL_HEADER_BYTES: u64 = 16;
pub(crate) const TYPE_HEADER_BYTES: u64 = 16;

const TYPE_BIT: u32 = 1 << 31;

/// A decoded packet, discriminated by the type bit in the universal header
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) enum Packet {
    Data(DataPacket),
    Comm(CommPacket),
}

/// Carries one ≤[`MAX_PAYLOAD_SIZE`]-byte chunk of a transmission
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct DataPacket {
    pub(crate) id: TransmissionId,
    /// Position of this chunk within the transmission
    pub(crate) index: u32,
    /// Total number of chunks in the transmission
    pub(crate) total: u32,
    pub(crate) payload: Vec<u8>,
}

/// Acknowledges a window of data packets with one bit per index
///
/// Bit `k` of the bitmap refers to packet `first_index + k`; a set bit
/// means the packet was received. Unset bits double as NACKs.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct CommPacket {
    pub(crate) id: TransmissionId,
    /// Index of the data packet described by bit 0
    pub(crate) first_index: u32,
    /// Number of meaningful bits in the bitmap
    pub(crate) bits: u32,
    pub(crate) bitmap: Vec<u8>,
}

impl CommPacket {
    /// Whether bit `k` of the acknowledgement window is set
    pub(crate) fn bit(&self, k: u32) -> bool {
        let byte = (k / 8) as usize;
        byte < self.bitmap.len() && self.bitmap[byte] & (1 << (k % 8)) != 0
    }
}

impl Packet {
    pub(crate) fn id(&self) -> TransmissionId {
        match self {
            Self::Data(d) => d.id,
            Self::Comm(c) => c.id,
        }
    }

    fn payload(&self) -> &[u8] {
        match self {
            Self::Data(d) => &d.payload,
            Self::Comm(c) => &c.bitmap,
        }
    }

    /// Number of bytes this packet occupies on the wire
    pub(crate) fn wire_size(&self) -> usize {
        (UNIVERSAL_HEADER_BYTES + TYPE_HEADER_BYTES) as usize + self.payload().len()
    }

    pub(crate) fn encode(&self, buf: &mut Vec<u8>) {
        buf.clear();
        buf.reserve(self.wire_size());
        let (type_bit, a, b) = match self {
            Self::Data(d) => (0, d.index, d.total),
            Self::Comm(c) => (TYPE_BIT, c.first_index, c.bits),
        };
        buf.put_u64_le(UNIVERSAL_HEADER_BYTES);
        buf.put_u32_le(self.id().0 | type_bit);
        buf.put_u32_le(self.payload().len() as u32);
        buf.put_u64_le(TYPE_HEADER_BYTES);
        buf.put_u32_le(a);
        buf.put_u32_le(b);
        buf.put_slice(self.payload());
    }

    /// Parses a packet, skipping unknown header extensions
    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = bytes;
        let universal = read_header_size(&mut buf, UNIVERSAL_HEADER_BYTES)?;
        if buf.remaining() < 8 {
            return Err(DecodeError::UnexpectedEnd);
        }
        let id_and_type = buf.get_u32_le();
        let payload_len = buf.get_u32_le() as usize;
        skip_extension(&mut buf, universal - UNIVERSAL_HEADER_BYTES)?;

        let type_header = read_header_size(&mut buf, TYPE_HEADER_BYTES)?;
        if buf.remaining() < 8 {
            return Err(DecodeError::UnexpectedEnd);
        }
        let a = buf.get_u32_le();
        let b = buf.get_u32_le();
        skip_extension(&mut buf, type_header - TYPE_HEADER_BYTES)?;

        if payload_len == 0 || payload_len > MAX_PAYLOAD_SIZE {
            return Err(DecodeError::IllegalPayloadLength(payload_len));
        }
        if buf.remaining() < payload_len {
            return Err(DecodeError::UnexpectedEnd);
        }
        let payload = buf[..payload_len].to_vec();

        let id = TransmissionId(id_and_type & !TYPE_BIT);
        if id_and_type & TYPE_BIT == 0 {
            // data packet
            if a >= b {
                return Err(DecodeError::IndexOutOfRange { index: a, total: b });
            }
            Ok(Self::Data(DataPacket {
                id,
                index: a,
                total: b,
                payload,
            }))
        } else {
            // comm packet
            if b as usize > payload_len * 8 {
                return Err(DecodeError::BitmapOverflow {
                    bits: b,
                    bytes: payload_len,
                });
            }
            Ok(Self::Comm(CommPacket {
                id,
                first_index: a,
                bits: b,
                bitmap: payload,
            }))
        }
    }
}

fn read_header_size(buf: &mut &[u8], minimum: u64) -> Result<u64, DecodeError> {
    if buf.remaining() < 8 {
        return Err(DecodeError::UnexpectedEnd);
    }
    let size = buf.get_u64_le();
    if size < minimum {
        return Err(DecodeError::IllegalHeaderSize(size));
    }
    Ok(size)
}

fn skip_extension(buf: &mut &[u8], extra: u64) -> Result<(), DecodeError> {
    if extra > buf.remaining() as u64 {
        return Err(DecodeError::UnexpectedEnd);
    }
    buf.advance(extra as usize);
    Ok(())
}

/// Reasons a byte sequence is not a well-formed packet
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub(crate) enum DecodeError {
    #[error("packet truncated")]
    UnexpectedEnd,
    #[error("header size {0} below the fixed prefix")]
    IllegalHeaderSize(u64),
    #[error("payload length {0} outside (0, {max}]", max = MAX_PAYLOAD_SIZE)]
    IllegalPayloadLength(usize),
    #[error("packet index {index} not below transmission total {total}")]
    IndexOutOfRange { index: u32, total: u32 },
    #[error("bitmap of {bytes} bytes cannot hold {bits} bits")]
    BitmapOverflow { bits: u32, bytes: usize },
}
