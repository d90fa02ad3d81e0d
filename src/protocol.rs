use crate::types::{AccelerometerAxes, ChunkHeader, DataBlock, SampleRate};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Marker starting every chunk
///
/// A chunk is a 6-byte header, `block_count` self-describing data blocks and
/// one checksum byte holding the 8-bit sum of every block byte. Multi-byte
/// integers are big-endian.
pub const SYNC_MARK: [u8; 2] = [0x00, 0xFE];

/// Chunk header size in bytes, sync mark included
pub const CHUNK_HEADER_SIZE: usize = 6;

/// Block header size: packet ID, 2-byte length, format byte, reserved byte
pub const BLOCK_HEADER_SIZE: usize = 5;

/// Trailing checksum size in bytes
pub const CHECKSUM_SIZE: usize = 1;

/// Sequence numbers are 12 bits wide
pub const SEQUENCE_MODULUS: u16 = 4096;

/// Event flag inside the sequence high byte
const EVENT_FLAG: u8 = 0x10;

/// Sequence bits carried by the sequence high byte
const SEQUENCE_HIGH_MASK: u8 = 0x0F;

/// Packet IDs tagging data blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketId {
    /// ECG voltage block
    Ecg = 0xAA,
    /// Two-axis accelerometer block
    Accelerometer2 = 0x55,
    /// Three-axis accelerometer block
    Accelerometer3 = 0x56,
}

impl PacketId {
    /// Convert from u8
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0xAA => Some(Self::Ecg),
            0x55 => Some(Self::Accelerometer2),
            0x56 => Some(Self::Accelerometer3),
            _ => None,
        }
    }
}

/// Accelerometer blocks only define this format byte
pub const ACCELEROMETER_FORMAT: u8 = 0x00;

/// Result of examining the front of a buffer for one data block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockParse {
    /// Block is complete and occupies `len` bytes
    Complete {
        /// Decoded block
        block: DataBlock,
        /// Bytes the block occupies on the wire
        len: usize,
    },
    /// More bytes are needed before the block can be judged
    NeedMore,
    /// Block cannot be valid
    Invalid(String),
}

impl ChunkHeader {
    /// Parse a header from the first [`CHUNK_HEADER_SIZE`] bytes of `data`
    ///
    /// Returns `None` when fewer bytes are available or the sync mark is
    /// missing.
    ///
    /// Layout:
    /// - Bytes 0-1: sync mark `0x00 0xFE`
    /// - Byte 2: battery level doubled
    /// - Byte 3: bit 4 event flag, bits 0-3 sequence bits 8-11
    /// - Byte 4: sequence bits 0-7
    /// - Byte 5: block count
    #[must_use]
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < CHUNK_HEADER_SIZE || data[..2] != SYNC_MARK {
            return None;
        }

        let mut buf = &data[2..CHUNK_HEADER_SIZE];
        let battery_raw = buf.get_u8();
        let sequence_high = buf.get_u8();
        let sequence_low = buf.get_u8();
        let block_count = buf.get_u8();

        Some(Self {
            battery_level: battery_raw / 2,
            sequence: (u16::from(sequence_high & SEQUENCE_HIGH_MASK) << 8) | u16::from(sequence_low),
            event: sequence_high & EVENT_FLAG != 0,
            block_count,
        })
    }

    /// Serialize the header
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CHUNK_HEADER_SIZE);
        buf.put_slice(&SYNC_MARK);
        buf.put_u8(self.battery_level.min(100) * 2);

        let sequence = self.sequence % SEQUENCE_MODULUS;
        let mut high = (sequence >> 8) as u8 & SEQUENCE_HIGH_MASK;
        if self.event {
            high |= EVENT_FLAG;
        }
        buf.put_u8(high);
        buf.put_u8((sequence & 0xFF) as u8);
        buf.put_u8(self.block_count);
        buf.freeze()
    }

    /// Sequence number expected after this one
    #[must_use]
    pub const fn next_sequence(&self) -> u16 {
        (self.sequence + 1) % SEQUENCE_MODULUS
    }
}

impl DataBlock {
    /// Examine the front of `data` for one block
    ///
    /// Nothing is consumed; on [`BlockParse::Complete`] the caller pops `len`
    /// bytes.
    #[must_use]
    pub fn parse(data: &[u8]) -> BlockParse {
        if data.len() < BLOCK_HEADER_SIZE {
            return BlockParse::NeedMore;
        }

        let mut buf = data;
        let id = buf.get_u8();
        let len = usize::from(buf.get_u16());
        let format = buf.get_u8();
        let _reserved = buf.get_u8();

        let Some(packet_id) = PacketId::from_u8(id) else {
            return BlockParse::Invalid(format!("Unknown packet ID: {id:02X}"));
        };

        if len < BLOCK_HEADER_SIZE {
            return BlockParse::Invalid(format!("Block length {len} shorter than its header"));
        }

        let block = match packet_id {
            PacketId::Ecg => {
                let Some(sample_rate) = SampleRate::from_code(format) else {
                    return BlockParse::Invalid(format!("Unknown ECG sample rate code: {format:02X}"));
                };
                if data.len() < len {
                    return BlockParse::NeedMore;
                }
                Self::Ecg {
                    sample_rate,
                    voltages: Bytes::copy_from_slice(&data[BLOCK_HEADER_SIZE..len]),
                }
            }
            PacketId::Accelerometer2 | PacketId::Accelerometer3 => {
                if format != ACCELEROMETER_FORMAT {
                    return BlockParse::Invalid(format!(
                        "Unknown accelerometer format: {format:02X}"
                    ));
                }
                if data.len() < len {
                    return BlockParse::NeedMore;
                }
                let axes = if packet_id == PacketId::Accelerometer2 {
                    AccelerometerAxes::Two
                } else {
                    AccelerometerAxes::Three
                };
                Self::Accelerometer {
                    axes,
                    raw: Bytes::copy_from_slice(&data[BLOCK_HEADER_SIZE..len]),
                }
            }
        };

        BlockParse::Complete { block, len }
    }

    /// Serialize the block, header included
    ///
    /// # Panics
    ///
    /// Panics if the payload does not fit the 16-bit length field.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let (id, format, payload) = match self {
            Self::Ecg {
                sample_rate,
                voltages,
            } => (PacketId::Ecg, sample_rate.code(), voltages),
            Self::Accelerometer { axes, raw } => {
                let id = match axes {
                    AccelerometerAxes::Two => PacketId::Accelerometer2,
                    AccelerometerAxes::Three => PacketId::Accelerometer3,
                };
                (id, ACCELEROMETER_FORMAT, raw)
            }
        };

        let len = u16::try_from(BLOCK_HEADER_SIZE + payload.len())
            .expect("block payload exceeds 16-bit length field");

        let mut buf = BytesMut::with_capacity(usize::from(len));
        buf.put_u8(id as u8);
        buf.put_u16(len);
        buf.put_u8(format);
        buf.put_u8(0);
        buf.put_slice(payload);
        buf.freeze()
    }
}

/// 8-bit truncated sum of `data`
#[must_use]
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// Encode a complete chunk: header, blocks and checksum
///
/// `header.block_count` is overwritten with the number of blocks given.
///
/// # Panics
///
/// Panics if more than 255 blocks are given.
#[must_use]
pub fn encode_chunk(header: ChunkHeader, blocks: &[DataBlock]) -> Bytes {
    let header = ChunkHeader {
        block_count: u8::try_from(blocks.len()).expect("too many blocks for one chunk"),
        ..header
    };

    let mut body = BytesMut::new();
    for block in blocks {
        body.put(block.to_bytes());
    }

    let mut buf = BytesMut::with_capacity(CHUNK_HEADER_SIZE + body.len() + CHECKSUM_SIZE);
    buf.put(header.to_bytes());
    let sum = checksum(&body);
    buf.put(body);
    buf.put_u8(sum);
    buf.freeze()
}

/// Marker starting every vendor frame
///
/// Vendor frames are 93 bytes long and carry the heart rate as decimal
/// digits whose byte values are doubled.
pub const VENDOR_MARKER: &[u8; 4] = b"FRWD";

/// Vendor frame size in bytes, marker included
pub const VENDOR_FRAME_SIZE: usize = 93;

/// Offset of the doubled hundreds digit of the heart rate
pub const VENDOR_HR_HIGH: std::ops::Range<usize> = 85..86;

/// Offset of the doubled tens and units digits of the heart rate
pub const VENDOR_HR_LOW: std::ops::Range<usize> = 87..89;

/// Doubled ASCII space, used for padding
const VENDOR_FILL: u8 = b' ' * 2;

/// Position of the vendor marker in `data`
#[must_use]
pub fn find_vendor_marker(data: &[u8]) -> Option<usize> {
    data.windows(VENDOR_MARKER.len())
        .position(|window| window == VENDOR_MARKER)
}

/// Decode the heart rate from a vendor frame starting at `frame[0]`
///
/// Each digit byte is halved back to ASCII before parsing. Returns `None` if
/// the frame is short or the digits are not decimal.
#[must_use]
pub fn decode_vendor_heart_rate(frame: &[u8]) -> Option<u16> {
    if frame.len() < VENDOR_FRAME_SIZE || !frame.starts_with(VENDOR_MARKER) {
        return None;
    }

    let digits: String = frame[VENDOR_HR_HIGH]
        .iter()
        .chain(&frame[VENDOR_HR_LOW])
        .map(|b| char::from(b / 2))
        .collect();

    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Encode a vendor frame carrying `heart_rate` (0-999)
#[must_use]
pub fn encode_vendor_frame(heart_rate: u16) -> Bytes {
    let digits = format!("{:03}", heart_rate % 1000);
    let doubled: Vec<u8> = digits.bytes().map(|b| b * 2).collect();

    let mut frame = vec![VENDOR_FILL; VENDOR_FRAME_SIZE];
    frame[..VENDOR_MARKER.len()].copy_from_slice(VENDOR_MARKER);
    frame[VENDOR_HR_HIGH].copy_from_slice(&doubled[..1]);
    frame[VENDOR_HR_LOW].copy_from_slice(&doubled[1..]);
    Bytes::from(frame)
}
