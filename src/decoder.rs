use crate::{
    frame::FrameBuffer,
    protocol::{
        decode_vendor_heart_rate, find_vendor_marker, BlockParse, CHUNK_HEADER_SIZE,
        SEQUENCE_MODULUS, SYNC_MARK, VENDOR_FRAME_SIZE, VENDOR_MARKER,
    },
    types::{Chunk, ChunkHeader, DataBlock, DecodedSample, FrameFormat},
};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use tracing::{debug, warn};

/// Lowest heart rate accepted from a vendor frame, exclusive
pub const MIN_PLAUSIBLE_BPM: u16 = 20;

/// Highest heart rate accepted from a vendor frame, exclusive
pub const MAX_PLAUSIBLE_BPM: u16 = 235;

/// Unit produced by a stream decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// Checksum-verified chunk of data blocks
    Chunk(Chunk),
    /// Heart-rate reading
    Sample(DecodedSample),
}

/// Counters describing what a decoder has seen since its last reset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DecoderStats {
    /// Chunks accepted
    pub chunks: u64,
    /// Vendor frames examined
    pub frames: u64,
    /// Chunks dropped on checksum mismatch
    pub checksum_failures: u64,
    /// Chunks dropped on an invalid block
    pub invalid_blocks: u64,
    /// Resynchronisations started
    pub resyncs: u64,
    /// Sequence discontinuities
    pub sequence_gaps: u64,
    /// Bytes thrown away while searching for a marker
    pub discarded_bytes: u64,
    /// Vendor readings rejected as implausible or malformed
    pub rejected_readings: u64,
}

/// Incremental decoder fed with raw transport bytes
///
/// Implementations keep all partial-decode progress in their own fields so a
/// unit split across any number of reads decodes the same as one delivered
/// whole.
pub trait StreamDecoder: Send {
    /// Feed newly received bytes and collect every unit they complete
    fn push(&mut self, data: &[u8], timestamp: SystemTime) -> Vec<Decoded>;

    /// Forget buffered bytes, partial units and sequence tracking
    fn reset(&mut self);

    /// Counters since the last reset
    fn stats(&self) -> DecoderStats;

    /// Human-readable decoder name
    fn name(&self) -> &'static str;
}

/// Create the decoder for a wire format
#[must_use]
pub fn decoder_for(format: FrameFormat) -> Box<dyn StreamDecoder> {
    match format {
        FrameFormat::Chunked => Box::new(ChunkDecoder::new()),
        FrameFormat::Vendor => Box::new(VendorDecoder::new()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    AwaitingHeader,
    AwaitingBlocks { count: u8, next: u8 },
    AwaitingChecksum,
    Resyncing { force: bool },
}

/// Decoder for sync-marked chunks
#[derive(Debug)]
pub struct ChunkDecoder {
    buffer: FrameBuffer,
    state: DecodeState,
    header: Option<ChunkHeader>,
    blocks: Vec<DataBlock>,
    gap_from: Option<u16>,
    last_sequence: Option<u16>,
    battery_level: Option<u8>,
    stats: DecoderStats,
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkDecoder {
    /// Create a decoder awaiting its first header
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: FrameBuffer::new(),
            state: DecodeState::AwaitingHeader,
            header: None,
            blocks: Vec::new(),
            gap_from: None,
            last_sequence: None,
            battery_level: None,
            stats: DecoderStats::default(),
        }
    }

    /// Sequence number of the last accepted chunk, `None` when unknown
    #[must_use]
    pub const fn last_sequence(&self) -> Option<u16> {
        self.last_sequence
    }

    /// Battery level from the most recent header
    #[must_use]
    pub const fn battery_level(&self) -> Option<u8> {
        self.battery_level
    }

    /// Whether the decoder is searching for a sync mark
    #[must_use]
    pub const fn is_resyncing(&self) -> bool {
        matches!(self.state, DecodeState::Resyncing { .. })
    }

    /// Bytes buffered but not yet consumed
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Feed bytes and return every chunk they complete
    pub fn push_bytes(&mut self, data: &[u8]) -> Vec<Chunk> {
        self.buffer.push(data);

        let mut chunks = Vec::new();
        while let Some(step) = self.step() {
            if let Some(chunk) = step {
                chunks.push(chunk);
            }
        }
        chunks
    }

    /// Advance the state machine by one transition
    ///
    /// Returns `None` when more data is needed, `Some(Some(chunk))` when a
    /// chunk completed.
    fn step(&mut self) -> Option<Option<Chunk>> {
        match self.state {
            DecodeState::AwaitingHeader => {
                if self.buffer.len() < CHUNK_HEADER_SIZE {
                    return None;
                }
                let Some(header) = ChunkHeader::parse(self.buffer.as_slice()) else {
                    warn!("Chunk header without sync mark, resynchronising");
                    self.begin_resync(false);
                    return Some(None);
                };
                self.accept_header(header);
                Some(None)
            }
            DecodeState::AwaitingBlocks { count, next } => {
                match DataBlock::parse(self.buffer.as_slice()) {
                    BlockParse::NeedMore => None,
                    BlockParse::Invalid(reason) => {
                        warn!("Invalid block {}/{}: {}", next + 1, count, reason);
                        self.stats.invalid_blocks += 1;
                        self.begin_resync(true);
                        Some(None)
                    }
                    BlockParse::Complete { block, len } => {
                        self.buffer.pop(len, true);
                        self.blocks.push(block);
                        self.state = if next + 1 >= count {
                            DecodeState::AwaitingChecksum
                        } else {
                            DecodeState::AwaitingBlocks {
                                count,
                                next: next + 1,
                            }
                        };
                        Some(None)
                    }
                }
            }
            DecodeState::AwaitingChecksum => {
                if self.buffer.is_empty() {
                    return None;
                }
                let expected = self.buffer.checksum();
                let received = self.buffer.pop(1, false)[0];
                if received != expected {
                    warn!(
                        "Checksum mismatch: expected {:02X}, received {:02X}",
                        expected, received
                    );
                    self.stats.checksum_failures += 1;
                    self.last_sequence = None;
                    self.begin_resync(true);
                    return Some(None);
                }
                Some(self.commit())
            }
            DecodeState::Resyncing { force } => {
                if force && self.buffer.len() < SYNC_MARK.len() {
                    return None;
                }
                // the failed chunk's own mark left with its header, so a mark at
                // the front belongs to the next chunk
                let skip = force && !self.buffer.as_slice().starts_with(&SYNC_MARK);
                let (found, discarded) = self.buffer.find_sync_mark(skip);
                self.stats.discarded_bytes += discarded as u64;
                if found {
                    self.state = DecodeState::AwaitingHeader;
                    Some(None)
                } else {
                    // the bogus mark is gone now; later data is scanned as is
                    self.state = DecodeState::Resyncing { force: false };
                    None
                }
            }
        }
    }

    fn accept_header(&mut self, header: ChunkHeader) {
        self.buffer.pop(CHUNK_HEADER_SIZE, false);
        self.buffer.reset_checksum();

        if let Some(previous) = self.last_sequence {
            let expected = (previous + 1) % SEQUENCE_MODULUS;
            if header.sequence != expected {
                warn!(
                    "Sequence gap: expected {}, received {}",
                    expected, header.sequence
                );
                self.stats.sequence_gaps += 1;
                self.gap_from = Some(expected);
            }
        }

        debug!(
            "Chunk header: sequence {}, battery {}%, {} block(s)",
            header.sequence, header.battery_level, header.block_count
        );
        self.battery_level = Some(header.battery_level);
        self.header = Some(header);
        self.blocks.clear();
        self.state = if header.block_count == 0 {
            DecodeState::AwaitingChecksum
        } else {
            DecodeState::AwaitingBlocks {
                count: header.block_count,
                next: 0,
            }
        };
    }

    fn commit(&mut self) -> Option<Chunk> {
        self.state = DecodeState::AwaitingHeader;
        let header = self.header.take()?;
        self.last_sequence = Some(header.sequence);
        self.stats.chunks += 1;
        Some(Chunk {
            header,
            blocks: std::mem::take(&mut self.blocks),
            gap_from: self.gap_from.take(),
        })
    }

    fn begin_resync(&mut self, force: bool) {
        self.header = None;
        self.blocks.clear();
        self.gap_from = None;
        self.stats.resyncs += 1;
        self.state = DecodeState::Resyncing { force };
    }
}

impl StreamDecoder for ChunkDecoder {
    fn push(&mut self, data: &[u8], _timestamp: SystemTime) -> Vec<Decoded> {
        self.push_bytes(data).into_iter().map(Decoded::Chunk).collect()
    }

    fn reset(&mut self) {
        *self = Self::new();
    }

    fn stats(&self) -> DecoderStats {
        self.stats
    }

    fn name(&self) -> &'static str {
        "chunked"
    }
}

/// Decoder for fixed-size `FRWD` frames
#[derive(Debug)]
pub struct VendorDecoder {
    buffer: FrameBuffer,
    heart_rate: Option<u16>,
    stats: DecoderStats,
}

impl Default for VendorDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl VendorDecoder {
    /// Create an empty decoder
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: FrameBuffer::new(),
            heart_rate: None,
            stats: DecoderStats::default(),
        }
    }

    /// Last plausible heart rate decoded
    #[must_use]
    pub const fn heart_rate(&self) -> Option<u16> {
        self.heart_rate
    }

    /// Feed bytes and return every plausible heart rate they complete
    pub fn push_bytes(&mut self, data: &[u8]) -> Vec<u16> {
        self.buffer.push(data);

        let mut readings = Vec::new();
        loop {
            let Some(pos) = find_vendor_marker(self.buffer.as_slice()) else {
                // keep a tail that may hold the start of a split marker
                let keep = (VENDOR_MARKER.len() - 1).min(self.buffer.len());
                let drop_count = self.buffer.len() - keep;
                self.buffer.discard(drop_count);
                self.stats.discarded_bytes += drop_count as u64;
                break;
            };
            self.buffer.discard(pos);
            self.stats.discarded_bytes += pos as u64;

            if self.buffer.len() < VENDOR_FRAME_SIZE {
                break;
            }
            let frame = self.buffer.pop(VENDOR_FRAME_SIZE, false);
            self.stats.frames += 1;

            match decode_vendor_heart_rate(&frame) {
                Some(bpm) if bpm > MIN_PLAUSIBLE_BPM && bpm < MAX_PLAUSIBLE_BPM => {
                    self.heart_rate = Some(bpm);
                    readings.push(bpm);
                }
                Some(bpm) => {
                    debug!("Ignoring implausible heart rate {}", bpm);
                    self.stats.rejected_readings += 1;
                }
                None => {
                    debug!("Ignoring vendor frame with malformed heart rate digits");
                    self.stats.rejected_readings += 1;
                }
            }
        }
        readings
    }
}

impl StreamDecoder for VendorDecoder {
    fn push(&mut self, data: &[u8], timestamp: SystemTime) -> Vec<Decoded> {
        self.push_bytes(data)
            .into_iter()
            .map(|bpm| Decoded::Sample(DecodedSample::new(i32::from(bpm), timestamp)))
            .collect()
    }

    fn reset(&mut self) {
        *self = Self::new();
    }

    fn stats(&self) -> DecoderStats {
        self.stats
    }

    fn name(&self) -> &'static str {
        "vendor"
    }
}
