use crate::protocol::SYNC_MARK;
use bytes::{Buf, Bytes, BytesMut};
use tracing::debug;

/// FIFO accumulator for bytes not yet consumed by a decoder
///
/// Bytes are appended as the transport delivers them and removed strictly from
/// the front once a complete unit has been identified. Popped bytes can be
/// folded into a running 8-bit checksum.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
    checksum: u8,
}

impl FrameBuffer {
    /// Create an empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(1024),
            checksum: 0,
        }
    }

    /// Append newly received bytes
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Remove `count` bytes from the front
    ///
    /// With `accumulate` set, the popped bytes are added into the running
    /// checksum. Pops at most the buffered amount.
    pub fn pop(&mut self, count: usize, accumulate: bool) -> Bytes {
        let count = count.min(self.buf.len());
        let popped = self.buf.split_to(count).freeze();
        if accumulate {
            self.checksum = popped
                .iter()
                .fold(self.checksum, |sum, b| sum.wrapping_add(*b));
        }
        popped
    }

    /// Discard `count` bytes from the front without checksumming them
    pub fn discard(&mut self, count: usize) {
        let count = count.min(self.buf.len());
        self.buf.advance(count);
    }

    /// Unconsumed bytes
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Number of unconsumed bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether no bytes are buffered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Running checksum of accumulated pops
    #[must_use]
    pub const fn checksum(&self) -> u8 {
        self.checksum
    }

    /// Restart the running checksum
    pub fn reset_checksum(&mut self) {
        self.checksum = 0;
    }

    /// Drop all buffered bytes and the running checksum
    pub fn clear(&mut self) {
        self.buf.clear();
        self.checksum = 0;
    }

    /// Search for the chunk sync mark and discard everything before it
    ///
    /// With `force_skip` the first two bytes are discarded before scanning, so
    /// a sync mark that was just proven bogus is not found again. When no mark
    /// exists the buffer is emptied, except for a trailing `0x00` that may
    /// be the first half of a mark split across reads.
    ///
    /// Returns whether the buffer now starts with a sync mark, and how many
    /// bytes were discarded.
    pub fn find_sync_mark(&mut self, force_skip: bool) -> (bool, usize) {
        let mut discarded = 0;

        if force_skip {
            let skip = SYNC_MARK.len().min(self.buf.len());
            self.discard(skip);
            discarded += skip;
        }

        if let Some(pos) = self.buf.windows(SYNC_MARK.len()).position(|w| w == SYNC_MARK) {
            self.discard(pos);
            discarded += pos;
            if discarded > 0 {
                debug!("Sync mark found after discarding {} byte(s)", discarded);
            }
            return (true, discarded);
        }

        let keep = usize::from(self.buf.last() == Some(&SYNC_MARK[0]));
        let drop_count = self.buf.len() - keep;
        self.discard(drop_count);
        discarded += drop_count;

        (false, discarded)
    }
}
