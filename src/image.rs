//! # Firmware image and transfer plan
//!
//! An [`Image`] is a sparse mapping from 32-bit flash address to byte,
//! represented internally as an ascending list of contiguous blocks (the
//! shape Intel HEX naturally produces). [`TransferPlan`] walks that list to
//! decide which addresses to write, verify, or read back, one 4-byte chunk
//! at a time.

use std::collections::BTreeMap;

/// A sparse firmware image: a set of contiguous byte runs, each identified by
/// its starting flash address.
///
/// Blocks never overlap and are kept in ascending order of their starting
/// address. The image is read-only once built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Image {
    blocks: BTreeMap<u32, Vec<u8>>,
}

impl Image {
    /// An empty image (used for read-mode sessions, which have nothing to
    /// write).
    pub fn empty() -> Self {
        Image::default()
    }

    /// Insert a contiguous run of bytes starting at `address`.
    ///
    /// If the new run is directly adjacent to (or overlaps) the end of the
    /// previous block, it is merged into it so that iteration always yields
    /// maximal contiguous runs.
    ///
    /// # Arguments
    ///
    /// * `address` - Flash address of the first byte in `bytes`
    /// * `bytes` - The bytes to insert; a no-op if empty
    pub fn insert_block(&mut self, address: u32, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }

        if let Some((&prev_start, prev_bytes)) = self.blocks.range_mut(..=address).next_back() {
            let prev_end = prev_start + prev_bytes.len() as u32;
            if prev_end >= address {
                let overlap = (prev_end - address) as usize;
                if overlap < bytes.len() {
                    prev_bytes.extend_from_slice(&bytes[overlap..]);
                }
                return;
            }
        }

        self.blocks.insert(address, bytes.to_vec());
    }

    /// Iterate over the image's blocks in ascending address order.
    pub fn blocks(&self) -> impl Iterator<Item = (u32, &[u8])> {
        self.blocks.iter().map(|(addr, bytes)| (*addr, bytes.as_slice()))
    }

    /// `true` if the image contains no bytes at all.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Total number of bytes across all blocks.
    pub fn total_bytes(&self) -> usize {
        self.blocks.values().map(Vec::len).sum()
    }

    /// Look up the byte at a single address, if present in the image.
    ///
    /// # Arguments
    ///
    /// * `address` - The flash address to look up
    ///
    /// # Returns
    ///
    /// `Some(byte)` if `address` falls inside one of the image's blocks,
    /// `None` if it falls in a gap between blocks or past the last one.
    pub fn byte_at(&self, address: u32) -> Option<u8> {
        let (&start, bytes) = self.blocks.range(..=address).next_back()?;
        let offset = address.checked_sub(start)? as usize;
        bytes.get(offset).copied()
    }

    /// Build an image directly from a fully materialized block list, used by
    /// read-back mode to wrap the flat buffer collected from the target as a
    /// single block starting at `0x0000`.
    ///
    /// # Arguments
    ///
    /// * `address` - Starting flash address of the single block
    /// * `bytes` - The block's contents; an empty image results if empty
    ///
    /// # Returns
    ///
    /// The resulting single-block [`Image`].
    pub fn from_single_block(address: u32, bytes: Vec<u8>) -> Self {
        let mut image = Image::empty();
        if !bytes.is_empty() {
            image.blocks.insert(address, bytes);
        }
        image
    }
}

/// A chunk of up to 4 consecutive image bytes to write, starting at
/// `address`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteChunk {
    /// Flash address of the first byte in `bytes`.
    pub address: u32,
    /// 1 to 4 bytes to write starting at `address`.
    pub bytes: Vec<u8>,
}

/// The result of asking the transfer plan for the next write chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextWrite {
    /// There is more data to write.
    Chunk(WriteChunk),
    /// The image has been fully written.
    Done,
}

/// Drives the write, verify, and read-back passes over an [`Image`].
///
/// The plan owns a snapshot of the image's blocks and two independent
/// cursors: one for the write pass, one for the verify pass. Read-back mode
/// does not consult the block cursors at all; it only accumulates bytes via
/// [`TransferPlan::append_read_byte`].
pub struct TransferPlan {
    blocks: Vec<(u32, Vec<u8>)>,
    write_block: usize,
    write_offset: usize,
    verify_block: usize,
    total_bytes: usize,
    bytes_written: usize,
    read_buffer: Vec<u8>,
}

impl TransferPlan {
    /// Build a transfer plan over a snapshot of `image`'s blocks.
    pub fn new(image: &Image) -> Self {
        let blocks: Vec<(u32, Vec<u8>)> = image.blocks().map(|(a, b)| (a, b.to_vec())).collect();
        let total_bytes = blocks.iter().map(|(_, b)| b.len()).sum();
        TransferPlan {
            blocks,
            write_block: 0,
            write_offset: 0,
            verify_block: 0,
            total_bytes,
            bytes_written: 0,
            read_buffer: Vec::new(),
        }
    }

    /// Reset to the first block and offset 0 for a write pass.
    pub fn begin_write(&mut self) {
        self.write_block = 0;
        self.write_offset = 0;
        self.bytes_written = 0;
    }

    /// Total number of bytes the image contains (for progress reporting).
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Bytes confirmed written so far in the current write pass.
    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }

    /// Peek the next chunk to write without advancing the cursor.
    ///
    /// A write chunk never crosses a block boundary: when the current block
    /// is exhausted, this automatically reports the start of the next block,
    /// which the caller observes as a discontinuous jump.
    ///
    /// # Returns
    ///
    /// `NextWrite::Chunk` with 1 to 4 bytes starting at the write cursor, or
    /// `NextWrite::Done` once every block has been written.
    pub fn next_write_chunk(&self) -> NextWrite {
        let Some((start, bytes)) = self.blocks.get(self.write_block) else {
            return NextWrite::Done;
        };
        let address = start + self.write_offset as u32;
        let remaining = bytes.len() - self.write_offset;
        let n = remaining.min(4);
        NextWrite::Chunk(WriteChunk {
            address,
            bytes: bytes[self.write_offset..self.write_offset + n].to_vec(),
        })
    }

    /// Advance the write cursor by `n` bytes, the target having confirmed
    /// that many bytes written.
    ///
    /// # Arguments
    ///
    /// * `n` - Number of bytes the target confirmed writing, as reported in
    ///   the `FLASH_READY` fragment byte
    pub fn advance_write(&mut self, n: usize) {
        self.bytes_written += n;
        self.write_offset += n;
        if let Some((_, bytes)) = self.blocks.get(self.write_block) {
            if self.write_offset >= bytes.len() {
                self.write_block += 1;
                self.write_offset = 0;
            }
        }
    }

    /// Reset the verify cursor to the first block for a verify pass.
    pub fn begin_verify(&mut self) {
        self.verify_block = 0;
    }

    /// Starting address of the current block to verify, if any remain.
    pub fn current_verify_block_start(&self) -> Option<u32> {
        self.blocks.get(self.verify_block).map(|(addr, _)| *addr)
    }

    /// Ending address (exclusive) of the current block being verified.
    pub fn current_verify_block_end(&self) -> Option<u32> {
        self.blocks
            .get(self.verify_block)
            .map(|(addr, bytes)| addr + bytes.len() as u32)
    }

    /// Advance to the next block in the verify pass, returning its starting
    /// address, or `None` if every block has been verified.
    pub fn advance_verify_block(&mut self) -> Option<u32> {
        self.verify_block += 1;
        self.current_verify_block_start()
    }

    /// Expected byte at `address`, or `None` if the image has no data there
    /// (addresses absent from the image are never verified).
    ///
    /// # Arguments
    ///
    /// * `address` - The flash address the target just reported a byte for
    ///
    /// # Returns
    ///
    /// `Some(byte)` if `address` falls within the block currently being
    /// verified, `None` otherwise.
    pub fn expect_verify_byte(&self, address: u32) -> Option<u8> {
        let (start, bytes) = self.blocks.get(self.verify_block)?;
        let offset = address.checked_sub(*start)? as usize;
        bytes.get(offset).copied()
    }

    /// Append a byte to the flat read-back buffer.
    ///
    /// # Arguments
    ///
    /// * `byte` - The next byte read back from the target, in address order
    pub fn append_read_byte(&mut self, byte: u8) {
        self.read_buffer.push(byte);
    }

    /// Drain and return the accumulated read-back buffer, leaving it empty.
    pub fn take_read_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.read_buffer)
    }

    /// Current length of the read-back buffer.
    pub fn read_buffer_len(&self) -> usize {
        self.read_buffer.len()
    }
}
