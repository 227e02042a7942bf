//! # Intel HEX I/O
//!
//! Reads and writes [`Image`]s in Intel HEX text form via the `ihex` crate.
//! File vs. stdin/stdout handling lives in `main.rs`; this module only deals
//! in strings and [`Image`]s so it can be tested without touching a
//! filesystem.

use ihex::{create_object_file_representation, Reader, Record};

use crate::error::FlashError;
use crate::image::Image;

const RECORD_WIDTH: usize = 16;

/// Parse an Intel HEX document into an [`Image`].
///
/// Tracks `Extended Linear Address` (0x04) and `Extended Segment Address`
/// (0x02) records to resolve full 32-bit addresses; start-address records are
/// read but not acted upon, since a bootloader session never jumps to an
/// arbitrary entry point. A missing end-of-file record is an error: a
/// truncated transfer should not be mistaken for a complete one.
///
/// # Arguments
///
/// * `text` - The full contents of an Intel HEX file, `:`-record lines
///   separated by newlines
///
/// # Returns
///
/// The [`Image`] built from the file's `Data` records.
///
/// # Errors
///
/// Returns [`FlashError::Hex`] if a record fails to parse, or if the
/// document has no end-of-file record.
pub fn parse(text: &str) -> Result<Image, FlashError> {
    let mut image = Image::empty();
    let mut high_bits: u32 = 0;
    let mut saw_eof = false;

    for record in Reader::new(text) {
        let record = record.map_err(|e| FlashError::Hex(e.to_string()))?;
        match record {
            Record::Data { offset, value } => {
                image.insert_block(high_bits + offset as u32, &value);
            }
            Record::ExtendedLinearAddress(upper) => {
                high_bits = (upper as u32) << 16;
            }
            Record::ExtendedSegmentAddress(segment) => {
                high_bits = (segment as u32) << 4;
            }
            Record::StartLinearAddress(_) | Record::StartSegmentAddress { .. } => {}
            Record::EndOfFile => {
                saw_eof = true;
                break;
            }
        }
    }

    if !saw_eof {
        return Err(FlashError::Hex("truncated hex file: missing end-of-file record".into()));
    }

    Ok(image)
}

/// Serialize an [`Image`] to an Intel HEX document, splitting each block
/// into 16-byte data records and emitting an `Extended Linear Address`
/// record whenever a record crosses a 64 KiB boundary.
///
/// # Arguments
///
/// * `image` - The image to serialize
///
/// # Returns
///
/// The complete Intel HEX document text, terminated by an end-of-file
/// record.
///
/// # Errors
///
/// Returns [`FlashError::Hex`] if the `ihex` crate rejects the assembled
/// records (for example, a record address that does not fit the format).
pub fn serialize(image: &Image) -> Result<String, FlashError> {
    let mut records = Vec::new();
    let mut current_upper: Option<u16> = None;

    for (block_address, bytes) in image.blocks() {
        for (i, chunk) in bytes.chunks(RECORD_WIDTH).enumerate() {
            let address = block_address + (i * RECORD_WIDTH) as u32;
            let upper = (address >> 16) as u16;
            if current_upper != Some(upper) {
                records.push(Record::ExtendedLinearAddress(upper));
                current_upper = Some(upper);
            }
            records.push(Record::Data {
                offset: (address & 0xFFFF) as u16,
                value: chunk.to_vec(),
            });
        }
    }
    records.push(Record::EndOfFile);

    create_object_file_representation(&records).map_err(|e| FlashError::Hex(e.to_string()))
}
