//! # Error taxonomy
//!
//! One variant per error kind named in the protocol design: configuration
//! mistakes made before a session starts, transport failures, protocol
//! disagreements with the target, peer-reported errors, verify mismatches,
//! and invariant violations detected in otherwise well-formed traffic.

use thiserror::Error;

/// Errors raised while flashing or reading back a target over the
/// bootloader protocol.
#[derive(Error, Debug)]
pub enum FlashError {
    /// The tool was misconfigured before a session could start: an unknown
    /// part number, or a malformed `--reset` frame specification.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Sending or receiving a CAN frame failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The target's signature or protocol version did not match what was
    /// expected. Version mismatches are recoverable with `--force`;
    /// signature mismatches are always fatal.
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// The target reported an error for the last operation
    /// (`FLASH_ADDRESS_ERROR`, `FLASH_DATA_ERROR`, or
    /// `FLASH_READ_ADDRESS_ERROR`).
    #[error("peer reported an error: {0}")]
    PeerError(String),

    /// A byte read back from the target during verification did not match
    /// the image.
    #[error("verify mismatch at address 0x{address:08X}: expected 0x{expected:02X}, got 0x{actual:02X}")]
    VerifyMismatch {
        /// Flash address of the mismatching byte.
        address: u32,
        /// Byte present in the image.
        expected: u8,
        /// Byte reported by the target.
        actual: u8,
    },

    /// The target's response violated a protocol invariant, such as echoing
    /// an address fragment that does not match the host's read cursor.
    #[error("protocol invariant violated: {0}")]
    InvariantViolation(String),

    /// Wraps an Intel HEX parse or serialize failure.
    #[error("intel hex error: {0}")]
    Hex(String),

    /// Wraps an I/O failure reading or writing a hex file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
