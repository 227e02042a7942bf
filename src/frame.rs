//! # Wire frame codec
//!
//! Every message exchanged with the bootloader is an 8-byte CAN payload with the
//! same layout: a 16-bit MCU-ID, a command byte, a length-and-address fragment
//! byte, and four command-specific payload bytes. This module encodes and
//! decodes that layout and is otherwise stateless.

use std::fmt;

/// A single CAN frame as seen by the bootloader protocol: an identifier, a
/// format flag, and exactly 8 data bytes.
///
/// Frames carrying fewer or more than 8 data bytes are not representable here;
/// the transport layer is responsible for discarding them before they reach
/// the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    /// CAN identifier (11-bit standard or 29-bit extended).
    pub id: u32,
    /// `true` if `id` is a 29-bit extended identifier.
    pub extended: bool,
    /// The 8 payload bytes.
    pub data: [u8; 8],
}

impl CanFrame {
    /// Build a frame from an identifier and a full 8-byte payload.
    pub fn new(id: u32, extended: bool, data: [u8; 8]) -> Self {
        CanFrame { id, extended, data }
    }
}

/// A frame as delivered by the transport, before the core has checked its
/// length.
///
/// Real CAN controllers can deliver frames with a data length code from 0 to
/// 8; only 8-byte frames carry a bootloader message, so [`RawFrame::accept`]
/// is the single point where shorter or longer frames are discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// CAN identifier (11-bit standard or 29-bit extended).
    pub id: u32,
    /// `true` if `id` is a 29-bit extended identifier.
    pub extended: bool,
    /// Data bytes as received, 0 to 8 of them.
    pub data: Vec<u8>,
}

impl RawFrame {
    /// Accept this frame as a well-formed bootloader message, or `None` if
    /// it does not carry exactly 8 data bytes.
    ///
    /// # Returns
    ///
    /// `Some(CanFrame)` with the same `id`/`extended`/data if `self.data`
    /// is exactly 8 bytes long, `None` otherwise.
    pub fn accept(&self) -> Option<CanFrame> {
        let data: [u8; 8] = self.data.clone().try_into().ok()?;
        Some(CanFrame::new(self.id, self.extended, data))
    }
}

impl From<CanFrame> for RawFrame {
    fn from(frame: CanFrame) -> Self {
        RawFrame {
            id: frame.id,
            extended: frame.extended,
            data: frame.data.to_vec(),
        }
    }
}

/// Bootloader command codes (§6 command code table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `0x00`, host → target. Keep-alive.
    Ping,
    /// `0x02`, target → host. Bootloader has entered and announces itself.
    BootloaderStart,
    /// `0x04`, target → host. Target is ready for the next chunk.
    FlashReady,
    /// `0x06`, host → target. Start a flashing session.
    FlashInit,
    /// `0x08`, host → target. Up to 4 bytes of firmware data.
    FlashData,
    /// `0x0A`, host → target. Reposition the target's write/read cursor.
    FlashSetAddress,
    /// `0x0B`, target → host. The last address operation was invalid.
    FlashAddressError,
    /// `0x0D`, target → host. The last data write failed.
    FlashDataError,
    /// `0x10`, host → target. Flashing is complete, no verify requested.
    FlashDone,
    /// `0x20`, host → target. Erase the whole flash before writing.
    FlashErase,
    /// `0x40`, host → target. Request the next chunk of flash contents.
    FlashRead,
    /// `0x48`, target → host. Up to 4 bytes of flash contents.
    FlashReadData,
    /// `0x4B`, target → host. The last read address was invalid.
    FlashReadAddressError,
    /// `0x50`, bidirectional. Flashing is complete, verify requested/starting.
    FlashDoneVerify,
    /// `0x80`, bidirectional. Leave the bootloader and start the application.
    StartApp,
    /// Any command code not recognized by this protocol version.
    Unknown(u8),
}

impl Command {
    /// Decode a command byte into its [`Command`] variant.
    ///
    /// # Arguments
    ///
    /// * `byte` - The raw command byte (byte 2 of a payload)
    ///
    /// # Returns
    ///
    /// The matching [`Command`] variant, or `Command::Unknown(byte)` if
    /// `byte` is not one of the codes in the command code table.
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => Command::Ping,
            0x02 => Command::BootloaderStart,
            0x04 => Command::FlashReady,
            0x06 => Command::FlashInit,
            0x08 => Command::FlashData,
            0x0A => Command::FlashSetAddress,
            0x0B => Command::FlashAddressError,
            0x0D => Command::FlashDataError,
            0x10 => Command::FlashDone,
            0x20 => Command::FlashErase,
            0x40 => Command::FlashRead,
            0x48 => Command::FlashReadData,
            0x4B => Command::FlashReadAddressError,
            0x50 => Command::FlashDoneVerify,
            0x80 => Command::StartApp,
            other => Command::Unknown(other),
        }
    }

    /// Encode this command back to its wire byte.
    pub fn to_byte(self) -> u8 {
        match self {
            Command::Ping => 0x00,
            Command::BootloaderStart => 0x02,
            Command::FlashReady => 0x04,
            Command::FlashInit => 0x06,
            Command::FlashData => 0x08,
            Command::FlashSetAddress => 0x0A,
            Command::FlashAddressError => 0x0B,
            Command::FlashDataError => 0x0D,
            Command::FlashDone => 0x10,
            Command::FlashErase => 0x20,
            Command::FlashRead => 0x40,
            Command::FlashReadData => 0x48,
            Command::FlashReadAddressError => 0x4B,
            Command::FlashDoneVerify => 0x50,
            Command::StartApp => 0x80,
            Command::Unknown(b) => b,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}(0x{:02X})", self, self.to_byte())
    }
}

/// The bootloader protocol version this crate implements (§6).
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Sentinel flash address used to probe `FLASHEND_BL` in read mode.
pub const ADDRESS_PROBE: u32 = 0xFFFF_FFFF;

/// A decoded payload: the fields common to every message plus the raw
/// command-specific bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedPayload {
    /// MCU-ID carried in bytes 0-1.
    pub mcu_id: u16,
    /// Command carried in byte 2.
    pub command: Command,
    /// Raw fragment byte (byte 3), already split into `byte_count`/`addr_low5`.
    pub fragment: Fragment,
    /// Bytes 4-7, command-specific.
    pub payload: [u8; 4],
}

/// The length-and-address-fragment byte: bits 7..5 are a data byte count
/// (0-4), bits 4..0 are the low 5 bits of the flash address the frame refers
/// to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    /// Number of valid data bytes in bytes 4..7 (0-4).
    pub byte_count: u8,
    /// Low 5 bits of the associated flash address.
    pub addr_low5: u8,
}

impl Fragment {
    /// Build a fragment from a byte count and an address, masking the
    /// address down to its low 5 bits.
    ///
    /// # Arguments
    ///
    /// * `byte_count` - Number of valid data bytes (0-4); not masked, so
    ///   callers must pass a value already in range
    /// * `address` - The flash address this fragment refers to; only its
    ///   low 5 bits are kept
    ///
    /// # Returns
    ///
    /// The assembled [`Fragment`].
    pub fn new(byte_count: u8, address: u32) -> Self {
        Fragment {
            byte_count,
            addr_low5: (address & 0x1F) as u8,
        }
    }

    /// The fragment with both fields zeroed, used by commands that carry no
    /// length/address information.
    pub fn zero() -> Self {
        Fragment {
            byte_count: 0,
            addr_low5: 0,
        }
    }

    /// Decode a fragment from its wire byte.
    pub fn from_byte(byte: u8) -> Self {
        Fragment {
            byte_count: (byte >> 5) & 0x07,
            addr_low5: byte & 0x1F,
        }
    }

    /// Encode this fragment to its wire byte: `(byte_count << 5) | addr_low5`.
    pub fn to_byte(self) -> u8 {
        ((self.byte_count & 0x07) << 5) | (self.addr_low5 & 0x1F)
    }
}

/// Encode a message into an 8-byte payload.
///
/// `payload` is copied verbatim into bytes 4..7; callers are responsible for
/// big-endian address packing or data packing before calling this function.
///
/// # Arguments
///
/// * `command` - The command code to place in byte 2
/// * `mcu_id` - The 16-bit session identifier to place in bytes 0-1
/// * `fragment` - The byte-count/address-low-bits fragment to place in byte 3
/// * `payload` - The four command-specific bytes to place in bytes 4-7
///
/// # Returns
///
/// The complete 8-byte wire payload.
pub fn encode(command: Command, mcu_id: u16, fragment: Fragment, payload: [u8; 4]) -> [u8; 8] {
    let mcu = mcu_id.to_be_bytes();
    [
        mcu[0],
        mcu[1],
        command.to_byte(),
        fragment.to_byte(),
        payload[0],
        payload[1],
        payload[2],
        payload[3],
    ]
}

/// Encode a message whose bytes 4..7 carry a big-endian 32-bit flash address.
///
/// # Arguments
///
/// * `command` - The command code to place in byte 2
/// * `mcu_id` - The 16-bit session identifier to place in bytes 0-1
/// * `address` - The 32-bit flash address to pack big-endian into bytes 4-7
///
/// # Returns
///
/// The complete 8-byte wire payload, with a zeroed fragment byte.
pub fn encode_address(command: Command, mcu_id: u16, address: u32) -> [u8; 8] {
    encode(command, mcu_id, Fragment::zero(), address.to_be_bytes())
}

/// Decode an 8-byte payload into its constituent fields.
///
/// # Arguments
///
/// * `data` - The raw 8-byte wire payload to decode
///
/// # Returns
///
/// The [`DecodedPayload`] with its MCU-ID, command, fragment, and
/// command-specific bytes split out. Always succeeds: every bit pattern in
/// a well-formed 8-byte frame maps to a value here, with unrecognized
/// command bytes landing in [`Command::Unknown`].
pub fn decode(data: [u8; 8]) -> DecodedPayload {
    DecodedPayload {
        mcu_id: u16::from_be_bytes([data[0], data[1]]),
        command: Command::from_byte(data[2]),
        fragment: Fragment::from_byte(data[3]),
        payload: [data[4], data[5], data[6], data[7]],
    }
}

/// Decode the big-endian 32-bit address carried in bytes 4..7 of a decoded
/// payload.
///
/// # Arguments
///
/// * `payload` - A payload already decoded by [`decode`]
///
/// # Returns
///
/// The 32-bit flash address bytes 4-7 encode, big-endian.
pub fn decode_address(payload: &DecodedPayload) -> u32 {
    u32::from_be_bytes(payload.payload)
}
