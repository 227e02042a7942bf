//! # canboot-flash
//!
//! Host-side library for flashing and reading back 8-bit microcontrollers
//! running a small CAN-bus bootloader protocol.
//!
//! The protocol is a simple command/response dialogue over 8-byte CAN
//! frames, filtered by CAN-ID and a 16-bit session MCU-ID: the target
//! announces its bootloader, the host negotiates a signature/version check,
//! then the two sides walk an Intel HEX image forward (flash mode) or walk
//! the target's flash contents back into one (read mode), optionally
//! verifying a write by reading it straight back.
//!
//! [`session::Session`] is the protocol's core: a pure, synchronous
//! transition function over inbound frames, decoupled from the async
//! transport in [`transport::Transport`]/[`linux_can::LinuxCan`] so it can be
//! exercised directly in unit tests. `main.rs` wires the two together behind
//! a single `tokio::select!` loop.
//!
//! See the individual modules for the wire format ([`frame`]), the firmware
//! image model ([`image`]), the device catalog ([`catalog`]), and the
//! keep-alive pinger ([`pinger`]).

#![deny(missing_docs)]

pub mod catalog;
pub mod cli;
pub mod error;
pub mod frame;
pub mod hexio;
pub mod image;
pub mod linux_can;
pub mod pinger;
pub mod session;
pub mod transport;

/// Re-exported for convenience; see [`error`].
pub use error::FlashError;
/// Re-exported for convenience; see [`session`].
pub use session::Session;
