//! # CAN transport contract
//!
//! The state machine itself never touches a socket: [`crate::session::Session`]
//! is a pure, synchronous transition function over [`CanFrame`]s (see
//! `session.rs`). This module defines the async boundary a real CAN interface
//! must satisfy to drive that state machine, and is the interface the §6
//! "Transport contract" describes.

use crate::error::FlashError;
use crate::frame::{CanFrame, RawFrame};

/// An open CAN interface.
///
/// Implementors own the interface exclusively for the lifetime of a session:
/// open it once, then alternate `send`/`recv` (or call them concurrently)
/// until `close`. Send failures are always treated as fatal by the caller.
///
/// `recv` hands frames up exactly as the controller delivered them, DLC and
/// all: [`RawFrame::accept`] is the single place a wrong-length frame gets
/// discarded, not this trait.
pub trait Transport {
    /// Send a single frame. Errors surface to the session as fatal
    /// [`FlashError::Transport`].
    ///
    /// # Arguments
    ///
    /// * `frame` - The frame to write to the bus, as built by [`crate::frame`]
    ///
    /// # Errors
    ///
    /// Returns [`FlashError::Transport`] if the underlying interface
    /// rejects or fails to deliver the frame.
    fn send(&mut self, frame: CanFrame) -> impl Future<Output = Result<(), FlashError>> + Send;

    /// Wait for the next inbound frame.
    ///
    /// # Returns
    ///
    /// `Some(RawFrame)` as delivered by the controller (DLC and all, before
    /// 8-byte filtering), or `None` once the interface is closed or
    /// disconnected with no further frames pending.
    fn recv(&mut self) -> impl Future<Output = Option<RawFrame>> + Send;

    /// Stop the interface, releasing any underlying OS resources.
    ///
    /// # Errors
    ///
    /// Returns [`FlashError::Transport`] if shutting down the interface
    /// fails.
    fn close(&mut self) -> impl Future<Output = Result<(), FlashError>> + Send;
}

/// Parse a `--reset <can_id>#<hex_bytes>` argument into a one-shot frame.
///
/// `can_id` is 3 hex digits for an 11-bit standard identifier or 8 hex digits
/// for a 29-bit extended identifier, matching the `candump`/`cansend`
/// convention. `hex_bytes` is zero or more hex byte pairs, zero-padded to 8
/// bytes.
///
/// # Arguments
///
/// * `spec` - The raw `--reset` argument, e.g. `"123#AABBCC"`
///
/// # Returns
///
/// The one-shot [`CanFrame`] to send immediately after opening the
/// interface.
///
/// # Errors
///
/// Returns [`FlashError::Configuration`] if `spec` has no `#` separator, the
/// id is not 3 or 8 hex digits, the id or data fail to parse as hex, or the
/// data is longer than 8 bytes.
pub fn parse_reset_frame(spec: &str) -> Result<CanFrame, FlashError> {
    let (id_part, data_part) = spec
        .split_once('#')
        .ok_or_else(|| FlashError::Configuration(format!("malformed reset frame '{spec}', expected <can_id>#<hex_bytes>")))?;

    let extended = match id_part.len() {
        3 => false,
        8 => true,
        _ => {
            return Err(FlashError::Configuration(format!(
                "reset frame id '{id_part}' must be 3 hex digits (SFF) or 8 hex digits (EFF)"
            )));
        }
    };

    let id = u32::from_str_radix(id_part, 16)
        .map_err(|e| FlashError::Configuration(format!("invalid reset frame id '{id_part}': {e}")))?;

    let bytes = hex::decode(data_part)
        .map_err(|e| FlashError::Configuration(format!("invalid reset frame data '{data_part}': {e}")))?;
    if bytes.len() > 8 {
        return Err(FlashError::Configuration(format!(
            "reset frame data '{data_part}' has {} bytes, at most 8 are allowed",
            bytes.len()
        )));
    }

    let mut data = [0u8; 8];
    data[..bytes.len()].copy_from_slice(&bytes);

    Ok(CanFrame::new(id, extended, data))
}
