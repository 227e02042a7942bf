//! # Keep-alive pinger
//!
//! Optional periodic `PING` transmitter, active only while the session is in
//! `Init`. Runs as its own `tokio` task so the main event loop never blocks
//! waiting on a timer; pings are handed back over a channel so the transport
//! keeps a single owner.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::frame::{encode, Command, Fragment, CanFrame};

/// Default ping interval when `--ping` is given without an explicit value.
pub const DEFAULT_PING_INTERVAL_MS: u64 = 75;

/// Build the `PING` frame for a given session: remote→mcu CAN-ID (the
/// host's outbound identifier), configured MCU-ID, command `0x00`, zeroed
/// payload.
///
/// # Arguments
///
/// * `can_id_mcu` - CAN-ID used for frames the host sends to the target
/// * `extended` - `true` to mark the frame as a 29-bit extended identifier
/// * `mcu_id` - The session's 16-bit MCU-ID
///
/// # Returns
///
/// The `PING` [`CanFrame`] ready to send.
pub fn ping_frame(can_id_mcu: u32, extended: bool, mcu_id: u16) -> CanFrame {
    let data = encode(Command::Ping, mcu_id, Fragment::zero(), [0, 0, 0, 0]);
    CanFrame::new(can_id_mcu, extended, data)
}

/// Handle to a running pinger task. Dropping or calling [`Pinger::stop`]
/// cancels it immediately; no further pings are sent afterwards.
pub struct Pinger {
    handle: JoinHandle<()>,
}

impl Pinger {
    /// Spawn a pinger that sends a `PING` frame onto `tx` every
    /// `interval_ms` milliseconds, starting after the first tick.
    ///
    /// # Arguments
    ///
    /// * `interval_ms` - Milliseconds between pings; clamped to at least 1
    /// * `can_id_mcu` - CAN-ID used for frames the host sends to the target
    /// * `extended` - `true` to mark pings as 29-bit extended identifiers
    /// * `mcu_id` - The session's 16-bit MCU-ID
    /// * `tx` - Channel the caller's event loop drains to actually send pings,
    ///   keeping the transport's single owner intact
    ///
    /// # Returns
    ///
    /// A [`Pinger`] handle; drop it or call [`Pinger::stop`] to cancel.
    pub fn spawn(interval_ms: u64, can_id_mcu: u32, extended: bool, mcu_id: u16, tx: mpsc::Sender<CanFrame>) -> Self {
        let interval = Duration::from_millis(interval_ms.max(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; consume it so the first ping
            // is sent after one full interval, matching a steady cadence.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if tx.send(ping_frame(can_id_mcu, extended, mcu_id)).await.is_err() {
                    break;
                }
            }
        });
        Pinger { handle }
    }

    /// Cancel the pinger task. Safe to call more than once.
    pub fn stop(self) {
        self.handle.abort();
    }
}
