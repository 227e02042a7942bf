//! # Linux CAN transport
//!
//! [`LinuxCan`] implements [`Transport`] over a real SocketCAN interface via
//! the `socketcan` crate's `tokio` integration. This is the only transport
//! this crate ships; anything else (a USB-CAN dongle, a simulator) would
//! implement the same trait.

use socketcan::tokio::CanSocket;
use socketcan::{CanDataFrame, CanFrame as SocketCanFrame, EmbeddedFrame, ExtendedId, Frame, Id, StandardId};

use crate::error::FlashError;
use crate::frame::{CanFrame, RawFrame};
use crate::transport::Transport;

/// An open SocketCAN interface, e.g. `can0` or a virtual `vcan0` used in
/// testing.
pub struct LinuxCan {
    socket: CanSocket,
}

impl LinuxCan {
    /// Open `iface` in raw (non-FD) CAN mode.
    pub async fn open(iface: &str) -> Result<Self, FlashError> {
        let socket =
            CanSocket::open(iface).map_err(|e| FlashError::Transport(format!("opening interface '{iface}': {e}")))?;
        Ok(LinuxCan { socket })
    }
}

fn to_wire_id(id: u32, extended: bool) -> Result<Id, FlashError> {
    if extended {
        ExtendedId::new(id)
            .map(Id::Extended)
            .ok_or_else(|| FlashError::Transport(format!("CAN-ID 0x{id:X} does not fit in 29 bits")))
    } else {
        StandardId::new(id as u16)
            .map(Id::Standard)
            .ok_or_else(|| FlashError::Transport(format!("CAN-ID 0x{id:X} does not fit in 11 bits")))
    }
}

impl Transport for LinuxCan {
    async fn send(&mut self, frame: CanFrame) -> Result<(), FlashError> {
        let id = to_wire_id(frame.id, frame.extended)?;
        let wire_frame = CanDataFrame::new(id, &frame.data)
            .ok_or_else(|| FlashError::Transport("8-byte payload rejected by the CAN data frame builder".into()))?;
        self.socket
            .write_frame(wire_frame.into())
            .await
            .map_err(|e| FlashError::Transport(format!("sending frame: {e}")))
    }

    async fn recv(&mut self) -> Option<RawFrame> {
        loop {
            match self.socket.read_frame().await {
                Ok(SocketCanFrame::Data(data_frame)) => {
                    let (id, extended) = match data_frame.id() {
                        Id::Standard(id) => (id.as_raw() as u32, false),
                        Id::Extended(id) => (id.as_raw(), true),
                    };
                    return Some(RawFrame {
                        id,
                        extended,
                        data: data_frame.data().to_vec(),
                    });
                }
                // Remote and error frames carry no bootloader payload.
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }

    async fn close(&mut self) -> Result<(), FlashError> {
        Ok(())
    }
}
