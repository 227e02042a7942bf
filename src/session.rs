//! # Bootloader dialogue engine
//!
//! The protagonist of this crate. [`Session`] is a pure, synchronous state
//! machine: feed it one accepted frame at a time via [`Session::on_frame`]
//! and it returns the frames to emit in response, whether the keep-alive
//! pinger should now be stopped, and whether the session has finished. No
//! I/O happens here — the async glue in `main.rs` owns the transport and
//! simply plays frames through this machine in order.

use std::time::Instant;

use crate::catalog::Device;
use crate::error::FlashError;
use crate::frame::{
    decode, decode_address, encode, encode_address, CanFrame, Command, Fragment, RawFrame,
    ADDRESS_PROBE, PROTOCOL_VERSION,
};
use crate::image::{Image, NextWrite, TransferPlan};

/// Top-level session state (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Waiting for the target to announce its bootloader and, depending on
    /// mode, to request erase or the first write/read step.
    Init,
    /// Writing the image to flash.
    Flashing,
    /// Reading flash back, either to verify a just-completed write or to
    /// produce a standalone read-back image.
    Reading,
}

/// Whether this session writes an image or reads one back (§6 `read` flag).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationMode {
    /// Write `image` to the target, optionally verifying afterwards.
    Flash,
    /// Read the target's program memory back into an image.
    Read,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadSubmode {
    /// Reading back flash contents to compare against the image just
    /// written.
    Verify,
    /// Reading back flash contents into a standalone output image.
    Plain,
}

/// Fixed configuration for one session, set at construction and never
/// mutated afterwards (the session's own progress is tracked separately in
/// [`Session`]'s cursors).
pub struct SessionConfig {
    /// 16-bit MCU-ID embedded in every frame of this session.
    pub mcu_id: u16,
    /// CAN-ID used for frames the host sends to the target.
    pub can_id_mcu: u32,
    /// CAN-ID the host filters inbound frames on (frames from the target).
    pub can_id_remote: u32,
    /// `true` to emit/expect 29-bit extended CAN identifiers.
    pub extended: bool,
    /// Expected device signature and flash size (§4.1).
    pub device: Device,
    /// Flash vs. read-back session.
    pub mode: OperationMode,
    /// Erase the whole flash before the first write (flash mode only).
    pub erase: bool,
    /// Run a verify pass after writing (flash mode only).
    pub verify: bool,
    /// Proceed despite a protocol version mismatch.
    pub force: bool,
    /// Optional operator cap on the highest address to read back.
    pub read_limit: Option<u32>,
}

/// The image bytes produced by a completed read-mode or verify-mode session.
#[derive(Debug, Clone, Default)]
pub struct SessionOutput {
    /// Bytes read back from the target in read mode, in address order
    /// starting at `0x0000`. Always `None` for a flash-mode (verify or
    /// plain) session, since those have nothing to write out.
    pub read_bytes: Option<Vec<u8>>,
}

/// What [`Session::on_frame`] or [`Session::start`] produced: zero or more
/// frames to send, whether the pinger should be stopped, and whether the
/// session has reached a terminal state.
#[derive(Debug, Default)]
pub struct StepResult {
    /// Frames to send, in order.
    pub frames: Vec<CanFrame>,
    /// `true` once the session no longer wants keep-alive pings, even if it
    /// has not reached a terminal state yet (the target has already been
    /// heard from).
    pub stop_pinger: bool,
    /// `Some` once the session has reached `Done`.
    pub finished: Option<Result<SessionOutput, FlashError>>,
}

impl StepResult {
    fn none() -> Self {
        StepResult::default()
    }

    fn emit(frame: CanFrame) -> Self {
        StepResult {
            frames: vec![frame],
            ..StepResult::default()
        }
    }
}

/// The bootloader session state machine.
pub struct Session {
    config: SessionConfig,
    phase: SessionPhase,
    plan: TransferPlan,
    read_submode: ReadSubmode,
    erase_pending: bool,
    remote_address: u32,
    current_address: u32,
    read_until: u32,
    program_size: u32,
    bootloader_size: u32,
    flash_start_timestamp: Option<Instant>,
}

impl Session {
    /// Create a new session in `Init` state over `image` (empty for read
    /// mode).
    ///
    /// # Arguments
    ///
    /// * `config` - Fixed session configuration (MCU-ID, CAN-IDs, device,
    ///   mode, and the erase/verify/force flags), never mutated afterwards
    /// * `image` - The firmware image to write (empty for a read-mode
    ///   session, which has nothing to write)
    ///
    /// # Returns
    ///
    /// A new [`Session`] in [`SessionPhase::Init`], ready to be driven by
    /// [`Session::on_frame`].
    pub fn new(config: SessionConfig, image: Image) -> Self {
        let plan = TransferPlan::new(&image);
        let erase_pending = config.erase;
        Session {
            config,
            phase: SessionPhase::Init,
            plan,
            read_submode: ReadSubmode::Plain,
            erase_pending,
            remote_address: 0,
            current_address: 0,
            read_until: 0,
            program_size: 0,
            bootloader_size: 0,
            flash_start_timestamp: None,
        }
    }

    /// Current top-level state.
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Size of the bootloader region in bytes, known once read mode has
    /// probed the target (`0` beforehand).
    pub fn bootloader_size(&self) -> u32 {
        self.bootloader_size
    }

    /// Size of the program region in bytes, known once read mode has probed
    /// the target (`0` beforehand).
    pub fn program_size(&self) -> u32 {
        self.program_size
    }

    /// Total bytes the transfer plan will write in flash mode.
    pub fn total_write_bytes(&self) -> usize {
        self.plan.total_bytes()
    }

    /// Bytes confirmed written so far in flash mode.
    pub fn bytes_written(&self) -> usize {
        self.plan.bytes_written()
    }

    fn outbound(&self, data: [u8; 8]) -> CanFrame {
        CanFrame::new(self.config.can_id_mcu, self.config.extended, data)
    }

    /// Process one raw inbound frame.
    ///
    /// Frames are dropped, with no change to state or cursors, unless they
    /// carry exactly 8 data bytes, arrive on the configured remote CAN-ID,
    /// and carry the configured MCU-ID. An accepted frame is dispatched to
    /// the handler for the session's current phase, which may emit frames,
    /// advance cursors, transition phase, or terminate the session.
    ///
    /// # Arguments
    ///
    /// * `raw` - A single inbound CAN frame exactly as the transport
    ///   delivered it, before length filtering
    ///
    /// # Returns
    ///
    /// A [`StepResult`] carrying any frames to send in reply, whether the
    /// keep-alive pinger should now be stopped, and `Some(..)` once the
    /// session has reached a terminal outcome.
    pub fn on_frame(&mut self, raw: &RawFrame) -> StepResult {
        let was_init = self.phase == SessionPhase::Init;

        let Some(decoded) = self.accept(raw) else {
            return StepResult::none();
        };

        let mut result = match self.phase {
            SessionPhase::Init => self.handle_init(decoded),
            SessionPhase::Flashing => self.handle_flashing(decoded),
            SessionPhase::Reading => self.handle_reading(decoded),
        };

        if was_init && self.phase != SessionPhase::Init {
            result.stop_pinger = true;
        }
        result
    }

    fn accept(&self, raw: &RawFrame) -> Option<crate::frame::DecodedPayload> {
        if raw.id != self.config.can_id_remote {
            return None;
        }
        let frame = raw.accept()?;
        let decoded = decode(frame.data);
        if decoded.mcu_id != self.config.mcu_id {
            return None;
        }
        Some(decoded)
    }

    // ---- Init -----------------------------------------------------------

    fn handle_init(&mut self, decoded: crate::frame::DecodedPayload) -> StepResult {
        match decoded.command {
            Command::BootloaderStart => self.handle_bootloader_start(decoded),
            Command::FlashReady => self.handle_init_flash_ready(decoded),
            Command::FlashAddressError => self.handle_init_address_error(decoded),
            other => {
                log::warn!("unexpected {other} while waiting in Init, ignoring");
                StepResult::none()
            }
        }
    }

    fn handle_bootloader_start(&mut self, decoded: crate::frame::DecodedPayload) -> StepResult {
        let signature = [decoded.payload[0], decoded.payload[1], decoded.payload[2]];
        if signature != self.config.device.signature {
            log::error!(
                "signature mismatch: target reports {signature:02X?}, expected {:02X?}",
                self.config.device.signature
            );
            return StepResult::none();
        }

        let version = decoded.payload[3];
        if version != PROTOCOL_VERSION {
            if self.config.force {
                log::warn!(
                    "protocol version mismatch (target reports 0x{version:02X}, expected 0x{PROTOCOL_VERSION:02X}), continuing because --force was given"
                );
            } else {
                log::error!(
                    "protocol version mismatch (target reports 0x{version:02X}, expected 0x{PROTOCOL_VERSION:02X}); rerun with --force to override"
                );
                return StepResult::none();
            }
        }

        self.flash_start_timestamp = Some(Instant::now());
        let frame = self.outbound(encode(
            Command::FlashInit,
            self.config.mcu_id,
            Fragment::zero(),
            [signature[0], signature[1], signature[2], 0],
        ));
        StepResult {
            frames: vec![frame],
            stop_pinger: true,
            finished: None,
        }
    }

    fn handle_init_flash_ready(&mut self, decoded: crate::frame::DecodedPayload) -> StepResult {
        if self.config.mode == OperationMode::Read {
            return StepResult::emit(self.outbound(encode_address(
                Command::FlashSetAddress,
                self.config.mcu_id,
                ADDRESS_PROBE,
            )));
        }

        if self.erase_pending {
            self.erase_pending = false;
            return StepResult::emit(self.outbound(encode(
                Command::FlashErase,
                self.config.mcu_id,
                Fragment::zero(),
                [0; 4],
            )));
        }

        self.remote_address = decode_address(&decoded);
        self.phase = SessionPhase::Flashing;
        self.plan.begin_write();
        self.write_step()
    }

    fn handle_init_address_error(&mut self, decoded: crate::frame::DecodedPayload) -> StepResult {
        if self.config.mode != OperationMode::Read {
            log::warn!("unexpected FLASH_ADDRESS_ERROR outside read mode, ignoring");
            return StepResult::none();
        }

        let flashend_bl = decode_address(&decoded);
        self.program_size = flashend_bl + 1;
        self.bootloader_size = self.config.device.flash_size.saturating_sub(self.program_size);
        self.read_until = self
            .config
            .read_limit
            .map_or(self.program_size, |cap| cap.min(self.program_size));

        self.current_address = 0;
        self.phase = SessionPhase::Reading;
        self.read_submode = ReadSubmode::Plain;

        StepResult::emit(self.outbound(encode_address(Command::FlashRead, self.config.mcu_id, 0)))
    }

    // ---- Flashing ---------------------------------------------------------

    fn handle_flashing(&mut self, decoded: crate::frame::DecodedPayload) -> StepResult {
        match decoded.command {
            Command::FlashReady => {
                self.plan.advance_write(decoded.fragment.byte_count as usize);
                self.remote_address = decode_address(&decoded);
                self.write_step()
            }
            Command::FlashDataError => {
                log::error!("target reported a flash data error, waiting for it to recover");
                StepResult::none()
            }
            Command::FlashAddressError => {
                log::error!("target reported a flash address error, waiting for it to recover");
                StepResult::none()
            }
            Command::StartApp => self.terminate_on_start_app(true),
            other => {
                log::warn!("unexpected {other} while flashing, ignoring");
                StepResult::none()
            }
        }
    }

    /// Consult the transfer plan and either emit the next write, reposition
    /// the target's address cursor, or begin termination.
    fn write_step(&mut self) -> StepResult {
        match self.plan.next_write_chunk() {
            NextWrite::Chunk(chunk) => {
                if chunk.address != self.remote_address {
                    StepResult::emit(self.outbound(encode_address(
                        Command::FlashSetAddress,
                        self.config.mcu_id,
                        chunk.address,
                    )))
                } else {
                    let byte_count = chunk.bytes.len() as u8;
                    let mut payload = [0u8; 4];
                    payload[..chunk.bytes.len()].copy_from_slice(&chunk.bytes);
                    let fragment = Fragment::new(byte_count, chunk.address);
                    StepResult::emit(self.outbound(encode(
                        Command::FlashData,
                        self.config.mcu_id,
                        fragment,
                        payload,
                    )))
                }
            }
            NextWrite::Done => {
                if self.config.verify {
                    let frame = self.outbound(encode(
                        Command::FlashDoneVerify,
                        self.config.mcu_id,
                        Fragment::zero(),
                        [0; 4],
                    ));
                    self.phase = SessionPhase::Reading;
                    self.read_submode = ReadSubmode::Verify;
                    StepResult::emit(frame)
                } else {
                    StepResult::emit(self.outbound(encode(
                        Command::FlashDone,
                        self.config.mcu_id,
                        Fragment::zero(),
                        [0; 4],
                    )))
                }
            }
        }
    }

    // ---- Reading ------------------------------------------------------

    fn handle_reading(&mut self, decoded: crate::frame::DecodedPayload) -> StepResult {
        match decoded.command {
            Command::FlashDoneVerify => self.handle_flash_done_verify(),
            Command::FlashReadData => self.handle_flash_read_data(decoded),
            Command::FlashReadAddressError => self.handle_flash_read_address_error(),
            Command::StartApp => self.terminate_on_start_app(false),
            other => {
                log::warn!("unexpected {other} while reading, ignoring");
                StepResult::none()
            }
        }
    }

    fn handle_flash_done_verify(&mut self) -> StepResult {
        self.plan.begin_verify();
        match self.plan.current_verify_block_start() {
            Some(address) => {
                self.current_address = address;
                StepResult::emit(self.outbound(encode_address(Command::FlashRead, self.config.mcu_id, address)))
            }
            // Nothing in the image: vacuously verified.
            None => self.terminate_with_start_app(Ok(())),
        }
    }

    fn handle_flash_read_data(&mut self, decoded: crate::frame::DecodedPayload) -> StepResult {
        let byte_count = decoded.fragment.byte_count as usize;
        let addr_low5 = decoded.fragment.addr_low5;
        let expected_low5 = (self.current_address & 0x1F) as u8;

        if addr_low5 != expected_low5 {
            log::error!(
                "address fragment mismatch: target echoed low bits 0x{addr_low5:02X}, expected 0x{expected_low5:02X} for cursor 0x{:08X}",
                self.current_address
            );
            return self.terminate_with_start_app(Err(FlashError::InvariantViolation(format!(
                "target echoed address-low bits 0x{addr_low5:02X} but host cursor was at 0x{:08X}",
                self.current_address
            ))));
        }

        let start_address = self.current_address;

        match self.read_submode {
            ReadSubmode::Verify => {
                for i in 0..byte_count {
                    let address = start_address + i as u32;
                    let actual = decoded.payload[i];
                    if let Some(expected) = self.plan.expect_verify_byte(address) {
                        if expected != actual {
                            return self.terminate_with_start_app(Err(FlashError::VerifyMismatch {
                                address,
                                expected,
                                actual,
                            }));
                        }
                    }
                }
                self.current_address += byte_count as u32;

                let block_end = self.plan.current_verify_block_end().unwrap_or(self.current_address);
                if self.current_address >= block_end {
                    match self.plan.advance_verify_block() {
                        Some(next_start) => {
                            self.current_address = next_start;
                            StepResult::emit(self.outbound(encode_address(
                                Command::FlashRead,
                                self.config.mcu_id,
                                next_start,
                            )))
                        }
                        None => self.terminate_with_start_app(Ok(())),
                    }
                } else {
                    StepResult::emit(self.outbound(encode_address(
                        Command::FlashRead,
                        self.config.mcu_id,
                        self.current_address,
                    )))
                }
            }
            ReadSubmode::Plain => {
                for byte in &decoded.payload[..byte_count] {
                    self.plan.append_read_byte(*byte);
                }
                self.current_address += byte_count as u32;

                if self.current_address > self.read_until {
                    self.terminate_with_start_app(Ok(()))
                } else {
                    StepResult::emit(self.outbound(encode_address(
                        Command::FlashRead,
                        self.config.mcu_id,
                        self.current_address,
                    )))
                }
            }
        }
    }

    fn handle_flash_read_address_error(&mut self) -> StepResult {
        match self.read_submode {
            ReadSubmode::Verify => {
                log::error!("read failed during verify");
                self.terminate_with_start_app(Err(FlashError::PeerError(
                    "target reported FLASH_READ_ADDRESS_ERROR during verify".into(),
                )))
            }
            ReadSubmode::Plain => self.terminate_with_start_app(Ok(())),
        }
    }

    fn read_bytes_if_plain(&mut self) -> Option<Vec<u8>> {
        match self.read_submode {
            ReadSubmode::Plain => Some(self.plan.take_read_buffer()),
            ReadSubmode::Verify => None,
        }
    }

    /// Host-initiated termination: emit a courtesy `START_APP` so the target
    /// leaves the bootloader regardless of outcome.
    fn terminate_with_start_app(&mut self, result: Result<(), FlashError>) -> StepResult {
        let frame = self.outbound(encode(Command::StartApp, self.config.mcu_id, Fragment::zero(), [0; 4]));
        let read_bytes = self.read_bytes_if_plain();
        StepResult {
            frames: vec![frame],
            stop_pinger: false,
            finished: Some(result.map(|()| SessionOutput { read_bytes })),
        }
    }

    /// Target-initiated termination: the target already sent `START_APP`, so
    /// the host has nothing further to emit.
    fn terminate_on_start_app(&mut self, log_elapsed: bool) -> StepResult {
        if log_elapsed {
            if let Some(start) = self.flash_start_timestamp {
                log::info!("flashing completed in {:.2}s", start.elapsed().as_secs_f64());
            }
        }
        let read_bytes = self.read_bytes_if_plain();
        StepResult {
            frames: vec![],
            stop_pinger: false,
            finished: Some(Ok(SessionOutput { read_bytes })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Device;

    const MCU_ID: u16 = 0x0042;
    const CAN_ID_MCU: u32 = 0x1FFF_FF01;
    const CAN_ID_REMOTE: u32 = 0x1FFF_FF02;
    const M328P: Device = Device {
        signature: [0x1E, 0x95, 0x0F],
        flash_size: 32 * 1024,
    };

    fn config(mode: OperationMode, verify: bool) -> SessionConfig {
        SessionConfig {
            mcu_id: MCU_ID,
            can_id_mcu: CAN_ID_MCU,
            can_id_remote: CAN_ID_REMOTE,
            extended: true,
            device: M328P,
            mode,
            erase: false,
            verify,
            force: false,
            read_limit: None,
        }
    }

    fn from_target(command: Command, fragment: Fragment, payload: [u8; 4]) -> RawFrame {
        RawFrame {
            id: CAN_ID_REMOTE,
            extended: true,
            data: encode(command, MCU_ID, fragment, payload).to_vec(),
        }
    }

    fn single(result: &StepResult) -> &CanFrame {
        assert_eq!(result.frames.len(), 1, "expected exactly one emitted frame");
        &result.frames[0]
    }

    /// S1 Happy flash.
    #[test]
    fn s1_happy_flash() {
        let mut image = Image::empty();
        image.insert_block(0x0000, &[0xAA, 0xBB, 0xCC, 0xDD]);
        let mut session = Session::new(config(OperationMode::Flash, false), image);

        let start = from_target(
            Command::BootloaderStart,
            Fragment::zero(),
            [0x1E, 0x95, 0x0F, PROTOCOL_VERSION],
        );
        let result = session.on_frame(&start);
        assert!(result.finished.is_none());
        assert!(result.stop_pinger);
        let decoded = decode(single(&result).data);
        assert_eq!(decoded.command, Command::FlashInit);
        assert_eq!(decoded.payload, [0x1E, 0x95, 0x0F, 0]);
        assert_eq!(session.phase(), SessionPhase::Init);

        let ready = from_target(Command::FlashReady, Fragment::zero(), [0, 0, 0, 0]);
        let result = session.on_frame(&ready);
        assert_eq!(session.phase(), SessionPhase::Flashing);
        let decoded = decode(single(&result).data);
        assert_eq!(decoded.command, Command::FlashData);
        assert_eq!(decoded.fragment.to_byte(), 0x80);
        assert_eq!(decoded.payload, [0xAA, 0xBB, 0xCC, 0xDD]);

        let ready2 = from_target(Command::FlashReady, Fragment::new(4, 4), [0, 0, 0, 4]);
        let result = session.on_frame(&ready2);
        let decoded = decode(single(&result).data);
        assert_eq!(decoded.command, Command::FlashDone);

        let start_app = from_target(Command::StartApp, Fragment::zero(), [0, 0, 0, 0]);
        let result = session.on_frame(&start_app);
        assert!(result.frames.is_empty());
        assert!(matches!(result.finished, Some(Ok(_))));
    }

    /// S2 Verify mismatch.
    #[test]
    fn s2_verify_mismatch() {
        let mut image = Image::empty();
        image.insert_block(0x0000, &[0xAA, 0xBB, 0xCC, 0xDD]);
        let mut session = Session::new(config(OperationMode::Flash, true), image);

        session.on_frame(&from_target(
            Command::BootloaderStart,
            Fragment::zero(),
            [0x1E, 0x95, 0x0F, PROTOCOL_VERSION],
        ));
        session.on_frame(&from_target(Command::FlashReady, Fragment::zero(), [0, 0, 0, 0]));
        let result = session.on_frame(&from_target(Command::FlashReady, Fragment::new(4, 4), [0, 0, 0, 4]));
        let decoded = decode(single(&result).data);
        assert_eq!(decoded.command, Command::FlashDoneVerify);
        assert_eq!(session.phase(), SessionPhase::Reading);

        let result = session.on_frame(&from_target(Command::FlashDoneVerify, Fragment::zero(), [0, 0, 0, 0]));
        let decoded = decode(single(&result).data);
        assert_eq!(decoded.command, Command::FlashRead);
        assert_eq!(decode_address(&decoded), 0);

        // Byte 0 is wrong: 0xAB instead of 0xAA.
        let result = session.on_frame(&from_target(
            Command::FlashReadData,
            Fragment::new(4, 0),
            [0xAB, 0xBB, 0xCC, 0xDD],
        ));
        let decoded = decode(single(&result).data);
        assert_eq!(decoded.command, Command::StartApp);
        match result.finished {
            Some(Err(FlashError::VerifyMismatch { address, expected, actual })) => {
                assert_eq!(address, 0x0000);
                assert_eq!(expected, 0xAA);
                assert_eq!(actual, 0xAB);
            }
            other => panic!("expected VerifyMismatch, got {other:?}"),
        }
    }

    /// S3 Address jump.
    #[test]
    fn s3_address_jump() {
        let mut image = Image::empty();
        image.insert_block(0x0000, &[0x01, 0x02, 0x03, 0x04]);
        image.insert_block(0x0100, &[0x05]);
        let mut session = Session::new(config(OperationMode::Flash, false), image);

        session.on_frame(&from_target(
            Command::BootloaderStart,
            Fragment::zero(),
            [0x1E, 0x95, 0x0F, PROTOCOL_VERSION],
        ));
        session.on_frame(&from_target(Command::FlashReady, Fragment::zero(), [0, 0, 0, 0]));

        // Target reports remote addr 0x00000004 after writing the first 4 bytes.
        let result = session.on_frame(&from_target(Command::FlashReady, Fragment::new(4, 4), [0, 0, 0, 4]));
        let decoded = decode(single(&result).data);
        assert_eq!(decoded.command, Command::FlashSetAddress);
        assert_eq!(decode_address(&decoded), 0x0100);

        let result = session.on_frame(&from_target(Command::FlashReady, Fragment::zero(), [0, 0, 1, 0]));
        let decoded = decode(single(&result).data);
        assert_eq!(decoded.command, Command::FlashData);
        assert_eq!(decoded.payload[0], 0x05);
        assert_eq!(decoded.fragment.byte_count, 1);
    }

    /// S4 Read probe.
    #[test]
    fn s4_read_probe() {
        let mut session = Session::new(config(OperationMode::Read, false), Image::empty());

        session.on_frame(&from_target(
            Command::BootloaderStart,
            Fragment::zero(),
            [0x1E, 0x95, 0x0F, PROTOCOL_VERSION],
        ));
        let result = session.on_frame(&from_target(Command::FlashReady, Fragment::zero(), [0, 0, 0, 0]));
        let decoded = decode(single(&result).data);
        assert_eq!(decoded.command, Command::FlashSetAddress);
        assert_eq!(decode_address(&decoded), ADDRESS_PROBE);

        let result = session.on_frame(&from_target(
            Command::FlashAddressError,
            Fragment::zero(),
            [0x00, 0x00, 0x77, 0xFF],
        ));
        assert_eq!(session.phase(), SessionPhase::Reading);
        assert_eq!(session.program_size(), 0x7800);
        assert_eq!(session.bootloader_size(), 0x0800);
        let decoded = decode(single(&result).data);
        assert_eq!(decoded.command, Command::FlashRead);
        assert_eq!(decode_address(&decoded), 0);
    }

    /// S5 Version mismatch without force.
    #[test]
    fn s5_version_mismatch_without_force() {
        let mut session = Session::new(config(OperationMode::Flash, false), Image::empty());
        let result = session.on_frame(&from_target(
            Command::BootloaderStart,
            Fragment::zero(),
            [0x1E, 0x95, 0x0F, 0x02],
        ));
        assert!(result.frames.is_empty());
        assert!(result.finished.is_none());
        assert_eq!(session.phase(), SessionPhase::Init);
    }

    #[test]
    fn version_mismatch_with_force_continues() {
        let mut session = Session::new(
            SessionConfig {
                force: true,
                ..config(OperationMode::Flash, false)
            },
            Image::empty(),
        );
        let result = session.on_frame(&from_target(
            Command::BootloaderStart,
            Fragment::zero(),
            [0x1E, 0x95, 0x0F, 0x02],
        ));
        let decoded = decode(single(&result).data);
        assert_eq!(decoded.command, Command::FlashInit);
    }

    #[test]
    fn signature_mismatch_is_never_forced() {
        let mut session = Session::new(
            SessionConfig {
                force: true,
                ..config(OperationMode::Flash, false)
            },
            Image::empty(),
        );
        let result = session.on_frame(&from_target(
            Command::BootloaderStart,
            Fragment::zero(),
            [0xDE, 0xAD, 0xBE, PROTOCOL_VERSION],
        ));
        assert!(result.frames.is_empty());
        assert_eq!(session.phase(), SessionPhase::Init);
    }

    #[test]
    fn filter_drops_wrong_mcu_id_wrong_can_id_and_wrong_length() {
        let mut session = Session::new(config(OperationMode::Flash, false), Image::empty());

        let wrong_can_id = RawFrame {
            id: 0x1234,
            extended: true,
            data: encode(
                Command::BootloaderStart,
                MCU_ID,
                Fragment::zero(),
                [0x1E, 0x95, 0x0F, PROTOCOL_VERSION],
            )
            .to_vec(),
        };
        assert!(session.on_frame(&wrong_can_id).frames.is_empty());
        assert_eq!(session.phase(), SessionPhase::Init);

        let wrong_mcu = from_target(
            Command::BootloaderStart,
            Fragment::zero(),
            [0x1E, 0x95, 0x0F, PROTOCOL_VERSION],
        );
        let mut wrong_mcu = wrong_mcu;
        wrong_mcu.data[0] = 0xFF;
        assert!(session.on_frame(&wrong_mcu).frames.is_empty());
        assert_eq!(session.phase(), SessionPhase::Init);

        let wrong_length = RawFrame {
            id: CAN_ID_REMOTE,
            extended: true,
            data: vec![0, 0x42, 0x02],
        };
        assert!(session.on_frame(&wrong_length).frames.is_empty());
        assert_eq!(session.phase(), SessionPhase::Init);
    }

    #[test]
    fn read_data_invariant_violation_is_fatal() {
        let mut session = Session::new(config(OperationMode::Read, false), Image::empty());
        session.on_frame(&from_target(
            Command::BootloaderStart,
            Fragment::zero(),
            [0x1E, 0x95, 0x0F, PROTOCOL_VERSION],
        ));
        session.on_frame(&from_target(Command::FlashReady, Fragment::zero(), [0, 0, 0, 0]));
        session.on_frame(&from_target(
            Command::FlashAddressError,
            Fragment::zero(),
            [0x00, 0x00, 0x00, 0x0F],
        ));

        // Target echoes a bogus low-5 bits value (should be 0, it reports 3).
        let result = session.on_frame(&from_target(Command::FlashReadData, Fragment::new(1, 3), [0, 0, 0, 0]));
        let decoded = decode(single(&result).data);
        assert_eq!(decoded.command, Command::StartApp);
        assert!(matches!(result.finished, Some(Err(FlashError::InvariantViolation(_)))));
    }

    #[test]
    fn read_mode_terminates_after_read_until_with_expected_byte_count() {
        let mut session = Session::new(config(OperationMode::Read, false), Image::empty());
        session.on_frame(&from_target(
            Command::BootloaderStart,
            Fragment::zero(),
            [0x1E, 0x95, 0x0F, PROTOCOL_VERSION],
        ));
        session.on_frame(&from_target(Command::FlashReady, Fragment::zero(), [0, 0, 0, 0]));
        // FLASHEND_BL = 3 -> program_size = 4, read_until = 4.
        session.on_frame(&from_target(
            Command::FlashAddressError,
            Fragment::zero(),
            [0x00, 0x00, 0x00, 0x03],
        ));

        session.on_frame(&from_target(Command::FlashReadData, Fragment::new(4, 0), [1, 2, 3, 4]));
        let result = session.on_frame(&from_target(Command::FlashReadData, Fragment::new(1, 4), [5, 0, 0, 0]));
        let decoded = decode(single(&result).data);
        assert_eq!(decoded.command, Command::StartApp);
        match result.finished {
            Some(Ok(SessionOutput { read_bytes: Some(bytes) })) => {
                assert_eq!(bytes, vec![1, 2, 3, 4, 5]);
            }
            other => panic!("expected completed read buffer, got {other:?}"),
        }
    }

    #[test]
    fn erase_is_requested_once_before_the_first_write() {
        let mut image = Image::empty();
        image.insert_block(0x0000, &[0xAA, 0xBB, 0xCC, 0xDD]);
        let mut session = Session::new(
            SessionConfig {
                erase: true,
                ..config(OperationMode::Flash, false)
            },
            image,
        );

        session.on_frame(&from_target(
            Command::BootloaderStart,
            Fragment::zero(),
            [0x1E, 0x95, 0x0F, PROTOCOL_VERSION],
        ));

        // First FLASH_READY triggers the erase request and stays in Init.
        let result = session.on_frame(&from_target(Command::FlashReady, Fragment::zero(), [0, 0, 0, 0]));
        let decoded = decode(single(&result).data);
        assert_eq!(decoded.command, Command::FlashErase);
        assert_eq!(session.phase(), SessionPhase::Init);

        // Second FLASH_READY (post-erase) proceeds straight to writing,
        // without requesting another erase.
        let result = session.on_frame(&from_target(Command::FlashReady, Fragment::zero(), [0, 0, 0, 0]));
        let decoded = decode(single(&result).data);
        assert_eq!(decoded.command, Command::FlashData);
        assert_eq!(session.phase(), SessionPhase::Flashing);
    }

    #[test]
    fn read_address_error_during_verify_is_fatal() {
        let mut image = Image::empty();
        image.insert_block(0x0000, &[0xAA, 0xBB, 0xCC, 0xDD]);
        let mut session = Session::new(config(OperationMode::Flash, true), image);

        session.on_frame(&from_target(
            Command::BootloaderStart,
            Fragment::zero(),
            [0x1E, 0x95, 0x0F, PROTOCOL_VERSION],
        ));
        session.on_frame(&from_target(Command::FlashReady, Fragment::zero(), [0, 0, 0, 0]));
        session.on_frame(&from_target(Command::FlashReady, Fragment::new(4, 4), [0, 0, 0, 4]));
        session.on_frame(&from_target(Command::FlashDoneVerify, Fragment::zero(), [0, 0, 0, 0]));
        assert_eq!(session.phase(), SessionPhase::Reading);

        let result = session.on_frame(&from_target(Command::FlashReadAddressError, Fragment::zero(), [0, 0, 0, 0]));
        let decoded = decode(single(&result).data);
        assert_eq!(decoded.command, Command::StartApp);
        assert!(matches!(result.finished, Some(Err(FlashError::PeerError(_)))));
    }

    #[test]
    fn read_address_error_in_plain_read_mode_ends_the_read_cleanly() {
        let mut session = Session::new(config(OperationMode::Read, false), Image::empty());

        session.on_frame(&from_target(
            Command::BootloaderStart,
            Fragment::zero(),
            [0x1E, 0x95, 0x0F, PROTOCOL_VERSION],
        ));
        session.on_frame(&from_target(Command::FlashReady, Fragment::zero(), [0, 0, 0, 0]));
        session.on_frame(&from_target(
            Command::FlashAddressError,
            Fragment::zero(),
            [0x00, 0x00, 0x77, 0xFF],
        ));
        assert_eq!(session.phase(), SessionPhase::Reading);

        session.on_frame(&from_target(Command::FlashReadData, Fragment::new(4, 0), [1, 2, 3, 4]));

        // The target ran off the end of flash instead of replying with more
        // FLASH_READ_DATA; this is a natural end-of-read, not a failure.
        let result = session.on_frame(&from_target(
            Command::FlashReadAddressError,
            Fragment::zero(),
            [0, 0, 0, 0],
        ));
        let decoded = decode(single(&result).data);
        assert_eq!(decoded.command, Command::StartApp);
        match result.finished {
            Some(Ok(SessionOutput { read_bytes: Some(bytes) })) => {
                assert_eq!(bytes, vec![1, 2, 3, 4]);
            }
            other => panic!("expected a completed read buffer, got {other:?}"),
        }
    }
}
