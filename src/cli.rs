//! # Command-line interface
//!
//! `clap`-derive argument parsing matching the flag table, plus the small
//! amount of parsing (`0x`-prefixed or decimal integers) that `clap`'s value
//! parsers don't cover directly.

use clap::Parser;

use crate::error::FlashError;

/// Host-side flashing tool for 8-bit microcontrollers running a CAN-bus
/// bootloader.
#[derive(Debug, Parser)]
#[command(name = "canboot-flash", version, about)]
pub struct Cli {
    /// Intel HEX file to flash (`-` for stdin), or the file read-back
    /// contents are written to with `--read` (`-` for stdout).
    #[arg(long)]
    pub file: Option<String>,

    /// CAN interface name.
    #[arg(long, default_value = "can0")]
    pub iface: String,

    /// Device alias (see the device catalog for accepted forms).
    #[arg(long)]
    pub partno: String,

    /// 16-bit session identifier, decimal or `0x`-prefixed hex.
    #[arg(long, value_parser = parse_u16)]
    pub mcuid: u16,

    /// Erase the whole flash before writing.
    #[arg(long)]
    pub erase: bool,

    /// Skip the verify pass after writing.
    #[arg(long)]
    pub no_verify: bool,

    /// Read the target's flash back into `file` instead of writing it.
    /// Accepts an optional decimal or `0x`-prefixed hex address that caps the
    /// highest address read back; omitted, the cap is the program size the
    /// target itself reports.
    #[arg(long, num_args = 0..=1, value_parser = parse_u32, default_missing_value = "0xFFFFFFFF")]
    pub read: Option<u32>,

    /// Proceed despite a protocol-version mismatch with the target.
    #[arg(long)]
    pub force: bool,

    /// One-shot `<can_id>#<hex_bytes>` frame sent immediately after opening
    /// the interface, before the session starts.
    #[arg(long)]
    pub reset: Option<String>,

    /// CAN-ID used for frames the host sends to the target.
    #[arg(long, value_parser = parse_u32, default_value = "0x1FFFFF01")]
    pub can_id_mcu: u32,

    /// CAN-ID the host expects frames from the target to arrive on.
    #[arg(long, value_parser = parse_u32, default_value = "0x1FFFFF02")]
    pub can_id_remote: u32,

    /// Use standard (11-bit) CAN identifiers instead of extended (29-bit).
    #[arg(long)]
    pub sff: bool,

    /// Enable the keep-alive pinger, with an optional interval in
    /// milliseconds (default 75 when the flag is given without a value).
    #[arg(long, num_args = 0..=1, default_missing_value = "75")]
    pub ping: Option<u64>,

    /// Increase log verbosity; repeatable (`-v` info, `-vv` debug, `-vvv`
    /// trace). Unset defaults to `warn`.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// `true` if this invocation reads flash contents back rather than
    /// writing an image.
    ///
    /// # Returns
    ///
    /// `true` if `--read` was given on the command line.
    pub fn is_read_mode(&self) -> bool {
        self.read.is_some()
    }

    /// Operator-supplied cap on the highest address to read back, if any
    /// (`--read` given with no value means "no cap", i.e. rely on the
    /// target-reported program size).
    ///
    /// # Returns
    ///
    /// `Some(address)` if `--read` was given with an explicit cap, `None`
    /// if `--read` was absent or given with no value.
    pub fn read_limit(&self) -> Option<u32> {
        self.read.filter(|&v| v != u32::MAX)
    }

    /// `log` filter level implied by the repeated `-v` flag.
    ///
    /// # Returns
    ///
    /// `Warn` with no `-v`, rising through `Info`, `Debug`, and `Trace` for
    /// each additional repetition.
    pub fn log_level(&self) -> log::LevelFilter {
        match self.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}

fn parse_u16(s: &str) -> Result<u16, FlashError> {
    parse_int(s).and_then(|v| {
        u16::try_from(v).map_err(|_| FlashError::Configuration(format!("'{s}' does not fit in 16 bits")))
    })
}

fn parse_u32(s: &str) -> Result<u32, FlashError> {
    parse_int(s).and_then(|v| {
        u32::try_from(v).map_err(|_| FlashError::Configuration(format!("'{s}' does not fit in 32 bits")))
    })
}

fn parse_int(s: &str) -> Result<u64, FlashError> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map_err(|e| FlashError::Configuration(format!("invalid hex number '{s}': {e}")))
    } else {
        s.parse::<u64>()
            .map_err(|e| FlashError::Configuration(format!("invalid number '{s}': {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_decimal_and_hex_forms_identically() {
        assert_eq!(parse_u32("66").unwrap(), 66);
        assert_eq!(parse_u32("0x42").unwrap(), 66);
        assert_eq!(parse_u32("0X42").unwrap(), 66);
    }

    #[test]
    fn rejects_values_that_overflow_the_target_width() {
        assert!(parse_u16("0x10000").is_err());
        assert!(parse_u32("0x100000000").is_err());
    }

    #[test]
    fn default_can_ids_match_the_documented_convention() {
        let cli = Cli::parse_from([
            "canboot-flash",
            "--partno",
            "m328p",
            "--mcuid",
            "0x2A",
            "--file",
            "fw.hex",
        ]);
        assert_eq!(cli.can_id_mcu, 0x1FFF_FF01);
        assert_eq!(cli.can_id_remote, 0x1FFF_FF02);
        assert!(!cli.is_read_mode());
    }

    #[test]
    fn ping_flag_without_value_uses_default_interval() {
        let cli = Cli::parse_from([
            "canboot-flash",
            "--partno",
            "m328p",
            "--mcuid",
            "42",
            "--file",
            "fw.hex",
            "--ping",
        ]);
        assert_eq!(cli.ping, Some(75));
    }

    #[test]
    fn read_flag_without_value_means_no_operator_cap() {
        let cli = Cli::parse_from([
            "canboot-flash",
            "--partno",
            "m328p",
            "--mcuid",
            "42",
            "--file",
            "out.hex",
            "--read",
        ]);
        assert!(cli.is_read_mode());
        assert_eq!(cli.read_limit(), None);
    }

    #[test]
    fn read_flag_with_value_caps_the_read() {
        let cli = Cli::parse_from([
            "canboot-flash",
            "--partno",
            "m328p",
            "--mcuid",
            "42",
            "--file",
            "out.hex",
            "--read",
            "0x6FFF",
        ]);
        assert!(cli.is_read_mode());
        assert_eq!(cli.read_limit(), Some(0x6FFF));
    }
}
