//! # Device catalog
//!
//! A small static table mapping a part-number alias to the 3-byte device
//! signature the target's `BOOTLOADER_START` message carries, and to the
//! flash size in bytes used to compute the bootloader region during a read.

/// A known device: its 3-byte signature and total flash size in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Device {
    /// Signature bytes as reported by `BOOTLOADER_START` bytes 4..6.
    pub signature: [u8; 3],
    /// Total flash size in bytes, including the bootloader region.
    pub flash_size: u32,
}

/// Signature and flash size for the zero/unknown device.
///
/// Returned by [`lookup`] for any alias not in the table. The state machine
/// will then reject `BOOTLOADER_START` because no real target reports an
/// all-zero signature; callers should treat an unknown alias as a
/// configuration error before a session starts rather than relying on this
/// fallback.
pub const UNKNOWN_DEVICE: Device = Device {
    signature: [0, 0, 0],
    flash_size: 0,
};

// (aliases, signature, flash size in bytes)
const TABLE: &[(&[&str], [u8; 3], u32)] = &[
    (
        &["m328p", "mega328p", "atmega328p"],
        [0x1E, 0x95, 0x0F],
        32 * 1024,
    ),
    (
        &["m328", "mega328", "atmega328"],
        [0x1E, 0x95, 0x14],
        32 * 1024,
    ),
    (&["m168", "mega168", "atmega168"], [0x1E, 0x94, 0x06], 16 * 1024),
    (
        &["m16u2", "mega16u2", "atmega16u2"],
        [0x1E, 0x94, 0x89],
        16 * 1024,
    ),
    (
        &["m32u4", "mega32u4", "atmega32u4"],
        [0x1E, 0x95, 0x87],
        32 * 1024,
    ),
    (
        &["m2560", "mega2560", "atmega2560"],
        [0x1E, 0x98, 0x01],
        256 * 1024,
    ),
];

/// Look up a device by its part-number alias, case-insensitively.
///
/// Short (`m328p`), medium (`mega328p`) and long (`atmega328p`) forms are all
/// accepted.
///
/// # Arguments
///
/// * `partno` - The operator-supplied part number, in any casing
///
/// # Returns
///
/// The matching [`Device`], or [`UNKNOWN_DEVICE`] if `partno` is not in the
/// table.
pub fn lookup(partno: &str) -> Device {
    let needle = partno.to_ascii_lowercase();
    for (aliases, signature, flash_size) in TABLE {
        if aliases.iter().any(|alias| *alias == needle) {
            return Device {
                signature: *signature,
                flash_size: *flash_size,
            };
        }
    }
    UNKNOWN_DEVICE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_short_medium_and_long_aliases_to_the_same_device() {
        let short = lookup("m328p");
        let medium = lookup("mega328p");
        let long = lookup("atmega328p");
        assert_eq!(short, medium);
        assert_eq!(medium, long);
        assert_eq!(short.signature, [0x1E, 0x95, 0x0F]);
        assert_eq!(short.flash_size, 32 * 1024);
    }

    #[test]
    fn lookup_is_case_insensitive() {
        assert_eq!(lookup("M328P"), lookup("m328p"));
        assert_eq!(lookup("ATmega328P"), lookup("atmega328p"));
    }

    #[test]
    fn unknown_alias_resolves_to_zero_device() {
        assert_eq!(lookup("not-a-real-part"), UNKNOWN_DEVICE);
    }
}
