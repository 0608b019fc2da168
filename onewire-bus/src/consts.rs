//! ROM-level command bytes and bus constants.

/// Command to match a specific ROM address (regular speed).
pub const ONEWIRE_MATCH_ROM_CMD: u8 = 0x55;

/// Command to skip ROM addressing and talk to every device (regular speed).
pub const ONEWIRE_SKIP_ROM_CMD: u8 = 0xcc;

/// The Overdrive-Match ROM command followed by a 64-bit
/// ROM sequence transmitted at overdrive speed addresses a
/// single device and sets it to overdrive mode. Devices
/// return to standard speed at the next reset pulse of at
/// least 480μs.
pub const ONEWIRE_MATCH_ROM_CMD_OD: u8 = 0x69;

/// Overdrive-Skip ROM: addresses every device and sets them
/// to overdrive mode until the next standard-speed reset.
pub const ONEWIRE_SKIP_ROM_CMD_OD: u8 = 0x3c;

/// Command to search for devices on the 1-Wire bus.
pub const ONEWIRE_SEARCH_CMD: u8 = 0xf0;

/// Command to search for devices in alarm state on the 1-Wire bus.
pub const ONEWIRE_CONDITIONAL_SEARCH_CMD: u8 = 0xec;

/// Number of bytes in a ROM ID.
pub const ROM_ID_SIZE: usize = 8;

/// Number of bits in a ROM ID, and so the number of search triplets per pass.
pub const ROM_ID_BITS: u8 = 64;
