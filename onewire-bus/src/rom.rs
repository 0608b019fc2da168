use crate::{consts::ROM_ID_SIZE, crc::crc8};
use core::{fmt, str::FromStr};

/// A 64-bit 1-Wire ROM ID (serial number).
///
/// | Byte | Description |
/// |------|-------------|
/// | 0 | Family code (e.g., 0x28 for DS18B20) |
/// | 1-6 | Unique serial number body |
/// | 7 | CRC-8 of bytes 0-6 |
///
/// Bytes are kept in transmission order. The derived ordering is byte-wise;
/// use [`RomId::search_order`] for the order a search pass discovers devices in.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct RomId([u8; ROM_ID_SIZE]);

/// Error parsing a [`RomId`] from text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RomParseError {
    /// The text does not hold exactly 16 hex digits.
    Length,
    /// A character is not a hex digit.
    Digit,
}

impl fmt::Display for RomParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Length => f.write_str("ROM ID must have 16 hex digits"),
            Self::Digit => f.write_str("ROM ID contains a non-hex character"),
        }
    }
}

impl RomId {
    /// The all-zero ROM ID, used as "no identity".
    pub const ZERO: RomId = RomId([0; ROM_ID_SIZE]);

    /// Wrap 8 raw bytes without validation.
    pub const fn new(bytes: [u8; ROM_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Build a ROM ID from family and body, computing the trailing CRC8.
    pub fn with_crc(head: [u8; 7]) -> Self {
        let mut bytes = [0; ROM_ID_SIZE];
        bytes[..7].copy_from_slice(&head);
        bytes[7] = crc8(&head);
        Self(bytes)
    }

    /// Build a ROM ID from the little-endian `u64` form returned by older search APIs.
    pub const fn from_u64(rom: u64) -> Self {
        Self(rom.to_le_bytes())
    }

    /// The little-endian `u64` form: family code in the low byte.
    pub const fn to_u64(&self) -> u64 {
        u64::from_le_bytes(self.0)
    }

    /// Raw bytes in transmission order.
    pub const fn as_bytes(&self) -> &[u8; ROM_ID_SIZE] {
        &self.0
    }

    /// Family code.
    pub const fn family(&self) -> u8 {
        self.0[0]
    }

    /// Trailing CRC8 byte.
    pub const fn crc(&self) -> u8 {
        self.0[7]
    }

    /// Whether every byte is zero.
    pub fn is_zero(&self) -> bool {
        self.0 == [0; ROM_ID_SIZE]
    }

    /// A device ID is valid when the CRC8 over all bytes is zero, the family
    /// code is not zero and the ID is not all ones.
    pub fn is_valid(&self) -> bool {
        crc8(&self.0) == 0 && self.0[0] != 0 && self.0 != [0xff; ROM_ID_SIZE]
    }

    /// Bit `index` (0..64) in transmission order, least significant bit of byte 0 first.
    pub fn bit(&self, index: u8) -> bool {
        self.0[(index / 8) as usize] & (1 << (index % 8)) != 0
    }

    /// Key ordering ROM IDs the way a search pass returns them.
    ///
    /// A search takes the 0 branch first at every discrepancy, in transmission
    /// order, so discovery order is numeric order of the bit-reversed ID.
    pub const fn search_order(&self) -> u64 {
        self.to_u64().reverse_bits()
    }
}

impl From<[u8; ROM_ID_SIZE]> for RomId {
    fn from(bytes: [u8; ROM_ID_SIZE]) -> Self {
        Self(bytes)
    }
}

impl From<RomId> for [u8; ROM_ID_SIZE] {
    fn from(rom: RomId) -> Self {
        rom.0
    }
}

impl AsRef<[u8]> for RomId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for RomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02X}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for RomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RomId({:02X}.", self.0[0])?;
        for b in &self.0[1..7] {
            write!(f, "{b:02X}")?;
        }
        write!(f, ".{:02X})", self.0[7])
    }
}

impl FromStr for RomId {
    type Err = RomParseError;

    /// Parses `10AA000000A0C7`-style text; `.` and `:` separators are ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; ROM_ID_SIZE];
        let mut nibbles = 0usize;
        for c in s.chars().filter(|c| *c != '.' && *c != ':') {
            let v = c.to_digit(16).ok_or(RomParseError::Digit)? as u8;
            if nibbles >= ROM_ID_SIZE * 2 {
                return Err(RomParseError::Length);
            }
            bytes[nibbles / 2] |= if nibbles % 2 == 0 { v << 4 } else { v };
            nibbles += 1;
        }
        if nibbles != ROM_ID_SIZE * 2 {
            return Err(RomParseError::Length);
        }
        Ok(Self(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;

    #[test]
    fn display_and_parse() {
        let rom = RomId::new([0x10, 0xaa, 0, 0, 0, 0, 0xa0, 0xc7]);
        assert_eq!(format!("{rom}"), "10AA00000000A0C7");
        assert_eq!(format!("{rom:?}"), "RomId(10.AA00000000A0.C7)");
        assert_eq!("10.AA00000000A0C7".parse::<RomId>(), Ok(rom));
        assert_eq!("10:aa:00:00:00:00:a0:c7".parse::<RomId>(), Ok(rom));
        assert_eq!("10AA".parse::<RomId>(), Err(RomParseError::Length));
        assert_eq!("10AA00000000A0CZ".parse::<RomId>(), Err(RomParseError::Digit));
    }

    #[test]
    fn validity() {
        assert!(RomId::new([0x10, 0xaa, 0, 0, 0, 0, 0xa0, 0xc7]).is_valid());
        assert!(RomId::new([0x28, 0xbb, 0, 0, 0, 0, 0xa0, 0x4e]).is_valid());
        assert!(!RomId::ZERO.is_valid());
        assert!(!RomId::new([0xff; 8]).is_valid());
        assert!(!RomId::new([0x10, 0xaa, 0, 0, 0, 0, 0xa0, 0xc6]).is_valid());
        assert!(RomId::with_crc([0x81, 1, 2, 3, 4, 5, 6]).is_valid());
    }

    #[test]
    fn bits_and_search_order() {
        let a = RomId::with_crc([0x28, 0, 0, 0, 0, 0, 0]);
        let b = RomId::with_crc([0x10, 0, 0, 0, 0, 0, 0]);
        // 0x28 has bit 0 clear, 0x10 too; bit 3 is set only in 0x28.
        assert!(a.bit(3) && !b.bit(3));
        assert!(b.search_order() < a.search_order());
        assert_eq!(RomId::from_u64(a.to_u64()), a);
    }
}
