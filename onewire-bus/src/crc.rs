/// Residual left by [`OneWireCrc16`] over data followed by its inverted CRC16, little-endian.
pub const CRC16_RESIDUAL: u16 = 0xb001;

#[cfg(feature = "crc-table")]
const CRC8_TABLE: [u8; 256] = {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x1 == 0x1 { (crc >> 1) ^ 0x8c } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

#[derive(Debug, Default, Clone, Copy)]
/// Calculate CRC-8 used in 1-Wire communications (x⁸+x⁵+x⁴+1).
pub struct OneWireCrc(u8);

impl OneWireCrc {
    /// Start a CRC with a running value from an earlier computation.
    pub fn with_seed(seed: u8) -> Self {
        Self(seed)
    }

    /// Get the current CRC value
    pub fn value(&self) -> u8 {
        self.0
    }

    /// Update the CRC with the incoming byte.
    #[cfg(feature = "crc-table")]
    pub fn update(&mut self, byte: u8) {
        self.0 = CRC8_TABLE[(self.0 ^ byte) as usize];
    }

    /// Update the CRC with the incoming byte.
    #[cfg(not(feature = "crc-table"))]
    pub fn update(&mut self, byte: u8) {
        let mut crc = self.0 ^ byte;
        for _ in 0..8 {
            if crc & 0x1 == 0x1 {
                crc = (crc >> 1) ^ 0x8c;
            } else {
                crc >>= 1;
            }
        }
        self.0 = crc;
    }

    /// Update the CRC with a run of bytes.
    pub fn update_slice(&mut self, bytes: &[u8]) {
        bytes.iter().for_each(|&b| self.update(b));
    }

    /// Validate a sequence of bytes where the last byte is the 1-Wire CRC of
    /// the previous bytes.
    pub fn validate(sequence: &[u8]) -> bool {
        crc8(sequence) == 0x0
    }
}

/// CRC8 of `bytes` starting from zero.
pub fn crc8(bytes: &[u8]) -> u8 {
    let mut crc = OneWireCrc::default();
    crc.update_slice(bytes);
    crc.value()
}

#[derive(Debug, Default, Clone, Copy)]
/// Calculate the CRC-16 used by 1-Wire memory devices (x¹⁶+x¹⁵+x²+1).
///
/// Devices transmit the inverted CRC, least significant byte first. Running the
/// CRC over the data and the received CRC bytes leaves [`CRC16_RESIDUAL`].
pub struct OneWireCrc16(u16);

impl OneWireCrc16 {
    /// Start a CRC with the given seed. Devices that chain pages seed with the page number.
    pub fn with_seed(seed: u16) -> Self {
        Self(seed)
    }

    /// Get the current CRC value
    pub fn value(&self) -> u16 {
        self.0
    }

    /// Update the CRC with the incoming byte.
    pub fn update(&mut self, byte: u8) {
        let mut crc = self.0 ^ byte as u16;
        for _ in 0..8 {
            if crc & 0x1 == 0x1 {
                crc = (crc >> 1) ^ 0xa001;
            } else {
                crc >>= 1;
            }
        }
        self.0 = crc;
    }

    /// Update the CRC with a run of bytes.
    pub fn update_slice(&mut self, bytes: &[u8]) {
        bytes.iter().for_each(|&b| self.update(b));
    }

    /// The two bytes a device appends after `bytes`: the inverted CRC, little-endian.
    pub fn trailer(bytes: &[u8], seed: u16) -> [u8; 2] {
        (!crc16(bytes, seed)).to_le_bytes()
    }

    /// Validate data followed by its inverted CRC16.
    pub fn validate(sequence: &[u8], seed: u16) -> bool {
        crc16(sequence, seed) == CRC16_RESIDUAL
    }
}

/// CRC16 of `bytes` starting from `seed`.
pub fn crc16(bytes: &[u8], seed: u16) -> u16 {
    let mut crc = OneWireCrc16::with_seed(seed);
    crc.update_slice(bytes);
    crc.value()
}
