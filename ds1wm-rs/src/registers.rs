use bitfield_struct::bitfield;

/// The six byte registers of the core, by offset from the base address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Register {
    /// Command register.
    Command = 0,
    /// Transmit/receive buffer.
    Data = 1,
    /// Interrupt flags; reading clears the presence detect flag.
    Interrupt = 2,
    /// Interrupt enables.
    InterruptEnable = 3,
    /// Clock divisor on the DS1WM, channel select on the K1WM.
    ClockDivisor = 4,
    /// Control register.
    Control = 5,
}

impl Register {
    /// The K1WM reuses the clock divisor register to select the output channel.
    pub const CHANNEL_SELECT: Register = Register::ClockDivisor;

    /// Byte offset from the base address.
    pub fn offset(self) -> usize {
        self as usize
    }
}

/// Bytes spanned by the register file.
pub const REGISTER_SPAN: usize = 6;

/// Command register.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct CommandRegister {
    /// 1WR: generate a reset pulse.
    pub reset: bool,
    /// SRA: search ROM accelerator.
    pub search_accelerator: bool,
    /// FOW: force the line low.
    pub force_line: bool,
    /// OW_IN: sampled line level.
    pub line_input: bool,
    #[bits(4)]
    __: u8,
}

/// Interrupt register.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct InterruptRegister {
    /// PD: a reset has completed.
    pub presence_detect: bool,
    /// PDR: presence result, clear when a device answered.
    pub presence_result: bool,
    /// TBE: transmit buffer empty.
    pub tx_buffer_empty: bool,
    /// TEMT: transmit shift register empty.
    pub tx_shift_empty: bool,
    /// RBF: receive buffer full.
    pub rx_buffer_full: bool,
    /// RSRF: receive shift register full.
    pub rx_shift_full: bool,
    /// OW_SHORT: the line was low when a slot started.
    pub short: bool,
    /// OW_LOW: the line is low.
    pub line_low: bool,
}

/// Control register.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct ControlRegister {
    /// LLM: long line timing.
    pub long_line: bool,
    /// PPM: presence pulse masking.
    pub presence_mask: bool,
    /// EN_FOW: allow forcing the line through the command register.
    pub force_enable: bool,
    /// STPEN: strong pullup enable.
    pub strong_pullup_enable: bool,
    /// STP_SPLY: strong pullup active while idle.
    pub strong_pullup: bool,
    /// BIT_CTL: single bit transfers instead of bytes.
    pub bit_mode: bool,
    /// OD: overdrive timing.
    pub overdrive: bool,
    __: bool,
}

/// Input clock frequencies and their divisor register values.
const CLOCK_DIVISORS: [(u32, u8); 24] = [
    (1_000_000, 0x80),
    (2_000_000, 0x84),
    (3_000_000, 0x81),
    (4_000_000, 0x88),
    (5_000_000, 0x82),
    (6_000_000, 0x85),
    (7_000_000, 0x83),
    (8_000_000, 0x8c),
    (10_000_000, 0x86),
    (12_000_000, 0x89),
    (14_000_000, 0x87),
    (16_000_000, 0x90),
    (20_000_000, 0x8a),
    (24_000_000, 0x8d),
    (28_000_000, 0x8b),
    (32_000_000, 0x94),
    (40_000_000, 0x8e),
    (48_000_000, 0x91),
    (56_000_000, 0x8f),
    (64_000_000, 0x98),
    (80_000_000, 0x92),
    (96_000_000, 0x95),
    (112_000_000, 0x93),
    (128_000_000, 0x9c),
];

/// Divisor for the highest table frequency not above `hz`.
///
/// Clocks below 1 MHz get the 1 MHz divisor.
pub fn clock_divisor(hz: u32) -> u8 {
    let (freq, divisor) = CLOCK_DIVISORS
        .iter()
        .rev()
        .find(|(f, _)| *f <= hz)
        .copied()
        .unwrap_or(CLOCK_DIVISORS[0]);
    log::debug!("clock of {hz} Hz uses the {freq} Hz divisor {divisor:#04x}");
    divisor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn divisor_table_lookup() {
        assert_eq!(clock_divisor(1_000_000), 0x80);
        assert_eq!(clock_divisor(10_000_000), 0x86);
        assert_eq!(clock_divisor(9_000_000), 0x8c);
        assert_eq!(clock_divisor(500_000), 0x80);
        assert_eq!(clock_divisor(250_000_000), 0x9c);
    }

    #[test]
    fn register_bits() {
        assert_eq!(CommandRegister::new().with_reset(true).into_bits(), 0x01);
        assert_eq!(
            CommandRegister::new().with_search_accelerator(true).into_bits(),
            0x02
        );
        let intr = InterruptRegister::from_bits(0x45);
        assert!(intr.presence_detect() && intr.tx_buffer_empty() && intr.short());
        assert!(!intr.presence_result());
        assert_eq!(ControlRegister::new().with_overdrive(true).into_bits(), 0x40);
        assert_eq!(Register::CHANNEL_SELECT.offset(), 4);
    }
}
