use bitfield_struct::bitfield;

/// `bRequest` of a control command.
pub(crate) const CONTROL_CMD: u8 = 0x00;
/// `bRequest` of a communication command.
pub(crate) const COMM_CMD: u8 = 0x01;
/// `bRequest` of a mode command.
pub(crate) const MODE_CMD: u8 = 0x02;

/// Result byte: a device signalled an interrupt (e.g. alarm) during reset.
pub(crate) const ONEWIRE_DEVICE_DETECT: u8 = 0xa5;
/// Result bit: no presence pulse.
pub(crate) const RESULT_NRS: u8 = 0x01;
/// Result bit: 1-Wire short.
pub(crate) const RESULT_SH: u8 = 0x02;

/// Bytes of the fixed part of a status packet.
pub(crate) const STATUS_REGISTERS: usize = 16;
/// Largest status packet: registers plus up to 16 result bytes.
pub(crate) const STATUS_PACKET_MAX: usize = 32;

/// Bytes moved per block I/O command.
pub(crate) const FIFO_EACH: usize = 64;

/// Control command codes (`wValue` of a [`CONTROL_CMD`] request).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ControlCommand {
    /// Reset the device state machine, flush buffers, restore power-on defaults.
    ResetDevice = 0x0000,
    /// Start executing queued communication commands.
    StartExe = 0x0001,
    /// Resume a halted execution.
    ResumeExe = 0x0002,
    /// Halt when idle.
    HaltExeIdle = 0x0003,
    /// Halt when the current command is done.
    HaltExeDone = 0x0004,
    /// Flush the communication command FIFO.
    FlushCommCmds = 0x0007,
    /// Flush the data FIFOs.
    FlushCvBuffer = 0x0008,
    /// Flush the command monitor buffer.
    FlushCmtBuffer = 0x0009,
    /// Read back queued communication commands.
    GetCommCmds = 0x000a,
}

/// Mode command codes (`wValue` of a [`MODE_CMD`] request, parameter in `wIndex`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ModeCommand {
    /// Enable strong pullup / programming pulse.
    PulseEnable = 0x0000,
    /// Allow communication commands to change the bus speed.
    SpeedChangeEnable = 0x0001,
    /// Bus speed: 0 regular, 1 flexible, 2 overdrive.
    OneWireSpeed = 0x0002,
    /// Strong pullup duration.
    StrongPullupDuration = 0x0003,
    /// Pulldown slew rate for flexible speed.
    PulldownSlewRate = 0x0004,
    /// Programming pulse duration.
    ProgPulseDuration = 0x0005,
    /// Write-1 low time for flexible speed.
    Write1LowTime = 0x0006,
    /// Data sample offset and write-0 recovery time for flexible speed.
    DsoW0Recovery = 0x0007,
}

/// Pulldown slew rate code 3: 1.37 V/µs.
pub(crate) const FLEX_SLEW_1P37: u16 = 0x03;
/// Write-1 low time code 2: 10 µs.
pub(crate) const FLEX_W1LT_10US: u16 = 0x02;
/// Data sample offset code 5: 8 µs.
pub(crate) const FLEX_DSO_8US: u16 = 0x05;

/// Communication command opcodes (`wValue` of a [`COMM_CMD`] request, without flags).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CommOpcode {
    /// 1-Wire reset; `wIndex` holds the speed.
    Reset = 0x0042,
    /// One time slot; the `D` flag is the bit to send.
    BitIo = 0x0020,
    /// Eight time slots; `wIndex` holds the byte.
    ByteIo = 0x0052,
    /// Block transfer of `wIndex` bytes from EP2 to EP3.
    BlockIo = 0x0074,
    /// Reset and Match ROM with the ROM ID written to EP2.
    MatchAccess = 0x0064,
    /// Accelerated search; `wIndex` is device count (high) and ROM command (low).
    SearchAccess = 0x00f4,
}

/// Flag bits of a communication command.
///
/// Several bits change meaning with the opcode; the names follow the datasheet's
/// most common use.
#[bitfield(u16)]
#[derive(PartialEq, Eq)]
pub struct CommFlags {
    /// IM: execute immediately.
    pub immediate: bool,
    #[bits(2)]
    __: u8,
    /// SE (reset: change speed), SM (search: search mode), D (bit I/O: data bit).
    pub select: bool,
    #[bits(4)]
    __: u8,
    /// RST: reset before the command.
    pub reset: bool,
    /// ICP: intermediate command packet, no result on success.
    pub intermediate: bool,
    /// NTF: always report a result.
    pub notify: bool,
    /// F: flush buffers on error.
    pub flush_on_error: bool,
    /// SPU: strong pullup after the command.
    pub strong_pullup: bool,
    /// DT: discrepancy/data toggle.
    pub toggle: bool,
    /// RTS: return discrepancy information (search) / program pulse select.
    pub return_status: bool,
    __: bool,
}

impl CommOpcode {
    /// Full `wValue` for this opcode with the given flags.
    pub fn with(self, flags: CommFlags) -> u16 {
        self as u16 | flags.into_bits()
    }
}

/// Device status flags, byte 8 of a status packet.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct StatusFlags {
    /// SPUA: strong pullup to 5V is active.
    pub strong_pullup_active: bool,
    /// PRGA: a 12V programming pulse is being generated.
    pub program_pulse_active: bool,
    /// 12VP: external 12V programming voltage is present.
    pub program_voltage_present: bool,
    /// PMOD: powered from USB and external sources.
    pub external_power: bool,
    /// HALT: the device is halted.
    pub halted: bool,
    /// IDLE: the device is idle.
    pub idle: bool,
    __: bool,
    /// EP0F: the endpoint 0 FIFO overflowed; needs a device reset.
    pub ep0_fifo_full: bool,
}

/// One status packet read from EP1.
#[derive(Debug, Clone, Copy)]
pub struct StatusPacket {
    raw: [u8; STATUS_PACKET_MAX],
    len: usize,
}

impl StatusPacket {
    /// Parses a packet of `len` bytes.
    pub(crate) fn new(mut raw: [u8; STATUS_PACKET_MAX], mut len: usize) -> Self {
        // Some hosts buffer two packets into one read.
        if len == STATUS_PACKET_MAX && raw[..6] == raw[STATUS_REGISTERS..STATUS_REGISTERS + 6] {
            raw.copy_within(STATUS_REGISTERS.., 0);
            len = STATUS_REGISTERS;
        }
        Self { raw, len }
    }

    /// Enable flags (byte 0).
    pub fn enable_flags(&self) -> u8 {
        self.raw[0]
    }

    /// Current 1-Wire speed (byte 1).
    pub fn speed(&self) -> u8 {
        self.raw[1]
    }

    /// Device status flags (byte 8).
    pub fn flags(&self) -> StatusFlags {
        StatusFlags::from_bits(self.raw[8])
    }

    /// Bytes waiting in the EP3 FIFO (byte 13).
    pub fn data_in(&self) -> usize {
        self.raw[13] as usize
    }

    /// Result bytes after the registers.
    pub fn results(&self) -> &[u8] {
        if self.len > STATUS_REGISTERS {
            &self.raw[STATUS_REGISTERS..self.len]
        } else {
            &[]
        }
    }

    /// A result reported a short.
    pub fn short(&self) -> bool {
        self.results()
            .iter()
            .any(|&r| r != ONEWIRE_DEVICE_DETECT && r & RESULT_SH != 0)
    }

    /// A result reported a reset without presence pulse.
    pub fn no_presence(&self) -> bool {
        self.results()
            .iter()
            .any(|&r| r != ONEWIRE_DEVICE_DETECT && r & RESULT_NRS != 0)
    }
}
