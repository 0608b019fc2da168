//! A simulated 1-Wire bus for driver tests.
//!
//! [`SimBus`] models the wire at time-slot level: every slot is the wired-AND of the
//! master and the devices pulling the line low. Devices follow the ROM command layer
//! (Search ROM, Alarm Search, Match ROM, Skip ROM). After addressing, the first byte
//! is taken as the function command and the selected devices then drive their reply
//! bytes onto read slots.

use crate::{
    OneWire, OneWireError, OneWireResult, OneWireStatus, RomId,
    consts::{
        ONEWIRE_CONDITIONAL_SEARCH_CMD, ONEWIRE_MATCH_ROM_CMD, ONEWIRE_MATCH_ROM_CMD_OD,
        ONEWIRE_SEARCH_CMD, ONEWIRE_SKIP_ROM_CMD, ONEWIRE_SKIP_ROM_CMD_OD, ROM_ID_BITS,
    },
};
use alloc::vec::Vec;
use core::convert::Infallible;

/// A device on the simulated bus.
#[derive(Debug, Clone)]
pub struct SimDevice {
    rom: RomId,
    alarm: bool,
    reply: Vec<u8>,
}

impl SimDevice {
    /// A device with the given ROM ID, no alarm and no reply data.
    pub fn new(rom: RomId) -> Self {
        Self {
            rom,
            alarm: false,
            reply: Vec::new(),
        }
    }

    /// Sets the alarm flag seen by Alarm Search.
    pub fn with_alarm(mut self, alarm: bool) -> Self {
        self.alarm = alarm;
        self
    }

    /// Bytes the device drives after its function command, one per byte slot.
    pub fn with_reply(mut self, reply: Vec<u8>) -> Self {
        self.reply = reply;
        self
    }

    /// ROM ID of the device.
    pub fn rom(&self) -> RomId {
        self.rom
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    RomCommand,
    Search { bit: u8, slot: u8 },
    Match { bit: u8 },
    Function { byte: usize },
}

/// Reset status of the simulated bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimStatus {
    /// Presence pulse seen.
    pub presence: bool,
    /// Line held low.
    pub short: bool,
}

impl OneWireStatus for SimStatus {
    fn presence(&self) -> bool {
        self.presence
    }

    fn shortcircuit(&self) -> bool {
        self.short
    }
}

/// A simulated 1-Wire bus.
#[derive(Debug, Clone)]
pub struct SimBus {
    devices: Vec<SimDevice>,
    active: Vec<bool>,
    phase: Phase,
    shift: u8,
    nbits: u8,
    short: bool,
    triplet: bool,
    overdrive: bool,
    written: Vec<u8>,
    resets: usize,
}

impl SimBus {
    /// A bus with the given devices.
    pub fn new(devices: Vec<SimDevice>) -> Self {
        let active = alloc::vec![false; devices.len()];
        Self {
            devices,
            active,
            phase: Phase::Idle,
            shift: 0,
            nbits: 0,
            short: false,
            triplet: true,
            overdrive: false,
            written: Vec::new(),
            resets: 0,
        }
    }

    /// Holds the line low, so every reset reports a short.
    pub fn with_short(mut self, short: bool) -> Self {
        self.short = short;
        self
    }

    /// Makes [`OneWire::read_triplet`] unimplemented.
    pub fn without_triplet(mut self) -> Self {
        self.triplet = false;
        self
    }

    /// Sets or clears the short circuit.
    pub fn set_short(&mut self, short: bool) {
        self.short = short;
    }

    /// Devices on the bus.
    pub fn devices(&self) -> &[SimDevice] {
        &self.devices
    }

    /// Attaches a device.
    pub fn attach(&mut self, device: SimDevice) {
        self.devices.push(device);
        self.active.push(false);
    }

    /// Detaches the device with the given ROM ID.
    pub fn detach(&mut self, rom: &RomId) {
        if let Some(i) = self.devices.iter().position(|d| d.rom == *rom) {
            self.devices.remove(i);
            self.active.remove(i);
        }
    }

    /// Function-phase bytes written by the master since the last reset.
    pub fn written(&self) -> &[u8] {
        &self.written
    }

    /// Number of reset pulses seen.
    pub fn resets(&self) -> usize {
        self.resets
    }

    /// Issues a reset pulse.
    pub fn reset_pulse(&mut self) -> SimStatus {
        self.resets += 1;
        self.shift = 0;
        self.nbits = 0;
        self.written.clear();
        if self.short {
            self.phase = Phase::Idle;
            return SimStatus {
                presence: false,
                short: true,
            };
        }
        self.phase = Phase::RomCommand;
        self.active.iter_mut().for_each(|a| *a = true);
        SimStatus {
            presence: !self.devices.is_empty(),
            short: false,
        }
    }

    /// One time slot: returns the sampled line level.
    pub fn slot(&mut self, master: bool) -> bool {
        if self.short {
            return false;
        }
        match self.phase {
            Phase::Idle => master,
            Phase::RomCommand => {
                if let Some(cmd) = self.shift_in(master) {
                    self.rom_command(cmd);
                }
                master
            }
            Phase::Search { bit, slot } => {
                let line = match slot {
                    0 => master && self.participants().all(|d| d.rom.bit(bit)),
                    1 => master && self.participants().all(|d| !d.rom.bit(bit)),
                    _ => {
                        self.drop_mismatched(bit, master);
                        master
                    }
                };
                self.phase = match (slot, bit + 1) {
                    (0 | 1, _) => Phase::Search {
                        bit,
                        slot: slot + 1,
                    },
                    (_, ROM_ID_BITS) => Phase::Function { byte: 0 },
                    (_, next) => Phase::Search { bit: next, slot: 0 },
                };
                line
            }
            Phase::Match { bit } => {
                self.drop_mismatched(bit, master);
                self.phase = if bit + 1 == ROM_ID_BITS {
                    Phase::Function { byte: 0 }
                } else {
                    Phase::Match { bit: bit + 1 }
                };
                master
            }
            Phase::Function { byte } => {
                let mask = 1u8 << self.nbits;
                let mut line = master;
                if byte > 0 {
                    for (d, _) in self
                        .devices
                        .iter()
                        .zip(self.active.iter())
                        .filter(|(_, a)| **a)
                    {
                        if d.reply.get(byte - 1).is_some_and(|r| r & mask == 0) {
                            line = false;
                        }
                    }
                }
                if let Some(b) = self.shift_in(master) {
                    self.written.push(b);
                    self.phase = Phase::Function { byte: byte + 1 };
                }
                line
            }
        }
    }

    /// Eight time slots, least significant bit first.
    pub fn touch(&mut self, byte: u8) -> u8 {
        let mut out = 0;
        for i in 0..8 {
            if self.slot(byte & (1 << i) != 0) {
                out |= 1 << i;
            }
        }
        out
    }

    /// A search triplet: two read slots and the write slot the hardware would choose.
    pub fn triplet(&mut self, direction: bool) -> (bool, bool, bool) {
        let id_bit = self.slot(true);
        let complement_bit = self.slot(true);
        let taken = match (id_bit, complement_bit) {
            (false, false) => direction,
            (a, b) if a != b => a,
            _ => true,
        };
        self.slot(taken);
        (id_bit, complement_bit, taken)
    }

    fn participants(&self) -> impl Iterator<Item = &SimDevice> {
        self.devices
            .iter()
            .zip(self.active.iter())
            .filter(|(_, a)| **a)
            .map(|(d, _)| d)
    }

    fn drop_mismatched(&mut self, bit: u8, master: bool) {
        for (d, a) in self.devices.iter().zip(self.active.iter_mut()) {
            if d.rom.bit(bit) != master {
                *a = false;
            }
        }
    }

    fn shift_in(&mut self, bit: bool) -> Option<u8> {
        if bit {
            self.shift |= 1 << self.nbits;
        }
        self.nbits += 1;
        if self.nbits == 8 {
            let b = self.shift;
            self.shift = 0;
            self.nbits = 0;
            Some(b)
        } else {
            None
        }
    }

    fn rom_command(&mut self, cmd: u8) {
        self.phase = match cmd {
            ONEWIRE_SEARCH_CMD => Phase::Search { bit: 0, slot: 0 },
            ONEWIRE_CONDITIONAL_SEARCH_CMD => {
                for (d, a) in self.devices.iter().zip(self.active.iter_mut()) {
                    *a = d.alarm;
                }
                Phase::Search { bit: 0, slot: 0 }
            }
            ONEWIRE_MATCH_ROM_CMD | ONEWIRE_MATCH_ROM_CMD_OD => Phase::Match { bit: 0 },
            ONEWIRE_SKIP_ROM_CMD | ONEWIRE_SKIP_ROM_CMD_OD => Phase::Function { byte: 0 },
            _ => Phase::Idle,
        };
    }
}

impl OneWire for SimBus {
    type Status = SimStatus;
    type BusError = Infallible;

    fn reset(&mut self) -> OneWireResult<Self::Status, Self::BusError> {
        Ok(self.reset_pulse())
    }

    fn write_byte(&mut self, byte: u8) -> OneWireResult<(), Self::BusError> {
        self.touch(byte);
        Ok(())
    }

    fn read_byte(&mut self) -> OneWireResult<u8, Self::BusError> {
        Ok(self.touch(0xff))
    }

    fn write_bit(&mut self, bit: bool) -> OneWireResult<(), Self::BusError> {
        self.slot(bit);
        Ok(())
    }

    fn read_bit(&mut self) -> OneWireResult<bool, Self::BusError> {
        Ok(self.slot(true))
    }

    fn touch_bit(&mut self, bit: bool) -> OneWireResult<bool, Self::BusError> {
        Ok(self.slot(bit))
    }

    fn read_triplet(
        &mut self,
        direction: bool,
    ) -> OneWireResult<(bool, bool, bool), Self::BusError> {
        if !self.triplet {
            return Err(OneWireError::Unimplemented);
        }
        Ok(self.triplet(direction))
    }

    fn get_overdrive_mode(&mut self) -> bool {
        self.overdrive
    }

    fn set_overdrive_mode(&mut self, enable: bool) -> OneWireResult<(), Self::BusError> {
        self.overdrive = enable;
        Ok(())
    }
}
