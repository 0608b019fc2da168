//! A DS1WM register file in software, on top of a simulated 1-Wire bus.

use crate::{CommandRegister, InterruptRegister, Register, RegisterIo};
use onewire_bus::sim::SimBus;

pub(crate) struct SimDs1wm {
    pub bus: SimBus,
    pub control: u8,
    /// Clock divisor, or the channel of a K1WM.
    pub clock: u8,
    pub accelerator: bool,
    interrupt: InterruptRegister,
    rx: u8,
    /// Reads of the interrupt register that miss the presence detect flag after a reset.
    pub slow_resets: usize,
    pending_slow: usize,
    pub stuck_control: bool,
    pub stalled: bool,
}

impl SimDs1wm {
    pub fn new(bus: SimBus) -> Self {
        Self {
            bus,
            control: 0,
            clock: 0,
            accelerator: false,
            interrupt: InterruptRegister::new().with_tx_buffer_empty(true),
            rx: 0,
            slow_resets: 0,
            pending_slow: 0,
            stuck_control: false,
            stalled: false,
        }
    }

    fn command(&mut self, value: u8) {
        let cmd = CommandRegister::from_bits(value);
        self.accelerator = cmd.search_accelerator();
        if cmd.reset() {
            let status = self.bus.reset_pulse();
            self.interrupt = self
                .interrupt
                .with_presence_detect(true)
                .with_presence_result(!status.presence)
                .with_short(status.short);
            self.pending_slow = self.slow_resets;
        }
    }

    fn transmit(&mut self, value: u8) {
        if self.stalled {
            self.interrupt.set_tx_buffer_empty(false);
            return;
        }
        self.rx = if self.accelerator {
            let mut out = 0;
            for pair in 0..4 {
                let direction = value & (0x02 << (2 * pair)) != 0;
                let (id, complement, taken) = self.bus.triplet(direction);
                let flag = id == complement;
                out |= ((taken as u8) << 1 | flag as u8) << (2 * pair);
            }
            out
        } else {
            self.bus.touch(value)
        };
        self.interrupt.set_rx_buffer_full(true);
    }
}

impl RegisterIo for SimDs1wm {
    type Error = ();

    fn read(&mut self, reg: Register) -> Result<u8, Self::Error> {
        Ok(match reg {
            Register::Command => 0,
            Register::Data => {
                self.interrupt.set_rx_buffer_full(false);
                self.rx
            }
            Register::Interrupt => {
                let value = if self.pending_slow > 0 {
                    self.pending_slow -= 1;
                    self.interrupt.with_presence_detect(false)
                } else {
                    self.interrupt
                };
                if value.presence_detect() {
                    self.interrupt.set_presence_detect(false);
                }
                value.into_bits()
            }
            Register::InterruptEnable => 0,
            Register::ClockDivisor => self.clock,
            Register::Control => self.control,
        })
    }

    fn write(&mut self, reg: Register, value: u8) -> Result<(), Self::Error> {
        match reg {
            Register::Command => self.command(value),
            Register::Data => self.transmit(value),
            Register::ClockDivisor => self.clock = value,
            Register::Control if !self.stuck_control => self.control = value,
            _ => {}
        }
        Ok(())
    }
}
