#![no_std]
#![deny(missing_docs)]

/*! # DS1WM
 *
 * Driver for the DS1WM 1-Wire master soft core and the K1WM, its variant with
 * several output channels behind one register file.
 *
 * The core is six byte registers, usually reached through a memory mapping.
 * Resets and byte transfers complete after fixed waits derived from the slot
 * timing; the interrupt register then tells presence, short and buffer state.
 * The driver is generic over register access through [`RegisterIo`] and
 * implements [`OneWireMaster`], searching with the core's search ROM accelerator.
 */

#[cfg(test)]
extern crate alloc;

pub use onewire_bus::{OneWireError, OneWireMaster, OneWireResult};
mod error;
mod onewire;
mod registers;
#[cfg(test)]
mod sim;

pub use error::Ds1wmError;
pub use registers::{
    CommandRegister, ControlRegister, InterruptRegister, REGISTER_SPAN, Register, clock_divisor,
};

use core::fmt::Debug;
use embedded_hal::delay::DelayNs;
use onewire_bus::{AnyDevices, BusSpeed};

/// Results of DS1WM-specific function calls.
pub type Ds1wmResult<T, E> = Result<T, Ds1wmError<E>>;

/// Byte access to the register file.
pub trait RegisterIo {
    /// Access error type.
    type Error: Debug;

    /// Reads a register.
    fn read(&mut self, reg: Register) -> Result<u8, Self::Error>;

    /// Writes a register.
    fn write(&mut self, reg: Register, value: u8) -> Result<(), Self::Error>;
}

impl<T: RegisterIo + ?Sized> RegisterIo for &mut T {
    type Error = T::Error;

    fn read(&mut self, reg: Register) -> Result<u8, Self::Error> {
        (**self).read(reg)
    }

    fn write(&mut self, reg: Register, value: u8) -> Result<(), Self::Error> {
        (**self).write(reg, value)
    }
}

/// Which core sits behind the registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// A DS1WM with its own clock divisor.
    Ds1wm {
        /// Input clock in Hz.
        frequency: u32,
    },
    /// One channel of a K1WM.
    K1wm {
        /// Output channel.
        channel: u8,
    },
}

/// A DS1WM or K1WM 1-Wire master.
///
/// Takes ownership of the register access (implementing [`RegisterIo`])
/// and a timer object implementing the [`DelayNs`] trait.
pub struct Ds1wm<R, D> {
    pub(crate) regs: R,
    pub(crate) delay: D,
    pub(crate) variant: Variant,
    pub(crate) long_line: bool,
    pub(crate) presence_mask: bool,
    pub(crate) speed: BusSpeed,
    pub(crate) any_devices: AnyDevices,
    pub(crate) open: bool,
}

/// Builder for creating a [`Ds1wm`] instance with custom configuration.
pub struct Ds1wmBuilder {
    variant: Variant,
    long_line: bool,
    presence_mask: Option<bool>,
    speed: BusSpeed,
}

impl Default for Ds1wmBuilder {
    fn default() -> Self {
        Ds1wmBuilder {
            variant: Variant::Ds1wm {
                frequency: 10_000_000,
            },
            long_line: false,
            presence_mask: None,
            speed: BusSpeed::Regular,
        }
    }
}

impl Ds1wmBuilder {
    /// Sets the input clock of a DS1WM, in Hz.
    pub fn with_frequency(mut self, frequency: u32) -> Self {
        self.variant = Variant::Ds1wm { frequency };
        self
    }

    /// Drives one channel of a K1WM instead of a DS1WM.
    pub fn with_channel(mut self, channel: u8) -> Self {
        self.variant = Variant::K1wm { channel };
        self
    }

    /// Enables long line timing.
    pub fn with_long_line(mut self, long_line: bool) -> Self {
        self.long_line = long_line;
        self
    }

    /// Masks presence pulses. Off for the DS1WM and on for the K1WM unless set.
    pub fn with_presence_mask(mut self, mask: bool) -> Self {
        self.presence_mask = Some(mask);
        self
    }

    /// Sets the initial bus speed. Flexible speed is not supported by the core.
    pub fn with_speed(mut self, speed: BusSpeed) -> Self {
        self.speed = speed;
        self
    }

    /// Configures the core.
    pub fn build<R: RegisterIo, D: DelayNs>(
        self,
        regs: R,
        delay: D,
    ) -> Ds1wmResult<Ds1wm<R, D>, R::Error> {
        let presence_mask = self
            .presence_mask
            .unwrap_or(matches!(self.variant, Variant::K1wm { .. }));
        let mut dev = Ds1wm {
            regs,
            delay,
            variant: self.variant,
            long_line: self.long_line,
            presence_mask,
            speed: self.speed,
            any_devices: AnyDevices::Unknown,
            open: false,
        };
        dev.open()?;
        Ok(dev)
    }
}

impl<R, D> Ds1wm<R, D> {
    /// The register access.
    pub fn registers(&mut self) -> &mut R {
        &mut self.regs
    }

    /// The core behind the registers.
    pub fn variant(&self) -> Variant {
        self.variant
    }

    /// Whether the master is set up.
    pub fn is_open(&self) -> bool {
        self.open
    }
}

impl<R: RegisterIo, D: DelayNs> Ds1wm<R, D> {
    /// Writes the control register (and divisor or channel) and checks it stuck.
    ///
    /// Reopening an open master sets it up again.
    pub fn open(&mut self) -> Ds1wmResult<(), R::Error> {
        self.open = true;
        if let Err(e) = self.setup() {
            log::debug!("DS1WM setup failed: {e:?}");
            self.open = false;
            return Err(e);
        }
        log::info!("opened {:?} bus master", self.variant);
        Ok(())
    }

    /// Marks the master closed. Closing a closed master only logs.
    pub fn release(&mut self) {
        if !self.open {
            log::debug!("DS1WM already closed");
            return;
        }
        self.open = false;
        self.any_devices = AnyDevices::Unknown;
        log::info!("closed {:?} bus master", self.variant);
    }

    pub(crate) fn setup(&mut self) -> Ds1wmResult<(), R::Error> {
        match self.variant {
            Variant::Ds1wm { .. } => self.write(Register::ClockDivisor, 0)?,
            Variant::K1wm { .. } => self.select_channel()?,
        }
        let control = ControlRegister::from_bits(self.read(Register::Control)?)
            .with_presence_mask(self.presence_mask)
            .with_force_enable(false)
            // The K1WM has no strong pullup.
            .with_strong_pullup_enable(matches!(self.variant, Variant::Ds1wm { .. }))
            .with_strong_pullup(false)
            .with_bit_mode(false)
            .with_overdrive(self.speed == BusSpeed::Overdrive)
            .with_long_line(self.long_line);
        self.write(Register::Control, control.into_bits())?;
        let read = self.read(Register::Control)?;
        if read != control.into_bits() {
            log::warn!(
                "DS1WM control register reads {read:#04x} after writing {:#04x}",
                control.into_bits()
            );
            return Err(Ds1wmError::ControlMismatch {
                wrote: control.into_bits(),
                read,
            });
        }
        self.write(Register::InterruptEnable, 0)?;
        if let Variant::Ds1wm { frequency } = self.variant {
            self.write(Register::ClockDivisor, clock_divisor(frequency))?;
        }
        Ok(())
    }

    /// Points the shared K1WM register file at this master's channel.
    pub(crate) fn select_channel(&mut self) -> Ds1wmResult<(), R::Error> {
        let Variant::K1wm { channel } = self.variant else {
            return Ok(());
        };
        log::trace!("K1WM selecting channel {channel}");
        self.write(Register::CHANNEL_SELECT, channel)?;
        if self.read(Register::CHANNEL_SELECT)? != channel {
            return Err(Ds1wmError::ChannelMismatch(channel));
        }
        Ok(())
    }

    /// Reads a register.
    pub fn read(&mut self, reg: Register) -> Ds1wmResult<u8, R::Error> {
        if !self.open {
            return Err(Ds1wmError::Closed);
        }
        self.regs.read(reg).map_err(Ds1wmError::Io)
    }

    /// Writes a register.
    pub fn write(&mut self, reg: Register, value: u8) -> Ds1wmResult<(), R::Error> {
        if !self.open {
            return Err(Ds1wmError::Closed);
        }
        log::trace!("DS1WM {reg:?} <- {value:#04x}");
        self.regs.write(reg, value).map_err(Ds1wmError::Io)
    }

    pub(crate) fn interrupts(&mut self) -> Ds1wmResult<InterruptRegister, R::Error> {
        Ok(InterruptRegister::from_bits(self.read(Register::Interrupt)?))
    }
}
