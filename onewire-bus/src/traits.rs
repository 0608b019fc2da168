use crate::{
    OneWireError, OneWireResult, RomId, SearchCursor,
    consts::{
        ONEWIRE_MATCH_ROM_CMD, ONEWIRE_MATCH_ROM_CMD_OD, ONEWIRE_SKIP_ROM_CMD,
        ONEWIRE_SKIP_ROM_CMD_OD, ROM_ID_SIZE,
    },
};

/// Status reported by a bit-level bus reset.
pub trait OneWireStatus {
    /// Whether a device answered the reset with a presence pulse.
    fn presence(&self) -> bool;

    /// Whether the bus was found shorted to ground.
    fn shortcircuit(&self) -> bool;

    /// Logic level of the line, if the bridge samples it.
    fn logic_level(&self) -> Option<bool> {
        None
    }

    /// Branch direction taken by the last triplet, if the bridge reports it.
    fn direction(&self) -> Option<bool> {
        None
    }
}

/// Trait for bit-level 1-Wire communication.
/// This trait defines the basic operations of a simple bridge, such as resetting the bus,
/// writing and reading bytes, and writing and reading bits. Wrap an implementation in
/// [`BitBanged`](crate::BitBanged) to use it as a [`OneWireMaster`].
pub trait OneWire {
    /// The status type returned by the reset operation.
    type Status: OneWireStatus;
    /// The error type of the underlying hardware.
    type BusError;

    /// Resets the 1-Wire bus and returns the status of the bus.
    fn reset(&mut self) -> OneWireResult<Self::Status, Self::BusError>;

    /// Writes a byte to the 1-Wire bus, least significant bit first.
    fn write_byte(&mut self, byte: u8) -> OneWireResult<(), Self::BusError>;

    /// Reads a byte from the 1-Wire bus.
    fn read_byte(&mut self) -> OneWireResult<u8, Self::BusError>;

    /// Writes a single bit to the 1-Wire bus.
    fn write_bit(&mut self, bit: bool) -> OneWireResult<(), Self::BusError>;

    /// Reads a single bit from the 1-Wire bus.
    fn read_bit(&mut self) -> OneWireResult<bool, Self::BusError>;

    /// Generates one time slot and returns the sampled line level.
    ///
    /// A 1 bit is a read slot: the line reads 0 if any device pulls it low.
    /// A 0 bit holds the line low and always reads 0.
    fn touch_bit(&mut self, bit: bool) -> OneWireResult<bool, Self::BusError> {
        if bit {
            self.read_bit()
        } else {
            self.write_bit(false)?;
            Ok(false)
        }
    }

    /// Generates eight time slots, least significant bit first, returning the sampled byte.
    fn touch_byte(&mut self, byte: u8) -> OneWireResult<u8, Self::BusError> {
        let mut out = 0;
        for i in 0..8 {
            if self.touch_bit(byte & (1 << i) != 0)? {
                out |= 1 << i;
            }
        }
        Ok(out)
    }

    /// Generates two read time slots and one write time slot, the step of the
    /// [1-Wire search algorithm](https://www.analog.com/en/resources/app-notes/1wire-search-algorithm.html).
    ///
    /// The write slot depends on the two reads and on `direction`:
    /// reads 0/1 write 0, reads 1/0 write 1, reads 0/0 write `direction`,
    /// reads 1/1 (no device) write 1.
    ///
    /// # Returns
    /// The id bit, the complement bit and the direction written.
    ///
    /// # Errors
    /// [`OneWireError::Unimplemented`] unless the bridge has a triplet command. The search
    /// then falls back to [`read_bit`](OneWire::read_bit) and [`write_bit`](OneWire::write_bit).
    fn read_triplet(
        &mut self,
        _direction: bool,
    ) -> OneWireResult<(bool, bool, bool), Self::BusError> {
        Err(OneWireError::Unimplemented)
    }

    /// Check if the 1-Wire bus is in overdrive mode.
    fn get_overdrive_mode(&mut self) -> bool;

    /// Set the 1-Wire bus to overdrive mode.
    fn set_overdrive_mode(&mut self, _enable: bool) -> OneWireResult<(), Self::BusError> {
        Err(OneWireError::Unimplemented)
    }

    /// Addresses devices on the 1-Wire bus.
    /// Pass [`None`] to skip ROM addressing and address all devices on the bus.
    fn address(&mut self, rom: Option<&RomId>) -> OneWireResult<(), Self::BusError> {
        let od = self.get_overdrive_mode();
        let cmd = match (rom.is_some(), od) {
            (true, false) => ONEWIRE_MATCH_ROM_CMD,
            (true, true) => ONEWIRE_MATCH_ROM_CMD_OD,
            (false, false) => ONEWIRE_SKIP_ROM_CMD,
            (false, true) => ONEWIRE_SKIP_ROM_CMD_OD,
        };
        self.reset()?;
        self.write_byte(cmd)?;
        if let Some(rom) = rom {
            for &b in rom.as_bytes() {
                self.write_byte(b)?;
            }
        }
        Ok(())
    }
}

/// Outcome of a bus reset that reached the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    /// Reset completed; check [`OneWireMaster::any_devices`] for presence.
    Ok,
    /// The bus is held low.
    Short,
    /// The adapter answered but the reset did not complete.
    Error,
}

/// Cached result of the presence detect in the last reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnyDevices {
    /// At least one device answered.
    Yes,
    /// No presence pulse.
    No,
    /// Not known, before the first reset or after a short.
    #[default]
    Unknown,
}

impl From<bool> for AnyDevices {
    fn from(present: bool) -> Self {
        if present { Self::Yes } else { Self::No }
    }
}

/// 1-Wire bus speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum BusSpeed {
    /// Standard timing.
    #[default]
    Regular = 0,
    /// Standard speed with relaxed slew and sample timing, for long lines.
    Flexible = 1,
    /// Overdrive timing.
    Overdrive = 2,
}

/// Byte-level contract of a 1-Wire bus master.
///
/// Every transport (USB, memory-mapped, netlink, bit-banged bridges) provides this
/// interface. Search and transactions are built on it.
pub trait OneWireMaster {
    /// Transport error type.
    type Error;

    /// Issues a bus reset.
    ///
    /// Updates the cached [`any_devices`](OneWireMaster::any_devices) flag.
    ///
    /// # Errors
    /// Transport failures. A short or a failed reset is reported through [`ResetOutcome`].
    fn reset(&mut self) -> OneWireResult<ResetOutcome, Self::Error>;

    /// Sends `out` and fills `input` with the line state sampled during each byte.
    ///
    /// `input` must be at least as long as `out`. Sending `0xff` reads a byte.
    /// Returns the number of bytes received.
    fn write_read(&mut self, out: &[u8], input: &mut [u8]) -> OneWireResult<usize, Self::Error>;

    /// Advances a search pass by one device.
    ///
    /// `Ok(Some(rom))` is the next device, `Ok(None)` ends the pass. Use
    /// [`next_both`](crate::next_both) instead of calling this directly; it adds
    /// ROM ID validation and termination handling.
    fn search_next(
        &mut self,
        cursor: &mut SearchCursor,
    ) -> OneWireResult<Option<RomId>, Self::Error>;

    /// Presence result of the last reset.
    fn any_devices(&self) -> AnyDevices;

    /// Current bus speed.
    fn speed(&self) -> BusSpeed {
        BusSpeed::Regular
    }

    /// Changes the bus speed.
    fn set_speed(&mut self, speed: BusSpeed) -> OneWireResult<(), Self::Error> {
        if speed == BusSpeed::Regular {
            Ok(())
        } else {
            Err(OneWireError::InvalidSpeed)
        }
    }

    /// Resets the bus and addresses one device (Match ROM) or all of them (Skip ROM).
    ///
    /// The ROM bytes are checked against their echo.
    fn select(&mut self, rom: Option<&RomId>) -> OneWireResult<(), Self::Error> {
        match self.reset()? {
            ResetOutcome::Ok => {}
            ResetOutcome::Short => return Err(OneWireError::ShortCircuit),
            ResetOutcome::Error => return Err(OneWireError::ResetFailed),
        }
        let od = self.speed() == BusSpeed::Overdrive;
        match rom {
            Some(rom) => {
                let mut out = [0u8; ROM_ID_SIZE + 1];
                out[0] = if od { ONEWIRE_MATCH_ROM_CMD_OD } else { ONEWIRE_MATCH_ROM_CMD };
                out[1..].copy_from_slice(rom.as_bytes());
                let mut echo = [0u8; ROM_ID_SIZE + 1];
                self.write_read(&out, &mut echo)?;
                if echo != out {
                    return Err(OneWireError::EchoMismatch);
                }
            }
            None => {
                let cmd = [if od { ONEWIRE_SKIP_ROM_CMD_OD } else { ONEWIRE_SKIP_ROM_CMD }];
                let mut echo = [0u8; 1];
                self.write_read(&cmd, &mut echo)?;
                if echo != cmd {
                    return Err(OneWireError::EchoMismatch);
                }
            }
        }
        Ok(())
    }

    /// Releases the adapter. Calling it on a closed adapter does nothing.
    fn close(&mut self) {}
}

impl<M: OneWireMaster + ?Sized> OneWireMaster for &mut M {
    type Error = M::Error;

    fn reset(&mut self) -> OneWireResult<ResetOutcome, Self::Error> {
        (**self).reset()
    }

    fn write_read(&mut self, out: &[u8], input: &mut [u8]) -> OneWireResult<usize, Self::Error> {
        (**self).write_read(out, input)
    }

    fn search_next(
        &mut self,
        cursor: &mut SearchCursor,
    ) -> OneWireResult<Option<RomId>, Self::Error> {
        (**self).search_next(cursor)
    }

    fn any_devices(&self) -> AnyDevices {
        (**self).any_devices()
    }

    fn speed(&self) -> BusSpeed {
        (**self).speed()
    }

    fn set_speed(&mut self, speed: BusSpeed) -> OneWireResult<(), Self::Error> {
        (**self).set_speed(speed)
    }

    fn select(&mut self, rom: Option<&RomId>) -> OneWireResult<(), Self::Error> {
        (**self).select(rom)
    }

    fn close(&mut self) {
        (**self).close()
    }
}
