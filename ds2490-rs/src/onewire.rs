use crate::{
    CommFlags, CommOpcode, Ds2490, Ds2490Error, Ds2490Result, UsbIo, registers::FIFO_EACH,
};
use embedded_hal::delay::DelayNs;
use onewire_bus::{
    AnyDevices, BusSpeed, OneWireError, OneWireMaster, OneWireResult, ResetOutcome, RomId,
    SearchCursor,
    consts::{
        ONEWIRE_MATCH_ROM_CMD, ONEWIRE_MATCH_ROM_CMD_OD, ONEWIRE_SKIP_ROM_CMD,
        ONEWIRE_SKIP_ROM_CMD_OD, ROM_ID_BITS, ROM_ID_SIZE,
    },
};

const SEARCH_DEVICES_PER_PASS: u16 = 1;

impl<U: UsbIo, D: DelayNs> Ds2490<U, D> {
    /// One time slot with the `BIT_IO` command; returns the sampled bit.
    pub fn bit_io(&mut self, bit: bool) -> Ds2490Result<bool, U::Error> {
        let value = CommOpcode::BitIo.with(CommFlags::new().with_immediate(true).with_select(bit));
        self.comm(value, 0)?;
        self.status(Some(1))?;
        let mut buf = [0u8; 1];
        let n = self.read_data(&mut buf)?;
        Ok(n == 1 && buf[0] & 0x01 != 0)
    }

    fn reset_status(&mut self) -> Ds2490Result<ResetOutcome, U::Error> {
        let value = CommOpcode::Reset.with(
            CommFlags::new()
                .with_immediate(true)
                .with_select(true)
                .with_flush_on_error(true),
        );
        self.comm(value, self.speed as u16)?;
        let status = self.status(None)?;
        if status.short() {
            self.any_devices = AnyDevices::Unknown;
            return Ok(ResetOutcome::Short);
        }
        self.any_devices = (!status.no_presence()).into();
        Ok(ResetOutcome::Ok)
    }
}

/// Highest bit where devices disagreed and the 0 branch was taken.
fn last_discrepancy(rom: &[u8], discrepancies: &[u8]) -> Option<u8> {
    (0..ROM_ID_BITS).rev().find(|&bit| {
        let (byte, mask) = ((bit / 8) as usize, 1u8 << (bit % 8));
        discrepancies[byte] & mask != 0 && rom[byte] & mask == 0
    })
}

impl<U: UsbIo, D: DelayNs> OneWireMaster for Ds2490<U, D> {
    type Error = Ds2490Error<U::Error>;

    fn reset(&mut self) -> OneWireResult<ResetOutcome, Self::Error> {
        Ok(self.reset_status()?)
    }

    fn write_read(&mut self, out: &[u8], input: &mut [u8]) -> OneWireResult<usize, Self::Error> {
        if input.len() < out.len() {
            return Err(OneWireError::ShortRead {
                expected: out.len(),
                received: input.len(),
            });
        }
        let block = CommOpcode::BlockIo.with(CommFlags::new().with_immediate(true));
        for (i, chunk) in out.chunks(FIFO_EACH).enumerate() {
            let start = i * FIFO_EACH;
            self.write_data(chunk)?;
            self.comm(block, chunk.len() as u16)?;
            if self.status(Some(chunk.len()))?.short() {
                return Err(OneWireError::ShortCircuit);
            }
            let received = self.read_data(&mut input[start..start + chunk.len()])?;
            if received < chunk.len() {
                return Err(OneWireError::ShortRead {
                    expected: chunk.len(),
                    received,
                });
            }
        }
        Ok(out.len())
    }

    fn search_next(
        &mut self,
        cursor: &mut SearchCursor,
    ) -> OneWireResult<Option<RomId>, Self::Error> {
        match self.reset_status()? {
            ResetOutcome::Ok => {}
            ResetOutcome::Short => return Err(OneWireError::ShortCircuit),
            ResetOutcome::Error => return Err(OneWireError::ResetFailed),
        }
        if self.any_devices == AnyDevices::No {
            return Ok(None);
        }
        self.write_data(&cursor.replay_rom())?;
        let value = CommOpcode::SearchAccess.with(
            CommFlags::new()
                .with_immediate(true)
                .with_select(true)
                .with_flush_on_error(true)
                .with_return_status(true),
        );
        self.comm(value, (SEARCH_DEVICES_PER_PASS << 8) | cursor.command() as u16)?;
        let status = self.status(None)?;
        if status.short() {
            return Err(OneWireError::ShortCircuit);
        }
        let mut buf = [0u8; 2 * ROM_ID_SIZE];
        let available = status.data_in().min(buf.len());
        let received = if available == 0 {
            0
        } else {
            self.read_data(&mut buf[..available])?
        };
        let mut rom = [0u8; ROM_ID_SIZE];
        rom.copy_from_slice(&buf[..ROM_ID_SIZE]);
        match received {
            0 => Ok(None),
            ROM_ID_SIZE => {
                cursor.record(rom, None);
                Ok(Some(RomId::new(rom)))
            }
            n if n == 2 * ROM_ID_SIZE => {
                cursor.record(rom, last_discrepancy(&rom, &buf[ROM_ID_SIZE..]));
                Ok(Some(RomId::new(rom)))
            }
            n => Err(OneWireError::ShortRead {
                expected: 2 * ROM_ID_SIZE,
                received: n,
            }),
        }
    }

    fn any_devices(&self) -> AnyDevices {
        self.any_devices
    }

    fn speed(&self) -> BusSpeed {
        self.speed
    }

    fn set_speed(&mut self, speed: BusSpeed) -> OneWireResult<(), Self::Error> {
        self.apply_speed(speed)?;
        self.speed = speed;
        Ok(())
    }

    /// Uses the bridge's `MATCH_ACCESS` command (reset and Match ROM in one request).
    fn select(&mut self, rom: Option<&RomId>) -> OneWireResult<(), Self::Error> {
        let od = self.speed == BusSpeed::Overdrive;
        let Some(rom) = rom else {
            match self.reset_status()? {
                ResetOutcome::Ok => {}
                ResetOutcome::Short => return Err(OneWireError::ShortCircuit),
                ResetOutcome::Error => return Err(OneWireError::ResetFailed),
            }
            let skip = [if od { ONEWIRE_SKIP_ROM_CMD_OD } else { ONEWIRE_SKIP_ROM_CMD }];
            let mut echo = [0u8; 1];
            self.write_read(&skip, &mut echo)?;
            return if echo == skip {
                Ok(())
            } else {
                Err(OneWireError::EchoMismatch)
            };
        };
        self.write_data(rom.as_bytes())?;
        let value = CommOpcode::MatchAccess.with(
            CommFlags::new()
                .with_immediate(true)
                .with_reset(true)
                .with_select(od),
        );
        let cmd = if od { ONEWIRE_MATCH_ROM_CMD_OD } else { ONEWIRE_MATCH_ROM_CMD };
        self.comm(value, cmd as u16)?;
        let status = self.status(None)?;
        if status.short() {
            self.any_devices = AnyDevices::Unknown;
            return Err(OneWireError::ShortCircuit);
        }
        self.any_devices = (!status.no_presence()).into();
        Ok(())
    }

    fn close(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ControlCommand, Ds2490Builder, EP_DATA_IN, EP_DATA_OUT, EP_STATUS, ModeCommand,
        registers::{COMM_CMD, CONTROL_CMD, MODE_CMD},
        sim::SimDs2490,
    };
    use alloc::{vec, vec::Vec};
    use embedded_hal_mock::eh1::delay::NoopDelay;
    use onewire_bus::{
        Search, SearchKind, Transaction,
        sim::{SimBus, SimDevice},
    };

    const ROM_A: RomId = RomId::new([0x10, 0xaa, 0, 0, 0, 0, 0xa0, 0xc7]);
    const ROM_B: RomId = RomId::new([0x28, 0xbb, 0, 0, 0, 0, 0xa0, 0x4e]);

    fn adapter(devices: Vec<SimDevice>) -> Ds2490<SimDs2490, NoopDelay> {
        Ds2490Builder::default()
            .build(SimDs2490::new(SimBus::new(devices)), NoopDelay::new())
            .unwrap()
    }

    #[test]
    fn two_device_scenario() {
        let mut dev = adapter(vec![
            SimDevice::new(ROM_A).with_reply(vec![0x5a]),
            SimDevice::new(ROM_B).with_reply(vec![0xa5]),
        ]);
        assert_eq!(dev.reset(), Ok(ResetOutcome::Ok));
        assert_eq!(dev.any_devices(), AnyDevices::Yes);
        let found: Vec<RomId> = Search::new(&mut dev, SearchKind::Normal)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(found, vec![ROM_A, ROM_B]);
        let out = Transaction::new()
            .select(Some(ROM_A))
            .write(&[0xbe])
            .read(1)
            .run(&mut dev, &mut NoopDelay::new())
            .unwrap();
        assert_eq!(out.read(0), Some(&[0x5a][..]));
    }

    #[test]
    fn open_sequence() {
        let mut dev = adapter(vec![]);
        assert!(dev.is_open());
        let sim = dev.usb();
        assert!(sim.claimed);
        assert_eq!(sim.halts_cleared, vec![EP_DATA_IN, EP_DATA_OUT, EP_STATUS]);
        assert_eq!(
            &sim.controls[..4],
            &[
                (CONTROL_CMD, ControlCommand::ResetDevice as u16, 0),
                (MODE_CMD, ModeCommand::PulseEnable as u16, 0),
                (MODE_CMD, ModeCommand::SpeedChangeEnable as u16, 1),
                (MODE_CMD, ModeCommand::OneWireSpeed as u16, 0),
            ]
        );
    }

    #[test]
    fn empty_bus() {
        let mut dev = adapter(vec![]);
        assert_eq!(dev.reset(), Ok(ResetOutcome::Ok));
        assert_eq!(dev.any_devices(), AnyDevices::No);
        assert_eq!(Search::new(&mut dev, SearchKind::Normal).count(), 0);
    }

    #[test]
    fn short_is_reported() {
        let mut dev = adapter(vec![SimDevice::new(ROM_A)]);
        dev.usb().bus.set_short(true);
        assert_eq!(dev.reset(), Ok(ResetOutcome::Short));
        assert_eq!(dev.any_devices(), AnyDevices::Unknown);
        let mut cursor = SearchCursor::new(SearchKind::Normal);
        assert_eq!(
            onewire_bus::next_both(&mut dev, &mut cursor),
            Err(OneWireError::ShortCircuit)
        );
    }

    #[test]
    fn stalled_read_is_retried() {
        let mut dev = adapter(vec![SimDevice::new(ROM_A).with_reply(vec![0x33])]);
        dev.usb().stall_reads = 1;
        dev.select(Some(&ROM_A)).unwrap();
        let mut input = [0u8; 2];
        assert_eq!(dev.write_read(&[0xbe, 0xff], &mut input), Ok(2));
        assert_eq!(input, [0xbe, 0x33]);
        assert_eq!(dev.usb().halts_cleared.last(), Some(&EP_DATA_IN));
    }

    #[test]
    fn persistent_stall_fails() {
        let mut dev = adapter(vec![SimDevice::new(ROM_A)]);
        dev.usb().stall_reads = 10;
        let mut input = [0u8; 1];
        assert_eq!(
            dev.write_read(&[0xff], &mut input),
            Err(OneWireError::Other(Ds2490Error::Stall))
        );
    }

    #[test]
    fn never_idle_resets_device() {
        let mut dev = adapter(vec![SimDevice::new(ROM_A)]);
        dev.usb().busy = true;
        assert_eq!(dev.reset(), Err(OneWireError::Other(Ds2490Error::NeverIdle)));
        assert_eq!(
            dev.usb().controls.last(),
            Some(&(CONTROL_CMD, ControlCommand::ResetDevice as u16, 0))
        );
    }

    #[test]
    fn long_blocks_are_split() {
        let mut dev = adapter(vec![SimDevice::new(ROM_A)]);
        dev.select(None).unwrap();
        let out = [0xffu8; 150];
        let mut input = [0u8; 150];
        assert_eq!(dev.write_read(&out, &mut input), Ok(150));
        let blocks: Vec<u16> = dev
            .usb()
            .controls
            .iter()
            .filter(|(req, value, _)| *req == COMM_CMD && *value == 0x0075)
            .map(|(_, _, index)| *index)
            .collect();
        assert_eq!(blocks, vec![1, 64, 64, 22]);
    }

    #[test]
    fn unplugged_adapter() {
        let mut dev = adapter(vec![SimDevice::new(ROM_A)]);
        dev.usb().unplugged = true;
        let err = dev.reset().unwrap_err();
        assert_eq!(err, OneWireError::Other(Ds2490Error::Unplugged));
        if let OneWireError::Other(e) = err {
            assert!(e.needs_reconnect());
        }
    }

    #[test]
    fn double_close_is_harmless() {
        let mut dev = adapter(vec![]);
        dev.close();
        dev.close();
        assert!(!dev.usb().claimed);
        assert_eq!(dev.reset(), Err(OneWireError::Other(Ds2490Error::Closed)));
        dev.open().unwrap();
        assert_eq!(dev.reset(), Ok(ResetOutcome::Ok));
    }

    #[test]
    fn alarm_search_and_bit_io() {
        let mut dev = adapter(vec![
            SimDevice::new(ROM_A),
            SimDevice::new(ROM_B).with_alarm(true),
        ]);
        let found: Vec<RomId> = Search::new(&mut dev, SearchKind::Alarmed)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(found, vec![ROM_B]);
        dev.reset().unwrap();
        // a write-0 slot always samples low, a read slot on an idle line samples high
        assert!(!dev.bit_io(false).unwrap());
        dev.select(Some(&ROM_A)).unwrap();
        assert!(dev.bit_io(true).unwrap());
    }

    #[test]
    fn flexible_speed_sets_timing() {
        let mut dev = adapter(vec![]);
        dev.set_speed(BusSpeed::Flexible).unwrap();
        assert_eq!(dev.speed(), BusSpeed::Flexible);
        let modes: Vec<u16> = dev
            .usb()
            .controls
            .iter()
            .rev()
            .take(4)
            .map(|(_, value, _)| *value)
            .collect();
        assert_eq!(
            modes,
            vec![
                ModeCommand::DsoW0Recovery as u16,
                ModeCommand::Write1LowTime as u16,
                ModeCommand::PulldownSlewRate as u16,
                ModeCommand::OneWireSpeed as u16,
            ]
        );
    }

    #[test]
    fn discrepancy_decoding() {
        // bit 3 disagreed and 0 was taken, bit 9 disagreed and 1 was taken
        let rom = [0x00, 0x02, 0, 0, 0, 0, 0, 0];
        let disc = [0x08, 0x02, 0, 0, 0, 0, 0, 0];
        assert_eq!(last_discrepancy(&rom, &disc), Some(3));
        assert_eq!(last_discrepancy(&rom, &[0; 8]), None);
    }
}
