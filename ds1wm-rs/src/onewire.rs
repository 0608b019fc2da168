use crate::{CommandRegister, Ds1wm, Ds1wmError, Ds1wmResult, InterruptRegister, Register, RegisterIo};
use embedded_hal::delay::DelayNs;
use onewire_bus::{
    AnyDevices, BusSpeed, OneWireError, OneWireMaster, OneWireResult, ResetOutcome, RomId,
    SearchCursor,
    consts::{ROM_ID_BITS, ROM_ID_SIZE},
};

/// Reset low time plus presence wait, regular speed.
const RESET_WAIT_NS: u32 = 636_000 + 626_000;
/// Reset low time plus presence wait, overdrive.
const RESET_WAIT_OD_NS: u32 = 74_000 + 63_000;
/// One time slot, regular speed.
const SLOT_NS: u32 = 86_000;
/// One time slot, overdrive.
const SLOT_OD_NS: u32 = 15_000;
/// Byte times to wait for a buffer flag.
const BUFFER_WAITS: usize = 5;
/// Accelerator code of a ROM bit taken as 0 where devices disagreed.
const DISCREPANCY_ZERO: u8 = 0x01;

/// Pairs of bits per search accelerator byte: one pair per ROM bit.
const SEARCH_BYTES: usize = 2 * ROM_ID_SIZE;

impl<R: RegisterIo, D: DelayNs> Ds1wm<R, D> {
    fn overdrive(&self) -> bool {
        self.speed == BusSpeed::Overdrive
    }

    fn wait_for_reset(&mut self) -> Ds1wmResult<ResetOutcome, R::Error> {
        let wait = if self.overdrive() { RESET_WAIT_OD_NS } else { RESET_WAIT_NS };
        self.delay.delay_ns(wait);
        let intr = self.interrupts()?;
        if !intr.presence_detect() {
            return Ok(ResetOutcome::Error);
        }
        if intr.short() {
            self.any_devices = AnyDevices::Unknown;
            return Ok(ResetOutcome::Short);
        }
        self.any_devices = (!intr.presence_result()).into();
        Ok(ResetOutcome::Ok)
    }

    fn reset_pulse(&mut self) -> Ds1wmResult<ResetOutcome, R::Error> {
        self.select_channel()?;
        // Clears a stale presence detect flag.
        self.interrupts()?;
        self.write(
            Register::Command,
            CommandRegister::new().with_reset(true).into_bits(),
        )?;
        match self.wait_for_reset()? {
            ResetOutcome::Error => {
                log::debug!("DS1WM reset not done yet, waiting once more");
                self.wait_for_reset()
            }
            outcome => Ok(outcome),
        }
    }

    fn wait_for(
        &mut self,
        flag: impl Fn(InterruptRegister) -> bool,
    ) -> Ds1wmResult<(), R::Error> {
        if flag(self.interrupts()?) {
            return Ok(());
        }
        let byte_time = 8 * if self.overdrive() { SLOT_OD_NS } else { SLOT_NS };
        for _ in 0..BUFFER_WAITS {
            self.delay.delay_ns(byte_time);
            if flag(self.interrupts()?) {
                return Ok(());
            }
        }
        Err(Ds1wmError::Timeout)
    }

    /// Sends one byte and returns the byte sampled meanwhile.
    pub fn touch_byte(&mut self, byte: u8) -> Ds1wmResult<u8, R::Error> {
        self.wait_for(|i| i.tx_buffer_empty())?;
        self.write(Register::Data, byte)?;
        self.wait_for(|i| i.rx_buffer_full())?;
        self.read(Register::Data)
    }

    fn set_accelerator(&mut self, on: bool) -> Ds1wmResult<(), R::Error> {
        self.write(
            Register::Command,
            CommandRegister::new().with_search_accelerator(on).into_bits(),
        )
    }

    fn accelerated_search(
        &mut self,
        cursor: &SearchCursor,
    ) -> Ds1wmResult<[u8; SEARCH_BYTES], R::Error> {
        let mut pairs = [0u8; SEARCH_BYTES];
        for bit in 0..ROM_ID_BITS {
            if cursor.direction(bit) {
                pairs[bit as usize / 4] |= 0x02 << (2 * (bit % 4));
            }
        }
        self.touch_byte(cursor.command())?;
        self.set_accelerator(true)?;
        let result = self.send_pairs(&mut pairs);
        self.set_accelerator(false)?;
        result.map(|_| pairs)
    }

    fn send_pairs(&mut self, pairs: &mut [u8]) -> Ds1wmResult<(), R::Error> {
        for p in pairs.iter_mut() {
            *p = self.touch_byte(*p)?;
        }
        Ok(())
    }
}

/// The ROM bits and the highest bit taken as 0 at a discrepancy.
fn decode_pairs(pairs: &[u8; SEARCH_BYTES]) -> ([u8; ROM_ID_SIZE], Option<u8>) {
    let mut rom = [0u8; ROM_ID_SIZE];
    let mut last_zero = None;
    for bit in 0..ROM_ID_BITS {
        let pair = (pairs[bit as usize / 4] >> (2 * (bit % 4))) & 0x03;
        if pair >> 1 != 0 {
            rom[bit as usize / 8] |= 1 << (bit % 8);
        }
        if pair == DISCREPANCY_ZERO {
            last_zero = Some(bit);
        }
    }
    (rom, last_zero)
}

impl<R: RegisterIo, D: DelayNs> OneWireMaster for Ds1wm<R, D> {
    type Error = Ds1wmError<R::Error>;

    fn reset(&mut self) -> OneWireResult<ResetOutcome, Self::Error> {
        Ok(self.reset_pulse()?)
    }

    fn write_read(&mut self, out: &[u8], input: &mut [u8]) -> OneWireResult<usize, Self::Error> {
        if input.len() < out.len() {
            return Err(OneWireError::ShortRead {
                expected: out.len(),
                received: input.len(),
            });
        }
        for (o, i) in out.iter().zip(input.iter_mut()) {
            *i = self.touch_byte(*o)?;
        }
        Ok(out.len())
    }

    fn search_next(
        &mut self,
        cursor: &mut SearchCursor,
    ) -> OneWireResult<Option<RomId>, Self::Error> {
        match self.reset_pulse()? {
            ResetOutcome::Ok => {}
            ResetOutcome::Short => return Err(OneWireError::ShortCircuit),
            ResetOutcome::Error => return Err(OneWireError::ResetFailed),
        }
        if self.any_devices == AnyDevices::No {
            return Ok(None);
        }
        let pairs = self.accelerated_search(cursor)?;
        let (rom, last_zero) = decode_pairs(&pairs);
        if rom == [0xff; ROM_ID_SIZE] {
            return Ok(None);
        }
        cursor.record(rom, last_zero);
        Ok(Some(RomId::new(rom)))
    }

    fn any_devices(&self) -> AnyDevices {
        self.any_devices
    }

    fn speed(&self) -> BusSpeed {
        self.speed
    }

    fn set_speed(&mut self, speed: BusSpeed) -> OneWireResult<(), Self::Error> {
        if speed == BusSpeed::Flexible {
            return Err(OneWireError::InvalidSpeed);
        }
        let previous = self.speed;
        self.speed = speed;
        if let Err(e) = self.setup() {
            self.speed = previous;
            return Err(e.into());
        }
        Ok(())
    }

    fn close(&mut self) {
        self.release();
    }
}
