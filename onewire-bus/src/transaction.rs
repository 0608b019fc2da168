use crate::{
    OneWireCrc16, OneWireError, OneWireMaster, OneWireResult, ResetOutcome, RomId, crc8,
};
use alloc::vec::Vec;
use core::time::Duration;
use embedded_hal::delay::DelayNs;

/// One primitive operation of a [`Transaction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Reset and address one device, or every device with [`None`].
    Select(Option<RomId>),
    /// Bus reset. A short or a failed reset aborts the transaction.
    Reset,
    /// Send bytes and require the line to echo them.
    Write(Vec<u8>),
    /// Send bytes without checking the echo.
    Blind(Vec<u8>),
    /// Read this many bytes.
    Read(usize),
    /// Send bytes and return what the line carried.
    Modify(Vec<u8>),
    /// Require the data of the previous read or modify step to equal these bytes.
    Compare(Vec<u8>),
    /// Require the CRC8 over the last `len` bytes on the wire to be zero.
    Crc8 {
        /// Bytes covered, including the CRC byte.
        len: usize,
    },
    /// Require the seeded CRC16 over the last `len` bytes on the wire, which end in
    /// the inverted CRC16, to leave the residual.
    Crc16 {
        /// Bytes covered, including the two CRC bytes.
        len: usize,
        /// CRC seed.
        seed: u16,
    },
    /// Wait, e.g. for a conversion or an EEPROM write.
    Delay(Duration),
}

/// Data returned by the read and modify steps of a transaction, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionOutput {
    reads: Vec<Vec<u8>>,
}

impl TransactionOutput {
    /// All returned blocks.
    pub fn reads(&self) -> &[Vec<u8>] {
        &self.reads
    }

    /// Block returned by the `index`-th read or modify step.
    pub fn read(&self, index: usize) -> Option<&[u8]> {
        self.reads.get(index).map(Vec::as_slice)
    }

    /// Consumes the output.
    pub fn into_reads(self) -> Vec<Vec<u8>> {
        self.reads
    }
}

/// An ordered list of [`Step`]s executed as one unit.
///
/// Steps run strictly in order and the first failing step aborts the rest. After a
/// failure the bus state is unknown and the next transaction has to start with a
/// reset or a select.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    steps: Vec<Step>,
}

impl Transaction {
    /// An empty transaction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a step.
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Appends [`Step::Select`].
    pub fn select(self, rom: Option<RomId>) -> Self {
        self.step(Step::Select(rom))
    }

    /// Appends [`Step::Reset`].
    pub fn reset(self) -> Self {
        self.step(Step::Reset)
    }

    /// Appends [`Step::Write`].
    pub fn write(self, bytes: &[u8]) -> Self {
        self.step(Step::Write(bytes.to_vec()))
    }

    /// Appends [`Step::Blind`].
    pub fn blind(self, bytes: &[u8]) -> Self {
        self.step(Step::Blind(bytes.to_vec()))
    }

    /// Appends [`Step::Read`].
    pub fn read(self, len: usize) -> Self {
        self.step(Step::Read(len))
    }

    /// Appends [`Step::Modify`].
    pub fn modify(self, bytes: &[u8]) -> Self {
        self.step(Step::Modify(bytes.to_vec()))
    }

    /// Appends [`Step::Compare`].
    pub fn compare(self, expected: &[u8]) -> Self {
        self.step(Step::Compare(expected.to_vec()))
    }

    /// Appends [`Step::Crc8`].
    pub fn crc8(self, len: usize) -> Self {
        self.step(Step::Crc8 { len })
    }

    /// Appends [`Step::Crc16`].
    pub fn crc16(self, len: usize, seed: u16) -> Self {
        self.step(Step::Crc16 { len, seed })
    }

    /// Appends [`Step::Delay`].
    pub fn delay(self, duration: Duration) -> Self {
        self.step(Step::Delay(duration))
    }

    /// Write `out`, read `len` data bytes plus the device's CRC16, and check the
    /// CRC16 over everything.
    pub fn write_read_crc16(self, out: &[u8], len: usize, seed: u16) -> Self {
        let total = out.len() + len + 2;
        self.write(out).read(len + 2).crc16(total, seed)
    }

    /// The steps.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Executes the steps on `master`.
    ///
    /// # Errors
    /// The error of the first failing step. No later step is run.
    pub fn run<M: OneWireMaster + ?Sized, D: DelayNs>(
        &self,
        master: &mut M,
        delay: &mut D,
    ) -> OneWireResult<TransactionOutput, M::Error> {
        let mut output = TransactionOutput::default();
        let mut wire: Vec<u8> = Vec::new();
        for (index, step) in self.steps.iter().enumerate() {
            if let Err(e) = run_step(master, delay, step, &mut wire, &mut output) {
                log::debug!("transaction aborted at step {index} ({step:?})");
                return Err(e);
            }
        }
        Ok(output)
    }
}

fn run_step<M: OneWireMaster + ?Sized, D: DelayNs>(
    master: &mut M,
    delay: &mut D,
    step: &Step,
    wire: &mut Vec<u8>,
    output: &mut TransactionOutput,
) -> OneWireResult<(), M::Error> {
    match step {
        Step::Select(rom) => {
            wire.clear();
            master.select(rom.as_ref())
        }
        Step::Reset => {
            wire.clear();
            match master.reset()? {
                ResetOutcome::Ok => Ok(()),
                ResetOutcome::Short => Err(OneWireError::ShortCircuit),
                ResetOutcome::Error => Err(OneWireError::ResetFailed),
            }
        }
        Step::Write(bytes) => {
            let echo = exchange(master, bytes)?;
            wire.extend_from_slice(&echo);
            if echo != *bytes {
                return Err(OneWireError::EchoMismatch);
            }
            Ok(())
        }
        Step::Blind(bytes) => {
            exchange(master, bytes)?;
            wire.extend_from_slice(bytes);
            Ok(())
        }
        Step::Read(len) => {
            let data = exchange(master, &alloc::vec![0xff; *len])?;
            wire.extend_from_slice(&data);
            output.reads.push(data);
            Ok(())
        }
        Step::Modify(bytes) => {
            let data = exchange(master, bytes)?;
            wire.extend_from_slice(&data);
            output.reads.push(data);
            Ok(())
        }
        Step::Compare(expected) => match output.reads.last() {
            Some(data) if data == expected => Ok(()),
            _ => Err(OneWireError::CompareMismatch),
        },
        Step::Crc8 { len } => {
            let tail = tail(wire, *len)?;
            if crc8(tail) == 0 {
                Ok(())
            } else {
                Err(OneWireError::InvalidCrc)
            }
        }
        Step::Crc16 { len, seed } => {
            if OneWireCrc16::validate(tail(wire, *len)?, *seed) {
                Ok(())
            } else {
                Err(OneWireError::InvalidCrc)
            }
        }
        Step::Delay(duration) => {
            let us = duration.as_micros().min(u32::MAX as u128) as u32;
            delay.delay_us(us);
            Ok(())
        }
    }
}

fn exchange<M: OneWireMaster + ?Sized>(
    master: &mut M,
    out: &[u8],
) -> OneWireResult<Vec<u8>, M::Error> {
    let mut input = alloc::vec![0u8; out.len()];
    let received = master.write_read(out, &mut input)?;
    if received < out.len() {
        return Err(OneWireError::ShortRead {
            expected: out.len(),
            received,
        });
    }
    Ok(input)
}

fn tail<E>(wire: &[u8], len: usize) -> OneWireResult<&[u8], E> {
    wire.len()
        .checked_sub(len)
        .map(|start| &wire[start..])
        .ok_or(OneWireError::InvalidCrc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        BitBanged,
        sim::{SimBus, SimDevice},
    };
    use alloc::vec;
    use embedded_hal_mock::eh1::delay::NoopDelay;

    const ROM: RomId = RomId::new([0x10, 0xaa, 0, 0, 0, 0, 0xa0, 0xc7]);

    fn memory_device(reply: Vec<u8>) -> BitBanged<SimBus> {
        BitBanged::new(SimBus::new(vec![SimDevice::new(ROM).with_reply(reply)]))
    }

    #[test]
    fn reads_return_in_order() {
        let mut bus = memory_device(vec![0x12, 0x34, 0x56]);
        let out = Transaction::new()
            .select(Some(ROM))
            .write(&[0xbe])
            .read(1)
            .read(2)
            .run(&mut bus, &mut NoopDelay::new())
            .unwrap();
        assert_eq!(out.reads(), &[vec![0x12], vec![0x34, 0x56]]);
        assert_eq!(bus.inner().written(), &[0xbe, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn crc16_guarded_read_passes() {
        let cmd = [0xaa, 0x00, 0x00];
        let data = [0x01, 0x02, 0x03, 0x04];
        let mut wire = cmd.to_vec();
        wire.extend_from_slice(&data);
        let trailer = OneWireCrc16::trailer(&wire, 0);
        let mut reply = vec![0xff, 0xff];
        reply.extend_from_slice(&data);
        reply.extend_from_slice(&trailer);
        let mut bus = memory_device(reply);
        let out = Transaction::new()
            .select(Some(ROM))
            .write_read_crc16(&cmd, data.len(), 0)
            .run(&mut bus, &mut NoopDelay::new())
            .unwrap();
        assert_eq!(&out.read(0).unwrap()[..4], &data);
    }

    #[test]
    fn failing_crc16_stops_the_transaction() {
        // the device answers with a wrong CRC
        let mut bus = memory_device(vec![0xff, 0xff, 0x01, 0x02, 0x00, 0x00]);
        let result = Transaction::new()
            .select(Some(ROM))
            .write(&[0xaa, 0x00, 0x00])
            .read(4)
            .crc16(7, 0)
            .write(&[0x55])
            .run(&mut bus, &mut NoopDelay::new());
        assert_eq!(result, Err(OneWireError::InvalidCrc));
        assert_eq!(
            bus.inner().written(),
            &[0xaa, 0x00, 0x00, 0xff, 0xff, 0xff, 0xff]
        );
    }

    #[test]
    fn echo_mismatch_aborts() {
        let mut bus = memory_device(vec![0x0f]);
        let result = Transaction::new()
            .select(Some(ROM))
            .write(&[0x44, 0xff])
            .read(1)
            .run(&mut bus, &mut NoopDelay::new());
        assert_eq!(result, Err(OneWireError::EchoMismatch));
    }

    #[test]
    fn compare_checks_previous_read() {
        let mut bus = memory_device(vec![0xc3]);
        let ok = Transaction::new()
            .select(Some(ROM))
            .write(&[0xf0])
            .read(1)
            .compare(&[0xc3])
            .run(&mut bus, &mut NoopDelay::new());
        assert!(ok.is_ok());
        let bad = Transaction::new()
            .select(Some(ROM))
            .write(&[0xf0])
            .read(1)
            .compare(&[0x3c])
            .run(&mut bus, &mut NoopDelay::new());
        assert_eq!(bad, Err(OneWireError::CompareMismatch));
    }

    #[test]
    fn crc8_step_checks_scratchpad() {
        let mut scratchpad = vec![0x50, 0x05, 0x4b, 0x46, 0x7f, 0xff, 0x0c, 0x10];
        scratchpad.push(crc8(&scratchpad));
        let mut reply = scratchpad.clone();
        let mut bus = memory_device(reply.clone());
        let out = Transaction::new()
            .select(Some(ROM))
            .write(&[0xbe])
            .read(9)
            .crc8(9)
            .delay(Duration::from_millis(1))
            .run(&mut bus, &mut NoopDelay::new())
            .unwrap();
        assert_eq!(out.read(0), Some(&scratchpad[..]));
        reply[8] ^= 0x40;
        let mut bus = memory_device(reply);
        let bad = Transaction::new()
            .select(Some(ROM))
            .write(&[0xbe])
            .read(9)
            .crc8(9)
            .run(&mut bus, &mut NoopDelay::new());
        assert_eq!(bad, Err(OneWireError::InvalidCrc));
    }

    #[test]
    fn select_absent_device_reads_ones() {
        let mut bus = memory_device(vec![0x00]);
        let other = RomId::with_crc([0x28, 1, 2, 3, 4, 5, 6]);
        let out = Transaction::new()
            .select(Some(other))
            .write(&[0xbe])
            .read(1)
            .run(&mut bus, &mut NoopDelay::new())
            .unwrap();
        assert_eq!(out.read(0), Some(&[0xff][..]));
    }

    #[test]
    fn short_aborts_reset_step() {
        let mut bus = BitBanged::new(SimBus::new(vec![]).with_short(true));
        let result = Transaction::new()
            .reset()
            .write(&[0xcc])
            .run(&mut bus, &mut NoopDelay::new());
        assert_eq!(result, Err(OneWireError::ShortCircuit));
    }
}
