#![no_std]
#![deny(missing_docs)]

/*! # DS2490
 *
 * Driver for the DS2490 USB to 1-Wire bridge found in the DS9490R adapter.
 *
 * The bridge is driven with vendor control requests (control, communication and
 * mode commands), bulk transfers on EP2/EP3 for 1-Wire data and status packets read
 * from EP1. The driver is generic over the host USB stack through [`UsbIo`] and
 * implements [`OneWireMaster`], including the accelerated search and Match ROM
 * commands of the bridge.
 */

#[cfg(test)]
extern crate alloc;

pub use onewire_bus::{OneWireError, OneWireMaster, OneWireResult};
mod error;
mod onewire;
mod registers;
#[cfg(test)]
mod sim;
mod usb;

pub use error::Ds2490Error;
pub use registers::{
    CommFlags, CommOpcode, ControlCommand, ModeCommand, StatusFlags, StatusPacket,
};
pub use usb::{
    CONTROL_REQUEST_TYPE, DS2490_PRODUCT_ID, DS2490_VENDOR_ID, EP_DATA_IN, EP_DATA_OUT,
    EP_STATUS, TransferError, UsbIo,
};

use core::time::Duration;
use embedded_hal::delay::DelayNs;
use onewire_bus::{AnyDevices, BusSpeed};
use registers::{
    COMM_CMD, CONTROL_CMD, FLEX_DSO_8US, FLEX_SLEW_1P37, FLEX_W1LT_10US, MODE_CMD,
    STATUS_PACKET_MAX, STATUS_REGISTERS,
};

/// Results of DS2490-specific function calls.
pub type Ds2490Result<T, E> = Result<T, Ds2490Error<E>>;

/// A DS2490 USB to 1-Wire bridge.
///
/// Takes ownership of an opened USB device (implementing [`UsbIo`])
/// and a timer object implementing the [`DelayNs`] trait.
pub struct Ds2490<U, D> {
    pub(crate) usb: U,
    pub(crate) delay: D,
    pub(crate) timeout: Duration,
    pub(crate) retries: u8,
    pub(crate) polls: u16,
    pub(crate) speed: BusSpeed,
    pub(crate) any_devices: AnyDevices,
    pub(crate) open: bool,
}

/// Builder for creating a [`Ds2490`] instance with custom configuration.
pub struct Ds2490Builder {
    timeout: Duration,
    retries: u8,
    polls: u16,
    speed: BusSpeed,
}

impl Default for Ds2490Builder {
    fn default() -> Self {
        Ds2490Builder {
            timeout: Duration::from_secs(5),
            retries: 3,
            polls: 100,
            speed: BusSpeed::Regular,
        }
    }
}

impl Ds2490Builder {
    /// Sets the timeout of each USB transfer.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets how often a stalled or timed out transfer is retried.
    pub fn with_retries(mut self, retries: u8) -> Self {
        self.retries = retries;
        self
    }

    /// Sets how many status packets (100 µs apart) are read while waiting for idle.
    pub fn with_polls(mut self, polls: u16) -> Self {
        self.polls = polls;
        self
    }

    /// Sets the initial bus speed.
    pub fn with_speed(mut self, speed: BusSpeed) -> Self {
        self.speed = speed;
        self
    }

    /// Claims the adapter and brings it to a known state.
    pub fn build<U: UsbIo, D: DelayNs>(
        self,
        usb: U,
        delay: D,
    ) -> Ds2490Result<Ds2490<U, D>, U::Error> {
        let mut dev = Ds2490 {
            usb,
            delay,
            timeout: self.timeout,
            retries: self.retries,
            polls: self.polls,
            speed: self.speed,
            any_devices: AnyDevices::Unknown,
            open: false,
        };
        dev.open()?;
        Ok(dev)
    }
}

impl<U, D> Ds2490<U, D> {
    /// The USB device.
    pub fn usb(&mut self) -> &mut U {
        &mut self.usb
    }

    /// Whether the adapter is claimed.
    pub fn is_open(&self) -> bool {
        self.open
    }
}

impl<U: UsbIo, D: DelayNs> Ds2490<U, D> {
    /// Claims the interface, clears the endpoints and resets the bridge.
    ///
    /// Reopening an open adapter releases it first.
    pub fn open(&mut self) -> Ds2490Result<(), U::Error> {
        if self.open {
            self.release();
        }
        self.usb.claim()?;
        self.open = true;
        let setup = self.clear_endpoints().and_then(|_| self.setup());
        if let Err(e) = setup {
            log::debug!("DS2490 setup failed: {e:?}");
            self.release();
            return Err(e);
        }
        log::info!("opened DS2490 bus master");
        Ok(())
    }

    /// Releases the interface. Closing a closed adapter only logs.
    pub fn release(&mut self) {
        if !self.open {
            log::debug!("DS2490 already closed");
            return;
        }
        self.usb.release();
        self.open = false;
        self.any_devices = AnyDevices::Unknown;
        log::info!("closed DS2490 bus master");
    }

    fn clear_endpoints(&mut self) -> Ds2490Result<(), U::Error> {
        for ep in [EP_DATA_IN, EP_DATA_OUT, EP_STATUS] {
            self.usb.clear_halt(ep)?;
        }
        Ok(())
    }

    fn setup(&mut self) -> Ds2490Result<(), U::Error> {
        self.control(ControlCommand::ResetDevice)?;
        self.mode(ModeCommand::PulseEnable, 0)?;
        self.mode(ModeCommand::SpeedChangeEnable, 1)?;
        self.apply_speed(self.speed)
    }

    pub(crate) fn apply_speed(&mut self, speed: BusSpeed) -> Ds2490Result<(), U::Error> {
        self.mode(ModeCommand::OneWireSpeed, speed as u16)?;
        if speed == BusSpeed::Flexible {
            self.mode(ModeCommand::PulldownSlewRate, FLEX_SLEW_1P37)?;
            self.mode(ModeCommand::Write1LowTime, FLEX_W1LT_10US)?;
            self.mode(ModeCommand::DsoW0Recovery, FLEX_DSO_8US)?;
        }
        Ok(())
    }

    fn request(&mut self, request: u8, value: u16, index: u16) -> Ds2490Result<(), U::Error> {
        if !self.open {
            return Err(Ds2490Error::Closed);
        }
        log::trace!("DS2490 control request={request:#04x} value={value:#06x} index={index:#06x}");
        self.usb.control_out(request, value, index, self.timeout)?;
        Ok(())
    }

    /// Sends a control command.
    pub fn control(&mut self, cmd: ControlCommand) -> Ds2490Result<(), U::Error> {
        self.request(CONTROL_CMD, cmd as u16, 0)
    }

    /// Sends a mode command.
    pub fn mode(&mut self, cmd: ModeCommand, param: u16) -> Ds2490Result<(), U::Error> {
        self.request(MODE_CMD, cmd as u16, param)
    }

    /// Sends a communication command word.
    pub fn comm(&mut self, value: u16, index: u16) -> Ds2490Result<(), U::Error> {
        self.request(COMM_CMD, value, index)
    }

    fn transfer<T>(
        &mut self,
        endpoint: u8,
        mut op: impl FnMut(&mut U, Duration) -> Result<T, TransferError<U::Error>>,
    ) -> Ds2490Result<T, U::Error> {
        if !self.open {
            return Err(Ds2490Error::Closed);
        }
        let mut tries = 0;
        loop {
            match op(&mut self.usb, self.timeout) {
                Ok(v) => return Ok(v),
                Err(TransferError::Stall) if tries < self.retries => {
                    log::debug!("endpoint {endpoint:#04x} stalled, clearing halt");
                    self.usb.clear_halt(endpoint)?;
                }
                Err(TransferError::Timeout) if tries < self.retries => {
                    log::debug!("endpoint {endpoint:#04x} timed out, retrying");
                }
                Err(e) => return Err(e.into()),
            }
            tries += 1;
        }
    }

    /// Fills the EP2 FIFO.
    pub(crate) fn write_data(&mut self, data: &[u8]) -> Ds2490Result<(), U::Error> {
        let mut sent = 0;
        while sent < data.len() {
            let n = self.transfer(EP_DATA_OUT, |usb, t| {
                usb.bulk_write(EP_DATA_OUT, &data[sent..], t)
            })?;
            if n == 0 {
                return Err(Ds2490Error::Timeout);
            }
            sent += n;
        }
        log::trace!("DS2490 EP2 <- {data:02x?}");
        Ok(())
    }

    /// Drains the EP3 FIFO into `buf`, returning the bytes read.
    pub(crate) fn read_data(&mut self, buf: &mut [u8]) -> Ds2490Result<usize, U::Error> {
        let n = self.transfer(EP_DATA_IN, |usb, t| usb.bulk_read(EP_DATA_IN, buf, t))?;
        log::trace!("DS2490 EP3 -> {:02x?}", &buf[..n]);
        Ok(n)
    }

    /// Polls EP1 until the bridge is idle.
    ///
    /// With `readlen`, also waits until that many bytes are in the EP3 FIFO. A short
    /// reported in the result bytes ends the wait at once. After the configured number
    /// of polls the bridge gets a device reset and [`Ds2490Error::NeverIdle`] is returned.
    pub fn status(&mut self, readlen: Option<usize>) -> Ds2490Result<StatusPacket, U::Error> {
        let mut polls = 0;
        loop {
            let mut raw = [0u8; STATUS_PACKET_MAX];
            let len = self.transfer(EP_STATUS, |usb, t| usb.interrupt_read(EP_STATUS, &mut raw, t))?;
            if len < STATUS_REGISTERS {
                log::debug!("incomplete DS2490 status packet of {len} bytes");
                return Err(Ds2490Error::BadStatus(len));
            }
            let packet = StatusPacket::new(raw, len);
            if packet.short() {
                log::debug!("DS2490 reported 1-Wire short");
                return Ok(packet);
            }
            if packet.flags().idle() {
                match readlen {
                    Some(n) if packet.data_in() < n => {
                        log::trace!("DS2490 idle with {} of {n} bytes", packet.data_in())
                    }
                    _ => return Ok(packet),
                }
            }
            polls += 1;
            if polls > self.polls {
                log::warn!(
                    "DS2490 never got idle, flags={:?} data_in={}",
                    packet.flags(),
                    packet.data_in()
                );
                if let Err(e) = self.control(ControlCommand::ResetDevice) {
                    log::debug!("DS2490 device reset failed: {e:?}");
                }
                return Err(Ds2490Error::NeverIdle);
            }
            self.delay.delay_us(100);
        }
    }
}
