//! DS9490 adapters through libusb.

use ds2490::{
    CONTROL_REQUEST_TYPE, DS2490_PRODUCT_ID, DS2490_VENDOR_ID, Ds2490Builder, TransferError, UsbIo,
};
use linux_embedded_hal::Delay;
use owfs_bus::{Adapter, AdapterKind, BusError, BusOptions, Flatten, UsbLocation, UsbScanner};
use rusb::{Device, DeviceHandle, GlobalContext};
use std::time::Duration;

const INTERFACE: u8 = 0;
const CONFIGURATION: u8 = 1;
const ALT_SETTING: u8 = 3;

fn transfer_error(e: rusb::Error) -> TransferError<rusb::Error> {
    match e {
        rusb::Error::Pipe => TransferError::Stall,
        rusb::Error::Timeout => TransferError::Timeout,
        rusb::Error::NoDevice => TransferError::NoDevice,
        e => TransferError::Other(e),
    }
}

fn bus_error(e: rusb::Error) -> BusError {
    match e {
        rusb::Error::NoDevice => BusError::Lost(e.to_string()),
        rusb::Error::Timeout => BusError::Timeout,
        e => BusError::Io(e.to_string()),
    }
}

/// An opened DS2490.
pub struct RusbIo {
    handle: DeviceHandle<GlobalContext>,
    claimed: bool,
}

impl RusbIo {
    pub fn new(handle: DeviceHandle<GlobalContext>) -> Self {
        Self {
            handle,
            claimed: false,
        }
    }
}

impl UsbIo for RusbIo {
    type Error = rusb::Error;

    fn claim(&mut self) -> Result<(), TransferError<Self::Error>> {
        match self.handle.set_auto_detach_kernel_driver(true) {
            Ok(()) | Err(rusb::Error::NotSupported) => {}
            Err(e) => return Err(transfer_error(e)),
        }
        match self.handle.active_configuration() {
            Ok(CONFIGURATION) => {}
            _ => self
                .handle
                .set_active_configuration(CONFIGURATION)
                .map_err(transfer_error)?,
        }
        self.handle
            .claim_interface(INTERFACE)
            .map_err(transfer_error)?;
        self.claimed = true;
        self.handle
            .set_alternate_setting(INTERFACE, ALT_SETTING)
            .map_err(transfer_error)
    }

    fn release(&mut self) {
        if !self.claimed {
            return;
        }
        if let Err(e) = self.handle.release_interface(INTERFACE) {
            log::debug!("releasing DS2490 interface: {e}");
        }
        self.claimed = false;
    }

    fn control_out(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        timeout: Duration,
    ) -> Result<(), TransferError<Self::Error>> {
        self.handle
            .write_control(CONTROL_REQUEST_TYPE, request, value, index, &[], timeout)
            .map(|_| ())
            .map_err(transfer_error)
    }

    fn bulk_write(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransferError<Self::Error>> {
        self.handle
            .write_bulk(endpoint, data, timeout)
            .map_err(transfer_error)
    }

    fn bulk_read(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransferError<Self::Error>> {
        self.handle
            .read_bulk(endpoint, buf, timeout)
            .map_err(transfer_error)
    }

    fn interrupt_read(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransferError<Self::Error>> {
        self.handle
            .read_interrupt(endpoint, buf, timeout)
            .map_err(transfer_error)
    }

    fn clear_halt(&mut self, endpoint: u8) -> Result<(), TransferError<Self::Error>> {
        self.handle.clear_halt(endpoint).map_err(transfer_error)
    }
}

fn location(device: &Device<GlobalContext>) -> UsbLocation {
    UsbLocation {
        bus: device.bus_number(),
        address: device.address(),
    }
}

/// Finds DS9490 adapters on every USB bus of the host.
pub struct RusbScanner {
    options: BusOptions,
}

impl RusbScanner {
    pub fn new(options: BusOptions) -> Self {
        Self { options }
    }

    fn adapters(&self) -> Result<Vec<Device<GlobalContext>>, BusError> {
        let devices = rusb::devices().map_err(bus_error)?;
        let mut adapters: Vec<_> = devices
            .iter()
            .filter(|d| {
                d.device_descriptor().is_ok_and(|desc| {
                    desc.vendor_id() == DS2490_VENDOR_ID && desc.product_id() == DS2490_PRODUCT_ID
                })
            })
            .collect();
        adapters.sort_by_key(location);
        Ok(adapters)
    }
}

impl UsbScanner for RusbScanner {
    fn scan(&mut self) -> Result<Vec<UsbLocation>, BusError> {
        Ok(self.adapters()?.iter().map(location).collect())
    }

    fn open(&mut self, at: UsbLocation) -> Result<Box<dyn Adapter>, BusError> {
        let device = self
            .adapters()?
            .into_iter()
            .find(|d| location(d) == at)
            .ok_or_else(|| BusError::Lost(format!("no DS9490 at {at}")))?;
        let handle = device.open().map_err(bus_error)?;
        log::debug!("opened USB device at {at}");
        let ds2490 = Ds2490Builder::default()
            .with_timeout(self.options.usb_timeout())
            .build(RusbIo::new(handle), Delay)
            .map_err(BusError::from)?;
        Ok(Flatten::boxed(AdapterKind::Usb, ds2490))
    }
}
