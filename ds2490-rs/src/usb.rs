use core::time::Duration;

/// EP1: status, interrupt in.
pub const EP_STATUS: u8 = 0x81;
/// EP2: 1-Wire data out, bulk.
pub const EP_DATA_OUT: u8 = 0x02;
/// EP3: 1-Wire data in, bulk.
pub const EP_DATA_IN: u8 = 0x83;

/// Vendor-specific, host-to-device control request type.
pub const CONTROL_REQUEST_TYPE: u8 = 0x40;

/// USB vendor ID of the DS9490 adapter.
pub const DS2490_VENDOR_ID: u16 = 0x04fa;
/// USB product ID of the DS9490 adapter.
pub const DS2490_PRODUCT_ID: u16 = 0x2490;

/// Failure of a single USB transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferError<E> {
    /// The endpoint is halted; clearing the halt and retrying may succeed.
    Stall,
    /// The transfer did not complete in time.
    Timeout,
    /// The device is gone (unplugged).
    NoDevice,
    /// Any other host controller or library error.
    Other(E),
}

impl<E> From<E> for TransferError<E> {
    fn from(value: E) -> Self {
        Self::Other(value)
    }
}

/// USB access to one opened DS2490.
///
/// Implementations wrap the host USB stack. The driver only issues vendor control
/// requests (type [`CONTROL_REQUEST_TYPE`]) and transfers on the three fixed endpoints.
pub trait UsbIo {
    /// Host USB stack error.
    type Error: core::fmt::Debug;

    /// Selects configuration 1, claims interface 0 and alternate setting 3.
    fn claim(&mut self) -> Result<(), TransferError<Self::Error>>;

    /// Releases the interface. Must tolerate an already released interface.
    fn release(&mut self);

    /// Vendor control transfer without a data stage.
    fn control_out(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        timeout: Duration,
    ) -> Result<(), TransferError<Self::Error>>;

    /// Bulk write; returns the bytes accepted.
    fn bulk_write(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransferError<Self::Error>>;

    /// Bulk read; returns the bytes received.
    fn bulk_read(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransferError<Self::Error>>;

    /// Interrupt read; returns the bytes received.
    fn interrupt_read(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransferError<Self::Error>>;

    /// Clears a halt condition on an endpoint.
    fn clear_halt(&mut self, endpoint: u8) -> Result<(), TransferError<Self::Error>>;
}

impl<T: UsbIo + ?Sized> UsbIo for &mut T {
    type Error = T::Error;

    fn claim(&mut self) -> Result<(), TransferError<Self::Error>> {
        (**self).claim()
    }

    fn release(&mut self) {
        (**self).release()
    }

    fn control_out(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        timeout: Duration,
    ) -> Result<(), TransferError<Self::Error>> {
        (**self).control_out(request, value, index, timeout)
    }

    fn bulk_write(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransferError<Self::Error>> {
        (**self).bulk_write(endpoint, data, timeout)
    }

    fn bulk_read(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransferError<Self::Error>> {
        (**self).bulk_read(endpoint, buf, timeout)
    }

    fn interrupt_read(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransferError<Self::Error>> {
        (**self).interrupt_read(endpoint, buf, timeout)
    }

    fn clear_halt(&mut self, endpoint: u8) -> Result<(), TransferError<Self::Error>> {
        (**self).clear_halt(endpoint)
    }
}
