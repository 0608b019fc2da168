use crate::BusError;
use core::fmt;
use ds1wm::{Ds1wm, RegisterIo};
use ds2490::{Ds2490, UsbIo};
use embedded_hal::delay::DelayNs;
use onewire_bus::{
    AnyDevices, BitBanged, BusSpeed, OneWire, OneWireMaster, OneWireResult, ResetOutcome, RomId,
    Search, SearchCursor, SearchKind,
};
use w1_netlink::{NetlinkSocket, W1Master};

/// Transport of a bus master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterKind {
    /// DS9490 USB adapter.
    Usb,
    /// DS2480B serial adapter.
    Serial,
    /// DS1WM or K1WM register block.
    MemoryMapped,
    /// Kernel w1 bus master.
    Netlink,
    /// Another server passing requests through.
    Network,
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Usb => "usb",
            Self::Serial => "serial",
            Self::MemoryMapped => "memory-mapped",
            Self::Netlink => "w1",
            Self::Network => "network",
        })
    }
}

/// A bus master whose driver errors are flattened into [`BusError`].
///
/// Object safe; connections hold a `Box<dyn Adapter>`.
pub trait Adapter: OneWireMaster<Error = BusError> + Send {
    /// Transport of this adapter.
    fn kind(&self) -> AdapterKind;

    /// Whether the handle is held.
    fn is_open(&self) -> bool;

    /// Acquires the handle. Reopening an open adapter closes it first.
    fn open(&mut self) -> Result<(), BusError>;
}

/// Open and close of a driver's handle.
pub trait Lifecycle: OneWireMaster {
    /// Whether the handle is held.
    fn is_open(&self) -> bool;

    /// Acquires the handle again.
    fn reopen(&mut self) -> Result<(), Self::Error>;
}

impl<U: UsbIo, D: DelayNs> Lifecycle for Ds2490<U, D> {
    fn is_open(&self) -> bool {
        Ds2490::is_open(self)
    }

    fn reopen(&mut self) -> Result<(), Self::Error> {
        self.open()
    }
}

impl<R: RegisterIo, D: DelayNs> Lifecycle for Ds1wm<R, D> {
    fn is_open(&self) -> bool {
        Ds1wm::is_open(self)
    }

    fn reopen(&mut self) -> Result<(), Self::Error> {
        self.open()
    }
}

impl<S: NetlinkSocket> Lifecycle for W1Master<S> {
    fn is_open(&self) -> bool {
        W1Master::is_open(self)
    }

    fn reopen(&mut self) -> Result<(), Self::Error> {
        if W1Master::is_open(self) {
            OneWireMaster::close(self);
        }
        self.open();
        Ok(())
    }
}

/// Bit-level bridges hold no handle of their own.
impl<T: OneWire> Lifecycle for BitBanged<T> {
    fn is_open(&self) -> bool {
        true
    }

    fn reopen(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Wraps a driver as an [`Adapter`].
pub struct Flatten<M> {
    inner: M,
    kind: AdapterKind,
}

impl<M> Flatten<M> {
    /// Wraps `inner`, reporting it as `kind`.
    pub fn new(kind: AdapterKind, inner: M) -> Self {
        Self { inner, kind }
    }

    /// The wrapped driver.
    pub fn inner(&mut self) -> &mut M {
        &mut self.inner
    }
}

impl<M> Flatten<M>
where
    M: Lifecycle + Send + 'static,
    M::Error: Into<BusError>,
{
    /// Boxes the adapter for a connection.
    pub fn boxed(kind: AdapterKind, inner: M) -> Box<dyn Adapter> {
        Box::new(Self::new(kind, inner))
    }
}

impl<M> OneWireMaster for Flatten<M>
where
    M: OneWireMaster,
    M::Error: Into<BusError>,
{
    type Error = BusError;

    fn reset(&mut self) -> OneWireResult<ResetOutcome, Self::Error> {
        self.inner.reset().map_err(|e| e.map_other(Into::into))
    }

    fn write_read(&mut self, out: &[u8], input: &mut [u8]) -> OneWireResult<usize, Self::Error> {
        self.inner
            .write_read(out, input)
            .map_err(|e| e.map_other(Into::into))
    }

    fn search_next(
        &mut self,
        cursor: &mut SearchCursor,
    ) -> OneWireResult<Option<RomId>, Self::Error> {
        self.inner
            .search_next(cursor)
            .map_err(|e| e.map_other(Into::into))
    }

    fn any_devices(&self) -> AnyDevices {
        self.inner.any_devices()
    }

    fn speed(&self) -> BusSpeed {
        self.inner.speed()
    }

    fn set_speed(&mut self, speed: BusSpeed) -> OneWireResult<(), Self::Error> {
        self.inner.set_speed(speed).map_err(|e| e.map_other(Into::into))
    }

    fn select(&mut self, rom: Option<&RomId>) -> OneWireResult<(), Self::Error> {
        self.inner.select(rom).map_err(|e| e.map_other(Into::into))
    }

    fn close(&mut self) {
        self.inner.close()
    }
}

impl<M> Adapter for Flatten<M>
where
    M: Lifecycle + Send,
    M::Error: Into<BusError>,
{
    fn kind(&self) -> AdapterKind {
        self.kind
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn open(&mut self) -> Result<(), BusError> {
        self.inner.reopen().map_err(Into::into)
    }
}

/// Picks the identity tag of an adapter from the devices on its bus.
///
/// The DS9490R carries a DS2401 (family 0x81, or 0x01 on older units) on its own
/// bus. Without one the first other device is used; an empty bus gives
/// [`RomId::ZERO`], which matches any adapter on reconnect.
pub fn identity(adapter: &mut dyn Adapter) -> Result<RomId, BusError> {
    let roms = Search::new(adapter, SearchKind::Normal)
        .collect::<Result<Vec<_>, _>>()
        .map_err(BusError::from)?;
    Ok(pick_identity(&roms))
}

pub(crate) fn pick_identity(roms: &[RomId]) -> RomId {
    [0x81, 0x01]
        .iter()
        .find_map(|family| roms.iter().find(|r| r.family() == *family))
        .or_else(|| roms.first())
        .copied()
        .unwrap_or(RomId::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use onewire_bus::sim::{SimBus, SimDevice};

    fn sim(roms: &[RomId]) -> Box<dyn Adapter> {
        let bus = SimBus::new(roms.iter().map(|r| SimDevice::new(*r)).collect());
        Flatten::boxed(AdapterKind::Usb, BitBanged::new(bus))
    }

    #[test]
    fn identity_prefers_the_adapter_serial() {
        let sensor = RomId::with_crc([0x10, 1, 2, 3, 4, 5, 6]);
        let old = RomId::with_crc([0x01, 9, 9, 9, 9, 9, 9]);
        let tag = RomId::with_crc([0x81, 7, 7, 7, 7, 7, 7]);
        assert_eq!(identity(&mut *sim(&[sensor, old, tag])).unwrap(), tag);
        assert_eq!(identity(&mut *sim(&[sensor, old])).unwrap(), old);
        assert_eq!(identity(&mut *sim(&[sensor])).unwrap(), sensor);
        assert_eq!(identity(&mut *sim(&[])).unwrap(), RomId::ZERO);
    }

    #[test]
    fn flattened_adapter_reports_bus_errors() {
        let bus = SimBus::new(Vec::new()).with_short(true);
        let mut adapter = Flatten::boxed(AdapterKind::Usb, BitBanged::new(bus));
        assert_eq!(adapter.reset().unwrap(), ResetOutcome::Short);
        assert_eq!(adapter.any_devices(), AnyDevices::Unknown);
        assert_eq!(adapter.kind(), AdapterKind::Usb);
        assert!(adapter.open().is_ok());
    }
}
