#![allow(dead_code)]

use onewire_bus::{
    AnyDevices, BitBanged, OneWireError, OneWireMaster, OneWireResult, ResetOutcome, RomId,
    SearchCursor,
    sim::{SimBus, SimDevice},
};
use owfs_bus::{Adapter, AdapterKind, BusError, UsbLocation, UsbScanner};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

pub const ROM_A: RomId = RomId::new([0x10, 0xaa, 0, 0, 0, 0, 0xa0, 0xc7]);
pub const ROM_B: RomId = RomId::new([0x28, 0xbb, 0, 0, 0, 0, 0xa0, 0x4e]);

/// Failures injected into a [`Flaky`] adapter, shared with the test.
#[derive(Debug, Default)]
pub struct Faults {
    /// Resets answered with `ResetOutcome::Error`.
    pub reset_errors: usize,
    /// Every request fails as if unplugged.
    pub lost: bool,
    /// `open` fails.
    pub fail_open: bool,
    pub opens: usize,
    pub closes: usize,
    /// Bytes sent through `write_read`.
    pub written: Vec<u8>,
}

pub type SharedFaults = Arc<Mutex<Faults>>;

/// A simulated bus behind an adapter that fails on demand.
pub struct Flaky {
    bus: BitBanged<SimBus>,
    faults: SharedFaults,
    kind: AdapterKind,
    open: bool,
}

impl Flaky {
    pub fn new(kind: AdapterKind, bus: SimBus) -> (Box<dyn Adapter>, SharedFaults) {
        let faults = SharedFaults::default();
        let adapter = Box::new(Self {
            bus: BitBanged::new(bus),
            faults: faults.clone(),
            kind,
            open: false,
        });
        (adapter, faults)
    }

    fn check(&self) -> OneWireResult<(), BusError> {
        if self.faults.lock().unwrap().lost {
            return Err(OneWireError::Other(BusError::Lost("unplugged".into())));
        }
        if !self.open {
            return Err(OneWireError::Other(BusError::Closed));
        }
        Ok(())
    }
}

impl OneWireMaster for Flaky {
    type Error = BusError;

    fn reset(&mut self) -> OneWireResult<ResetOutcome, Self::Error> {
        self.check()?;
        {
            let mut faults = self.faults.lock().unwrap();
            if faults.reset_errors > 0 {
                faults.reset_errors -= 1;
                return Ok(ResetOutcome::Error);
            }
        }
        self.bus.reset().map_err(|e| e.map_other(BusError::from))
    }

    fn write_read(&mut self, out: &[u8], input: &mut [u8]) -> OneWireResult<usize, Self::Error> {
        self.check()?;
        self.faults.lock().unwrap().written.extend_from_slice(out);
        self.bus
            .write_read(out, input)
            .map_err(|e| e.map_other(BusError::from))
    }

    fn search_next(
        &mut self,
        cursor: &mut SearchCursor,
    ) -> OneWireResult<Option<RomId>, Self::Error> {
        self.check()?;
        self.bus
            .search_next(cursor)
            .map_err(|e| e.map_other(BusError::from))
    }

    fn any_devices(&self) -> AnyDevices {
        self.bus.any_devices()
    }

    fn close(&mut self) {
        self.open = false;
        self.faults.lock().unwrap().closes += 1;
    }
}

impl Adapter for Flaky {
    fn kind(&self) -> AdapterKind {
        self.kind
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn open(&mut self) -> Result<(), BusError> {
        let mut faults = self.faults.lock().unwrap();
        if faults.fail_open {
            return Err(BusError::Io("no such device".into()));
        }
        faults.opens += 1;
        self.open = true;
        Ok(())
    }
}

pub fn sim_bus(roms: &[RomId]) -> SimBus {
    SimBus::new(roms.iter().map(|r| SimDevice::new(*r)).collect())
}

/// A USB host whose attached adapters the test rearranges.
#[derive(Clone, Default)]
pub struct FakeUsb {
    pub attached: Arc<Mutex<BTreeMap<UsbLocation, Vec<RomId>>>>,
    pub opened: Arc<Mutex<Vec<UsbLocation>>>,
}

impl FakeUsb {
    pub fn plug(&self, bus: u8, address: u8, roms: &[RomId]) {
        self.attached
            .lock()
            .unwrap()
            .insert(UsbLocation { bus, address }, roms.to_vec());
    }

    pub fn unplug(&self, bus: u8, address: u8) {
        self.attached
            .lock()
            .unwrap()
            .remove(&UsbLocation { bus, address });
    }
}

impl UsbScanner for FakeUsb {
    fn scan(&mut self) -> Result<Vec<UsbLocation>, BusError> {
        Ok(self.attached.lock().unwrap().keys().copied().collect())
    }

    fn open(&mut self, location: UsbLocation) -> Result<Box<dyn Adapter>, BusError> {
        let roms = self
            .attached
            .lock()
            .unwrap()
            .get(&location)
            .cloned()
            .ok_or_else(|| BusError::Lost(format!("nothing at {location}")))?;
        self.opened.lock().unwrap().push(location);
        let (mut adapter, _) = Flaky::new(AdapterKind::Usb, sim_bus(&roms));
        adapter.open()?;
        Ok(adapter)
    }
}

/// Polls `check` until it holds or a second passes.
pub fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(1);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}
