use crate::{
    Adapter, BusCommand, BusError, BusOptions, Connection,
    adapter::identity,
};
use onewire_bus::RomId;
use std::{
    collections::BTreeSet,
    fmt, io,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
        mpsc::Sender,
    },
    thread::{self, JoinHandle},
};

/// Position of a USB device on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UsbLocation {
    /// Host bus number.
    pub bus: u8,
    /// Device address on that bus.
    pub address: u8,
}

impl fmt::Display for UsbLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.bus, self.address)
    }
}

/// Finds and opens DS9490 adapters on the host USB stack.
pub trait UsbScanner: Send {
    /// Locations of every attached adapter, in a stable order.
    fn scan(&mut self) -> Result<Vec<UsbLocation>, BusError>;

    /// Opens and sets up the adapter at `location`.
    fn open(&mut self, location: UsbLocation) -> Result<Box<dyn Adapter>, BusError>;
}

/// An adapter taken from the [`UsbDirectory`].
pub struct UsbClaim {
    /// Where the adapter is.
    pub location: UsbLocation,
    /// The opened adapter.
    pub adapter: Box<dyn Adapter>,
    /// Identity tag read from its bus.
    pub identity: RomId,
}

/// The USB scanner and the set of locations owned by open connections.
pub struct UsbDirectory {
    scanner: Mutex<Box<dyn UsbScanner>>,
    claimed: Mutex<BTreeSet<UsbLocation>>,
}

fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl UsbDirectory {
    /// Wraps a scanner.
    pub fn new(scanner: impl UsbScanner + 'static) -> Arc<Self> {
        Arc::new(Self {
            scanner: Mutex::new(Box::new(scanner)),
            claimed: Mutex::new(BTreeSet::new()),
        })
    }

    /// Locations in use.
    pub fn claimed(&self) -> Vec<UsbLocation> {
        lock(&self.claimed).iter().copied().collect()
    }

    /// Gives a location back.
    pub fn release(&self, location: UsbLocation) {
        if lock(&self.claimed).remove(&location) {
            log::debug!("released USB adapter at {location}");
        }
    }

    fn unclaimed(scanner: &mut dyn UsbScanner, claimed: &BTreeSet<UsbLocation>) -> Result<Vec<UsbLocation>, BusError> {
        let mut found = scanner.scan()?;
        found.retain(|l| !claimed.contains(l));
        Ok(found)
    }

    fn take(
        scanner: &mut dyn UsbScanner,
        claimed: &mut BTreeSet<UsbLocation>,
        location: UsbLocation,
    ) -> Result<UsbClaim, BusError> {
        let mut adapter = scanner.open(location)?;
        let identity = match identity(&mut *adapter) {
            Ok(id) => id,
            Err(e) => {
                adapter.close();
                return Err(e);
            }
        };
        claimed.insert(location);
        log::info!("USB adapter at {location} has identity {identity}");
        Ok(UsbClaim {
            location,
            adapter,
            identity,
        })
    }

    /// Opens the `n`-th adapter (from 0) that no connection owns.
    pub fn claim_nth(&self, n: usize) -> Result<UsbClaim, BusError> {
        let mut scanner = lock(&self.scanner);
        let mut claimed = lock(&self.claimed);
        let free = Self::unclaimed(&mut **scanner, &claimed)?;
        let location = *free
            .get(n)
            .ok_or_else(|| BusError::Config(format!("no free DS9490 number {}", n + 1)))?;
        Self::take(&mut **scanner, &mut claimed, location)
    }

    /// Opens every adapter that no connection owns. Failures are logged and skipped.
    pub fn claim_new(&self) -> Vec<UsbClaim> {
        let mut scanner = lock(&self.scanner);
        let mut claimed = lock(&self.claimed);
        let free = match Self::unclaimed(&mut **scanner, &claimed) {
            Ok(free) => free,
            Err(e) => {
                log::warn!("USB scan failed: {e}");
                return Vec::new();
            }
        };
        free.into_iter()
            .filter_map(|location| match Self::take(&mut **scanner, &mut claimed, location) {
                Ok(claim) => Some(claim),
                Err(e) => {
                    log::debug!("USB adapter at {location} not usable: {e}");
                    None
                }
            })
            .collect()
    }

    /// Finds the adapter carrying `identity` after a rescan.
    ///
    /// An untagged connection ([`RomId::ZERO`]) only takes back the adapter at
    /// `previous`, and only while that adapter is still untagged. Adapters with
    /// another identity are closed again and stay free.
    pub fn relocate(
        &self,
        identity: RomId,
        previous: Option<UsbLocation>,
    ) -> Result<UsbClaim, BusError> {
        let mut scanner = lock(&self.scanner);
        let mut claimed = lock(&self.claimed);
        let mut candidates = Self::unclaimed(&mut **scanner, &claimed)?;
        if identity.is_zero() {
            candidates.retain(|l| Some(*l) == previous);
        }
        for location in candidates {
            let mut claim = match Self::take(&mut **scanner, &mut claimed, location) {
                Ok(claim) => claim,
                Err(e) => {
                    log::debug!("USB adapter at {location} not usable: {e}");
                    continue;
                }
            };
            if claim.identity == identity {
                return Ok(claim);
            }
            log::debug!("USB adapter at {location} is {}, not {identity}", claim.identity);
            claim.adapter.close();
            claimed.remove(&location);
        }
        match (identity.is_zero(), previous) {
            (true, Some(location)) => Err(BusError::Lost(format!(
                "untagged USB adapter at {location} is gone"
            ))),
            (true, None) => Err(BusError::Lost("untagged USB adapter has no location".into())),
            (false, _) => Err(BusError::Lost(format!("no USB adapter with identity {identity}"))),
        }
    }
}

/// Polls for newly plugged adapters and hands them to the registry.
pub struct UsbMonitor {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl UsbMonitor {
    /// Starts the polling thread.
    ///
    /// The thread ends when stopped or when the command receiver is gone.
    pub fn spawn(
        directory: Arc<UsbDirectory>,
        commands: Sender<BusCommand>,
        options: BusOptions,
    ) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = stop.clone();
            thread::Builder::new()
                .name("usb-monitor".into())
                .spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        for claim in directory.claim_new() {
                            let location = claim.location;
                            let conn = Connection::usb(claim, directory.clone(), options.clone());
                            if commands.send(BusCommand::Add(conn)).is_err() {
                                log::debug!("registry gone, USB monitor stopping");
                                directory.release(location);
                                return;
                            }
                        }
                        thread::park_timeout(options.usb_scan_interval);
                    }
                    log::debug!("USB monitor stopped");
                })?
        };
        Ok(Self { stop, handle })
    }

    /// Stops the thread and waits for it.
    pub fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        self.handle.thread().unpark();
        if self.handle.join().is_err() {
            log::warn!("USB monitor panicked");
        }
    }
}
