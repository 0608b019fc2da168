use crate::{
    Adapter, AdapterKind, BusError, BusOptions, BusStats,
    adapter::identity,
    usb::{UsbClaim, UsbDirectory, UsbLocation},
};
use embedded_hal::delay::DelayNs;
use onewire_bus::{
    AnyDevices, BusSpeed, ResetOutcome, RomId, Search, SearchCursor, SearchKind, Transaction,
    TransactionOutput, next_both,
};
use std::{
    sync::{Arc, Mutex, MutexGuard},
    thread,
};

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Configured, never opened.
    Virgin,
    /// The adapter handle is held.
    Open,
    /// Closed, or lost; the next request reconnects.
    Closed,
}

struct Link {
    state: ConnectionState,
    adapter: Box<dyn Adapter>,
    identity: RomId,
    location: Option<UsbLocation>,
    reset_errors: u32,
}

struct Locked<'a> {
    link: MutexGuard<'a, Link>,
    _chip: Option<MutexGuard<'a, ()>>,
}

/// One bus master and everything needed to keep it usable.
///
/// Requests are serialized by a mutex around the adapter. Connections sharing one
/// chip (the channels of a K1WM) also share a chip lock, taken first.
pub struct Connection {
    name: String,
    kind: AdapterKind,
    link: Mutex<Link>,
    stats: BusStats,
    options: BusOptions,
    usb: Option<Arc<UsbDirectory>>,
    chip: Option<Arc<Mutex<()>>>,
}

impl Connection {
    /// A connection that opens `adapter` on [`detect`](Connection::detect).
    pub fn new(name: impl Into<String>, adapter: Box<dyn Adapter>, options: BusOptions) -> Self {
        let kind = adapter.kind();
        Self {
            name: name.into(),
            kind,
            link: Mutex::new(Link {
                state: ConnectionState::Virgin,
                adapter,
                identity: RomId::ZERO,
                location: None,
                reset_errors: 0,
            }),
            stats: BusStats::default(),
            options,
            usb: None,
            chip: None,
        }
    }

    /// An open connection for a claimed USB adapter.
    ///
    /// Reconnects rescan the directory for the adapter's identity.
    pub fn usb(claim: UsbClaim, directory: Arc<UsbDirectory>, options: BusOptions) -> Self {
        let mut conn = Self::new(format!("DS9490 at {}", claim.location), claim.adapter, options);
        let link = conn.link.get_mut().unwrap_or_else(|e| e.into_inner());
        link.state = ConnectionState::Open;
        link.identity = claim.identity;
        link.location = Some(claim.location);
        conn.usb = Some(directory);
        conn
    }

    /// Shares `lock` with the other connections of the same chip.
    pub fn with_chip_lock(mut self, lock: Arc<Mutex<()>>) -> Self {
        self.chip = Some(lock);
        self
    }

    /// Name used in logs and for removal.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Transport of the adapter.
    pub fn kind(&self) -> AdapterKind {
        self.kind
    }

    /// Counters of this connection.
    pub fn stats(&self) -> &BusStats {
        &self.stats
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.lock().link.state
    }

    /// Identity tag of a USB adapter, [`RomId::ZERO`] otherwise.
    pub fn identity(&self) -> RomId {
        self.lock().link.identity
    }

    /// Where the USB adapter is, or was last seen while the connection is closed.
    pub fn location(&self) -> Option<UsbLocation> {
        self.lock().link.location
    }

    /// Presence result of the last reset.
    pub fn any_devices(&self) -> AnyDevices {
        self.lock().link.adapter.any_devices()
    }

    fn lock(&self) -> Locked<'_> {
        let chip = self
            .chip
            .as_ref()
            .map(|c| c.lock().unwrap_or_else(|e| e.into_inner()));
        Locked {
            link: self.link.lock().unwrap_or_else(|e| e.into_inner()),
            _chip: chip,
        }
    }

    fn open_link(&self, link: &mut Link) -> Result<(), BusError> {
        if !link.adapter.is_open() {
            link.adapter.open()?;
        }
        if self.kind == AdapterKind::Usb && link.identity.is_zero() {
            link.identity = identity(&mut *link.adapter)?;
        }
        link.state = ConnectionState::Open;
        link.reset_errors = 0;
        log::info!("opened {} bus {}", self.kind, self.name);
        Ok(())
    }

    fn reconnect_link(&self, link: &mut Link) -> Result<(), BusError> {
        self.stats.reconnect();
        log::info!("reconnecting {}", self.name);
        link.adapter.close();
        link.state = ConnectionState::Closed;
        let reopened = match &self.usb {
            Some(directory) => {
                // Kept after a failure: untagged adapters are only found there.
                let previous = link.location;
                if let Some(location) = previous {
                    directory.release(location);
                }
                directory.relocate(link.identity, previous).map(|claim| {
                    link.adapter = claim.adapter;
                    link.identity = claim.identity;
                    link.location = Some(claim.location);
                })
            }
            None => link.adapter.open(),
        };
        match reopened {
            Ok(()) => {
                link.state = ConnectionState::Open;
                link.reset_errors = 0;
                log::info!("reconnected {}", self.name);
                Ok(())
            }
            Err(e) => {
                self.stats.reconnect_failure();
                log::warn!("cannot reconnect {}: {e}", self.name);
                thread::sleep(self.options.reconnect_delay);
                Err(BusError::ReconnectFailed(e.to_string()))
            }
        }
    }

    fn ready(&self, link: &mut Link) -> Result<(), BusError> {
        match link.state {
            ConnectionState::Open => Ok(()),
            ConnectionState::Virgin => self.open_link(link),
            ConnectionState::Closed => self.reconnect_link(link),
        }
    }

    /// Runs `op` on the adapter under the connection lock.
    ///
    /// An error that loses the adapter closes the connection; the next request
    /// reconnects.
    fn run<T>(&self, op: impl FnOnce(&mut dyn Adapter) -> Result<T, BusError>) -> Result<T, BusError> {
        let mut locked = self.lock();
        let link = &mut *locked.link;
        self.ready(link)?;
        let result = op(&mut *link.adapter);
        if let Err(e) = &result {
            if e.needs_reconnect() {
                log::warn!("{} lost: {e}, reconnect scheduled", self.name);
                link.adapter.close();
                link.state = ConnectionState::Closed;
            }
        }
        result
    }

    /// Opens the adapter. Reads the identity tag of USB adapters.
    pub fn detect(&self) -> Result<(), BusError> {
        let mut locked = self.lock();
        let link = &mut *locked.link;
        if link.state == ConnectionState::Open {
            return Ok(());
        }
        self.open_link(link)
    }

    /// Resets the bus.
    ///
    /// Failed resets count toward the reconnect threshold and a good reset clears
    /// the count. Shorts do not count.
    pub fn reset(&self) -> Result<ResetOutcome, BusError> {
        let mut locked = self.lock();
        let link = &mut *locked.link;
        self.ready(link)?;
        self.stats.reset();
        let error = match link.adapter.reset() {
            Ok(ResetOutcome::Ok) => {
                link.reset_errors = 0;
                return Ok(ResetOutcome::Ok);
            }
            Ok(ResetOutcome::Short) => {
                self.stats.short();
                log::debug!("{}: bus short", self.name);
                return Ok(ResetOutcome::Short);
            }
            Ok(ResetOutcome::Error) => None,
            Err(e) => Some(BusError::from(e)),
        };
        self.stats.reset_error();
        link.reset_errors += 1;
        let lost = error.as_ref().is_some_and(BusError::needs_reconnect);
        if lost || link.reset_errors >= self.options.reconnect_threshold {
            self.reconnect_link(link)?;
        }
        match error {
            Some(e) => Err(e),
            None => Ok(ResetOutcome::Error),
        }
    }

    /// Sends `out` and returns the bytes read back.
    pub fn sendback(&self, out: &[u8]) -> Result<Vec<u8>, BusError> {
        self.stats.transaction();
        self.run(|adapter| {
            let mut input = vec![0u8; out.len()];
            let received = adapter.write_read(out, &mut input)?;
            if received < out.len() {
                return Err(BusError::ShortRead {
                    expected: out.len(),
                    received,
                });
            }
            Ok(input)
        })
        .inspect_err(|e| self.stats.error(e))
    }

    /// Runs a transaction as one unit.
    ///
    /// After a failure the bus state is unknown; the next transaction should
    /// start with a select or reset.
    pub fn transaction<D: DelayNs>(
        &self,
        transaction: &Transaction,
        delay: &mut D,
    ) -> Result<TransactionOutput, BusError> {
        self.stats.transaction();
        self.run(|adapter| transaction.run(adapter, delay).map_err(BusError::from))
            .inspect_err(|e| self.stats.error(e))
    }

    /// Advances a search pass by one device.
    ///
    /// The bus is held only for this step; other requests may run between steps.
    pub fn next(&self, cursor: &mut SearchCursor) -> Result<Option<RomId>, BusError> {
        if !cursor.is_started() {
            self.stats.search();
        }
        match self.run(|adapter| next_both(adapter, cursor).map_err(BusError::from)) {
            Ok(Some(rom)) => {
                self.stats.found(1);
                Ok(Some(rom))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.stats.search_error();
                Err(e)
            }
        }
    }

    /// Lists the devices of one search pass, holding the bus for the whole pass.
    ///
    /// An error aborts the pass; the devices found before it are lost.
    pub fn devices(&self, kind: SearchKind) -> Result<Vec<RomId>, BusError> {
        self.stats.search();
        let listing = self.run(|adapter| {
            Search::new(adapter, kind)
                .collect::<Result<Vec<_>, _>>()
                .map_err(BusError::from)
        });
        match &listing {
            Ok(roms) => {
                self.stats.found(roms.len());
                log::debug!("{}: {} devices", self.name, roms.len());
            }
            Err(e) => {
                self.stats.search_error();
                log::debug!("{}: search aborted: {e}", self.name);
            }
        }
        listing
    }

    /// Changes the bus speed.
    pub fn set_speed(&self, speed: BusSpeed) -> Result<(), BusError> {
        self.run(|adapter| adapter.set_speed(speed).map_err(BusError::from))
    }

    /// Closes and reopens the adapter; USB adapters are looked up by identity.
    pub fn reconnect(&self) -> Result<(), BusError> {
        let mut locked = self.lock();
        self.reconnect_link(&mut locked.link)
    }

    /// Releases the adapter. Closing a closed connection only logs.
    pub fn close(&self) {
        let mut locked = self.lock();
        let link = &mut *locked.link;
        if link.state != ConnectionState::Open {
            log::debug!("{} already closed", self.name);
            link.state = ConnectionState::Closed;
            return;
        }
        link.adapter.close();
        link.state = ConnectionState::Closed;
        if let (Some(directory), Some(location)) = (&self.usb, link.location) {
            directory.release(location);
        }
        log::info!("closed {}", self.name);
    }
}
