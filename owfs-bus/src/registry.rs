use crate::{AdapterKind, BusError, BusOptions, Connection, ConnectionState, Flatten};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs, io,
    path::Path,
    sync::{
        Arc, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicUsize, Ordering},
        mpsc::{Receiver, Sender},
    },
    thread::{self, JoinHandle},
};
use w1_netlink::{ControlEvent, Dispatcher, NetlinkSocket};

/// Index of a bus in the registry. Never reused.
pub type BusId = usize;

/// Request to the registry-owner thread.
pub enum BusCommand {
    /// Detect and register a connection.
    Add(Connection),
    /// Close and unregister the connection with this name.
    Remove(String),
    /// The kernel's complete list of w1 bus masters. Other w1 buses are removed.
    W1Masters(Vec<u32>),
}

/// The open bus masters.
#[derive(Default)]
pub struct BusRegistry {
    buses: RwLock<BTreeMap<BusId, Arc<Connection>>>,
    next: AtomicUsize,
}

impl BusRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<BusId, Arc<Connection>>> {
        self.buses.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<BusId, Arc<Connection>>> {
        self.buses.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a connection.
    pub fn add(&self, conn: Connection) -> (BusId, Arc<Connection>) {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(conn);
        log::info!("bus.{id} is {}", conn.name());
        self.write().insert(id, conn.clone());
        (id, conn)
    }

    /// The connection of bus `id`.
    pub fn get(&self, id: BusId) -> Option<Arc<Connection>> {
        self.read().get(&id).cloned()
    }

    /// The connection named `name`.
    pub fn find(&self, name: &str) -> Option<(BusId, Arc<Connection>)> {
        self.read()
            .iter()
            .find(|(_, c)| c.name() == name)
            .map(|(id, c)| (*id, c.clone()))
    }

    /// Closes and unregisters bus `id`.
    pub fn remove(&self, id: BusId) -> Option<Arc<Connection>> {
        let conn = self.write().remove(&id)?;
        conn.close();
        log::info!("bus.{id} ({}) removed", conn.name());
        Some(conn)
    }

    /// Registered buses, in registration order.
    pub fn connections(&self) -> Vec<(BusId, Arc<Connection>)> {
        self.read().iter().map(|(id, c)| (*id, c.clone())).collect()
    }

    /// Number of registered buses.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether no bus is registered.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Closes and unregisters every bus.
    pub fn close_all(&self) {
        let buses = std::mem::take(&mut *self.write());
        for conn in buses.values() {
            conn.close();
        }
    }

    /// Carries out one command. A connection whose name is taken by an open
    /// connection is dropped; a closed one is replaced.
    pub fn apply(&self, command: BusCommand) {
        match command {
            BusCommand::Add(conn) => {
                if let Some((id, old)) = self.find(conn.name()) {
                    if old.state() != ConnectionState::Closed {
                        log::debug!("{} already registered as bus.{id}", conn.name());
                        return;
                    }
                    self.remove(id);
                }
                match conn.detect() {
                    Ok(()) => {
                        self.add(conn);
                    }
                    Err(e) => log::warn!("cannot open {}: {e}", conn.name()),
                }
            }
            BusCommand::Remove(name) => match self.find(&name) {
                Some((id, _)) => {
                    self.remove(id);
                }
                None => log::debug!("no bus named {name} to remove"),
            },
            BusCommand::W1Masters(buses) => {
                let listed: BTreeSet<String> = buses.into_iter().map(w1_name).collect();
                for (id, conn) in self.connections() {
                    if conn.kind() == AdapterKind::Netlink && !listed.contains(conn.name()) {
                        log::info!("{} no longer listed by the kernel", conn.name());
                        self.remove(id);
                    }
                }
            }
        }
    }
}

/// Starts the registry-owner thread. It runs until every command sender is gone.
pub fn spawn_registrar(
    registry: Arc<BusRegistry>,
    commands: Receiver<BusCommand>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("bus-registrar".into())
        .spawn(move || {
            for command in commands {
                registry.apply(command);
            }
            log::debug!("bus registrar stopped");
        })
}

/// Name of the connection of kernel bus master `bus`.
pub fn w1_name(bus: u32) -> String {
    format!("w1_bus_master{bus}")
}

/// Kernel bus master indices named in a sysfs directory such as
/// `/sys/bus/w1/devices`.
pub fn w1_sysfs_masters(directory: &Path) -> io::Result<Vec<u32>> {
    let mut buses = Vec::new();
    for entry in fs::read_dir(directory)? {
        let name = entry?.file_name();
        let name = name.to_string_lossy();
        if !name.get(..2).is_some_and(|p| p.eq_ignore_ascii_case("w1")) {
            continue;
        }
        match name.strip_prefix("w1_bus_master").and_then(|n| n.parse::<u32>().ok()) {
            Some(bus) => buses.push(bus),
            None => log::debug!("no bus master index in {}/{name}", directory.display()),
        }
    }
    buses.sort_unstable();
    Ok(buses)
}

fn add_w1<S: NetlinkSocket + 'static>(
    dispatcher: &Dispatcher<S>,
    bus: u32,
    options: &BusOptions,
) -> Option<BusCommand> {
    // A second master for the same index would take over its replies.
    if u16::try_from(bus).is_ok_and(|b| dispatcher.is_registered(b)) {
        log::debug!("{} already open", w1_name(bus));
        return None;
    }
    match dispatcher.master(bus, options.w1_timeout) {
        Ok(master) => Some(BusCommand::Add(Connection::new(
            w1_name(bus),
            Flatten::boxed(AdapterKind::Netlink, master),
            options.clone(),
        ))),
        Err(e) => {
            log::warn!("ignoring w1 bus master {bus}: {e}");
            None
        }
    }
}

/// Asks the kernel for its w1 bus masters.
///
/// The netlink answer is handled by the w1 registrar. When the request cannot be
/// sent, the masters are read from `sysfs` instead and registered directly.
pub fn browse_w1<S: NetlinkSocket + 'static>(
    dispatcher: &Dispatcher<S>,
    sysfs: &Path,
    commands: &Sender<BusCommand>,
    options: &BusOptions,
) -> Result<(), BusError> {
    let e = match dispatcher.list_masters() {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };
    log::info!("w1 netlink list failed ({e}), reading {}", sysfs.display());
    let buses = w1_sysfs_masters(sysfs).map_err(|e| BusError::Io(e.to_string()))?;
    for bus in &buses {
        if let Some(command) = add_w1(dispatcher, *bus, options) {
            commands.send(command).map_err(|_| BusError::Closed)?;
        }
    }
    commands
        .send(BusCommand::W1Masters(buses))
        .map_err(|_| BusError::Closed)
}

/// Turns kernel master announcements into registry commands.
///
/// Runs until the dispatcher's control channel or the command receiver is gone.
pub fn spawn_w1_registrar<S: NetlinkSocket + 'static>(
    dispatcher: Dispatcher<S>,
    control: Receiver<ControlEvent>,
    commands: Sender<BusCommand>,
    options: BusOptions,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("w1-registrar".into())
        .spawn(move || {
            for event in control {
                let command = match event {
                    ControlEvent::MasterAdded(bus) => match add_w1(&dispatcher, bus, &options) {
                        Some(command) => command,
                        None => continue,
                    },
                    ControlEvent::MasterRemoved(bus) => BusCommand::Remove(w1_name(bus)),
                    ControlEvent::MasterList(buses) => BusCommand::W1Masters(buses),
                };
                if commands.send(command).is_err() {
                    break;
                }
            }
            log::debug!("w1 registrar stopped");
        })
}
