mod common;

use common::{FakeUsb, Flaky, ROM_A, ROM_B, eventually, sim_bus};
use onewire_bus::{ResetOutcome, RomId, SearchKind};
use owfs_bus::{
    AdapterKind, BusCommand, BusError, BusOptions, BusRegistry, Connection, ConnectionState,
    UsbDirectory, UsbLocation, UsbMonitor, browse_w1, spawn_registrar, spawn_w1_registrar,
    w1_name, w1_sysfs_masters,
};
use std::{
    io,
    sync::{
        Arc, Mutex,
        mpsc::{self, Receiver, Sender},
    },
    time::Duration,
};
use w1_netlink::{ControlEvent, Dispatcher, Message, MessageType, NetlinkSocket, codec::W1Id};

fn tag() -> RomId {
    RomId::with_crc([0x81, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66])
}

fn options() -> BusOptions {
    BusOptions::default()
        .with_reconnect_delay(Duration::from_millis(1))
        .with_usb_scan_interval(Duration::from_millis(10))
}

fn at(bus: u8, address: u8) -> UsbLocation {
    UsbLocation { bus, address }
}

#[test]
fn reconnect_finds_the_tagged_adapter_at_its_new_address() {
    let usb = FakeUsb::default();
    usb.plug(1, 2, &[ROM_A, tag()]);
    let directory = UsbDirectory::new(usb.clone());
    let claim = directory.claim_nth(0).unwrap();
    assert_eq!(claim.identity, tag());
    let conn = Connection::usb(claim, directory.clone(), options());
    assert_eq!(conn.location(), Some(at(1, 2)));

    // Replugged: an untagged adapter now comes first in the scan.
    usb.unplug(1, 2);
    usb.plug(1, 3, &[ROM_B]);
    usb.plug(1, 7, &[tag(), ROM_A]);
    conn.reconnect().unwrap();

    assert_eq!(conn.location(), Some(at(1, 7)));
    assert_eq!(conn.identity(), tag());
    assert_eq!(directory.claimed(), vec![at(1, 7)]);
    assert_eq!(conn.devices(SearchKind::Normal).unwrap(), vec![ROM_A, tag()]);
}

#[test]
fn reconnect_without_the_adapter_is_a_loss() {
    let usb = FakeUsb::default();
    usb.plug(1, 2, &[tag()]);
    let directory = UsbDirectory::new(usb.clone());
    let conn = Connection::usb(directory.claim_nth(0).unwrap(), directory.clone(), options());
    usb.unplug(1, 2);
    usb.plug(1, 3, &[ROM_B]);
    let err = conn.reconnect().unwrap_err();
    assert!(matches!(err, BusError::ReconnectFailed(_)));
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert!(directory.claimed().is_empty());
}

#[test]
fn untagged_adapter_keeps_its_location() {
    let usb = FakeUsb::default();
    usb.plug(1, 2, &[]);
    let directory = UsbDirectory::new(usb.clone());
    let claim = directory.claim_nth(0).unwrap();
    assert_eq!(claim.identity, RomId::ZERO);
    let conn = Connection::usb(claim, directory.clone(), options());

    // A tagged adapter that scans first is another device.
    usb.plug(1, 1, &[ROM_B]);
    conn.reconnect().unwrap();
    assert_eq!(conn.location(), Some(at(1, 2)));
    assert_eq!(directory.claimed(), vec![at(1, 2)]);
}

#[test]
fn untagged_adapter_does_not_move() {
    let usb = FakeUsb::default();
    usb.plug(2, 5, &[]);
    let directory = UsbDirectory::new(usb.clone());
    let conn = Connection::usb(directory.claim_nth(0).unwrap(), directory.clone(), options());
    usb.unplug(2, 5);
    usb.plug(2, 9, &[]);
    let err = conn.reconnect().unwrap_err();
    assert!(matches!(err, BusError::ReconnectFailed(_)));
    assert_eq!(conn.location(), Some(at(2, 5)));
    assert!(directory.claimed().is_empty());

    // Back at its old address it is taken again.
    usb.unplug(2, 9);
    usb.plug(2, 5, &[]);
    conn.reconnect().unwrap();
    assert_eq!(conn.state(), ConnectionState::Open);
    assert_eq!(directory.claimed(), vec![at(2, 5)]);
}

#[test]
fn untagged_location_with_a_tagged_adapter_is_a_loss() {
    let usb = FakeUsb::default();
    usb.plug(2, 5, &[]);
    let directory = UsbDirectory::new(usb.clone());
    let conn = Connection::usb(directory.claim_nth(0).unwrap(), directory.clone(), options());
    usb.plug(2, 5, &[ROM_A]);
    assert!(matches!(conn.reconnect(), Err(BusError::ReconnectFailed(_))));
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert!(directory.claimed().is_empty());
}

#[test]
fn claimed_locations_are_skipped() {
    let usb = FakeUsb::default();
    usb.plug(1, 2, &[ROM_A]);
    usb.plug(1, 3, &[ROM_B]);
    let directory = UsbDirectory::new(usb.clone());
    assert_eq!(directory.claim_nth(0).unwrap().location, at(1, 2));
    assert_eq!(directory.claim_nth(0).unwrap().location, at(1, 3));
    assert!(matches!(directory.claim_nth(0), Err(BusError::Config(_))));
    assert!(directory.claim_new().is_empty());
    directory.release(at(1, 2));
    assert_eq!(directory.claim_new().len(), 1);
}

#[test]
fn registrar_adds_and_removes_buses() {
    let registry = Arc::new(BusRegistry::new());
    let (tx, rx) = mpsc::channel();
    let thread = spawn_registrar(registry.clone(), rx).unwrap();

    let (adapter, faults) = Flaky::new(AdapterKind::MemoryMapped, sim_bus(&[ROM_A]));
    tx.send(BusCommand::Add(Connection::new("ds1wm", adapter, options())))
        .unwrap();
    assert!(eventually(|| registry.len() == 1));
    let (id, conn) = registry.find("ds1wm").unwrap();
    assert_eq!(conn.state(), ConnectionState::Open);
    assert_eq!(conn.reset().unwrap(), ResetOutcome::Ok);

    // The same name again is ignored while the bus is open.
    let (again, _) = Flaky::new(AdapterKind::MemoryMapped, sim_bus(&[]));
    tx.send(BusCommand::Add(Connection::new("ds1wm", again, options())))
        .unwrap();
    tx.send(BusCommand::Remove("ds1wm".into())).unwrap();
    assert!(eventually(|| registry.is_empty()));
    assert!(registry.get(id).is_none());
    assert!(eventually(|| faults.lock().unwrap().closes == 1));

    drop(tx);
    thread.join().unwrap();
}

#[test]
fn broken_adapter_is_not_registered() {
    let registry = BusRegistry::new();
    let (adapter, faults) = Flaky::new(AdapterKind::MemoryMapped, sim_bus(&[ROM_A]));
    faults.lock().unwrap().fail_open = true;
    registry.apply(BusCommand::Add(Connection::new("broken", adapter, options())));
    assert!(registry.is_empty());
}

#[test]
fn monitor_registers_plugged_adapters() {
    let usb = FakeUsb::default();
    usb.plug(1, 2, &[tag()]);
    let directory = UsbDirectory::new(usb.clone());
    let registry = Arc::new(BusRegistry::new());
    let (tx, rx) = mpsc::channel();
    let registrar = spawn_registrar(registry.clone(), rx).unwrap();
    let monitor = UsbMonitor::spawn(directory.clone(), tx, options()).unwrap();

    assert!(eventually(|| registry.len() == 1));
    assert!(registry.find("DS9490 at 1:2").is_some());
    usb.plug(1, 4, &[ROM_A]);
    assert!(eventually(|| registry.len() == 2));
    assert_eq!(directory.claimed(), vec![at(1, 2), at(1, 4)]);
    // Each adapter is opened once; claimed ones are not probed again.
    assert_eq!(usb.opened.lock().unwrap().len(), 2);

    monitor.stop();
    registrar.join().unwrap();
    registry.close_all();
    assert!(directory.claimed().is_empty());
}

/// A netlink socket that only delivers announcements pushed by the test.
struct Announcer {
    inbox: Mutex<Receiver<Vec<u8>>>,
    /// Sending fails, as without netlink permission.
    refuse: bool,
}

impl Announcer {
    fn spawn(refuse: bool) -> (Sender<Vec<u8>>, Dispatcher<Announcer>, Receiver<ControlEvent>) {
        let (kernel, inbox) = mpsc::channel();
        let (dispatcher, control, _reader) = Dispatcher::spawn(Announcer {
            inbox: Mutex::new(inbox),
            refuse,
        })
        .unwrap();
        (kernel, dispatcher, control)
    }
}

impl NetlinkSocket for Announcer {
    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        if self.refuse {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied));
        }
        Ok(buf.len())
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let msg = self
            .inbox
            .lock()
            .unwrap()
            .recv()
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        buf[..msg.len()].copy_from_slice(&msg);
        Ok(msg.len())
    }

    fn port_id(&self) -> u32 {
        77
    }
}

fn announce(kernel: &Sender<Vec<u8>>, kind: MessageType, bus: u32) {
    let mut msg = Message::list_masters();
    msg.kind = kind;
    msg.id = W1Id::master(bus);
    kernel.send(msg.encode_reply().unwrap()).unwrap();
}

fn list(kernel: &Sender<Vec<u8>>, buses: &[u32]) {
    let mut msg = Message::list_masters();
    msg.data = buses.iter().flat_map(|b| b.to_ne_bytes()).collect();
    kernel.send(msg.encode_reply().unwrap()).unwrap();
}

#[test]
fn w1_announcements_follow_the_kernel() {
    let (kernel, dispatcher, control) = Announcer::spawn(false);
    let registry = Arc::new(BusRegistry::new());
    let (tx, rx) = mpsc::channel();
    let registrar = spawn_registrar(registry.clone(), rx).unwrap();
    let bridge = spawn_w1_registrar(dispatcher.clone(), control, tx, options()).unwrap();

    announce(&kernel, MessageType::MasterAdd, 2);
    assert!(eventually(|| registry.find(&w1_name(2)).is_some()));
    assert!(dispatcher.is_registered(2));
    // A repeated announcement does not replace the open master.
    announce(&kernel, MessageType::MasterAdd, 2);
    announce(&kernel, MessageType::MasterAdd, 5);
    assert!(eventually(|| registry.len() == 2));

    announce(&kernel, MessageType::MasterRemove, 2);
    assert!(eventually(|| registry.find(&w1_name(2)).is_none()));
    assert!(eventually(|| !dispatcher.is_registered(2)));
    assert_eq!(registry.len(), 1);

    drop(kernel);
    bridge.join().unwrap();
    registrar.join().unwrap();
}

#[test]
fn kernel_listing_drops_vanished_masters() {
    let (kernel, dispatcher, control) = Announcer::spawn(false);
    let registry = Arc::new(BusRegistry::new());
    let (tx, rx) = mpsc::channel();
    let registrar = spawn_registrar(registry.clone(), rx).unwrap();
    let bridge = spawn_w1_registrar(dispatcher.clone(), control, tx, options()).unwrap();

    announce(&kernel, MessageType::MasterAdd, 2);
    announce(&kernel, MessageType::MasterAdd, 5);
    assert!(eventually(|| registry.len() == 2));

    list(&kernel, &[5, 6]);
    assert!(eventually(|| registry.find(&w1_name(6)).is_some()));
    assert!(eventually(|| registry.find(&w1_name(2)).is_none()));
    assert!(registry.find(&w1_name(5)).is_some());
    assert!(eventually(|| !dispatcher.is_registered(2)));
    assert_eq!(registry.len(), 2);

    drop(kernel);
    bridge.join().unwrap();
    registrar.join().unwrap();
}

#[test]
fn sysfs_lists_bus_masters() {
    let dir = tempfile::tempdir().unwrap();
    for name in ["w1_bus_master4", "w1_bus_master1", "28-000001234567", "w1_bus_masterX"] {
        std::fs::create_dir(dir.path().join(name)).unwrap();
    }
    assert_eq!(w1_sysfs_masters(dir.path()).unwrap(), vec![1, 4]);
    assert!(w1_sysfs_masters(&dir.path().join("missing")).is_err());
}

#[test]
fn failed_netlink_list_falls_back_to_sysfs() {
    let dir = tempfile::tempdir().unwrap();
    for name in ["w1_bus_master1", "w1_bus_master4"] {
        std::fs::create_dir(dir.path().join(name)).unwrap();
    }
    let (kernel, dispatcher, control) = Announcer::spawn(true);
    let registry = Arc::new(BusRegistry::new());
    let (tx, rx) = mpsc::channel();
    let registrar = spawn_registrar(registry.clone(), rx).unwrap();
    let bridge = spawn_w1_registrar(dispatcher.clone(), control, tx.clone(), options()).unwrap();

    // Announced earlier, no longer in sysfs.
    announce(&kernel, MessageType::MasterAdd, 7);
    assert!(eventually(|| registry.find(&w1_name(7)).is_some()));

    browse_w1(&dispatcher, dir.path(), &tx, &options()).unwrap();
    assert!(eventually(|| registry.find(&w1_name(7)).is_none()));
    let mut names: Vec<String> = registry
        .connections()
        .iter()
        .map(|(_, c)| c.name().to_string())
        .collect();
    names.sort();
    assert_eq!(names, vec![w1_name(1), w1_name(4)]);
    assert!(dispatcher.is_registered(1) && dispatcher.is_registered(4));

    drop(tx);
    drop(kernel);
    bridge.join().unwrap();
    registrar.join().unwrap();
}
