use crate::{
    Message, MessageType, NetlinkError, SeqTag, W1Master,
    codec::{NLM_LENGTH, master_list},
};
use std::{
    collections::HashMap,
    io,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU16, Ordering},
        mpsc::{self, Receiver, Sender},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

/// Largest message read from the socket.
const RECV_BUFFER: usize = 64 * 1024;

/// A bound `NETLINK_CONNECTOR` socket subscribed to the w1 group.
///
/// `send` is called by transaction threads and `recv` only by the dispatcher.
pub trait NetlinkSocket: Send + Sync {
    /// Sends one datagram.
    fn send(&self, buf: &[u8]) -> io::Result<usize>;

    /// Blocks for one datagram.
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Netlink port id of this socket.
    fn port_id(&self) -> u32;
}

/// Traffic of the control channel (bus index 0).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// The kernel announced or listed a bus master.
    MasterAdded(u32),
    /// The kernel removed a bus master.
    MasterRemoved(u32),
    /// The complete list of bus masters, after their `MasterAdded` events.
    /// Masters missing from it are gone.
    MasterList(Vec<u32>),
}

type Routes = Mutex<HashMap<u16, Sender<Message>>>;

/// Handle to the reader thread that routes kernel replies to their bus.
///
/// Every bus master owns a private channel keyed by its index; the index travels
/// in the high half of the sequence number. Master announcements and the replies
/// to [`list_masters`](Dispatcher::list_masters) go to the control channel.
pub struct Dispatcher<S> {
    socket: Arc<S>,
    routes: Arc<Routes>,
    control_seq: Arc<AtomicU16>,
}

impl<S> Clone for Dispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            socket: self.socket.clone(),
            routes: self.routes.clone(),
            control_seq: self.control_seq.clone(),
        }
    }
}

impl<S> Dispatcher<S> {
    /// Closes the reply channel of bus master `bus`.
    pub fn unregister(&self, bus: u16) {
        lock(&self.routes).remove(&bus);
    }

    /// Whether bus master `bus` has a reply channel.
    pub fn is_registered(&self, bus: u16) -> bool {
        lock(&self.routes).contains_key(&bus)
    }
}

fn lock(routes: &Routes) -> MutexGuard<'_, HashMap<u16, Sender<Message>>> {
    routes.lock().unwrap_or_else(|e| e.into_inner())
}

impl<S: NetlinkSocket + 'static> Dispatcher<S> {
    /// Starts the reader thread.
    ///
    /// Returns the handle, the receiving end of the control channel and the thread.
    /// The thread ends when the socket fails or the control receiver is dropped.
    pub fn spawn(socket: S) -> io::Result<(Self, Receiver<ControlEvent>, JoinHandle<()>)> {
        let socket = Arc::new(socket);
        let routes = Arc::new(Routes::default());
        let (control_tx, control_rx) = mpsc::channel();
        let handle = {
            let socket = socket.clone();
            let routes = routes.clone();
            thread::Builder::new()
                .name("w1-dispatch".into())
                .spawn(move || run(&*socket, &routes, &control_tx))?
        };
        log::info!("w1 netlink dispatcher started on port {}", socket.port_id());
        Ok((
            Self {
                socket,
                routes,
                control_seq: Arc::new(AtomicU16::new(0)),
            },
            control_rx,
            handle,
        ))
    }
}

impl<S: NetlinkSocket> Dispatcher<S> {
    /// The shared socket.
    pub fn socket(&self) -> &S {
        &self.socket
    }

    /// Opens the private reply channel of bus master `bus`.
    ///
    /// Registering a bus again replaces its channel.
    pub fn register(&self, bus: u16) -> Receiver<Message> {
        let (tx, rx) = mpsc::channel();
        if lock(&self.routes).insert(bus, tx).is_some() {
            log::debug!("w1_bus_master{bus} registered again");
        }
        rx
    }

    /// Sends a request tagged with its sequence number.
    pub fn send(&self, msg: &Message) -> Result<(), NetlinkError> {
        let buf = msg.encode(self.socket.port_id())?;
        log::trace!("w1 send {:?} seq={:?} {:02x?}", msg.kind, msg.tag, msg.payload());
        self.socket.send(&buf)?;
        Ok(())
    }

    /// Asks the kernel for its bus masters.
    ///
    /// The answer arrives on the control channel as [`ControlEvent::MasterAdded`] events
    /// followed by one [`ControlEvent::MasterList`].
    pub fn list_masters(&self) -> Result<(), NetlinkError> {
        let seq = self.control_seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let mut msg = Message::list_masters();
        msg.tag = SeqTag::new(0, seq);
        log::debug!("listing w1 bus masters");
        self.send(&msg)
    }

    /// Creates the bus master for kernel index `bus`.
    pub fn master(&self, bus: u32, timeout: Duration) -> Result<W1Master<S>, NetlinkError> {
        W1Master::new(self.clone(), bus, timeout)
    }
}

fn run<S: NetlinkSocket + ?Sized>(socket: &S, routes: &Routes, control: &Sender<ControlEvent>) {
    let mut buf = vec![0u8; RECV_BUFFER];
    loop {
        let n = match socket.recv(&mut buf) {
            Ok(0) => {
                log::info!("w1 netlink socket closed");
                return;
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::warn!("w1 netlink receive failed: {e}");
                return;
            }
        };
        if n < NLM_LENGTH {
            log::debug!("w1 netlink runt of {n} bytes");
            continue;
        }
        let msg = match Message::parse(&buf[..n]) {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!("w1 netlink message dropped: {e}");
                continue;
            }
        };
        if !route(msg, routes, control) {
            log::info!("w1 control channel closed, dispatcher stopping");
            return;
        }
    }
}

/// Delivers one parsed message. Returns `false` once the control channel is gone.
pub(crate) fn route(msg: Message, routes: &Routes, control: &Sender<ControlEvent>) -> bool {
    log::trace!("w1 recv {:?} seq={:?} status={}", msg.kind, msg.tag, msg.status);
    match msg.kind {
        MessageType::MasterAdd => control
            .send(ControlEvent::MasterAdded(msg.id.master_id()))
            .is_ok(),
        MessageType::MasterRemove => control
            .send(ControlEvent::MasterRemoved(msg.id.master_id()))
            .is_ok(),
        MessageType::SlaveAdd | MessageType::SlaveRemove => {
            log::debug!("w1 slave announcement {:?} {:02x?}", msg.kind, msg.id.0);
            true
        }
        MessageType::ListMasters if msg.tag.bus == 0 => {
            let buses = master_list(&msg);
            buses
                .iter()
                .all(|bus| control.send(ControlEvent::MasterAdded(*bus)).is_ok())
                && control.send(ControlEvent::MasterList(buses)).is_ok()
        }
        _ => {
            let bus = msg.tag.bus;
            let mut routes = lock(routes);
            match routes.get(&bus).map(|tx| tx.send(msg).is_ok()) {
                Some(true) => {}
                Some(false) => {
                    log::debug!("w1_bus_master{bus} is gone, dropping its channel");
                    routes.remove(&bus);
                }
                None => log::debug!("w1 message for unknown w1_bus_master{bus}"),
            }
            true
        }
    }
}
