//! The kernel side of the w1 connector, answering requests from simulated buses.

use crate::{Command, Message, MessageType, NetlinkSocket, W1Command, codec::W1Id};
use onewire_bus::{
    RomId, Search, SearchKind, BitBanged,
    consts::ONEWIRE_MATCH_ROM_CMD,
    sim::SimBus,
};
use std::{
    collections::BTreeMap,
    io,
    sync::{
        Mutex,
        mpsc::{self, Receiver, Sender},
    },
};

const ENODEV: u8 = 19;

#[derive(Default)]
pub(crate) struct KernelState {
    pub buses: BTreeMap<u32, SimBus>,
    /// Report slave IDs byte-reversed.
    pub reversed: bool,
    /// Swallow requests without answering.
    pub silent: bool,
    pub requests: Vec<Message>,
}

pub(crate) struct SimKernel {
    pub state: Mutex<KernelState>,
    outbox: Mutex<Sender<Vec<u8>>>,
    inbox: Mutex<Receiver<Vec<u8>>>,
}

impl SimKernel {
    pub fn new(buses: impl IntoIterator<Item = (u32, SimBus)>) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            state: Mutex::new(KernelState {
                buses: buses.into_iter().collect(),
                ..Default::default()
            }),
            outbox: Mutex::new(tx),
            inbox: Mutex::new(rx),
        }
    }

    /// Queues a message as if the kernel had sent it.
    pub fn inject(&self, msg: &Message) {
        let buf = msg.encode_reply().unwrap();
        self.outbox.lock().unwrap().send(buf).unwrap();
    }

    fn answer(&self, request: &Message, ack: u32, status: u8, data: Option<Vec<u8>>) {
        let mut reply = request.clone();
        reply.ack = ack;
        reply.status = status;
        match (&mut reply.command, data) {
            (Some(c), Some(data)) => c.data = data,
            (Some(c), None) => c.data.clear(),
            (None, data) => reply.data = data.unwrap_or_default(),
        }
        self.inject(&reply);
    }

    fn master_command(&self, state: &mut KernelState, req: &Message, cmd: &W1Command) {
        let Some(bus) = state.buses.get_mut(&req.id.master_id()) else {
            self.answer(req, 0, ENODEV, None);
            return;
        };
        match cmd.cmd {
            Command::Reset => {
                bus.reset_pulse();
            }
            Command::Touch => {
                let data = cmd.data.iter().map(|b| bus.touch(*b)).collect();
                self.answer(req, 0, 0, Some(data));
            }
            Command::Search | Command::AlarmSearch => {
                let kind = if cmd.cmd == Command::Search {
                    SearchKind::Normal
                } else {
                    SearchKind::Alarmed
                };
                let mut master = BitBanged::new(bus.clone());
                let roms: Vec<RomId> = Search::new(&mut master, kind)
                    .collect::<Result<_, _>>()
                    .unwrap();
                if roms.is_empty() {
                    self.answer(req, 0, 0, Some(Vec::new()));
                }
                for (i, rom) in roms.iter().enumerate() {
                    let mut id = *rom.as_bytes();
                    if state.reversed {
                        id.reverse();
                    }
                    let more = (i + 1 < roms.len()) as u32;
                    self.answer(req, more, 0, Some(id.to_vec()));
                }
            }
            Command::Read | Command::Write => {}
        }
        self.answer(req, 0, 0, None);
    }

    fn slave_command(&self, state: &mut KernelState, req: &Message, cmd: &W1Command) {
        let rom = RomId::new(req.id.0);
        let Some(bus) = state
            .buses
            .values_mut()
            .find(|b| b.devices().iter().any(|d| d.rom() == rom))
        else {
            self.answer(req, 0, ENODEV, None);
            return;
        };
        bus.reset_pulse();
        bus.touch(ONEWIRE_MATCH_ROM_CMD);
        for b in rom.as_bytes() {
            bus.touch(*b);
        }
        let data = cmd.data.iter().map(|b| bus.touch(*b)).collect();
        self.answer(req, 0, 0, Some(data));
        self.answer(req, 0, 0, None);
    }
}

impl NetlinkSocket for SimKernel {
    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let (req, _, _) = Message::decode(buf).map_err(io::Error::other)?;
        let mut state = self.state.lock().unwrap();
        state.requests.push(req.clone());
        if state.silent {
            return Ok(buf.len());
        }
        match (&req.kind, &req.command) {
            (MessageType::MasterCmd, Some(cmd)) => self.master_command(&mut state, &req, cmd),
            (MessageType::SlaveCmd, Some(cmd)) => self.slave_command(&mut state, &req, cmd),
            (MessageType::ListMasters, _) => {
                let ids = state.buses.keys().flat_map(|b| b.to_ne_bytes()).collect();
                self.answer(&req, 0, 0, Some(ids));
            }
            _ => {}
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
        4242
    }
}

/// A master announcement as broadcast by the kernel.
pub(crate) fn announce(kind: MessageType, bus: u32) -> Message {
    let mut msg = Message::list_masters();
    msg.kind = kind;
    msg.id = W1Id::master(bus);
    msg
}
