use crate::{Command, Dispatcher, Message, NetlinkError, NetlinkSocket, SeqTag};
use onewire_bus::{
    AnyDevices, OneWireError, OneWireMaster, OneWireResult, ResetOutcome, RomId, SearchCursor,
    SearchKind,
    consts::{ONEWIRE_SKIP_ROM_CMD, ROM_ID_SIZE},
    crc8,
};
use std::{
    sync::mpsc::{Receiver, RecvTimeoutError},
    time::{Duration, Instant},
};

/// Byte order of slave IDs reported by a bus master.
///
/// Some kernel drivers (the OMAP HDQ master) report IDs byte-reversed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlaveOrder {
    /// Not seen a valid ID yet.
    #[default]
    Unknown,
    /// IDs as they are on the wire.
    Forward,
    /// IDs with their bytes reversed.
    Reversed,
}

impl SlaveOrder {
    /// Decodes one reported ID, learning the order from its CRC8 when unknown.
    pub fn decode(&mut self, raw: [u8; ROM_ID_SIZE]) -> RomId {
        let mut reversed = raw;
        reversed.reverse();
        match self {
            Self::Forward => RomId::new(raw),
            Self::Reversed => RomId::new(reversed),
            Self::Unknown => {
                if crc8(&raw) == 0 {
                    *self = Self::Forward;
                    RomId::new(raw)
                } else {
                    *self = Self::Reversed;
                    RomId::new(reversed)
                }
            }
        }
    }
}

/// What a request waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    /// Only the status message.
    Status,
    /// One data message, then the status message.
    Data,
    /// Data messages until one has a zero `ack`, then the status message.
    List,
}

/// A kernel w1 bus master (`w1_bus_masterN`).
///
/// Requests carry this master's index and a wrapping 16-bit counter in their
/// sequence number; the dispatcher routes the replies back to this master's
/// private channel.
pub struct W1Master<S> {
    dispatcher: Dispatcher<S>,
    bus: u32,
    tag_bus: u16,
    replies: Option<Receiver<Message>>,
    seq: u16,
    timeout: Duration,
    order: SlaveOrder,
    selected: Option<RomId>,
    any_devices: AnyDevices,
}

impl<S: NetlinkSocket> W1Master<S> {
    /// Registers bus master `bus` with the dispatcher.
    pub fn new(dispatcher: Dispatcher<S>, bus: u32, timeout: Duration) -> Result<Self, NetlinkError> {
        let tag_bus = u16::try_from(bus)
            .ok()
            .filter(|b| *b != 0)
            .ok_or(NetlinkError::Malformed("bus master index out of range"))?;
        let replies = Some(dispatcher.register(tag_bus));
        log::info!("opened w1_bus_master{bus}");
        Ok(Self {
            dispatcher,
            bus,
            tag_bus,
            replies,
            seq: 0,
            timeout,
            order: SlaveOrder::Unknown,
            selected: None,
            any_devices: AnyDevices::Unknown,
        })
    }

    /// Kernel index of this bus master.
    pub fn bus(&self) -> u32 {
        self.bus
    }

    /// Slave ID byte order seen so far.
    pub fn slave_order(&self) -> SlaveOrder {
        self.order
    }

    /// Whether the reply channel is open.
    pub fn is_open(&self) -> bool {
        self.replies.is_some()
    }

    /// Registers the reply channel again after a close.
    pub fn open(&mut self) {
        self.replies = Some(self.dispatcher.register(self.tag_bus));
        self.selected = None;
        log::info!("reopened w1_bus_master{}", self.bus);
    }

    fn next_tag(&mut self) -> SeqTag {
        self.seq = self.seq.wrapping_add(1);
        SeqTag::new(self.tag_bus, self.seq)
    }

    fn exchange(&mut self, mut msg: Message, expect: Expect) -> Result<Vec<Message>, NetlinkError> {
        msg.tag = self.next_tag();
        let timeout = self.timeout;
        let Some(replies) = &self.replies else {
            return Err(NetlinkError::Disconnected);
        };
        // Late replies to an earlier request that timed out.
        for stale in replies.try_iter() {
            log::debug!("w1_bus_master{} dropping stale reply {:?}", self.bus, stale.tag);
        }
        self.dispatcher.send(&msg)?;
        let deadline = Instant::now() + timeout;
        let mut data = Vec::new();
        let mut want_data = expect != Expect::Status;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            let reply = match replies.recv_timeout(left) {
                Ok(reply) => reply,
                Err(RecvTimeoutError::Timeout) => {
                    log::debug!("w1_bus_master{} timed out on {:?}", self.bus, msg.tag);
                    return Err(NetlinkError::Timeout(timeout));
                }
                Err(RecvTimeoutError::Disconnected) => return Err(NetlinkError::Disconnected),
            };
            if reply.tag.seq != msg.tag.seq {
                log::debug!("w1 sequence number {:?} out of order", reply.tag);
                continue;
            }
            if reply.status != 0 {
                return Err(NetlinkError::Status(reply.status));
            }
            if !want_data {
                return Ok(data);
            }
            let more = expect == Expect::List && reply.ack != 0;
            data.push(reply);
            want_data = more;
        }
    }

    fn touch(&mut self, msg: Message, out: &[u8], input: &mut [u8]) -> Result<usize, NetlinkError> {
        let replies = self.exchange(msg, Expect::Data)?;
        let received = replies.first().map(|r| r.payload()).unwrap_or_default();
        if received.len() != out.len() {
            return Err(NetlinkError::Length {
                expected: out.len(),
                received: received.len(),
            });
        }
        input[..received.len()].copy_from_slice(received);
        Ok(received.len())
    }

    fn list(&mut self, kind: SearchKind) -> Result<Vec<RomId>, NetlinkError> {
        let cmd = match kind {
            SearchKind::Normal => Command::Search,
            SearchKind::Alarmed => Command::AlarmSearch,
        };
        let replies = self.exchange(Message::master_command(self.bus, cmd, &[]), Expect::List)?;
        let mut roms = Vec::new();
        for reply in &replies {
            for raw in reply.payload().chunks_exact(ROM_ID_SIZE) {
                let mut id = [0u8; ROM_ID_SIZE];
                id.copy_from_slice(raw);
                roms.push(self.order.decode(id));
            }
        }
        log::debug!("w1_bus_master{} lists {} devices", self.bus, roms.len());
        Ok(roms)
    }
}

impl<S: NetlinkSocket> OneWireMaster for W1Master<S> {
    type Error = NetlinkError;

    fn reset(&mut self) -> OneWireResult<ResetOutcome, Self::Error> {
        self.selected = None;
        match self.exchange(Message::master_command(self.bus, Command::Reset, &[]), Expect::Status) {
            Ok(_) => Ok(ResetOutcome::Ok),
            Err(NetlinkError::Status(status)) => {
                log::debug!("w1_bus_master{} reset failed with status {status}", self.bus);
                Ok(ResetOutcome::Error)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The first transfer after selecting a device goes out as a slave command,
    /// which the kernel precedes with reset and Match ROM.
    fn write_read(&mut self, out: &[u8], input: &mut [u8]) -> OneWireResult<usize, Self::Error> {
        if input.len() < out.len() {
            return Err(OneWireError::ShortRead {
                expected: out.len(),
                received: input.len(),
            });
        }
        match self.selected.take() {
            Some(rom) => match self.touch(Message::slave_command(&rom, Command::Touch, out), out, input) {
                Err(NetlinkError::Status(status)) => {
                    log::debug!("w1 slave {rom} not answering (status {status})");
                    Err(OneWireError::NoDevicePresent)
                }
                r => Ok(r?),
            },
            None => Ok(self.touch(Message::master_command(self.bus, Command::Touch, out), out, input)?),
        }
    }

    /// The kernel lists the whole bus in one exchange; the list is kept in the cursor.
    fn search_next(
        &mut self,
        cursor: &mut SearchCursor,
    ) -> OneWireResult<Option<RomId>, Self::Error> {
        if !cursor.is_gulped() {
            let mut roms = self.list(cursor.kind())?;
            if let Some(family) = cursor.family() {
                roms.retain(|r| r.family() == family);
            }
            self.any_devices = (!roms.is_empty()).into();
            cursor.store_gulp(roms);
        }
        Ok(cursor.next_gulped())
    }

    fn any_devices(&self) -> AnyDevices {
        self.any_devices
    }

    fn select(&mut self, rom: Option<&RomId>) -> OneWireResult<(), Self::Error> {
        match rom {
            Some(rom) => {
                self.selected = Some(*rom);
                Ok(())
            }
            None => {
                match self.reset()? {
                    ResetOutcome::Ok => {}
                    ResetOutcome::Short => return Err(OneWireError::ShortCircuit),
                    ResetOutcome::Error => return Err(OneWireError::ResetFailed),
                }
                let skip = [ONEWIRE_SKIP_ROM_CMD];
                let mut echo = [0u8; 1];
                self.write_read(&skip, &mut echo)?;
                if echo != skip {
                    return Err(OneWireError::EchoMismatch);
                }
                Ok(())
            }
        }
    }

    fn close(&mut self) {
        if self.replies.take().is_none() {
            log::debug!("w1_bus_master{} already closed", self.bus);
            return;
        }
        self.dispatcher.unregister(self.tag_bus);
        self.selected = None;
        self.any_devices = AnyDevices::Unknown;
        log::info!("closed w1_bus_master{}", self.bus);
    }
}

impl<S> Drop for W1Master<S> {
    fn drop(&mut self) {
        if self.replies.take().is_some() {
            self.dispatcher.unregister(self.tag_bus);
            log::debug!("dropped w1_bus_master{}", self.bus);
        }
    }
}
