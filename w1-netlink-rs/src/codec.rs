//! Wire layout of w1 connector messages.
//!
//! A message is a `nlmsghdr`, a `cn_msg`, a `w1_netlink_msg` and, for master and
//! slave commands, one `w1_netlink_cmd`, all packed and in host byte order.

use crate::NetlinkError;
use onewire_bus::{RomId, consts::ROM_ID_SIZE};

/// Connector index of the w1 subsystem.
pub const CN_W1_IDX: u32 = 3;
/// Connector value of the w1 subsystem.
pub const CN_W1_VAL: u32 = 1;

/// `NLMSG_DONE`: every w1 message travels as the last part of a multipart message.
pub const NLMSG_DONE: u16 = 3;
const NLM_F_REQUEST: u16 = 0x01;
const NLM_F_ACK: u16 = 0x04;

/// Size of `struct nlmsghdr`.
pub const NLM_LENGTH: usize = 16;
/// Size of `struct cn_msg`.
pub const CN_LENGTH: usize = 20;
/// Size of `struct w1_netlink_msg`.
pub const W1M_LENGTH: usize = 12;
/// Size of `struct w1_netlink_cmd`.
pub const W1C_LENGTH: usize = 4;

/// Largest payload carried by one command.
pub const MAX_DATA: usize = u16::MAX as usize - CN_LENGTH - W1M_LENGTH - W1C_LENGTH;

const fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// `enum w1_netlink_message_types`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// A slave appeared.
    SlaveAdd = 0,
    /// A slave disappeared.
    SlaveRemove = 1,
    /// A bus master appeared.
    MasterAdd = 2,
    /// A bus master disappeared.
    MasterRemove = 3,
    /// Command to a bus master.
    MasterCmd = 4,
    /// Command to a slave; the kernel resets and matches it first.
    SlaveCmd = 5,
    /// List the bus masters.
    ListMasters = 6,
}

impl TryFrom<u8> for MessageType {
    type Error = NetlinkError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::SlaveAdd,
            1 => Self::SlaveRemove,
            2 => Self::MasterAdd,
            3 => Self::MasterRemove,
            4 => Self::MasterCmd,
            5 => Self::SlaveCmd,
            6 => Self::ListMasters,
            _ => return Err(NetlinkError::Malformed("unknown w1 message type")),
        })
    }
}

/// `enum w1_commands`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Read bytes.
    Read = 0,
    /// Write bytes.
    Write = 1,
    /// List the devices.
    Search = 2,
    /// List the devices in alarm state.
    AlarmSearch = 3,
    /// Write bytes and return the bytes sampled meanwhile.
    Touch = 4,
    /// Reset the bus.
    Reset = 5,
}

impl TryFrom<u8> for Command {
    type Error = NetlinkError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Read,
            1 => Self::Write,
            2 => Self::Search,
            3 => Self::AlarmSearch,
            4 => Self::Touch,
            5 => Self::Reset,
            _ => return Err(NetlinkError::Malformed("unknown w1 command")),
        })
    }
}

/// The netlink sequence number: bus index in the high half, per-bus counter in the low half.
///
/// Replies carry the request's number, which routes them back to the bus that asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SeqTag {
    /// Bus master index; 0 is the control channel.
    pub bus: u16,
    /// Per-bus counter.
    pub seq: u16,
}

impl SeqTag {
    /// Tag for `bus` and counter `seq`.
    pub fn new(bus: u16, seq: u16) -> Self {
        Self { bus, seq }
    }

    /// Raw 32-bit sequence number.
    pub fn to_u32(self) -> u32 {
        (u32::from(self.bus) << 16) | u32::from(self.seq)
    }

    /// Splits a raw sequence number.
    pub fn from_u32(raw: u32) -> Self {
        Self {
            bus: (raw >> 16) as u16,
            seq: raw as u16,
        }
    }
}

/// The 8 byte id union of `w1_netlink_msg`: a slave ROM ID or a master index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct W1Id(pub [u8; ROM_ID_SIZE]);

impl W1Id {
    /// Id of bus master `id`.
    pub fn master(id: u32) -> Self {
        let mut raw = [0u8; ROM_ID_SIZE];
        raw[..4].copy_from_slice(&id.to_ne_bytes());
        Self(raw)
    }

    /// Id of a slave.
    pub fn slave(rom: &RomId) -> Self {
        Self(*rom.as_bytes())
    }

    /// The master index.
    pub fn master_id(&self) -> u32 {
        u32::from_ne_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }
}

/// A `w1_netlink_cmd` with its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct W1Command {
    /// Command code.
    pub cmd: Command,
    /// Data written, or returned by the kernel.
    pub data: Vec<u8>,
}

/// A decoded w1 connector message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Sequence number of the request this message belongs to.
    pub tag: SeqTag,
    /// Sender port; 0 for the kernel.
    pub pid: u32,
    /// Connector acknowledge field; non-zero on replies with more parts to come.
    pub ack: u32,
    /// Message type.
    pub kind: MessageType,
    /// Status reported by the kernel; non-zero is an errno.
    pub status: u8,
    /// Master or slave id.
    pub id: W1Id,
    /// Command of master and slave commands.
    pub command: Option<W1Command>,
    /// Payload of messages without a command (e.g. the master list).
    pub data: Vec<u8>,
}

impl Message {
    /// A command addressed to bus master `bus`.
    pub fn master_command(bus: u32, cmd: Command, data: &[u8]) -> Self {
        Self::request(MessageType::MasterCmd, W1Id::master(bus), Some(cmd), data)
    }

    /// A command addressed to one slave.
    pub fn slave_command(rom: &RomId, cmd: Command, data: &[u8]) -> Self {
        Self::request(MessageType::SlaveCmd, W1Id::slave(rom), Some(cmd), data)
    }

    /// A request for the list of bus masters.
    pub fn list_masters() -> Self {
        Self::request(MessageType::ListMasters, W1Id::master(0), None, &[])
    }

    fn request(kind: MessageType, id: W1Id, cmd: Option<Command>, data: &[u8]) -> Self {
        let (command, data) = match cmd {
            Some(cmd) => (
                Some(W1Command {
                    cmd,
                    data: data.to_vec(),
                }),
                Vec::new(),
            ),
            None => (None, data.to_vec()),
        };
        Self {
            tag: SeqTag::new(0, 0),
            pid: 0,
            ack: 0,
            kind,
            status: 0,
            id,
            command,
            data,
        }
    }

    /// Bytes returned by the command, or the message payload.
    pub fn payload(&self) -> &[u8] {
        match &self.command {
            Some(c) => &c.data,
            None => &self.data,
        }
    }

    /// Serializes the message as a request from port `pid`.
    ///
    /// The connector `ack` is set to the sequence number so the kernel answers.
    pub fn encode(&self, pid: u32) -> Result<Vec<u8>, NetlinkError> {
        let data = self.payload();
        if data.len() > MAX_DATA {
            return Err(NetlinkError::TooLong(data.len()));
        }
        let w1c_len = if self.command.is_some() { W1C_LENGTH } else { 0 };
        let payload = CN_LENGTH + W1M_LENGTH + w1c_len + data.len();
        let nlm_len = NLM_LENGTH + payload;
        let seq = self.tag.to_u32();

        let mut buf = Vec::with_capacity(align4(nlm_len));
        // nlmsghdr
        buf.extend_from_slice(&(nlm_len as u32).to_ne_bytes());
        buf.extend_from_slice(&NLMSG_DONE.to_ne_bytes());
        buf.extend_from_slice(&(NLM_F_REQUEST | NLM_F_ACK).to_ne_bytes());
        buf.extend_from_slice(&seq.to_ne_bytes());
        buf.extend_from_slice(&pid.to_ne_bytes());
        // cn_msg
        let cn_len = (payload - CN_LENGTH) as u16;
        buf.extend_from_slice(&CN_W1_IDX.to_ne_bytes());
        buf.extend_from_slice(&CN_W1_VAL.to_ne_bytes());
        buf.extend_from_slice(&seq.to_ne_bytes());
        buf.extend_from_slice(&seq.to_ne_bytes());
        buf.extend_from_slice(&cn_len.to_ne_bytes());
        buf.extend_from_slice(&0u16.to_ne_bytes());
        // w1_netlink_msg
        buf.push(self.kind as u8);
        buf.push(self.status);
        buf.extend_from_slice(&(cn_len - W1M_LENGTH as u16).to_ne_bytes());
        buf.extend_from_slice(&self.id.0);
        // w1_netlink_cmd
        if let Some(c) = &self.command {
            buf.push(c.cmd as u8);
            buf.push(0);
            buf.extend_from_slice(&(c.data.len() as u16).to_ne_bytes());
        }
        buf.extend_from_slice(data);
        buf.resize(align4(nlm_len), 0);
        Ok(buf)
    }

    /// Parses one message received from the kernel.
    ///
    /// Messages not sent by the kernel, of a type other than `NLMSG_DONE`, or
    /// whose netlink and connector sequence numbers differ are rejected.
    pub fn parse(buf: &[u8]) -> Result<Self, NetlinkError> {
        let (msg, nlm_type, cn_seq) = Self::decode(buf)?;
        if msg.pid != 0 {
            return Err(NetlinkError::Rejected("not from the kernel"));
        }
        if nlm_type != NLMSG_DONE {
            return Err(NetlinkError::Rejected("unexpected netlink message type"));
        }
        if cn_seq != msg.tag.to_u32() {
            return Err(NetlinkError::Rejected("inconsistent sequence numbers"));
        }
        Ok(msg)
    }

    /// Decodes a message without checking where it came from.
    ///
    /// Also returns the netlink message type and the connector sequence number.
    pub(crate) fn decode(buf: &[u8]) -> Result<(Self, u16, u32), NetlinkError> {
        let mut r = Reader { buf, pos: 0 };
        let nlm_len = r.u32()? as usize;
        let nlm_type = r.u16()?;
        let _flags = r.u16()?;
        let seq = r.u32()?;
        let pid = r.u32()?;
        if nlm_len < NLM_LENGTH + CN_LENGTH + W1M_LENGTH || nlm_len > buf.len() {
            return Err(NetlinkError::Malformed("bad netlink length"));
        }
        let mut r = Reader {
            buf: &buf[..nlm_len],
            pos: NLM_LENGTH,
        };
        let _idx = r.u32()?;
        let _val = r.u32()?;
        let cn_seq = r.u32()?;
        let ack = r.u32()?;
        let _cn_len = r.u16()?;
        let _cn_flags = r.u16()?;
        let kind = MessageType::try_from(r.u8()?)?;
        let status = r.u8()?;
        let w1m_len = r.u16()? as usize;
        let mut id = [0u8; ROM_ID_SIZE];
        id.copy_from_slice(r.take(ROM_ID_SIZE)?);
        let (command, data) = match kind {
            MessageType::MasterCmd | MessageType::SlaveCmd if w1m_len >= W1C_LENGTH => {
                let cmd = Command::try_from(r.u8()?)?;
                let _res = r.u8()?;
                let len = r.u16()? as usize;
                let data = r.take(len)?.to_vec();
                (Some(W1Command { cmd, data }), Vec::new())
            }
            MessageType::MasterCmd | MessageType::SlaveCmd => (None, Vec::new()),
            _ => (None, r.take(w1m_len)?.to_vec()),
        };
        let msg = Self {
            tag: SeqTag::from_u32(seq),
            pid,
            ack,
            kind,
            status,
            id: W1Id(id),
            command,
            data,
        };
        Ok((msg, nlm_type, cn_seq))
    }

    /// Serializes the message as the kernel would send it. Used by simulations.
    pub fn encode_reply(&self) -> Result<Vec<u8>, NetlinkError> {
        let mut buf = self.encode(0)?;
        buf[NLM_LENGTH + 12..NLM_LENGTH + 16].copy_from_slice(&self.ack.to_ne_bytes());
        Ok(buf)
    }
}

/// Bus master indices in a `W1_LIST_MASTERS` reply.
pub fn master_list(msg: &Message) -> Vec<u32> {
    msg.payload()
        .chunks_exact(4)
        .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], NetlinkError> {
        let end = self.pos + n;
        let s = self
            .buf
            .get(self.pos..end)
            .ok_or(NetlinkError::Malformed("truncated message"))?;
        self.pos = end;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8, NetlinkError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, NetlinkError> {
        let b = self.take(2)?;
        Ok(u16::from_ne_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, NetlinkError> {
        let b = self.take(4)?;
        Ok(u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
    }
}
