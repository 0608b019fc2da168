use core::{convert::Infallible, fmt::Debug};
use ds1wm::Ds1wmError;
use ds2490::Ds2490Error;
use onewire_bus::OneWireError;
use thiserror::Error;
use w1_netlink::NetlinkError;

/// Class of a failure, deciding how the lifecycle layer reacts to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// The adapter or its link failed; retried locally, then reconnected.
    Transport,
    /// The bus answered wrongly; the transaction fails and is not retried.
    Protocol,
    /// A search pass was aborted; the listing is partial.
    Enumeration,
    /// The adapter cannot be set up as requested.
    Configuration,
}

/// Error of a bus connection, with the transport details flattened.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// The adapter or host stack failed.
    #[error("adapter I/O failed: {0}")]
    Io(String),
    /// The adapter did not answer in time.
    #[error("adapter timed out")]
    Timeout,
    /// The adapter is gone or lost its setup and has to be reopened.
    #[error("adapter lost: {0}")]
    Lost(String),
    /// The connection is closed.
    #[error("connection is closed")]
    Closed,
    /// Reopening the adapter failed.
    #[error("reconnect failed: {0}")]
    ReconnectFailed(String),
    /// No device answered.
    #[error("no device present")]
    NoDevice,
    /// The bus is held low.
    #[error("1-Wire bus short circuit")]
    Short,
    /// The adapter did not complete a bus reset.
    #[error("bus reset failed")]
    ResetFailed,
    /// CRC8 or CRC16 check failed.
    #[error("CRC mismatch")]
    Crc,
    /// Bytes read back during a write differ from the bytes sent.
    #[error("echo mismatch")]
    Echo,
    /// Data read differs from the expected data.
    #[error("compare mismatch")]
    Compare,
    /// Fewer bytes came back than were sent.
    #[error("short read: expected {expected} bytes, received {received}")]
    ShortRead {
        /// Bytes sent.
        expected: usize,
        /// Bytes received.
        received: usize,
    },
    /// The adapter reported an error status.
    #[error("adapter status {0}")]
    Status(u8),
    /// The adapter answered with something unparseable.
    #[error("malformed reply: {0}")]
    Malformed(String),
    /// A search pass found an invalid ROM ID or an inconsistent bus.
    #[error("search aborted: {0}")]
    Search(&'static str),
    /// The adapter does not support the request.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    /// The adapter cannot be configured as requested.
    #[error("configuration: {0}")]
    Config(String),
}

impl BusError {
    /// Classification of this error.
    pub fn kind(&self) -> FaultKind {
        match self {
            Self::Io(_)
            | Self::Timeout
            | Self::Lost(_)
            | Self::Closed
            | Self::ReconnectFailed(_) => FaultKind::Transport,
            Self::NoDevice
            | Self::Short
            | Self::ResetFailed
            | Self::Crc
            | Self::Echo
            | Self::Compare
            | Self::ShortRead { .. }
            | Self::Status(_)
            | Self::Malformed(_) => FaultKind::Protocol,
            Self::Search(_) => FaultKind::Enumeration,
            Self::Unsupported(_) | Self::Config(_) => FaultKind::Configuration,
        }
    }

    /// Whether the adapter has to be reopened before it can be used again.
    pub fn needs_reconnect(&self) -> bool {
        matches!(self, Self::Lost(_) | Self::Closed)
    }
}

impl<E: Into<BusError>> From<OneWireError<E>> for BusError {
    fn from(value: OneWireError<E>) -> Self {
        match value {
            OneWireError::Other(e) => e.into(),
            OneWireError::NoDevicePresent => Self::NoDevice,
            OneWireError::ShortCircuit => Self::Short,
            OneWireError::ResetFailed => Self::ResetFailed,
            OneWireError::Unimplemented => Self::Unsupported("operation"),
            OneWireError::InvalidSpeed => Self::Unsupported("bus speed"),
            OneWireError::InvalidRomCrc => Self::Search("invalid ROM ID"),
            OneWireError::SearchCollision => Self::Search("no device answered a search bit"),
            OneWireError::InvalidCrc => Self::Crc,
            OneWireError::EchoMismatch => Self::Echo,
            OneWireError::CompareMismatch => Self::Compare,
            OneWireError::ShortRead { expected, received } => Self::ShortRead { expected, received },
        }
    }
}

impl<E: Debug> From<Ds2490Error<E>> for BusError {
    fn from(value: Ds2490Error<E>) -> Self {
        match value {
            Ds2490Error::Usb(e) => Self::Io(format!("{e:?}")),
            Ds2490Error::Stall => Self::Io("endpoint stalled".into()),
            Ds2490Error::Timeout => Self::Timeout,
            Ds2490Error::Unplugged => Self::Lost("DS2490 unplugged".into()),
            Ds2490Error::NeverIdle => Self::Lost("DS2490 never got idle".into()),
            Ds2490Error::BadStatus(len) => Self::Malformed(format!("status packet of {len} bytes")),
            Ds2490Error::Closed => Self::Closed,
        }
    }
}

impl<E: Debug> From<Ds1wmError<E>> for BusError {
    fn from(value: Ds1wmError<E>) -> Self {
        match value {
            Ds1wmError::Io(e) => Self::Io(format!("{e:?}")),
            Ds1wmError::ControlMismatch { wrote, read } => Self::Lost(format!(
                "control register reads {read:#04x} after writing {wrote:#04x}"
            )),
            Ds1wmError::ChannelMismatch(channel) => {
                Self::Lost(format!("channel select reads {channel}"))
            }
            Ds1wmError::Timeout => Self::Timeout,
            Ds1wmError::Closed => Self::Closed,
        }
    }
}

impl From<NetlinkError> for BusError {
    fn from(value: NetlinkError) -> Self {
        match value {
            NetlinkError::Io(e) => Self::Lost(e.to_string()),
            NetlinkError::Disconnected => Self::Lost("w1 dispatcher has stopped".into()),
            NetlinkError::Timeout(_) => Self::Timeout,
            NetlinkError::Status(status) => Self::Status(status),
            NetlinkError::Length { expected, received } => Self::ShortRead { expected, received },
            e @ (NetlinkError::Malformed(_) | NetlinkError::Rejected(_) | NetlinkError::TooLong(_)) => {
                Self::Malformed(e.to_string())
            }
        }
    }
}

impl From<Infallible> for BusError {
    fn from(value: Infallible) -> Self {
        match value {}
    }
}
