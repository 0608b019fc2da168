use std::time::Duration;
use thiserror::Error;

/// Errors of the w1 netlink transport.
#[derive(Debug, Error)]
pub enum NetlinkError {
    /// The socket failed.
    #[error("netlink socket error: {0}")]
    Io(#[from] std::io::Error),
    /// A message could not be decoded.
    #[error("malformed w1 message: {0}")]
    Malformed(&'static str),
    /// A well-formed message that is not a valid kernel reply.
    #[error("w1 message rejected: {0}")]
    Rejected(&'static str),
    /// The kernel did not answer in time.
    #[error("no w1 reply within {0:?}")]
    Timeout(Duration),
    /// The kernel reported an errno, e.g. no such device.
    #[error("w1 reported status {0}")]
    Status(u8),
    /// The reply did not have the expected size.
    #[error("w1 returned {received} bytes, expected {expected}")]
    Length {
        /// Bytes sent.
        expected: usize,
        /// Bytes returned.
        received: usize,
    },
    /// A payload too large for one message.
    #[error("payload of {0} bytes does not fit in one w1 message")]
    TooLong(usize),
    /// The dispatcher thread is gone.
    #[error("w1 dispatcher has stopped")]
    Disconnected,
}

impl NetlinkError {
    /// Whether the bus master has to be recreated before it can be used again.
    pub fn needs_reconnect(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Disconnected)
    }
}
