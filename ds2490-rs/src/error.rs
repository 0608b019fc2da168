use crate::TransferError;

#[derive(Debug, Clone, PartialEq, Eq)]
/// DS2490 Hardware Errors
pub enum Ds2490Error<E> {
    /// USB stack errors.
    Usb(E),
    /// An endpoint stayed halted after the retries.
    Stall,
    /// A USB transfer timed out.
    Timeout,
    /// The adapter was unplugged.
    Unplugged,
    /// The adapter never reported idle; it has been sent a device reset.
    NeverIdle,
    /// The status endpoint returned a malformed block of this length.
    BadStatus(usize),
    /// The adapter is not open.
    Closed,
}

impl<E> Ds2490Error<E> {
    /// Whether the adapter has to be reopened before it can be used again.
    pub fn needs_reconnect(&self) -> bool {
        matches!(self, Self::Unplugged | Self::Closed | Self::NeverIdle)
    }
}

impl<E> From<TransferError<E>> for Ds2490Error<E> {
    fn from(value: TransferError<E>) -> Self {
        match value {
            TransferError::Stall => Self::Stall,
            TransferError::Timeout => Self::Timeout,
            TransferError::NoDevice => Self::Unplugged,
            TransferError::Other(e) => Self::Usb(e),
        }
    }
}
