#[derive(Debug, Clone, PartialEq, Eq)]
/// DS1WM Hardware Errors
pub enum Ds1wmError<E> {
    /// Register access errors.
    Io(E),
    /// The control register did not keep the value written to it.
    ControlMismatch {
        /// Value written.
        wrote: u8,
        /// Value read back.
        read: u8,
    },
    /// The K1WM channel select register did not keep the channel.
    ChannelMismatch(u8),
    /// The transmit buffer never emptied or the receive buffer never filled.
    Timeout,
    /// The master is closed.
    Closed,
}

impl<E> Ds1wmError<E> {
    /// Whether the master has to be set up again before it can be used.
    pub fn needs_reconnect(&self) -> bool {
        matches!(
            self,
            Self::ControlMismatch { .. } | Self::ChannelMismatch(_) | Self::Closed
        )
    }
}
