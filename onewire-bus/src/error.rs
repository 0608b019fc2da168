/// One wire communication error type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OneWireError<E> {
    /// Encapsulates the error type from the underlying transport.
    Other(E),
    /// Indicates that no device is present on the bus.
    NoDevicePresent,
    /// Indicates that a short circuit was detected on the bus.
    ShortCircuit,
    /// The adapter reported that a bus reset did not complete.
    ResetFailed,
    /// Indicates that the operation is not implemented, such as reading a triplet when not supported.
    Unimplemented,
    /// The requested bus speed is not supported by the adapter.
    InvalidSpeed,
    /// Computed CRC8 of a ROM ID found by search is invalid, or its family code is zero.
    InvalidRomCrc,
    /// A CRC8 or CRC16 check over transaction data failed.
    InvalidCrc,
    /// The bytes read back during a write did not match the bytes sent.
    EchoMismatch,
    /// Data read from a device did not match the expected content.
    CompareMismatch,
    /// Both the id bit and its complement read 1 in the middle of a search pass.
    SearchCollision,
    /// The adapter returned fewer bytes than requested.
    ShortRead {
        /// Bytes requested.
        expected: usize,
        /// Bytes received.
        received: usize,
    },
}

impl<E> From<E> for OneWireError<E> {
    fn from(other: E) -> Self {
        Self::Other(other)
    }
}

impl<E> OneWireError<E> {
    /// Maps the transport error, keeping every protocol variant as is.
    pub fn map_other<F>(self, f: impl FnOnce(E) -> F) -> OneWireError<F> {
        match self {
            Self::Other(e) => OneWireError::Other(f(e)),
            Self::NoDevicePresent => OneWireError::NoDevicePresent,
            Self::ShortCircuit => OneWireError::ShortCircuit,
            Self::ResetFailed => OneWireError::ResetFailed,
            Self::Unimplemented => OneWireError::Unimplemented,
            Self::InvalidSpeed => OneWireError::InvalidSpeed,
            Self::InvalidRomCrc => OneWireError::InvalidRomCrc,
            Self::InvalidCrc => OneWireError::InvalidCrc,
            Self::EchoMismatch => OneWireError::EchoMismatch,
            Self::CompareMismatch => OneWireError::CompareMismatch,
            Self::SearchCollision => OneWireError::SearchCollision,
            Self::ShortRead { expected, received } => {
                OneWireError::ShortRead { expected, received }
            }
        }
    }
}

impl<E: core::fmt::Debug> core::fmt::Display for OneWireError<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Other(e) => write!(f, "transport error: {e:?}"),
            Self::NoDevicePresent => f.write_str("no device present"),
            Self::ShortCircuit => f.write_str("1-Wire bus short circuit"),
            Self::ResetFailed => f.write_str("bus reset failed"),
            Self::Unimplemented => f.write_str("operation not implemented"),
            Self::InvalidSpeed => f.write_str("unsupported bus speed"),
            Self::InvalidRomCrc => f.write_str("invalid ROM ID"),
            Self::InvalidCrc => f.write_str("CRC mismatch"),
            Self::EchoMismatch => f.write_str("echo mismatch"),
            Self::CompareMismatch => f.write_str("compare mismatch"),
            Self::SearchCollision => f.write_str("search collision"),
            Self::ShortRead { expected, received } => {
                write!(f, "short read: expected {expected} bytes, received {received}")
            }
        }
    }
}
