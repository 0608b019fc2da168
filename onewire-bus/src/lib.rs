#![no_std]
#![deny(missing_docs)]
//! # onewire-bus
//! A no-std core for 1-Wire bus masters.
//!
//! Two trait levels describe a bus master:
//! - [OneWire] is the bit-level interface of a simple bridge (single bits, bytes and
//!   optionally the search triplet). Any [OneWire] implementation becomes a full bus master
//!   through [BitBanged].
//! - [OneWireMaster] is the byte-level contract every transport provides: bus reset,
//!   sendback (`write_read`), device search and addressing. Adapters with hardware search
//!   or native addressing (USB DS2490, DS1WM, Linux w1) implement it directly.
//!
//! On top of the byte-level contract the crate provides the search engine ([Search],
//! [next_both]), the transaction interpreter ([Transaction], [Step]), the CRC engines
//! ([OneWireCrc], [OneWireCrc16]) and the [RomId] type.

extern crate alloc;

pub mod consts;
mod crc;
mod error;
mod rom;
mod search;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
mod traits;
mod transaction;

pub use crc::{CRC16_RESIDUAL, OneWireCrc, OneWireCrc16, crc8, crc16};
pub use error::OneWireError;
pub use rom::{RomId, RomParseError};
pub use search::{BitBanged, Search, SearchCursor, SearchKind, next_both, search_bitwise};
pub use traits::{AnyDevices, BusSpeed, OneWire, OneWireMaster, OneWireStatus, ResetOutcome};
pub use transaction::{Step, Transaction, TransactionOutput};

/// Result type for 1-Wire operations.
pub type OneWireResult<T, E> = Result<T, OneWireError<E>>;
