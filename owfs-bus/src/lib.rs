#![deny(missing_docs)]

/*! # owfs-bus
 *
 * Lifecycle of 1-Wire bus masters: every adapter (DS9490 over USB, DS1WM/K1WM
 * register blocks, kernel w1 masters) is wrapped in a [`Connection`] that
 * serializes requests, counts errors and reconnects lost adapters. USB adapters
 * are told apart by an identity tag read from their own bus, so a reconnect finds
 * the same adapter after it moved to another address.
 *
 * Connections live in a [`BusRegistry`]. A registrar thread adds and removes them
 * on [`BusCommand`]s sent by the USB monitor and by the w1 control channel.
 */

mod adapter;
mod connection;
mod error;
mod options;
mod registry;
mod stats;
mod usb;

pub use adapter::{Adapter, AdapterKind, Flatten, Lifecycle, identity};
pub use connection::{Connection, ConnectionState};
pub use error::{BusError, FaultKind};
pub use options::BusOptions;
pub use registry::{
    BusCommand, BusId, BusRegistry, browse_w1, spawn_registrar, spawn_w1_registrar, w1_name,
    w1_sysfs_masters,
};
pub use stats::{BusStats, StatsSnapshot};
pub use usb::{UsbClaim, UsbDirectory, UsbLocation, UsbMonitor, UsbScanner};
