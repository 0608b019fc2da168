#![deny(missing_docs)]

/*! # w1-netlink
 *
 * Bus masters of the Linux kernel w1 subsystem, driven over the netlink connector.
 *
 * One socket is shared by every bus master. A [`Dispatcher`] thread reads every
 * kernel message, checks it and forwards it to the private channel of the bus
 * named in its sequence number. Master announcements and master lists go to a
 * control channel instead. Each [`W1Master`] implements [`OneWireMaster`](onewire_bus::OneWireMaster)
 * on top of that.
 */

pub mod codec;
mod dispatch;
mod error;
#[cfg(test)]
mod kernel;
mod master;

pub use codec::{Command, Message, MessageType, SeqTag, W1Command, master_list};
pub use dispatch::{ControlEvent, Dispatcher, NetlinkSocket};
pub use error::NetlinkError;
pub use master::{SlaveOrder, W1Master};
