//! Guest-side transmit path of a virtio network device.
//!
//! The crate contains two tightly coupled layers:
//!
//! * the split [virtqueue](drivers::virtio::virtqueue::split::Virtqueue), a
//!   descriptor ring shared with the hypervisor, together with its
//!   notification-suppression protocol, and
//! * the [transmit queue](drivers::net::virtio::txq::TxQueue), which funnels
//!   per-CPU producers into that single ring while restoring submission order
//!   with a k-way merge and serializing ring access through a single-owner
//!   `RUNNING` flag.
//!
//! Device probing, interrupt vector setup and offload header construction are
//! left to the embedding driver. The crate only consumes a
//! [notification facility](drivers::virtio::DeviceNotifier), the
//! [negotiated features](virtio::net::F) and
//! [device memory](mm::device_alloc::DeviceAlloc).

#![warn(clippy::all)]
#![allow(clippy::tabs_in_doc_comments)]
#![allow(clippy::module_inception)]

#[macro_use]
extern crate log;

#[macro_use]
pub mod logging;

pub mod collections;
pub mod config;
pub mod drivers;
pub mod mm;
pub mod synch;

pub use crate::config::TxConfig;
pub use crate::drivers::net::virtio::txq::{TxProducer, TxQueue};
pub use crate::drivers::net::virtio::{NetBuf, TxError};
pub use crate::drivers::virtio::virtqueue::split::Virtqueue;
