//! A module containing the virtio transport pieces and the network transmit driver.

pub mod net;
pub mod virtio;
