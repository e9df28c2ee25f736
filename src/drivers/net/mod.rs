//! Network drivers: the virtio transmit path and a software device end.

pub mod loopback;
pub mod virtio;

/// Length of an Ethernet header without VLAN tag.
pub const ETHERNET_HEADER_LEN: usize = 14;
