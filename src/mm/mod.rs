//! Memory shared with the device.

pub mod device_alloc;

pub use memory_addresses::PhysAddr;

pub use self::device_alloc::{DeviceAlloc, HostAlloc};
