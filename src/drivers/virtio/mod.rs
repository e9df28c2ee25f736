//! A module containing virtios core infrastructure.
//!
//! The module contains the notification collaborator and the virtqueues.
//! Feature bits and ring layouts come from [`virtio`].
pub mod virtqueue;

use self::virtqueue::VqIndex;

/// The notification facility of the transport.
///
/// Notifying the device is the only way for the guest to tell the device
/// that new buffers have been made available.
pub trait DeviceNotifier: Send + Sync {
	fn notify(&self, queue: VqIndex);
}
