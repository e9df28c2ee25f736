//! This module contains the types shared by virtqueue implementations.
//!
//! Only the split virtqueue is provided, see [`split::Virtqueue`].
pub mod split;

use core::fmt;

use memory_addresses::PhysAddr;
use virtio::virtq::DescF;

use self::error::VirtqError;

/// A u16 newtype. If instantiated via ``VqIndex::from(T)``, the newtype is ensured to be
/// smaller-equal to `min(u16::MAX , T::MAX)`.
///
/// Currently implements `From<u16>` and `From<u32>`.
#[derive(Copy, Clone, Debug, PartialOrd, PartialEq, Eq)]
pub struct VqIndex(u16);

impl From<u16> for VqIndex {
	fn from(val: u16) -> Self {
		VqIndex(val)
	}
}

impl From<VqIndex> for u16 {
	fn from(i: VqIndex) -> Self {
		i.0
	}
}

impl From<u32> for VqIndex {
	fn from(val: u32) -> Self {
		VqIndex(u16::try_from(val).unwrap_or(u16::MAX))
	}
}

/// A u16 newtype. If instantiated via ``VqSize::from(T)``, the newtype is ensured to be
/// smaller-equal to `min(u16::MAX , T::MAX)`.
///
/// Currently implements `From<u16>` and `From<u32>`.
#[derive(Copy, Clone, Debug, PartialOrd, PartialEq, Eq)]
pub struct VqSize(u16);

impl From<u16> for VqSize {
	fn from(val: u16) -> Self {
		VqSize(val)
	}
}

impl From<u32> for VqSize {
	fn from(val: u32) -> Self {
		VqSize(u16::try_from(val).unwrap_or(u16::MAX))
	}
}

impl From<VqSize> for u16 {
	fn from(val: VqSize) -> Self {
		val.0
	}
}

/// One physically contiguous piece of a scatter/gather list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
	pub addr: PhysAddr,
	pub len: u32,
	pub flags: DescF,
}

impl Segment {
	/// A segment the device only reads.
	pub fn readable(addr: PhysAddr, len: u32) -> Self {
		Self {
			addr,
			len,
			flags: DescF::empty(),
		}
	}

	/// A segment the device only writes.
	pub fn writable(addr: PhysAddr, len: u32) -> Self {
		Self {
			addr,
			len,
			flags: DescF::WRITE,
		}
	}
}

/// A post that did not make it into the ring.
///
/// The cookie is handed back so that the caller can retry or drop it.
pub struct Rejected<C> {
	pub cookie: C,
	pub error: VirtqError,
}

impl<C> Rejected<C> {
	pub(crate) fn new(cookie: C, error: VirtqError) -> Self {
		Self { cookie, error }
	}

	pub fn into_inner(self) -> (C, VirtqError) {
		(self.cookie, self.error)
	}
}

impl<C> fmt::Debug for Rejected<C> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Rejected")
			.field("error", &self.error)
			.finish_non_exhaustive()
	}
}

pub mod error {
	use thiserror::Error;

	// External Error Handling for users of the virtqueue.
	#[derive(Error, Debug, Clone, PartialEq, Eq)]
	pub enum VirtqError {
		#[error("Virtq failure due to unknown reasons!")]
		General,
		/// Call to post a buffer without any segments.
		#[error("Virtq detected a post without any segments")]
		BufferNotSpecified,
		/// The chain can never fit into the queue, regardless of how many
		/// descriptors are freed.
		#[error("Buffer of {0} segments is too large for the queue")]
		BufferTooLarge(usize),
		/// Signals, that the queue does not have enough free descriptors
		/// left. The device needs to process available descriptors first.
		#[error("Virtqs descriptor pool is exhausted!")]
		NoDescrAvail,
		#[error("The requested queue size {0} is not valid.")]
		QueueSizeNotAllowed(u16),
		#[error("An error was encountered during the allocation of the queue structures.")]
		AllocationError,
		/// The device wrote something into the used ring that contradicts
		/// the guest's bookkeeping.
		#[error("Virtq protocol violation: {0}")]
		ProtocolViolation(&'static str),
		/// A blocking post gave up because the queue is being torn down.
		#[error("Waiting for free descriptors was aborted")]
		WaitAborted,
	}

	impl VirtqError {
		/// Returns whether retrying the same post later may succeed.
		pub fn is_recoverable(&self) -> bool {
			matches!(self, Self::NoDescrAvail | Self::AllocationError)
		}
	}
}
