//! A module containing the transmit side of a virtio network driver.
//!
//! Packets enter through a [`TxProducer`](txq::TxProducer), are ordered in
//! per-CPU queues and posted to the device by a single dispatcher.

pub mod cpuq;
pub mod txq;

use std::mem::size_of;

use smallvec::{SmallVec, smallvec};
use thiserror::Error;
use virtio::le16;
use virtio::net::{F, Hdr};

use crate::drivers::net::ETHERNET_HEADER_LEN;
use crate::drivers::virtio::virtqueue::Segment;
use crate::drivers::virtio::virtqueue::error::VirtqError;
use crate::mm::DeviceAlloc;

/// Returns the number of header bytes the device expects in front of a frame.
///
/// `num_buffers` is only part of the header if [`F::VERSION_1`] or
/// [`F::MRG_RXBUF`] has been negotiated. Offloads are not requested, so the
/// header stays zeroed.
pub fn hdr_len(features: F) -> usize {
	if features.intersects(F::VERSION_1 | F::MRG_RXBUF) {
		size_of::<Hdr>()
	} else {
		size_of::<Hdr>() - size_of::<le16>()
	}
}

/// An Ethernet frame to be sent, possibly split into several fragments.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NetBuf {
	fragments: SmallVec<[Vec<u8>; 2]>,
}

impl NetBuf {
	pub fn new(frame: Vec<u8>) -> Self {
		Self {
			fragments: smallvec![frame],
		}
	}

	pub fn from_fragments(fragments: impl IntoIterator<Item = Vec<u8>>) -> Self {
		Self {
			fragments: fragments.into_iter().collect(),
		}
	}

	pub fn fragments(&self) -> &[Vec<u8>] {
		&self.fragments
	}

	/// Total number of bytes of the frame.
	pub fn len(&self) -> usize {
		self.fragments.iter().map(Vec::len).sum()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Copies the fragments into one contiguous frame.
	pub fn to_vec(&self) -> Vec<u8> {
		self.fragments.concat()
	}

	/// Checks that the frame can be handed to the device.
	///
	/// `max_sgs` includes the segment of the net header.
	pub fn validate(&self, mtu: u16, max_sgs: usize) -> Result<(), MalformedReason> {
		if self.fragments.iter().any(Vec::is_empty) {
			return Err(MalformedReason::EmptyFragment);
		}
		if self.fragments.len() + 1 > max_sgs {
			return Err(MalformedReason::TooManySegments(self.fragments.len() + 1));
		}
		let len = self.len();
		if len < ETHERNET_HEADER_LEN {
			return Err(MalformedReason::TooShort(len));
		}
		if len > usize::from(mtu) + ETHERNET_HEADER_LEN {
			return Err(MalformedReason::TooLong(len));
		}
		Ok(())
	}
}

impl From<Vec<u8>> for NetBuf {
	fn from(frame: Vec<u8>) -> Self {
		Self::new(frame)
	}
}

/// The cookie a frame is posted with: header and payload stay owned by the
/// request until the device has consumed them.
#[derive(Debug)]
pub struct TxRequest {
	hdr: Box<Hdr>,
	hdr_len: usize,
	buf: NetBuf,
}

impl TxRequest {
	pub fn new(buf: NetBuf, hdr_len: usize) -> Self {
		Self {
			hdr: Box::default(),
			hdr_len,
			buf,
		}
	}

	pub fn buf(&self) -> &NetBuf {
		&self.buf
	}

	pub fn into_buf(self) -> NetBuf {
		self.buf
	}

	/// The scatter/gather list of header and fragments as seen by the device.
	pub fn segments(&self, alloc: &dyn DeviceAlloc) -> SmallVec<[Segment; 4]> {
		let hdr: *const Hdr = &*self.hdr;
		let mut segments = SmallVec::new();
		segments.push(Segment::readable(
			alloc.phys_addr_from(hdr.cast()),
			self.hdr_len as u32,
		));
		segments.extend(self.buf.fragments.iter().map(|fragment| {
			Segment::readable(
				alloc.phys_addr_from(fragment.as_ptr()),
				fragment.len() as u32,
			)
		}));
		segments
	}
}

/// Why a frame has been refused before entering the queue.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedReason {
	#[error("frame of {0} bytes is shorter than an Ethernet header")]
	TooShort(usize),
	#[error("frame of {0} bytes exceeds the MTU")]
	TooLong(usize),
	#[error("frame needs {0} segments")]
	TooManySegments(usize),
	#[error("frame contains an empty fragment")]
	EmptyFragment,
}

/// Errors reported to the submitting context.
#[derive(Error, Debug)]
pub enum TxError {
	/// The frame was dropped, nothing reached the device.
	#[error("Malformed frame: {0}")]
	Malformed(#[from] MalformedReason),
	/// The device violated the ring protocol; the queue accepts no more frames.
	#[error("Transmit queue is broken")]
	DeviceBroken,
	/// The queue has been detached from the device.
	#[error("Transmit queue is detached")]
	Detached,
	#[error("Virtqueue failure: {0}")]
	Virtq(#[from] VirtqError),
	#[error("Failed to start the dispatcher: {0}")]
	Dispatcher(#[from] std::io::Error),
}
