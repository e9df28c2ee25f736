//! A software device end for a transmit virtqueue.
//!
//! [`LoopbackDevice`] takes the role of the hypervisor: it consumes the
//! chains the driver makes available, records the frames and returns the
//! chains through the used ring. It runs either on its own thread or is
//! stepped manually with [`LoopbackDevice::process`].

use std::io;
use std::mem::size_of;
use std::ptr::NonNull;
use std::slice;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering, fence};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_utils::sync::{Parker, Unparker};
use hermit_sync::SpinMutex;
use memory_addresses::PhysAddr;
use virtio::le32;
use virtio::net::F;
use virtio::virtq::{AvailF, Desc, DescF, UsedElem, UsedF};

use crate::drivers::net::virtio::hdr_len;
use crate::drivers::virtio::DeviceNotifier;
use crate::drivers::virtio::virtqueue::VqIndex;
use crate::drivers::virtio::virtqueue::error::VirtqError;
use crate::drivers::virtio::virtqueue::split::{SplitRing, VirtqAddresses, load, store};
use crate::mm::DeviceAlloc;

/// Interval in which a spawned device polls without being kicked.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

struct DeviceQueue {
	ring: SplitRing,
	features: F,
	alloc: Arc<dyn DeviceAlloc>,
	hdr_len: usize,
	last_avail: u16,
}

// SAFETY: the ring memory is only accessed through atomics and volatile
// operations, and `DeviceQueue` is only used behind a lock.
unsafe impl Send for DeviceQueue {}

impl DeviceQueue {
	fn copy_buffer(&self, desc: &Desc, bytes: &mut Vec<u8>) {
		if desc.flags.contains(DescF::WRITE) {
			return;
		}
		let ptr = self.alloc.ptr_from(PhysAddr::new(desc.addr.to_ne()));
		let len = desc.len.to_ne() as usize;
		// SAFETY: the driver keeps posted buffers alive until they are used.
		bytes.extend_from_slice(unsafe { slice::from_raw_parts(ptr, len) });
	}

	/// Gathers the readable bytes of the chain starting at `head`.
	fn read_chain(&self, head: u16) -> Option<Vec<u8>> {
		let size = self.ring.size();
		if head >= size {
			return None;
		}

		let mut bytes = Vec::new();
		let desc = self.ring.read_desc(head);
		if desc.flags.contains(DescF::INDIRECT) {
			let count = desc.len.to_ne() as usize / size_of::<Desc>();
			let table = self
				.alloc
				.ptr_from(PhysAddr::new(desc.addr.to_ne()))
				.cast::<Desc>();
			let mut index = 0;
			for _ in 0..count {
				// SAFETY: the table holds `count` descriptors.
				let desc = unsafe { table.add(index).read_volatile() };
				self.copy_buffer(&desc, &mut bytes);
				if !desc.flags.contains(DescF::NEXT) {
					return Some(bytes);
				}
				index = usize::from(desc.next.to_ne());
				if index >= count {
					return None;
				}
			}
			None
		} else {
			let mut id = head;
			for _ in 0..size {
				let desc = self.ring.read_desc(id);
				self.copy_buffer(&desc, &mut bytes);
				if !desc.flags.contains(DescF::NEXT) {
					return Some(bytes);
				}
				id = desc.next.to_ne();
				if id >= size {
					return None;
				}
			}
			None
		}
	}
}

/// Device end of one transmit virtqueue.
#[derive(Default)]
pub struct LoopbackDevice {
	queue: SpinMutex<Option<DeviceQueue>>,
	frames: SpinMutex<Vec<Vec<u8>>>,
	interrupt: SpinMutex<Option<Box<dyn Fn() + Send + Sync>>>,
	unparker: SpinMutex<Option<Unparker>>,
	kicks: AtomicUsize,
	interrupts: AtomicUsize,
	paused: AtomicBool,
	stopped: AtomicBool,
}

impl LoopbackDevice {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Starts serving the ring described by `addresses`.
	///
	/// # Safety
	///
	/// The ring must stay allocated until [`Self::detach`] has returned, or
	/// the device thread has been stopped and joined.
	pub unsafe fn attach(
		&self,
		addresses: VirtqAddresses,
		size: u16,
		features: F,
		alloc: Arc<dyn DeviceAlloc>,
	) -> Result<(), VirtqError> {
		if size == 0 || !size.is_power_of_two() {
			return Err(VirtqError::QueueSizeNotAllowed(size));
		}
		let map = |addr: PhysAddr| NonNull::new(alloc.ptr_from(addr)).ok_or(VirtqError::General);
		let desc = map(addresses.desc)?.cast::<Desc>();
		let avail = map(addresses.avail)?;
		let used = map(addresses.used)?;

		// SAFETY: guaranteed by the caller.
		let ring = unsafe { SplitRing::from_parts(size, desc, avail, used) };
		let last_avail = load(ring.avail_idx(), Ordering::Acquire);
		*self.queue.lock() = Some(DeviceQueue {
			ring,
			features,
			alloc,
			hdr_len: hdr_len(features),
			last_avail,
		});

		info!("Loopback device attached to ring at {:#x}", addresses.desc);
		Ok(())
	}

	/// Stops touching the ring.
	pub fn detach(&self) {
		if self.queue.lock().take().is_some() {
			info!("Loopback device detached");
		}
	}

	/// Installs the callback that delivers the queue's interrupt.
	pub fn set_interrupt_handler(&self, handler: impl Fn() + Send + Sync + 'static) {
		*self.interrupt.lock() = Some(Box::new(handler));
	}

	/// While paused, [`Self::process`] leaves the ring alone.
	pub fn set_paused(&self, paused: bool) {
		self.paused.store(paused, Ordering::SeqCst);
		if !paused {
			self.wake();
		}
	}

	/// Sets or clears `VIRTQ_USED_F_NO_NOTIFY`.
	///
	/// Only has an effect if event-index suppression was not negotiated.
	pub fn suppress_notifications(&self, suppress: bool) {
		if let Some(queue) = self.queue.lock().as_ref() {
			let flags = queue.ring.used_flags();
			queue.ring.set_used_flags(if suppress {
				flags | UsedF::NO_NOTIFY
			} else {
				flags - UsedF::NO_NOTIFY
			});
		}
	}

	pub fn kicks(&self) -> usize {
		self.kicks.load(Ordering::SeqCst)
	}

	pub fn interrupts(&self) -> usize {
		self.interrupts.load(Ordering::SeqCst)
	}

	pub fn frame_count(&self) -> usize {
		self.frames.lock().len()
	}

	/// Returns the frames received so far, without their net header.
	pub fn take_frames(&self) -> Vec<Vec<u8>> {
		std::mem::take(&mut *self.frames.lock())
	}

	/// Consumes all available chains. Returns the number of chains used.
	pub fn process(&self) -> usize {
		if self.paused.load(Ordering::SeqCst) {
			return 0;
		}

		let mut guard = self.queue.lock();
		let Some(queue) = guard.as_mut() else {
			return 0;
		};
		let event_idx = queue.features.contains(F::EVENT_IDX);
		let old_used = load(queue.ring.used_idx(), Ordering::Relaxed);
		let mut used = old_used;
		let mut frames = Vec::new();

		loop {
			let avail_idx = load(queue.ring.avail_idx(), Ordering::Acquire);
			while queue.last_avail != avail_idx {
				let head = queue.ring.read_avail_entry(queue.last_avail);
				match queue.read_chain(head) {
					Some(bytes) if bytes.len() >= queue.hdr_len => {
						frames.push(bytes[queue.hdr_len..].to_vec());
					}
					_ => error!("Loopback device got a malformed chain at {head}"),
				}

				queue.ring.write_used_elem(
					used,
					UsedElem {
						id: le32::from_ne(head.into()),
						len: le32::from_ne(0),
					},
				);
				used = used.wrapping_add(1);
				queue.last_avail = queue.last_avail.wrapping_add(1);
			}

			if event_idx {
				// Ask for a notification as soon as the next chain is made available.
				store(queue.ring.avail_event(), queue.last_avail, Ordering::Relaxed);
			}
			fence(Ordering::SeqCst);
			if load(queue.ring.avail_idx(), Ordering::Acquire) == queue.last_avail {
				break;
			}
		}

		let processed = used.wrapping_sub(old_used);
		if processed == 0 {
			return 0;
		}
		store(queue.ring.used_idx(), used, Ordering::Release);
		fence(Ordering::SeqCst);

		let raise = if event_idx {
			let used_event = load(queue.ring.used_event(), Ordering::Relaxed);
			used.wrapping_sub(used_event).wrapping_sub(1) < processed
		} else {
			!queue.ring.avail_flags().contains(AvailF::NO_INTERRUPT)
		};
		drop(guard);

		self.frames.lock().extend(frames);
		if raise {
			self.interrupts.fetch_add(1, Ordering::SeqCst);
			if let Some(handler) = self.interrupt.lock().as_ref() {
				handler();
			}
		}

		trace!("Loopback device used {processed} chains");
		usize::from(processed)
	}

	/// Runs [`Self::process`] on a thread of its own until [`Self::stop`].
	pub fn spawn(self: &Arc<Self>) -> io::Result<JoinHandle<()>> {
		let parker = Parker::new();
		*self.unparker.lock() = Some(parker.unparker().clone());
		self.stopped.store(false, Ordering::SeqCst);

		let device = Arc::clone(self);
		thread::Builder::new()
			.name("loopback".into())
			.spawn(move || {
				while !device.stopped.load(Ordering::SeqCst) {
					device.process();
					parker.park_timeout(POLL_INTERVAL);
				}
			})
	}

	pub fn stop(&self) {
		self.stopped.store(true, Ordering::SeqCst);
		self.wake();
	}

	fn wake(&self) {
		if let Some(unparker) = self.unparker.lock().as_ref() {
			unparker.unpark();
		}
	}
}

impl DeviceNotifier for LoopbackDevice {
	fn notify(&self, queue: VqIndex) {
		self.kicks.fetch_add(1, Ordering::SeqCst);
		trace!("Loopback device kicked on queue {}", u16::from(queue));
		self.wake();
	}
}
