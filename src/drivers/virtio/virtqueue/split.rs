//! This module contains Virtio's split virtqueue.
//! See Virito specification v1.1. - 2.6

use std::alloc::Layout;
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering, fence};

use align_address::Align;
use crossbeam_utils::Backoff;
use memory_addresses::PhysAddr;
use virtio::virtq::{AvailF, Desc, DescF, UsedElem, UsedF};
use virtio::{F, le16, le32, le64};
use volatile::VolatilePtr;

use super::error::VirtqError;
use super::{Rejected, Segment, VqIndex, VqSize};
use crate::config::VIRTIO_PCI_VRING_ALIGN;
use crate::drivers::virtio::DeviceNotifier;
use crate::mm::DeviceAlloc;
use crate::synch::waiter::WaiterSlot;

/// Returns the number of bytes a split ring of `num` descriptors occupies,
/// with the used ring starting at the next multiple of `align`.
pub fn vring_size(num: u16, align: usize) -> usize {
	used_offset(num, align) + size_of::<u16>() * 3 + size_of::<UsedElem>() * usize::from(num)
}

fn avail_offset(num: u16) -> usize {
	size_of::<Desc>() * usize::from(num)
}

fn used_offset(num: u16, align: usize) -> usize {
	(avail_offset(num) + size_of::<u16>() * (3 + usize::from(num))).align_up(align)
}

/// Physical addresses of the three ring parts, as handed to the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VirtqAddresses {
	pub desc: PhysAddr,
	pub avail: PhysAddr,
	pub used: PhysAddr,
}

/// Typed access to the memory of a split ring.
///
/// Index fields are only accessed atomically, and memory that the other side
/// may write concurrently only through volatile operations.
pub(crate) struct SplitRing {
	size: u16,
	desc: NonNull<Desc>,
	avail: NonNull<u8>,
	used: NonNull<u8>,
}

impl SplitRing {
	/// # Safety
	///
	/// The pointers must refer to live, zero-initialized or previously
	/// initialized ring parts of `size` entries.
	pub(crate) unsafe fn from_parts(
		size: u16,
		desc: NonNull<Desc>,
		avail: NonNull<u8>,
		used: NonNull<u8>,
	) -> Self {
		Self {
			size,
			desc,
			avail,
			used,
		}
	}

	pub(crate) fn size(&self) -> u16 {
		self.size
	}

	fn slot(&self, idx: u16) -> usize {
		usize::from(idx & (self.size - 1))
	}

	fn atomic_at(&self, base: NonNull<u8>, offset: usize) -> &AtomicU16 {
		// SAFETY: the offset lies within the ring and is 2-aligned.
		unsafe { base.add(offset).cast::<AtomicU16>().as_ref() }
	}

	pub(crate) fn read_desc(&self, id: u16) -> Desc {
		debug_assert!(id < self.size);
		unsafe { VolatilePtr::new(self.desc.add(usize::from(id))).read() }
	}

	pub(crate) fn write_desc(&self, id: u16, desc: Desc) {
		debug_assert!(id < self.size);
		unsafe { VolatilePtr::new(self.desc.add(usize::from(id))).write(desc) }
	}

	pub(crate) fn avail_flags(&self) -> AvailF {
		AvailF::from_bits_retain(le16::from_ne(load(self.atomic_at(self.avail, 0), Ordering::Relaxed)))
	}

	pub(crate) fn set_avail_flags(&self, flags: AvailF) {
		store(self.atomic_at(self.avail, 0), flags.bits().to_ne(), Ordering::Relaxed);
	}

	pub(crate) fn avail_idx(&self) -> &AtomicU16 {
		self.atomic_at(self.avail, 2)
	}

	pub(crate) fn read_avail_entry(&self, idx: u16) -> u16 {
		let offset = 4 + 2 * self.slot(idx);
		unsafe { VolatilePtr::new(self.avail.add(offset).cast::<le16>()).read() }.to_ne()
	}

	fn write_avail_entry(&self, idx: u16, id: u16) {
		let offset = 4 + 2 * self.slot(idx);
		unsafe { VolatilePtr::new(self.avail.add(offset).cast::<le16>()).write(le16::from_ne(id)) }
	}

	pub(crate) fn used_event(&self) -> &AtomicU16 {
		self.atomic_at(self.avail, 4 + 2 * usize::from(self.size))
	}

	pub(crate) fn used_flags(&self) -> UsedF {
		UsedF::from_bits_retain(le16::from_ne(load(self.atomic_at(self.used, 0), Ordering::Relaxed)))
	}

	pub(crate) fn set_used_flags(&self, flags: UsedF) {
		store(self.atomic_at(self.used, 0), flags.bits().to_ne(), Ordering::Relaxed);
	}

	pub(crate) fn used_idx(&self) -> &AtomicU16 {
		self.atomic_at(self.used, 2)
	}

	pub(crate) fn read_used_elem(&self, idx: u16) -> UsedElem {
		let offset = 4 + size_of::<UsedElem>() * self.slot(idx);
		unsafe { VolatilePtr::new(self.used.add(offset).cast::<UsedElem>()).read() }
	}

	pub(crate) fn write_used_elem(&self, idx: u16, elem: UsedElem) {
		let offset = 4 + size_of::<UsedElem>() * self.slot(idx);
		unsafe { VolatilePtr::new(self.used.add(offset).cast::<UsedElem>()).write(elem) }
	}

	pub(crate) fn avail_event(&self) -> &AtomicU16 {
		self.atomic_at(self.used, 4 + size_of::<UsedElem>() * usize::from(self.size))
	}
}

/// Loads a little-endian ring index.
pub(crate) fn load(atomic: &AtomicU16, order: Ordering) -> u16 {
	u16::from_le(atomic.load(order))
}

/// Stores a little-endian ring index.
pub(crate) fn store(atomic: &AtomicU16, val: u16, order: Ordering) {
	atomic.store(val.to_le(), order);
}

/// A separately allocated table of descriptors, referenced by one
/// [`DescF::INDIRECT`] descriptor.
struct IndirectTable {
	ptr: NonNull<u8>,
	layout: Layout,
	phys: PhysAddr,
	byte_len: u32,
}

impl IndirectTable {
	fn new(alloc: &dyn DeviceAlloc, segments: &[Segment]) -> Option<Self> {
		let layout = Layout::array::<Desc>(segments.len()).ok()?;
		let byte_len = u32::try_from(layout.size()).ok()?;
		let ptr = alloc.allocate_zeroed(layout)?;
		let table = ptr.cast::<Desc>();

		let last = segments.len() - 1;
		for (i, segment) in segments.iter().enumerate() {
			let mut flags = segment.flags & DescF::WRITE;
			let mut next = 0;
			if i != last {
				flags |= DescF::NEXT;
				next = (i + 1) as u16;
			}
			let desc = Desc {
				addr: le64::from_ne(segment.addr.as_u64()),
				len: le32::from_ne(segment.len),
				flags,
				next: le16::from_ne(next),
			};
			unsafe { VolatilePtr::new(table.add(i)).write(desc) };
		}

		Some(Self {
			ptr,
			layout,
			phys: alloc.phys_addr_from(ptr.as_ptr()),
			byte_len,
		})
	}

	/// # Safety
	///
	/// `alloc` must be the allocator the table was created with and the
	/// device must be done with the table.
	unsafe fn free(self, alloc: &dyn DeviceAlloc) {
		unsafe { alloc.deallocate(self.ptr, self.layout) }
	}
}

/// Virtio's split virtqueue structure
///
/// The descriptor table, the available and the used ring share one
/// contiguous allocation. Free descriptors are linked through their `next`
/// field, starting at `avail_head`.
///
/// All methods taking `&mut self` must be serialized by the owner. Only
/// [`Self::waiter`] may be used from other contexts.
pub struct Virtqueue<C> {
	index: VqIndex,
	features: F,
	use_indirect: bool,
	alloc: Arc<dyn DeviceAlloc>,
	notifier: Arc<dyn DeviceNotifier>,
	storage: NonNull<u8>,
	storage_layout: Layout,
	ring: SplitRing,
	cookies: Box<[Option<C>]>,
	indirect: Box<[Option<IndirectTable>]>,
	/// Head of the free list.
	avail_head: u16,
	/// Number of descriptors on the free list.
	avail_count: u16,
	avail_added_since_kick: u16,
	/// Used ring entries before this index have been returned to the free list.
	used_guest_head: u16,
	/// Used ring entries before this index have been handed to the caller.
	used_host_head: u16,
	waiter: Arc<WaiterSlot>,
}

// SAFETY: the ring memory is owned by the queue and only accessed through
// `&mut self` or atomics.
unsafe impl<C: Send> Send for Virtqueue<C> {}

impl<C> Virtqueue<C> {
	/// Creates a new split virtqueue of the specified [VqSize] and the [VqIndex].
	/// The index represents the "ID" of the virtqueue.
	///
	/// `features` are the negotiated device features; indirect descriptors and
	/// event-index suppression are used only if negotiated.
	pub fn new(
		index: VqIndex,
		size: VqSize,
		features: F,
		alloc: Arc<dyn DeviceAlloc>,
		notifier: Arc<dyn DeviceNotifier>,
	) -> Result<Self, VirtqError> {
		let size = u16::from(size);
		if size == 0 || !size.is_power_of_two() || size > 1 << 15 {
			return Err(VirtqError::QueueSizeNotAllowed(size));
		}

		let storage_layout = Layout::from_size_align(
			vring_size(size, VIRTIO_PCI_VRING_ALIGN).align_up(VIRTIO_PCI_VRING_ALIGN),
			VIRTIO_PCI_VRING_ALIGN,
		)
		.map_err(|_| VirtqError::AllocationError)?;
		let storage = alloc
			.allocate_zeroed(storage_layout)
			.ok_or(VirtqError::AllocationError)?;

		// SAFETY: all offsets lie within the zeroed allocation.
		let ring = unsafe {
			SplitRing::from_parts(
				size,
				storage.cast(),
				storage.add(avail_offset(size)),
				storage.add(used_offset(size, VIRTIO_PCI_VRING_ALIGN)),
			)
		};

		for id in 0..size {
			ring.write_desc(
				id,
				Desc {
					addr: le64::from_ne(0),
					len: le32::from_ne(0),
					flags: DescF::empty(),
					next: le16::from_ne(id.wrapping_add(1) & (size - 1)),
				},
			);
		}

		let vq = Self {
			index,
			features,
			use_indirect: false,
			alloc,
			notifier,
			storage,
			storage_layout,
			ring,
			cookies: (0..size).map(|_| None).collect(),
			indirect: (0..size).map(|_| None).collect(),
			avail_head: 0,
			avail_count: size,
			avail_added_since_kick: 0,
			used_guest_head: 0,
			used_host_head: 0,
			waiter: Arc::new(WaiterSlot::new()),
		};

		info!(
			"Created split virtqueue {} with {size} descriptors at {:#x}",
			u16::from(index),
			vq.addresses().desc
		);

		Ok(vq)
	}

	pub fn index(&self) -> VqIndex {
		self.index
	}

	pub fn size(&self) -> u16 {
		self.ring.size()
	}

	pub fn features(&self) -> F {
		self.features
	}

	/// Allows indirect descriptors if the device negotiated them.
	pub fn set_use_indirect(&mut self, use_indirect: bool) {
		self.use_indirect = use_indirect;
	}

	/// Returns the physical addresses of the ring parts.
	pub fn addresses(&self) -> VirtqAddresses {
		let base = self.alloc.phys_addr_from(self.storage.as_ptr());
		let size = self.size();
		VirtqAddresses {
			desc: base,
			avail: PhysAddr::new(base.as_u64() + avail_offset(size) as u64),
			used: PhysAddr::new(base.as_u64() + used_offset(size, VIRTIO_PCI_VRING_ALIGN) as u64),
		}
	}

	/// The slot an interrupt handler uses to wake a context blocked in
	/// [`Self::add_buf_wait`].
	pub fn waiter(&self) -> Arc<WaiterSlot> {
		Arc::clone(&self.waiter)
	}

	/// Number of descriptors on the free list.
	pub fn avail_count(&self) -> u16 {
		self.avail_count
	}

	fn use_indirect(&self, segments: usize) -> bool {
		let avail_count = usize::from(self.avail_count);
		self.use_indirect
			&& self.features.contains(F::INDIRECT_DESC)
			&& (segments > avail_count
				|| (segments > 1 && avail_count < usize::from(self.size() / 4)))
	}

	/// Posts `segments` as one descriptor chain and publishes it to the device.
	///
	/// On success, returns the id of the chain's head descriptor. If the free
	/// list is too short, the device is kicked to drain its backlog and the
	/// post fails without touching any descriptor.
	pub fn add_buf(&mut self, segments: &[Segment], cookie: C) -> Result<u16, Rejected<C>> {
		if let Err(err) = self.get_buf_gc() {
			return Err(Rejected::new(cookie, err));
		}
		if segments.is_empty() {
			return Err(Rejected::new(cookie, VirtqError::BufferNotSpecified));
		}

		let indirect = self.use_indirect(segments.len());
		let needed = if indirect { 1 } else { segments.len() };
		if needed > usize::from(self.size()) {
			return Err(Rejected::new(
				cookie,
				VirtqError::BufferTooLarge(segments.len()),
			));
		}
		if needed > usize::from(self.avail_count) {
			self.kick();
			return Err(Rejected::new(cookie, VirtqError::NoDescrAvail));
		}

		let head = self.avail_head;
		if indirect {
			let Some(table) = IndirectTable::new(&*self.alloc, segments) else {
				return Err(Rejected::new(cookie, VirtqError::AllocationError));
			};
			let mut desc = self.ring.read_desc(head);
			self.avail_head = desc.next.to_ne();
			desc.addr = le64::from_ne(table.phys.as_u64());
			desc.len = le32::from_ne(table.byte_len);
			desc.flags = DescF::INDIRECT;
			self.ring.write_desc(head, desc);
			self.indirect[usize::from(head)] = Some(table);
		} else {
			let mut id = head;
			let mut last = head;
			for segment in segments {
				let mut desc = self.ring.read_desc(id);
				desc.addr = le64::from_ne(segment.addr.as_u64());
				desc.len = le32::from_ne(segment.len);
				desc.flags = (segment.flags & DescF::WRITE) | DescF::NEXT;
				self.ring.write_desc(id, desc);
				last = id;
				id = desc.next.to_ne();
			}
			let mut desc = self.ring.read_desc(last);
			desc.flags -= DescF::NEXT;
			self.ring.write_desc(last, desc);
			self.avail_head = id;
		}

		debug_assert!(self.cookies[usize::from(head)].is_none());
		self.cookies[usize::from(head)] = Some(cookie);
		self.avail_count -= needed as u16;
		self.avail_added_since_kick = self.avail_added_since_kick.wrapping_add(1);

		let avail_idx = load(self.ring.avail_idx(), Ordering::Relaxed);
		self.ring.write_avail_entry(avail_idx, head);
		store(
			self.ring.avail_idx(),
			avail_idx.wrapping_add(1),
			Ordering::Release,
		);

		trace!(
			"vq {}: posted chain {head} ({} segments, indirect: {indirect})",
			u16::from(self.index),
			segments.len()
		);

		Ok(head)
	}

	/// Posts `segments`, blocking until the ring has room for them.
	///
	/// While waiting, completions are retrieved and handed to `on_complete`.
	/// Only errors that cannot be resolved by waiting are returned. Once the
	/// [`waiter`](Self::waiter) slot is closed, the wait gives up with
	/// [`VirtqError::WaitAborted`].
	pub fn add_buf_wait(
		&mut self,
		segments: &[Segment],
		mut cookie: C,
		mut on_complete: impl FnMut(C, u32),
	) -> Result<u16, Rejected<C>> {
		let waiter = Arc::clone(&self.waiter);
		let backoff = Backoff::new();

		loop {
			match self.add_buf(segments, cookie) {
				Ok(head) => return Ok(head),
				Err(rejected) if rejected.error.is_recoverable() => cookie = rejected.cookie,
				Err(rejected) => return Err(rejected),
			}

			if waiter.is_closed() {
				return Err(Rejected::new(cookie, VirtqError::WaitAborted));
			}

			if self.avail_ring_has_room(segments.len()) {
				// Only an allocation failure ends up here.
				backoff.snooze();
				continue;
			}

			while !self.avail_ring_has_room(segments.len()) {
				self.enable_interrupts();
				waiter.wait_until(|| {
					self.used_ring_not_empty() || self.used_ring_can_gc() || waiter.is_closed()
				});
				self.disable_interrupts();

				while let Some((done, len)) = match self.get_buf_elem() {
					Ok(elem) => elem,
					Err(err) => return Err(Rejected::new(cookie, err)),
				} {
					self.get_buf_finalize();
					on_complete(done, len);
				}
				if let Err(err) = self.get_buf_gc() {
					return Err(Rejected::new(cookie, err));
				}
				if waiter.is_closed() {
					return Err(Rejected::new(cookie, VirtqError::WaitAborted));
				}
			}
		}
	}

	fn checked_id(&self, id: u32) -> Result<u16, VirtqError> {
		match u16::try_from(id) {
			Ok(id) if id < self.size() => Ok(id),
			_ => Err(VirtqError::ProtocolViolation(
				"used element refers to a descriptor out of range",
			)),
		}
	}

	/// Retrieves the cookie and the written length of the next completed
	/// chain without advancing past it. See [`Self::get_buf_finalize`].
	pub fn get_buf_elem(&mut self) -> Result<Option<(C, u32)>, VirtqError> {
		let used_idx = load(self.ring.used_idx(), Ordering::Acquire);
		if used_idx == self.used_host_head {
			return Ok(None);
		}
		if used_idx.wrapping_sub(self.used_guest_head) > self.size() {
			return Err(VirtqError::ProtocolViolation(
				"used index ran ahead of the posted chains",
			));
		}

		let elem = self.ring.read_used_elem(self.used_host_head);
		let id = self.checked_id(elem.id.to_ne())?;
		let cookie = self.cookies[usize::from(id)]
			.take()
			.ok_or(VirtqError::ProtocolViolation(
				"used element refers to a chain that is not in flight",
			))?;

		Ok(Some((cookie, elem.len.to_ne())))
	}

	/// Moves past the element returned by [`Self::get_buf_elem`].
	pub fn get_buf_finalize(&mut self) {
		self.used_host_head = self.used_host_head.wrapping_add(1);
	}

	/// Returns the descriptors of all retrieved chains to the free list.
	///
	/// Returns the number of chains reclaimed.
	pub fn get_buf_gc(&mut self) -> Result<usize, VirtqError> {
		let mut reclaimed = 0;

		while self.used_guest_head != self.used_host_head {
			let elem = self.ring.read_used_elem(self.used_guest_head);
			let head = self.checked_id(elem.id.to_ne())?;

			let mut tail = head;
			let mut count: u16 = 1;
			if let Some(table) = self.indirect[usize::from(head)].take() {
				// SAFETY: the device has returned the chain.
				unsafe { table.free(&*self.alloc) };
			} else {
				loop {
					let desc = self.ring.read_desc(tail);
					if !desc.flags.contains(DescF::NEXT) {
						break;
					}
					tail = desc.next.to_ne();
					count += 1;
					if tail >= self.size() || count > self.size() {
						return Err(VirtqError::ProtocolViolation("descriptor chain is corrupted"));
					}
				}
			}

			let mut desc = self.ring.read_desc(tail);
			desc.next = le16::from_ne(self.avail_head);
			self.ring.write_desc(tail, desc);
			self.avail_head = head;
			self.avail_count += count;
			self.used_guest_head = self.used_guest_head.wrapping_add(1);
			reclaimed += 1;

			trace!(
				"vq {}: reclaimed chain {head} ({count} descriptors)",
				u16::from(self.index)
			);
		}

		Ok(reclaimed)
	}

	/// Retrieves all completed chains.
	pub fn reclaim_completions(&mut self) -> Completions<'_, C> {
		Completions {
			vq: self,
			failed: false,
		}
	}

	/// Notifies the device about newly posted chains, unless it asked not to be.
	///
	/// Returns whether the device has been notified.
	pub fn kick(&mut self) -> bool {
		// The used ring flags and the avail event are written by the device,
		// so order them after the index published by `add_buf`.
		fence(Ordering::SeqCst);

		let mut kicked = true;
		if self.features.contains(F::EVENT_IDX) {
			let avail_idx = load(self.ring.avail_idx(), Ordering::Relaxed);
			let avail_event = load(self.ring.avail_event(), Ordering::Relaxed);
			kicked = avail_idx.wrapping_sub(avail_event).wrapping_sub(1) < self.avail_added_since_kick;
		} else if self.ring.used_flags().contains(UsedF::NO_NOTIFY) {
			return false;
		}

		// Bound the staleness of a suppressed notification to half an index wrap.
		if kicked || self.avail_added_since_kick >= u16::MAX / 2 {
			debug!(
				"vq {}: kick after {} posts",
				u16::from(self.index),
				self.avail_added_since_kick
			);
			self.notifier.notify(self.index);
			self.avail_added_since_kick = 0;
			return true;
		}

		false
	}

	/// Asks the device to raise an interrupt for the next completion.
	pub fn enable_interrupts(&mut self) {
		let flags = self.ring.avail_flags() - AvailF::NO_INTERRUPT;
		self.ring.set_avail_flags(flags);
		store(self.ring.used_event(), self.used_host_head, Ordering::Relaxed);
		fence(Ordering::SeqCst);
	}

	pub fn disable_interrupts(&mut self) {
		let flags = self.ring.avail_flags() | AvailF::NO_INTERRUPT;
		self.ring.set_avail_flags(flags);
	}

	/// Completions not yet retrieved exist.
	pub fn used_ring_not_empty(&self) -> bool {
		load(self.ring.used_idx(), Ordering::Relaxed) != self.used_host_head
	}

	pub fn used_ring_is_half_empty(&self) -> bool {
		load(self.ring.used_idx(), Ordering::Relaxed).wrapping_sub(self.used_host_head)
			> self.size() / 2
	}

	/// Retrieved chains exist whose descriptors are not yet on the free list.
	pub fn used_ring_can_gc(&self) -> bool {
		self.used_guest_head != self.used_host_head
	}

	/// Free descriptors plus the chains that [`Self::get_buf_gc`] can reclaim.
	pub fn effective_avail_ring_count(&self) -> u16 {
		self.avail_count
			.wrapping_add(self.used_host_head.wrapping_sub(self.used_guest_head))
	}

	pub fn avail_ring_not_empty(&self) -> bool {
		self.effective_avail_ring_count() > 0
	}

	pub fn refill_ring_cond(&self) -> bool {
		self.effective_avail_ring_count() >= self.size() / 2
	}

	/// A post of `segments` segments would find enough descriptors.
	pub fn avail_ring_has_room(&self, segments: usize) -> bool {
		let needed = if self.use_indirect(segments) {
			1
		} else {
			segments
		};
		usize::from(self.effective_avail_ring_count()) >= needed
	}
}

impl<C> Drop for Virtqueue<C> {
	fn drop(&mut self) {
		for table in self.indirect.iter_mut().filter_map(Option::take) {
			// SAFETY: the queue is detached from the device.
			unsafe { table.free(&*self.alloc) };
		}
		// SAFETY: the storage was allocated with this layout in `new`.
		unsafe { self.alloc.deallocate(self.storage, self.storage_layout) };
		debug!("Freed split virtqueue {}", u16::from(self.index));
	}
}

/// Iterator over the completed chains of a [`Virtqueue`].
///
/// Stops after the first protocol violation.
pub struct Completions<'a, C> {
	vq: &'a mut Virtqueue<C>,
	failed: bool,
}

impl<C> Iterator for Completions<'_, C> {
	type Item = Result<(C, u32), VirtqError>;

	fn next(&mut self) -> Option<Self::Item> {
		if self.failed {
			return None;
		}
		match self.vq.get_buf_elem() {
			Ok(Some(elem)) => {
				self.vq.get_buf_finalize();
				Some(Ok(elem))
			}
			Ok(None) => None,
			Err(err) => {
				self.failed = true;
				Some(Err(err))
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicUsize;
	use std::thread;

	use super::*;
	use crate::mm::HostAlloc;

	#[derive(Default)]
	struct CountingNotifier(AtomicUsize);

	impl DeviceNotifier for CountingNotifier {
		fn notify(&self, _queue: VqIndex) {
			self.0.fetch_add(1, Ordering::SeqCst);
		}
	}

	impl CountingNotifier {
		fn count(&self) -> usize {
			self.0.load(Ordering::SeqCst)
		}
	}

	struct FailingAlloc;

	impl DeviceAlloc for FailingAlloc {
		fn allocate_zeroed(&self, layout: Layout) -> Option<NonNull<u8>> {
			// Only ring storage is page aligned.
			if layout.align() == VIRTIO_PCI_VRING_ALIGN {
				HostAlloc.allocate_zeroed(layout)
			} else {
				None
			}
		}

		unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
			unsafe { HostAlloc.deallocate(ptr, layout) }
		}

		fn phys_addr_from(&self, ptr: *const u8) -> PhysAddr {
			HostAlloc.phys_addr_from(ptr)
		}

		fn ptr_from(&self, phys_addr: PhysAddr) -> *mut u8 {
			HostAlloc.ptr_from(phys_addr)
		}
	}

	fn queue(size: u16, features: F) -> (Virtqueue<u32>, Arc<CountingNotifier>) {
		let notifier = Arc::new(CountingNotifier::default());
		let vq = Virtqueue::new(
			VqIndex::from(1u16),
			VqSize::from(size),
			features,
			Arc::new(HostAlloc),
			notifier.clone(),
		)
		.unwrap();
		(vq, notifier)
	}

	fn segments(n: usize) -> Vec<Segment> {
		(0..n)
			.map(|i| Segment::readable(PhysAddr::new(0x1000 * (i as u64 + 1)), 64))
			.collect()
	}

	/// Plays the device: consumes every available chain and completes it.
	fn complete_all(ring: &SplitRing, last_avail: &mut u16) {
		let avail_idx = load(ring.avail_idx(), Ordering::Acquire);
		let mut used_idx = load(ring.used_idx(), Ordering::Relaxed);
		while *last_avail != avail_idx {
			let head = ring.read_avail_entry(*last_avail);
			ring.write_used_elem(
				used_idx,
				UsedElem {
					id: le32::from_ne(head.into()),
					len: le32::from_ne(0),
				},
			);
			used_idx = used_idx.wrapping_add(1);
			*last_avail = last_avail.wrapping_add(1);
		}
		store(ring.used_idx(), used_idx, Ordering::Release);
	}

	/// A second view of the ring memory of `vq` for a device on another thread.
	fn device_view(vq: &Virtqueue<u32>) -> SplitRing {
		// SAFETY: the view does not outlive the test and only touches the
		// parts of the ring that belong to the device.
		unsafe { SplitRing::from_parts(vq.size(), vq.ring.desc, vq.ring.avail, vq.ring.used) }
	}

	fn free_list(vq: &Virtqueue<u32>) -> Vec<u16> {
		let mut ids = Vec::new();
		let mut id = vq.avail_head;
		for _ in 0..vq.avail_count {
			ids.push(id);
			id = vq.ring.read_desc(id).next.to_ne();
		}
		ids
	}

	#[test]
	fn geometry() {
		assert_eq!(vring_size(256, 4096), 8192 + 6 + 8 * 256);
		assert_eq!(used_offset(256, 4096), 8192);
		assert_eq!(vring_size(8, 4096), 4096 + 6 + 64);

		let (vq, _) = queue(8, F::empty());
		let addresses = vq.addresses();
		assert_eq!(addresses.avail.as_u64() - addresses.desc.as_u64(), 128);
		assert_eq!(addresses.used.as_u64() - addresses.desc.as_u64(), 4096);
	}

	#[test]
	fn rejects_bad_sizes() {
		for size in [0u16, 3, 100] {
			let result = Virtqueue::<u32>::new(
				VqIndex::from(0u16),
				VqSize::from(size),
				F::empty(),
				Arc::new(HostAlloc),
				Arc::new(CountingNotifier::default()),
			);
			assert!(matches!(result, Err(VirtqError::QueueSizeNotAllowed(s)) if s == size));
		}
	}

	#[test]
	fn capacity_invariant() {
		let (mut vq, _) = queue(16, F::empty());
		let mut last_avail = 0;
		let mut in_flight = 0u16;

		for round in 0..40u32 {
			let n = (round % 4 + 1) as usize;
			if vq.add_buf(&segments(n), round).is_ok() {
				in_flight += n as u16;
			}
			assert_eq!(vq.avail_count() + in_flight, 16);

			if round % 3 == 0 {
				complete_all(&vq.ring, &mut last_avail);
				for completion in vq.reclaim_completions() {
					let (cookie, _) = completion.unwrap();
					in_flight -= (cookie % 4 + 1) as u16;
				}
				vq.get_buf_gc().unwrap();
				assert_eq!(vq.avail_count() + in_flight, 16);
			}
		}

		let mut free = free_list(&vq);
		free.sort_unstable();
		free.dedup();
		assert_eq!(free.len(), usize::from(vq.avail_count()));
		assert!(free.iter().all(|&id| vq.cookies[usize::from(id)].is_none()));
	}

	#[test]
	fn no_double_use() {
		let (mut vq, _) = queue(8, F::empty());
		let mut last_avail = 0;
		let mut heads = Vec::new();
		for cookie in 0..4 {
			heads.push(vq.add_buf(&segments(2), cookie).unwrap());
		}
		heads.sort_unstable();
		heads.dedup();
		assert_eq!(heads.len(), 4);

		complete_all(&vq.ring, &mut last_avail);
		let (cookie, _) = vq.get_buf_elem().unwrap().unwrap();
		assert_eq!(cookie, 0);
		vq.get_buf_finalize();

		// Retrieved but not yet reclaimed chains stay off the free list.
		assert_eq!(vq.avail_count(), 0);
		assert!(vq.used_ring_can_gc());
		assert_eq!(vq.effective_avail_ring_count(), 1);

		// The next post reclaims the first chain and reuses its head.
		let head = vq.add_buf(&segments(1), 9).unwrap();
		assert_eq!(head, heads[0]);
		assert!(!vq.used_ring_can_gc());
	}

	#[test]
	fn backpressure_round_trip() {
		let (mut vq, notifier) = queue(4, F::empty());
		let mut last_avail = 0;
		vq.add_buf(&segments(3), 1).unwrap();

		let before: Vec<_> = (0..4).map(|id| vq.ring.read_desc(id).next.to_ne()).collect();
		let rejected = vq.add_buf(&segments(2), 2).unwrap_err();
		assert_eq!(rejected.error, VirtqError::NoDescrAvail);
		assert_eq!(rejected.cookie, 2);
		assert_eq!(notifier.count(), 1);
		assert_eq!(vq.avail_count(), 1);
		let after: Vec<_> = (0..4).map(|id| vq.ring.read_desc(id).next.to_ne()).collect();
		assert_eq!(before, after);
		assert_eq!(load(vq.ring.avail_idx(), Ordering::Relaxed), 1);

		complete_all(&vq.ring, &mut last_avail);
		assert_eq!(vq.reclaim_completions().count(), 1);
		vq.add_buf(&segments(2), rejected.cookie).unwrap();
		assert_eq!(vq.avail_count(), 2);
	}

	#[test]
	fn too_large_without_indirect() {
		let (mut vq, _) = queue(4, F::INDIRECT_DESC);
		let rejected = vq.add_buf(&segments(5), 1).unwrap_err();
		assert_eq!(rejected.error, VirtqError::BufferTooLarge(5));

		let rejected = vq.add_buf(&[], 2).unwrap_err();
		assert_eq!(rejected.error, VirtqError::BufferNotSpecified);
	}

	#[test]
	fn indirect_when_starved() {
		let (mut vq, _) = queue(8, F::INDIRECT_DESC);
		vq.set_use_indirect(true);

		// Plenty of room: a direct chain.
		let head = vq.add_buf(&segments(3), 1).unwrap();
		assert!(!vq.ring.read_desc(head).flags.contains(DescF::INDIRECT));
		assert_eq!(vq.avail_count(), 5);

		vq.add_buf(&segments(4), 2).unwrap();
		assert_eq!(vq.avail_count(), 1);

		// Below a quarter of the ring: one indirect descriptor.
		let head = vq.add_buf(&segments(5), 3).unwrap();
		let desc = vq.ring.read_desc(head);
		assert_eq!(desc.flags, DescF::INDIRECT);
		assert_eq!(desc.len.to_ne(), 5 * 16);
		assert_eq!(vq.avail_count(), 0);

		let table = HostAlloc
			.ptr_from(PhysAddr::new(desc.addr.to_ne()))
			.cast::<Desc>();
		let last = unsafe { table.add(4).read() };
		assert!(!last.flags.contains(DescF::NEXT));
		let first = unsafe { table.read() };
		assert_eq!(first.flags, DescF::NEXT);
		assert_eq!(first.next.to_ne(), 1);

		let mut last_avail = 0;
		complete_all(&vq.ring, &mut last_avail);
		assert_eq!(vq.reclaim_completions().count(), 3);
		assert_eq!(vq.get_buf_gc().unwrap(), 3);
		assert_eq!(vq.avail_count(), 8);
	}

	#[test]
	fn allocation_failure_leaves_no_state() {
		let notifier = Arc::new(CountingNotifier::default());
		let mut vq = Virtqueue::new(
			VqIndex::from(0u16),
			VqSize::from(4u16),
			F::INDIRECT_DESC,
			Arc::new(FailingAlloc),
			notifier,
		)
		.unwrap();
		vq.set_use_indirect(true);

		let rejected = vq.add_buf(&segments(6), 7).unwrap_err();
		assert_eq!(rejected.error, VirtqError::AllocationError);
		assert!(rejected.error.is_recoverable());
		assert_eq!(rejected.cookie, 7);
		assert_eq!(vq.avail_count(), 4);
		assert_eq!(load(vq.ring.avail_idx(), Ordering::Relaxed), 0);
	}

	#[test]
	fn kick_without_event_idx() {
		let (mut vq, notifier) = queue(8, F::empty());
		vq.add_buf(&segments(1), 1).unwrap();
		assert!(vq.kick());

		vq.ring.set_used_flags(UsedF::NO_NOTIFY);
		vq.add_buf(&segments(1), 2).unwrap();
		assert!(!vq.kick());
		assert_eq!(notifier.count(), 1);
	}

	#[test]
	fn kick_suppression() {
		let (mut vq, notifier) = queue(8, F::EVENT_IDX);
		let mut last_avail = 0;

		// The device wants to be notified once the chain at index 3 is available.
		store(vq.ring.avail_event(), 3, Ordering::Relaxed);
		for cookie in 0..3 {
			vq.add_buf(&segments(1), cookie).unwrap();
			assert!(!vq.kick());
		}
		vq.add_buf(&segments(1), 3).unwrap();
		assert!(vq.kick());
		assert_eq!(notifier.count(), 1);

		complete_all(&vq.ring, &mut last_avail);
		assert_eq!(vq.reclaim_completions().count(), 4);

		// Unchanged event index: small increments stay quiet.
		vq.add_buf(&segments(1), 4).unwrap();
		assert!(!vq.kick());
		vq.add_buf(&segments(1), 5).unwrap();
		assert!(!vq.kick());
		assert_eq!(notifier.count(), 1);
	}

	#[test]
	fn kick_at_half_wrap() {
		let (mut vq, notifier) = queue(8, F::EVENT_IDX);
		let mut last_avail = 0;
		store(vq.ring.avail_event(), 40_000, Ordering::Relaxed);

		let mut posted = 0u32;
		while posted < u32::from(u16::MAX / 2) {
			vq.add_buf(&segments(1), posted).unwrap();
			posted += 1;
			if posted < u32::from(u16::MAX / 2) {
				assert!(!vq.kick(), "kicked after {posted} posts");
			}
			complete_all(&vq.ring, &mut last_avail);
			assert_eq!(vq.reclaim_completions().count(), 1);
		}
		assert!(vq.kick());
		assert_eq!(notifier.count(), 1);
	}

	#[test]
	fn interrupt_suppression() {
		let (mut vq, _) = queue(8, F::EVENT_IDX);
		let mut last_avail = 0;
		vq.disable_interrupts();
		assert!(vq.ring.avail_flags().contains(AvailF::NO_INTERRUPT));

		vq.add_buf(&segments(1), 1).unwrap();
		complete_all(&vq.ring, &mut last_avail);
		assert!(vq.used_ring_not_empty());
		assert_eq!(vq.reclaim_completions().count(), 1);

		vq.enable_interrupts();
		assert!(!vq.ring.avail_flags().contains(AvailF::NO_INTERRUPT));
		assert_eq!(load(vq.ring.used_event(), Ordering::Relaxed), 1);
	}

	#[test]
	fn protocol_violation() {
		let (mut vq, _) = queue(8, F::empty());
		vq.add_buf(&segments(1), 1).unwrap();

		// Completes a descriptor that was never posted.
		vq.ring.write_used_elem(
			0,
			UsedElem {
				id: le32::from_ne(5),
				len: le32::from_ne(0),
			},
		);
		store(vq.ring.used_idx(), 1, Ordering::Release);
		assert!(matches!(
			vq.get_buf_elem(),
			Err(VirtqError::ProtocolViolation(_))
		));

		vq.ring.write_used_elem(
			0,
			UsedElem {
				id: le32::from_ne(100),
				len: le32::from_ne(0),
			},
		);
		let mut completions = vq.reclaim_completions();
		assert!(matches!(
			completions.next(),
			Some(Err(VirtqError::ProtocolViolation(_)))
		));
		assert!(completions.next().is_none());
	}

	#[test]
	fn ring_predicates() {
		let (mut vq, _) = queue(8, F::empty());
		let mut last_avail = 0;
		assert!(vq.refill_ring_cond());
		assert!(vq.avail_ring_has_room(8));
		assert!(!vq.avail_ring_has_room(9));

		for cookie in 0..8 {
			vq.add_buf(&segments(1), cookie).unwrap();
		}
		assert!(!vq.avail_ring_not_empty());
		assert!(!vq.refill_ring_cond());

		complete_all(&vq.ring, &mut last_avail);
		assert!(vq.used_ring_is_half_empty());
		for _ in 0..5 {
			vq.get_buf_elem().unwrap().unwrap();
			vq.get_buf_finalize();
		}
		assert!(!vq.used_ring_is_half_empty());
		assert!(vq.avail_ring_has_room(5));
		assert!(vq.refill_ring_cond());
	}

	#[test]
	fn add_buf_wait_reclaims_while_blocked() {
		let (mut vq, _) = queue(8, F::empty());
		for cookie in 0..4 {
			vq.add_buf(&segments(2), cookie).unwrap();
		}
		assert_eq!(vq.avail_count(), 0);

		let device = device_view(&vq);
		let slot = vq.waiter();
		let handle = thread::spawn(move || {
			let mut completed = Vec::new();
			let head = vq.add_buf_wait(&segments(2), 4, |cookie, _| completed.push(cookie));
			(vq, head.map_err(|rejected| rejected.error), completed)
		});

		while !slot.has_waiter() {
			thread::yield_now();
		}
		let mut last_avail = 0;
		complete_all(&device, &mut last_avail);
		slot.wake();

		let (vq, head, completed) = handle.join().unwrap();
		let head = head.unwrap();
		assert_eq!(completed, [0, 1, 2, 3]);
		assert_eq!(vq.cookies[usize::from(head)], Some(4));
		assert_eq!(vq.avail_count(), 6);
		assert!(vq.ring.avail_flags().contains(AvailF::NO_INTERRUPT));
	}

	#[test]
	fn add_buf_wait_gives_up_when_closed() {
		let (mut vq, _) = queue(8, F::empty());
		for cookie in 0..4 {
			vq.add_buf(&segments(2), cookie).unwrap();
		}

		let slot = vq.waiter();
		let handle = thread::spawn(move || {
			let mut completed = Vec::new();
			let result = vq.add_buf_wait(&segments(2), 4, |cookie, _| completed.push(cookie));
			(vq, result.map_err(Rejected::into_inner), completed)
		});

		while !slot.has_waiter() {
			thread::yield_now();
		}
		slot.close();

		let (mut vq, result, completed) = handle.join().unwrap();
		assert_eq!(result, Err((4, VirtqError::WaitAborted)));
		assert!(completed.is_empty());
		assert_eq!(vq.avail_count(), 0);

		// A closed slot refuses immediately instead of blocking again.
		let rejected = vq.add_buf_wait(&segments(1), 5, |_, _| {}).unwrap_err();
		assert_eq!(rejected.error, VirtqError::WaitAborted);
	}
}
