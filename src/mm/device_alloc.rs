use std::alloc::{self, Layout};
use std::ptr::{self, NonNull};

use memory_addresses::PhysAddr;

/// An allocator for memory that is used to communicate with devices.
///
/// Allocations from this allocator always correspond to contiguous physical
/// memory, and every address handed out can be translated in both directions.
pub trait DeviceAlloc: Send + Sync {
	/// Allocates zeroed, physically contiguous memory.
	///
	/// Returns `None` if the request cannot be satisfied.
	fn allocate_zeroed(&self, layout: Layout) -> Option<NonNull<u8>>;

	/// # Safety
	///
	/// `ptr` must have been returned by [`Self::allocate_zeroed`] with the same
	/// `layout` and must not be used afterwards.
	unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);

	/// Returns the physical address of `ptr`.
	fn phys_addr_from(&self, ptr: *const u8) -> PhysAddr;

	/// Returns a pointer corresponding to `phys_addr`.
	fn ptr_from(&self, phys_addr: PhysAddr) -> *mut u8;
}

/// Device memory of a process-hosted device.
///
/// Virtual and physical addresses coincide, which is the view a device thread
/// in the same address space has of the rings.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostAlloc;

impl DeviceAlloc for HostAlloc {
	fn allocate_zeroed(&self, layout: Layout) -> Option<NonNull<u8>> {
		if layout.size() == 0 {
			return None;
		}
		// SAFETY: the layout has a non-zero size.
		NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
	}

	unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
		unsafe { alloc::dealloc(ptr.as_ptr(), layout) }
	}

	#[inline]
	fn phys_addr_from(&self, ptr: *const u8) -> PhysAddr {
		PhysAddr::new(ptr.expose_provenance() as u64)
	}

	#[inline]
	fn ptr_from(&self, phys_addr: PhysAddr) -> *mut u8 {
		ptr::with_exposed_provenance_mut(phys_addr.as_u64() as usize)
	}
}
