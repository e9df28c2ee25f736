//! Single-producer/single-consumer lock-free ring buffer of fixed size.
//!
//! The ring is split into a [`Producer`] and a [`Consumer`] half, so the
//! single-writer/single-reader discipline is carried by ownership instead of
//! by convention.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

struct Ring<T> {
	/// Consumer index, only written by the [`Consumer`].
	begin: CachePadded<AtomicUsize>,
	/// Producer index, only written by the [`Producer`].
	end: CachePadded<AtomicUsize>,
	mask: usize,
	buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// The producer only writes slots outside `begin..end`, the consumer only reads
// slots inside. Ownership of a slot is handed over by the index stores.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
	#[inline]
	fn capacity(&self) -> usize {
		self.mask + 1
	}

	#[inline]
	fn len(&self) -> usize {
		let end = self.end.load(Ordering::Relaxed);
		let begin = self.begin.load(Ordering::Relaxed);
		end.wrapping_sub(begin)
	}

	#[inline]
	fn slot(&self, index: usize) -> *mut MaybeUninit<T> {
		self.buffer[index & self.mask].get()
	}
}

impl<T> Drop for Ring<T> {
	fn drop(&mut self) {
		let begin = *self.begin.get_mut();
		let end = *self.end.get_mut();
		let mut index = begin;
		while index != end {
			// SAFETY: every slot in `begin..end` has been initialized by a push.
			unsafe { (*self.slot(index)).assume_init_drop() };
			index = index.wrapping_add(1);
		}
	}
}

/// Creates a ring with room for `capacity` elements.
///
/// # Panics
///
/// Panics if `capacity` is not a power of two.
pub fn ring<T>(capacity: usize) -> (Producer<T>, Consumer<T>) {
	assert!(
		capacity.is_power_of_two(),
		"ring capacity {capacity} is not a power of two"
	);

	let buffer = (0..capacity)
		.map(|_| UnsafeCell::new(MaybeUninit::uninit()))
		.collect::<Vec<_>>()
		.into_boxed_slice();
	let ring = Arc::new(Ring {
		begin: CachePadded::new(AtomicUsize::new(0)),
		end: CachePadded::new(AtomicUsize::new(0)),
		mask: capacity - 1,
		buffer,
	});

	(
		Producer {
			ring: Arc::clone(&ring),
		},
		Consumer { ring },
	)
}

/// The writing half of a ring.
pub struct Producer<T> {
	ring: Arc<Ring<T>>,
}

impl<T> Producer<T> {
	/// Appends `element`, or hands it back if the ring is full.
	pub fn push(&mut self, element: T) -> Result<(), T> {
		let end = self.ring.end.load(Ordering::Relaxed);
		let begin = self.ring.begin.load(Ordering::Acquire);

		if end.wrapping_sub(begin) >= self.ring.capacity() {
			return Err(element);
		}

		// SAFETY: the slot lies outside `begin..end` and is owned by the producer.
		unsafe { (*self.ring.slot(end)).write(element) };
		self.ring.end.store(end.wrapping_add(1), Ordering::Release);

		Ok(())
	}

	pub fn len(&self) -> usize {
		self.ring.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn capacity(&self) -> usize {
		self.ring.capacity()
	}
}

/// The reading half of a ring.
pub struct Consumer<T> {
	ring: Arc<Ring<T>>,
}

impl<T> Consumer<T> {
	/// Removes the oldest element.
	pub fn pop(&mut self) -> Option<T> {
		let begin = self.ring.begin.load(Ordering::Relaxed);
		let end = self.ring.end.load(Ordering::Acquire);

		if begin == end {
			return None;
		}

		// SAFETY: the slot lies inside `begin..end` and was published by the producer.
		let element = unsafe { (*self.ring.slot(begin)).assume_init_read() };
		self.ring.begin.store(begin.wrapping_add(1), Ordering::Release);

		Some(element)
	}

	/// Returns the oldest element without dequeuing it.
	pub fn front(&self) -> Option<&T> {
		let begin = self.ring.begin.load(Ordering::Relaxed);
		let end = self.ring.end.load(Ordering::Acquire);

		if begin == end {
			return None;
		}

		// SAFETY: the slot stays initialized until `pop`, which needs `&mut self`.
		Some(unsafe { (*self.ring.slot(begin)).assume_init_ref() })
	}

	pub fn len(&self) -> usize {
		self.ring.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn capacity(&self) -> usize {
		self.ring.capacity()
	}
}
