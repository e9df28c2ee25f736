//! Multi-producer/single-consumer lock-free queue of fixed size.
//!
//! Used to hand "please wake me" tokens from blocked producers to the owner of
//! a queue. The number of writers is bounded by the number of blocked
//! contexts, so the capacity is sized to never overflow in practice.

use std::marker::PhantomData;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

pub struct MpscRing<T> {
	/// Next index handed out to a producer.
	insert: CachePadded<AtomicUsize>,
	/// Next index to be consumed.
	begin: CachePadded<AtomicUsize>,
	/// A null slot is empty.
	slots: Box<[AtomicPtr<T>]>,
	_marker: PhantomData<Arc<T>>,
}

impl<T> MpscRing<T> {
	/// # Panics
	///
	/// Panics if `capacity` is zero.
	pub fn new(capacity: usize) -> Self {
		assert!(capacity > 0, "waiter queue needs at least one slot");

		Self {
			insert: CachePadded::new(AtomicUsize::new(0)),
			begin: CachePadded::new(AtomicUsize::new(0)),
			slots: (0..capacity)
				.map(|_| AtomicPtr::new(ptr::null_mut()))
				.collect(),
			_marker: PhantomData,
		}
	}

	pub fn capacity(&self) -> usize {
		self.slots.len()
	}

	/// Enqueues `element`. May be called from any number of contexts.
	///
	/// Returns the element if the queue is full. A full waiter queue means
	/// more contexts are blocked than the queue was sized for.
	pub fn push(&self, element: Arc<T>) -> Result<(), Arc<T>> {
		let mut index = self.insert.load(Ordering::Relaxed);
		loop {
			let begin = self.begin.load(Ordering::Acquire);
			if index.wrapping_sub(begin) >= self.capacity() {
				return Err(element);
			}

			match self.insert.compare_exchange_weak(
				index,
				index.wrapping_add(1),
				Ordering::AcqRel,
				Ordering::Relaxed,
			) {
				Ok(_) => break,
				Err(current) => index = current,
			}
		}

		// `index - begin < capacity`, so the consumer has already emptied this slot.
		let raw = Arc::into_raw(element).cast_mut();
		let previous = self.slots[index % self.capacity()].swap(raw, Ordering::Release);
		debug_assert!(previous.is_null());

		Ok(())
	}

	/// Dequeues the oldest element. Must only be called by the single consumer.
	///
	/// An element whose producer has reserved its slot but not yet stored it is
	/// reported as absent; it becomes visible on a later call.
	pub fn pop(&self) -> Option<Arc<T>> {
		let begin = self.begin.load(Ordering::Relaxed);
		let raw = self.slots[begin % self.capacity()].swap(ptr::null_mut(), Ordering::Acquire);

		if raw.is_null() {
			return None;
		}

		self.begin.store(begin.wrapping_add(1), Ordering::Release);
		// SAFETY: non-null slots hold pointers produced by `Arc::into_raw` in `push`.
		Some(unsafe { Arc::from_raw(raw) })
	}

	/// Number of reserved slots, including ones whose element is not yet stored.
	pub fn len(&self) -> usize {
		let insert = self.insert.load(Ordering::Relaxed);
		let begin = self.begin.load(Ordering::Relaxed);
		insert.wrapping_sub(begin)
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

impl<T> Drop for MpscRing<T> {
	fn drop(&mut self) {
		for slot in self.slots.iter_mut() {
			let raw = *slot.get_mut();
			if !raw.is_null() {
				// SAFETY: see `pop`.
				drop(unsafe { Arc::from_raw(raw) });
			}
		}
	}
}
