//! Blocking and waking of execution contexts.
//!
//! A woken context always re-checks the condition it waited for, so every
//! wakeup here may be spurious.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_utils::sync::{Parker, Unparker};
use hermit_sync::SpinMutex;

/// The shared half of a [`Waiter`]: a one-shot wakeup token.
#[derive(Debug)]
pub struct WaitRecord {
	woken: AtomicBool,
	unparker: Unparker,
}

impl WaitRecord {
	/// Wakes the waiting context. Later calls have no further effect.
	pub fn wake(&self) {
		if !self.woken.swap(true, Ordering::AcqRel) {
			self.unparker.unpark();
		}
	}

	pub fn is_woken(&self) -> bool {
		self.woken.load(Ordering::Acquire)
	}
}

/// A context waiting for a single [`WaitRecord::wake`].
pub struct Waiter {
	parker: Parker,
	record: Arc<WaitRecord>,
}

impl Waiter {
	pub fn new() -> Self {
		let parker = Parker::new();
		let record = Arc::new(WaitRecord {
			woken: AtomicBool::new(false),
			unparker: parker.unparker().clone(),
		});

		Self { parker, record }
	}

	/// Returns the token to hand to the waking side.
	pub fn record(&self) -> Arc<WaitRecord> {
		Arc::clone(&self.record)
	}

	/// Blocks until the record has been woken.
	pub fn wait(&self) {
		while !self.record.is_woken() {
			self.parker.park();
		}
	}
}

impl Default for Waiter {
	fn default() -> Self {
		Self::new()
	}
}

/// Holds the single context that may block on a resource.
///
/// The resource owner registers itself before sleeping; an interrupt handler
/// wakes whoever is registered. A closed slot wakes its waiter for good, so
/// conditions passed to [`WaiterSlot::wait_until`] have to include
/// [`WaiterSlot::is_closed`] when the resource can go away.
#[derive(Default)]
pub struct WaiterSlot {
	unparker: SpinMutex<Option<Unparker>>,
	closed: AtomicBool,
}

impl WaiterSlot {
	pub const fn new() -> Self {
		Self {
			unparker: SpinMutex::new(None),
			closed: AtomicBool::new(false),
		}
	}

	/// Blocks until `condition` holds, re-evaluating it on each wakeup.
	pub fn wait_until(&self, mut condition: impl FnMut() -> bool) {
		if condition() {
			return;
		}

		let parker = Parker::new();
		*self.unparker.lock() = Some(parker.unparker().clone());

		while !condition() {
			parker.park();
		}

		self.unparker.lock().take();
	}

	/// Wakes the registered context, if any.
	pub fn wake(&self) -> bool {
		match self.unparker.lock().as_ref() {
			Some(unparker) => {
				unparker.unpark();
				true
			}
			None => false,
		}
	}

	pub fn has_waiter(&self) -> bool {
		self.unparker.lock().is_some()
	}

	/// Marks the resource as gone and wakes the registered context.
	pub fn close(&self) {
		self.closed.store(true, Ordering::SeqCst);
		self.wake();
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicUsize;
	use std::thread;
	use std::time::Duration;

	use super::*;

	#[test]
	fn wake_before_wait() {
		let waiter = Waiter::new();
		let record = waiter.record();
		record.wake();
		record.wake();
		waiter.wait();
		assert!(record.is_woken());
	}

	#[test]
	fn wake_from_other_thread() {
		let waiter = Waiter::new();
		let record = waiter.record();
		let waker = thread::spawn(move || {
			thread::sleep(Duration::from_millis(10));
			record.wake();
		});
		waiter.wait();
		waker.join().unwrap();
	}

	#[test]
	fn slot_rechecks_condition() {
		let slot = Arc::new(WaiterSlot::new());
		let counter = Arc::new(AtomicUsize::new(0));
		assert!(!slot.wake());

		let handle = {
			let slot = Arc::clone(&slot);
			let counter = Arc::clone(&counter);
			thread::spawn(move || {
				for _ in 0..3 {
					while !slot.has_waiter() {
						thread::yield_now();
					}
					counter.fetch_add(1, Ordering::SeqCst);
					slot.wake();
					thread::sleep(Duration::from_millis(1));
				}
			})
		};

		slot.wait_until(|| counter.load(Ordering::SeqCst) >= 3);
		handle.join().unwrap();
		assert!(!slot.has_waiter());
	}

	#[test]
	fn close_releases_waiter() {
		let slot = Arc::new(WaiterSlot::new());

		let handle = {
			let slot = Arc::clone(&slot);
			thread::spawn(move || slot.wait_until(|| slot.is_closed()))
		};

		while !slot.has_waiter() {
			thread::yield_now();
		}
		slot.close();
		handle.join().unwrap();

		assert!(slot.is_closed());
		assert!(!slot.has_waiter());
		// A closed slot does not block anymore.
		slot.wait_until(|| slot.is_closed());
	}
}
