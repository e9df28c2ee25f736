//! Per-CPU transmit queues.
//!
//! Each submitting CPU owns the writing half of a ring of timestamped
//! requests; the dispatcher owns all reading halves. A producer that finds
//! its ring full leaves a [`WaitRecord`] in the queue's waiter queue and is
//! woken once the dispatcher has made room.

use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};

use super::TxRequest;
use crate::collections::MergeSource;
use crate::synch::mpsc::MpscRing;
use crate::synch::spsc::{self, Consumer, Producer};
use crate::synch::waiter::WaitRecord;

/// A request waiting in a per-CPU queue.
#[derive(Debug)]
pub struct TxBuffDesc {
	/// Nanoseconds since the queue was created.
	pub ts: u64,
	pub req: TxRequest,
}

/// Creates the two halves of the queue of `cpu`.
pub fn cpu_queue(cpu: usize, size: usize, waitq_size: usize) -> (TxCpuProducer, TxCpuQueue) {
	let (producer, consumer) = spsc::ring(size);
	let waitq = Arc::new(MpscRing::new(waitq_size));

	(
		TxCpuProducer {
			cpu,
			ring: producer,
			waitq: Arc::clone(&waitq),
		},
		TxCpuQueue {
			cpu,
			ring: consumer,
			waitq,
			popped_since_wakeup: 0,
			wakeup_threshold: size / 2,
		},
	)
}

/// The submitting half, owned by one CPU.
pub struct TxCpuProducer {
	cpu: usize,
	ring: Producer<TxBuffDesc>,
	waitq: Arc<MpscRing<WaitRecord>>,
}

impl TxCpuProducer {
	pub fn cpu(&self) -> usize {
		self.cpu
	}

	pub fn push(&mut self, desc: TxBuffDesc) -> Result<(), TxBuffDesc> {
		self.ring.push(desc)
	}

	/// Registers a context that waits for room in the ring.
	///
	/// The caller has to retry its push afterwards: a slot freed before the
	/// registration became visible does not wake the record.
	pub fn push_new_waiter(&self, record: Arc<WaitRecord>) -> Result<(), Arc<WaitRecord>> {
		self.waitq.push(record)?;
		// Pairs with the fence in `TxCpuQueue::wake_waiters`.
		fence(Ordering::SeqCst);
		Ok(())
	}

	pub fn is_empty(&self) -> bool {
		self.ring.is_empty()
	}

	pub fn len(&self) -> usize {
		self.ring.len()
	}
}

/// The draining half, owned by the dispatcher.
pub struct TxCpuQueue {
	cpu: usize,
	ring: Consumer<TxBuffDesc>,
	waitq: Arc<MpscRing<WaitRecord>>,
	popped_since_wakeup: usize,
	wakeup_threshold: usize,
}

impl TxCpuQueue {
	pub fn cpu(&self) -> usize {
		self.cpu
	}

	pub fn front(&self) -> Option<&TxBuffDesc> {
		self.ring.front()
	}

	pub fn is_empty(&self) -> bool {
		self.ring.is_empty()
	}

	pub fn len(&self) -> usize {
		self.ring.len()
	}

	/// Removes the front request.
	///
	/// Waiters are woken once every `wakeup_threshold` pops and whenever the
	/// ring runs empty. The latter guarantees that a producer that registered
	/// just before the last pop is not left behind.
	pub fn erase(&mut self) -> Option<TxBuffDesc> {
		let desc = self.ring.pop()?;
		self.popped_since_wakeup += 1;

		if self.ring.is_empty() || self.popped_since_wakeup >= self.wakeup_threshold {
			self.wake_waiters();
		}

		Some(desc)
	}

	/// Wakes one waiter per slot popped since the last wakeup.
	pub fn wake_waiters(&mut self) {
		if self.popped_since_wakeup == 0 {
			return;
		}

		// Either a waiter is seen here or it sees the slots freed by the pops.
		fence(Ordering::SeqCst);
		if self.waitq.is_empty() {
			self.popped_since_wakeup = 0;
			return;
		}

		while self.popped_since_wakeup > 0 {
			let Some(record) = self.waitq.pop() else {
				self.popped_since_wakeup = 0;
				return;
			};
			record.wake();
			self.popped_since_wakeup -= 1;
		}
	}

	/// Wakes every registered waiter, regardless of the ring state.
	pub fn wake_all(&mut self) {
		fence(Ordering::SeqCst);
		while let Some(record) = self.waitq.pop() {
			record.wake();
		}
		self.popped_since_wakeup = 0;
	}

	/// Drops all queued requests. Returns how many were dropped.
	pub fn clear(&mut self) -> usize {
		let mut dropped = 0;
		while self.erase().is_some() {
			dropped += 1;
		}
		dropped
	}
}

impl MergeSource for TxCpuQueue {
	type Item = TxBuffDesc;
	type Key = u64;

	fn front_key(&self) -> Option<u64> {
		self.front().map(|desc| desc.ts)
	}

	fn pop_front(&mut self) -> Option<TxBuffDesc> {
		self.erase()
	}
}
