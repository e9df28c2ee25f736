//! Ordered multi-core transmit dispatch.
//!
//! Every submitting CPU owns a [`TxProducer`]. Frames are timestamped when
//! they enter the CPU's queue. Whoever holds the `RUNNING` flag has exclusive
//! access to the virtqueue and drains all CPU queues into it in timestamp
//! order. Work arriving while `RUNNING` is held raises `PENDING`, which the
//! holder checks before it lets go.

use std::cell::UnsafeCell;
use std::mem::ManuallyDrop;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_utils::CachePadded;
use crossbeam_utils::sync::{Parker, Unparker};
use hermit_sync::SpinMutex;
use virtio::net::F;

use super::cpuq::{self, TxBuffDesc, TxCpuProducer, TxCpuQueue};
use super::{NetBuf, TxError, TxRequest, hdr_len};
use crate::collections::NwayMerger;
use crate::config::TxConfig;
use crate::drivers::virtio::DeviceNotifier;
use crate::drivers::virtio::virtqueue::error::VirtqError;
use crate::drivers::virtio::virtqueue::split::{VirtqAddresses, Virtqueue};
use crate::drivers::virtio::virtqueue::{VqIndex, VqSize};
use crate::mm::DeviceAlloc;
use crate::synch::waiter::{Waiter, WaiterSlot};

/// Index of the first transmit queue of a virtio network device.
const TX_QUEUE_INDEX: u16 = 1;

/// Everything only the holder of `RUNNING` may touch.
struct Dispatch {
	vq: Virtqueue<TxRequest>,
	cpuqs: Vec<TxCpuQueue>,
	merger: NwayMerger<u64>,
	posted_since_kick: usize,
	alloc: Arc<dyn DeviceAlloc>,
}

impl Dispatch {
	/// Frees the requests the device is done with.
	fn reclaim(&mut self) -> Result<usize, TxError> {
		let mut completed = 0;
		for completion in self.vq.reclaim_completions() {
			let (_req, _len) = completion?;
			completed += 1;
		}
		self.vq.get_buf_gc()?;
		Ok(completed)
	}

	/// Posts `req` right away, without going through a CPU queue.
	///
	/// Hands the request back if the ring is full.
	fn xmit_now(&mut self, req: TxRequest) -> Result<Option<TxRequest>, TxError> {
		self.reclaim()?;

		let segments = req.segments(&*self.alloc);
		match self.vq.add_buf(&segments, req) {
			Ok(_) => {
				self.vq.kick();
				self.posted_since_kick = 0;
				Ok(None)
			}
			Err(rejected) if rejected.error.is_recoverable() => Ok(Some(rejected.cookie)),
			Err(rejected) => Err(rejected.error.into()),
		}
	}

	/// Moves all queued requests into the virtqueue in timestamp order.
	///
	/// In blocking mode a full ring suspends the caller until the device has
	/// completed enough chains or the queue is detached. Requests that do not
	/// fit are dropped otherwise.
	fn drain(&mut self, blocking: bool) -> Result<usize, TxError> {
		self.reclaim()?;

		let Self {
			vq,
			cpuqs,
			merger,
			posted_since_kick,
			alloc,
		} = self;
		let kick_batch = usize::from(vq.size());
		let mut dropped = 0usize;

		let sent = merger.merge(cpuqs, |desc: TxBuffDesc| {
			let segments = desc.req.segments(&**alloc);
			let posted = if blocking {
				vq.add_buf_wait(&segments, desc.req, |_req, _len| {})
			} else {
				vq.add_buf(&segments, desc.req)
			};

			match posted {
				Ok(_) => {}
				Err(rejected)
					if rejected.error.is_recoverable()
						|| rejected.error == VirtqError::WaitAborted =>
				{
					dropped += 1;
					return Ok(());
				}
				Err(rejected) => return Err(TxError::from(rejected.error)),
			}

			*posted_since_kick += 1;
			if *posted_since_kick >= kick_batch {
				vq.kick();
				*posted_since_kick = 0;
			}
			Ok(())
		})?;

		vq.kick();
		*posted_since_kick = 0;
		for cpuq in cpuqs.iter_mut() {
			cpuq.wake_waiters();
		}

		if dropped > 0 {
			warn!("Dropped {dropped} frames, the ring had no room");
		}
		trace!("Dispatched {} frames", sent - dropped);
		Ok(sent - dropped)
	}
}

/// Exclusive access to the [`Dispatch`] state, released on drop.
struct Running<'a> {
	shared: &'a TxShared,
}

impl Running<'_> {
	fn dispatch(&mut self) -> &mut Dispatch {
		// SAFETY: `RUNNING` is held for the lifetime of `self`.
		unsafe { &mut *self.shared.state.get() }
	}
}

impl Drop for Running<'_> {
	fn drop(&mut self) {
		self.shared.running.store(false, Ordering::SeqCst);
	}
}

struct TxShared {
	running: CachePadded<AtomicBool>,
	pending: CachePadded<AtomicBool>,
	broken: AtomicBool,
	detached: AtomicBool,
	state: UnsafeCell<Dispatch>,
	producers: Box<[SpinMutex<Option<TxCpuProducer>>]>,
	worker: Unparker,
	/// Wakes the holder of `RUNNING` blocked on a full virtqueue.
	vq_waiter: Arc<WaiterSlot>,
	epoch: Instant,
	hdr_len: usize,
	mtu: u16,
	max_sgs: usize,
}

// SAFETY: `state` is only reached through a `Running` guard.
unsafe impl Sync for TxShared {}

impl TxShared {
	fn try_lock_running(&self) -> Option<Running<'_>> {
		if self.running.swap(true, Ordering::SeqCst) {
			None
		} else {
			Some(Running { shared: self })
		}
	}

	fn has_pending(&self) -> bool {
		self.pending.load(Ordering::SeqCst)
	}

	/// Raises `PENDING` and wakes the dispatcher.
	fn signal_pending(&self) {
		self.pending.store(true, Ordering::SeqCst);
		self.worker.unpark();
	}

	fn timestamp(&self) -> u64 {
		u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
	}

	fn is_broken(&self) -> bool {
		self.broken.load(Ordering::SeqCst)
	}

	fn check_usable(&self) -> Result<(), TxError> {
		if self.is_broken() {
			Err(TxError::DeviceBroken)
		} else if self.detached.load(Ordering::SeqCst) {
			Err(TxError::Detached)
		} else {
			Ok(())
		}
	}

	/// Stops all further traffic and releases blocked producers.
	fn fail(&self, running: &mut Running<'_>, err: &TxError) {
		error!("Transmit queue is broken: {err}");
		self.broken.store(true, Ordering::SeqCst);
		for cpuq in &mut running.dispatch().cpuqs {
			cpuq.wake_all();
		}
	}

	/// Drains the CPU queues as long as `PENDING` is raised.
	///
	/// `PENDING` must have been raised by the caller. If another context
	/// holds `RUNNING`, it will see `PENDING` before releasing it and this
	/// call returns `false` right away.
	fn drain_and_kick(&self, blocking: bool) -> bool {
		let mut drained = false;

		loop {
			let Some(mut running) = self.try_lock_running() else {
				return drained;
			};
			drained = true;

			while self.pending.swap(false, Ordering::SeqCst) && !self.is_broken() {
				if let Err(err) = running.dispatch().drain(blocking) {
					self.fail(&mut running, &err);
				}
			}
			drop(running);

			// PENDING may have been raised between the last check and the release.
			if !self.has_pending() || self.is_broken() {
				return drained;
			}
		}
	}
}

fn run_dispatcher(shared: Arc<TxShared>, parker: Parker) {
	debug!("Transmit dispatcher started");

	loop {
		parker.park();
		if shared.detached.load(Ordering::SeqCst) {
			break;
		}
		if shared.has_pending() && shared.drain_and_kick(true) {
			debug!("Transmit dispatcher went idle");
		}
	}

	debug!("Transmit dispatcher stopped");
}

/// Transmit queue of a virtio network device.
///
/// Owns the virtqueue, the per-CPU queues and the dispatcher thread.
pub struct TxQueue {
	shared: Arc<TxShared>,
	worker: Option<JoinHandle<()>>,
	addresses: VirtqAddresses,
	size: u16,
	features: F,
}

impl TxQueue {
	/// Sets up the virtqueue and starts the dispatcher.
	///
	/// `features` are the features negotiated with the device and `notifier`
	/// is used to kick it.
	pub fn new(
		config: &TxConfig,
		features: F,
		alloc: Arc<dyn DeviceAlloc>,
		notifier: Arc<dyn DeviceNotifier>,
	) -> Result<Self, TxError> {
		config.validate()?;

		let mut vq = Virtqueue::new(
			VqIndex::from(TX_QUEUE_INDEX),
			VqSize::from(config.queue_size),
			features.into(),
			Arc::clone(&alloc),
			notifier,
		)?;
		let use_indirect = config.use_indirect && features.contains(F::INDIRECT_DESC);
		vq.set_use_indirect(use_indirect);
		// Interrupts are only needed while waiting for room.
		vq.disable_interrupts();

		let addresses = vq.addresses();
		let vq_waiter = vq.waiter();
		let max_sgs = if use_indirect {
			config.max_sgs
		} else {
			config.max_sgs.min(usize::from(config.queue_size))
		};

		let (producers, cpuqs): (Vec<_>, Vec<_>) = (0..config.cpus)
			.map(|cpu| {
				let (producer, queue) =
					cpuq::cpu_queue(cpu, config.cpu_queue_size, config.waitq_size);
				(SpinMutex::new(Some(producer)), queue)
			})
			.unzip();

		let parker = Parker::new();
		let shared = Arc::new(TxShared {
			running: CachePadded::new(AtomicBool::new(false)),
			pending: CachePadded::new(AtomicBool::new(false)),
			broken: AtomicBool::new(false),
			detached: AtomicBool::new(false),
			state: UnsafeCell::new(Dispatch {
				vq,
				cpuqs,
				merger: NwayMerger::with_capacity(config.cpus),
				posted_since_kick: 0,
				alloc,
			}),
			producers: producers.into_boxed_slice(),
			worker: parker.unparker().clone(),
			vq_waiter,
			epoch: Instant::now(),
			hdr_len: hdr_len(features),
			mtu: config.mtu,
			max_sgs,
		});

		let worker = thread::Builder::new()
			.name("virtio-txq".into())
			.spawn({
				let shared = Arc::clone(&shared);
				move || run_dispatcher(shared, parker)
			})?;

		infoheader!(" VIRTIO TRANSMIT QUEUE ");
		infoentry!("Descriptors", config.queue_size);
		infoentry!("Descriptor table", "{:#x}", addresses.desc);
		infoentry!("CPU queues", "{} x {}", config.cpus, config.cpu_queue_size);
		infoentry!("Indirect descriptors", use_indirect);
		infoentry!("Event index", features.contains(F::EVENT_IDX));
		infoentry!("Max. segments", max_sgs);
		infofooter!();

		Ok(Self {
			shared,
			worker: Some(worker),
			addresses,
			size: config.queue_size,
			features,
		})
	}

	/// Hands out the submitting handle of `cpu`.
	///
	/// Returns `None` if `cpu` is out of range or its handle is in use.
	pub fn producer(&self, cpu: usize) -> Option<TxProducer> {
		let inner = self.shared.producers.get(cpu)?.lock().take()?;
		Some(TxProducer {
			shared: Arc::clone(&self.shared),
			inner: ManuallyDrop::new(inner),
		})
	}

	/// Drains the CPU queues into the virtqueue and notifies the device.
	///
	/// Returns `false` if another context is draining; that context picks up
	/// the work before it stops.
	pub fn drain_and_kick(&self) -> bool {
		self.shared.pending.store(true, Ordering::SeqCst);
		self.shared.drain_and_kick(true)
	}

	/// To be called when the device raised the queue's interrupt.
	pub fn handle_interrupt(&self) {
		self.irq_handle().handle();
	}

	/// Returns a handle that interrupt delivery can keep independently of
	/// the queue.
	pub fn irq_handle(&self) -> TxIrq {
		TxIrq {
			waiter: Arc::clone(&self.shared.vq_waiter),
		}
	}

	pub fn addresses(&self) -> VirtqAddresses {
		self.addresses
	}

	pub fn queue_size(&self) -> u16 {
		self.size
	}

	pub fn features(&self) -> F {
		self.features
	}

	pub fn is_broken(&self) -> bool {
		self.shared.is_broken()
	}
}

impl Drop for TxQueue {
	fn drop(&mut self) {
		self.shared.detached.store(true, Ordering::SeqCst);
		// Releases the dispatcher if it waits for a device that is gone.
		self.shared.vq_waiter.close();
		self.shared.worker.unpark();
		if let Some(worker) = self.worker.take() {
			if worker.join().is_err() {
				error!("Transmit dispatcher panicked");
			}
		}

		// The device may already be gone, so the final drain never blocks.
		self.shared.pending.store(true, Ordering::SeqCst);
		self.shared.drain_and_kick(false);

		if let Some(mut running) = self.shared.try_lock_running() {
			let mut dropped = 0;
			for cpuq in &mut running.dispatch().cpuqs {
				dropped += cpuq.clear();
				cpuq.wake_all();
			}
			if dropped > 0 {
				warn!("Dropped {dropped} frames on detach");
			}
		}

		info!("Detached transmit queue at {:#x}", self.addresses.desc);
	}
}

/// Interrupt entry of a [`TxQueue`].
#[derive(Clone)]
pub struct TxIrq {
	waiter: Arc<WaiterSlot>,
}

impl TxIrq {
	/// Wakes the dispatcher if it waits for room in the ring.
	pub fn handle(&self) {
		if self.waiter.wake() {
			trace!("Woke dispatcher waiting for completions");
		}
	}
}

/// The submitting handle of one CPU.
///
/// There is at most one handle per CPU, which makes it the only writer of
/// the CPU's queue. Dropping the handle returns it to the [`TxQueue`].
pub struct TxProducer {
	shared: Arc<TxShared>,
	inner: ManuallyDrop<TxCpuProducer>,
}

impl TxProducer {
	pub fn cpu(&self) -> usize {
		self.inner.cpu()
	}

	/// Current value of the clock the CPU queues are ordered by.
	pub fn timestamp(&self) -> u64 {
		self.shared.timestamp()
	}

	/// Sends a frame.
	///
	/// The frame bypasses the CPU queue if nothing is waiting in front of it
	/// and the virtqueue is free. Otherwise it is queued and the dispatcher is
	/// signalled. Blocks only while this CPU's queue is full.
	pub fn xmit(&mut self, buf: NetBuf) -> Result<(), TxError> {
		let mut req = self.prepare(buf)?;

		if !self.shared.has_pending() && self.inner.is_empty() {
			if let Some(mut running) = self.shared.try_lock_running() {
				let result = running.dispatch().xmit_now(req);
				if let Err(err) = &result {
					self.shared.fail(&mut running, err);
				}
				drop(running);

				if self.shared.has_pending() {
					self.shared.worker.unpark();
				}
				match result? {
					None => return Ok(()),
					Some(back) => req = back,
				}
			}
		}

		let ts = self.shared.timestamp();
		self.push_cpu(req, ts)
	}

	/// Queues a frame with an explicit timestamp taken from
	/// [`Self::timestamp`].
	///
	/// Timestamps of one CPU must not decrease.
	pub fn submit_ordered(&mut self, buf: NetBuf, ts: u64) -> Result<(), TxError> {
		let req = self.prepare(buf)?;
		self.push_cpu(req, ts)
	}

	fn prepare(&self, buf: NetBuf) -> Result<TxRequest, TxError> {
		self.shared.check_usable()?;
		if let Err(reason) = buf.validate(self.shared.mtu, self.shared.max_sgs) {
			warn!("Dropping frame from cpu {}: {reason}", self.cpu());
			return Err(reason.into());
		}
		Ok(TxRequest::new(buf, self.shared.hdr_len))
	}

	fn push_cpu(&mut self, req: TxRequest, ts: u64) -> Result<(), TxError> {
		let mut desc = TxBuffDesc { ts, req };

		loop {
			desc = match self.inner.push(desc) {
				Ok(()) => break,
				Err(desc) => desc,
			};

			let waiter = Waiter::new();
			if self.inner.push_new_waiter(waiter.record()).is_err() {
				warn!("Waiter queue of cpu {} overflowed", self.cpu());
				self.shared.signal_pending();
				thread::yield_now();
				continue;
			}

			// The dispatcher may have emptied the ring before it could see the record.
			desc = match self.inner.push(desc) {
				Ok(()) => break,
				Err(desc) => desc,
			};

			trace!("cpu {} waits for room in its queue", self.cpu());
			self.shared.signal_pending();
			self.shared.check_usable()?;
			waiter.wait();
			self.shared.check_usable()?;
		}

		if !self.shared.pending.swap(true, Ordering::SeqCst) {
			self.shared.worker.unpark();
		}
		Ok(())
	}
}

impl Drop for TxProducer {
	fn drop(&mut self) {
		// SAFETY: `inner` is not used after this.
		let inner = unsafe { ManuallyDrop::take(&mut self.inner) };
		if let Some(slot) = self.shared.producers.get(inner.cpu()) {
			*slot.lock() = Some(inner);
		}
	}
}
