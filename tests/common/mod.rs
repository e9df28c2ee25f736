//! Common code for integration tests.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::LevelFilter;
use virtio::net::F;
use virtio_txq::drivers::net::loopback::LoopbackDevice;
use virtio_txq::mm::HostAlloc;
use virtio_txq::{TxConfig, TxQueue};

/// Offset of the submitting CPU inside a test frame.
const CPU_OFFSET: usize = 14;

/// A transmit queue wired to a loopback device running on its own thread.
pub struct Harness {
	txq: Option<TxQueue>,
	device: Arc<LoopbackDevice>,
	thread: Option<JoinHandle<()>>,
}

impl Harness {
	pub fn start(config: &TxConfig, features: F) -> Self {
		virtio_txq::logging::init_from(config);

		let device = LoopbackDevice::new();
		let txq = TxQueue::new(config, features, Arc::new(HostAlloc), device.clone()).unwrap();
		unsafe {
			device
				.attach(
					txq.addresses(),
					txq.queue_size(),
					features,
					Arc::new(HostAlloc),
				)
				.unwrap();
		}

		let irq = txq.irq_handle();
		device.set_interrupt_handler(move || irq.handle());
		let thread = device.spawn().unwrap();

		Self {
			txq: Some(txq),
			device,
			thread: Some(thread),
		}
	}

	pub fn txq(&self) -> &TxQueue {
		self.txq.as_ref().unwrap()
	}

	pub fn device(&self) -> &LoopbackDevice {
		&self.device
	}

	/// Waits until the device has received `count` frames.
	pub fn wait_for_frames(&self, count: usize, timeout: Duration) -> bool {
		let start = Instant::now();
		while self.device.frame_count() < count {
			if start.elapsed() > timeout {
				return false;
			}
			thread::sleep(Duration::from_millis(1));
		}
		true
	}
}

impl Drop for Harness {
	fn drop(&mut self) {
		// The device must be gone before the ring memory is released.
		self.device.stop();
		if let Some(thread) = self.thread.take() {
			thread.join().unwrap();
		}
		self.device.detach();
		self.txq.take();
	}
}

/// The configuration every test starts from.
pub fn test_config() -> TxConfig {
	TxConfig::default().with_log_level(LevelFilter::Warn)
}

/// A 64 byte frame tagged with its origin.
pub fn frame(cpu: u8, seq: u32) -> Vec<u8> {
	let mut frame = vec![0xff; 64];
	frame[CPU_OFFSET] = cpu;
	frame[CPU_OFFSET + 1..CPU_OFFSET + 5].copy_from_slice(&seq.to_be_bytes());
	frame
}

/// Returns the CPU and sequence number of a frame built by [`frame`].
pub fn decode(frame: &[u8]) -> (u8, u32) {
	let seq = frame[CPU_OFFSET + 1..CPU_OFFSET + 5].try_into().unwrap();
	(frame[CPU_OFFSET], u32::from_be_bytes(seq))
}

/// Checks that every CPU sent `per_cpu` frames and that each arrived in
/// submission order.
pub fn assert_per_cpu_order(frames: &[Vec<u8>], cpus: usize, per_cpu: u32) {
	let mut next = vec![0u32; cpus];
	for frame in frames {
		let (cpu, seq) = decode(frame);
		let expected = &mut next[usize::from(cpu)];
		assert_eq!(seq, *expected, "frame of cpu {cpu} out of order");
		*expected += 1;
	}
	assert!(next.iter().all(|&sent| sent == per_cpu), "{next:?}");
}
