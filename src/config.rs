//! Constants and runtime configuration of the transmit path.

use log::LevelFilter;

use crate::drivers::virtio::virtqueue::error::VirtqError;

/// Size of one per-CPU transmit ring.
///
/// This is the size of the buffer ring of the FreeBSD virtio-net driver,
/// which gives roughly 16 pages per CPU ring.
pub const CPU_TXQ_SIZE: usize = 4096;

/// Alignment of the used ring inside the ring storage (legacy PCI ABI).
pub const VIRTIO_PCI_VRING_ALIGN: usize = 4096;

/// Largest virtqueue this driver will set up.
pub const VIRTIO_MAX_QUEUE_SIZE: u16 = 1024;

/// Default virtqueue size of the transmit queue.
pub const VIRTIO_DEFAULT_QUEUE_SIZE: u16 = 256;

/// Maximal number of scatter/gather segments of one packet, header included.
pub const MAX_SGS: usize = 64;

/// Capacity of a per-CPU waiter queue.
///
/// Writers are bounded by the number of blocked producers, not by traffic.
pub const WAITQ_SIZE: usize = 64;

/// Default maximum transmission unit.
pub const DEFAULT_MTU: u16 = 1500;

/// Runtime configuration of a [`TxQueue`](crate::TxQueue).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxConfig {
	/// Number of submitting CPUs, one per-CPU queue each.
	pub cpus: usize,
	/// Capacity of each per-CPU ring. Must be a power of two.
	pub cpu_queue_size: usize,
	/// Number of descriptors of the virtqueue. Must be a power of two.
	pub queue_size: u16,
	/// Capacity of each per-CPU waiter queue.
	pub waitq_size: usize,
	/// Maximal number of segments of one packet, header included.
	pub max_sgs: usize,
	/// Maximum transmission unit, excluding the Ethernet header.
	pub mtu: u16,
	/// Allows indirect descriptors if the device offers them.
	pub use_indirect: bool,
	/// Level filter applied by [`logging::init_from`](crate::logging::init_from).
	pub log_level: LevelFilter,
}

impl Default for TxConfig {
	fn default() -> Self {
		Self {
			cpus: 1,
			cpu_queue_size: CPU_TXQ_SIZE,
			queue_size: VIRTIO_DEFAULT_QUEUE_SIZE,
			waitq_size: WAITQ_SIZE,
			max_sgs: MAX_SGS,
			mtu: DEFAULT_MTU,
			use_indirect: true,
			log_level: LevelFilter::Info,
		}
	}
}

impl TxConfig {
	pub fn with_cpus(mut self, cpus: usize) -> Self {
		self.cpus = cpus;
		self
	}

	pub fn with_cpu_queue_size(mut self, size: usize) -> Self {
		self.cpu_queue_size = size;
		self
	}

	pub fn with_queue_size(mut self, size: u16) -> Self {
		self.queue_size = size;
		self
	}

	pub fn with_max_sgs(mut self, max_sgs: usize) -> Self {
		self.max_sgs = max_sgs;
		self
	}

	pub fn with_mtu(mut self, mtu: u16) -> Self {
		self.mtu = mtu;
		self
	}

	pub fn with_indirect(mut self, use_indirect: bool) -> Self {
		self.use_indirect = use_indirect;
		self
	}

	pub fn with_log_level(mut self, log_level: LevelFilter) -> Self {
		self.log_level = log_level;
		self
	}

	/// Reads the configuration from the process environment.
	pub fn from_env() -> Self {
		Self::from_vars(std::env::vars())
	}

	/// Builds a configuration from `VIRTIO_TXQ_*` variables.
	///
	/// Unknown variables are skipped, unparsable values keep the default.
	pub fn from_vars<I, K, V>(vars: I) -> Self
	where
		I: IntoIterator<Item = (K, V)>,
		K: AsRef<str>,
		V: AsRef<str>,
	{
		let mut config = Self::default();

		for (key, value) in vars {
			let (key, value) = (key.as_ref(), value.as_ref().trim());
			let Some(name) = key.strip_prefix("VIRTIO_TXQ_") else {
				continue;
			};

			let parsed = match name {
				"CPUS" => value.parse().map(|v| config.cpus = v).is_ok(),
				"CPU_QUEUE_SIZE" => value.parse().map(|v| config.cpu_queue_size = v).is_ok(),
				"QUEUE_SIZE" => value.parse().map(|v| config.queue_size = v).is_ok(),
				"WAITQ_SIZE" => value.parse().map(|v| config.waitq_size = v).is_ok(),
				"MAX_SGS" => value.parse().map(|v| config.max_sgs = v).is_ok(),
				"MTU" => value.parse().map(|v| config.mtu = v).is_ok(),
				"INDIRECT" => match value {
					"1" | "true" | "on" => {
						config.use_indirect = true;
						true
					}
					"0" | "false" | "off" => {
						config.use_indirect = false;
						true
					}
					_ => false,
				},
				"LOG_LEVEL" => crate::logging::parse_level(value)
					.map(|level| config.log_level = level)
					.is_some(),
				_ => {
					debug!("Ignoring unknown variable {key}");
					true
				}
			};

			if !parsed {
				warn!("Ignoring invalid value {value:?} for {key}");
			}
		}

		config
	}

	/// Checks the sizes against the ring requirements.
	pub fn validate(&self) -> Result<(), VirtqError> {
		if self.queue_size == 0
			|| !self.queue_size.is_power_of_two()
			|| self.queue_size > VIRTIO_MAX_QUEUE_SIZE
		{
			return Err(VirtqError::QueueSizeNotAllowed(self.queue_size));
		}
		if self.cpu_queue_size < 2 || !self.cpu_queue_size.is_power_of_two() {
			return Err(VirtqError::QueueSizeNotAllowed(
				u16::try_from(self.cpu_queue_size).unwrap_or(u16::MAX),
			));
		}
		if self.cpus == 0 || self.waitq_size == 0 || self.max_sgs < 2 {
			return Err(VirtqError::General);
		}
		Ok(())
	}
}
