use std::thread;

use log::{LevelFilter, Metadata, Record, set_logger, set_max_level};

use crate::config::TxConfig;

/// Data structure to filter driver messages
struct TxqLogger;

impl log::Log for TxqLogger {
	fn enabled(&self, _: &Metadata<'_>) -> bool {
		true
	}

	fn flush(&self) {
		// nothing to do
	}

	fn log(&self, record: &Record<'_>) {
		if self.enabled(record.metadata()) {
			let current = thread::current();
			eprintln!(
				"[{}][{}] {}",
				current.name().unwrap_or("-"),
				record.level(),
				record.args()
			);
		}
	}
}

static LOGGER: TxqLogger = TxqLogger;

/// Parses a level name as used by `VIRTIO_TXQ_LOG_LEVEL`.
pub fn parse_level(name: &str) -> Option<LevelFilter> {
	match name {
		"Error" | "error" => Some(LevelFilter::Error),
		"Debug" | "debug" => Some(LevelFilter::Debug),
		"Off" | "off" => Some(LevelFilter::Off),
		"Trace" | "trace" => Some(LevelFilter::Trace),
		"Warn" | "warn" => Some(LevelFilter::Warn),
		"Info" | "info" => Some(LevelFilter::Info),
		_ => None,
	}
}

/// Installs the logger with the level filter chosen at compile time.
///
/// Calling this more than once only updates the level filter.
pub fn init() {
	// Determines LevelFilter at compile time
	let max_level = option_env!("VIRTIO_TXQ_LOG_LEVEL")
		.and_then(parse_level)
		.unwrap_or(LevelFilter::Info);
	init_with_level(max_level);
}

/// Installs the logger with an explicit level filter.
pub fn init_with_level(max_level: LevelFilter) {
	if set_logger(&LOGGER).is_err() {
		trace!("Logger already installed");
	}
	set_max_level(max_level);
}

/// Installs the logger with the level of `config`.
pub fn init_from(config: &TxConfig) {
	init_with_level(config.log_level);
}

macro_rules! infoheader {
	($str:expr) => {{
		info!("");
		info!("{:=^70}", $str);
	}};
}

macro_rules! infoentry {
	($str:expr, $rhs:expr) => (infoentry!($str, "{}", $rhs));
	($str:expr, $($arg:tt)+) => (info!("{:25}{}", concat!($str, ":"), format_args!($($arg)+)));
}

macro_rules! infofooter {
	() => {{
		info!("{:=^70}", '=');
		info!("");
	}};
}
