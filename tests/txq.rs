mod common;

use std::thread;
use std::time::Duration;

use common::{Harness, assert_per_cpu_order, decode, frame, test_config};
use virtio::net::F;
use virtio_txq::{NetBuf, TxError};

const TIMEOUT: Duration = Duration::from_secs(60);

fn run_producers(harness: &Harness, cpus: usize, per_cpu: u32, make: impl Fn(u8, u32) -> NetBuf + Sync) {
	thread::scope(|s| {
		for cpu in 0..cpus {
			let mut producer = harness.txq().producer(cpu).unwrap();
			let make = &make;
			s.spawn(move || {
				for seq in 0..per_cpu {
					producer.xmit(make(cpu as u8, seq)).unwrap();
				}
			});
		}
	});
}

#[test]
fn ordered_multi_cpu_pipeline() {
	let cpus = 4;
	let per_cpu = 500;
	let config = test_config()
		.with_cpus(cpus)
		.with_cpu_queue_size(64)
		.with_queue_size(64);
	let harness = Harness::start(&config, F::VERSION_1 | F::EVENT_IDX);

	run_producers(&harness, cpus, per_cpu, |cpu, seq| {
		NetBuf::new(frame(cpu, seq))
	});

	assert!(harness.wait_for_frames(cpus * per_cpu as usize, TIMEOUT));
	let frames = harness.device().take_frames();
	assert_per_cpu_order(&frames, cpus, per_cpu);
	assert!(!harness.txq().is_broken());
}

#[test]
fn backpressure_with_tiny_rings() {
	let cpus = 2;
	let per_cpu = 300;
	let config = test_config()
		.with_cpus(cpus)
		.with_cpu_queue_size(4)
		.with_queue_size(8);
	let harness = Harness::start(&config, F::empty());

	run_producers(&harness, cpus, per_cpu, |cpu, seq| {
		NetBuf::new(frame(cpu, seq))
	});

	assert!(harness.wait_for_frames(cpus * per_cpu as usize, TIMEOUT));
	let frames = harness.device().take_frames();
	assert_per_cpu_order(&frames, cpus, per_cpu);
	assert!(harness.device().kicks() > 0);
}

#[test]
fn fragmented_frames_through_indirect_descriptors() {
	let cpus = 2;
	let per_cpu = 200;
	let config = test_config()
		.with_cpus(cpus)
		.with_cpu_queue_size(8)
		.with_queue_size(8);
	let harness = Harness::start(&config, F::INDIRECT_DESC | F::EVENT_IDX);

	run_producers(&harness, cpus, per_cpu, |cpu, seq| {
		let mut first = frame(cpu, seq);
		let third = first.split_off(40);
		let second = first.split_off(20);
		NetBuf::from_fragments([first, second, third])
	});

	assert!(harness.wait_for_frames(cpus * per_cpu as usize, TIMEOUT));
	let frames = harness.device().take_frames();
	for received in &frames {
		let (cpu, seq) = decode(received);
		assert_eq!(*received, frame(cpu, seq));
	}
	assert_per_cpu_order(&frames, cpus, per_cpu);
}

#[test]
fn malformed_frames_do_not_disturb_traffic() {
	let config = test_config().with_cpu_queue_size(16).with_queue_size(16);
	let harness = Harness::start(&config, F::VERSION_1);
	let mut producer = harness.txq().producer(0).unwrap();

	for seq in 0..100 {
		producer.xmit(NetBuf::new(frame(0, seq))).unwrap();
		let err = producer.xmit(NetBuf::new(vec![0; 4])).unwrap_err();
		assert!(matches!(err, TxError::Malformed(_)));
		let err = producer
			.xmit(NetBuf::from_fragments([frame(0, seq), Vec::new()]))
			.unwrap_err();
		assert!(matches!(err, TxError::Malformed(_)));
	}

	assert!(harness.wait_for_frames(100, TIMEOUT));
	let frames = harness.device().take_frames();
	assert_per_cpu_order(&frames, 1, 100);
}

#[test]
fn explicit_drain_after_queued_submissions() {
	let config = test_config().with_cpus(2).with_cpu_queue_size(16);
	let harness = Harness::start(&config, F::EVENT_IDX);
	let mut producers: Vec<_> = (0..2)
		.map(|cpu| harness.txq().producer(cpu).unwrap())
		.collect();

	for seq in 0..8 {
		for (cpu, producer) in producers.iter_mut().enumerate() {
			let ts = producer.timestamp();
			producer
				.submit_ordered(NetBuf::new(frame(cpu as u8, seq)), ts)
				.unwrap();
		}
	}
	harness.txq().drain_and_kick();

	assert!(harness.wait_for_frames(16, TIMEOUT));
	let frames = harness.device().take_frames();
	assert_per_cpu_order(&frames, 2, 8);
}
