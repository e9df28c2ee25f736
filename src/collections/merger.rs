//! N-way merge of individually ordered sources.
//!
//! Given a set of sources, each already ordered by its key, the merger
//! repeatedly emits the front element with the smallest key. Ties are broken
//! by source position, which is as good as any other consistent order since
//! keys are independent clock samples.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};

/// A FIFO source that can take part in a merge.
pub trait MergeSource {
	type Item;
	type Key: Ord + Copy;

	/// Returns the key of the front element, or `None` if the source is empty.
	fn front_key(&self) -> Option<Self::Key>;

	/// Removes the front element.
	fn pop_front(&mut self) -> Option<Self::Item>;
}

impl<K: Ord + Copy, V> MergeSource for VecDeque<(K, V)> {
	type Item = (K, V);
	type Key = K;

	fn front_key(&self) -> Option<K> {
		self.front().map(|(key, _)| *key)
	}

	fn pop_front(&mut self) -> Option<(K, V)> {
		VecDeque::pop_front(self)
	}
}

/// Reusable k-way merger.
///
/// The heap only stores `(key, source position)` pairs, so no element is moved
/// before it is emitted.
#[derive(Debug)]
pub struct NwayMerger<K: Ord> {
	heap: BinaryHeap<Reverse<(K, usize)>>,
}

impl<K: Ord + Copy> NwayMerger<K> {
	pub fn new() -> Self {
		Self {
			heap: BinaryHeap::new(),
		}
	}

	pub fn with_capacity(sources: usize) -> Self {
		Self {
			heap: BinaryHeap::with_capacity(sources),
		}
	}

	/// Merges all elements currently in `sources` into `sink` in ascending key
	/// order.
	///
	/// Elements appended to a source while the merge runs are picked up as
	/// long as that source has not run empty. Sources that run empty leave the
	/// active set. If `sink` fails, the merge stops and the error is returned;
	/// the failed element has already been removed from its source.
	pub fn merge<S, E>(
		&mut self,
		sources: &mut [S],
		mut sink: impl FnMut(S::Item) -> Result<(), E>,
	) -> Result<usize, E>
	where
		S: MergeSource<Key = K>,
	{
		self.heap.clear();
		self.heap.extend(
			sources
				.iter()
				.enumerate()
				.filter_map(|(pos, source)| source.front_key().map(|key| Reverse((key, pos)))),
		);

		let mut emitted = 0;
		while let Some(Reverse((_, pos))) = self.heap.pop() {
			let source = &mut sources[pos];
			let Some(item) = source.pop_front() else {
				continue;
			};
			if let Some(key) = source.front_key() {
				self.heap.push(Reverse((key, pos)));
			}

			emitted += 1;
			if let Err(err) = sink(item) {
				self.heap.clear();
				return Err(err);
			}
		}

		Ok(emitted)
	}
}

impl<K: Ord + Copy> Default for NwayMerger<K> {
	fn default() -> Self {
		Self::new()
	}
}
