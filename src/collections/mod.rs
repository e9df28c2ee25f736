//! Collections used by the transmit path.

pub mod merger;

pub use self::merger::{MergeSource, NwayMerger};
