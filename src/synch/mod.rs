//! Synchronization primitives

pub mod mpsc;
pub mod spsc;
pub mod waiter;
