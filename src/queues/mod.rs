//! Streams of work, processed with bounded concurrency.

pub mod reconcile;
pub mod work;
