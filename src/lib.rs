//! Livecount: cache-first counters with asynchronous writes to a durable store.
//!
//! Semantics:
//!  - Write-Behind: updates hit the cache, a queued worker persists them later.
//!  - Read-Through: a cache miss falls back to the durable store and reseeds the cache.

pub mod admin;
pub mod app;
pub mod cache;
pub mod config;
pub mod control;
pub mod counter;
pub mod health;
pub mod key;
pub mod period;
pub mod queue;
pub mod redis;
pub mod store;
pub mod worker;

#[cfg(test)]
mod testing;

pub use counter::{Coordinator, Lookup, Update};
pub use key::{CounterKey, KeyShape};
pub use period::{Period, PeriodType};
