//! TTL cache in front of expensive aggregate computations.
//!
//! * [`store`] persists whole entries (Redis in production, memory otherwise).
//! * [`manager`] is the only way in: read-through with single-flight per key,
//!   plus forced refresh for the background loop.
//! * [`schedule`] re-runs a fixed set of hot keys on an interval.

pub mod clock;
pub mod keys;
pub mod manager;
pub mod schedule;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use manager::{CacheError, CacheManager, Load};
pub use schedule::{spawn_refresh_loop, RefreshJob};
pub use store::{CacheEntry, CacheStore, MemoryStore, RedisStore, StoreError};
