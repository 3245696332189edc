//! Cache layers
//!
//! [`memory::MemoryCache`] holds decoded images keyed by fingerprint;
//! [`disk::ResultCache`] persists raw encoded bytes keyed by download key.

pub mod disk;
pub mod memory;

pub use disk::{ResultCache, ResultCacheConfig, StoredMetadata};
pub use memory::MemoryCache;
