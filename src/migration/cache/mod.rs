//! Mapping cache for migrated records.
//!
//! Persists `(source system, entity, source id) -> target id` associations so
//! importers can resolve foreign keys of records migrated earlier, in this
//! run or in a previous one.
//!
//! ## Architecture
//!
//! [`MappingCache`] is the facade importers use. It renders keys, applies
//! scopes and TTLs, and delegates storage to a [`CacheBackend`]:
//!
//! - [`MemoryCacheBackend`]: DashMap in memory, persisted to a bincode file
//! - [`PgCacheBackend`]: rows in the `migration_mappings` table

mod backend;
mod mapping_cache;
mod memory;
mod postgres;
mod types;

pub use backend::CacheBackend;
pub use mapping_cache::MappingCache;
pub use memory::MemoryCacheBackend;
pub use postgres::PgCacheBackend;
pub use types::{CacheError, CacheScope, MappingKey, StoredEntry};
