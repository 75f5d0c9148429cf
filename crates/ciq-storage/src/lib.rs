//! Shared-state plumbing for CIQ: the injected key/value store, admission
//! control, single-flight memoization and snapshot persistence.

pub mod cache;
pub mod rate_limit;
pub mod repository;
pub mod store;

pub use cache::{CacheError, CacheLayer, CacheStats, TtlClass};
pub use rate_limit::{
    Decision, RateLimitBucket, RateLimitRule, RateLimitStatus, RateLimiter, RuleClass, RuleTable,
    Tier, TierStatus,
};
pub use repository::{MemoryRepository, PgRepository, RepositoryError, SnapshotRepository};
pub use store::{MemoryStore, SharedStore, StoreError};

pub const CRATE_NAME: &str = "ciq-storage";
