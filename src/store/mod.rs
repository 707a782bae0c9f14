pub mod memory;
pub mod sqlite;


pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Shared keyed store backing dedup guards, debounce buffers, inactivity
/// deadlines and drain locks. All cross-request coordination goes through
/// here; in-process state would break the moment a second relay instance
/// shares the traffic.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// `None` for absent or expired keys.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Atomic claim: write only when the key is absent or expired. Returns
    /// true when this caller won the claim.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Append to the ordered list at `key` unless it already holds `cap`
    /// entries. Returns false when the value was dropped.
    async fn push(&self, key: &str, value: &str, cap: usize) -> Result<bool>;

    async fn list_len(&self, key: &str) -> Result<usize>;

    /// Atomically read and clear the ordered list at `key`, preserving
    /// append order.
    async fn take_all(&self, key: &str) -> Result<Vec<String>>;
}
