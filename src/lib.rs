/// RowGate - rate-limited, retrying, caching client for positional row stores
///
/// Turns logical record operations (ensure a header, find by key, upsert,
/// delete or update by predicate) into the minimal set of calls against a
/// remote spreadsheet-style store, staying under its call quota and riding
/// out its transient failures.
///
/// Architecture:
/// 1. Transport: one physical call (HTTP via reqwest, or the in-memory store)
/// 2. RetryController: classifies responses, retries with jittered backoff
/// 3. RateLimitedExecutor: fixed-window call budget with FIFO admission
/// 4. TtlCache: read-through TTL cache with prefix/glob invalidation
/// 5. RowStore: CRUD engine that maps records to physical row positions

pub mod error;
pub mod config;
pub mod descriptor;
pub mod transport;
pub mod range;
pub mod memory;
pub mod retry;
pub mod executor;
pub mod cache;
pub mod row_store;

pub use cache::{CacheStats, TtlCache};
pub use config::RowGateConfig;
pub use descriptor::{abort_pair, AbortHandle, CallContext, CallDescriptor, CallKind, Row};
pub use error::{ErrorKind, Result, RowGateError};
pub use executor::{ExecutorStats, RateLimitedExecutor};
pub use memory::{Fault, MemoryStore};
pub use retry::{CallOutcome, RetryController};
pub use row_store::{fields, Fields, LogicalRow, RowStore, RowStoreStats, SchemaChange, Upserted};
pub use transport::{HttpTransport, StoreResponse, Transport, TransportError};
