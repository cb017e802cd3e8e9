//! Shared pieces for working with consumer groups on Redis streams: the entry model, the
//! `LogStore` abstraction with its Redis and mock implementations, the emitter, and metrics.

pub mod emitter;
pub mod entry;
pub mod metrics;
pub mod store;

mod mock;
mod redis_store;
mod shared;

pub use entry::{ConsumerId, Entry, EntryId, Payload};
pub use mock::{MockLogStore, MockStoreCall};
pub use redis_store::RedisStore;
pub use shared::SharedStore;
pub use store::{GroupCreation, LogStore, StoreError};
