//! ackqueue: acknowledged work queues and delayed tasks on Redis.
//!
//! This library provides an at-least-once work queue with visibility
//! timeouts, bounded retries and dead-lettering, plus a delayed task engine
//! that promotes scheduled tasks and runs them with a handler. All shared
//! state lives in the store; processes coordinate through atomic scripts and
//! pub/sub notifications.

// Core modules
pub mod cli;
pub mod codec;
pub mod config;
pub mod driver;
pub mod error;
pub mod keys;
pub mod metrics;
pub mod notification;
pub mod queue;
pub mod store;
pub mod task;
pub mod utils;

// Re-export commonly used types
pub use codec::{Codec, JsonCodec, RawCodec};
pub use config::{QueueConfig, StoreConfig, TaskConfig};
pub use error::{CodecError, HandlerError, QueueError, StoreError, TaskError};
pub use queue::{AckQueue, Message, QueueEvents, WorkerPool, WorkerPoolConfig};
pub use store::{MemoryStore, QueueStore, RedisStore, TaskStore};
pub use task::{DelayedTask, TaskHandler, TaskRegistry};
