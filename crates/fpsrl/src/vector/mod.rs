//! Asynchronous environment pools.
//!
//! Provides two implementations of [`AsyncEnvPool`]:
//! - `SerialPool` - in-process stepping, optionally shuffled delivery
//! - `ThreadedPool` - one worker thread per environment

mod pool;
pub(crate) mod serial;
mod threaded;

pub use pool::{AsyncEnvPool, PoolBatch};
pub use serial::SerialPool;
pub use threaded::ThreadedPool;
