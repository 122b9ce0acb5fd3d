//! The delivery pipeline: poller in, worker pool out.

pub mod backoff;
pub mod poller;
pub mod pool;

pub use poller::Poller;
pub use pool::WorkerPool;
