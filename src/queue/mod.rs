//! Work queue and worker pool.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use archiver_core::queue::{TaskHandler, TaskReport, WorkQueue, WorkerPool};
//!
//! # async fn example(handler: Arc<dyn TaskHandler<String>>) -> Result<(), Box<dyn std::error::Error>> {
//! let queue = Arc::new(WorkQueue::new());
//! queue.put("https://media.example.com/a.jpg".to_string())?;
//! let stats = WorkerPool::new(4)?.run(queue, handler).await?;
//! println!("processed {}", stats.processed());
//! # Ok(())
//! # }
//! ```

mod error;
mod pool;
mod work_queue;

pub use error::QueueError;
pub use pool::{
    DEFAULT_WORKERS, MAX_WORKERS, MIN_WORKERS, TaskHandler, TaskReport, WorkerPool, WorkerStats,
};
pub use work_queue::{QueueMessage, WorkQueue};
