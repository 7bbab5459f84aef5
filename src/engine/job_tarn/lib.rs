mod job_queue;
pub use job_queue::*;

mod worker_pool;
pub use worker_pool::*;
