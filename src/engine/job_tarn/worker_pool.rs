use crate::JobQueue;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};
use std::time::Duration;

// Half the machine, minimum one thread
#[must_use]
pub fn default_worker_count() -> usize
{
    std::thread::available_parallelism().map_or(1, |n| (n.get() / 2).max(1))
}

// A fixed set of named threads draining one JobQueue. A panicking job is
// logged and isolated; the worker keeps running
pub struct WorkerPool<T: Send + 'static>
{
    queue: Arc<JobQueue<T>>,
    worker_threads: Vec<Option<JoinHandle<()>>>,
}
impl<T: Send + 'static> WorkerPool<T>
{
    #[must_use]
    pub fn new(queue: Arc<JobQueue<T>>, worker_count: usize, executor: impl Fn(T) + Send + Sync + 'static) -> Self
    {
        let worker_count = worker_count.max(1);
        let executor = Arc::new(executor);

        let worker_threads = (0..worker_count).map(|i|
        {
            let queue = queue.clone();
            let executor = executor.clone();
            let thread = Builder::new()
                .name(format!("Job worker thread {i}"))
                .spawn(move || Self::worker_fn(queue, executor))
                .expect("Failed to create job worker thread");
            Some(thread)
        }).collect();

        Self { queue, worker_threads }
    }

    fn worker_fn(queue: Arc<JobQueue<T>>, executor: Arc<impl Fn(T) + Send + Sync + 'static>)
    {
        log::debug!("Starting job worker thread");
        while let Some(job) = queue.wait_for_task()
        {
            if catch_unwind(AssertUnwindSafe(|| (executor)(job))).is_err()
            {
                log::error!("Job executor panicked, worker continuing");
            }
            queue.complete_task();
        }
        log::debug!("Shutting down job worker thread");
    }

    #[inline] #[must_use]
    pub fn queue(&self) -> &Arc<JobQueue<T>> { &self.queue }

    #[inline] #[must_use]
    pub fn worker_count(&self) -> usize { self.worker_threads.len() }

    // Workers currently executing a job
    #[inline] #[must_use]
    pub fn busy(&self) -> usize { self.queue.in_flight() }

    // Synchronously wait for every queued job to finish, including jobs queued
    // by running jobs
    pub fn wait_idle(&self)
    {
        while !self.queue.is_idle()
        {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn shutdown(&mut self)
    {
        self.queue.shutdown();
        for thread in &mut self.worker_threads
        {
            if let Some(thread) = thread.take()
            {
                let _ = thread.join();
            }
        }
    }
}
impl<T: Send + 'static> Drop for WorkerPool<T>
{
    fn drop(&mut self)
    {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn ten_jobs_two_workers_each_exactly_once()
    {
        let queue = JobQueue::new(4);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let pool = WorkerPool::new(queue.clone(),
            2,
            {
                let seen = seen.clone();
                move |job: usize| { seen.lock().push(job); }
            });

        for i in 0..10usize
        {
            queue.push(i);
        }

        pool.wait_idle();
        assert!(queue.capacity() > 4, "queue should have grown under the burst");

        let mut seen = seen.lock().clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn single_producer_order_holds_with_one_worker()
    {
        let queue = JobQueue::new(4);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let pool = WorkerPool::new(queue.clone(),
            1,
            {
                let seen = seen.clone();
                move |job: usize| { seen.lock().push(job); }
            });

        for i in 0..32usize
        {
            queue.push(i);
        }

        pool.wait_idle();
        assert_eq!(*seen.lock(), (0..32).collect::<Vec<_>>());
        drop(pool);
    }

    #[test]
    fn panicking_job_does_not_kill_the_worker()
    {
        let queue = JobQueue::new(4);
        let ran = Arc::new(AtomicUsize::new(0));

        let pool = WorkerPool::new(queue.clone(),
            1,
            {
                let ran = ran.clone();
                move |job: usize|
                {
                    if job == 0 { panic!("intentional test panic"); }
                    ran.fetch_add(1, Ordering::SeqCst);
                }
            });

        queue.push(0);
        queue.push(1);
        queue.push(2);

        pool.wait_idle();
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn drop_joins_workers()
    {
        let queue = JobQueue::<usize>::new(4);
        let pool = WorkerPool::new(queue.clone(), 2, |_| {});
        drop(pool); // must not hang on parked workers
        assert!(!queue.is_running());
    }
}
