use arc_swap::ArcSwap;
use crossbeam::queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

// Queues below this capacity only grow once actually full; larger queues grow
// early, as soon as a burst has eaten more than half the slack
const SLACK_CHECK_FLOOR: usize = 8;

// Bounded FIFO MPMC queue with transparent growth.
//
// The backing ring is immutable once published; growing swaps in a new ring
// after quiescing every thread currently touching the old one (accessor count
// + resizing flag handshake). Workers park on a condvar while the queue is
// empty and are woken one-per-push.
pub struct JobQueue<T>
{
    buffer: ArcSwap<ArrayQueue<T>>,

    available: AtomicUsize, // jobs queued (counted just before the slot fills) and not yet claimed
    in_flight: AtomicUsize, // jobs claimed but not yet completed
    accessors: AtomicUsize, // threads currently inside a push/pop critical section
    resizing: AtomicBool,
    running: AtomicBool,

    idle_lock: Mutex<()>,
    job_ready: Condvar,

    resize_lock: Mutex<()>,
    quiesced: Condvar, // resizer waits here for accessors to drain
    resized: Condvar,  // accessors wait here while a resize is in flight
}

impl<T> JobQueue<T>
{
    #[must_use]
    pub fn new(capacity: usize) -> Arc<Self>
    {
        assert!(capacity >= 2, "Job queue capacity must be at least 2");

        Arc::new(Self
        {
            buffer: ArcSwap::from_pointee(ArrayQueue::new(capacity)),
            available: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            accessors: AtomicUsize::new(0),
            resizing: AtomicBool::new(false),
            running: AtomicBool::new(true),
            idle_lock: Mutex::new(()),
            job_ready: Condvar::new(),
            resize_lock: Mutex::new(()),
            quiesced: Condvar::new(),
            resized: Condvar::new(),
        })
    }

    #[inline] #[must_use]
    pub fn capacity(&self) -> usize { self.buffer.load().capacity() }

    #[inline] #[must_use]
    pub fn available(&self) -> usize { self.available.load(Ordering::SeqCst) }

    #[inline] #[must_use]
    pub fn in_flight(&self) -> usize { self.in_flight.load(Ordering::SeqCst) }

    #[inline] #[must_use]
    pub fn is_empty(&self) -> bool { self.available() == 0 }

    // No jobs queued and none executing
    #[inline] #[must_use]
    pub fn is_idle(&self) -> bool { self.available() == 0 && self.in_flight() == 0 }

    #[inline] #[must_use]
    pub fn is_running(&self) -> bool { self.running.load(Ordering::SeqCst) }

    // Register this thread as touching the backing ring; blocks while a resize is in flight
    fn enter_access(&self)
    {
        loop
        {
            self.accessors.fetch_add(1, Ordering::SeqCst);
            if !self.resizing.load(Ordering::SeqCst)
            {
                return;
            }

            // back out so the resizer can make progress, then wait it out
            if self.accessors.fetch_sub(1, Ordering::SeqCst) == 1
            {
                let _held = self.resize_lock.lock();
                self.quiesced.notify_one();
            }

            let mut held = self.resize_lock.lock();
            while self.resizing.load(Ordering::SeqCst)
            {
                self.resized.wait(&mut held);
            }
        }
    }

    fn exit_access(&self)
    {
        if self.accessors.fetch_sub(1, Ordering::SeqCst) == 1 && self.resizing.load(Ordering::SeqCst)
        {
            let _held = self.resize_lock.lock();
            self.quiesced.notify_one();
        }
    }

    // Swap in a ring of double the capacity, preserving FIFO order of all live
    // entries. Must never run concurrently with a push/pop critical section;
    // enforced by draining `accessors` while `resizing` turns new entrants away.
    fn grow(&self, observed_capacity: usize)
    {
        let mut held = self.resize_lock.lock();

        // another thread already grew past what we observed
        if self.buffer.load().capacity() != observed_capacity
        {
            return;
        }

        self.resizing.store(true, Ordering::SeqCst);
        while self.accessors.load(Ordering::SeqCst) > 0
        {
            self.quiesced.wait(&mut held);
        }

        let old = self.buffer.load_full();
        let grown = ArrayQueue::new(old.capacity() * 2);
        while let Some(job) = old.pop()
        {
            let _ = grown.push(job); // freshly allocated at double capacity, cannot fail
        }
        log::debug!("Job queue grown {} -> {}", old.capacity(), grown.capacity());
        self.buffer.store(Arc::new(grown));

        self.resizing.store(false, Ordering::SeqCst);
        self.resized.notify_all();
    }

    // Enqueue one job, growing the ring first if it is (nearly) out of room,
    // then wake exactly one parked worker
    pub fn push(&self, job: T)
    {
        // counted before the slot fills so a claim racing this push can never
        // drive the counter below zero
        self.available.fetch_add(1, Ordering::SeqCst);

        let mut job = job;
        loop
        {
            self.enter_access();
            let buffer = self.buffer.load();
            let capacity = buffer.capacity();
            let slack = capacity - buffer.len();

            if slack <= 1 || (capacity >= SLACK_CHECK_FLOOR && slack < capacity / 2)
            {
                drop(buffer);
                self.exit_access();
                self.grow(capacity);
                continue;
            }

            match buffer.push(job)
            {
                Ok(()) =>
                {
                    drop(buffer);
                    self.exit_access();
                    break;
                }
                Err(returned) =>
                {
                    // filled up between the slack check and the push
                    job = returned;
                    drop(buffer);
                    self.exit_access();
                    self.grow(capacity);
                }
            }
        }

        let _held = self.idle_lock.lock();
        self.job_ready.notify_one();
    }

    #[must_use]
    fn try_claim(&self) -> Option<T>
    {
        self.enter_access();
        let job = self.buffer.load().pop();
        self.exit_access();

        if job.is_some()
        {
            // in_flight rises before available falls so that an idle poll can
            // never observe a job as neither queued nor executing
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            self.available.fetch_sub(1, Ordering::SeqCst);
        }
        job
    }

    // Blocks until a job is available and claims it; returns None (consuming
    // nothing) once the queue has been shut down
    #[must_use]
    pub fn wait_for_task(&self) -> Option<T>
    {
        loop
        {
            if !self.is_running()
            {
                return None;
            }
            if let Some(job) = self.try_claim()
            {
                return Some(job);
            }

            let mut held = self.idle_lock.lock();
            // re-check with the wake lock held so a push cannot slip between
            // the empty check and the park
            if !self.is_running()
            {
                return None;
            }
            match self.try_claim()
            {
                Some(job) => return Some(job),
                None => { self.job_ready.wait(&mut held); }
            }
        }
    }

    // Pairs with a successful wait_for_task
    pub fn complete_task(&self)
    {
        let prev = self.in_flight.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "complete_task without a claimed task");
    }

    // Wake every parked worker and refuse all future claims. Queued jobs are
    // not drained; workers observe the flag and exit
    pub fn shutdown(&self)
    {
        self.running.store(false, Ordering::SeqCst);

        let _held = self.idle_lock.lock();
        self.job_ready.notify_all();
    }
}
