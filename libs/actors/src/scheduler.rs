//! Execution contexts for actors
//!
//! - **WorkerPool**: fixed set of threads resuming cooperative actors. An
//!   actor is in the job queue at most once; it is resubmitted only by the
//!   producer that unblocked its mailbox or by a worker when the actor used
//!   up its throughput budget.
//! - **Timer**: one thread delivering delayed messages (request timeouts,
//!   behavior timeouts, `delayed_send`).
//! - **Dedicated threads**: one OS thread per blocking or detached actor.

use crate::error::{ActorError, Result};
use crate::handle::{AbstractActor, ActorHandle};
use crate::local::{LocalActor, Resumable};
use crossbeam_channel::{Receiver, Sender};
use lattice_codec::Message;
use lattice_types::MessageId;
use parking_lot::{Condvar, Mutex};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

pub(crate) enum Job {
    Resume(Arc<LocalActor>),
    Shutdown,
}

/// Submits actors to the worker pool
#[derive(Clone)]
pub(crate) struct PoolHandle {
    jobs: Sender<Job>,
}

impl PoolHandle {
    pub(crate) fn schedule(&self, actor: Arc<LocalActor>) {
        if self.jobs.send(Job::Resume(actor)).is_err() {
            warn!("Worker pool is gone; actor not scheduled");
        }
    }
}

pub(crate) struct WorkerPool {
    jobs: Sender<Job>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub(crate) fn start(threads: usize, max_throughput: usize) -> Result<Self> {
        let (jobs, queue) = crossbeam_channel::unbounded();
        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads.max(1) {
            let queue = queue.clone();
            let resubmit = jobs.clone();
            let worker = thread::Builder::new()
                .name(format!("lattice-worker-{index}"))
                .spawn(move || worker_loop(queue, resubmit, max_throughput))
                .map_err(|e| ActorError::spawn("failed to start worker thread", e))?;
            workers.push(worker);
        }
        debug!(threads = workers.len(), max_throughput, "Worker pool started");
        Ok(Self {
            jobs,
            workers: Mutex::new(workers),
        })
    }

    pub(crate) fn handle(&self) -> PoolHandle {
        PoolHandle {
            jobs: self.jobs.clone(),
        }
    }

    /// Stops every worker after its current job
    pub(crate) fn shutdown(&self) {
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for _ in &workers {
            let _ = self.jobs.send(Job::Shutdown);
        }
        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() != current && worker.join().is_err() {
                warn!("Worker thread terminated abnormally");
            }
        }
    }
}

fn worker_loop(queue: Receiver<Job>, resubmit: Sender<Job>, max_throughput: usize) {
    while let Ok(job) = queue.recv() {
        match job {
            Job::Resume(actor) => match actor.resume(max_throughput) {
                Resumable::Yield => {
                    trace!(actor = %actor.address(), "Throughput budget used up, yielding");
                    let _ = resubmit.send(Job::Resume(actor));
                }
                Resumable::Blocked | Resumable::Done => {}
            },
            Job::Shutdown => break,
        }
    }
}

/// Runs a detached event-based actor on its own thread
pub(crate) fn run_detached(actor: Arc<LocalActor>, max_throughput: usize) {
    loop {
        match actor.resume(max_throughput) {
            Resumable::Done => break,
            Resumable::Yield => continue,
            Resumable::Blocked => {
                actor.mailbox().await_unblocked(None);
            }
        }
    }
}

pub(crate) fn spawn_thread<F>(name: String, body: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name)
        .spawn(body)
        .map_err(|e| ActorError::spawn("failed to start actor thread", e))
}

/// A message to deliver later
pub(crate) struct Delivery {
    pub(crate) dest: ActorHandle,
    pub(crate) sender: Option<ActorHandle>,
    pub(crate) mid: MessageId,
    pub(crate) content: Message,
}

struct Scheduled {
    due: Instant,
    seq: u64,
    delivery: Delivery,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

#[derive(Default)]
struct TimerQueue {
    heap: BinaryHeap<Reverse<Scheduled>>,
    next_seq: u64,
    stopped: bool,
}

#[derive(Default)]
struct TimerShared {
    queue: Mutex<TimerQueue>,
    wakeup: Condvar,
}

pub(crate) struct Timer {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    pub(crate) fn start() -> Result<Self> {
        let shared = Arc::new(TimerShared::default());
        let thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("lattice-timer".to_string())
                .spawn(move || timer_loop(&shared))
                .map_err(|e| ActorError::spawn("failed to start timer thread", e))?
        };
        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub(crate) fn schedule(&self, delay: Duration, delivery: Delivery) {
        let mut queue = self.shared.queue.lock();
        if queue.stopped {
            return;
        }
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.heap.push(Reverse(Scheduled {
            due: Instant::now() + delay,
            seq,
            delivery,
        }));
        drop(queue);
        self.shared.wakeup.notify_one();
    }

    /// Stops the timer thread; pending deliveries are dropped
    pub(crate) fn stop(&self) {
        let dropped = {
            let mut queue = self.shared.queue.lock();
            queue.stopped = true;
            std::mem::take(&mut queue.heap)
        };
        self.shared.wakeup.notify_all();
        drop(dropped);
        if let Some(thread) = self.thread.lock().take() {
            if thread.thread().id() != thread::current().id() && thread.join().is_err() {
                warn!("Timer thread terminated abnormally");
            }
        }
    }
}

fn timer_loop(shared: &TimerShared) {
    let mut queue = shared.queue.lock();
    loop {
        if queue.stopped {
            break;
        }
        let now = Instant::now();
        let next_due = queue.heap.peek().map(|Reverse(top)| top.due);
        match next_due {
            None => shared.wakeup.wait(&mut queue),
            Some(due) if due > now => {
                shared.wakeup.wait_until(&mut queue, due);
            }
            Some(_) => {
                let mut ready = Vec::new();
                while let Some(Reverse(top)) = queue.heap.peek() {
                    if top.due > now {
                        break;
                    }
                    if let Some(Reverse(entry)) = queue.heap.pop() {
                        ready.push(entry.delivery);
                    }
                }
                drop(queue);
                for delivery in ready {
                    delivery
                        .dest
                        .enqueue(delivery.sender, delivery.mid, delivery.content);
                }
                queue = shared.queue.lock();
            }
        }
    }
}
