//! Single-consumer work queue.
//!
//! A [`WorkQueue`] owns one consumer thread that takes items off a store and
//! hands them to a handler. The store decides the order: [`Fifo`] (optionally
//! bounded, producers block while it is full) or [`Priority`] (smallest item
//! first). Failures of individual items are reported to [`WorkHooks`], which
//! decide whether the consumer keeps going; the thread itself survives item
//! errors and panics.
//!
//! Stopping is cooperative. [`WorkQueue::request_stop`] clears the running
//! flag; with `flush = true` on a queue built with `flush_on_stop` (the
//! default) everything already queued is processed before
//! [`WorkHooks::on_stop`] runs.
use crate::error::QueueError;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Backing container of a queue. Called with the queue lock held.
pub trait Store<T>: Send {
    fn push(&mut self, item: T);
    fn pop(&mut self) -> Option<T>;
    fn len(&self) -> usize;
    /// Producers block in `enqueue` once `len() == capacity`.
    fn capacity(&self) -> Option<usize> {
        None
    }
}

/// First in, first out.
pub struct Fifo<T> {
    items: VecDeque<T>,
    capacity: Option<usize>,
}

impl<T> Fifo<T> {
    pub fn new() -> Self {
        Fifo { items: VecDeque::new(), capacity: None }
    }

    pub fn bounded(capacity: usize) -> Self {
        Fifo { items: VecDeque::with_capacity(capacity), capacity: Some(capacity.max(1)) }
    }
}

impl<T> Default for Fifo<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Store<T> for Fifo<T> {
    fn push(&mut self, item: T) {
        self.items.push_back(item);
    }

    fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

/// Natural ordering, smallest first. Wrap items in `Reverse` for largest first.
pub struct Priority<T: Ord> {
    heap: BinaryHeap<Reverse<T>>,
}

impl<T: Ord> Priority<T> {
    pub fn new() -> Self {
        Priority { heap: BinaryHeap::new() }
    }
}

impl<T: Ord> Default for Priority<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Ord + Send> Store<T> for Priority<T> {
    fn push(&mut self, item: T) {
        self.heap.push(Reverse(item));
    }

    fn pop(&mut self) -> Option<T> {
        self.heap.pop().map(|Reverse(item)| item)
    }

    fn len(&self) -> usize {
        self.heap.len()
    }
}

/// Lifecycle callbacks, run on the consumer thread.
pub trait WorkHooks: Send + 'static {
    /// Return false to stop before taking any work.
    fn on_start(&mut self, queue: &str) -> bool {
        info!(queue, "work queue starting");
        true
    }

    /// `depth` is what is left in the store once the consumer is done.
    fn on_stop(&mut self, queue: &str, depth: usize) {
        info!(queue, depth, "work queue stopped");
    }

    /// Return false to stop the consumer.
    fn handle_error(&mut self, queue: &str, err: &anyhow::Error) -> bool {
        error!(queue, error = ?err, "work item failed");
        true
    }

    /// Called when the consumer is woken by [`WorkQueue::interrupt`].
    /// Return false to stop the consumer.
    fn handle_interruption(&mut self, queue: &str) -> bool {
        warn!(queue, "work queue interrupted");
        true
    }
}

/// Default hooks: log and keep going.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHooks;

impl WorkHooks for LogHooks {}

/// A plain unit of work.
pub type Task = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

type Handler<T> = Box<dyn FnMut(T) -> anyhow::Result<()> + Send>;

struct State<T> {
    store: Box<dyn Store<T>>,
    running: bool,
    interrupted: bool,
}

struct Shared<T> {
    name: String,
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    processed: AtomicU64,
    flush: AtomicBool,
}

impl<T> Shared<T> {
    fn halt(&self) {
        self.state.lock().running = false;
        self.not_full.notify_all();
    }
}

struct Consumer<T> {
    handler: Handler<T>,
    hooks: Box<dyn WorkHooks>,
    // Dropped when the consumer exits; see `wait_for_stop`.
    _done: Sender<()>,
}

pub struct WorkQueue<T> {
    shared: Arc<Shared<T>>,
    consumer: Mutex<Option<Consumer<T>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    done: Receiver<()>,
    flush_on_stop: bool,
}

pub struct WorkQueueBuilder<T> {
    name: String,
    store: Box<dyn Store<T>>,
    flush_on_stop: bool,
    hooks: Box<dyn WorkHooks>,
}

impl<T: Send + 'static> WorkQueueBuilder<T> {
    /// Whether queued items may be drained when the queue stops. When false,
    /// nothing queued is processed after a stop, whatever `request_stop` is
    /// asked for. Defaults to true.
    pub fn flush_on_stop(mut self, flush: bool) -> Self {
        self.flush_on_stop = flush;
        self
    }

    pub fn hooks(mut self, hooks: impl WorkHooks) -> Self {
        self.hooks = Box::new(hooks);
        self
    }

    /// Every item is passed to `handler`.
    pub fn build<F>(self, handler: F) -> WorkQueue<T>
    where
        F: FnMut(T) -> anyhow::Result<()> + Send + 'static,
    {
        let (done_tx, done_rx) = unbounded();
        WorkQueue {
            shared: Arc::new(Shared {
                name: self.name,
                state: Mutex::new(State { store: self.store, running: true, interrupted: false }),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
                processed: AtomicU64::new(0),
                flush: AtomicBool::new(self.flush_on_stop),
            }),
            consumer: Mutex::new(Some(Consumer {
                handler: Box::new(handler),
                hooks: self.hooks,
                _done: done_tx,
            })),
            thread: Mutex::new(None),
            done: done_rx,
            flush_on_stop: self.flush_on_stop,
        }
    }

    /// Every item is mapped through `transform` and the result posted to the
    /// returned [`Results`] stream.
    pub fn build_transform<V, F>(self, mut transform: F) -> (WorkQueue<T>, Results<V>)
    where
        V: Send + 'static,
        F: FnMut(T) -> anyhow::Result<V> + Send + 'static,
    {
        let (tx, rx) = unbounded();
        let queue = self.build(move |item| {
            let value = transform(item)?;
            // Nobody listening is not an error for the queue.
            let _ = tx.send(value);
            Ok(())
        });
        (queue, Results { rx })
    }
}

/// Pull side of a transforming queue.
///
/// Iterating never blocks: it yields what has been produced so far.
pub struct Results<V> {
    rx: Receiver<V>,
}

impl<V> Results<V> {
    pub fn recv_timeout(&self, timeout: Duration) -> Option<V> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl<V> Iterator for Results<V> {
    type Item = V;

    fn next(&mut self) -> Option<V> {
        self.rx.try_recv().ok()
    }
}

impl<T: Send + 'static> WorkQueue<T> {
    pub fn builder(name: impl Into<String>, store: impl Store<T> + 'static) -> WorkQueueBuilder<T> {
        WorkQueueBuilder {
            name: name.into(),
            store: Box::new(store),
            flush_on_stop: true,
            hooks: Box::new(LogHooks),
        }
    }

    /// Spawn the consumer thread. Items enqueued before this are kept.
    pub fn start(&self) -> Result<(), QueueError> {
        let consumer = self
            .consumer
            .lock()
            .take()
            .ok_or_else(|| QueueError::AlreadyStarted(self.shared.name.clone()))?;
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(self.shared.name.clone())
            .spawn(move || consume(shared, consumer))
            .map_err(|_| QueueError::Spawn(self.shared.name.clone()))?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    /// Queue an item. Returns false, dropping the item, once the queue has
    /// stopped. Blocks while a bounded store is full.
    pub fn enqueue(&self, item: T) -> bool {
        let mut st = self.shared.state.lock();
        loop {
            if !st.running {
                return false;
            }
            match st.store.capacity() {
                Some(cap) if st.store.len() >= cap => self.shared.not_full.wait(&mut st),
                _ => break,
            }
        }
        st.store.push(item);
        drop(st);
        self.shared.not_empty.notify_one();
        true
    }

    /// Stop taking new work. Items already queued are still processed before
    /// the consumer exits only when `flush` is set and the queue was built
    /// with `flush_on_stop`; otherwise they are dropped.
    pub fn request_stop(&self, flush: bool) {
        let flush = flush && self.flush_on_stop;
        debug!(queue = %self.shared.name, flush, "stop requested");
        self.shared.flush.store(flush, Ordering::SeqCst);
        self.shared.halt();
        self.shared.not_empty.notify_all();
    }

    /// Wake the consumer if it is blocked waiting for work.
    pub fn interrupt(&self) {
        self.shared.state.lock().interrupted = true;
        self.shared.not_empty.notify_all();
    }

    pub fn depth(&self) -> usize {
        self.shared.state.lock().store.len()
    }

    pub fn processed_count(&self) -> u64 {
        self.shared.processed.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Wait until the consumer thread has finished. Returns false on timeout
    /// or when the queue was never started.
    pub fn wait_for_stop(&self, timeout: Duration) -> bool {
        matches!(self.done.recv_timeout(timeout), Err(RecvTimeoutError::Disconnected))
    }

    /// Join the consumer thread, if it was started and not joined yet.
    pub fn join(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(queue = %self.shared.name, "consumer thread panicked");
            }
        }
    }
}

impl WorkQueue<Task> {
    /// A started FIFO queue of plain tasks.
    pub fn tasks(name: impl Into<String>) -> Result<Self, QueueError> {
        let queue = WorkQueue::builder(name, Fifo::new()).build(|task: Task| task());
        queue.start()?;
        Ok(queue)
    }

    pub fn submit<F>(&self, task: F) -> bool
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.enqueue(Box::new(task))
    }
}

impl<T> Drop for WorkQueue<T> {
    fn drop(&mut self) {
        // Let a running consumer wind down on its own; never block here.
        self.shared.flush.store(self.flush_on_stop, Ordering::SeqCst);
        self.shared.halt();
        self.shared.not_empty.notify_all();
    }
}

enum Next<T> {
    Item(T),
    Interrupted,
    Stop,
}

fn consume<T>(shared: Arc<Shared<T>>, mut consumer: Consumer<T>) {
    let name = shared.name.as_str();
    if !consumer.hooks.on_start(name) {
        shared.halt();
    }

    loop {
        let next = {
            let mut st = shared.state.lock();
            loop {
                if !st.running {
                    break Next::Stop;
                }
                if st.interrupted {
                    st.interrupted = false;
                    break Next::Interrupted;
                }
                if let Some(item) = st.store.pop() {
                    shared.not_full.notify_one();
                    break Next::Item(item);
                }
                shared.not_empty.wait(&mut st);
            }
        };
        let keep_going = match next {
            Next::Stop => break,
            Next::Interrupted => consumer.hooks.handle_interruption(name),
            Next::Item(item) => execute(&shared, &mut consumer, item),
        };
        if !keep_going {
            shared.halt();
        }
    }

    let flush = shared.flush.load(Ordering::SeqCst);
    info!(queue = name, depth = shared.state.lock().store.len(), flush, "stopping");
    loop {
        let item = {
            let mut st = shared.state.lock();
            if flush { st.store.pop() } else { None }
        };
        match item {
            // Hook verdicts no longer matter while draining.
            Some(item) => {
                execute(&shared, &mut consumer, item);
            }
            None => break,
        }
    }
    let depth = shared.state.lock().store.len();
    consumer.hooks.on_stop(name, depth);
}

fn execute<T>(shared: &Shared<T>, consumer: &mut Consumer<T>, item: T) -> bool {
    let handler = &mut consumer.handler;
    let outcome = catch_unwind(AssertUnwindSafe(|| handler(item)))
        .unwrap_or_else(|panic| Err(anyhow::anyhow!("work item panicked: {}", panic_message(&panic))));
    shared.processed.fetch_add(1, Ordering::SeqCst);
    match outcome {
        Ok(()) => true,
        Err(e) => consumer.hooks.handle_error(&shared.name, &e),
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Clone, Default)]
    struct Recording {
        stopped_at_depth: Arc<Mutex<Option<usize>>>,
        errors: Arc<AtomicU64>,
        stop_on_error: bool,
        interrupts: Arc<AtomicU64>,
    }

    impl WorkHooks for Recording {
        fn on_stop(&mut self, _queue: &str, depth: usize) {
            *self.stopped_at_depth.lock() = Some(depth);
        }

        fn handle_error(&mut self, _queue: &str, _err: &anyhow::Error) -> bool {
            self.errors.fetch_add(1, Ordering::SeqCst);
            !self.stop_on_error
        }

        fn handle_interruption(&mut self, _queue: &str) -> bool {
            self.interrupts.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[test]
    fn fifo_processes_in_enqueue_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let q = WorkQueue::builder("fifo", Fifo::new()).build(move |n: u32| {
            sink.lock().push(n);
            Ok(())
        });
        q.start().unwrap();
        for n in 0..100 {
            assert!(q.enqueue(n));
        }
        q.request_stop(true);
        assert!(q.wait_for_stop(WAIT));
        q.join();
        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
        assert_eq!(q.processed_count(), 100);
        assert_eq!(q.depth(), 0);
    }

    #[test]
    fn enqueue_after_stop_is_rejected() {
        let q = WorkQueue::builder("stopped", Fifo::new()).build(|_: u32| Ok(()));
        q.start().unwrap();
        q.request_stop(true);
        q.join();
        let before = q.depth();
        assert!(!q.enqueue(7));
        assert_eq!(q.depth(), before);
        assert!(!q.is_running());
    }

    fn gated_queue(hooks: Recording) -> (WorkQueue<u32>, Sender<()>, Receiver<()>) {
        gated_queue_with(hooks, true)
    }

    fn gated_queue_with(hooks: Recording, flush_on_stop: bool) -> (WorkQueue<u32>, Sender<()>, Receiver<()>) {
        let (started_tx, started_rx) = bounded(1);
        let (release_tx, release_rx) = bounded::<()>(1);
        let q = WorkQueue::builder("gated", Fifo::new()).hooks(hooks).flush_on_stop(flush_on_stop).build(move |n: u32| {
            if n == 0 {
                started_tx.send(()).ok();
                release_rx.recv().ok();
            }
            Ok(())
        });
        q.start().unwrap();
        assert!(q.enqueue(0));
        (q, release_tx, started_rx)
    }

    #[test]
    fn stop_with_flush_drains_everything() {
        let hooks = Recording::default();
        let (q, release, started) = gated_queue(hooks.clone());
        started.recv_timeout(WAIT).unwrap();
        for n in 1..=10 {
            assert!(q.enqueue(n));
        }
        assert_eq!(q.depth(), 10);
        q.request_stop(true);
        release.send(()).unwrap();
        q.join();
        assert_eq!(q.processed_count(), 11);
        assert_eq!(q.depth(), 0);
        assert_eq!(*hooks.stopped_at_depth.lock(), Some(0));
    }

    #[test]
    fn stop_without_flush_leaves_items() {
        let hooks = Recording::default();
        let (q, release, started) = gated_queue(hooks.clone());
        started.recv_timeout(WAIT).unwrap();
        for n in 1..=10 {
            q.enqueue(n);
        }
        q.request_stop(false);
        release.send(()).unwrap();
        q.join();
        assert_eq!(q.processed_count(), 1);
        assert_eq!(*hooks.stopped_at_depth.lock(), Some(10));
    }

    #[test]
    fn flush_request_is_ignored_without_flush_on_stop() {
        let hooks = Recording::default();
        let (q, release, started) = gated_queue_with(hooks.clone(), false);
        started.recv_timeout(WAIT).unwrap();
        for n in 1..=10 {
            assert!(q.enqueue(n));
        }
        q.request_stop(true);
        release.send(()).unwrap();
        q.join();
        assert_eq!(q.processed_count(), 1);
        assert_eq!(q.depth(), 10);
        assert_eq!(*hooks.stopped_at_depth.lock(), Some(10));
    }

    #[test]
    fn failures_do_not_kill_the_consumer() {
        let hooks = Recording::default();
        let q = WorkQueue::builder("flaky", Fifo::new()).hooks(hooks.clone()).build(|n: u32| {
            match n % 3 {
                0 => anyhow::bail!("bad item {n}"),
                1 => panic!("boom {n}"),
                _ => Ok(()),
            }
        });
        q.start().unwrap();
        for n in 0..9 {
            q.enqueue(n);
        }
        q.request_stop(true);
        q.join();
        assert_eq!(q.processed_count(), 9);
        assert_eq!(hooks.errors.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn error_hook_can_stop_the_queue() {
        let hooks = Recording { stop_on_error: true, ..Default::default() };
        let q = WorkQueue::builder("strict", Fifo::new())
            .hooks(hooks.clone())
            .flush_on_stop(false)
            .build(|n: u32| if n == 2 { anyhow::bail!("stop here") } else { Ok(()) });
        for n in 0..5 {
            q.enqueue(n);
        }
        q.start().unwrap();
        assert!(q.wait_for_stop(WAIT));
        assert_eq!(q.processed_count(), 3);
        assert!(!q.enqueue(9));
        assert_eq!(*hooks.stopped_at_depth.lock(), Some(2));
    }

    #[test]
    fn priority_store_takes_smallest_first() {
        let (q, results) = WorkQueue::builder("prio", Priority::new()).build_transform(|n: u32| Ok(n * 10));
        for n in [5, 1, 4, 2, 3] {
            q.enqueue(n);
        }
        q.start().unwrap();
        q.request_stop(true);
        q.join();
        assert_eq!(results.collect::<Vec<_>>(), vec![10, 20, 30, 40, 50]);
    }

    #[test]
    fn transform_results_are_pulled_as_they_arrive() {
        let (q, results) = WorkQueue::builder("square", Fifo::new()).build_transform(|n: i64| Ok(n * n));
        q.start().unwrap();
        q.enqueue(3);
        assert_eq!(results.recv_timeout(WAIT), Some(9));
        q.enqueue(4);
        assert_eq!(results.recv_timeout(WAIT), Some(16));
        q.request_stop(true);
        q.join();
        assert!(results.is_empty());
    }

    #[test]
    fn interrupt_wakes_the_consumer() {
        let hooks = Recording::default();
        let q = WorkQueue::builder("idle", Fifo::new()).hooks(hooks.clone()).build(|_: u8| Ok(()));
        q.start().unwrap();
        q.interrupt();
        let deadline = std::time::Instant::now() + WAIT;
        while hooks.interrupts.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(hooks.interrupts.load(Ordering::SeqCst), 1);
        assert!(q.is_running());
        q.request_stop(true);
        q.join();
    }

    #[test]
    fn task_queue_runs_closures() {
        let q = WorkQueue::tasks("tasks").unwrap();
        let (tx, rx) = bounded(4);
        for n in 0..4 {
            let tx = tx.clone();
            assert!(q.submit(move || {
                tx.send(n)?;
                Ok(())
            }));
        }
        q.request_stop(true);
        q.join();
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!(q.start(), Err(QueueError::AlreadyStarted("tasks".into())));
    }

    #[test]
    fn bounded_fifo_blocks_producers_until_space() {
        let (release_tx, release_rx) = bounded::<()>(0);
        let q = Arc::new(WorkQueue::builder("tiny", Fifo::bounded(1)).build(move |_: u32| {
            release_rx.recv().ok();
            Ok(())
        }));
        q.enqueue(0);
        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.enqueue(1))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());
        q.start().unwrap();
        release_tx.send(()).unwrap();
        assert!(producer.join().unwrap());
        release_tx.send(()).unwrap();
        q.request_stop(true);
        q.join();
        assert_eq!(q.processed_count(), 2);
    }
}
