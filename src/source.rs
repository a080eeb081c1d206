//! Data sources: producers of protocol events.
//!
//! A [`DataSource`] wraps a [`Generate`] implementation with the lifecycle
//! the simulator relies on. `run()` can be called from any thread, usually
//! the consumer of an endpoint's source queue, and parks on a start latch
//! until somebody calls `start()`. Generation then pushes events through an
//! [`EventSink`], which applies the optional fixed latency and blocks while a
//! bounded sink is full.
use crate::error::SourceError;
use crate::record::Event;
use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Producer logic behind a [`DataSource`].
pub trait Generate: Send {
    /// Push events into `sink` until the input is exhausted.
    fn generate(&mut self, sink: &EventSink) -> anyhow::Result<()>;

    /// Predicate for an event after which the source counts as finished,
    /// such as a disconnect notice. Checked for every pushed event.
    fn terminal_condition(&self) -> Option<fn(&Event) -> bool> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Created,
    /// `run()` is parked on the start latch.
    Blocked,
    /// Latch released, generation not begun yet.
    Started,
    Running,
    Finished,
}

struct Latch {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    fn release(&self) {
        *self.open.lock() = true;
        self.cond.notify_all();
    }

    fn is_open(&self) -> bool {
        *self.open.lock()
    }

    fn wait(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.cond.wait(&mut open);
        }
    }
}

struct Inner {
    resource: String,
    latency: Mutex<Duration>,
    latch: Latch,
    state: Mutex<SourceState>,
    sink: Mutex<Option<Sender<Event>>>,
    generator: Mutex<Option<Box<dyn Generate>>>,
    terminal_seen: Arc<AtomicBool>,
    pushed: Arc<AtomicU64>,
}

/// Cloneable handle to one data source.
///
/// Clones share state, so a test can keep a handle to `start()` a source
/// while an endpoint runs it on its own thread.
#[derive(Clone)]
pub struct DataSource {
    inner: Arc<Inner>,
}

impl fmt::Debug for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSource")
            .field("resource", &self.inner.resource)
            .field("state", &self.state())
            .field("pushed", &self.events_pushed())
            .finish()
    }
}

impl DataSource {
    pub fn new(resource: impl Into<String>, generator: impl Generate + 'static) -> Self {
        DataSource {
            inner: Arc::new(Inner {
                resource: resource.into(),
                latency: Mutex::new(Duration::ZERO),
                latch: Latch { open: Mutex::new(false), cond: Condvar::new() },
                state: Mutex::new(SourceState::Created),
                sink: Mutex::new(None),
                generator: Mutex::new(Some(Box::new(generator))),
                terminal_seen: Arc::new(AtomicBool::new(false)),
                pushed: Arc::new(AtomicU64::new(0)),
            }),
        }
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_event_latency(latency);
        self
    }

    /// Sleep `latency` before every event, to pace a recorded session.
    /// Only read when generation begins.
    pub fn set_event_latency(&self, latency: Duration) {
        *self.inner.latency.lock() = latency;
    }

    pub fn latency(&self) -> Duration {
        *self.inner.latency.lock()
    }

    pub fn resource(&self) -> &str {
        &self.inner.resource
    }

    /// Point the source at the queue it should fill.
    pub fn set_sink(&self, sink: Sender<Event>) {
        *self.inner.sink.lock() = Some(sink);
    }

    /// Release the start latch. Calling it again has no effect.
    pub fn start(&self) {
        {
            let mut state = self.inner.state.lock();
            if matches!(*state, SourceState::Created | SourceState::Blocked) {
                *state = SourceState::Started;
            }
        }
        self.inner.latch.release();
    }

    pub fn is_started(&self) -> bool {
        self.inner.latch.is_open()
    }

    pub fn state(&self) -> SourceState {
        *self.inner.state.lock()
    }

    pub fn events_pushed(&self) -> u64 {
        self.inner.pushed.load(Ordering::SeqCst)
    }

    /// True once generation is over or a terminal event went through the
    /// sink. Never goes back to false.
    pub fn finished(&self) -> bool {
        self.state() == SourceState::Finished || self.inner.terminal_seen.load(Ordering::SeqCst)
    }

    /// Wait for `start()`, then generate into the sink. Blocks the calling
    /// thread until generation is over.
    pub fn run(&self) -> Result<(), SourceError> {
        let resource = self.inner.resource.clone();
        {
            let mut state = self.inner.state.lock();
            match *state {
                SourceState::Created => *state = SourceState::Blocked,
                SourceState::Started => {}
                _ => return Err(SourceError::AlreadyRun(resource)),
            }
        }
        debug!(resource = %resource, "waiting for start");
        self.inner.latch.wait();

        let Some(mut generator) = self.inner.generator.lock().take() else {
            return Err(SourceError::AlreadyRun(resource));
        };
        let Some(tx) = self.inner.sink.lock().clone() else {
            self.finish();
            return Err(SourceError::NoSink(resource));
        };
        *self.inner.state.lock() = SourceState::Running;
        info!(resource = %resource, "data source running");

        let sink = EventSink {
            resource: resource.clone(),
            tx,
            latency: self.latency(),
            terminal: generator.terminal_condition(),
            terminal_seen: Arc::clone(&self.inner.terminal_seen),
            pushed: Arc::clone(&self.inner.pushed),
        };
        let outcome = generator.generate(&sink);
        drop(sink);
        self.finish();

        match outcome {
            Ok(()) => {
                info!(resource = %resource, events = self.events_pushed(), "data source finished");
                Ok(())
            }
            Err(source) => {
                warn!(resource = %resource, error = ?source, "data source failed");
                Err(SourceError::Generation { resource, source })
            }
        }
    }

    fn finish(&self) {
        // No late writes once generation is over.
        self.inner.sink.lock().take();
        *self.inner.state.lock() = SourceState::Finished;
    }
}

/// Where a generator pushes its events.
pub struct EventSink {
    resource: String,
    tx: Sender<Event>,
    latency: Duration,
    terminal: Option<fn(&Event) -> bool>,
    terminal_seen: Arc<AtomicBool>,
    pushed: Arc<AtomicU64>,
}

impl EventSink {
    /// Deliver one event, sleeping the configured latency first. Blocks
    /// while the receiving queue is full.
    pub fn push(&self, event: Event) -> Result<(), SourceError> {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        let terminal = self.terminal.is_some_and(|is_terminal| is_terminal(&event));
        self.tx
            .send(event)
            .map_err(|_| SourceError::SinkClosed(self.resource.clone()))?;
        self.pushed.fetch_add(1, Ordering::SeqCst);
        if terminal {
            debug!(resource = %self.resource, "terminal event observed");
            self.terminal_seen.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn terminal_seen(&self) -> bool {
        self.terminal_seen.load(Ordering::SeqCst)
    }

    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::SeqCst)
    }
}
