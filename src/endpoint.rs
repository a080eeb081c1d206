//! In-memory stand-in for a broker connection.
//!
//! A [`SimulatedEndpoint`] owns one inbound event channel and a single-consumer
//! queue of [`DataSource`]s. Sources registered with [`add_data_source`] are
//! run one after another, so the inbound channel sees each source's complete
//! output before the next source starts. A dispatch thread started by
//! [`run`] hands every inbound event to the listener given to [`create`].
//!
//! The client returned by [`create`] intercepts connect, disconnect and the
//! subscription requests, recording them on the endpoint instead of talking
//! to a network.
//!
//! Subscription sets and flags are individually locked; readers may observe
//! one updated before another.
//!
//! [`add_data_source`]: SimulatedEndpoint::add_data_source
//! [`run`]: SimulatedEndpoint::run
//! [`create`]: SimulatedEndpoint::create
use crate::error::EndpointError;
use crate::listener::{DispatchTable, Listener};
use crate::record::Event;
use crate::source::DataSource;
use crate::work_queue::{Fifo, WorkHooks, WorkQueue};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

static DISPATCH: Lazy<DispatchTable<Box<dyn Listener>>> = Lazy::new(DispatchTable::new);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointId {
    pub profile: String,
    pub connection_id: u32,
}

impl EndpointId {
    pub fn new(profile: impl Into<String>, connection_id: u32) -> Self {
        EndpointId { profile: profile.into(), connection_id }
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.profile, self.connection_id)
    }
}

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Capacity of the inbound event channel. `None` is unbounded; with a
    /// bound, sources block while the dispatcher is behind.
    pub inbound_capacity: Option<usize>,
    /// How long the dispatch thread waits for an event before rechecking
    /// whether it should keep running.
    pub poll_interval: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointConfig { inbound_capacity: None, poll_interval: Duration::from_millis(250) }
    }
}

/// Minimal description of an instrument, as passed to subscription calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Contract {
    pub symbol: String,
    pub sec_type: String,
    pub exchange: String,
    pub currency: String,
}

impl Contract {
    pub fn stock(symbol: &str) -> Self {
        Contract {
            symbol: symbol.to_string(),
            sec_type: "STK".to_string(),
            exchange: "SMART".to_string(),
            currency: "USD".to_string(),
        }
    }
}

/// Outbound calls of the broker client that the simulator intercepts.
pub trait ClientApi {
    fn connect(&mut self, host: &str, port: u16, client_id: i32);
    fn disconnect(&mut self);
    fn is_connected(&self) -> bool;
    fn req_mkt_data(&mut self, ticker_id: i32, contract: &Contract, generic_ticks: &str, snapshot: bool);
    fn req_mkt_depth(&mut self, ticker_id: i32, contract: &Contract, num_rows: i32);
    fn req_realtime_bars(
        &mut self,
        ticker_id: i32,
        contract: &Contract,
        bar_size: i32,
        what_to_show: &str,
        use_rth: bool,
    );
}

/// Stops the source queue when a source fails on I/O.
struct SourceHooks {
    endpoint: String,
}

impl WorkHooks for SourceHooks {
    fn handle_error(&mut self, queue: &str, err: &anyhow::Error) -> bool {
        let io_failure = err.chain().any(|cause| cause.is::<io::Error>());
        if io_failure {
            error!(endpoint = %self.endpoint, queue, error = ?err, "data source i/o failure, no more sources will run");
            return false;
        }
        warn!(endpoint = %self.endpoint, queue, error = ?err, "data source failed");
        true
    }
}

pub struct SimulatedEndpoint {
    id: EndpointId,
    config: EndpointConfig,
    inbound_tx: Sender<Event>,
    inbound_rx: Receiver<Event>,
    sources: WorkQueue<DataSource>,
    listener: Mutex<Option<Box<dyn Listener>>>,
    ready: AtomicBool,
    running: AtomicBool,
    connected: AtomicBool,
    client_id: Mutex<Option<i32>>,
    mkt_data: Mutex<BTreeSet<i32>>,
    realtime_bars: Mutex<BTreeSet<i32>>,
    mkt_depth: Mutex<BTreeSet<i32>>,
    invocations: AtomicU64,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for SimulatedEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedEndpoint")
            .field("id", &self.id)
            .field("running", &self.is_running())
            .field("connected", &self.is_connected())
            .field("invocations", &self.invocations())
            .finish()
    }
}

impl SimulatedEndpoint {
    pub fn new(profile: impl Into<String>, connection_id: u32) -> Result<Arc<Self>, EndpointError> {
        Self::with_config(EndpointId::new(profile, connection_id), EndpointConfig::default())
    }

    /// Build the endpoint and start its source queue.
    pub fn with_config(id: EndpointId, config: EndpointConfig) -> Result<Arc<Self>, EndpointError> {
        let (inbound_tx, inbound_rx) = match config.inbound_capacity {
            Some(cap) => bounded(cap),
            None => unbounded(),
        };
        let sources = WorkQueue::builder(format!("sources-{id}"), Fifo::new())
            .hooks(SourceHooks { endpoint: id.to_string() })
            .flush_on_stop(false)
            .build(|ds: DataSource| {
                ds.run()?;
                Ok(())
            });
        sources.start()?;
        info!(endpoint = %id, "simulated endpoint created");
        Ok(Arc::new(SimulatedEndpoint {
            id,
            config,
            inbound_tx,
            inbound_rx,
            sources,
            listener: Mutex::new(None),
            ready: AtomicBool::new(false),
            running: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            client_id: Mutex::new(None),
            mkt_data: Mutex::new(BTreeSet::new()),
            realtime_bars: Mutex::new(BTreeSet::new()),
            mkt_depth: Mutex::new(BTreeSet::new()),
            invocations: AtomicU64::new(0),
            dispatcher: Mutex::new(None),
        }))
    }

    pub fn id(&self) -> &EndpointId {
        &self.id
    }

    /// Point `source` at the inbound channel and queue it behind the sources
    /// already registered. False once the source queue has stopped.
    pub fn add_data_source(&self, source: &DataSource) -> bool {
        source.set_sink(self.inbound_tx.clone());
        let queued = self.sources.enqueue(source.clone());
        if queued {
            debug!(endpoint = %self.id, resource = source.resource(), "data source queued");
        } else {
            warn!(endpoint = %self.id, resource = source.resource(), "source queue stopped, data source rejected");
        }
        queued
    }

    /// Install the listener that receives dispatched events and return the
    /// client facade bound to this endpoint.
    ///
    /// Fails with [`EndpointError::AlreadyRunning`] while a dispatch thread
    /// exists. To swap listeners, `stop_running()` and `join()` first, then
    /// `create()` and `run()` again.
    pub fn create(self: &Arc<Self>, listener: impl Listener + 'static) -> Result<SimulatedClient, EndpointError> {
        let dispatcher = self.dispatcher.lock();
        if dispatcher.is_some() {
            return Err(EndpointError::AlreadyRunning(self.id.to_string()));
        }
        *self.listener.lock() = Some(Box::new(listener));
        self.ready.store(true, Ordering::SeqCst);
        Ok(SimulatedClient { endpoint: Arc::clone(self) })
    }

    /// Spawn the dispatch thread.
    pub fn run(self: &Arc<Self>) -> Result<(), EndpointError> {
        let mut dispatcher = self.dispatcher.lock();
        if dispatcher.is_some() {
            return Err(EndpointError::AlreadyRunning(self.id.to_string()));
        }
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or_else(|| EndpointError::NotReady(self.id.to_string()))?;
        self.running.store(true, Ordering::SeqCst);
        let endpoint = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("dispatch-{}", self.id))
            .spawn(move || endpoint.dispatch_loop(listener))
            .map_err(|source| {
                self.running.store(false, Ordering::SeqCst);
                EndpointError::Spawn { id: self.id.to_string(), source }
            })?;
        *dispatcher = Some(handle);
        Ok(())
    }

    fn dispatch_loop(&self, mut listener: Box<dyn Listener>) {
        info!(endpoint = %self.id, "dispatch started");
        while self.running.load(Ordering::SeqCst) {
            let event = match self.inbound_rx.recv_timeout(self.config.poll_interval) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            match DISPATCH.dispatch(&mut listener, &event) {
                Ok(()) => {
                    self.invocations.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => {
                    error!(endpoint = %self.id, source = event.source(), error = %e, "dispatch failed, endpoint stopping");
                    self.running.store(false, Ordering::SeqCst);
                }
            }
        }
        info!(endpoint = %self.id, invocations = self.invocations(), "dispatch stopped");
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn client_id(&self) -> Option<i32> {
        *self.client_id.lock()
    }

    pub fn ticker_ids_for_mkt_data(&self) -> BTreeSet<i32> {
        self.mkt_data.lock().clone()
    }

    pub fn ticker_ids_for_realtime_bars(&self) -> BTreeSet<i32> {
        self.realtime_bars.lock().clone()
    }

    pub fn ticker_ids_for_mkt_depth(&self) -> BTreeSet<i32> {
        self.mkt_depth.lock().clone()
    }

    /// Listener callbacks completed so far.
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn is_event_queue_empty(&self) -> bool {
        self.inbound_rx.is_empty()
    }

    /// False once the source queue has stopped, after `shutdown()` or a
    /// source failing on I/O.
    pub fn accepts_sources(&self) -> bool {
        self.sources.is_running()
    }

    /// Sources queued but not yet picked up.
    pub fn pending_sources(&self) -> usize {
        self.sources.depth()
    }

    /// Sources that ran to completion or failed.
    pub fn sources_processed(&self) -> u64 {
        self.sources.processed_count()
    }

    /// Ask the dispatch thread to exit after the event in hand.
    pub fn stop_running(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Wait for the dispatch thread, if one was started.
    pub fn join(&self) {
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(endpoint = %self.id, "dispatch thread panicked");
            }
        }
    }

    /// Stop dispatching and refuse further sources. A source that is still
    /// waiting for `start()` keeps its thread parked.
    pub fn shutdown(&self) {
        self.stop_running();
        self.sources.request_stop(false);
        self.join();
        info!(endpoint = %self.id, "simulated endpoint shut down");
    }
}

/// Client facade returned by [`SimulatedEndpoint::create`].
#[derive(Clone)]
pub struct SimulatedClient {
    endpoint: Arc<SimulatedEndpoint>,
}

impl SimulatedClient {
    pub fn endpoint(&self) -> &Arc<SimulatedEndpoint> {
        &self.endpoint
    }
}

impl ClientApi for SimulatedClient {
    fn connect(&mut self, host: &str, port: u16, client_id: i32) {
        let ep = &self.endpoint;
        *ep.client_id.lock() = Some(client_id);
        ep.connected.store(true, Ordering::SeqCst);
        info!(endpoint = %ep.id, host, port, client_id, "connect intercepted");
    }

    fn disconnect(&mut self) {
        let ep = &self.endpoint;
        ep.running.store(false, Ordering::SeqCst);
        ep.connected.store(false, Ordering::SeqCst);
        info!(endpoint = %ep.id, "disconnect intercepted");
    }

    fn is_connected(&self) -> bool {
        self.endpoint.is_connected()
    }

    fn req_mkt_data(&mut self, ticker_id: i32, contract: &Contract, generic_ticks: &str, snapshot: bool) {
        self.endpoint.mkt_data.lock().insert(ticker_id);
        debug!(endpoint = %self.endpoint.id, ticker_id, symbol = %contract.symbol, generic_ticks, snapshot, "market data subscribed");
    }

    fn req_mkt_depth(&mut self, ticker_id: i32, contract: &Contract, num_rows: i32) {
        self.endpoint.mkt_depth.lock().insert(ticker_id);
        debug!(endpoint = %self.endpoint.id, ticker_id, symbol = %contract.symbol, num_rows, "market depth subscribed");
    }

    fn req_realtime_bars(
        &mut self,
        ticker_id: i32,
        contract: &Contract,
        bar_size: i32,
        what_to_show: &str,
        use_rth: bool,
    ) {
        self.endpoint.realtime_bars.lock().insert(ticker_id);
        debug!(
            endpoint = %self.endpoint.id,
            ticker_id,
            symbol = %contract.symbol,
            bar_size,
            what_to_show,
            use_rth,
            "realtime bars subscribed"
        );
    }
}

/// Lookup of live endpoints for test harnesses.
///
/// Owned by whoever sets up the simulation and passed where needed.
#[derive(Default)]
pub struct EndpointRegistry {
    endpoints: RwLock<HashMap<EndpointId, Arc<SimulatedEndpoint>>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the endpoint previously registered under the same id.
    pub fn register(&self, endpoint: Arc<SimulatedEndpoint>) -> Option<Arc<SimulatedEndpoint>> {
        let id = endpoint.id().clone();
        let previous = self.endpoints.write().insert(id.clone(), endpoint);
        if previous.is_some() {
            warn!(endpoint = %id, "replaced registered endpoint");
        }
        previous
    }

    pub fn get(&self, id: &EndpointId) -> Option<Arc<SimulatedEndpoint>> {
        self.endpoints.read().get(id).cloned()
    }

    pub fn remove(&self, id: &EndpointId) -> Option<Arc<SimulatedEndpoint>> {
        self.endpoints.write().remove(id)
    }

    pub fn len(&self) -> usize {
        self.endpoints.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.read().is_empty()
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<EndpointId> {
        let mut ids: Vec<EndpointId> = self.endpoints.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}
