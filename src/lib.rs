//! Deterministic record and replay of a broker callback stream.
//!
//! This crate provides the pieces used by the `feed_sim` recorder binary and
//! the `player` tool:
//!
//! - `record`: the event model, the closed set of protocol methods and their
//!   argument schemas, and the CSV feed line format
//! - `work_queue`: single-consumer work queue with FIFO or priority stores
//! - `source`: data sources gated by a start latch, pushing into a sink
//! - `feeds`: CSV feeds, event log replays, live relays and static scripts
//! - `listener`: the callback interface and the method dispatch table
//! - `capture`: a listener that turns callbacks back into events
//! - `endpoint`: simulated broker connections and their registry
//! - `event_log`: day-partitioned event files in a framed or a
//!   self-describing container format
//!
//! Sources registered with one endpoint are replayed strictly one after
//! another, so a listener sees a total order that only depends on the
//! inputs.
pub mod capture;
pub mod endpoint;
pub mod error;
pub mod event_log;
pub mod feeds;
pub mod listener;
pub mod record;
pub mod source;
pub mod work_queue;

pub use capture::EventCapture;
pub use endpoint::{ClientApi, Contract, EndpointConfig, EndpointId, EndpointRegistry, SimulatedClient, SimulatedEndpoint};
pub use event_log::{EventLog, LogFormat, Reader, SystemClock, Writer};
pub use feeds::{CsvFeed, LogReplay, Relay, RelayHandle, StaticEvents};
pub use listener::{DispatchTable, Listener};
pub use record::{Event, FieldValue, Method};
pub use source::{DataSource, EventSink, Generate};
pub use work_queue::{Fifo, Priority, WorkHooks, WorkQueue};
