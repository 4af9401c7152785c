//! pagepulse-core: client-side page telemetry
//!
//! Observes user and runtime events inside a running page session, holds
//! them in a bounded in-memory queue and commits them in batches to a remote
//! persistence sink, while tracking per-page visible time across navigations
//! and tab visibility changes. Delivery is best-effort: a failed write is
//! retried with the next flush, and under sustained failure the oldest
//! events are the ones dropped.
//!
//! # Architecture
//!
//! ```text
//! host signals → LifecycleSource → Pipeline::apply_signal ─┬→ EventQueue
//!                                                          └→ FlushScheduler
//! FlushScheduler → drain → EventSink::commit ─(failure)→ restore to queue
//! ```
//!
//! # Usage
//!
//! The embedding host owns subscriber setup; the `[logging]` table of the
//! config file is only read when it passes it to [`logging::init_logging`].
//!
//! ```ignore
//! let config = PipelineConfig::load_from(Path::new("pagepulse.toml"))?;
//! logging::init_logging(&config.logging)?;
//!
//! let pipeline = Pipeline::builder(config).build()?;
//! let (signals, source) = ChannelSource::new(64);
//! tokio::spawn(Arc::clone(&pipeline).run(source, identity_tx.subscribe()));
//! ```
//!
//! # Modules
//!
//! - `session`: per-tab session id and the cached user identity
//! - `sampling`: one-time, session-scoped sampling decision
//! - `queue`: bounded FIFO with oldest-first eviction
//! - `dwell`: visible-time accounting per page
//! - `scheduler`: non-overlapping drain-and-commit flushes
//! - `lifecycle`: host signals and their translation into events
//! - `hook`: manual `track` / `flush` handle for application code
//! - `pipeline`: the per-session context and its control loop
//! - `sink`: persistence sinks (in-memory, HTTP)
//! - `outbox`: optional durable teardown outbox
//! - `event`: event vocabulary and flush reasons
//! - `clock`: injectable time source
//! - `config`: TOML configuration
//! - `logging`: tracing subscriber setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod clock;
pub mod config;
pub mod dwell;
pub mod error;
pub mod event;
pub mod hook;
pub mod lifecycle;
pub mod logging;
pub mod outbox;
pub mod pipeline;
pub mod queue;
pub mod sampling;
pub mod scheduler;
pub mod session;
pub mod sink;

pub use config::PipelineConfig;
pub use error::{Error, Result, SinkError};
pub use event::{Event, EventPayload, FlushReason};
pub use hook::{InstrumentationHandle, global, install_global};
pub use lifecycle::{ChannelSource, LifecycleSignal, LifecycleSource};
pub use pipeline::{PageInfo, Pipeline, PipelineBuilder, PipelineStats};
pub use scheduler::{FlushOutcome, SkipReason};
pub use session::{IdentityProvider, UserIdentity};
pub use sink::{EventSink, HttpSink, MemorySink};

/// Version of the pagepulse-core library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
