//! The per-page-session context and its control loop.
//!
//! A [`Pipeline`] owns every piece of per-session state: identity, sampling
//! decision, the bounded queue, the dwell timer, the current route and the
//! flush scheduler. It is shared through `Arc`; the mutable parts sit behind
//! `std::sync::Mutex` guards that are only held inside synchronous methods,
//! never across an `.await`.
//!
//! [`Pipeline::run`] is the control loop: it interleaves the periodic flush
//! ticker, host lifecycle signals and identity changes. Flushes are spawned
//! so the loop keeps observing the page while a commit is pending.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::PipelineConfig;
use crate::dwell::DwellTimer;
use crate::error::{ConfigError, OutboxError};
use crate::event::{Event, EventPayload, FlushReason, Viewport};
use crate::lifecycle::{LifecycleSignal, LifecycleSource};
use crate::outbox::Outbox;
use crate::queue::{EventQueue, QueueStats};
use crate::sampling::{RollFn, SamplingGate};
use crate::scheduler::{FlushOutcome, FlushScheduler};
use crate::session::{MemorySessionStore, SessionIdentity, SessionStore, UserIdentity};
use crate::sink::{EventSink, HttpSink};

// =============================================================================
// Page info
// =============================================================================

/// What the host knows about the page when the pipeline starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageInfo {
    pub path: String,
    pub visible: bool,
    pub user_agent: Option<String>,
    pub viewport: Option<Viewport>,
}

impl Default for PageInfo {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            visible: true,
            user_agent: None,
            viewport: None,
        }
    }
}

#[derive(Debug)]
struct PageState {
    path: String,
    user_agent: Option<String>,
    viewport: Option<Viewport>,
}

// =============================================================================
// Stats
// =============================================================================

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    dropped_gated: AtomicU64,
    flushes_committed: AtomicU64,
    flushes_failed: AtomicU64,
    flushes_skipped: AtomicU64,
    events_committed: AtomicU64,
    last_flush_reason: Mutex<Option<FlushReason>>,
}

/// Serializable pipeline counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub enqueued: u64,
    /// Events dropped because the session was disabled or unauthenticated
    pub dropped_gated: u64,
    /// Events dropped from the front of the queue to respect the bound
    pub evicted: u64,
    pub queued: usize,
    pub flushes_committed: u64,
    pub flushes_failed: u64,
    pub flushes_skipped: u64,
    pub events_committed: u64,
    /// Reason of the last committed flush
    pub last_flush_reason: Option<FlushReason>,
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`Pipeline`].
///
/// Without an explicit sink, `config.sink.endpoint` selects an [`HttpSink`];
/// with neither, `build` fails.
pub struct PipelineBuilder {
    config: PipelineConfig,
    clock: Option<Arc<dyn Clock>>,
    store: Option<Arc<dyn SessionStore>>,
    sink: Option<Arc<dyn EventSink>>,
    roll: Option<RollFn>,
    page: PageInfo,
}

impl PipelineBuilder {
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            clock: None,
            store: None,
            sink: None,
            roll: None,
            page: PageInfo::default(),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn with_session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Replace the sampling roll (uniform in [0, 1)).
    #[must_use]
    pub fn with_roll(mut self, roll: RollFn) -> Self {
        self.roll = Some(roll);
        self
    }

    #[must_use]
    pub fn with_page(mut self, page: PageInfo) -> Self {
        self.page = page;
        self
    }

    pub fn build(self) -> crate::Result<Arc<Pipeline>> {
        self.config.validate()?;

        let sink = match (self.sink, &self.config.sink.endpoint) {
            (Some(sink), _) => sink,
            (None, Some(endpoint)) => {
                Arc::new(HttpSink::new(endpoint.clone(), self.config.sink_timeout())?)
            }
            (None, None) => {
                return Err(ConfigError::InvalidValue {
                    field: "sink.endpoint",
                    reason: "required when no sink is supplied".to_string(),
                }
                .into());
            }
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemorySessionStore::new()));

        let sampling = match self.roll {
            Some(roll) => SamplingGate::with_roll(
                self.config.enabled,
                self.config.sample_rate,
                Arc::clone(&store),
                roll,
            ),
            None => SamplingGate::new(
                self.config.enabled,
                self.config.sample_rate,
                Arc::clone(&store),
            ),
        };

        let now = clock.now_ms();
        let mut dwell = DwellTimer::new(now);
        if self.page.visible {
            dwell.on_visible(now);
        }

        let outbox = self.config.outbox_dir.clone().map(Outbox::new);

        Ok(Arc::new(Pipeline {
            queue: Mutex::new(EventQueue::new(self.config.max_queue_size)),
            dwell: Mutex::new(dwell),
            page: Mutex::new(PageState {
                path: self.page.path,
                user_agent: self.page.user_agent,
                viewport: self.page.viewport,
            }),
            identity: SessionIdentity::new(store),
            sampling,
            scheduler: FlushScheduler::new(sink),
            outbox,
            outbox_written: AtomicU64::new(0),
            outbox_pending: AtomicU64::new(0),
            counters: Counters::default(),
            clock,
            config: self.config,
        }))
    }
}

// =============================================================================
// Pipeline
// =============================================================================

pub struct Pipeline {
    config: PipelineConfig,
    clock: Arc<dyn Clock>,
    identity: SessionIdentity,
    sampling: SamplingGate,
    queue: Mutex<EventQueue<Event>>,
    dwell: Mutex<DwellTimer>,
    page: Mutex<PageState>,
    scheduler: FlushScheduler,
    outbox: Option<Outbox>,
    // Generation counter of teardown writes, and the generation still on disk.
    outbox_written: AtomicU64,
    outbox_pending: AtomicU64,
    counters: Counters,
}

impl Pipeline {
    #[must_use]
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[must_use]
    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    /// Sampling decision for this session (global flag included).
    pub fn is_enabled(&self) -> bool {
        self.sampling.is_enabled()
    }

    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    #[must_use]
    pub fn current_path(&self) -> String {
        self.page
            .lock()
            .map(|page| page.path.clone())
            .unwrap_or_default()
    }

    pub(crate) fn set_current_path(&self, path: &str) {
        if let Ok(mut page) = self.page.lock() {
            page.path = path.to_string();
        }
    }

    pub(crate) fn session_start_payload(&self) -> EventPayload {
        let (user_agent, viewport) = self
            .page
            .lock()
            .map(|page| (page.user_agent.clone(), page.viewport))
            .unwrap_or_default();
        EventPayload::SessionStart {
            user_agent,
            viewport,
        }
    }

    /// Queue an event stamped with the current route, time and identity.
    ///
    /// Dropped (and counted) when the session is sampled out or no identity
    /// is resolved. Returns whether the event was queued.
    pub fn enqueue(&self, payload: EventPayload) -> bool {
        let Some(user) = self.gated_user() else {
            self.counters.dropped_gated.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        let event =
            Event::new(self.current_path(), self.now_ms(), payload).with_uid(Some(user.uid));
        self.push_event(event)
    }

    fn gated_user(&self) -> Option<UserIdentity> {
        if !self.is_enabled() {
            return None;
        }
        self.identity.current_user()
    }

    fn push_event(&self, event: Event) -> bool {
        let kind = event.type_tag().to_string();
        let Ok(mut queue) = self.queue.lock() else {
            return false;
        };
        let evicted = queue.push(event);
        let len = queue.len();
        drop(queue);

        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        if evicted > 0 {
            debug!(kind = %kind, evicted, queued = len, "Queue full; oldest events dropped");
        }
        true
    }

    /// Run one flush attempt now.
    pub async fn flush(&self, reason: FlushReason) -> FlushOutcome {
        let outbox_generation = self.outbox_pending.load(Ordering::Acquire);
        let outcome = self.scheduler.trigger(self, reason).await;
        self.record_outcome(reason, outcome);
        if outcome.is_committed() && outbox_generation != 0 {
            self.clear_outbox(outbox_generation);
        }
        outcome
    }

    /// Fire-and-forget flush on the current runtime.
    ///
    /// `None` when called outside a tokio runtime; nothing is started.
    pub fn spawn_flush(
        self: &Arc<Self>,
        reason: FlushReason,
    ) -> Option<JoinHandle<FlushOutcome>> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(%reason, "No runtime; flush not started");
            return None;
        };
        let pipeline = Arc::clone(self);
        Some(runtime.spawn(async move { pipeline.flush(reason).await }))
    }

    fn record_outcome(&self, reason: FlushReason, outcome: FlushOutcome) {
        match outcome {
            FlushOutcome::Committed { events } => {
                self.counters
                    .flushes_committed
                    .fetch_add(1, Ordering::Relaxed);
                self.counters
                    .events_committed
                    .fetch_add(events as u64, Ordering::Relaxed);
                if let Ok(mut last) = self.counters.last_flush_reason.lock() {
                    *last = Some(reason);
                }
            }
            FlushOutcome::Failed { .. } => {
                self.counters.flushes_failed.fetch_add(1, Ordering::Relaxed);
            }
            FlushOutcome::Skipped(_) => {
                self.counters.flushes_skipped.fetch_add(1, Ordering::Relaxed);
            }
            FlushOutcome::Empty => {}
        }
    }

    pub(crate) fn drain_queue(&self) -> Vec<Event> {
        self.queue
            .lock()
            .map(|mut queue| queue.drain_snapshot())
            .unwrap_or_default()
    }

    /// Put events back at the front; returns how many the bound evicted.
    pub(crate) fn restore_queue(&self, events: Vec<Event>) -> usize {
        self.queue
            .lock()
            .map(|mut queue| queue.restore(events))
            .unwrap_or(0)
    }

    /// Owned copy of the pending events, oldest first.
    #[must_use]
    pub fn pending_events(&self) -> Vec<Event> {
        self.queue
            .lock()
            .map(|queue| queue.to_vec())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.lock().map(|queue| queue.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn queue_stats(&self) -> Option<QueueStats> {
        self.queue.lock().ok().map(|queue| queue.stats())
    }

    #[must_use]
    pub fn is_flush_in_flight(&self) -> bool {
        self.scheduler.is_in_flight()
    }

    #[must_use]
    pub fn stats(&self) -> PipelineStats {
        let queue = self.queue_stats();
        PipelineStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            dropped_gated: self.counters.dropped_gated.load(Ordering::Relaxed),
            evicted: queue.as_ref().map_or(0, |q| q.total_evicted),
            queued: queue.as_ref().map_or(0, |q| q.len),
            flushes_committed: self.counters.flushes_committed.load(Ordering::Relaxed),
            flushes_failed: self.counters.flushes_failed.load(Ordering::Relaxed),
            flushes_skipped: self.counters.flushes_skipped.load(Ordering::Relaxed),
            events_committed: self.counters.events_committed.load(Ordering::Relaxed),
            last_flush_reason: self
                .counters
                .last_flush_reason
                .lock()
                .ok()
                .and_then(|last| *last),
        }
    }

    // -------------------------------------------------------------------------
    // Dwell
    // -------------------------------------------------------------------------

    pub(crate) fn with_dwell<R>(&self, f: impl FnOnce(&mut DwellTimer, u64) -> R) -> Option<R> {
        let now = self.now_ms();
        self.dwell.lock().ok().map(|mut dwell| f(&mut dwell, now))
    }

    /// Visible ms folded so far on the current page.
    #[must_use]
    pub fn dwell_accumulated_ms(&self) -> u64 {
        self.dwell
            .lock()
            .map(|dwell| dwell.accumulated_ms())
            .unwrap_or(0)
    }

    // -------------------------------------------------------------------------
    // Outbox
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn outbox_path(&self) -> Option<PathBuf> {
        let outbox = self.outbox.as_ref()?;
        let session_id = self.identity.session_id()?;
        Some(outbox.path_for(&session_id))
    }

    /// Move events left by a previous teardown of this session to the front
    /// of the queue. Returns how many were recovered.
    pub fn recover_outbox(&self) -> usize {
        let Some(outbox) = &self.outbox else {
            return 0;
        };
        let Some(session_id) = self.identity.session_id() else {
            return 0;
        };
        match outbox.take(&session_id) {
            Ok(events) if events.is_empty() => 0,
            Ok(events) => {
                let count = events.len();
                let evicted = self.restore_queue(events);
                info!(session_id = %session_id, events = count, evicted, "Outbox recovered");
                count
            }
            Err(err @ OutboxError::Corrupt { .. }) => {
                warn!(session_id = %session_id, error = %err, "Corrupt outbox discarded");
                0
            }
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "Outbox could not be read");
                0
            }
        }
    }

    /// Write the pending queue to the outbox, if one is configured.
    pub(crate) fn persist_outbox(&self) -> bool {
        let Some(outbox) = &self.outbox else {
            return false;
        };
        let Some(session_id) = self.identity.session_id() else {
            return false;
        };
        let events = self.pending_events();
        match outbox.store(&session_id, &events) {
            Ok(()) if events.is_empty() => {
                self.outbox_pending.store(0, Ordering::Release);
                true
            }
            Ok(()) => {
                let generation = self.outbox_written.fetch_add(1, Ordering::AcqRel) + 1;
                self.outbox_pending.store(generation, Ordering::Release);
                true
            }
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "Outbox write failed");
                false
            }
        }
    }

    // A commit that drained after the outbox was written covers its contents.
    fn clear_outbox(&self, generation: u64) {
        if self
            .outbox_pending
            .compare_exchange(generation, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let (Some(outbox), Some(session_id)) = (&self.outbox, self.identity.session_id()) else {
            return;
        };
        if let Err(err) = outbox.store(&session_id, &[]) {
            warn!(session_id = %session_id, error = %err, "Outbox could not be cleared");
        }
    }

    // -------------------------------------------------------------------------
    // Control loop
    // -------------------------------------------------------------------------

    /// Drive the pipeline until `source` closes.
    ///
    /// Recovers any outbox first, applies the identity already published on
    /// `identity`, then reacts to ticks, signals and identity changes. A
    /// sampled-out session returns at once.
    pub async fn run<S>(
        self: Arc<Self>,
        mut source: S,
        mut identity: watch::Receiver<Option<UserIdentity>>,
    ) where
        S: LifecycleSource,
    {
        if !self.is_enabled() {
            debug!("Session sampled out; control loop not started");
            return;
        }

        let initial = identity.borrow_and_update().clone();
        self.dispatch_detached(LifecycleSignal::IdentityChanged(initial));
        self.recover_outbox();

        let period = self.config.flush_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut identity_open = true;

        debug!(
            path = %self.current_path(),
            interval_ms = self.config.flush_interval_ms,
            "Control loop started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.spawn_flush(FlushReason::Interval);
                }
                signal = source.next_signal() => match signal {
                    Some(signal) => self.dispatch_detached(signal),
                    None => break,
                },
                changed = identity.changed(), if identity_open => match changed {
                    Ok(()) => {
                        let next = identity.borrow_and_update().clone();
                        self.dispatch_detached(LifecycleSignal::IdentityChanged(next));
                    }
                    Err(_) => {
                        debug!("Identity provider closed");
                        identity_open = false;
                    }
                },
            }
        }

        debug!("Lifecycle source closed; control loop stopped");
    }

    fn dispatch_detached(self: &Arc<Self>, signal: LifecycleSignal) {
        if let Some(reason) = self.apply_signal(signal) {
            self.spawn_flush(reason);
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("identity", &self.identity)
            .field("sampling", &self.sampling)
            .field("queued", &self.queue_len())
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::sink::MemorySink;

    fn enabled_config() -> PipelineConfig {
        PipelineConfig {
            enabled: true,
            max_queue_size: 3,
            ..PipelineConfig::default()
        }
    }

    fn pipeline(sink: MemorySink) -> Arc<Pipeline> {
        Pipeline::builder(enabled_config())
            .with_clock(Arc::new(ManualClock::new(1_000)))
            .with_sink(Arc::new(sink))
            .with_roll(Box::new(|| 0.0))
            .build()
            .unwrap()
    }

    fn custom(name: &str) -> EventPayload {
        EventPayload::Custom {
            name: name.to_string(),
            data: serde_json::Map::new(),
        }
    }

    #[test]
    fn build_without_sink_or_endpoint_fails() {
        let err = Pipeline::builder(enabled_config()).build().unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Config(ConfigError::InvalidValue {
                field: "sink.endpoint",
                ..
            })
        ));
    }

    #[test]
    fn build_rejects_invalid_config() {
        let config = PipelineConfig {
            max_queue_size: 0,
            ..enabled_config()
        };
        assert!(
            Pipeline::builder(config)
                .with_sink(Arc::new(MemorySink::new()))
                .build()
                .is_err()
        );
    }

    #[test]
    fn enqueue_requires_identity() {
        let p = pipeline(MemorySink::new());
        assert!(!p.enqueue(custom("x")));
        assert_eq!(p.queue_len(), 0);
        assert_eq!(p.stats().dropped_gated, 1);

        p.identity().set_identity(Some(UserIdentity::new("u1")));
        assert!(p.enqueue(custom("x")));
        let events = p.pending_events();
        assert_eq!(events[0].uid.as_deref(), Some("u1"));
        assert_eq!(events[0].path, "/");
        assert_eq!(events[0].ts, 1_000);
    }

    #[test]
    fn enqueue_respects_bound() {
        let p = pipeline(MemorySink::new());
        p.identity().set_identity(Some(UserIdentity::new("u1")));
        for name in ["e1", "e2", "e3", "e4", "e5"] {
            p.enqueue(custom(name));
        }
        let kinds: Vec<String> = p
            .pending_events()
            .iter()
            .map(|e| e.type_tag().to_string())
            .collect();
        assert_eq!(kinds, vec!["e3", "e4", "e5"]);
        let stats = p.stats();
        assert_eq!(stats.enqueued, 5);
        assert_eq!(stats.evicted, 2);
        assert_eq!(stats.queued, 3);
    }

    #[test]
    fn disabled_session_drops_everything() {
        let p = Pipeline::builder(PipelineConfig::default())
            .with_sink(Arc::new(MemorySink::new()))
            .build()
            .unwrap();
        p.identity().set_identity(Some(UserIdentity::new("u1")));
        assert!(!p.is_enabled());
        assert!(!p.enqueue(custom("x")));
    }

    #[tokio::test]
    async fn flush_records_stats() {
        let sink = MemorySink::new();
        let p = pipeline(sink.clone());
        p.identity().set_identity(Some(UserIdentity::new("u1")));
        assert_eq!(p.flush(FlushReason::Manual).await, FlushOutcome::Empty);

        p.enqueue(custom("x"));
        let outcome = p.flush(FlushReason::Manual).await;
        assert_eq!(outcome, FlushOutcome::Committed { events: 1 });
        let stats = p.stats();
        assert_eq!(stats.flushes_committed, 1);
        assert_eq!(stats.events_committed, 1);
        assert_eq!(stats.last_flush_reason, Some(FlushReason::Manual));
        assert_eq!(sink.commits(), 1);
    }

    #[tokio::test]
    async fn spawned_flush_completes() {
        let sink = MemorySink::new();
        let p = pipeline(sink.clone());
        p.identity().set_identity(Some(UserIdentity::new("u1")));
        p.enqueue(custom("x"));
        let outcome = p
            .spawn_flush(FlushReason::Interval)
            .unwrap()
            .await
            .unwrap();
        assert!(outcome.is_committed());
    }

    #[test]
    fn spawn_flush_outside_runtime_is_a_no_op() {
        let p = pipeline(MemorySink::new());
        p.identity().set_identity(Some(UserIdentity::new("u1")));
        p.enqueue(custom("x"));
        assert!(p.spawn_flush(FlushReason::Manual).is_none());
        assert_eq!(p.queue_len(), 1);
    }
}
