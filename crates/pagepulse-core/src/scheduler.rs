//! Flush scheduling.
//!
//! Any number of independent triggers (interval ticks, errors, navigation,
//! teardown, manual requests) funnel into [`FlushScheduler::trigger`]. At
//! most one attempt is in flight; a trigger that arrives meanwhile is
//! dropped, not queued, and whatever it would have sent goes out with the
//! next trigger.
//!
//! An attempt drains the queue, commits one batch, and on any failure puts
//! the drained events back at the front of the queue. Nothing is ever
//! returned to the caller as an error.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, warn};
use tracing::Instrument;

use crate::error::SinkError;
use crate::event::FlushReason;
use crate::pipeline::Pipeline;
use crate::sink::{EventSink, FlushBatch};

/// Why a trigger did not start an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Disabled,
    Unauthenticated,
    NoSession,
    InFlight,
}

/// Result of one `trigger` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Skipped(SkipReason),
    /// Nothing was queued.
    Empty,
    Committed {
        events: usize,
    },
    /// The commit failed and the drained events were restored.
    Failed {
        restored: usize,
        evicted: usize,
    },
}

impl FlushOutcome {
    #[must_use]
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }
}

/// Clears the in-flight flag on every exit path, unwinding included.
struct InFlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct FlushScheduler {
    sink: Arc<dyn EventSink>,
    in_flight: AtomicBool,
}

impl FlushScheduler {
    #[must_use]
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            in_flight: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    fn try_acquire(&self) -> Option<InFlightGuard<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlightGuard {
                flag: &self.in_flight,
            })
    }

    /// Run one flush attempt for `ctx`, or return at once when gated.
    pub async fn trigger(&self, ctx: &Pipeline, reason: FlushReason) -> FlushOutcome {
        if !ctx.is_enabled() {
            return FlushOutcome::Skipped(SkipReason::Disabled);
        }
        let Some(user) = ctx.identity().current_user() else {
            return FlushOutcome::Skipped(SkipReason::Unauthenticated);
        };
        let Some(session_id) = ctx.identity().session_id() else {
            return FlushOutcome::Skipped(SkipReason::NoSession);
        };
        let Some(_guard) = self.try_acquire() else {
            debug!(%reason, "Flush already in flight; trigger dropped");
            return FlushOutcome::Skipped(SkipReason::InFlight);
        };

        let drained = ctx.drain_queue();
        if drained.is_empty() {
            return FlushOutcome::Empty;
        }
        let count = drained.len();

        let span = info_span!("flush", session_id = %session_id, %reason, events = count);
        let result = match FlushBatch::build(
            &session_id,
            Some(user.uid),
            reason,
            ctx.now_ms(),
            &drained,
        ) {
            Ok(batch) => AssertUnwindSafe(self.sink.commit(&batch))
                .catch_unwind()
                .instrument(span)
                .await
                .unwrap_or_else(|_| Err(SinkError::Panicked)),
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => {
                debug!(session_id = %session_id, %reason, events = count, "Flush committed");
                FlushOutcome::Committed { events: count }
            }
            Err(err) => {
                let evicted = ctx.restore_queue(drained);
                warn!(
                    session_id = %session_id,
                    %reason,
                    events = count,
                    evicted,
                    transient = err.is_transient(),
                    error = %err,
                    "Flush failed; events restored"
                );
                FlushOutcome::Failed {
                    restored: count - evicted.min(count),
                    evicted,
                }
            }
        }
    }
}

impl std::fmt::Debug for FlushScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushScheduler")
            .field("in_flight", &self.is_in_flight())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_releases_flag() {
        let scheduler = FlushScheduler::new(Arc::new(crate::sink::MemorySink::new()));
        {
            let guard = scheduler.try_acquire();
            assert!(guard.is_some());
            assert!(scheduler.is_in_flight());
            assert!(scheduler.try_acquire().is_none());
        }
        assert!(!scheduler.is_in_flight());
    }

    #[test]
    fn guard_releases_on_unwind() {
        let scheduler = FlushScheduler::new(Arc::new(crate::sink::MemorySink::new()));
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let _guard = scheduler.try_acquire();
            panic!("boom");
        }));
        assert!(result.is_err());
        assert!(!scheduler.is_in_flight());
    }

    #[test]
    fn outcome_helpers() {
        assert!(FlushOutcome::Committed { events: 1 }.is_committed());
        assert!(!FlushOutcome::Empty.is_committed());
        assert!(
            !FlushOutcome::Failed {
                restored: 1,
                evicted: 0
            }
            .is_committed()
        );
    }
}
