//! Manual instrumentation from application code.
//!
//! [`InstrumentationHandle`] is a cheap clone of the pipeline for code that
//! wants to record its own events or force a flush. One handle can be
//! installed process-wide; the slot is filled at most once, and only for an
//! enabled session, so `global()` is `None` whenever telemetry is off.

use std::sync::{Arc, OnceLock};

use serde_json::{Map, Value};

use crate::event::{EventPayload, FlushReason};
use crate::pipeline::Pipeline;
use crate::scheduler::FlushOutcome;

static GLOBAL: OnceLock<InstrumentationHandle> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct InstrumentationHandle {
    pipeline: Arc<Pipeline>,
}

impl InstrumentationHandle {
    /// Handle for `pipeline`, or `None` if the session is sampled out.
    #[must_use]
    pub fn for_pipeline(pipeline: &Arc<Pipeline>) -> Option<Self> {
        pipeline.is_enabled().then(|| Self {
            pipeline: Arc::clone(pipeline),
        })
    }

    /// Queue a custom event. Returns whether it was queued.
    pub fn track(&self, kind: impl Into<String>, data: Map<String, Value>) -> bool {
        self.pipeline.enqueue(EventPayload::Custom {
            name: kind.into(),
            data,
        })
    }

    /// Flush now with reason `manual`.
    pub async fn flush(&self) -> FlushOutcome {
        self.pipeline.flush(FlushReason::Manual).await
    }

    /// Start a `manual` flush without waiting for it.
    ///
    /// Returns false when called outside a tokio runtime.
    pub fn flush_detached(&self) -> bool {
        self.pipeline.spawn_flush(FlushReason::Manual).is_some()
    }

    #[must_use]
    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }
}

/// Install the process-wide handle for `pipeline` if none is installed yet.
///
/// A sampled-out `pipeline` always gets `None`, even when an earlier
/// pipeline already filled the slot. Otherwise the returned handle belongs to
/// the first enabled pipeline ever installed and is kept for the life of the
/// process; later enabled pipelines share it.
pub fn install_global(pipeline: &Arc<Pipeline>) -> Option<&'static InstrumentationHandle> {
    let handle = InstrumentationHandle::for_pipeline(pipeline)?;
    Some(GLOBAL.get_or_init(|| handle))
}

/// The process-wide handle, if one was installed.
#[must_use]
pub fn global() -> Option<&'static InstrumentationHandle> {
    GLOBAL.get()
}
