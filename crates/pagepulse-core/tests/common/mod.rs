//! Shared test infrastructure for pagepulse-core integration tests.
//!
//! Import from integration test files with:
//! ```ignore
//! mod common;
//! use common::Harness;
//! ```

#![allow(dead_code)]

use std::sync::Arc;

use pagepulse_core::clock::ManualClock;
use pagepulse_core::session::MemorySessionStore;
use pagepulse_core::{
    EventPayload, EventSink, PageInfo, Pipeline, PipelineConfig, UserIdentity,
};

pub const START_MS: u64 = 1_700_000_000_000;

/// A pipeline wired to a manual clock, an in-memory store and a sink.
pub struct Harness {
    pub pipeline: Arc<Pipeline>,
    pub clock: ManualClock,
    pub store: MemorySessionStore,
}

impl Harness {
    pub fn new(sink: impl EventSink + 'static) -> Self {
        Self::with_config(sink, enabled_config(200))
    }

    pub fn with_config(sink: impl EventSink + 'static, config: PipelineConfig) -> Self {
        Self::with_store(sink, config, MemorySessionStore::new())
    }

    pub fn with_store(
        sink: impl EventSink + 'static,
        config: PipelineConfig,
        store: MemorySessionStore,
    ) -> Self {
        let clock = ManualClock::new(START_MS);
        let pipeline = Pipeline::builder(config)
            .with_clock(Arc::new(clock.clone()))
            .with_session_store(Arc::new(store.clone()))
            .with_sink(Arc::new(sink))
            .with_roll(Box::new(|| 0.0))
            .with_page(PageInfo {
                path: "/a".to_string(),
                ..PageInfo::default()
            })
            .build()
            .expect("pipeline builds");
        Self {
            pipeline,
            clock,
            store,
        }
    }

    pub fn sign_in(&self, uid: &str) {
        self.pipeline
            .identity()
            .set_identity(Some(UserIdentity::new(uid)));
    }

    pub fn session_id(&self) -> String {
        self.pipeline
            .identity()
            .session_id()
            .expect("session id")
    }

    pub fn track(&self, name: &str) -> bool {
        self.pipeline.enqueue(custom(name))
    }

    pub fn pending_kinds(&self) -> Vec<String> {
        self.pipeline
            .pending_events()
            .iter()
            .map(|event| event.type_tag().to_string())
            .collect()
    }
}

pub fn enabled_config(max_queue_size: usize) -> PipelineConfig {
    PipelineConfig {
        enabled: true,
        max_queue_size,
        ..PipelineConfig::default()
    }
}

pub fn custom(name: &str) -> EventPayload {
    EventPayload::Custom {
        name: name.to_string(),
        data: serde_json::Map::new(),
    }
}
