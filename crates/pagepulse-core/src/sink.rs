//! Persistence sinks.
//!
//! A flush commits one [`FlushBatch`]: an upsert-with-merge of
//! `sessions/{session_id}` plus one insert per event under
//! `sessions/{session_id}/events/{auto_id}`. A sink must apply the batch as
//! a unit; on `Err` nothing of it may be visible.
//!
//! - [`MemorySink`]: in-process document store with failure injection
//! - [`HttpSink`]: posts the batch as JSON to a collector endpoint

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Notify;
use tracing::debug;

use crate::error::SinkError;
use crate::event::{Event, FlushReason};

// =============================================================================
// Batch
// =============================================================================

/// Session document written with merge semantics on every flush.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub uid: Option<String>,
    pub last_flush_reason: FlushReason,
    /// Freshness timestamp of the last flush
    pub updated_at: DateTime<Utc>,
}

/// One event document with its generated id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDocument {
    pub id: String,
    pub data: Value,
}

/// Everything one flush writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlushBatch {
    pub session: SessionRecord,
    pub events: Vec<EventDocument>,
}

impl FlushBatch {
    /// Build the batch for `events`.
    ///
    /// Fails only if a timestamp or an event cannot be encoded; the caller
    /// treats that like a failed commit.
    pub fn build(
        session_id: &str,
        uid: Option<String>,
        reason: FlushReason,
        now_ms: u64,
        events: &[Event],
    ) -> Result<Self, SinkError> {
        let updated_at = i64::try_from(now_ms)
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .ok_or_else(|| SinkError::Encode(format!("timestamp {now_ms} out of range")))?;

        let events = events
            .iter()
            .map(|event| {
                Ok(EventDocument {
                    id: uuid::Uuid::new_v4().simple().to_string(),
                    data: event.to_document()?,
                })
            })
            .collect::<Result<Vec<_>, SinkError>>()?;

        Ok(Self {
            session: SessionRecord {
                session_id: session_id.to_string(),
                uid,
                last_flush_reason: reason,
                updated_at,
            },
            events,
        })
    }

    #[must_use]
    pub fn session_path(&self) -> String {
        format!("sessions/{}", self.session.session_id)
    }

    #[must_use]
    pub fn event_path(&self, doc: &EventDocument) -> String {
        format!("sessions/{}/events/{}", self.session.session_id, doc.id)
    }
}

// =============================================================================
// Sink trait
// =============================================================================

/// Atomic batched write to remote persistence.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn commit(&self, batch: &FlushBatch) -> Result<(), SinkError>;
}

// =============================================================================
// MemorySink
// =============================================================================

#[derive(Debug, Default)]
struct MemorySinkState {
    documents: BTreeMap<String, Map<String, Value>>,
    commits: u64,
    attempts: u64,
    fail_next: u32,
    fail_always: bool,
    panic_next: bool,
}

/// In-process document store keyed by path.
///
/// Clones share state. Failure injection (`fail_next`, `fail_always`,
/// `panic_next`) and `paused` make it usable as a test double for the
/// remote sink.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<MemorySinkState>>,
    gate: Option<Arc<Notify>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose commits wait until the returned `Notify` is signalled
    /// once per commit.
    #[must_use]
    pub fn paused() -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let sink = Self {
            state: Arc::default(),
            gate: Some(Arc::clone(&gate)),
        };
        (sink, gate)
    }

    /// Fail the next `n` commits.
    pub fn fail_next(&self, n: u32) {
        self.with_state(|state| state.fail_next = n);
    }

    /// Fail every commit until switched off.
    pub fn fail_always(&self, fail: bool) {
        self.with_state(|state| state.fail_always = fail);
    }

    /// Panic inside the next commit.
    pub fn panic_next(&self) {
        self.with_state(|state| state.panic_next = true);
    }

    /// Successful commits so far.
    #[must_use]
    pub fn commits(&self) -> u64 {
        self.with_state(|state| state.commits)
    }

    /// Commit calls so far, including failed ones.
    #[must_use]
    pub fn attempts(&self) -> u64 {
        self.with_state(|state| state.attempts)
    }

    /// Stored document at `path`.
    #[must_use]
    pub fn document(&self, path: &str) -> Option<Map<String, Value>> {
        self.with_state(|state| state.documents.get(path).cloned())
    }

    /// Event documents of a session, ordered by capture time.
    #[must_use]
    pub fn events(&self, session_id: &str) -> Vec<Map<String, Value>> {
        let prefix = format!("sessions/{session_id}/events/");
        let mut events: Vec<(u64, u64, Map<String, Value>)> = self.with_state(|state| {
            state
                .documents
                .iter()
                .filter(|(path, _)| path.starts_with(&prefix))
                .map(|(_, doc)| {
                    let ts = doc.get("ts").and_then(Value::as_u64).unwrap_or(0);
                    let seq = doc.get("_seq").and_then(Value::as_u64).unwrap_or(0);
                    (ts, seq, doc.clone())
                })
                .collect()
        });
        events.sort_by_key(|(ts, seq, _)| (*ts, *seq));
        events
            .into_iter()
            .map(|(_, _, mut doc)| {
                doc.remove("_seq");
                doc
            })
            .collect()
    }

    /// Event `type` tags of a session in capture order.
    #[must_use]
    pub fn event_types(&self, session_id: &str) -> Vec<String> {
        self.events(session_id)
            .iter()
            .filter_map(|doc| doc.get("type").and_then(Value::as_str).map(String::from))
            .collect()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MemorySinkState) -> R) -> R {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state)
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn commit(&self, batch: &FlushBatch) -> Result<(), SinkError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        let should_panic = self.with_state(|state| {
            state.attempts += 1;
            std::mem::take(&mut state.panic_next)
        });
        if should_panic {
            panic!("injected sink panic");
        }

        let session_fields = match serde_json::to_value(&batch.session)? {
            Value::Object(fields) => fields,
            other => {
                return Err(SinkError::Encode(format!(
                    "session record encoded as {other}"
                )));
            }
        };

        self.with_state(|state| {
            if state.fail_always {
                return Err(SinkError::Transport("injected failure".to_string()));
            }
            if state.fail_next > 0 {
                state.fail_next -= 1;
                return Err(SinkError::Transport("injected failure".to_string()));
            }

            let session = state.documents.entry(batch.session_path()).or_default();
            for (key, value) in session_fields {
                session.insert(key, value);
            }

            let base = state.documents.len() as u64;
            for (seq, doc) in batch.events.iter().enumerate() {
                let mut fields = match &doc.data {
                    Value::Object(fields) => fields.clone(),
                    other => {
                        let mut wrapped = Map::new();
                        wrapped.insert("value".to_string(), other.clone());
                        wrapped
                    }
                };
                fields.insert("_seq".to_string(), Value::from(base + seq as u64));
                state.documents.insert(batch.event_path(doc), fields);
            }
            state.commits += 1;
            Ok(())
        })?;

        debug!(
            session_id = %batch.session.session_id,
            events = batch.events.len(),
            "Batch committed to memory sink"
        );
        Ok(())
    }
}

// =============================================================================
// HttpSink
// =============================================================================

const COMMIT_SUFFIX: &str = ":commit";

/// Posts each batch to `{endpoint}/sessions/{session_id}:commit`.
///
/// The collector is expected to apply the request atomically and answer
/// 2xx only when it did.
#[derive(Debug, Clone)]
pub struct HttpSink {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Debug, Serialize)]
struct WireCommit<'a> {
    session: &'a SessionRecord,
    merge: bool,
    events: &'a [EventDocument],
}

impl HttpSink {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, SinkError> {
        let endpoint = endpoint.into();
        if endpoint.trim().is_empty() {
            return Err(SinkError::Rejected(
                "sink endpoint must not be empty".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| SinkError::Transport(format!("http client build failed: {err}")))?;
        Ok(Self { client, endpoint })
    }

    #[must_use]
    pub fn commit_url(&self, session_id: &str) -> String {
        format!(
            "{}/sessions/{session_id}{COMMIT_SUFFIX}",
            self.endpoint.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl EventSink for HttpSink {
    async fn commit(&self, batch: &FlushBatch) -> Result<(), SinkError> {
        let body = WireCommit {
            session: &batch.session,
            merge: true,
            events: &batch.events,
        };
        let response = self
            .client
            .post(self.commit_url(&batch.session.session_id))
            .json(&body)
            .send()
            .await
            .map_err(|err| SinkError::Transport(format!("commit request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Status {
                status: status.as_u16(),
                body,
            });
        }
        debug!(
            session_id = %batch.session.session_id,
            events = batch.events.len(),
            status = status.as_u16(),
            "Batch committed over HTTP"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventPayload;

    fn click(ts: u64, name: &str) -> Event {
        Event::new(
            "/home",
            ts,
            EventPayload::Click {
                name: name.to_string(),
                tag: "button".to_string(),
                href: None,
            },
        )
    }

    #[test]
    fn batch_has_one_document_per_event() {
        let events = vec![click(1, "a"), click(2, "b")];
        let batch =
            FlushBatch::build("s1", Some("u1".into()), FlushReason::Manual, 1_000, &events)
                .unwrap();
        assert_eq!(batch.events.len(), 2);
        assert_ne!(batch.events[0].id, batch.events[1].id);
        assert_eq!(batch.session_path(), "sessions/s1");
        assert!(
            batch
                .event_path(&batch.events[0])
                .starts_with("sessions/s1/events/")
        );
        assert_eq!(batch.session.updated_at.timestamp_millis(), 1_000);
        assert_eq!(batch.events[1].data["name"], "b");
    }

    #[test]
    fn out_of_range_timestamp_fails_build() {
        let err = FlushBatch::build("s1", None, FlushReason::Interval, u64::MAX, &[]).unwrap_err();
        assert!(matches!(err, SinkError::Encode(_)));
    }

    #[tokio::test]
    async fn memory_sink_merges_session_and_stores_events() {
        let sink = MemorySink::new();
        let first =
            FlushBatch::build("s1", None, FlushReason::SessionStart, 10, &[click(1, "a")]).unwrap();
        sink.commit(&first).await.unwrap();
        let second =
            FlushBatch::build("s1", Some("u1".into()), FlushReason::Interval, 20, &[click(2, "b")])
                .unwrap();
        sink.commit(&second).await.unwrap();

        let session = sink.document("sessions/s1").unwrap();
        assert_eq!(session["last_flush_reason"], "interval");
        assert_eq!(session["uid"], "u1");
        assert_eq!(sink.events("s1").len(), 2);
        assert_eq!(sink.commits(), 2);
    }

    #[tokio::test]
    async fn memory_sink_failure_writes_nothing() {
        let sink = MemorySink::new();
        sink.fail_next(1);
        let batch =
            FlushBatch::build("s1", None, FlushReason::Manual, 10, &[click(1, "a")]).unwrap();
        assert!(sink.commit(&batch).await.is_err());
        assert!(sink.document("sessions/s1").is_none());
        assert!(sink.events("s1").is_empty());
        assert_eq!(sink.attempts(), 1);
        assert_eq!(sink.commits(), 0);

        sink.commit(&batch).await.unwrap();
        assert_eq!(sink.events("s1").len(), 1);
    }

    #[test]
    fn http_sink_url() {
        let sink = HttpSink::new("https://collector.example.com/", Duration::from_secs(1)).unwrap();
        assert_eq!(
            sink.commit_url("abc"),
            "https://collector.example.com/sessions/abc:commit"
        );
        assert!(HttpSink::new(" ", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn wire_commit_shape() {
        let batch =
            FlushBatch::build("s1", None, FlushReason::Pagehide, 5, &[click(1, "a")]).unwrap();
        let wire = WireCommit {
            session: &batch.session,
            merge: true,
            events: &batch.events,
        };
        let value = serde_json::to_value(&wire).unwrap();
        assert_eq!(value["merge"], true);
        assert_eq!(value["session"]["last_flush_reason"], "pagehide");
        assert_eq!(value["events"][0]["data"]["type"], "click");
    }
}
