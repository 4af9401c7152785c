//! Event vocabulary and flush reasons.
//!
//! An [`Event`] is immutable once built. Built-in kinds carry typed payloads;
//! application code adds its own kinds through [`EventPayload::Custom`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One observed occurrence queued for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Route at enqueue time
    pub path: String,
    /// Capture time, ms since the Unix epoch
    pub ts: u64,
    /// Identity resolved when the event was enqueued
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// Kind-specific payload. The serde tag doubles as the wire `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    SessionStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_agent: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        viewport: Option<Viewport>,
    },
    PageView {
        from_path: String,
        to_path: String,
    },
    PageTime {
        from_path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to_path: Option<String>,
        visible_ms: u64,
        total_ms: u64,
    },
    Click {
        name: String,
        tag: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        href: Option<String>,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lineno: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        colno: Option<u32>,
    },
    #[serde(rename = "unhandledrejection")]
    UnhandledRejection {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lineno: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        colno: Option<u32>,
    },
    Custom {
        name: String,
        #[serde(default)]
        data: Map<String, Value>,
    },
}

/// Viewport size reported with `session_start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl EventPayload {
    /// The `type` tag written to the sink. Custom events use their own name.
    #[must_use]
    pub fn type_tag(&self) -> &str {
        match self {
            Self::SessionStart { .. } => "session_start",
            Self::PageView { .. } => "page_view",
            Self::PageTime { .. } => "page_time",
            Self::Click { .. } => "click",
            Self::Error { .. } => "error",
            Self::UnhandledRejection { .. } => "unhandledrejection",
            Self::Custom { name, .. } => name,
        }
    }
}

impl Event {
    #[must_use]
    pub fn new(path: impl Into<String>, ts: u64, payload: EventPayload) -> Self {
        Self {
            path: path.into(),
            ts,
            uid: None,
            payload,
        }
    }

    #[must_use]
    pub fn with_uid(mut self, uid: Option<String>) -> Self {
        self.uid = uid;
        self
    }

    #[must_use]
    pub fn type_tag(&self) -> &str {
        self.payload.type_tag()
    }

    /// Flat JSON document as stored under `sessions/{id}/events/{auto_id}`.
    ///
    /// Payload fields sit beside `type`, `path`, `ts` and `uid`. For custom
    /// events `type` is the caller's tag and `data` is merged in without
    /// overriding the envelope fields.
    pub fn to_document(&self) -> Result<Value, serde_json::Error> {
        let mut doc = Map::new();
        doc.insert("type".to_string(), Value::from(self.type_tag()));
        doc.insert("path".to_string(), Value::from(self.path.as_str()));
        doc.insert("ts".to_string(), Value::from(self.ts));
        if let Some(uid) = &self.uid {
            doc.insert("uid".to_string(), Value::from(uid.as_str()));
        }

        match &self.payload {
            EventPayload::Custom { data, .. } => {
                for (key, value) in data {
                    doc.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
            payload => {
                if let Value::Object(fields) = serde_json::to_value(payload)? {
                    for (key, value) in fields {
                        if key != "type" {
                            doc.insert(key, value);
                        }
                    }
                }
            }
        }
        Ok(Value::Object(doc))
    }
}

/// Why a flush attempt was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushReason {
    Interval,
    Error,
    #[serde(rename = "unhandledrejection")]
    UnhandledRejection,
    Pagehide,
    RouteChange,
    Manual,
    SessionStart,
}

impl FlushReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Interval => "interval",
            Self::Error => "error",
            Self::UnhandledRejection => "unhandledrejection",
            Self::Pagehide => "pagehide",
            Self::RouteChange => "route_change",
            Self::Manual => "manual",
            Self::SessionStart => "session_start",
        }
    }
}

impl std::fmt::Display for FlushReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn page_time_document_is_flat() {
        let event = Event::new(
            "/a",
            1_000,
            EventPayload::PageTime {
                from_path: "/a".to_string(),
                to_path: Some("/b".to_string()),
                visible_ms: 3_000,
                total_ms: 3_500,
            },
        )
        .with_uid(Some("u-1".to_string()));

        assert_eq!(
            event.to_document().unwrap(),
            json!({
                "type": "page_time",
                "path": "/a",
                "ts": 1_000,
                "uid": "u-1",
                "from_path": "/a",
                "to_path": "/b",
                "visible_ms": 3_000,
                "total_ms": 3_500,
            })
        );
    }

    #[test]
    fn custom_document_uses_caller_tag() {
        let mut data = Map::new();
        data.insert("plan".to_string(), json!("pro"));
        data.insert("type".to_string(), json!("spoofed"));
        let event = Event::new(
            "/pricing",
            5,
            EventPayload::Custom {
                name: "upgrade_clicked".to_string(),
                data,
            },
        );

        let doc = event.to_document().unwrap();
        assert_eq!(doc["type"], "upgrade_clicked");
        assert_eq!(doc["plan"], "pro");
        assert!(doc.get("uid").is_none());
    }

    #[test]
    fn rejection_tag_has_no_separator() {
        let payload = EventPayload::UnhandledRejection {
            message: "boom".to_string(),
            filename: None,
            lineno: None,
            colno: None,
        };
        assert_eq!(payload.type_tag(), "unhandledrejection");
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["type"], "unhandledrejection");
    }

    #[test]
    fn event_serde_keeps_payload() {
        let event = Event::new(
            "/docs",
            42,
            EventPayload::Click {
                name: "cta".to_string(),
                tag: "a".to_string(),
                href: Some("/signup".to_string()),
            },
        );
        let text = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn flush_reason_tags() {
        assert_eq!(FlushReason::RouteChange.to_string(), "route_change");
        assert_eq!(
            serde_json::to_value(FlushReason::UnhandledRejection).unwrap(),
            json!("unhandledrejection")
        );
        assert_eq!(
            serde_json::to_value(FlushReason::SessionStart).unwrap(),
            json!("session_start")
        );
    }
}
