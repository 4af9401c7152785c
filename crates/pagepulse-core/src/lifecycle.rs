//! Host page-lifecycle signals and their translation into queue entries and
//! flush triggers.
//!
//! The host (browser shell, webview bridge, test harness) reports what
//! happens to the page as [`LifecycleSignal`] values through a
//! [`LifecycleSource`]. [`Pipeline::apply_signal`] turns each one into
//! events and, where the signal warrants it, a flush reason; the control
//! loop spawns that flush.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::dwell::DwellTimer;
use crate::event::{EventPayload, FlushReason};
use crate::pipeline::Pipeline;
use crate::scheduler::FlushOutcome;
use crate::session::{IdentityTransition, UserIdentity};

/// Attribute that opts an element into click tracking. Its value names the
/// click.
pub const TRACK_ATTRIBUTE: &str = "data-track";

// =============================================================================
// Signals
// =============================================================================

/// One element on the path from a click target up to the document root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClickTarget {
    pub tag: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl ClickTarget {
    #[must_use]
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attributes: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    fn is_anchor(&self) -> bool {
        self.tag.eq_ignore_ascii_case("a")
    }
}

/// Location data for runtime errors and unhandled rejections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub message: String,
    pub filename: Option<String>,
    pub lineno: Option<u32>,
    pub colno: Option<u32>,
}

impl ErrorReport {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Visible,
    Hidden,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleSignal {
    /// A click; `path` runs from the target element up to the root.
    Click { path: Vec<ClickTarget> },
    RuntimeError(ErrorReport),
    UnhandledRejection(ErrorReport),
    VisibilityChanged(Visibility),
    RouteChanged { from: String, to: String },
    /// The page is being torn down or hidden for good.
    PageHide,
    IdentityChanged(Option<UserIdentity>),
}

// =============================================================================
// Sources
// =============================================================================

/// Where lifecycle signals come from. `None` means the page is gone.
#[async_trait]
pub trait LifecycleSource: Send {
    async fn next_signal(&mut self) -> Option<LifecycleSignal>;
}

/// [`LifecycleSource`] fed through a tokio channel.
#[derive(Debug)]
pub struct ChannelSource {
    rx: mpsc::Receiver<LifecycleSignal>,
}

impl ChannelSource {
    /// Source plus the sender the host pushes signals into.
    #[must_use]
    pub fn new(buffer: usize) -> (mpsc::Sender<LifecycleSignal>, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (tx, Self { rx })
    }
}

#[async_trait]
impl LifecycleSource for ChannelSource {
    async fn next_signal(&mut self) -> Option<LifecycleSignal> {
        self.rx.recv().await
    }
}

// =============================================================================
// Translation
// =============================================================================

impl Pipeline {
    /// Apply one signal. Returns the reason for the flush it triggers, if
    /// any; the caller decides whether to await or spawn it.
    pub fn apply_signal(&self, signal: LifecycleSignal) -> Option<FlushReason> {
        match signal {
            LifecycleSignal::Click { path } => {
                if let Some(payload) = click_payload(&path) {
                    self.enqueue(payload);
                }
                None
            }
            LifecycleSignal::RuntimeError(report) => {
                self.enqueue(EventPayload::Error {
                    message: report.message,
                    filename: report.filename,
                    lineno: report.lineno,
                    colno: report.colno,
                });
                Some(FlushReason::Error)
            }
            LifecycleSignal::UnhandledRejection(report) => {
                self.enqueue(EventPayload::UnhandledRejection {
                    message: report.message,
                    filename: report.filename,
                    lineno: report.lineno,
                    colno: report.colno,
                });
                Some(FlushReason::UnhandledRejection)
            }
            LifecycleSignal::VisibilityChanged(Visibility::Visible) => {
                self.with_dwell(DwellTimer::on_visible);
                None
            }
            // Often the last signal a backgrounded tab gets before it is killed.
            LifecycleSignal::VisibilityChanged(Visibility::Hidden) => {
                self.with_dwell(DwellTimer::on_hidden);
                Some(FlushReason::Pagehide)
            }
            LifecycleSignal::RouteChanged { from, to } => self.route_changed(from, to),
            LifecycleSignal::PageHide => self.page_hidden(),
            LifecycleSignal::IdentityChanged(next) => self.identity_changed(next),
        }
    }

    /// Apply one signal and await the flush it triggers.
    pub async fn dispatch(&self, signal: LifecycleSignal) -> Option<FlushOutcome> {
        let reason = self.apply_signal(signal)?;
        Some(self.flush(reason).await)
    }

    fn route_changed(&self, from: String, to: String) -> Option<FlushReason> {
        if from == to {
            return None;
        }
        let (visible_ms, total_ms) = self
            .with_dwell(|dwell, now| (dwell.snapshot_and_reset(now), dwell.begin_page(now)))
            .unwrap_or((0, 0));
        debug!(from = %from, to = %to, visible_ms, total_ms, "Route changed");

        self.set_current_path(&from);
        self.enqueue(EventPayload::PageTime {
            from_path: from.clone(),
            to_path: Some(to.clone()),
            visible_ms,
            total_ms,
        });
        self.enqueue(EventPayload::PageView {
            from_path: from,
            to_path: to.clone(),
        });
        self.set_current_path(&to);
        Some(FlushReason::RouteChange)
    }

    fn page_hidden(&self) -> Option<FlushReason> {
        let (visible_ms, total_ms) = self
            .with_dwell(|dwell, now| {
                let visible = dwell.snapshot_and_reset(now);
                dwell.on_hidden(now);
                (visible, dwell.begin_page(now))
            })
            .unwrap_or((0, 0));
        let path = self.current_path();
        self.enqueue(EventPayload::PageTime {
            from_path: path.clone(),
            to_path: None,
            visible_ms,
            total_ms,
        });
        let persisted = self.persist_outbox();
        debug!(path = %path, visible_ms, total_ms, persisted, "Page hidden");
        Some(FlushReason::Pagehide)
    }

    fn identity_changed(&self, next: Option<UserIdentity>) -> Option<FlushReason> {
        let uid = next.as_ref().map(|user| user.uid.clone());
        match self.identity().set_identity(next) {
            IdentityTransition::Resolved => {
                debug!(uid = ?uid, "Identity resolved");
                self.enqueue(self.session_start_payload());
                Some(FlushReason::SessionStart)
            }
            IdentityTransition::Changed => {
                debug!(uid = ?uid, "Identity changed");
                None
            }
            IdentityTransition::SignedOut => {
                debug!("Identity signed out");
                None
            }
            IdentityTransition::Unchanged => None,
        }
    }
}

/// The `click` payload for the nearest opted-in element, if any.
fn click_payload(path: &[ClickTarget]) -> Option<EventPayload> {
    let (index, target) = path
        .iter()
        .enumerate()
        .find(|(_, el)| el.attributes.contains_key(TRACK_ATTRIBUTE))?;
    let tag = target.tag.to_ascii_lowercase();
    let name = target
        .attributes
        .get(TRACK_ATTRIBUTE)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map_or_else(|| tag.clone(), str::to_string);
    // The link may be the marked element or one of its ancestors.
    let href = path[index..]
        .iter()
        .find(|el| el.is_anchor())
        .and_then(|el| el.attributes.get("href").cloned());
    Some(EventPayload::Click { name, tag, href })
}
