//! Durable teardown outbox.
//!
//! A flush fired at teardown may never finish. When an outbox directory is
//! configured, teardown also writes the pending events to
//! `<dir>/<session_id>.json` synchronously; the next pipeline for the same
//! session takes them back with [`Outbox::take`]. Without a directory the
//! teardown loss window is accepted.
//!
//! Writes go to a temp file first and are renamed into place, so a reader
//! never sees a half-written outbox.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::OutboxError;
use crate::event::Event;

const OUTBOX_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct OutboxFile {
    version: u32,
    session_id: String,
    events: Vec<Event>,
}

#[derive(Debug, Clone)]
pub struct Outbox {
    dir: PathBuf,
}

impl Outbox {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize(session_id)))
    }

    /// Replace the session's outbox with `events`. An empty list removes it.
    pub fn store(&self, session_id: &str, events: &[Event]) -> Result<(), OutboxError> {
        let path = self.path_for(session_id);
        if events.is_empty() {
            return remove_if_present(&path);
        }

        let write_err = |source| OutboxError::Write {
            path: path.display().to_string(),
            source,
        };
        std::fs::create_dir_all(&self.dir).map_err(write_err)?;

        let file = OutboxFile {
            version: OUTBOX_VERSION,
            session_id: session_id.to_string(),
            events: events.to_vec(),
        };
        let bytes = serde_json::to_vec(&file).map_err(|err| OutboxError::Corrupt {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes).map_err(write_err)?;
        std::fs::rename(&tmp, &path).map_err(write_err)?;
        debug!(
            session_id,
            events = events.len(),
            path = %path.display(),
            "Outbox written"
        );
        Ok(())
    }

    /// Load and delete the session's outbox.
    ///
    /// A corrupt file is deleted and reported as `Corrupt`.
    pub fn take(&self, session_id: &str) -> Result<Vec<Event>, OutboxError> {
        let path = self.path_for(session_id);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(OutboxError::Read {
                    path: path.display().to_string(),
                    source,
                });
            }
        };

        let parsed = serde_json::from_slice::<OutboxFile>(&bytes);
        if let Err(err) = remove_if_present(&path) {
            warn!(error = %err, "Outbox could not be removed after read");
        }

        match parsed {
            Ok(file) if file.version == OUTBOX_VERSION && file.session_id == session_id => {
                Ok(file.events)
            }
            Ok(file) => Err(OutboxError::Corrupt {
                path: path.display().to_string(),
                message: format!(
                    "version {} for session {} does not match",
                    file.version, file.session_id
                ),
            }),
            Err(err) => Err(OutboxError::Corrupt {
                path: path.display().to_string(),
                message: err.to_string(),
            }),
        }
    }
}

fn remove_if_present(path: &Path) -> Result<(), OutboxError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(OutboxError::Write {
            path: path.display().to_string(),
            source,
        }),
    }
}

fn sanitize(session_id: &str) -> String {
    session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
