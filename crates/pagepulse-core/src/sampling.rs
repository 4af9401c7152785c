//! Session-scoped sampling decision.
//!
//! The first query rolls once (`enabled && roll < clamp(sample_rate, 0, 1)`)
//! and persists the answer in the session store; every later query in the
//! same session returns the stored answer. A session is never re-rolled.

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::session::SessionStore;

pub(crate) const SAMPLED_KEY: &str = "pagepulse.sampled";

/// Uniform roll in [0, 1).
pub type RollFn = Box<dyn FnMut() -> f64 + Send>;

pub struct SamplingGate {
    global_flag: bool,
    sample_rate: f64,
    store: Arc<dyn SessionStore>,
    roll: Mutex<RollFn>,
    // Held so a store that refuses writes still yields a stable answer.
    decided: Mutex<Option<bool>>,
}

impl SamplingGate {
    #[must_use]
    pub fn new(global_flag: bool, sample_rate: f64, store: Arc<dyn SessionStore>) -> Self {
        Self::with_roll(
            global_flag,
            sample_rate,
            store,
            Box::new(|| rand::random::<f64>()),
        )
    }

    #[must_use]
    pub fn with_roll(
        global_flag: bool,
        sample_rate: f64,
        store: Arc<dyn SessionStore>,
        roll: RollFn,
    ) -> Self {
        Self {
            global_flag,
            sample_rate: clamp_rate(sample_rate),
            store,
            roll: Mutex::new(roll),
            decided: Mutex::new(None),
        }
    }

    /// The session's sampling decision, rolled at most once.
    pub fn is_enabled(&self) -> bool {
        let Ok(mut decided) = self.decided.lock() else {
            return false;
        };
        if let Some(decision) = *decided {
            return decision;
        }
        if let Some(stored) = self.store.get(SAMPLED_KEY) {
            let decision = stored == "1";
            *decided = Some(decision);
            return decision;
        }

        let decision = self.global_flag && self.roll_once() < self.sample_rate;
        if let Err(err) = self.store.set(SAMPLED_KEY, if decision { "1" } else { "0" }) {
            warn!(error = %err, "Sampling decision could not be persisted");
        }
        debug!(
            enabled = decision,
            sample_rate = self.sample_rate,
            "Sampling decision made"
        );
        *decided = Some(decision);
        decision
    }

    fn roll_once(&self) -> f64 {
        self.roll.lock().map(|mut roll| roll()).unwrap_or(1.0)
    }
}

impl std::fmt::Debug for SamplingGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SamplingGate")
            .field("global_flag", &self.global_flag)
            .field("sample_rate", &self.sample_rate)
            .finish_non_exhaustive()
    }
}

fn clamp_rate(rate: f64) -> f64 {
    if rate.is_finite() {
        rate.clamp(0.0, 1.0)
    } else {
        0.0
    }
}
