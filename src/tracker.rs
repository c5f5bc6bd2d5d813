//! TTL-keyed registry of in-flight alerts with transition classification.
//!
//! Each bulletin is classified against the table as a new alert, an update
//! with a strictly higher serial, a duplicate, or a stale replay. Replacing
//! an entry cancels its running intensity computation. Entries lapse one hour
//! after their publish time, or 120 seconds after origin time with no newer
//! revision, whichever comes first.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::eew::Alert;

/// Alert time-to-live from publish time, in seconds.
pub const ALERT_TTL_SECS: i64 = 3600;

/// Inactivity lift deadline past origin time, in seconds.
pub const INACTIVITY_LIFT_SECS: i64 = 120;

/// How one bulletin relates to the table state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Id not currently tracked
    New,
    /// Strictly higher serial than the tracked entry
    Update { previous_serial: u32 },
    /// Same serial as the tracked entry
    Duplicate,
    /// Lower serial, or a replay of an already lifted alert
    Stale,
}

/// Handle to an in-flight intensity computation.
#[derive(Debug)]
pub struct ComputeHandle {
    pub cancel: CancellationToken,
    pub task: JoinHandle<()>,
}

impl ComputeHandle {
    /// Cooperatively cancel, then abort the task outright.
    pub fn abort(&self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

#[derive(Debug)]
struct ActiveAlert {
    alert: Arc<Alert>,
    expire_at: DateTime<Utc>,
    lift_at: DateTime<Utc>,
    compute: ComputeHandle,
}

/// Replays of a lifted id at or below this serial stay silent.
#[derive(Debug, Clone, Copy)]
struct LiftedMark {
    serial: u32,
    forget_at: DateTime<Utc>,
}

/// The registry of active alerts. All access is serialized by the runtime's
/// single table mutex.
#[derive(Debug, Default)]
pub struct AlertTable {
    active: HashMap<String, ActiveAlert>,
    lifted: HashMap<String, LiftedMark>,
}

impl AlertTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify one incoming bulletin against the table.
    ///
    /// A tracked entry whose TTL has already passed is dropped here (evict on
    /// access); the fresh bulletin then starts a new sequence if its serial
    /// advanced.
    pub fn classify(&mut self, id: &str, serial: u32, now: DateTime<Utc>) -> Classification {
        self.prune_lifted(now);

        if let Some(mark) = self.lifted.get(id) {
            if serial <= mark.serial {
                return Classification::Stale;
            }
        }

        if self.active.get(id).is_some_and(|e| now >= e.expire_at) {
            if let Some(entry) = self.active.remove(id) {
                entry.compute.abort();
                let previous = entry.alert.serial;
                self.mark_lifted(id, previous, now);
                return if serial > previous {
                    Classification::New
                } else {
                    Classification::Stale
                };
            }
        }

        match self.active.get(id) {
            None => Classification::New,
            Some(entry) if serial > entry.alert.serial => Classification::Update {
                previous_serial: entry.alert.serial,
            },
            Some(entry) if serial == entry.alert.serial => Classification::Duplicate,
            Some(_) => Classification::Stale,
        }
    }

    /// Insert or replace the entry for this alert's id.
    ///
    /// A replaced entry has its computation cancelled first.
    pub fn insert(&mut self, alert: Arc<Alert>, compute: ComputeHandle) {
        let expire_at = alert.publish_time + TimeDelta::seconds(ALERT_TTL_SECS);
        let lift_at =
            alert.earthquake.origin_time + TimeDelta::seconds(INACTIVITY_LIFT_SECS);
        let id = alert.id.clone();

        if let Some(previous) = self.active.insert(
            id.clone(),
            ActiveAlert {
                alert,
                expire_at,
                lift_at,
                compute,
            },
        ) {
            previous.compute.abort();
        }
        self.lifted.remove(&id);
    }

    /// Remove and return the alert for `id`, cancelling its computation.
    ///
    /// The id is remembered so late replays at or below its serial are Stale.
    pub fn remove(&mut self, id: &str, now: DateTime<Utc>) -> Option<Arc<Alert>> {
        let entry = self.active.remove(id)?;
        entry.compute.abort();
        self.mark_lifted(id, entry.alert.serial, now);
        Some(entry.alert)
    }

    /// Drop every entry past its TTL or inactivity deadline, returning the
    /// lapsed alerts for lift dispatch.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Vec<Arc<Alert>> {
        self.prune_lifted(now);
        let lapsed: Vec<String> = self
            .active
            .iter()
            .filter(|(_, e)| now >= e.expire_at || now >= e.lift_at)
            .map(|(id, _)| id.clone())
            .collect();
        lapsed
            .into_iter()
            .filter_map(|id| self.remove(&id, now))
            .collect()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Arc<Alert>> {
        self.active.get(id).map(|e| &e.alert)
    }

    /// Ids of all tracked alerts, for the HTTP snapshot set-difference.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.active.keys().cloned().collect()
    }

    /// Cancel every outstanding computation (shutdown path).
    pub fn abort_all(&mut self) {
        for entry in self.active.values() {
            entry.compute.abort();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.active.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    fn mark_lifted(&mut self, id: &str, serial: u32, now: DateTime<Utc>) {
        self.lifted.insert(
            id.to_string(),
            LiftedMark {
                serial,
                forget_at: now + TimeDelta::seconds(ALERT_TTL_SECS),
            },
        );
    }

    fn prune_lifted(&mut self, now: DateTime<Utc>) {
        self.lifted.retain(|_, mark| now < mark.forget_at);
    }
}
