// Launch Bookkeeping
//
// One record per identity for the most recent launch. Running time is
// measured from the launch instant.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::launch::collaborator::LaunchMethod;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchRecord {
    pub identity: String,
    pub server_target: String,
    pub launched_at: DateTime<Utc>,
    pub method: LaunchMethod,
    pub external_handle: Option<String>,
    pub verified: bool,
}

impl LaunchRecord {
    pub fn running_time(&self) -> chrono::Duration {
        Utc::now().signed_duration_since(self.launched_at)
    }
}

#[derive(Debug, Default)]
pub struct LaunchLog {
    records: Mutex<HashMap<String, LaunchRecord>>,
}

impl LaunchLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, HashMap<String, LaunchRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store `record`, replacing any earlier launch of the same identity
    pub fn record(&self, record: LaunchRecord) {
        self.records().insert(record.identity.clone(), record);
    }

    pub fn get(&self, identity: &str) -> Option<LaunchRecord> {
        self.records().get(identity).cloned()
    }

    /// All records, oldest launch first
    pub fn all(&self) -> Vec<LaunchRecord> {
        let mut records: Vec<LaunchRecord> = self.records().values().cloned().collect();
        records.sort_by_key(|r| r.launched_at);
        records
    }

    pub fn running_times(&self) -> Vec<(String, chrono::Duration)> {
        self.all()
            .into_iter()
            .map(|r| {
                let running = r.running_time();
                (r.identity, running)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    /// Forget all launches; returns how many were dropped
    pub fn clear(&self) -> usize {
        let mut records = self.records();
        let dropped = records.len();
        records.clear();
        dropped
    }
}
