//! Short-lived store of archive requests behind opaque download links.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::descriptor::ArchiveRequest;

/// How long a link stays redeemable when no other TTL is configured.
pub const DEFAULT_LINK_TTL: Duration = Duration::from_secs(60);

struct Record {
    request: ArchiveRequest,
    expires_at: Instant,
}

/// Thread-safe map from link id to archive request.
///
/// Expired links are invisible to [`get`](Self::get) even before a sweep
/// removes them. Redeeming a link does not consume it.
pub struct LinkCache {
    ttl: Duration,
    records: Mutex<HashMap<String, Record>>,
}

impl Default for LinkCache {
    fn default() -> Self {
        Self::new(DEFAULT_LINK_TTL)
    }
}

impl LinkCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn records(&self) -> std::sync::MutexGuard<'_, HashMap<String, Record>> {
        // Records are replaced whole, so a poisoned map is still consistent.
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store `request` and return the id of a new link to it.
    pub fn insert(&self, request: ArchiveRequest) -> String {
        let id = Uuid::new_v4().to_string();
        let now = Instant::now();

        let mut records = self.records();
        records.retain(|_, record| record.expires_at > now);
        records.insert(
            id.clone(),
            Record {
                request,
                expires_at: now + self.ttl,
            },
        );
        debug!(link_id = %id, live = records.len(), "download link created");
        id
    }

    /// Look up a live link.
    pub fn get(&self, id: &str) -> Option<ArchiveRequest> {
        let now = Instant::now();
        let mut records = self.records();
        match records.get(id) {
            Some(record) if record.expires_at > now => Some(record.request.clone()),
            Some(_) => {
                records.remove(id);
                None
            }
            None => None,
        }
    }

    /// Drop every expired link, returning how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut records = self.records();
        let before = records.len();
        records.retain(|_, record| record.expires_at > now);
        before - records.len()
    }

    /// Number of stored links, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
