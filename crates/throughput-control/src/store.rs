//! Shared control record used to split a group's budget across client processes.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use error_stack::{Report, ResultExt};
use serde::{Deserialize, Serialize};

use crate::StoreError;

/// Schema version written and understood by this crate.
pub const CONTROL_RECORD_SCHEMA_VERSION: u32 = 1;

/// Heartbeat entry of one client process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientLease {
    pub client_id: String,
    pub last_heartbeat_ms: u64,
    pub expires_at_ms: u64,
}

impl ClientLease {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms <= now_ms
    }
}

/// Document shared by every instance controlling the same group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlRecord {
    pub schema_version: u32,
    pub group_name: String,
    pub total_throughput: f64,
    #[serde(default)]
    pub leases: BTreeMap<String, ClientLease>,
    /// Assigned by the store on every successful swap; not part of the document.
    #[serde(skip)]
    pub version: u64,
}

/// Leading part of every schema version of the record.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordHeader {
    schema_version: u32,
}

impl ControlRecord {
    /// Decodes a stored JSON document.
    ///
    /// The schema version is checked before the body is decoded, so a document
    /// of another version is reported as [`StoreError::UnsupportedSchema`] even
    /// when its layout no longer matches this one.
    pub fn from_json(body: &str) -> Result<Self, Report<StoreError>> {
        let header: RecordHeader =
            serde_json::from_str(body).change_context(StoreError::Malformed {
                reason: "missing or invalid schemaVersion".to_string(),
            })?;
        if header.schema_version != CONTROL_RECORD_SCHEMA_VERSION {
            return Err(Report::new(StoreError::UnsupportedSchema {
                found: header.schema_version,
            }));
        }
        serde_json::from_str(body).change_context(StoreError::Malformed {
            reason: format!("schema version {} body does not decode", header.schema_version),
        })
    }

    pub fn new(group_name: impl Into<String>, total_throughput: f64) -> Self {
        Self {
            schema_version: CONTROL_RECORD_SCHEMA_VERSION,
            group_name: group_name.into(),
            total_throughput,
            leases: BTreeMap::new(),
            version: 0,
        }
    }

    /// Drops leases that expired at or before `now_ms` and returns their client ids.
    pub fn prune_expired(&mut self, now_ms: u64) -> Vec<String> {
        let expired: Vec<String> = self
            .leases
            .values()
            .filter(|lease| lease.is_expired(now_ms))
            .map(|lease| lease.client_id.clone())
            .collect();
        for client_id in &expired {
            self.leases.remove(client_id);
        }
        expired
    }

    pub fn upsert_lease(&mut self, client_id: &str, now_ms: u64, expire_interval: Duration) {
        let expires_at_ms = now_ms.saturating_add(expire_interval.as_millis() as u64);
        self.leases.insert(
            client_id.to_string(),
            ClientLease {
                client_id: client_id.to_string(),
                last_heartbeat_ms: now_ms,
                expires_at_ms,
            },
        );
    }

    pub fn remove_lease(&mut self, client_id: &str) -> bool {
        self.leases.remove(client_id).is_some()
    }

    pub fn live_instances(&self) -> usize {
        self.leases.len()
    }
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Swapped { version: u64 },
    /// Someone else wrote the record since it was loaded.
    Conflict,
}

/// Storage for [`ControlRecord`]s with optimistic concurrency.
#[async_trait]
pub trait ControlRecordStore: Send + Sync {
    async fn load(&self, group_name: &str) -> Result<Option<ControlRecord>, Report<StoreError>>;

    /// Writes `record` iff the stored version equals `expected_version`.
    ///
    /// `None` means the record must not exist yet.
    async fn compare_and_swap(
        &self,
        group_name: &str,
        expected_version: Option<u64>,
        record: &ControlRecord,
    ) -> Result<CasOutcome, Report<StoreError>>;
}

#[derive(Debug)]
struct StoredDocument {
    version: u64,
    body: String,
}

/// Process-local [`ControlRecordStore`] keeping records as JSON documents.
///
/// Outages can be simulated with [`set_available`](Self::set_available).
#[derive(Debug)]
pub struct InMemoryControlStore {
    documents: Mutex<HashMap<String, StoredDocument>>,
    available: AtomicBool,
    next_version: AtomicU64,
    round_trips: AtomicU64,
}

impl Default for InMemoryControlStore {
    fn default() -> Self {
        Self {
            documents: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            next_version: AtomicU64::new(1),
            round_trips: AtomicU64::new(0),
        }
    }
}

impl InMemoryControlStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Number of load and swap calls served so far, failed ones included.
    pub fn round_trips(&self) -> u64 {
        self.round_trips.load(Ordering::Relaxed)
    }

    /// Stores a raw document without any validation.
    pub fn put_raw(&self, group_name: &str, body: impl Into<String>) -> u64 {
        let version = self.next_version.fetch_add(1, Ordering::Relaxed);
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                group_name.to_string(),
                StoredDocument {
                    version,
                    body: body.into(),
                },
            );
        version
    }

    fn begin_round_trip(&self, group_name: &str) -> Result<(), Report<StoreError>> {
        self.round_trips.fetch_add(1, Ordering::Relaxed);
        if self.is_available() {
            Ok(())
        } else {
            Err(Report::new(StoreError::unavailable("in-memory store is offline"))
                .attach_printable(format!("group: {group_name}")))
        }
    }
}

#[async_trait]
impl ControlRecordStore for InMemoryControlStore {
    async fn load(&self, group_name: &str) -> Result<Option<ControlRecord>, Report<StoreError>> {
        self.begin_round_trip(group_name)?;

        let documents = self.documents.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(document) = documents.get(group_name) else {
            return Ok(None);
        };

        let mut record = ControlRecord::from_json(&document.body)
            .attach_printable_lazy(|| format!("group: {group_name}"))?;
        record.version = document.version;
        Ok(Some(record))
    }

    async fn compare_and_swap(
        &self,
        group_name: &str,
        expected_version: Option<u64>,
        record: &ControlRecord,
    ) -> Result<CasOutcome, Report<StoreError>> {
        self.begin_round_trip(group_name)?;

        let body = serde_json::to_string(record).change_context_lazy(|| StoreError::Malformed {
            reason: format!("control record of `{group_name}` cannot be encoded"),
        })?;

        let mut documents = self.documents.lock().unwrap_or_else(PoisonError::into_inner);
        let current = documents.get(group_name).map(|document| document.version);
        if current != expected_version {
            return Ok(CasOutcome::Conflict);
        }

        let version = self.next_version.fetch_add(1, Ordering::Relaxed);
        documents.insert(group_name.to_string(), StoredDocument { version, body });
        Ok(CasOutcome::Swapped { version })
    }
}
