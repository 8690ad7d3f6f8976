//! Deduplicating ingestion of scan reports.
//!
//! Replacing a known host is an explicit two-step policy: the stored host is
//! deleted (its ports and scripts go with it through the schema cascade) and
//! the freshly mapped host is queued for the batch insert. Nothing is merged;
//! a replaced host keeps none of its previous ports or scripts.
//!
//! The delete commits on its own, ahead of the batch. From that delete until
//! the batch commits (which spans checking every later candidate in the same
//! report), readers see the replaced address as missing. If the batch then
//! fails, the address stays missing; the deleted hosts are not restored.
//!
//! Ingestions bound to a [`Deadline`] stop at the first storage step that
//! finds it passed. Deletes that committed before that point stand; the batch
//! insert never commits after it.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, TryLockError},
    thread,
    time::Duration,
};

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::{IngestError, StoreError},
    mapper::map_host,
    models::NewHost,
    report::parse_report,
    store::{Deadline, HostStore},
};

const GATE_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// What to do with a candidate whose address is already stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnExisting {
    Skip,
    Replace,
}

impl From<bool> for OnExisting {
    fn from(replace_existing: bool) -> Self {
        if replace_existing {
            Self::Replace
        } else {
            Self::Skip
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertedHost {
    pub address: String,
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingFailure {
    /// Position of the host in the report.
    pub index: usize,
    pub address: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
    pub batch_id: String,
    pub inserted: Vec<InsertedHost>,
    pub replaced: Vec<String>,
    pub skipped: Vec<String>,
    pub mapping_failures: Vec<MappingFailure>,
}

impl IngestOutcome {
    fn new(batch_id: String) -> Self {
        Self {
            batch_id,
            inserted: Vec::new(),
            replaced: Vec::new(),
            skipped: Vec::new(),
            mapping_failures: Vec::new(),
        }
    }

    pub fn inserted_count(&self) -> usize {
        self.inserted.len()
    }
}

#[derive(Debug, Clone)]
pub struct Ingestor {
    store: HostStore,
    write_gate: Arc<Mutex<()>>,
}

impl Ingestor {
    pub fn new(store: HostStore) -> Self {
        Self {
            store,
            write_gate: Arc::new(Mutex::new(())),
        }
    }

    /// Parses, maps and stores one report. A malformed report changes nothing;
    /// hosts that fail to map are reported and left out of the batch.
    pub fn ingest_report(
        &self,
        bytes: &[u8],
        on_existing: OnExisting,
    ) -> Result<IngestOutcome, IngestError> {
        self.ingest_report_into(&self.store, bytes, on_existing)
    }

    /// [`Ingestor::ingest_report`] that gives up with
    /// [`IngestError::StorageUnavailable`] once `deadline` passes, without
    /// committing the batch.
    pub fn ingest_report_until(
        &self,
        bytes: &[u8],
        on_existing: OnExisting,
        deadline: Deadline,
    ) -> Result<IngestOutcome, IngestError> {
        self.ingest_report_into(&self.store.until(deadline), bytes, on_existing)
    }

    /// Decides skip/insert/replace per candidate in report order, then commits
    /// every insert in a single batch.
    pub fn ingest(
        &self,
        candidates: Vec<NewHost>,
        on_existing: OnExisting,
    ) -> Result<IngestOutcome, IngestError> {
        self.ingest_into(&self.store, candidates, on_existing)
    }

    fn ingest_report_into(
        &self,
        store: &HostStore,
        bytes: &[u8],
        on_existing: OnExisting,
    ) -> Result<IngestOutcome, IngestError> {
        let parsed = parse_report(bytes)?;

        let mut candidates = Vec::new();
        let mut failures = Vec::new();
        for (index, host) in parsed.iter().enumerate() {
            if !host.is_addressable() {
                continue;
            }
            match map_host(host) {
                Ok(candidate) => candidates.push(candidate),
                Err(err) => {
                    warn!(index, error = %err, "Skipping unmappable host");
                    failures.push(MappingFailure {
                        index,
                        address: host.primary_address().map(ToString::to_string),
                        reason: err.to_string(),
                    });
                }
            }
        }

        let mut outcome = self.ingest_into(store, candidates, on_existing)?;
        outcome.mapping_failures = failures;
        Ok(outcome)
    }

    fn ingest_into(
        &self,
        store: &HostStore,
        candidates: Vec<NewHost>,
        on_existing: OnExisting,
    ) -> Result<IngestOutcome, IngestError> {
        let batch_id = Uuid::new_v4().to_string();
        let mut outcome = IngestOutcome::new(batch_id.clone());

        let _gate = self.acquire_gate(store)?;

        let mut pending: Vec<NewHost> = Vec::new();
        let mut pending_by_address: HashMap<String, usize> = HashMap::new();

        for candidate in candidates {
            let key = candidate.address.to_ascii_lowercase();

            if let Some(&slot) = pending_by_address.get(&key) {
                match on_existing {
                    OnExisting::Skip => outcome.skipped.push(candidate.address),
                    OnExisting::Replace => pending[slot] = candidate,
                }
                continue;
            }

            if store.exists(&candidate.address)? {
                match on_existing {
                    OnExisting::Skip => {
                        info!(batch_id = %batch_id, address = %candidate.address, "Host already known, skipping");
                        outcome.skipped.push(candidate.address);
                        continue;
                    }
                    OnExisting::Replace => {
                        store.delete_by_address(&candidate.address)?;
                        info!(batch_id = %batch_id, address = %candidate.address, "Deleted stale host for replacement");
                        outcome.replaced.push(candidate.address.clone());
                    }
                }
            }

            pending_by_address.insert(key, pending.len());
            pending.push(candidate);
        }

        store.insert_batch(&batch_id, Utc::now(), &pending)?;

        outcome.inserted = pending
            .iter()
            .map(|host| InsertedHost {
                address: host.address.clone(),
                ports: host.ports.iter().map(|p| p.number).collect(),
            })
            .collect();

        info!(
            batch_id = %batch_id,
            inserted = outcome.inserted.len(),
            replaced = outcome.replaced.len(),
            skipped = outcome.skipped.len(),
            "Ingestion batch committed"
        );

        Ok(outcome)
    }

    /// Waits for the write gate, but no longer than the store's deadline.
    fn acquire_gate(&self, store: &HostStore) -> Result<MutexGuard<'_, ()>, StoreError> {
        let poisoned = || StoreError::Worker("ingestion write gate poisoned".to_string());
        if store.deadline().is_none() {
            return self.write_gate.lock().map_err(|_| poisoned());
        }

        loop {
            match self.write_gate.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::WouldBlock) => {
                    store.check_deadline()?;
                    thread::sleep(GATE_POLL_INTERVAL);
                }
                Err(TryLockError::Poisoned(_)) => return Err(poisoned()),
            }
        }
    }
}
