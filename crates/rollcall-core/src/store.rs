//! Persistence seams for the gallery and the ledger.
//!
//! [`MemoryStore`] keeps everything in process memory; the SQLite backend
//! lives in the `rollcall-store` crate.

use crate::ledger::{AttendanceRecord, IdentityTally};
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage failure: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("identity already exists: {0}")]
    DuplicateIdentity(String),
    #[error("identity not found: {0}")]
    IdentityNotFound(String),
    #[error("corrupt stored value: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        StoreError::Backend(Box::new(err))
    }
}

/// A reference embedding as persisted. `embedding` is `None` when the
/// encoding was never written or has been lost.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredReference {
    pub id: Uuid,
    pub image_path: Option<String>,
    pub embedding: Option<Vec<u8>>,
    pub model_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredIdentity {
    pub id: String,
    pub name: String,
    pub enrollment_seq: u64,
    /// In enrollment order.
    pub references: Vec<StoredReference>,
}

pub trait GalleryStore: Send + Sync {
    /// All identities ordered by enrollment sequence.
    fn load_identities(&self) -> Result<Vec<StoredIdentity>, StoreError>;

    fn insert_identity(&self, identity: &StoredIdentity) -> Result<(), StoreError>;

    fn append_reference(
        &self,
        identity_id: &str,
        reference: &StoredReference,
    ) -> Result<(), StoreError>;

    fn replace_references(
        &self,
        identity_id: &str,
        references: &[StoredReference],
    ) -> Result<(), StoreError>;

    fn rename_identity(&self, identity_id: &str, name: &str) -> Result<(), StoreError>;

    /// Delete the identity, its references and all of its attendance records.
    fn delete_identity(&self, identity_id: &str) -> Result<(), StoreError>;
}

pub trait LedgerStore: Send + Sync {
    fn records_for_date(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, StoreError>;

    /// Upsert every record for `date` in one atomic unit: all or nothing.
    fn commit_day(&self, date: NaiveDate, records: &[AttendanceRecord]) -> Result<(), StoreError>;

    /// Records for one identity with `from <= date <= to`, oldest first.
    fn records_for_identity(
        &self,
        identity_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AttendanceRecord>, StoreError>;

    /// Returns whether a record existed.
    fn delete_record(&self, identity_id: &str, date: NaiveDate) -> Result<bool, StoreError>;

    /// Per-identity status counts over every recorded day, in enrollment order.
    fn tallies(&self) -> Result<Vec<IdentityTally>, StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    identities: Vec<StoredIdentity>,
    attendance: BTreeMap<(NaiveDate, String), AttendanceRecord>,
    fail_commits: bool,
}

impl MemoryInner {
    fn identity_mut(&mut self, identity_id: &str) -> Result<&mut StoredIdentity, StoreError> {
        self.identities
            .iter_mut()
            .find(|i| i.id == identity_id)
            .ok_or_else(|| StoreError::IdentityNotFound(identity_id.to_string()))
    }
}

/// In-process store implementing both [`GalleryStore`] and [`LedgerStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Error, Debug)]
#[error("injected commit failure")]
struct InjectedFailure;

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `commit_day` fail without writing anything.
    pub fn fail_commits(&self, fail: bool) {
        self.lock().fail_commits = fail;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl GalleryStore for MemoryStore {
    fn load_identities(&self) -> Result<Vec<StoredIdentity>, StoreError> {
        let mut identities = self.lock().identities.clone();
        identities.sort_by_key(|i| i.enrollment_seq);
        Ok(identities)
    }

    fn insert_identity(&self, identity: &StoredIdentity) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.identities.iter().any(|i| i.id == identity.id) {
            return Err(StoreError::DuplicateIdentity(identity.id.clone()));
        }
        inner.identities.push(identity.clone());
        Ok(())
    }

    fn append_reference(
        &self,
        identity_id: &str,
        reference: &StoredReference,
    ) -> Result<(), StoreError> {
        self.lock()
            .identity_mut(identity_id)?
            .references
            .push(reference.clone());
        Ok(())
    }

    fn replace_references(
        &self,
        identity_id: &str,
        references: &[StoredReference],
    ) -> Result<(), StoreError> {
        self.lock().identity_mut(identity_id)?.references = references.to_vec();
        Ok(())
    }

    fn rename_identity(&self, identity_id: &str, name: &str) -> Result<(), StoreError> {
        self.lock().identity_mut(identity_id)?.name = name.to_string();
        Ok(())
    }

    fn delete_identity(&self, identity_id: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let before = inner.identities.len();
        inner.identities.retain(|i| i.id != identity_id);
        if inner.identities.len() == before {
            return Err(StoreError::IdentityNotFound(identity_id.to_string()));
        }
        inner.attendance.retain(|(_, id), _| id != identity_id);
        Ok(())
    }
}

impl LedgerStore for MemoryStore {
    fn records_for_date(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, StoreError> {
        Ok(self
            .lock()
            .attendance
            .values()
            .filter(|r| r.date == date)
            .cloned()
            .collect())
    }

    fn commit_day(&self, date: NaiveDate, records: &[AttendanceRecord]) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.fail_commits {
            return Err(StoreError::backend(InjectedFailure));
        }
        for r in records {
            if r.date != date {
                return Err(StoreError::Corrupt(format!(
                    "record for {} dated {} committed under {date}",
                    r.identity_id, r.date
                )));
            }
            if !inner.identities.iter().any(|i| i.id == r.identity_id) {
                return Err(StoreError::IdentityNotFound(r.identity_id.clone()));
            }
        }
        for r in records {
            inner
                .attendance
                .insert((date, r.identity_id.clone()), r.clone());
        }
        Ok(())
    }

    fn records_for_identity(
        &self,
        identity_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        Ok(self
            .lock()
            .attendance
            .values()
            .filter(|r| r.identity_id == identity_id && r.date >= from && r.date <= to)
            .cloned()
            .collect())
    }

    fn delete_record(&self, identity_id: &str, date: NaiveDate) -> Result<bool, StoreError> {
        Ok(self
            .lock()
            .attendance
            .remove(&(date, identity_id.to_string()))
            .is_some())
    }

    fn tallies(&self) -> Result<Vec<IdentityTally>, StoreError> {
        let inner = self.lock();
        let mut identities: Vec<&StoredIdentity> = inner.identities.iter().collect();
        identities.sort_by_key(|i| i.enrollment_seq);
        Ok(identities
            .into_iter()
            .map(|identity| {
                let mut tally = IdentityTally::empty(&identity.id, &identity.name);
                inner
                    .attendance
                    .values()
                    .filter(|r| r.identity_id == identity.id)
                    .for_each(|r| tally.count(r.status));
                tally
            })
            .collect())
    }
}
