//! Daily attendance ledger.
//!
//! Two sources write to the same day: live recognition (first sighting of
//! an identity) and bulk roster submissions. [`reconcile_records`] merges a
//! roster into whatever is already recorded without losing the original
//! check-in time. Writes for one date are serialized and committed as one
//! atomic unit.

use crate::clock::Clock;
use crate::gallery::Gallery;
use crate::store::{LedgerStore, StoreError};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("invalid date or time: {0}")]
    InvalidDateOrTime(String),
    #[error("unknown attendance status: {0:?} (expected present, late or absent)")]
    UnknownStatus(String),
    #[error("identity not found: {0}")]
    IdentityNotFound(String),
    #[error("{identity_id} has not checked in on {date}")]
    NotCheckedIn { identity_id: String, date: NaiveDate },
    #[error("no attendance record for {identity_id} on {date}")]
    RecordNotFound { identity_id: String, date: NaiveDate },
    #[error(transparent)]
    Storage(StoreError),
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::IdentityNotFound(id) => LedgerError::IdentityNotFound(id),
            other => LedgerError::Storage(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AttendanceStatus {
    Present,
    Late,
    Absent,
}

impl AttendanceStatus {
    /// Present or Late: the person actually turned up.
    pub fn is_attending(self) -> bool {
        matches!(self, AttendanceStatus::Present | AttendanceStatus::Late)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AttendanceStatus::Present => "Present",
            AttendanceStatus::Late => "Late",
            AttendanceStatus::Absent => "Absent",
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttendanceStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim();
        [
            AttendanceStatus::Present,
            AttendanceStatus::Late,
            AttendanceStatus::Absent,
        ]
        .into_iter()
        .find(|status| status.as_str().eq_ignore_ascii_case(tag))
        .ok_or_else(|| LedgerError::UnknownStatus(s.to_string()))
    }
}

impl TryFrom<String> for AttendanceStatus {
    type Error = LedgerError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<AttendanceStatus> for String {
    fn from(status: AttendanceStatus) -> Self {
        status.as_str().to_string()
    }
}

/// One identity's attendance on one date. `(identity_id, date)` is unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub identity_id: String,
    pub date: NaiveDate,
    pub status: AttendanceStatus,
    pub check_in: Option<NaiveTime>,
    pub check_out: Option<NaiveTime>,
    pub note: Option<String>,
}

impl AttendanceRecord {
    fn blank(identity_id: &str, date: NaiveDate, status: AttendanceStatus) -> Self {
        Self {
            identity_id: identity_id.to_string(),
            date,
            status,
            check_in: None,
            check_out: None,
            note: None,
        }
    }
}

/// One row of a bulk submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub identity_id: String,
    pub status: AttendanceStatus,
    /// Explicit check-in as `HH:MM:SS` (or `HH:MM`). Unparsable values are
    /// treated as absent.
    #[serde(default)]
    pub check_in: Option<String>,
    /// Replaces the stored note when present; an empty string clears it.
    #[serde(default)]
    pub note: Option<String>,
}

impl Submission {
    pub fn new(identity_id: impl Into<String>, status: AttendanceStatus) -> Self {
        Self {
            identity_id: identity_id.into(),
            status,
            check_in: None,
            note: None,
        }
    }

    pub fn with_check_in(mut self, time: impl Into<String>) -> Self {
        self.check_in = Some(time.into());
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    fn explicit_check_in(&self) -> Option<NaiveTime> {
        let raw = self.check_in.as_deref()?;
        match parse_time(raw) {
            Ok(t) => Some(t),
            Err(_) => {
                tracing::warn!(
                    identity = %self.identity_id,
                    check_in = raw,
                    "ignoring unparsable explicit check-in time"
                );
                None
            }
        }
    }
}

/// Status counts for one date.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DaySummary {
    pub present: usize,
    pub late: usize,
    pub absent: usize,
    /// Records that exist for the date.
    pub total: usize,
    /// Enrolled identities with no record for the date.
    pub unmarked: usize,
}

/// Aggregate counts for one identity over every recorded day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentityTally {
    pub identity_id: String,
    pub name: String,
    pub present: usize,
    pub late: usize,
    pub absent: usize,
    pub total: usize,
    /// (present + late) / total as a percentage; 0 with no records.
    pub attendance_rate: f64,
}

impl IdentityTally {
    pub fn empty(identity_id: &str, name: &str) -> Self {
        Self {
            identity_id: identity_id.to_string(),
            name: name.to_string(),
            present: 0,
            late: 0,
            absent: 0,
            total: 0,
            attendance_rate: 0.0,
        }
    }

    /// Build a tally from counts aggregated elsewhere (e.g. in SQL).
    pub fn from_counts(
        identity_id: &str,
        name: &str,
        present: usize,
        late: usize,
        absent: usize,
    ) -> Self {
        let mut tally = Self::empty(identity_id, name);
        tally.present = present;
        tally.late = late;
        tally.absent = absent;
        tally.refresh();
        tally
    }

    pub fn count(&mut self, status: AttendanceStatus) {
        match status {
            AttendanceStatus::Present => self.present += 1,
            AttendanceStatus::Late => self.late += 1,
            AttendanceStatus::Absent => self.absent += 1,
        }
        self.refresh();
    }

    fn refresh(&mut self) {
        self.total = self.present + self.late + self.absent;
        self.attendance_rate = if self.total == 0 {
            0.0
        } else {
            (self.present + self.late) as f64 / self.total as f64 * 100.0
        };
    }
}

/// What a [`Ledger::reconcile`] call left behind.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileOutcome {
    pub date: NaiveDate,
    /// Every record for the date after the commit.
    pub records: Vec<AttendanceRecord>,
    /// Identities whose record was created or modified, in submission order.
    pub changed: Vec<String>,
    pub summary: DaySummary,
    pub tallies: Vec<IdentityTally>,
}

pub fn parse_date(s: &str) -> Result<NaiveDate, LedgerError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| LedgerError::InvalidDateOrTime(format!("{s:?}: {e}")))
}

/// Parse `HH:MM:SS` or `HH:MM`.
pub fn parse_time(s: &str) -> Result<NaiveTime, LedgerError> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|e| LedgerError::InvalidDateOrTime(format!("{s:?}: {e}")))
}

/// Merge one submission into the current record for its identity and date.
///
/// Status is always overwritten. Check-in, for an attending status:
/// an explicit time wins; otherwise a record without a check-in gets `now`;
/// an existing check-in is kept. An absent record carries no times.
pub fn apply_submission(
    current: Option<AttendanceRecord>,
    date: NaiveDate,
    submission: &Submission,
    now: NaiveTime,
) -> AttendanceRecord {
    let status = submission.status;
    let explicit = if status.is_attending() {
        submission.explicit_check_in()
    } else {
        None
    };

    let mut record = match current {
        None => {
            let mut r = AttendanceRecord::blank(&submission.identity_id, date, status);
            if status.is_attending() {
                r.check_in = Some(explicit.unwrap_or(now));
            }
            r
        }
        Some(mut r) => {
            let prior = r.status;
            r.status = status;
            if status.is_attending() {
                if let Some(t) = explicit {
                    r.check_in = Some(t);
                } else if !prior.is_attending() || r.check_in.is_none() {
                    r.check_in = Some(now);
                }
            } else {
                r.check_in = None;
                r.check_out = None;
            }
            r
        }
    };

    if let Some(note) = &submission.note {
        let note = note.trim();
        record.note = (!note.is_empty()).then(|| note.to_string());
    }
    record
}

/// Apply `submissions` in order to the existing records for `date`.
///
/// Returns the full day keyed by identity and the identities whose record
/// differs from what was stored, in first-submission order.
pub fn reconcile_records(
    existing: Vec<AttendanceRecord>,
    date: NaiveDate,
    submissions: &[Submission],
    now: NaiveTime,
) -> (BTreeMap<String, AttendanceRecord>, Vec<String>) {
    let original: BTreeMap<String, AttendanceRecord> = existing
        .into_iter()
        .map(|r| (r.identity_id.clone(), r))
        .collect();
    let mut day = original.clone();
    let mut touched: Vec<String> = Vec::new();

    for submission in submissions {
        let current = day.remove(&submission.identity_id);
        let updated = apply_submission(current, date, submission, now);
        day.insert(submission.identity_id.clone(), updated);
        if !touched.contains(&submission.identity_id) {
            touched.push(submission.identity_id.clone());
        }
    }

    let changed = touched
        .into_iter()
        .filter(|id| original.get(id) != day.get(id))
        .collect();
    (day, changed)
}

/// First recognition of the day. Returns the new record, or `None` when the
/// identity already checked in.
pub fn apply_sighting(
    current: Option<AttendanceRecord>,
    identity_id: &str,
    date: NaiveDate,
    at: NaiveTime,
    late_after: Option<NaiveTime>,
) -> Option<AttendanceRecord> {
    let status = match late_after {
        Some(cutoff) if at > cutoff => AttendanceStatus::Late,
        _ => AttendanceStatus::Present,
    };
    match current {
        Some(r) if r.status.is_attending() && r.check_in.is_some() => None,
        Some(mut r) => {
            r.status = status;
            r.check_in = Some(at);
            r.check_out = None;
            Some(r)
        }
        None => {
            let mut r = AttendanceRecord::blank(identity_id, date, status);
            r.check_in = Some(at);
            Some(r)
        }
    }
}

fn summarize(records: &[AttendanceRecord], enrolled: usize) -> DaySummary {
    let mut summary = DaySummary::default();
    for r in records {
        match r.status {
            AttendanceStatus::Present => summary.present += 1,
            AttendanceStatus::Late => summary.late += 1,
            AttendanceStatus::Absent => summary.absent += 1,
        }
    }
    summary.total = records.len();
    summary.unmarked = enrolled.saturating_sub(records.len());
    summary
}

pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    gallery: Arc<Gallery>,
    clock: Arc<dyn Clock>,
    late_after: Option<NaiveTime>,
    day_locks: Mutex<HashMap<NaiveDate, Arc<Mutex<()>>>>,
}

impl Ledger {
    pub fn new(store: Arc<dyn LedgerStore>, gallery: Arc<Gallery>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            gallery,
            clock,
            late_after: None,
            day_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Sightings after `cutoff` are recorded as Late.
    pub fn with_late_after(mut self, cutoff: Option<NaiveTime>) -> Self {
        self.late_after = cutoff;
        self
    }

    pub fn now(&self) -> NaiveDateTime {
        self.clock.now()
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.now().date()
    }

    /// Run `f` inside the exclusive section for `date`. The date's lock is
    /// dropped from the map once no other caller holds or awaits it.
    fn with_day<T>(
        &self,
        date: NaiveDate,
        f: impl FnOnce() -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let lock = {
            let mut locks = self.day_locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(date).or_default())
        };
        let result = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };

        let mut locks = self.day_locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Only the map and `lock` remain.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&date);
        }
        result
    }

    #[cfg(test)]
    fn tracked_days(&self) -> usize {
        self.day_locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn require_identity(&self, identity_id: &str) -> Result<(), LedgerError> {
        if self.gallery.contains(identity_id) {
            Ok(())
        } else {
            Err(LedgerError::IdentityNotFound(identity_id.to_string()))
        }
    }

    /// Merge a batch of submissions for `date` and commit it atomically.
    pub fn reconcile(
        &self,
        date: NaiveDate,
        submissions: &[Submission],
    ) -> Result<ReconcileOutcome, LedgerError> {
        let snapshot = self.gallery.snapshot();
        if let Some(unknown) = submissions
            .iter()
            .find(|s| !snapshot.contains(&s.identity_id))
        {
            return Err(LedgerError::IdentityNotFound(unknown.identity_id.clone()));
        }

        let (day, changed) = self.with_day(date, || {
            let existing = self.store.records_for_date(date)?;
            let now = self.clock.now().time();
            let (day, changed) = reconcile_records(existing, date, submissions, now);

            if !changed.is_empty() {
                let touched: Vec<AttendanceRecord> = changed
                    .iter()
                    .filter_map(|id| day.get(id).cloned())
                    .collect();
                self.store.commit_day(date, &touched)?;
            }
            Ok((day, changed))
        })?;
        tracing::info!(
            %date,
            submitted = submissions.len(),
            changed = changed.len(),
            "attendance reconciled"
        );

        let records: Vec<AttendanceRecord> = day.into_values().collect();
        let summary = summarize(&records, snapshot.identities().len());
        Ok(ReconcileOutcome {
            date,
            records,
            changed,
            summary,
            tallies: self.store.tallies()?,
        })
    }

    /// Record that `identity_id` was recognised at `at`.
    pub fn record_sighting(
        &self,
        identity_id: &str,
        at: NaiveDateTime,
    ) -> Result<Option<AttendanceRecord>, LedgerError> {
        self.require_identity(identity_id)?;
        let date = at.date();
        self.with_day(date, || {
            let current = self
                .store
                .records_for_date(date)?
                .into_iter()
                .find(|r| r.identity_id == identity_id);
            let Some(record) =
                apply_sighting(current, identity_id, date, at.time(), self.late_after)
            else {
                return Ok(None);
            };
            self.store.commit_day(date, std::slice::from_ref(&record))?;
            tracing::info!(
                identity = %identity_id,
                %date,
                status = %record.status,
                "check-in recorded"
            );
            Ok(Some(record))
        })
    }

    /// [`record_sighting`](Self::record_sighting) at the current time.
    pub fn mark_seen(&self, identity_id: &str) -> Result<Option<AttendanceRecord>, LedgerError> {
        self.record_sighting(identity_id, self.clock.now())
    }

    /// Stamp a check-out time (explicit or now) on an attending record.
    pub fn check_out(
        &self,
        identity_id: &str,
        date: NaiveDate,
        at: Option<NaiveTime>,
    ) -> Result<AttendanceRecord, LedgerError> {
        self.require_identity(identity_id)?;
        self.with_day(date, || {
            let mut record = self
                .store
                .records_for_date(date)?
                .into_iter()
                .find(|r| r.identity_id == identity_id)
                .filter(|r| r.status.is_attending())
                .ok_or_else(|| LedgerError::NotCheckedIn {
                    identity_id: identity_id.to_string(),
                    date,
                })?;
            let at = at.unwrap_or_else(|| self.clock.now().time());
            if let Some(check_in) = record.check_in {
                if at < check_in {
                    return Err(LedgerError::InvalidDateOrTime(format!(
                        "check-out {at} is before check-in {check_in}"
                    )));
                }
            }
            record.check_out = Some(at);
            self.store.commit_day(date, std::slice::from_ref(&record))?;
            Ok(record)
        })
    }

    pub fn day(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, LedgerError> {
        let mut records = self.store.records_for_date(date)?;
        records.sort_by(|a, b| a.identity_id.cmp(&b.identity_id));
        Ok(records)
    }

    pub fn day_summary(&self, date: NaiveDate) -> Result<DaySummary, LedgerError> {
        let records = self.store.records_for_date(date)?;
        Ok(summarize(&records, self.gallery.snapshot().identities().len()))
    }

    /// Records for one identity between `from` and `to`, inclusive.
    pub fn history(
        &self,
        identity_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AttendanceRecord>, LedgerError> {
        if from > to {
            return Err(LedgerError::InvalidDateOrTime(format!(
                "start date {from} is after end date {to}"
            )));
        }
        self.require_identity(identity_id)?;
        Ok(self.store.records_for_identity(identity_id, from, to)?)
    }

    pub fn tallies(&self) -> Result<Vec<IdentityTally>, LedgerError> {
        Ok(self.store.tallies()?)
    }

    /// Administrative removal of a single record.
    pub fn remove_record(&self, identity_id: &str, date: NaiveDate) -> Result<(), LedgerError> {
        self.with_day(date, || {
            if self.store.delete_record(identity_id, date)? {
                tracing::info!(identity = %identity_id, %date, "attendance record removed");
                Ok(())
            } else {
                Err(LedgerError::RecordNotFound {
                    identity_id: identity_id.to_string(),
                    date,
                })
            }
        })
    }
}
