use crate::{is_foreign_key_violation, OrBackend, SqliteStore};
use chrono::{NaiveDate, NaiveTime};
use rollcall_core::ledger::{parse_date, parse_time};
use rollcall_core::{AttendanceRecord, AttendanceStatus, IdentityTally, LedgerStore, StoreError};
use rusqlite::{params, Row, TransactionBehavior};

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";

const RECORD_COLUMNS: &str = "identity_id, date, status, check_in, check_out, note";

/// Attendance row as stored, before its text columns are parsed.
struct RawRecord {
    identity_id: String,
    date: String,
    status: String,
    check_in: Option<String>,
    check_out: Option<String>,
    note: Option<String>,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            identity_id: row.get(0)?,
            date: row.get(1)?,
            status: row.get(2)?,
            check_in: row.get(3)?,
            check_out: row.get(4)?,
            note: row.get(5)?,
        })
    }

    fn parse(self) -> Result<AttendanceRecord, StoreError> {
        let RawRecord {
            identity_id,
            date,
            status,
            check_in,
            check_out,
            note,
        } = self;
        let corrupt = |e: rollcall_core::LedgerError| {
            StoreError::Corrupt(format!("attendance row for {identity_id}: {e}"))
        };
        let time = |t: Option<String>| t.as_deref().map(parse_time).transpose();

        let date = parse_date(&date).map_err(corrupt)?;
        let status = status.parse::<AttendanceStatus>().map_err(corrupt)?;
        let check_in = time(check_in).map_err(corrupt)?;
        let check_out = time(check_out).map_err(corrupt)?;
        Ok(AttendanceRecord {
            identity_id,
            date,
            status,
            check_in,
            check_out,
            note,
        })
    }
}

fn date_sql(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

fn time_sql(time: Option<NaiveTime>) -> Option<String> {
    time.map(|t| t.format(TIME_FORMAT).to_string())
}

impl SqliteStore {
    fn query_records(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql).or_backend()?;
        let raw = stmt
            .query_map(params, RawRecord::from_row)
            .or_backend()?
            .collect::<rusqlite::Result<Vec<_>>>()
            .or_backend()?;
        raw.into_iter().map(RawRecord::parse).collect()
    }
}

impl LedgerStore for SqliteStore {
    fn records_for_date(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.query_records(
            &format!("SELECT {RECORD_COLUMNS} FROM attendance WHERE date = ?1 ORDER BY identity_id"),
            params![date_sql(date)],
        )
    }

    fn commit_day(&self, date: NaiveDate, records: &[AttendanceRecord]) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .or_backend()?;
        {
            let mut upsert = tx
                .prepare(
                    "INSERT INTO attendance (identity_id, date, status, check_in, check_out, note)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT (identity_id, date) DO UPDATE SET
                         status = excluded.status,
                         check_in = excluded.check_in,
                         check_out = excluded.check_out,
                         note = excluded.note",
                )
                .or_backend()?;
            for r in records {
                if r.date != date {
                    return Err(StoreError::Corrupt(format!(
                        "record for {} dated {} committed under {date}",
                        r.identity_id, r.date
                    )));
                }
                upsert
                    .execute(params![
                        r.identity_id,
                        date_sql(date),
                        r.status.as_str(),
                        time_sql(r.check_in),
                        time_sql(r.check_out),
                        r.note,
                    ])
                    .map_err(|e| {
                        if is_foreign_key_violation(&e) {
                            StoreError::IdentityNotFound(r.identity_id.clone())
                        } else {
                            StoreError::backend(e)
                        }
                    })?;
            }
        }
        // Dropping the transaction on any early return above rolls it back.
        tx.commit().or_backend()?;
        tracing::debug!(%date, records = records.len(), "attendance committed");
        Ok(())
    }

    fn records_for_identity(
        &self,
        identity_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM attendance
                 WHERE identity_id = ?1 AND date BETWEEN ?2 AND ?3
                 ORDER BY date"
            ),
            params![identity_id, date_sql(from), date_sql(to)],
        )
    }

    fn delete_record(&self, identity_id: &str, date: NaiveDate) -> Result<bool, StoreError> {
        let changed = self
            .conn()
            .execute(
                "DELETE FROM attendance WHERE identity_id = ?1 AND date = ?2",
                params![identity_id, date_sql(date)],
            )
            .or_backend()?;
        Ok(changed > 0)
    }

    fn tallies(&self) -> Result<Vec<IdentityTally>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT i.id, i.name,
                        COALESCE(SUM(a.status = 'Present'), 0),
                        COALESCE(SUM(a.status = 'Late'), 0),
                        COALESCE(SUM(a.status = 'Absent'), 0)
                 FROM identities i
                 LEFT JOIN attendance a ON a.identity_id = i.id
                 GROUP BY i.id
                 ORDER BY i.enrollment_seq",
            )
            .or_backend()?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })
            .or_backend()?;

        let mut tallies = Vec::new();
        for row in rows {
            let (id, name, present, late, absent) = row.or_backend()?;
            let count = |n: i64| usize::try_from(n).unwrap_or(0);
            tallies.push(IdentityTally::from_counts(
                &id,
                &name,
                count(present),
                count(late),
                count(absent),
            ));
        }
        Ok(tallies)
    }
}
