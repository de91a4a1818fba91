#![forbid(unsafe_code)]

use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use case_monitor_domain::{
    compute_entry_hash, compute_monitor_snapshot_hash, compute_request_snapshot_hash,
    detail_slot_name, now_utc, DetailRecord, MonitorDraft, MonitorHistoryEntry, MonitorHistoryRow,
    MonitorId, MonitorRecord, MonitorStatus, RequestDraft, RequestHistoryEntry, RequestHistoryRow,
    RequestId, RequestRecord, RequestStatus, DETAIL_SLOT_COUNT,
};
use case_monitor_ledger_core::LedgerStore;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use time::OffsetDateTime;
use ulid::Ulid;

const LEDGER_SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS request_log (
  request_id INTEGER PRIMARY KEY AUTOINCREMENT,
  created_at TEXT NOT NULL,
  case_id TEXT,
  order_id INTEGER NOT NULL,
  account_number TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('open','completed','error')),
  status_changed_at TEXT NOT NULL,
  status_description TEXT
);

CREATE TABLE IF NOT EXISTS request_progress_log (
  entry_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  entry_id TEXT NOT NULL UNIQUE,
  request_id INTEGER NOT NULL,
  recorded_at TEXT NOT NULL,
  snapshot_json TEXT NOT NULL,
  snapshot_hash TEXT NOT NULL,
  prev_entry_hash TEXT,
  entry_hash TEXT NOT NULL,
  FOREIGN KEY (request_id) REFERENCES request_log(request_id)
);

CREATE TABLE IF NOT EXISTS request_log_details (
  request_id INTEGER PRIMARY KEY,
  para_1 TEXT,
  para_2 TEXT,
  para_3 TEXT,
  para_4 TEXT,
  para_5 TEXT,
  para_6 TEXT,
  para_7 TEXT,
  para_8 TEXT,
  para_9 TEXT,
  para_10 TEXT,
  FOREIGN KEY (request_id) REFERENCES request_log(request_id)
);

CREATE TABLE IF NOT EXISTS monitor_log (
  monitor_id INTEGER PRIMARY KEY AUTOINCREMENT,
  created_at TEXT NOT NULL,
  case_id TEXT NOT NULL,
  request_id INTEGER,
  order_id INTEGER NOT NULL,
  account_number TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('open','resolved','failed','expired','cancelled')),
  status_changed_at TEXT NOT NULL,
  status_description TEXT,
  last_checked_at TEXT,
  next_check_at TEXT NOT NULL,
  expire_at TEXT NOT NULL,
  poll_count INTEGER NOT NULL CHECK (poll_count >= 0),
  FOREIGN KEY (request_id) REFERENCES request_log(request_id)
);

CREATE TABLE IF NOT EXISTS monitor_progress_log (
  entry_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  entry_id TEXT NOT NULL UNIQUE,
  monitor_id INTEGER NOT NULL,
  recorded_at TEXT NOT NULL,
  snapshot_json TEXT NOT NULL,
  snapshot_hash TEXT NOT NULL,
  prev_entry_hash TEXT,
  entry_hash TEXT NOT NULL,
  FOREIGN KEY (monitor_id) REFERENCES monitor_log(monitor_id)
);

CREATE TABLE IF NOT EXISTS monitor_log_details (
  monitor_id INTEGER PRIMARY KEY,
  para_1 TEXT,
  para_2 TEXT,
  para_3 TEXT,
  para_4 TEXT,
  para_5 TEXT,
  para_6 TEXT,
  para_7 TEXT,
  para_8 TEXT,
  para_9 TEXT,
  para_10 TEXT,
  FOREIGN KEY (monitor_id) REFERENCES monitor_log(monitor_id)
);

CREATE INDEX IF NOT EXISTS idx_request_progress_request_seq
  ON request_progress_log(request_id, entry_seq);
CREATE INDEX IF NOT EXISTS idx_monitor_progress_monitor_seq
  ON monitor_progress_log(monitor_id, entry_seq);
CREATE INDEX IF NOT EXISTS idx_monitor_log_status_next
  ON monitor_log(status, next_check_at);

CREATE TRIGGER IF NOT EXISTS trg_request_progress_log_no_update
BEFORE UPDATE ON request_progress_log
BEGIN
  SELECT RAISE(FAIL, 'request_progress_log is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_request_progress_log_no_delete
BEFORE DELETE ON request_progress_log
BEGIN
  SELECT RAISE(FAIL, 'request_progress_log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_monitor_progress_log_no_update
BEFORE UPDATE ON monitor_progress_log
BEGIN
  SELECT RAISE(FAIL, 'monitor_progress_log is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_monitor_progress_log_no_delete
BEFORE DELETE ON monitor_progress_log
BEGIN
  SELECT RAISE(FAIL, 'monitor_progress_log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_request_log_details_no_update
BEFORE UPDATE ON request_log_details
BEGIN
  SELECT RAISE(FAIL, 'request_log_details is write-once');
END;
CREATE TRIGGER IF NOT EXISTS trg_request_log_details_no_delete
BEFORE DELETE ON request_log_details
BEGIN
  SELECT RAISE(FAIL, 'request_log_details is write-once');
END;

CREATE TRIGGER IF NOT EXISTS trg_monitor_log_details_no_update
BEFORE UPDATE ON monitor_log_details
BEGIN
  SELECT RAISE(FAIL, 'monitor_log_details is write-once');
END;
CREATE TRIGGER IF NOT EXISTS trg_monitor_log_details_no_delete
BEFORE DELETE ON monitor_log_details
BEGIN
  SELECT RAISE(FAIL, 'monitor_log_details is write-once');
END;
";

pub struct SqliteLedgerStore {
    conn: Connection,
}

impl SqliteLedgerStore {
    /// Open or create a `SQLite` ledger database and configure local pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }
}

impl LedgerStore for SqliteLedgerStore {
    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA_V1)
            .context("failed to apply ledger schema")?;

        let now = rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![LEDGER_SCHEMA_VERSION, now],
            )
            .context("failed to record ledger migration")?;

        Ok(())
    }

    fn insert_request(&self, draft: &RequestDraft) -> Result<RequestRecord> {
        let tx = self.conn.unchecked_transaction()?;

        tx.execute(
            "INSERT INTO request_log(
                created_at, case_id, order_id, account_number,
                status, status_changed_at, status_description
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                rfc3339(draft.created_at)?,
                draft.case_id,
                draft.order_id,
                draft.account_number,
                draft.status.as_str(),
                rfc3339(draft.status_changed_at)?,
                draft.status_description,
            ],
        )
        .context("failed to insert request_log row")?;

        let record = RequestRecord {
            request_id: RequestId(tx.last_insert_rowid()),
            created_at: draft.created_at,
            case_id: draft.case_id.clone(),
            order_id: draft.order_id,
            account_number: draft.account_number.clone(),
            status: draft.status,
            status_changed_at: draft.status_changed_at,
            status_description: draft.status_description.clone(),
        };

        append_request_history(&tx, &record)?;
        tx.commit()?;
        Ok(record)
    }

    fn update_request(&self, record: &RequestRecord) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;

        let changed = tx
            .execute(
                "UPDATE request_log SET
                    case_id = ?2,
                    order_id = ?3,
                    account_number = ?4,
                    status = ?5,
                    status_changed_at = ?6,
                    status_description = ?7
                 WHERE request_id = ?1",
                params![
                    record.request_id.0,
                    record.case_id,
                    record.order_id,
                    record.account_number,
                    record.status.as_str(),
                    rfc3339(record.status_changed_at)?,
                    record.status_description,
                ],
            )
            .context("failed to update request_log row")?;
        if changed != 1 {
            return Err(anyhow!("request {} does not exist", record.request_id));
        }

        append_request_history(&tx, record)?;
        tx.commit()?;
        Ok(())
    }

    fn get_request(&self, request_id: RequestId) -> Result<Option<RequestRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                request_id, created_at, case_id, order_id, account_number,
                status, status_changed_at, status_description
             FROM request_log WHERE request_id = ?1",
        )?;

        let mut rows = stmt.query(params![request_id.0])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_request(row)?)),
            None => Ok(None),
        }
    }

    fn list_requests(&self) -> Result<Vec<RequestRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                request_id, created_at, case_id, order_id, account_number,
                status, status_changed_at, status_description
             FROM request_log
             ORDER BY request_id ASC",
        )?;

        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_request(row)?);
        }
        Ok(out)
    }

    fn request_history(&self, request_id: RequestId) -> Result<Vec<RequestHistoryRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                entry_seq, entry_id, recorded_at, snapshot_json,
                snapshot_hash, prev_entry_hash, entry_hash
             FROM request_progress_log
             WHERE request_id = ?1
             ORDER BY entry_seq ASC",
        )?;

        let mut rows = stmt.query(params![request_id.0])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let entry_id_raw: String = row.get(1)?;
            let snapshot_json: String = row.get(3)?;
            out.push(RequestHistoryRow {
                entry_seq: row.get(0)?,
                entry: RequestHistoryEntry {
                    entry_id: Ulid::from_str(&entry_id_raw)
                        .map_err(|err| anyhow!("invalid entry_id ULID: {err}"))?,
                    recorded_at: parse_rfc3339(&row.get::<_, String>(2)?)?,
                    snapshot: serde_json::from_str(&snapshot_json)
                        .context("invalid request snapshot_json")?,
                    snapshot_hash: row.get(4)?,
                    prev_entry_hash: row.get(5)?,
                    entry_hash: row.get(6)?,
                },
            });
        }
        Ok(out)
    }

    fn put_request_details(&self, request_id: RequestId, details: &DetailRecord) -> Result<bool> {
        let tx = self.conn.unchecked_transaction()?;
        let exists: Option<i64> = tx
            .query_row(
                "SELECT request_id FROM request_log_details WHERE request_id = ?1",
                params![request_id.0],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Ok(false);
        }

        tx.execute(
            "INSERT INTO request_log_details(
                request_id, para_1, para_2, para_3, para_4, para_5,
                para_6, para_7, para_8, para_9, para_10
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                request_id.0,
                details.slot(1),
                details.slot(2),
                details.slot(3),
                details.slot(4),
                details.slot(5),
                details.slot(6),
                details.slot(7),
                details.slot(8),
                details.slot(9),
                details.slot(10),
            ],
        )
        .context("failed to insert request_log_details row")?;
        tx.commit()?;
        Ok(true)
    }

    fn get_request_details(&self, request_id: RequestId) -> Result<Option<DetailRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                para_1, para_2, para_3, para_4, para_5,
                para_6, para_7, para_8, para_9, para_10
             FROM request_log_details WHERE request_id = ?1",
        )?;

        let mut rows = stmt.query(params![request_id.0])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_details(row)?)),
            None => Ok(None),
        }
    }

    fn insert_monitor(&self, draft: &MonitorDraft) -> Result<MonitorRecord> {
        let tx = self.conn.unchecked_transaction()?;

        tx.execute(
            "INSERT INTO monitor_log(
                created_at, case_id, request_id, order_id, account_number,
                status, status_changed_at, status_description,
                last_checked_at, next_check_at, expire_at, poll_count
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                rfc3339(draft.created_at)?,
                draft.case_id,
                draft.request_id.map(|id| id.0),
                draft.order_id,
                draft.account_number,
                draft.status.as_str(),
                rfc3339(draft.status_changed_at)?,
                draft.status_description,
                draft.last_checked_at.map(rfc3339).transpose()?,
                rfc3339(draft.next_check_at)?,
                rfc3339(draft.expire_at)?,
                i64::from(draft.poll_count),
            ],
        )
        .context("failed to insert monitor_log row")?;

        let record = MonitorRecord {
            monitor_id: MonitorId(tx.last_insert_rowid()),
            created_at: draft.created_at,
            case_id: draft.case_id.clone(),
            request_id: draft.request_id,
            order_id: draft.order_id,
            account_number: draft.account_number.clone(),
            status: draft.status,
            status_changed_at: draft.status_changed_at,
            status_description: draft.status_description.clone(),
            last_checked_at: draft.last_checked_at,
            next_check_at: draft.next_check_at,
            expire_at: draft.expire_at,
            poll_count: draft.poll_count,
        };

        append_monitor_history(&tx, &record)?;
        tx.commit()?;
        Ok(record)
    }

    fn update_monitor(&self, record: &MonitorRecord) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;

        let changed = tx
            .execute(
                "UPDATE monitor_log SET
                    case_id = ?2,
                    request_id = ?3,
                    order_id = ?4,
                    account_number = ?5,
                    status = ?6,
                    status_changed_at = ?7,
                    status_description = ?8,
                    last_checked_at = ?9,
                    next_check_at = ?10,
                    expire_at = ?11,
                    poll_count = ?12
                 WHERE monitor_id = ?1",
                params![
                    record.monitor_id.0,
                    record.case_id,
                    record.request_id.map(|id| id.0),
                    record.order_id,
                    record.account_number,
                    record.status.as_str(),
                    rfc3339(record.status_changed_at)?,
                    record.status_description,
                    record.last_checked_at.map(rfc3339).transpose()?,
                    rfc3339(record.next_check_at)?,
                    rfc3339(record.expire_at)?,
                    i64::from(record.poll_count),
                ],
            )
            .context("failed to update monitor_log row")?;
        if changed != 1 {
            return Err(anyhow!("monitor {} does not exist", record.monitor_id));
        }

        append_monitor_history(&tx, record)?;
        tx.commit()?;
        Ok(())
    }

    fn get_monitor(&self, monitor_id: MonitorId) -> Result<Option<MonitorRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                monitor_id, created_at, case_id, request_id, order_id,
                account_number, status, status_changed_at, status_description,
                last_checked_at, next_check_at, expire_at, poll_count
             FROM monitor_log WHERE monitor_id = ?1",
        )?;

        let mut rows = stmt.query(params![monitor_id.0])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_monitor(row)?)),
            None => Ok(None),
        }
    }

    fn list_monitors(&self) -> Result<Vec<MonitorRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                monitor_id, created_at, case_id, request_id, order_id,
                account_number, status, status_changed_at, status_description,
                last_checked_at, next_check_at, expire_at, poll_count
             FROM monitor_log
             ORDER BY monitor_id ASC",
        )?;

        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_monitor(row)?);
        }
        Ok(out)
    }

    fn monitor_history(&self, monitor_id: MonitorId) -> Result<Vec<MonitorHistoryRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                entry_seq, entry_id, recorded_at, snapshot_json,
                snapshot_hash, prev_entry_hash, entry_hash
             FROM monitor_progress_log
             WHERE monitor_id = ?1
             ORDER BY entry_seq ASC",
        )?;

        let mut rows = stmt.query(params![monitor_id.0])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let entry_id_raw: String = row.get(1)?;
            let snapshot_json: String = row.get(3)?;
            out.push(MonitorHistoryRow {
                entry_seq: row.get(0)?,
                entry: MonitorHistoryEntry {
                    entry_id: Ulid::from_str(&entry_id_raw)
                        .map_err(|err| anyhow!("invalid entry_id ULID: {err}"))?,
                    recorded_at: parse_rfc3339(&row.get::<_, String>(2)?)?,
                    snapshot: serde_json::from_str(&snapshot_json)
                        .context("invalid monitor snapshot_json")?,
                    snapshot_hash: row.get(4)?,
                    prev_entry_hash: row.get(5)?,
                    entry_hash: row.get(6)?,
                },
            });
        }
        Ok(out)
    }

    fn put_monitor_details(&self, monitor_id: MonitorId, details: &DetailRecord) -> Result<bool> {
        let tx = self.conn.unchecked_transaction()?;
        let exists: Option<i64> = tx
            .query_row(
                "SELECT monitor_id FROM monitor_log_details WHERE monitor_id = ?1",
                params![monitor_id.0],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Ok(false);
        }

        tx.execute(
            "INSERT INTO monitor_log_details(
                monitor_id, para_1, para_2, para_3, para_4, para_5,
                para_6, para_7, para_8, para_9, para_10
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                monitor_id.0,
                details.slot(1),
                details.slot(2),
                details.slot(3),
                details.slot(4),
                details.slot(5),
                details.slot(6),
                details.slot(7),
                details.slot(8),
                details.slot(9),
                details.slot(10),
            ],
        )
        .context("failed to insert monitor_log_details row")?;
        tx.commit()?;
        Ok(true)
    }

    fn get_monitor_details(&self, monitor_id: MonitorId) -> Result<Option<DetailRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                para_1, para_2, para_3, para_4, para_5,
                para_6, para_7, para_8, para_9, para_10
             FROM monitor_log_details WHERE monitor_id = ?1",
        )?;

        let mut rows = stmt.query(params![monitor_id.0])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_details(row)?)),
            None => Ok(None),
        }
    }

    fn due_monitors(&self, now: OffsetDateTime) -> Result<Vec<MonitorRecord>> {
        // RFC3339 text has variable subsecond precision, so the timestamp
        // comparison happens on parsed values rather than in SQL.
        let mut stmt = self.conn.prepare(
            "SELECT
                monitor_id, created_at, case_id, request_id, order_id,
                account_number, status, status_changed_at, status_description,
                last_checked_at, next_check_at, expire_at, poll_count
             FROM monitor_log
             WHERE status = 'open'",
        )?;

        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let monitor = row_to_monitor(row)?;
            if monitor.next_check_at <= now || monitor.expire_at <= now {
                out.push(monitor);
            }
        }
        out.sort_by_key(|monitor| (monitor.next_check_at, monitor.monitor_id));
        Ok(out)
    }
}

fn append_request_history(tx: &Transaction<'_>, snapshot: &RequestRecord) -> Result<()> {
    let prev_entry_hash: Option<String> = tx
        .query_row(
            "SELECT entry_hash FROM request_progress_log
             WHERE request_id = ?1 ORDER BY entry_seq DESC LIMIT 1",
            params![snapshot.request_id.0],
            |row| row.get(0),
        )
        .optional()?;

    let entry_id = Ulid::new();
    let recorded_at = rfc3339(now_utc())?;
    let snapshot_hash = compute_request_snapshot_hash(snapshot)?;
    let entry_hash = compute_entry_hash(
        entry_id,
        &recorded_at,
        &snapshot_hash,
        prev_entry_hash.as_deref(),
    )?;

    tx.execute(
        "INSERT INTO request_progress_log(
            entry_id, request_id, recorded_at, snapshot_json,
            snapshot_hash, prev_entry_hash, entry_hash
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            entry_id.to_string(),
            snapshot.request_id.0,
            recorded_at,
            serde_json::to_string(snapshot)?,
            snapshot_hash,
            prev_entry_hash,
            entry_hash,
        ],
    )
    .context("failed to append request_progress_log entry")?;
    Ok(())
}

fn append_monitor_history(tx: &Transaction<'_>, snapshot: &MonitorRecord) -> Result<()> {
    let prev_entry_hash: Option<String> = tx
        .query_row(
            "SELECT entry_hash FROM monitor_progress_log
             WHERE monitor_id = ?1 ORDER BY entry_seq DESC LIMIT 1",
            params![snapshot.monitor_id.0],
            |row| row.get(0),
        )
        .optional()?;

    let entry_id = Ulid::new();
    let recorded_at = rfc3339(now_utc())?;
    let snapshot_hash = compute_monitor_snapshot_hash(snapshot)?;
    let entry_hash = compute_entry_hash(
        entry_id,
        &recorded_at,
        &snapshot_hash,
        prev_entry_hash.as_deref(),
    )?;

    tx.execute(
        "INSERT INTO monitor_progress_log(
            entry_id, monitor_id, recorded_at, snapshot_json,
            snapshot_hash, prev_entry_hash, entry_hash
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            entry_id.to_string(),
            snapshot.monitor_id.0,
            recorded_at,
            serde_json::to_string(snapshot)?,
            snapshot_hash,
            prev_entry_hash,
            entry_hash,
        ],
    )
    .context("failed to append monitor_progress_log entry")?;
    Ok(())
}

fn row_to_request(row: &Row<'_>) -> Result<RequestRecord> {
    Ok(RequestRecord {
        request_id: RequestId(row.get(0)?),
        created_at: parse_rfc3339(&row.get::<_, String>(1)?)?,
        case_id: row.get(2)?,
        order_id: row.get(3)?,
        account_number: row.get(4)?,
        status: parse_request_status(&row.get::<_, String>(5)?)?,
        status_changed_at: parse_rfc3339(&row.get::<_, String>(6)?)?,
        status_description: row.get(7)?,
    })
}

fn row_to_monitor(row: &Row<'_>) -> Result<MonitorRecord> {
    let poll_count: i64 = row.get(12)?;
    Ok(MonitorRecord {
        monitor_id: MonitorId(row.get(0)?),
        created_at: parse_rfc3339(&row.get::<_, String>(1)?)?,
        case_id: row.get(2)?,
        request_id: row.get::<_, Option<i64>>(3)?.map(RequestId),
        order_id: row.get(4)?,
        account_number: row.get(5)?,
        status: parse_monitor_status(&row.get::<_, String>(6)?)?,
        status_changed_at: parse_rfc3339(&row.get::<_, String>(7)?)?,
        status_description: row.get(8)?,
        last_checked_at: row
            .get::<_, Option<String>>(9)?
            .map(|v| parse_rfc3339(&v))
            .transpose()?,
        next_check_at: parse_rfc3339(&row.get::<_, String>(10)?)?,
        expire_at: parse_rfc3339(&row.get::<_, String>(11)?)?,
        poll_count: u32::try_from(poll_count)
            .map_err(|_| anyhow!("invalid poll_count: {poll_count}"))?,
    })
}

fn row_to_details(row: &Row<'_>) -> Result<DetailRecord> {
    let mut details = DetailRecord::new();
    for index in 1..=DETAIL_SLOT_COUNT {
        let value: Option<String> = row.get(index - 1)?;
        if let (Some(name), Some(value)) = (detail_slot_name(index), value) {
            details.set(&name, value)?;
        }
    }
    Ok(details)
}

fn parse_request_status(value: &str) -> Result<RequestStatus> {
    RequestStatus::parse(value).ok_or_else(|| anyhow!("unknown request status: {value}"))
}

fn parse_monitor_status(value: &str) -> Result<MonitorStatus> {
    MonitorStatus::parse(value).ok_or_else(|| anyhow!("unknown monitor status: {value}"))
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid datetime format: {err}"))
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid RFC3339 datetime: {err}"))
}
