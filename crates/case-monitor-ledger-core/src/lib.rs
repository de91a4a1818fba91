#![forbid(unsafe_code)]

use anyhow::Result;
use case_monitor_domain::{
    DateTimeUtc, DetailRecord, MonitorDraft, MonitorHistoryRow, MonitorId, MonitorRecord,
    RequestDraft, RequestHistoryRow, RequestId, RequestRecord,
};

/// Append-only ledger over requests and case monitors.
///
/// Every mutation writes the new current state and a chained history
/// snapshot in one transaction; current state is never updated without a
/// matching history entry.
pub trait LedgerStore {
    #[allow(clippy::missing_errors_doc)]
    fn migrate(&self) -> Result<()>;

    /// Insert a new request, assign its id, and write the first history
    /// entry atomically.
    #[allow(clippy::missing_errors_doc)]
    fn insert_request(&self, draft: &RequestDraft) -> Result<RequestRecord>;

    /// Overwrite the current request row and append a history entry
    /// atomically. The record must already exist.
    #[allow(clippy::missing_errors_doc)]
    fn update_request(&self, record: &RequestRecord) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn get_request(&self, request_id: RequestId) -> Result<Option<RequestRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_requests(&self) -> Result<Vec<RequestRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn request_history(&self, request_id: RequestId) -> Result<Vec<RequestHistoryRow>>;

    /// Attach a detail record to a request. Returns `false` without
    /// writing when details already exist for the request.
    #[allow(clippy::missing_errors_doc)]
    fn put_request_details(&self, request_id: RequestId, details: &DetailRecord) -> Result<bool>;

    #[allow(clippy::missing_errors_doc)]
    fn get_request_details(&self, request_id: RequestId) -> Result<Option<DetailRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_monitor(&self, draft: &MonitorDraft) -> Result<MonitorRecord>;

    #[allow(clippy::missing_errors_doc)]
    fn update_monitor(&self, record: &MonitorRecord) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn get_monitor(&self, monitor_id: MonitorId) -> Result<Option<MonitorRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_monitors(&self) -> Result<Vec<MonitorRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn monitor_history(&self, monitor_id: MonitorId) -> Result<Vec<MonitorHistoryRow>>;

    #[allow(clippy::missing_errors_doc)]
    fn put_monitor_details(&self, monitor_id: MonitorId, details: &DetailRecord) -> Result<bool>;

    #[allow(clippy::missing_errors_doc)]
    fn get_monitor_details(&self, monitor_id: MonitorId) -> Result<Option<DetailRecord>>;

    /// Open monitors with `next_check_at <= now` or `expire_at <= now`,
    /// ordered by `next_check_at` then monitor id.
    #[allow(clippy::missing_errors_doc)]
    fn due_monitors(&self, now: DateTimeUtc) -> Result<Vec<MonitorRecord>>;
}
