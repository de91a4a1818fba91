#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use case_monitor_checker::{CaseCheckResult, CaseChecker, HttpCheckerConfig, ObservedCaseStatus};
use case_monitor_domain::{
    compute_entry_hash, compute_monitor_snapshot_hash, compute_request_snapshot_hash,
    ensure_non_empty, format_rfc3339, now_utc, DateTimeUtc, DetailRecord, EntityKind,
    MonitorDraft, MonitorId, MonitorRecord, MonitorStatus, RequestDraft, RequestId, RequestRecord,
    RequestStatus, TrackError,
};
use case_monitor_ledger_core::LedgerStore;
use serde::{Deserialize, Serialize};
use time::Duration;

/// Recheck spacing between polls of an open monitor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    Fixed {
        interval_minutes: u32,
    },
    Exponential {
        initial_minutes: u32,
        factor: f64,
        max_minutes: u32,
    },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        // One recheck per day unless configured otherwise.
        Self::Fixed {
            interval_minutes: 24 * 60,
        }
    }
}

impl BackoffPolicy {
    /// # Errors
    /// Returns [`TrackError::Validation`] when the policy parameters are
    /// out of range.
    pub fn validate(&self) -> Result<(), TrackError> {
        match self {
            Self::Fixed { interval_minutes } => {
                if *interval_minutes == 0 {
                    return Err(TrackError::Validation(
                        "backoff.interval_minutes MUST be positive".to_string(),
                    ));
                }
            }
            Self::Exponential {
                initial_minutes,
                factor,
                max_minutes,
            } => {
                if *initial_minutes == 0 {
                    return Err(TrackError::Validation(
                        "backoff.initial_minutes MUST be positive".to_string(),
                    ));
                }
                if !factor.is_finite() || *factor < 1.0 {
                    return Err(TrackError::Validation(
                        "backoff.factor MUST be a finite value >= 1.0".to_string(),
                    ));
                }
                if max_minutes < initial_minutes {
                    return Err(TrackError::Validation(
                        "backoff.max_minutes MUST be >= backoff.initial_minutes".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Spacing after the `poll_count`-th poll (1-based).
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn interval(&self, poll_count: u32) -> Duration {
        match self {
            Self::Fixed { interval_minutes } => Duration::minutes(i64::from(*interval_minutes)),
            Self::Exponential {
                initial_minutes,
                factor,
                max_minutes,
            } => {
                let exponent = poll_count.saturating_sub(1).min(64);
                let minutes = f64::from(*initial_minutes)
                    * factor.powi(i32::try_from(exponent).unwrap_or(i32::MAX));
                let capped = minutes.min(f64::from(*max_minutes));
                Duration::minutes(capped.round() as i64)
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub backoff: BackoffPolicy,
    #[serde(default)]
    pub checker: Option<HttpCheckerConfig>,
}

impl SchedulerConfig {
    /// # Errors
    /// Returns an error when the backoff policy or checker section is
    /// invalid.
    pub fn validate(&self) -> Result<()> {
        self.backoff.validate()?;
        if let Some(checker) = &self.checker {
            checker.validate()?;
        }
        Ok(())
    }
}

/// Load and validate a YAML scheduler configuration.
///
/// # Errors
/// Returns an error when the file cannot be read, is not valid YAML, or
/// fails validation.
pub fn load_scheduler_config(path: &Path) -> Result<SchedulerConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read scheduler config at {}", path.display()))?;
    let config: SchedulerConfig =
        serde_yaml::from_str(&content).context("invalid scheduler config yaml")?;
    config.validate()?;
    Ok(config)
}

/// Chain verification result over one entity's history.
#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
pub struct AuditReport {
    pub entries: usize,
    pub chain_valid: bool,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RequestSubmission {
    pub case_id: Option<String>,
    pub order_id: i64,
    pub account_number: String,
    pub status_description: Option<String>,
}

pub struct RequestTracker<'a> {
    store: &'a dyn LedgerStore,
}

impl<'a> RequestTracker<'a> {
    #[must_use]
    pub fn new(store: &'a dyn LedgerStore) -> Self {
        Self { store }
    }

    /// Validate and record a new request. Requests start `open`.
    ///
    /// # Errors
    /// Returns [`TrackError::Validation`] for an empty account number or a
    /// non-positive order id, or a storage error.
    pub fn create(&self, submission: &RequestSubmission) -> Result<RequestRecord> {
        ensure_non_empty("account_number", &submission.account_number)?;
        if submission.order_id <= 0 {
            return Err(TrackError::Validation(format!(
                "order_id MUST be positive, got {}",
                submission.order_id
            ))
            .into());
        }
        if let Some(case_id) = &submission.case_id {
            ensure_non_empty("case_id", case_id)?;
        }

        let now = now_utc();
        self.store.insert_request(&RequestDraft {
            created_at: now,
            case_id: submission.case_id.clone(),
            order_id: submission.order_id,
            account_number: submission.account_number.clone(),
            status: RequestStatus::Open,
            status_changed_at: now,
            status_description: submission.status_description.clone(),
        })
    }

    /// Move a request to `status`, replacing its description.
    ///
    /// Request statuses carry no transition restrictions; a completed
    /// request may be reopened.
    ///
    /// # Errors
    /// Returns [`TrackError::NotFound`] for an unknown request id, or a
    /// storage error.
    pub fn transition(
        &self,
        request_id: RequestId,
        status: RequestStatus,
        description: Option<String>,
    ) -> Result<RequestRecord> {
        let mut record = self.require(request_id)?;
        record.status = status;
        record.status_changed_at = now_utc();
        record.status_description = description;
        self.store.update_request(&record)?;
        Ok(record)
    }

    /// Attach the write-once detail record of a request.
    ///
    /// # Errors
    /// Returns [`TrackError::NotFound`] for an unknown request id,
    /// [`TrackError::DetailConflict`] when details were already attached,
    /// or a storage error.
    pub fn attach_details(&self, request_id: RequestId, details: &DetailRecord) -> Result<()> {
        self.require(request_id)?;
        if !self.store.put_request_details(request_id, details)? {
            return Err(TrackError::DetailConflict {
                entity: EntityKind::Request,
                id: request_id.0,
            }
            .into());
        }
        Ok(())
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn get(&self, request_id: RequestId) -> Result<Option<RequestRecord>> {
        self.store.get_request(request_id)
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn list(&self) -> Result<Vec<RequestRecord>> {
        self.store.list_requests()
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn details(&self, request_id: RequestId) -> Result<Option<DetailRecord>> {
        self.require(request_id)?;
        self.store.get_request_details(request_id)
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn history(
        &self,
        request_id: RequestId,
    ) -> Result<Vec<case_monitor_domain::RequestHistoryRow>> {
        self.require(request_id)?;
        self.store.request_history(request_id)
    }

    /// Recompute and verify the history hash chain of a request.
    ///
    /// # Errors
    /// Returns [`TrackError::NotFound`] for an unknown request id, or a
    /// storage error.
    pub fn audit(&self, request_id: RequestId) -> Result<AuditReport> {
        self.require(request_id)?;
        let rows = self.store.request_history(request_id)?;
        let mut prev: Option<String> = None;
        let mut chain_valid = true;
        for row in &rows {
            let snapshot_hash = compute_request_snapshot_hash(&row.entry.snapshot)?;
            let entry_hash = compute_entry_hash(
                row.entry.entry_id,
                &format_rfc3339(row.entry.recorded_at)?,
                &row.entry.snapshot_hash,
                row.entry.prev_entry_hash.as_deref(),
            )?;
            if row.entry.prev_entry_hash != prev
                || row.entry.snapshot_hash != snapshot_hash
                || row.entry.entry_hash != entry_hash
            {
                chain_valid = false;
                break;
            }
            prev = Some(row.entry.entry_hash.clone());
        }
        Ok(AuditReport {
            entries: rows.len(),
            chain_valid,
        })
    }

    fn require(&self, request_id: RequestId) -> Result<RequestRecord> {
        self.store
            .get_request(request_id)?
            .ok_or_else(|| {
                TrackError::NotFound {
                    entity: EntityKind::Request,
                    id: request_id.0,
                }
                .into()
            })
    }
}

/// Parameters for placing a case under monitoring.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MonitorRequest {
    pub case_id: String,
    pub request_id: Option<RequestId>,
    pub order_id: i64,
    pub account_number: String,
    pub expire_at: DateTimeUtc,
    /// Delay before the first check; defaults to one backoff interval.
    pub initial_delay: Option<Duration>,
}

/// What one poll of a monitored case concluded.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PollObservation {
    Resolved { description: Option<String> },
    Failed { description: Option<String> },
    StillOpen { description: Option<String> },
    Unavailable { reason: String },
}

/// Counters for one scheduler pass.
#[derive(Debug, Clone, Copy, Default, Serialize, Eq, PartialEq)]
pub struct TickSummary {
    pub polled: usize,
    pub resolved: usize,
    pub failed: usize,
    pub expired: usize,
    pub rescheduled: usize,
    pub skipped: usize,
}

pub struct MonitorScheduler<'a> {
    store: &'a dyn LedgerStore,
    backoff: BackoffPolicy,
    in_flight: Mutex<BTreeSet<i64>>,
}

impl<'a> MonitorScheduler<'a> {
    /// # Errors
    /// Returns [`TrackError::Validation`] when the backoff policy is
    /// invalid.
    pub fn new(store: &'a dyn LedgerStore, backoff: BackoffPolicy) -> Result<Self> {
        backoff.validate()?;
        Ok(Self {
            store,
            backoff,
            in_flight: Mutex::new(BTreeSet::new()),
        })
    }

    /// Place a case under monitoring as of `now`.
    ///
    /// # Errors
    /// Returns [`TrackError::Validation`] when the request is malformed,
    /// the expiry is not after `now`, or the first check would land
    /// beyond the expiry; otherwise a storage error.
    pub fn start_monitoring(
        &self,
        request: &MonitorRequest,
        now: DateTimeUtc,
    ) -> Result<MonitorRecord> {
        ensure_non_empty("case_id", &request.case_id)?;
        ensure_non_empty("account_number", &request.account_number)?;
        if request.order_id <= 0 {
            return Err(TrackError::Validation(format!(
                "order_id MUST be positive, got {}",
                request.order_id
            ))
            .into());
        }

        if request.expire_at <= now {
            return Err(TrackError::Validation(
                "expire_at MUST be in the future".to_string(),
            )
            .into());
        }

        let next_check_at =
            now + request.initial_delay.unwrap_or_else(|| self.backoff.interval(1));
        if next_check_at > request.expire_at {
            return Err(TrackError::Validation(
                "first check would fall after expire_at".to_string(),
            )
            .into());
        }

        self.store.insert_monitor(&MonitorDraft {
            created_at: now,
            case_id: request.case_id.clone(),
            request_id: request.request_id,
            order_id: request.order_id,
            account_number: request.account_number.clone(),
            status: MonitorStatus::Open,
            status_changed_at: now,
            status_description: None,
            last_checked_at: None,
            next_check_at,
            expire_at: request.expire_at,
            poll_count: 0,
        })
    }

    /// Open monitors whose next check (or expiry) has come due at `now`.
    #[allow(clippy::missing_errors_doc)]
    pub fn due(&self, now: DateTimeUtc) -> Result<Vec<MonitorRecord>> {
        self.store.due_monitors(now)
    }

    /// Record the outcome of one poll of an open monitor.
    ///
    /// The monitor's `last_checked_at` and `poll_count` always advance. A
    /// resolved or failed observation makes the monitor terminal without
    /// touching `next_check_at`. Anything else reschedules, unless the
    /// next slot would fall past `expire_at`, in which case the monitor
    /// expires instead. A terminal outcome also settles the linked
    /// request, when one exists.
    ///
    /// # Errors
    /// Returns [`TrackError::NotFound`] for an unknown monitor id,
    /// [`TrackError::InvalidTransition`] when the monitor is already
    /// terminal, or a storage error.
    pub fn record_poll(
        &self,
        monitor_id: MonitorId,
        observation: &PollObservation,
        now: DateTimeUtc,
    ) -> Result<MonitorRecord> {
        let mut record = self.require(monitor_id)?;
        if record.status.is_terminal() {
            return Err(TrackError::InvalidTransition {
                entity: EntityKind::Monitor,
                id: monitor_id.0,
                status: record.status.to_string(),
            }
            .into());
        }

        record.last_checked_at = Some(now);
        record.poll_count = record.poll_count.saturating_add(1);

        match observation {
            PollObservation::Resolved { description } => {
                record.status = MonitorStatus::Resolved;
                record.status_changed_at = now;
                record.status_description = description.clone();
            }
            PollObservation::Failed { description } => {
                record.status = MonitorStatus::Failed;
                record.status_changed_at = now;
                record.status_description = description.clone();
            }
            PollObservation::StillOpen { description } => {
                self.reschedule_or_expire(&mut record, now);
                if record.status == MonitorStatus::Open {
                    record.status_description = description.clone();
                }
            }
            PollObservation::Unavailable { reason } => {
                self.reschedule_or_expire(&mut record, now);
                if record.status == MonitorStatus::Open {
                    record.status_description = Some(format!("check unavailable: {reason}"));
                }
            }
        }

        self.store.update_monitor(&record)?;
        if record.status.is_terminal() {
            self.settle_linked_request(&record)?;
        }
        Ok(record)
    }

    /// Expire a monitor whose window has lapsed.
    ///
    /// Expiring an already-expired monitor is a no-op; no history entry is
    /// written. A freshly expired monitor marks its linked request
    /// errored.
    ///
    /// # Errors
    /// Returns [`TrackError::NotFound`] for an unknown monitor id,
    /// [`TrackError::Validation`] when the window has not lapsed yet,
    /// [`TrackError::InvalidTransition`] when the monitor is terminal in a
    /// non-expired state, or a storage error.
    pub fn expire(&self, monitor_id: MonitorId, now: DateTimeUtc) -> Result<MonitorRecord> {
        let mut record = self.require(monitor_id)?;
        if record.status == MonitorStatus::Expired {
            return Ok(record);
        }
        if record.status.is_terminal() {
            return Err(TrackError::InvalidTransition {
                entity: EntityKind::Monitor,
                id: monitor_id.0,
                status: record.status.to_string(),
            }
            .into());
        }
        if now < record.expire_at {
            return Err(TrackError::Validation(format!(
                "monitor {monitor_id} has not lapsed yet"
            ))
            .into());
        }

        record.status = MonitorStatus::Expired;
        record.status_changed_at = now;
        record.status_description = Some("monitoring window lapsed".to_string());
        self.store.update_monitor(&record)?;
        self.settle_linked_request(&record)?;
        Ok(record)
    }

    /// Stop monitoring a case before it concludes. Cancelling completes
    /// the linked request, when one exists.
    ///
    /// # Errors
    /// Returns [`TrackError::NotFound`] for an unknown monitor id,
    /// [`TrackError::InvalidTransition`] when the monitor is already
    /// terminal, or a storage error.
    pub fn cancel(&self, monitor_id: MonitorId, reason: Option<String>) -> Result<MonitorRecord> {
        let mut record = self.require(monitor_id)?;
        if record.status.is_terminal() {
            return Err(TrackError::InvalidTransition {
                entity: EntityKind::Monitor,
                id: monitor_id.0,
                status: record.status.to_string(),
            }
            .into());
        }

        record.status = MonitorStatus::Cancelled;
        record.status_changed_at = now_utc();
        record.status_description = reason.or_else(|| Some("monitoring cancelled".to_string()));
        self.store.update_monitor(&record)?;
        self.settle_linked_request(&record)?;
        Ok(record)
    }

    /// Poll every due monitor once and settle the outcomes.
    ///
    /// Monitors whose window lapsed are expired without consulting the
    /// checker. A monitor already being polled (by a concurrent tick) is
    /// skipped.
    ///
    /// # Errors
    /// Returns an error when storage or the checker fails outright;
    /// per-case unavailability is absorbed as a reschedule.
    pub fn run_tick(&self, checker: &dyn CaseChecker, now: DateTimeUtc) -> Result<TickSummary> {
        let mut summary = TickSummary::default();

        for monitor in self.store.due_monitors(now)? {
            let Some(_guard) = self.try_acquire(monitor.monitor_id) else {
                summary.skipped += 1;
                continue;
            };

            if monitor.expire_at <= now {
                self.expire(monitor.monitor_id, now)?;
                summary.expired += 1;
                continue;
            }

            let observation = match checker.check_case(&monitor.case_id)? {
                CaseCheckResult::Observed(observation) => match observation.status {
                    ObservedCaseStatus::Resolved => PollObservation::Resolved {
                        description: observation.description,
                    },
                    ObservedCaseStatus::Failed => PollObservation::Failed {
                        description: observation.description,
                    },
                    ObservedCaseStatus::Open => PollObservation::StillOpen {
                        description: observation.description,
                    },
                },
                CaseCheckResult::Unavailable { reason } => PollObservation::Unavailable { reason },
            };

            summary.polled += 1;
            let updated = self.record_poll(monitor.monitor_id, &observation, now)?;
            match updated.status {
                MonitorStatus::Resolved => summary.resolved += 1,
                MonitorStatus::Failed => summary.failed += 1,
                MonitorStatus::Expired => summary.expired += 1,
                MonitorStatus::Open => summary.rescheduled += 1,
                MonitorStatus::Cancelled => {}
            }
        }

        Ok(summary)
    }

    /// Attach the write-once detail record of a monitor.
    ///
    /// # Errors
    /// Returns [`TrackError::NotFound`] for an unknown monitor id,
    /// [`TrackError::DetailConflict`] when details were already attached,
    /// or a storage error.
    pub fn attach_details(&self, monitor_id: MonitorId, details: &DetailRecord) -> Result<()> {
        self.require(monitor_id)?;
        if !self.store.put_monitor_details(monitor_id, details)? {
            return Err(TrackError::DetailConflict {
                entity: EntityKind::Monitor,
                id: monitor_id.0,
            }
            .into());
        }
        Ok(())
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn get(&self, monitor_id: MonitorId) -> Result<Option<MonitorRecord>> {
        self.store.get_monitor(monitor_id)
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn list(&self) -> Result<Vec<MonitorRecord>> {
        self.store.list_monitors()
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn details(&self, monitor_id: MonitorId) -> Result<Option<DetailRecord>> {
        self.require(monitor_id)?;
        self.store.get_monitor_details(monitor_id)
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn history(
        &self,
        monitor_id: MonitorId,
    ) -> Result<Vec<case_monitor_domain::MonitorHistoryRow>> {
        self.require(monitor_id)?;
        self.store.monitor_history(monitor_id)
    }

    /// Recompute and verify the history hash chain of a monitor.
    ///
    /// # Errors
    /// Returns [`TrackError::NotFound`] for an unknown monitor id, or a
    /// storage error.
    pub fn audit(&self, monitor_id: MonitorId) -> Result<AuditReport> {
        self.require(monitor_id)?;
        let rows = self.store.monitor_history(monitor_id)?;
        let mut prev: Option<String> = None;
        let mut chain_valid = true;
        for row in &rows {
            let snapshot_hash = compute_monitor_snapshot_hash(&row.entry.snapshot)?;
            let entry_hash = compute_entry_hash(
                row.entry.entry_id,
                &format_rfc3339(row.entry.recorded_at)?,
                &row.entry.snapshot_hash,
                row.entry.prev_entry_hash.as_deref(),
            )?;
            if row.entry.prev_entry_hash != prev
                || row.entry.snapshot_hash != snapshot_hash
                || row.entry.entry_hash != entry_hash
            {
                chain_valid = false;
                break;
            }
            prev = Some(row.entry.entry_hash.clone());
        }
        Ok(AuditReport {
            entries: rows.len(),
            chain_valid,
        })
    }

    // Resolved and cancelled monitors complete the request they were
    // opened for; failed and expired monitors mark it errored.
    fn settle_linked_request(&self, record: &MonitorRecord) -> Result<()> {
        let Some(request_id) = record.request_id else {
            return Ok(());
        };
        let status = match record.status {
            MonitorStatus::Resolved | MonitorStatus::Cancelled => RequestStatus::Completed,
            MonitorStatus::Failed | MonitorStatus::Expired => RequestStatus::Error,
            MonitorStatus::Open => return Ok(()),
        };
        RequestTracker::new(self.store).transition(
            request_id,
            status,
            record.status_description.clone(),
        )?;
        Ok(())
    }

    fn reschedule_or_expire(&self, record: &mut MonitorRecord, now: DateTimeUtc) {
        let candidate = now + self.backoff.interval(record.poll_count);
        if candidate > record.expire_at {
            record.status = MonitorStatus::Expired;
            record.status_changed_at = now;
            record.status_description = Some("monitoring window lapsed".to_string());
        } else {
            record.next_check_at = candidate;
        }
    }

    fn try_acquire(&self, monitor_id: MonitorId) -> Option<InFlightGuard<'_>> {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !in_flight.insert(monitor_id.0) {
            return None;
        }
        Some(InFlightGuard {
            set: &self.in_flight,
            id: monitor_id.0,
        })
    }

    fn require(&self, monitor_id: MonitorId) -> Result<MonitorRecord> {
        self.store
            .get_monitor(monitor_id)?
            .ok_or_else(|| {
                TrackError::NotFound {
                    entity: EntityKind::Monitor,
                    id: monitor_id.0,
                }
                .into()
            })
    }
}

struct InFlightGuard<'a> {
    set: &'a Mutex<BTreeSet<i64>>,
    id: i64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::{
        load_scheduler_config, BackoffPolicy, MonitorRequest, MonitorScheduler, PollObservation,
        RequestSubmission, RequestTracker, SchedulerConfig, TickSummary,
    };
    use case_monitor_checker::{
        CaseCheckResult, CaseObservation, MockCaseChecker, ObservedCaseStatus,
    };
    use case_monitor_domain::{
        now_utc, DetailRecord, MonitorStatus, RequestStatus, TrackError,
    };
    use case_monitor_ledger_core::LedgerStore;
    use case_monitor_ledger_sqlite::SqliteLedgerStore;
    use time::Duration;
    use ulid::Ulid;

    fn temp_db_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "case-monitor-engine-test-{}-{}.sqlite",
            name,
            Ulid::new()
        ))
    }

    fn open_store(name: &str) -> SqliteLedgerStore {
        let store = SqliteLedgerStore::open(&temp_db_path(name));
        assert!(store.is_ok());
        let store = store.unwrap_or_else(|_| unreachable!());
        assert!(store.migrate().is_ok());
        store
    }

    fn submission() -> RequestSubmission {
        RequestSubmission {
            case_id: Some("CASE-1".to_string()),
            order_id: 1,
            account_number: "AC-1001".to_string(),
            status_description: None,
        }
    }

    fn monitor_request(expire_at: time::OffsetDateTime) -> MonitorRequest {
        MonitorRequest {
            case_id: "CASE-1".to_string(),
            request_id: None,
            order_id: 1,
            account_number: "AC-1001".to_string(),
            expire_at,
            initial_delay: None,
        }
    }

    fn scheduler(store: &SqliteLedgerStore, backoff: BackoffPolicy) -> MonitorScheduler<'_> {
        let scheduler = MonitorScheduler::new(store, backoff);
        assert!(scheduler.is_ok());
        scheduler.unwrap_or_else(|_| unreachable!())
    }

    fn assert_track_error<T: std::fmt::Debug>(
        result: anyhow::Result<T>,
        matcher: impl Fn(&TrackError) -> bool,
    ) {
        assert!(result.is_err());
        let err = result.err().unwrap_or_else(|| unreachable!());
        let track = err.downcast_ref::<TrackError>();
        assert!(track.is_some_and(matcher), "unexpected error: {err:#}");
    }

    #[test]
    fn create_validates_submission() {
        let store = open_store("create-validate");
        let tracker = RequestTracker::new(&store);

        let mut bad = submission();
        bad.account_number = "  ".to_string();
        assert_track_error(tracker.create(&bad), |err| {
            matches!(err, TrackError::Validation(_))
        });

        let mut bad = submission();
        bad.order_id = 0;
        assert_track_error(tracker.create(&bad), |err| {
            matches!(err, TrackError::Validation(_))
        });

        let created = tracker.create(&submission());
        assert!(created.is_ok());
        let created = created.unwrap_or_else(|_| unreachable!());
        assert_eq!(created.status, RequestStatus::Open);
    }

    #[test]
    fn transition_is_unrestricted_and_recorded() {
        let store = open_store("transition");
        let tracker = RequestTracker::new(&store);
        let created = tracker.create(&submission());
        assert!(created.is_ok());
        let created = created.unwrap_or_else(|_| unreachable!());

        let completed = tracker.transition(
            created.request_id,
            RequestStatus::Completed,
            Some("settled".to_string()),
        );
        assert!(completed.is_ok());

        // Completed is not a dead end for requests.
        let reopened = tracker.transition(created.request_id, RequestStatus::Open, None);
        assert!(reopened.is_ok());
        let reopened = reopened.unwrap_or_else(|_| unreachable!());
        assert_eq!(reopened.status, RequestStatus::Open);
        assert_eq!(reopened.status_description, None);

        let history = tracker.history(created.request_id);
        assert!(history.is_ok());
        let history = history.unwrap_or_else(|_| unreachable!());
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].entry.snapshot, reopened);

        let audit = tracker.audit(created.request_id);
        assert!(audit.is_ok());
        let audit = audit.unwrap_or_else(|_| unreachable!());
        assert_eq!(audit.entries, 3);
        assert!(audit.chain_valid);
    }

    #[test]
    fn transition_unknown_request_is_not_found() {
        let store = open_store("transition-missing");
        let tracker = RequestTracker::new(&store);
        assert_track_error(
            tracker.transition(
                case_monitor_domain::RequestId(404),
                RequestStatus::Completed,
                None,
            ),
            |err| matches!(err, TrackError::NotFound { id: 404, .. }),
        );
    }

    #[test]
    fn attach_details_is_write_once() {
        let store = open_store("details-once");
        let tracker = RequestTracker::new(&store);
        let created = tracker.create(&submission());
        assert!(created.is_ok());
        let created = created.unwrap_or_else(|_| unreachable!());

        let details = DetailRecord::from_pairs(vec![("para_1".to_string(), "x".to_string())]);
        assert!(details.is_ok());
        let details = details.unwrap_or_else(|_| unreachable!());

        assert!(tracker.attach_details(created.request_id, &details).is_ok());

        let replacement = DetailRecord::from_pairs(vec![("para_1".to_string(), "y".to_string())]);
        assert!(replacement.is_ok());
        let replacement = replacement.unwrap_or_else(|_| unreachable!());
        assert_track_error(
            tracker.attach_details(created.request_id, &replacement),
            |err| matches!(err, TrackError::DetailConflict { .. }),
        );

        let stored = tracker.details(created.request_id);
        assert!(stored.is_ok());
        let stored = stored.unwrap_or_else(|_| unreachable!());
        assert!(stored.is_some());
        let stored = stored.unwrap_or_else(|| unreachable!());
        assert_eq!(stored.get("para_1"), Some("x"));
    }

    #[test]
    fn start_monitoring_enforces_window() {
        let store = open_store("start-window");
        let scheduler = scheduler(
            &store,
            BackoffPolicy::Fixed {
                interval_minutes: 60,
            },
        );

        let now = now_utc();
        let past = monitor_request(now - Duration::minutes(1));
        assert_track_error(scheduler.start_monitoring(&past, now), |err| {
            matches!(err, TrackError::Validation(_))
        });

        // Expiry closer than the first backoff interval.
        let narrow = monitor_request(now + Duration::minutes(5));
        assert_track_error(scheduler.start_monitoring(&narrow, now), |err| {
            matches!(err, TrackError::Validation(_))
        });

        let mut explicit = monitor_request(now + Duration::minutes(5));
        explicit.initial_delay = Some(Duration::minutes(2));
        let started = scheduler.start_monitoring(&explicit, now);
        assert!(started.is_ok());
        let started = started.unwrap_or_else(|_| unreachable!());
        assert_eq!(started.status, MonitorStatus::Open);
        assert_eq!(started.poll_count, 0);
        assert_eq!(started.created_at, now);
        assert_eq!(started.next_check_at, now + Duration::minutes(2));
    }

    #[test]
    fn record_poll_reschedules_until_window_lapses() {
        let store = open_store("poll-window");
        let scheduler = scheduler(
            &store,
            BackoffPolicy::Fixed {
                interval_minutes: 3,
            },
        );

        let now = now_utc();
        let mut request = monitor_request(now + Duration::minutes(10));
        request.initial_delay = Some(Duration::minutes(1));
        let started = scheduler.start_monitoring(&request, now);
        assert!(started.is_ok());
        let started = started.unwrap_or_else(|_| unreachable!());
        let expire_at = started.expire_at;

        // Polls at +1m, +4m, and +7m all reschedule 3 minutes out; the
        // last lands exactly on the expiry, which is allowed.
        let mut poll_at = started.next_check_at;
        for expected_polls in 1..=3_u32 {
            let updated = scheduler.record_poll(
                started.monitor_id,
                &PollObservation::StillOpen { description: None },
                poll_at,
            );
            assert!(updated.is_ok());
            let updated = updated.unwrap_or_else(|_| unreachable!());
            assert_eq!(updated.status, MonitorStatus::Open);
            assert_eq!(updated.poll_count, expected_polls);
            assert_eq!(updated.last_checked_at, Some(poll_at));
            assert!(updated.next_check_at <= expire_at);
            poll_at = updated.next_check_at;
        }

        // The fourth poll would reschedule past the expiry.
        let expired = scheduler.record_poll(
            started.monitor_id,
            &PollObservation::StillOpen { description: None },
            poll_at,
        );
        assert!(expired.is_ok());
        let expired = expired.unwrap_or_else(|_| unreachable!());
        assert_eq!(expired.status, MonitorStatus::Expired);
        assert_eq!(expired.poll_count, 4);

        let audit = scheduler.audit(started.monitor_id);
        assert!(audit.is_ok());
        let audit = audit.unwrap_or_else(|_| unreachable!());
        assert_eq!(audit.entries, 5);
        assert!(audit.chain_valid);
    }

    #[test]
    fn resolved_poll_terminates_and_leaves_schedule_untouched() {
        let store = open_store("poll-resolved");
        let scheduler = scheduler(&store, BackoffPolicy::default());

        let now = now_utc();
        let started = scheduler.start_monitoring(&monitor_request(now + Duration::days(30)), now);
        assert!(started.is_ok());
        let started = started.unwrap_or_else(|_| unreachable!());

        let resolved = scheduler.record_poll(
            started.monitor_id,
            &PollObservation::Resolved {
                description: Some("paid in full".to_string()),
            },
            started.next_check_at,
        );
        assert!(resolved.is_ok());
        let resolved = resolved.unwrap_or_else(|_| unreachable!());
        assert_eq!(resolved.status, MonitorStatus::Resolved);
        assert_eq!(resolved.next_check_at, started.next_check_at);
        assert_eq!(resolved.status_description.as_deref(), Some("paid in full"));

        let due = scheduler.due(resolved.next_check_at + Duration::days(365));
        assert!(due.is_ok());
        assert!(due.unwrap_or_else(|_| unreachable!()).is_empty());

        assert_track_error(
            scheduler.record_poll(
                started.monitor_id,
                &PollObservation::StillOpen { description: None },
                now_utc(),
            ),
            |err| matches!(err, TrackError::InvalidTransition { .. }),
        );
    }

    #[test]
    fn unavailable_poll_reschedules_without_failing() {
        let store = open_store("poll-unavailable");
        let scheduler = scheduler(
            &store,
            BackoffPolicy::Fixed {
                interval_minutes: 60,
            },
        );

        let now = now_utc();
        let started = scheduler.start_monitoring(&monitor_request(now + Duration::days(7)), now);
        assert!(started.is_ok());
        let started = started.unwrap_or_else(|_| unreachable!());

        let updated = scheduler.record_poll(
            started.monitor_id,
            &PollObservation::Unavailable {
                reason: "http status 503".to_string(),
            },
            started.next_check_at,
        );
        assert!(updated.is_ok());
        let updated = updated.unwrap_or_else(|_| unreachable!());
        assert_eq!(updated.status, MonitorStatus::Open);
        assert_eq!(updated.poll_count, 1);
        assert_eq!(
            updated.next_check_at,
            started.next_check_at + Duration::minutes(60)
        );
        assert_eq!(
            updated.status_description.as_deref(),
            Some("check unavailable: http status 503")
        );
    }

    #[test]
    fn expire_is_idempotent_and_guards_other_terminals() {
        let store = open_store("expire");
        let scheduler = scheduler(
            &store,
            BackoffPolicy::Fixed {
                interval_minutes: 60,
            },
        );

        let now = now_utc();
        let mut request = monitor_request(now + Duration::minutes(30));
        request.initial_delay = Some(Duration::minutes(5));
        let started = scheduler.start_monitoring(&request, now);
        assert!(started.is_ok());
        let started = started.unwrap_or_else(|_| unreachable!());

        assert_track_error(scheduler.expire(started.monitor_id, now_utc()), |err| {
            matches!(err, TrackError::Validation(_))
        });

        let lapsed_at = started.expire_at + Duration::minutes(1);
        let expired = scheduler.expire(started.monitor_id, lapsed_at);
        assert!(expired.is_ok());
        assert_eq!(
            expired.unwrap_or_else(|_| unreachable!()).status,
            MonitorStatus::Expired
        );

        let history_before = scheduler.history(started.monitor_id);
        assert!(history_before.is_ok());
        let entries_before = history_before.unwrap_or_else(|_| unreachable!()).len();

        let again = scheduler.expire(started.monitor_id, lapsed_at);
        assert!(again.is_ok());
        assert_eq!(
            again.unwrap_or_else(|_| unreachable!()).status,
            MonitorStatus::Expired
        );

        let history_after = scheduler.history(started.monitor_id);
        assert!(history_after.is_ok());
        assert_eq!(
            history_after.unwrap_or_else(|_| unreachable!()).len(),
            entries_before
        );

        let cancel_after_expire = scheduler.cancel(started.monitor_id, None);
        assert_track_error(cancel_after_expire, |err| {
            matches!(err, TrackError::InvalidTransition { .. })
        });
    }

    #[test]
    fn cancel_stops_monitoring() {
        let store = open_store("cancel");
        let scheduler = scheduler(&store, BackoffPolicy::default());

        let now = now_utc();
        let started = scheduler.start_monitoring(&monitor_request(now + Duration::days(30)), now);
        assert!(started.is_ok());
        let started = started.unwrap_or_else(|_| unreachable!());

        let cancelled = scheduler.cancel(started.monitor_id, Some("debtor settled".to_string()));
        assert!(cancelled.is_ok());
        let cancelled = cancelled.unwrap_or_else(|_| unreachable!());
        assert_eq!(cancelled.status, MonitorStatus::Cancelled);
        assert_eq!(
            cancelled.status_description.as_deref(),
            Some("debtor settled")
        );

        let due = scheduler.due(now_utc() + Duration::days(365));
        assert!(due.is_ok());
        assert!(due.unwrap_or_else(|_| unreachable!()).is_empty());
    }

    fn linked_request_status(
        tracker: &RequestTracker<'_>,
        request_id: case_monitor_domain::RequestId,
    ) -> (RequestStatus, Option<String>) {
        let record = tracker.get(request_id);
        assert!(record.is_ok());
        let record = record.unwrap_or_else(|_| unreachable!());
        let record = record.unwrap_or_else(|| unreachable!());
        (record.status, record.status_description)
    }

    #[test]
    fn resolved_poll_completes_linked_request() {
        let store = open_store("settle-resolved");
        let tracker = RequestTracker::new(&store);
        let scheduler = scheduler(&store, BackoffPolicy::default());
        let now = now_utc();

        let request = tracker.create(&submission());
        assert!(request.is_ok());
        let request = request.unwrap_or_else(|_| unreachable!());

        let mut linked = monitor_request(now + Duration::days(30));
        linked.request_id = Some(request.request_id);
        let monitor = scheduler.start_monitoring(&linked, now);
        assert!(monitor.is_ok());
        let monitor = monitor.unwrap_or_else(|_| unreachable!());

        let resolved = scheduler.record_poll(
            monitor.monitor_id,
            &PollObservation::Resolved {
                description: Some("paid".to_string()),
            },
            monitor.next_check_at,
        );
        assert!(resolved.is_ok());

        assert_eq!(
            linked_request_status(&tracker, request.request_id),
            (RequestStatus::Completed, Some("paid".to_string()))
        );

        // Creation plus the settling transition.
        let history = tracker.history(request.request_id);
        assert!(history.is_ok());
        assert_eq!(history.unwrap_or_else(|_| unreachable!()).len(), 2);
    }

    #[test]
    fn failed_expired_and_cancelled_monitors_settle_linked_requests() {
        let store = open_store("settle-terminal");
        let tracker = RequestTracker::new(&store);
        let scheduler = scheduler(
            &store,
            BackoffPolicy::Fixed {
                interval_minutes: 60,
            },
        );
        let now = now_utc();

        let failed_request = tracker.create(&submission());
        assert!(failed_request.is_ok());
        let failed_request = failed_request.unwrap_or_else(|_| unreachable!());
        let mut failed = monitor_request(now + Duration::days(7));
        failed.request_id = Some(failed_request.request_id);
        let failed = scheduler.start_monitoring(&failed, now);
        assert!(failed.is_ok());
        let failed = failed.unwrap_or_else(|_| unreachable!());
        let polled = scheduler.record_poll(
            failed.monitor_id,
            &PollObservation::Failed {
                description: Some("chargeback".to_string()),
            },
            failed.next_check_at,
        );
        assert!(polled.is_ok());
        assert_eq!(
            linked_request_status(&tracker, failed_request.request_id),
            (RequestStatus::Error, Some("chargeback".to_string()))
        );

        let lapsed_request = tracker.create(&submission());
        assert!(lapsed_request.is_ok());
        let lapsed_request = lapsed_request.unwrap_or_else(|_| unreachable!());
        let mut lapsed = monitor_request(now + Duration::minutes(30));
        lapsed.request_id = Some(lapsed_request.request_id);
        lapsed.initial_delay = Some(Duration::minutes(5));
        let lapsed = scheduler.start_monitoring(&lapsed, now);
        assert!(lapsed.is_ok());
        let lapsed = lapsed.unwrap_or_else(|_| unreachable!());
        let expired = scheduler.expire(lapsed.monitor_id, now + Duration::minutes(31));
        assert!(expired.is_ok());
        assert_eq!(
            linked_request_status(&tracker, lapsed_request.request_id),
            (
                RequestStatus::Error,
                Some("monitoring window lapsed".to_string())
            )
        );

        let closed_request = tracker.create(&submission());
        assert!(closed_request.is_ok());
        let closed_request = closed_request.unwrap_or_else(|_| unreachable!());
        let mut closed = monitor_request(now + Duration::days(7));
        closed.request_id = Some(closed_request.request_id);
        let closed = scheduler.start_monitoring(&closed, now);
        assert!(closed.is_ok());
        let closed = closed.unwrap_or_else(|_| unreachable!());
        let cancelled = scheduler.cancel(closed.monitor_id, Some("settled directly".to_string()));
        assert!(cancelled.is_ok());
        assert_eq!(
            linked_request_status(&tracker, closed_request.request_id),
            (RequestStatus::Completed, Some("settled directly".to_string()))
        );
    }

    #[test]
    fn attach_monitor_details_is_write_once() {
        let store = open_store("monitor-details");
        let scheduler = scheduler(&store, BackoffPolicy::default());
        let now = now_utc();
        let started = scheduler.start_monitoring(&monitor_request(now + Duration::days(30)), now);
        assert!(started.is_ok());
        let started = started.unwrap_or_else(|_| unreachable!());

        let details = DetailRecord::from_pairs(vec![
            ("para_1".to_string(), "vendor ticket 42".to_string()),
            ("para_2".to_string(), String::new()),
        ]);
        assert!(details.is_ok());
        let details = details.unwrap_or_else(|_| unreachable!());
        assert!(scheduler
            .attach_details(started.monitor_id, &details)
            .is_ok());

        let replacement =
            DetailRecord::from_pairs(vec![("para_1".to_string(), "other".to_string())]);
        assert!(replacement.is_ok());
        let replacement = replacement.unwrap_or_else(|_| unreachable!());
        assert_track_error(
            scheduler.attach_details(started.monitor_id, &replacement),
            |err| matches!(err, TrackError::DetailConflict { .. }),
        );

        let stored = scheduler.details(started.monitor_id);
        assert!(stored.is_ok());
        let stored = stored.unwrap_or_else(|_| unreachable!());
        assert!(stored.is_some());
        let stored = stored.unwrap_or_else(|| unreachable!());
        assert_eq!(stored.get("para_1"), Some("vendor ticket 42"));
        assert_eq!(stored.get("para_2"), Some(""));
        assert_eq!(stored.get("para_3"), None);
    }

    #[test]
    fn run_tick_settles_due_monitors() {
        let store = open_store("tick");
        let scheduler = scheduler(
            &store,
            BackoffPolicy::Fixed {
                interval_minutes: 60,
            },
        );
        let now = now_utc();

        let mut open_request = monitor_request(now + Duration::days(7));
        open_request.case_id = "CASE-OPEN".to_string();
        open_request.initial_delay = Some(Duration::ZERO);
        let open_monitor = scheduler.start_monitoring(&open_request, now);
        assert!(open_monitor.is_ok());
        let open_monitor = open_monitor.unwrap_or_else(|_| unreachable!());

        let mut resolved_request = monitor_request(now + Duration::days(7));
        resolved_request.case_id = "CASE-RESOLVED".to_string();
        resolved_request.initial_delay = Some(Duration::ZERO);
        let resolved_monitor = scheduler.start_monitoring(&resolved_request, now);
        assert!(resolved_monitor.is_ok());
        let resolved_monitor = resolved_monitor.unwrap_or_else(|_| unreachable!());

        let mut future_request = monitor_request(now + Duration::days(7));
        future_request.case_id = "CASE-FUTURE".to_string();
        future_request.initial_delay = Some(Duration::hours(2));
        assert!(scheduler.start_monitoring(&future_request, now).is_ok());

        let checker = MockCaseChecker::new();
        checker.push_result(
            "CASE-RESOLVED",
            CaseCheckResult::Observed(CaseObservation {
                status: ObservedCaseStatus::Resolved,
                description: Some("paid".to_string()),
            }),
        );
        checker.push_result(
            "CASE-OPEN",
            CaseCheckResult::Unavailable {
                reason: "transport failure".to_string(),
            },
        );

        let summary = scheduler.run_tick(&checker, now);
        assert!(summary.is_ok());
        let summary = summary.unwrap_or_else(|_| unreachable!());
        assert_eq!(
            summary,
            TickSummary {
                polled: 2,
                resolved: 1,
                failed: 0,
                expired: 0,
                rescheduled: 1,
                skipped: 0,
            }
        );

        let resolved = scheduler.get(resolved_monitor.monitor_id);
        assert!(resolved.is_ok());
        let resolved = resolved.unwrap_or_else(|_| unreachable!());
        assert_eq!(
            resolved.map(|m| m.status),
            Some(MonitorStatus::Resolved)
        );

        let still_open = scheduler.get(open_monitor.monitor_id);
        assert!(still_open.is_ok());
        let still_open = still_open.unwrap_or_else(|_| unreachable!());
        assert!(still_open.is_some_and(|m| m.status == MonitorStatus::Open && m.poll_count == 1));
    }

    #[test]
    fn run_tick_force_expires_lapsed_monitors_without_polling() {
        let store = open_store("tick-lapsed");
        let scheduler = scheduler(
            &store,
            BackoffPolicy::Fixed {
                interval_minutes: 60,
            },
        );
        let now = now_utc();

        let mut request = monitor_request(now + Duration::minutes(10));
        request.initial_delay = Some(Duration::minutes(5));
        let started = scheduler.start_monitoring(&request, now);
        assert!(started.is_ok());
        let started = started.unwrap_or_else(|_| unreachable!());

        let later = started.expire_at + Duration::minutes(1);
        let checker = MockCaseChecker::new();
        let summary = scheduler.run_tick(&checker, later);
        assert!(summary.is_ok());
        let summary = summary.unwrap_or_else(|_| unreachable!());
        assert_eq!(summary.expired, 1);
        assert_eq!(summary.polled, 0);

        let record = scheduler.get(started.monitor_id);
        assert!(record.is_ok());
        let record = record.unwrap_or_else(|_| unreachable!());
        assert_eq!(record.map(|m| m.status), Some(MonitorStatus::Expired));
    }

    #[test]
    fn exponential_backoff_grows_and_caps() {
        let policy = BackoffPolicy::Exponential {
            initial_minutes: 10,
            factor: 2.0,
            max_minutes: 60,
        };
        assert!(policy.validate().is_ok());
        assert_eq!(policy.interval(1), Duration::minutes(10));
        assert_eq!(policy.interval(2), Duration::minutes(20));
        assert_eq!(policy.interval(3), Duration::minutes(40));
        assert_eq!(policy.interval(4), Duration::minutes(60));
        assert_eq!(policy.interval(40), Duration::minutes(60));
    }

    #[test]
    fn backoff_validation_rejects_bad_parameters() {
        assert!(matches!(
            BackoffPolicy::Fixed {
                interval_minutes: 0
            }
            .validate(),
            Err(TrackError::Validation(_))
        ));
        assert!(matches!(
            BackoffPolicy::Exponential {
                initial_minutes: 10,
                factor: 0.5,
                max_minutes: 60,
            }
            .validate(),
            Err(TrackError::Validation(_))
        ));
        assert!(matches!(
            BackoffPolicy::Exponential {
                initial_minutes: 60,
                factor: 2.0,
                max_minutes: 10,
            }
            .validate(),
            Err(TrackError::Validation(_))
        ));
    }

    #[test]
    fn scheduler_config_parses_yaml() {
        let path = std::env::temp_dir().join(format!(
            "case-monitor-engine-config-{}.yaml",
            Ulid::new()
        ));
        let yaml = "backoff:\n  kind: exponential\n  initial_minutes: 30\n  factor: 2.0\n  max_minutes: 1440\nchecker:\n  base_url: http://localhost:8080\n  timeout_ms: 5000\n";
        assert!(std::fs::write(&path, yaml).is_ok());

        let config = load_scheduler_config(&path);
        assert!(config.is_ok());
        let config = config.unwrap_or_else(|_| unreachable!());
        assert_eq!(
            config.backoff,
            BackoffPolicy::Exponential {
                initial_minutes: 30,
                factor: 2.0,
                max_minutes: 1440,
            }
        );
        assert!(config
            .checker
            .is_some_and(|checker| checker.base_url == "http://localhost:8080"));

        let defaults: Result<SchedulerConfig, _> = serde_yaml::from_str("{}");
        assert!(defaults.is_ok());
        assert_eq!(
            defaults.unwrap_or_else(|_| unreachable!()).backoff,
            BackoffPolicy::default()
        );
    }
}
