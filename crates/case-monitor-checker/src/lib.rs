#![forbid(unsafe_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use case_monitor_domain::ensure_non_empty;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Case state as reported by an upstream source.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ObservedCaseStatus {
    Open,
    Resolved,
    Failed,
}

impl ObservedCaseStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Resolved => "resolved",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(Self::Open),
            "resolved" => Some(Self::Resolved),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CaseObservation {
    pub status: ObservedCaseStatus,
    pub description: Option<String>,
}

/// Outcome of one check attempt.
///
/// A check never hard-fails the poll loop: anything that prevents a usable
/// observation (transport failure, non-2xx status, unparseable body,
/// unknown case status) comes back as `Unavailable` so the monitor is
/// rescheduled rather than wedged.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub enum CaseCheckResult {
    Observed(CaseObservation),
    Unavailable { reason: String },
}

pub trait CaseChecker {
    fn source(&self) -> &'static str;

    #[allow(clippy::missing_errors_doc)]
    fn check_case(&self, case_id: &str) -> Result<CaseCheckResult>;
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct HttpCheckerConfig {
    pub base_url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl HttpCheckerConfig {
    /// # Errors
    /// Returns a validation error when `base_url` is empty or `timeout_ms`
    /// is zero.
    pub fn validate(&self) -> Result<()> {
        ensure_non_empty("checker.base_url", &self.base_url)?;
        if self.timeout_ms == 0 {
            return Err(anyhow::anyhow!("checker.timeout_ms MUST be positive"));
        }
        Ok(())
    }
}

/// Checker that queries an upstream case API over HTTP.
///
/// `GET {base_url}/cases/{case_id}` is expected to answer a JSON body with
/// a `status` field and an optional `description`.
#[derive(Debug, Clone)]
pub struct HttpCaseChecker {
    config: HttpCheckerConfig,
}

impl HttpCaseChecker {
    /// # Errors
    /// Returns an error when the configuration is invalid.
    pub fn new(config: HttpCheckerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    fn case_url(&self, case_id: &str) -> String {
        format!("{}/cases/{case_id}", self.config.base_url.trim_end_matches('/'))
    }
}

impl CaseChecker for HttpCaseChecker {
    fn source(&self) -> &'static str {
        "http"
    }

    fn check_case(&self, case_id: &str) -> Result<CaseCheckResult> {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(self.config.timeout_ms))
            .build();

        let mut req = agent
            .get(&self.case_url(case_id))
            .set("accept", "application/json");
        for (header, value) in &self.config.headers {
            req = req.set(header, value);
        }

        let body: Value = match req.call() {
            Ok(response) => match response.into_json() {
                Ok(value) => value,
                Err(err) => {
                    return Ok(CaseCheckResult::Unavailable {
                        reason: format!("unreadable response body: {err}"),
                    });
                }
            },
            Err(ureq::Error::Status(code, _)) => {
                return Ok(CaseCheckResult::Unavailable {
                    reason: format!("http status {code}"),
                });
            }
            Err(ureq::Error::Transport(err)) => {
                return Ok(CaseCheckResult::Unavailable {
                    reason: format!("transport failure: {err}"),
                });
            }
        };

        let Some(raw_status) = body.get("status").and_then(Value::as_str) else {
            return Ok(CaseCheckResult::Unavailable {
                reason: "response body missing 'status'".to_string(),
            });
        };
        let Some(status) = ObservedCaseStatus::parse(raw_status) else {
            return Ok(CaseCheckResult::Unavailable {
                reason: format!("unknown case status '{raw_status}'"),
            });
        };

        let description = body
            .get("description")
            .and_then(Value::as_str)
            .map(ToString::to_string);

        Ok(CaseCheckResult::Observed(CaseObservation {
            status,
            description,
        }))
    }
}

/// Scripted checker for tests and dry runs.
///
/// Results queued per case id are consumed in order; an unscripted case
/// observes `open` with no description.
#[derive(Debug, Default)]
pub struct MockCaseChecker {
    scripted: Mutex<BTreeMap<String, VecDeque<CaseCheckResult>>>,
}

impl MockCaseChecker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_result(&self, case_id: &str, result: CaseCheckResult) {
        let mut scripted = self
            .scripted
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        scripted
            .entry(case_id.to_string())
            .or_default()
            .push_back(result);
    }
}

impl CaseChecker for MockCaseChecker {
    fn source(&self) -> &'static str {
        "mock"
    }

    fn check_case(&self, case_id: &str) -> Result<CaseCheckResult> {
        let mut scripted = self
            .scripted
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let next = scripted
            .get_mut(case_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(CaseCheckResult::Observed(CaseObservation {
                status: ObservedCaseStatus::Open,
                description: None,
            }));
        Ok(next)
    }
}
