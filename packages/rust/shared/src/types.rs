//! Core domain types for trawler crawlers and their queued work.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::TrawlerError;

// ---------------------------------------------------------------------------
// CrawlerState
// ---------------------------------------------------------------------------

/// Lifecycle state of a crawler. Exactly one authoritative value exists per
/// crawler name at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum CrawlerState {
    /// Not running; eligible for a new run.
    Idle = 0,
    /// A run is in progress.
    Running = 1,
    /// Cancellation requested; workers stop picking up new operations.
    Cancelling = 2,
    /// A cancelled run has fully drained.
    Cancelled = 3,
    /// A run aborted on an unhandled stage failure.
    Failed = 4,
}

impl CrawlerState {
    /// Whether a new run may be started from this state.
    pub fn can_start(self) -> bool {
        matches!(self, Self::Idle | Self::Cancelled | Self::Failed)
    }

    /// Whether the crawler counts as running for status purposes.
    pub fn is_running(self) -> bool {
        matches!(self, Self::Running | Self::Cancelling)
    }

    /// Decode from the atomic cell representation.
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Running,
            2 => Self::Cancelling,
            3 => Self::Cancelled,
            4 => Self::Failed,
            _ => Self::Idle,
        }
    }
}

impl std::fmt::Display for CrawlerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

// ---------------------------------------------------------------------------
// OpId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for operation identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpId(pub Uuid);

impl OpId {
    /// Generate a new time-sortable operation identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for OpId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for OpId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// One unit of queued work destined for a specific pipeline stage.
///
/// Operations are FIFO within one crawler's queue only; delivery is
/// at-least-once and not strictly ordered under retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    /// Queue-assigned identity.
    pub id: OpId,
    /// Owning crawler name.
    pub crawler: String,
    /// Target pipeline stage identifier.
    pub stage: String,
    /// Opaque payload handed to the stage handler.
    pub payload: serde_json::Value,
    /// When the operation was enqueued.
    pub enqueued_at: DateTime<Utc>,
    /// Delivery attempt counter.
    pub attempt: u32,
}

impl Operation {
    /// Create a fresh first-attempt operation.
    pub fn new(
        crawler: impl Into<String>,
        stage: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: OpId::new(),
            crawler: crawler.into(),
            stage: stage.into(),
            payload,
            enqueued_at: Utc::now(),
            attempt: 1,
        }
    }

    /// Content-derived dedup key for this unit of work.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::compute(&self.crawler, &self.stage, &self.payload)
    }
}

// ---------------------------------------------------------------------------
// Fingerprint
// ---------------------------------------------------------------------------

/// A content-derived key marking "this unit of work has been seen before".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    /// SHA-256 over `crawler:stage:payload`.
    pub fn compute(crawler: &str, stage: &str, payload: &serde_json::Value) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(crawler.as_bytes());
        hasher.update(b":");
        hasher.update(stage.as_bytes());
        hasher.update(b":");
        hasher.update(payload.to_string().as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Stage output
// ---------------------------------------------------------------------------

/// A derived operation emitted by a stage handler: target stage + payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerivedOp {
    pub stage: String,
    pub payload: serde_json::Value,
}

/// A tag write emitted by a stage handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagWrite {
    pub key: String,
    pub value: serde_json::Value,
}

/// Everything a stage handler produces from one operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageOutput {
    /// Operations to fan out to downstream stages.
    pub operations: Vec<DerivedOp>,
    /// Tag writes associated with the owning crawler.
    pub tags: Vec<TagWrite>,
}

impl StageOutput {
    /// Queue a derived operation for `stage`.
    pub fn emit(&mut self, stage: impl Into<String>, payload: serde_json::Value) {
        self.operations.push(DerivedOp {
            stage: stage.into(),
            payload,
        });
    }

    /// Record a tag write.
    pub fn tag(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.tags.push(TagWrite {
            key: key.into(),
            value,
        });
    }
}

// ---------------------------------------------------------------------------
// CrawlerStatus
// ---------------------------------------------------------------------------

/// Read-only snapshot of a crawler, taken under the same synchronization
/// used for counter updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerStatus {
    pub name: String,
    pub description: String,
    pub state: CrawlerState,
    pub last_run: Option<DateTime<Utc>>,
    /// Successful operations this run (monotonic within a run).
    pub op_count: u64,
    /// enqueued − completed − failed; never negative.
    pub pending_count: u64,
}

impl CrawlerStatus {
    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// A crawler's schedule expression: how often it becomes due, relative to
/// its last run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Schedule {
    /// Never due.
    Disabled,
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl Schedule {
    /// The repeat interval, or `None` for disabled schedules.
    pub fn interval(self) -> Option<Duration> {
        match self {
            Self::Disabled => None,
            Self::Hourly => Some(Duration::hours(1)),
            Self::Daily => Some(Duration::days(1)),
            Self::Weekly => Some(Duration::weeks(1)),
            Self::Monthly => Some(Duration::days(30)),
        }
    }

    /// Pure due check: a crawler with no recorded run is due unless disabled;
    /// otherwise due once the interval has elapsed since `last_run`.
    pub fn is_due(self, last_run: Option<DateTime<Utc>>) -> bool {
        let Some(interval) = self.interval() else {
            return false;
        };
        match last_run {
            None => true,
            Some(at) => Utc::now() - at >= interval,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Schedule {
    type Err = TrawlerError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "disabled" => Ok(Self::Disabled),
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            other => Err(TrawlerError::validation(format!(
                "unknown schedule '{other}': expected disabled, hourly, daily, weekly, or monthly"
            ))),
        }
    }
}

impl TryFrom<String> for Schedule {
    type Error = TrawlerError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Schedule> for String {
    fn from(s: Schedule) -> Self {
        s.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_atomic_repr_roundtrip() {
        for state in [
            CrawlerState::Idle,
            CrawlerState::Running,
            CrawlerState::Cancelling,
            CrawlerState::Cancelled,
            CrawlerState::Failed,
        ] {
            assert_eq!(CrawlerState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn start_allowed_from_idle_and_terminal_states() {
        assert!(CrawlerState::Idle.can_start());
        assert!(CrawlerState::Cancelled.can_start());
        assert!(CrawlerState::Failed.can_start());
        assert!(!CrawlerState::Running.can_start());
        assert!(!CrawlerState::Cancelling.can_start());
    }

    #[test]
    fn disabled_schedule_never_due() {
        assert!(!Schedule::Disabled.is_due(None));
        assert!(!Schedule::Disabled.is_due(Some(Utc::now() - Duration::days(365))));
    }

    #[test]
    fn stale_last_run_is_due() {
        let stale = Some(Utc::now() - Duration::days(2));
        assert!(Schedule::Daily.is_due(stale));
        assert!(Schedule::Hourly.is_due(stale));
        assert!(!Schedule::Monthly.is_due(stale));
    }

    #[test]
    fn never_run_is_due_unless_disabled() {
        assert!(Schedule::Daily.is_due(None));
        assert!(Schedule::Weekly.is_due(None));
    }

    #[test]
    fn schedule_parse_rejects_unknown() {
        assert!("daily".parse::<Schedule>().is_ok());
        let err = "fortnightly".parse::<Schedule>().unwrap_err();
        assert!(err.to_string().contains("fortnightly"));
    }

    #[test]
    fn fingerprint_is_stable_and_distinguishes_inputs() {
        let payload = serde_json::json!({"url": "https://example.com/a"});
        let a = Fingerprint::compute("demo", "fetch", &payload);
        let b = Fingerprint::compute("demo", "fetch", &payload);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);

        let other = Fingerprint::compute("demo", "parse", &payload);
        assert_ne!(a, other);
    }

    #[test]
    fn operation_serde_roundtrip() {
        let op = Operation::new("demo", "fetch", serde_json::json!({"url": "x"}));
        let json = serde_json::to_string(&op).expect("serialize");
        let parsed: Operation = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.id, op.id);
        assert_eq!(parsed.stage, "fetch");
        assert_eq!(parsed.attempt, 1);
    }
}
