use crate::types::{ActivityType, LifecycleStage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

// ---------------------------------------------------------------------------
// ActivityRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure { reason: String },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

/// What an activity acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "key", rename_all = "snake_case")]
pub enum Target {
    Container(u64),
    Entity(u64),
    /// Activities such as out-of-office notes that act on no entity.
    Workspace,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Container(k) => write!(f, "container#{k}"),
            Target::Entity(k) => write!(f, "entity#{k}"),
            Target::Workspace => f.write_str("workspace"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageChange {
    pub from: LifecycleStage,
    pub to: LifecycleStage,
}

/// One immutable log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub activity: ActivityType,
    pub target: Target,
    pub actor: String,
    pub outcome: Outcome,
    /// Present exactly when this record caused a lifecycle change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition: Option<StageChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

// ---------------------------------------------------------------------------
// ActivityLog
// ---------------------------------------------------------------------------

/// Append-only ring buffer of activity records, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActivityLog {
    records: VecDeque<ActivityRecord>,
}

impl ActivityLog {
    /// Append, dropping the oldest entries beyond `cap`.
    pub fn push(&mut self, record: ActivityRecord, cap: usize) {
        self.records.push_back(record);
        while self.records.len() > cap.max(1) {
            self.records.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &ActivityRecord> {
        self.records.iter()
    }

    pub fn last(&self) -> Option<&ActivityRecord> {
        self.records.back()
    }

    /// Most recent first, skipping `offset` records.
    pub fn page(&self, offset: usize, limit: usize) -> Vec<ActivityRecord> {
        self.records
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// ErrorLog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Throttle,
    CredentialInvalid,
    ContentGeneration,
    Persistence,
    Platform,
    /// The stored job config no longer validates.
    Config,
    Unexpected,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Throttle => "throttle",
            ErrorKind::CredentialInvalid => "credential_invalid",
            ErrorKind::ContentGeneration => "content_generation",
            ErrorKind::Persistence => "persistence",
            ErrorKind::Platform => "platform",
            ErrorKind::Config => "config",
            ErrorKind::Unexpected => "unexpected",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

/// Bounded error log, most recent first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorLog {
    entries: VecDeque<ErrorEntry>,
}

impl ErrorLog {
    pub fn push(&mut self, entry: ErrorEntry, cap: usize) {
        self.entries.push_front(entry);
        self.entries.truncate(cap.max(1));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ErrorEntry> {
        self.entries.iter()
    }

    pub fn latest(&self) -> Option<&ErrorEntry> {
        self.entries.front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(seq: u64) -> ActivityRecord {
        ActivityRecord {
            seq,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 4, 17, 0, 0).unwrap(),
            activity: ActivityType::CommentProgress,
            target: Target::Entity(1),
            actor: "Alice".into(),
            outcome: Outcome::Success,
            transition: None,
            summary: None,
        }
    }

    fn error(msg: &str) -> ErrorEntry {
        ErrorEntry {
            timestamp: Utc.with_ymd_and_hms(2024, 3, 4, 17, 0, 0).unwrap(),
            kind: ErrorKind::Platform,
            message: msg.into(),
            actor: None,
        }
    }

    #[test]
    fn activity_log_drops_oldest_beyond_cap() {
        let mut log = ActivityLog::default();
        for seq in 0..10 {
            log.push(record(seq), 3);
        }
        let seqs: Vec<_> = log.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![7, 8, 9]);
    }

    #[test]
    fn page_is_most_recent_first() {
        let mut log = ActivityLog::default();
        for seq in 0..5 {
            log.push(record(seq), 100);
        }
        let page: Vec<_> = log.page(1, 2).into_iter().map(|r| r.seq).collect();
        assert_eq!(page, vec![3, 2]);
        assert!(log.page(10, 5).is_empty());
    }

    #[test]
    fn error_log_is_most_recent_first_and_bounded() {
        let mut log = ErrorLog::default();
        for i in 0..5 {
            log.push(error(&format!("e{i}")), 2);
        }
        let msgs: Vec<_> = log.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(msgs, vec!["e4", "e3"]);
    }

    #[test]
    fn outcome_serializes_with_result_tag() {
        let yaml = serde_yaml::to_string(&Outcome::Failure {
            reason: "boom".into(),
        })
        .unwrap();
        assert!(yaml.contains("result: failure"));
        assert!(yaml.contains("reason: boom"));
    }
}
