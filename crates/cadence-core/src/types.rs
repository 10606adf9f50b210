use crate::error::CadenceError;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// PlatformKind
// ---------------------------------------------------------------------------

/// Target collaboration platform of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformKind {
    /// Project management. The only platform older snapshots know about.
    #[default]
    Asana,
    /// Identity management.
    Okta,
    /// CRM.
    Salesforce,
}

impl PlatformKind {
    pub fn all() -> &'static [PlatformKind] {
        &[
            PlatformKind::Asana,
            PlatformKind::Okta,
            PlatformKind::Salesforce,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PlatformKind::Asana => "asana",
            PlatformKind::Okta => "okta",
            PlatformKind::Salesforce => "salesforce",
        }
    }

    /// What a top-level container is called on this platform.
    pub fn container_noun(self) -> &'static str {
        match self {
            PlatformKind::Asana => "project",
            PlatformKind::Okta => "group",
            PlatformKind::Salesforce => "account",
        }
    }

    /// What a simulated entity is called on this platform.
    pub fn entity_noun(self) -> &'static str {
        match self {
            PlatformKind::Asana => "task",
            PlatformKind::Okta => "user",
            PlatformKind::Salesforce => "opportunity",
        }
    }

    /// Published per-workspace request limit, in calls per minute.
    pub fn published_rate_limit_per_minute(self) -> u32 {
        match self {
            PlatformKind::Asana => 150,
            PlatformKind::Okta => 600,
            PlatformKind::Salesforce => 100,
        }
    }
}

impl fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PlatformKind {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "asana" => Ok(PlatformKind::Asana),
            "okta" => Ok(PlatformKind::Okta),
            "salesforce" => Ok(PlatformKind::Salesforce),
            _ => Err(CadenceError::InvalidConfig(format!(
                "unknown platform '{s}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Paused,
    Stopped,
    Errored,
    Completed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Stopped => "stopped",
            JobStatus::Errored => "errored",
            JobStatus::Completed => "completed",
        }
    }

    /// Stopped, errored and completed jobs never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Stopped | JobStatus::Errored | JobStatus::Completed
        )
    }

    /// Jobs that a restarted process must bring back to life.
    pub fn is_resumable(self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::Paused)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(JobStatus::Running),
            "paused" => Ok(JobStatus::Paused),
            "stopped" => Ok(JobStatus::Stopped),
            "errored" | "error" => Ok(JobStatus::Errored),
            "completed" => Ok(JobStatus::Completed),
            _ => Err(CadenceError::InvalidConfig(format!("unknown status '{s}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// LifecycleStage
// ---------------------------------------------------------------------------

/// Lifecycle of a simulated entity.
///
/// ```text
/// New → InProgress ⇄ Blocked
///           │
///           ▼
///       Completed   (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStage {
    New,
    InProgress,
    Blocked,
    Completed,
}

impl LifecycleStage {
    pub fn all() -> &'static [LifecycleStage] {
        &[
            LifecycleStage::New,
            LifecycleStage::InProgress,
            LifecycleStage::Blocked,
            LifecycleStage::Completed,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleStage::New => "new",
            LifecycleStage::InProgress => "in_progress",
            LifecycleStage::Blocked => "blocked",
            LifecycleStage::Completed => "completed",
        }
    }

    /// Whether `self → to` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, to: LifecycleStage) -> bool {
        use LifecycleStage::*;
        matches!(
            (self, to),
            (New, InProgress) | (InProgress, Blocked) | (Blocked, InProgress) | (InProgress, Completed)
        )
    }

    pub fn is_open(self) -> bool {
        self != LifecycleStage::Completed
    }
}

impl fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ActivityType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    CreateContainer,
    CreateEntity,
    StartWork,
    CommentProgress,
    Block,
    Unblock,
    Complete,
    Conversation,
    Reassign,
    OutOfOffice,
}

impl ActivityType {
    pub fn all() -> &'static [ActivityType] {
        &[
            ActivityType::CreateContainer,
            ActivityType::CreateEntity,
            ActivityType::StartWork,
            ActivityType::CommentProgress,
            ActivityType::Block,
            ActivityType::Unblock,
            ActivityType::Complete,
            ActivityType::Conversation,
            ActivityType::Reassign,
            ActivityType::OutOfOffice,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActivityType::CreateContainer => "create_container",
            ActivityType::CreateEntity => "create_entity",
            ActivityType::StartWork => "start_work",
            ActivityType::CommentProgress => "comment_progress",
            ActivityType::Block => "block",
            ActivityType::Unblock => "unblock",
            ActivityType::Complete => "complete",
            ActivityType::Conversation => "conversation",
            ActivityType::Reassign => "reassign",
            ActivityType::OutOfOffice => "out_of_office",
        }
    }

    /// The lifecycle stage an entity must be in for this activity to target it.
    /// `None` means the activity does not target an existing entity's stage.
    pub fn required_stage(self) -> Option<LifecycleStage> {
        match self {
            ActivityType::StartWork => Some(LifecycleStage::New),
            ActivityType::CommentProgress
            | ActivityType::Block
            | ActivityType::Complete
            | ActivityType::Reassign => Some(LifecycleStage::InProgress),
            ActivityType::Unblock => Some(LifecycleStage::Blocked),
            ActivityType::CreateContainer
            | ActivityType::CreateEntity
            | ActivityType::Conversation
            | ActivityType::OutOfOffice => None,
        }
    }

    /// The stage this activity moves its target into, if any.
    pub fn resulting_stage(self) -> Option<LifecycleStage> {
        match self {
            ActivityType::StartWork | ActivityType::Unblock => Some(LifecycleStage::InProgress),
            ActivityType::Block => Some(LifecycleStage::Blocked),
            ActivityType::Complete => Some(LifecycleStage::Completed),
            _ => None,
        }
    }

    pub fn is_creation(self) -> bool {
        matches!(
            self,
            ActivityType::CreateContainer | ActivityType::CreateEntity
        )
    }
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ActivityLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityLevel {
    Low,
    #[default]
    Medium,
    High,
}

impl ActivityLevel {
    /// Base-probability multiplier applied to every firing roll.
    pub fn multiplier(self) -> f64 {
        match self {
            ActivityLevel::Low => 0.3,
            ActivityLevel::Medium => 1.0,
            ActivityLevel::High => 2.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActivityLevel::Low => "low",
            ActivityLevel::Medium => "medium",
            ActivityLevel::High => "high",
        }
    }
}

impl fmt::Display for ActivityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// WorkPatternKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkPatternKind {
    /// Mon–Fri office hours in one region.
    #[default]
    #[serde(alias = "us_workforce")]
    RegionalBusinessHours,
    /// Follow-the-sun coverage with several regional peaks.
    Global,
}

impl WorkPatternKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkPatternKind::RegionalBusinessHours => "regional_business_hours",
            WorkPatternKind::Global => "global",
        }
    }
}

impl fmt::Display for WorkPatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
