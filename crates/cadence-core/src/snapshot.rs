use crate::activity::{ActivityLog, ActivityRecord, ErrorEntry, ErrorKind, ErrorLog, StageChange, Target};
use crate::config::JobConfig;
use crate::entity::{Container, SimulatedEntity};
use crate::error::{CadenceError, Result};
use crate::types::{ActivityType, JobStatus, LifecycleStage, PlatformKind};
use crate::usage::UsageCounters;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Current on-disk schema. Older documents are upgraded by `migrations`.
pub const SCHEMA_VERSION: u32 = 2;

// ---------------------------------------------------------------------------
// JobStats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobStats {
    pub containers_created: u64,
    pub entities_created: u64,
    pub comments_added: u64,
    pub state_changes: u64,
    pub completions: u64,
    pub reassignments: u64,
    pub out_of_office_notes: u64,
    pub failed_activities: u64,
    pub errors: u64,
}

// ---------------------------------------------------------------------------
// JobSnapshot
// ---------------------------------------------------------------------------

/// Everything needed to resume a job, as persisted by the state store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub schema_version: u32,
    pub id: String,
    pub status: JobStatus,
    pub config: JobConfig,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_activity_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_container_created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_entity_created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_key: u64,
    #[serde(default)]
    pub next_seq: u64,
    #[serde(default)]
    pub revoked_actors: Vec<String>,
    #[serde(default)]
    pub containers: Vec<Container>,
    #[serde(default)]
    pub usage: UsageCounters,
    #[serde(default)]
    pub stats: JobStats,
    #[serde(default)]
    pub errors: ErrorLog,
    #[serde(default)]
    pub activity_log: ActivityLog,
}

impl JobSnapshot {
    pub fn new(id: impl Into<String>, config: JobConfig, now: DateTime<Utc>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            id: id.into(),
            status: JobStatus::Running,
            config,
            created_at: now,
            started_at: Some(now),
            updated_at: now,
            finished_at: None,
            next_activity_at: None,
            last_container_created_at: None,
            last_entity_created_at: None,
            next_key: 1,
            next_seq: 1,
            revoked_actors: Vec::new(),
            containers: Vec::new(),
            usage: UsageCounters::default(),
            stats: JobStats::default(),
            errors: ErrorLog::default(),
            activity_log: ActivityLog::default(),
        }
    }

    pub fn platform_kind(&self) -> PlatformKind {
        self.config.platform_kind()
    }

    pub fn display_name(&self) -> &str {
        self.config.name.as_deref().unwrap_or(&self.id)
    }

    /// True once a fixed duration has fully elapsed since the job started.
    pub fn duration_elapsed(&self, now: DateTime<Utc>) -> bool {
        match (self.started_at, self.config.duration.as_chrono()) {
            (Some(start), Some(len)) => now - start >= len,
            _ => false,
        }
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    /// Move the job to `to`. Terminal statuses never change again.
    pub fn set_status(&mut self, to: JobStatus, now: DateTime<Utc>) -> Result<()> {
        if self.status == to {
            return Ok(());
        }
        if self.status.is_terminal() {
            return Err(CadenceError::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
                reason: format!("job {} is already {}", self.id, self.status),
            });
        }
        self.status = to;
        self.updated_at = now;
        if to.is_terminal() {
            self.finished_at = Some(now);
            self.next_activity_at = None;
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(CadenceError::JobFinalized(self.id.clone()));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Entity tree
    // -----------------------------------------------------------------------

    pub fn allocate_key(&mut self) -> u64 {
        let key = self.next_key.max(1);
        self.next_key = key + 1;
        key
    }

    pub fn entities(&self) -> impl Iterator<Item = &SimulatedEntity> {
        self.containers.iter().flat_map(|c| c.entities.iter())
    }

    pub fn entity(&self, key: u64) -> Option<&SimulatedEntity> {
        self.entities().find(|e| e.key == key)
    }

    pub fn entity_mut(&mut self, key: u64) -> Option<&mut SimulatedEntity> {
        self.containers
            .iter_mut()
            .flat_map(|c| c.entities.iter_mut())
            .find(|e| e.key == key)
    }

    pub fn container(&self, key: u64) -> Option<&Container> {
        self.containers.iter().find(|c| c.key == key)
    }

    /// The container that owns entity `key`.
    pub fn container_of(&self, key: u64) -> Option<&Container> {
        self.containers
            .iter()
            .find(|c| c.entities.iter().any(|e| e.key == key))
    }

    /// Most recently created container; new entities land here.
    pub fn current_container(&self) -> Option<&Container> {
        self.containers.iter().max_by_key(|c| (c.created_at, c.key))
    }

    pub fn open_entity_count(&self) -> usize {
        self.entities().filter(|e| e.stage.is_open()).count()
    }

    pub fn stage_counts(&self) -> Vec<(LifecycleStage, usize)> {
        LifecycleStage::all()
            .iter()
            .map(|s| (*s, self.entities().filter(|e| e.stage == *s).count()))
            .collect()
    }

    pub fn add_container(
        &mut self,
        key: u64,
        name: impl Into<String>,
        owner: impl Into<String>,
        platform_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.ensure_open()?;
        self.containers.push(Container {
            key,
            platform_id,
            name: name.into(),
            owner: owner.into(),
            created_at: now,
            entities: Vec::new(),
        });
        self.last_container_created_at = Some(now);
        Ok(())
    }

    pub fn add_entity(
        &mut self,
        container_key: u64,
        mut entity: SimulatedEntity,
    ) -> Result<()> {
        self.ensure_open()?;
        let created_at = entity.created_at;
        let container = self
            .containers
            .iter_mut()
            .find(|c| c.key == container_key)
            .ok_or(CadenceError::EntityNotFound(container_key))?;
        entity.stage = LifecycleStage::New;
        container.entities.push(entity);
        self.last_entity_created_at = Some(created_at);
        Ok(())
    }

    /// Drop an entity from the tree. Only platform cleanup does this.
    pub fn remove_entity(&mut self, key: u64) -> Option<SimulatedEntity> {
        for c in &mut self.containers {
            if let Some(pos) = c.entities.iter().position(|e| e.key == key) {
                return Some(c.entities.remove(pos));
            }
        }
        None
    }

    pub fn remove_container(&mut self, key: u64) -> Option<Container> {
        let pos = self.containers.iter().position(|c| c.key == key)?;
        Some(self.containers.remove(pos))
    }

    // -----------------------------------------------------------------------
    // Activity and errors
    // -----------------------------------------------------------------------

    /// Append `record` and, for successful stage-changing activities, apply
    /// the lifecycle transition it describes. Failures never touch entities.
    ///
    /// Returns the sequence number assigned to the record.
    pub fn record_activity(&mut self, mut record: ActivityRecord) -> Result<u64> {
        self.ensure_open()?;
        let at = record.timestamp;
        record.transition = None;

        if record.outcome.is_success() {
            if let Target::Entity(key) = record.target {
                let entity = self
                    .entity_mut(key)
                    .ok_or(CadenceError::EntityNotFound(key))?;
                if let Some(to) = record.activity.resulting_stage() {
                    let from = entity.stage;
                    entity.transition(to, at)?;
                    record.transition = Some(StageChange { from, to });
                } else {
                    entity.touch(at);
                }
                match record.activity {
                    ActivityType::CommentProgress | ActivityType::Conversation => {
                        entity.counters.comments += 1;
                    }
                    ActivityType::Reassign => entity.owner = record.actor.clone(),
                    _ => {}
                }
            }
            self.count_success(&record);
        } else {
            self.stats.failed_activities += 1;
        }

        let seq = self.next_seq.max(1);
        self.next_seq = seq + 1;
        record.seq = seq;
        if record.timestamp > self.updated_at {
            self.updated_at = record.timestamp;
        }
        let cap = self.config.retention.activity_log_cap;
        self.activity_log.push(record, cap);
        Ok(seq)
    }

    fn count_success(&mut self, record: &ActivityRecord) {
        let stats = &mut self.stats;
        if record.transition.is_some() {
            stats.state_changes += 1;
        }
        match record.activity {
            ActivityType::CreateContainer => stats.containers_created += 1,
            ActivityType::CreateEntity => stats.entities_created += 1,
            ActivityType::CommentProgress | ActivityType::Conversation => {
                stats.comments_added += 1
            }
            ActivityType::Complete => stats.completions += 1,
            ActivityType::Reassign => stats.reassignments += 1,
            ActivityType::OutOfOffice => stats.out_of_office_notes += 1,
            ActivityType::StartWork | ActivityType::Block | ActivityType::Unblock => {}
        }
    }

    /// Error entries are allowed on terminal jobs so final failures are kept.
    pub fn record_error(
        &mut self,
        kind: ErrorKind,
        message: impl Into<String>,
        actor: Option<String>,
        now: DateTime<Utc>,
    ) {
        let cap = self.config.retention.error_log_cap;
        self.errors.push(
            ErrorEntry {
                timestamp: now,
                kind,
                message: message.into(),
                actor,
            },
            cap,
        );
        self.stats.errors += 1;
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    pub fn revoke_actor(&mut self, actor: &str) {
        if !self.revoked_actors.iter().any(|a| a == actor) {
            self.revoked_actors.push(actor.to_string());
        }
    }

    // -----------------------------------------------------------------------
    // Integrity
    // -----------------------------------------------------------------------

    /// Structural checks run on every load.
    pub fn validate(&self) -> Result<()> {
        let corrupt = |reason: String| CadenceError::CorruptSnapshot {
            id: self.id.clone(),
            reason,
        };
        crate::paths::validate_job_id(&self.id)?;

        let mut keys = HashSet::new();
        for c in &self.containers {
            if !keys.insert(c.key) {
                return Err(corrupt(format!("duplicate key {}", c.key)));
            }
            for e in &c.entities {
                if !keys.insert(e.key) {
                    return Err(corrupt(format!("duplicate key {}", e.key)));
                }
                if e.stage == LifecycleStage::Blocked && e.blocked_since.is_none() {
                    return Err(corrupt(format!("blocked entity {} has no blocked_since", e.key)));
                }
            }
        }
        if let Some(max) = keys.iter().max() {
            if *max >= self.next_key {
                return Err(corrupt(format!(
                    "next_key {} is not above existing key {max}",
                    self.next_key
                )));
            }
        }

        let mut last_seq = 0;
        for r in self.activity_log.iter() {
            if r.seq <= last_seq {
                return Err(corrupt(format!("activity seq {} out of order", r.seq)));
            }
            last_seq = r.seq;
        }
        if last_seq >= self.next_seq && last_seq > 0 {
            return Err(corrupt(format!(
                "next_seq {} is not above logged seq {last_seq}",
                self.next_seq
            )));
        }
        Ok(())
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id.clone(),
            name: self.display_name().to_string(),
            platform: self.platform_kind(),
            status: self.status,
            created_at: self.created_at,
            updated_at: self.updated_at,
            containers: self.containers.len(),
            entities: self.entities().count(),
            open_entities: self.open_entity_count(),
            activities: self.stats_activity_total(),
            errors: self.errors.len(),
            last_error: self.errors.latest().map(|e| e.message.clone()),
            next_activity_at: self.next_activity_at,
        }
    }

    fn stats_activity_total(&self) -> u64 {
        self.next_seq.saturating_sub(1)
    }
}

// ---------------------------------------------------------------------------
// JobSummary / JobFilter
// ---------------------------------------------------------------------------

/// List view of a job. Never carries credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: String,
    pub name: String,
    pub platform: PlatformKind,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub containers: usize,
    pub entities: usize,
    pub open_entities: usize,
    pub activities: u64,
    pub errors: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_activity_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<PlatformKind>,
}

impl JobFilter {
    pub fn matches(&self, summary: &JobSummary) -> bool {
        self.status.map_or(true, |s| s == summary.status)
            && self.platform.map_or(true, |p| p == summary.platform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::Outcome;
    use crate::config::{CredentialSpec, JobDuration};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 17, 0, 0).unwrap()
    }

    fn config() -> JobConfig {
        JobConfig {
            duration: JobDuration::Days(1),
            credentials: vec![CredentialSpec {
                actor: "Alice".into(),
                secret: "tok".into(),
                address: None,
            }],
            ..JobConfig::default()
        }
    }

    fn seeded() -> (JobSnapshot, u64) {
        let mut snap = JobSnapshot::new("ab12cd34", config(), t0());
        let c = snap.allocate_key();
        snap.add_container(c, "Launch", "Alice", Some("p-1".into()), t0())
            .unwrap();
        let e = snap.allocate_key();
        snap.add_entity(c, SimulatedEntity::new(e, "Write brief", "Alice", t0()))
            .unwrap();
        (snap, e)
    }

    fn record(activity: ActivityType, key: u64, at: DateTime<Utc>, outcome: Outcome) -> ActivityRecord {
        ActivityRecord {
            seq: 0,
            timestamp: at,
            activity,
            target: Target::Entity(key),
            actor: "Alice".into(),
            outcome,
            transition: None,
            summary: None,
        }
    }

    #[test]
    fn success_applies_transition_and_logs_it() {
        let (mut snap, e) = seeded();
        let at = t0() + Duration::hours(1);
        let seq = snap
            .record_activity(record(ActivityType::StartWork, e, at, Outcome::Success))
            .unwrap();
        assert_eq!(seq, 1);
        assert_eq!(snap.entity(e).unwrap().stage, LifecycleStage::InProgress);
        let last = snap.activity_log.last().unwrap();
        assert_eq!(
            last.transition,
            Some(StageChange {
                from: LifecycleStage::New,
                to: LifecycleStage::InProgress
            })
        );
        assert_eq!(snap.stats.state_changes, 1);
    }

    #[test]
    fn failure_logs_without_mutation() {
        let (mut snap, e) = seeded();
        let before = snap.entity(e).cloned().unwrap();
        snap.record_activity(record(
            ActivityType::StartWork,
            e,
            t0() + Duration::hours(1),
            Outcome::Failure {
                reason: "500".into(),
            },
        ))
        .unwrap();
        assert_eq!(snap.entity(e).unwrap(), &before);
        assert!(snap.activity_log.last().unwrap().transition.is_none());
        assert_eq!(snap.stats.failed_activities, 1);
    }

    #[test]
    fn illegal_transition_is_rejected_before_logging() {
        let (mut snap, e) = seeded();
        let err = snap
            .record_activity(record(ActivityType::Complete, e, t0(), Outcome::Success))
            .unwrap_err();
        assert!(matches!(err, CadenceError::InvalidTransition { .. }));
        assert!(snap.activity_log.is_empty());
    }

    #[test]
    fn terminal_job_rejects_records() {
        let (mut snap, e) = seeded();
        snap.set_status(JobStatus::Completed, t0()).unwrap();
        let err = snap
            .record_activity(record(ActivityType::StartWork, e, t0(), Outcome::Success))
            .unwrap_err();
        assert!(matches!(err, CadenceError::JobFinalized(_)));
        assert!(snap.set_status(JobStatus::Running, t0()).is_err());
    }

    #[test]
    fn comments_and_reassign_update_entity() {
        let (mut snap, e) = seeded();
        snap.record_activity(record(ActivityType::StartWork, e, t0(), Outcome::Success))
            .unwrap();
        snap.record_activity(record(ActivityType::CommentProgress, e, t0(), Outcome::Success))
            .unwrap();
        let mut reassign = record(ActivityType::Reassign, e, t0(), Outcome::Success);
        reassign.actor = "Bob".into();
        snap.record_activity(reassign).unwrap();
        let entity = snap.entity(e).unwrap();
        assert_eq!(entity.counters.comments, 1);
        assert_eq!(entity.owner, "Bob");
        assert_eq!(snap.stats.reassignments, 1);
    }

    #[test]
    fn duration_elapsed_after_one_day() {
        let (snap, _) = seeded();
        assert!(!snap.duration_elapsed(t0() + Duration::hours(23)));
        assert!(snap.duration_elapsed(t0() + Duration::days(1)));
    }

    #[test]
    fn validate_catches_duplicate_keys() {
        let (mut snap, e) = seeded();
        snap.validate().unwrap();
        let c = snap.containers[0].key;
        snap.add_entity(c, SimulatedEntity::new(e, "dup", "Alice", t0()))
            .unwrap();
        assert!(matches!(
            snap.validate(),
            Err(CadenceError::CorruptSnapshot { .. })
        ));
    }

    #[test]
    fn summary_hides_credentials_and_filters() {
        let (snap, _) = seeded();
        let summary = snap.summary();
        let yaml = serde_yaml::to_string(&summary).unwrap();
        assert!(!yaml.contains("tok"));
        assert_eq!(summary.entities, 1);
        assert_eq!(summary.open_entities, 1);

        let running = JobFilter {
            status: Some(JobStatus::Running),
            platform: None,
        };
        let okta = JobFilter {
            status: None,
            platform: Some(PlatformKind::Okta),
        };
        assert!(running.matches(&summary));
        assert!(!okta.matches(&summary));
    }
}
