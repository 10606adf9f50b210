use crate::error::{CadenceError, Result};
use crate::types::LifecycleStage;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Container
// ---------------------------------------------------------------------------

/// A top-level grouping on the platform (project, group, account).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub key: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_id: Option<String>,
    pub name: String,
    pub owner: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub entities: Vec<SimulatedEntity>,
}

impl Container {
    /// Share of entities that reached `completed`; 0 for an empty container.
    pub fn completion_ratio(&self) -> f64 {
        if self.entities.is_empty() {
            return 0.0;
        }
        let done = self
            .entities
            .iter()
            .filter(|e| e.stage == LifecycleStage::Completed)
            .count();
        done as f64 / self.entities.len() as f64
    }
}

// ---------------------------------------------------------------------------
// SimulatedEntity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityCounters {
    #[serde(default)]
    pub comments: u32,
    #[serde(default)]
    pub state_changes: u32,
}

/// One task, user or record being animated through its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedEntity {
    /// Job-local identifier, stable before and after platform creation.
    pub key: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_id: Option<String>,
    pub name: String,
    pub stage: LifecycleStage,
    pub owner: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub stage_entered_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocker_reason: Option<String>,
    #[serde(default)]
    pub times_blocked: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub counters: EntityCounters,
}

impl SimulatedEntity {
    pub fn new(key: u64, name: impl Into<String>, owner: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            key,
            platform_id: None,
            name: name.into(),
            stage: LifecycleStage::New,
            owner: owner.into(),
            created_at: now,
            last_activity_at: now,
            stage_entered_at: now,
            blocked_since: None,
            blocker_reason: None,
            times_blocked: 0,
            completed_at: None,
            counters: EntityCounters::default(),
        }
    }

    /// Move to `to`, rejecting anything that is not a lifecycle edge.
    pub fn transition(&mut self, to: LifecycleStage, at: DateTime<Utc>) -> Result<()> {
        if !self.stage.can_transition_to(to) {
            return Err(CadenceError::InvalidTransition {
                from: self.stage.to_string(),
                to: to.to_string(),
                reason: format!("entity {} has no such lifecycle edge", self.key),
            });
        }
        match to {
            LifecycleStage::Blocked => {
                self.blocked_since = Some(at);
                self.times_blocked += 1;
            }
            LifecycleStage::InProgress => {
                self.blocked_since = None;
                self.blocker_reason = None;
            }
            LifecycleStage::Completed => self.completed_at = Some(at),
            LifecycleStage::New => {}
        }
        self.stage = to;
        self.stage_entered_at = at.max(self.stage_entered_at);
        self.counters.state_changes += 1;
        self.touch(at);
        Ok(())
    }

    /// Record activity at `at`. The timestamp never moves backwards.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.last_activity_at {
            self.last_activity_at = at;
        }
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_activity_at).max(Duration::zero())
    }

    pub fn time_in_stage(&self, now: DateTime<Utc>) -> Duration {
        (now - self.stage_entered_at).max(Duration::zero())
    }

    pub fn blocked_for(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.blocked_since
            .map(|since| (now - since).max(Duration::zero()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 17, 0, 0).unwrap()
    }

    #[test]
    fn full_lifecycle() {
        let mut e = SimulatedEntity::new(1, "Draft launch plan", "Alice", t0());
        e.transition(LifecycleStage::InProgress, t0() + Duration::hours(1))
            .unwrap();
        e.transition(LifecycleStage::Blocked, t0() + Duration::hours(2))
            .unwrap();
        assert_eq!(e.times_blocked, 1);
        assert_eq!(
            e.blocked_for(t0() + Duration::hours(5)),
            Some(Duration::hours(3))
        );
        e.transition(LifecycleStage::InProgress, t0() + Duration::hours(6))
            .unwrap();
        assert!(e.blocked_since.is_none());
        e.transition(LifecycleStage::Completed, t0() + Duration::hours(7))
            .unwrap();
        assert_eq!(e.counters.state_changes, 4);
        assert_eq!(e.completed_at, Some(t0() + Duration::hours(7)));
    }

    #[test]
    fn completed_is_terminal() {
        let mut e = SimulatedEntity::new(1, "x", "Alice", t0());
        e.transition(LifecycleStage::InProgress, t0()).unwrap();
        e.transition(LifecycleStage::Completed, t0()).unwrap();
        for to in LifecycleStage::all() {
            assert!(matches!(
                e.transition(*to, t0()),
                Err(CadenceError::InvalidTransition { .. })
            ));
        }
        assert_eq!(e.stage, LifecycleStage::Completed);
    }

    #[test]
    fn new_cannot_skip_to_blocked() {
        let mut e = SimulatedEntity::new(1, "x", "Alice", t0());
        assert!(e.transition(LifecycleStage::Blocked, t0()).is_err());
        assert_eq!(e.counters.state_changes, 0);
    }

    #[test]
    fn last_activity_is_monotonic() {
        let mut e = SimulatedEntity::new(1, "x", "Alice", t0());
        e.touch(t0() + Duration::hours(3));
        e.touch(t0() + Duration::hours(1));
        assert_eq!(e.last_activity_at, t0() + Duration::hours(3));
    }

    #[test]
    fn completion_ratio() {
        let mut c = Container {
            key: 1,
            platform_id: None,
            name: "Q3".into(),
            owner: "Alice".into(),
            created_at: t0(),
            entities: vec![],
        };
        assert_eq!(c.completion_ratio(), 0.0);
        c.entities.push(SimulatedEntity::new(2, "a", "Alice", t0()));
        let mut done = SimulatedEntity::new(3, "b", "Alice", t0());
        done.stage = LifecycleStage::Completed;
        c.entities.push(done);
        assert_eq!(c.completion_ratio(), 0.5);
    }
}
