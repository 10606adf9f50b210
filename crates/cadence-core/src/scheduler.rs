//! Decides whether an activity fires now, and which one.
//!
//! A tick goes through three gates:
//!
//! 1. Outside working hours, a rare off-hours roll must pass.
//! 2. A firing roll against `base × level × (burst | steady multiplier)`.
//! 3. A weighted pick among candidate (activity, target) pairs, where each
//!    candidate's weight grows with how long its target has been idle.
//!
//! Lifecycle transitions that should not happen on every pick (block,
//! unblock, complete) are additionally gated per entity by a hazard roll.
//! All randomness comes from one seeded `StdRng`, so a fixed seed, config,
//! snapshot and time sequence always produce the same decisions.

use crate::activity::Target;
use crate::config::{JobConfig, LifecycleRates, SchedulerTuning};
use crate::entity::SimulatedEntity;
use crate::snapshot::JobSnapshot;
use crate::types::{ActivityLevel, ActivityType, LifecycleStage};
use crate::work_pattern::WorkPattern;
use chrono::{DateTime, Duration, Utc};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

const HOURS_PER_DAY: f64 = 24.0;

/// One scheduler verdict: do `activity` to `target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub activity: ActivityType,
    pub target: Target,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub decision: Decision,
    pub weight: f64,
}

#[derive(Debug)]
pub struct ActivityScheduler {
    rng: StdRng,
    pattern: WorkPattern,
    level: ActivityLevel,
    burst_factor: f64,
    rates: LifecycleRates,
    creation_cadence_days: f64,
    tuning: SchedulerTuning,
}

impl ActivityScheduler {
    /// Seeded from `config.seed` when present, from entropy otherwise.
    pub fn new(config: &JobConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self::with_rng(config, rng)
    }

    pub fn with_seed(config: &JobConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &JobConfig, rng: StdRng) -> Self {
        Self {
            rng,
            pattern: WorkPattern::new(config.work_pattern, config.utc_offset_minutes),
            level: config.activity_level,
            burst_factor: config.burst_factor.clamp(0.0, 1.0),
            rates: config.rates.clone(),
            creation_cadence_days: config.creation_cadence_days,
            tuning: config.tuning.clone(),
        }
    }

    pub fn pattern(&self) -> &WorkPattern {
        &self.pattern
    }

    pub fn tuning(&self) -> &SchedulerTuning {
        &self.tuning
    }

    /// The scheduler's random stream, shared with the caller so one seed
    /// reproduces a whole run.
    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    // -----------------------------------------------------------------------
    // Probability curves
    // -----------------------------------------------------------------------

    pub fn burst_multiplier(&self) -> f64 {
        1.0 + (self.tuning.burst_boost - 1.0) * (1.0 - self.burst_factor)
    }

    pub fn steady_multiplier(&self) -> f64 {
        let floor = self.tuning.steady_floor;
        floor + (1.0 - floor) * self.burst_factor
    }

    /// Firing probability for a tick at `t`, given working hours. Off-hours
    /// ticks must additionally pass the off-hours roll.
    pub fn firing_probability(&self, t: DateTime<Utc>) -> f64 {
        let mult = if self.pattern.is_burst_window(t) {
            self.burst_multiplier()
        } else {
            self.steady_multiplier()
        };
        (self.tuning.base_tick_rate * self.level.multiplier() * mult).clamp(0.0, 1.0)
    }

    fn completion_hazard(&self) -> f64 {
        let weekly = (self.rates.completion_rate_per_week / 100.0).clamp(0.0, 0.999_999);
        -(1.0 - weekly).ln() / 7.0
    }

    /// Chance that an in-progress entity idle for `idle_days` completes on this check.
    pub fn completion_probability(&self, idle_days: f64) -> f64 {
        1.0 - (-self.completion_hazard() * idle_days.max(0.0)).exp()
    }

    /// Chance that an in-progress entity idle for `idle_days` gets blocked.
    pub fn block_probability(&self, idle_days: f64) -> f64 {
        let frac = (self.rates.block_frequency_pct / 100.0).clamp(0.0, 0.999_999);
        let hazard = -(1.0 - frac).ln() * self.completion_hazard();
        1.0 - (-hazard * idle_days.max(0.0)).exp()
    }

    /// Chance that an entity blocked for `blocked` is unblocked on this check.
    pub fn unblock_probability(&self, blocked: Duration) -> f64 {
        let hours = blocked.num_seconds() as f64 / 3600.0;
        if hours < self.tuning.min_block_hours {
            return 0.0;
        }
        let mean_hours = self.rates.avg_block_days * HOURS_PER_DAY;
        let ratio = if mean_hours > 0.0 { hours / mean_hours } else { f64::INFINITY };
        let t = &self.tuning;
        if ratio < 1.0 {
            ratio * t.unblock_before_mean
        } else {
            (t.unblock_at_mean + (ratio - 1.0) * t.unblock_overdue_growth).min(t.unblock_cap)
        }
    }

    // -----------------------------------------------------------------------
    // Decisions
    // -----------------------------------------------------------------------

    /// Gate 1 and 2: should anything happen at `now`?
    pub fn should_fire(&mut self, now: DateTime<Utc>) -> bool {
        if !self.pattern.is_working_hours(now)
            && !self.rng.gen_bool(self.tuning.off_hours_chance.clamp(0.0, 1.0))
        {
            return false;
        }
        let p = self.firing_probability(now);
        self.rng.gen_bool(p)
    }

    pub fn decide(&mut self, now: DateTime<Utc>, snapshot: &JobSnapshot) -> Option<Decision> {
        if !self.should_fire(now) {
            return None;
        }
        self.choose(now, snapshot)
    }

    /// Pick an activity without the working-hours and firing rolls.
    pub fn decide_forced(&mut self, now: DateTime<Utc>, snapshot: &JobSnapshot) -> Option<Decision> {
        self.choose(now, snapshot)
    }

    fn choose(&mut self, now: DateTime<Utc>, snapshot: &JobSnapshot) -> Option<Decision> {
        // Bootstrap: a fresh job needs somewhere to put work.
        let Some(current) = snapshot.current_container() else {
            return Some(Decision {
                activity: ActivityType::CreateContainer,
                target: Target::Workspace,
            });
        };
        if snapshot.entities().next().is_none() {
            return Some(Decision {
                activity: ActivityType::CreateEntity,
                target: Target::Container(current.key),
            });
        }

        let mut pool = Vec::new();
        self.creation_candidates(now, snapshot, &mut pool);
        self.lifecycle_candidates(now, snapshot, &mut pool);
        self.pick(&pool)
    }

    fn creation_candidates(&mut self, now: DateTime<Utc>, snapshot: &JobSnapshot, out: &mut Vec<Candidate>) {
        let t = self.tuning.clone();
        let Some(current) = snapshot.current_container() else {
            return;
        };

        let since_container = snapshot
            .last_container_created_at
            .unwrap_or(current.created_at);
        let cadence_due = days(now - since_container) >= self.creation_cadence_days;
        let rollover_due = current.completion_ratio() > t.container_rollover_threshold;
        let container_roll = (cadence_due && self.rng.gen_bool(t.container_cadence_chance.clamp(0.0, 1.0)))
            || (rollover_due && self.rng.gen_bool(t.container_rollover_chance.clamp(0.0, 1.0)));
        if container_roll {
            out.push(Candidate {
                decision: Decision {
                    activity: ActivityType::CreateContainer,
                    target: Target::Workspace,
                },
                weight: t.weights.create_container * (1.0 + hours(now - since_container)),
            });
        }

        let interval = Duration::minutes(i64::from(t.entity_creation_interval_minutes));
        let since_entity = snapshot.last_entity_created_at.unwrap_or(current.created_at);
        if snapshot.open_entity_count() < t.max_open_entities
            && now - since_entity >= interval
            && self.rng.gen_bool(t.entity_creation_chance.clamp(0.0, 1.0))
        {
            out.push(Candidate {
                decision: Decision {
                    activity: ActivityType::CreateEntity,
                    target: Target::Container(current.key),
                },
                weight: t.weights.create_entity * (1.0 + hours(now - since_entity)),
            });
        }
    }

    fn lifecycle_candidates(&mut self, now: DateTime<Utc>, snapshot: &JobSnapshot, out: &mut Vec<Candidate>) {
        let live_actors = snapshot
            .config
            .credentials
            .iter()
            .filter(|c| !snapshot.revoked_actors.contains(&c.actor))
            .count();

        let w = self.tuning.weights.clone();
        for entity in snapshot.entities() {
            let idle = entity.idle_for(now);
            let due = 1.0 + hours(idle);
            let mut push = |activity: ActivityType, weight: f64| {
                out.push(Candidate {
                    decision: Decision {
                        activity,
                        target: Target::Entity(entity.key),
                    },
                    weight: weight * due,
                });
            };

            match entity.stage {
                LifecycleStage::New => {
                    let age = days(entity.time_in_stage(now));
                    push(
                        ActivityType::StartWork,
                        w.start_work * (1.0 + age * self.tuning.new_age_growth_per_day),
                    );
                }
                LifecycleStage::InProgress => {
                    push(ActivityType::CommentProgress, w.comment_progress);
                    push(ActivityType::Conversation, w.conversation);
                    if live_actors >= 2 {
                        push(ActivityType::Reassign, w.reassign);
                    }
                    let idle_days = days(idle);
                    let p_block = self.block_probability(idle_days).clamp(0.0, 1.0);
                    let p_complete = self.completion_probability(idle_days).clamp(0.0, 1.0);
                    if self.can_block(entity) && self.rng.gen_bool(p_block) {
                        push(ActivityType::Block, w.block);
                    }
                    if self.rng.gen_bool(p_complete) {
                        push(ActivityType::Complete, w.complete);
                    }
                }
                LifecycleStage::Blocked => {
                    push(ActivityType::Conversation, w.conversation);
                    let blocked = entity.blocked_for(now).unwrap_or_else(Duration::zero);
                    let p = self.unblock_probability(blocked).clamp(0.0, 1.0);
                    if self.rng.gen_bool(p) {
                        push(ActivityType::Unblock, w.unblock);
                    }
                }
                LifecycleStage::Completed => {}
            }
        }
    }

    fn can_block(&self, entity: &SimulatedEntity) -> bool {
        entity.stage == LifecycleStage::InProgress
            && entity.times_blocked < self.tuning.max_blocks_per_entity
    }

    fn pick(&mut self, pool: &[Candidate]) -> Option<Decision> {
        let weights: Vec<f64> = pool
            .iter()
            .map(|c| if c.weight.is_finite() && c.weight > 0.0 { c.weight } else { 0.0 })
            .collect();
        let index = WeightedIndex::new(&weights).ok()?;
        Some(pool[index.sample(&mut self.rng)].decision)
    }
}

fn hours(d: Duration) -> f64 {
    d.num_seconds().max(0) as f64 / 3600.0
}

fn days(d: Duration) -> f64 {
    hours(d) / HOURS_PER_DAY
}
