//! The per-job control loop.
//!
//! One [`JobOrchestrator`] owns a job's snapshot, scheduler and client pool.
//! [`JobOrchestrator::tick`] performs at most one activity; [`JobOrchestrator::run`]
//! drives ticks until the job finishes or the registry lets go of it.
//!
//! Suspension points, all cancellable through the control channel:
//! idle sleep, post-activity gap, throttle cool-down, call spacing.
//! Saves are never cancelled.

use crate::control::{ControlListener, Directive, Wake};
use cadence_core::activity::{ActivityRecord, ErrorKind, Outcome, Target};
use cadence_core::client_pool::{
    ClientPool, PlatformConnector, PlatformError, PlatformOp, PoolError, Resource, Update,
};
use cadence_core::clock::Clock;
use cadence_core::config::ServiceConfig;
use cadence_core::content::{ContentContext, ContentGenerator, ContentKind, TemplateContent};
use cadence_core::entity::SimulatedEntity;
use cadence_core::scheduler::{ActivityScheduler, Decision};
use cadence_core::snapshot::JobSnapshot;
use cadence_core::store::StateStore;
use cadence_core::types::{ActivityType, JobStatus, LifecycleStage};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Shared collaborators every orchestrator needs.
#[derive(Clone)]
pub struct Deps {
    pub store: Arc<dyn StateStore>,
    pub connector: Arc<dyn PlatformConnector>,
    pub content: Arc<dyn ContentGenerator>,
    pub clock: Arc<dyn Clock>,
    pub service: ServiceConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing fired.
    Idle,
    Acted(ActivityType),
    /// The platform call failed; the failure is logged and the loop goes on.
    Failed,
    /// The platform rate-limited the job.
    Throttled,
    /// A pause or stop arrived before the platform call; nothing was done.
    Interrupted,
    /// The job reached a terminal status.
    Finished(JobStatus),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub deleted_entities: usize,
    pub deleted_containers: usize,
    pub failures: usize,
}

/// What kind of call an activity turns into, before its text exists.
enum Shape {
    Create(Resource, Option<String>),
    Update(String),
}

/// A fully prepared platform call.
struct Planned {
    decision: Decision,
    actor: String,
    op: PlatformOp,
    text: String,
}

pub struct JobOrchestrator {
    snapshot: JobSnapshot,
    scheduler: ActivityScheduler,
    pool: ClientPool,
    deps: Deps,
    control: ControlListener,
    validated: bool,
}

impl JobOrchestrator {
    pub fn new(snapshot: JobSnapshot, deps: Deps, control: ControlListener) -> Self {
        let scheduler = ActivityScheduler::new(&snapshot.config);
        let pool = ClientPool::connect(
            &snapshot.config.platform,
            &snapshot.config.credentials,
            &snapshot.revoked_actors,
            deps.connector.as_ref(),
            deps.service.call_budget_fraction,
        );
        Self {
            snapshot,
            scheduler,
            pool,
            deps,
            control,
            validated: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.snapshot.id
    }

    pub fn snapshot(&self) -> &JobSnapshot {
        &self.snapshot
    }

    pub fn pool(&self) -> &ClientPool {
        &self.pool
    }

    fn now(&self) -> DateTime<Utc> {
        self.deps.clock.now()
    }

    // -----------------------------------------------------------------------
    // Loop
    // -----------------------------------------------------------------------

    /// Drive the job until it reaches a terminal status or is detached.
    /// Returns the status the loop left the job in.
    pub async fn run(mut self) -> JobStatus {
        info!(job = %self.snapshot.id, platform = %self.snapshot.platform_kind(), "orchestrator started");
        loop {
            match self.control.directive() {
                Directive::Stop => {
                    self.finish(JobStatus::Stopped).await;
                    break;
                }
                Directive::Detach => {
                    debug!(job = %self.snapshot.id, "orchestrator detached");
                    break;
                }
                Directive::Pause => {
                    if self.snapshot.status == JobStatus::Running {
                        self.set_status(JobStatus::Paused).await;
                        info!(job = %self.snapshot.id, "job paused");
                    }
                    self.control.changed().await;
                    continue;
                }
                Directive::Run => {
                    if self.snapshot.status == JobStatus::Paused {
                        self.set_status(JobStatus::Running).await;
                        info!(job = %self.snapshot.id, "job resumed");
                    }
                }
            }
            if self.snapshot.status.is_terminal() {
                break;
            }

            if !self.validated {
                // An expired job finishes without touching the platform.
                if self.snapshot.duration_elapsed(self.now()) {
                    let status = self.finish(JobStatus::Completed).await;
                    info!(job = %self.snapshot.id, status = %status, "duration elapsed before first tick");
                    break;
                }
                if let Some(status) = self.validate_credentials().await {
                    info!(job = %self.snapshot.id, status = %status, "job finished during credential check");
                    break;
                }
            }

            let forced = self.control.take_act_now();
            let outcome = self.tick(forced).await;
            let wait = match outcome {
                TickOutcome::Finished(status) => {
                    info!(job = %self.snapshot.id, status = %status, "orchestrator finished");
                    break;
                }
                TickOutcome::Throttled => {
                    let cooldown = self.deps.service.throttle_cooldown();
                    warn!(job = %self.snapshot.id, cooldown_ms = cooldown.as_millis() as u64, "throttled, cooling down");
                    self.snapshot.next_activity_at = Some(self.now() + chrono_duration(cooldown));
                    if self.control.sleep(cooldown).await == Wake::Elapsed {
                        self.narrate_gap().await;
                    }
                    continue;
                }
                TickOutcome::Idle | TickOutcome::Interrupted => {
                    let (lo, hi) = self.deps.service.idle_range();
                    random_between(self.scheduler.rng(), lo, hi)
                }
                TickOutcome::Acted(_) | TickOutcome::Failed => {
                    let (lo, hi) = self.deps.service.activity_gap_range();
                    random_between(self.scheduler.rng(), lo, hi)
                }
            };
            self.snapshot.next_activity_at = Some(self.now() + chrono_duration(wait));
            self.control.sleep(wait).await;
        }
        self.snapshot.status
    }

    /// Issue a `list` per credential and revoke rejected ones. Returns the
    /// terminal status if no credential survived.
    pub async fn validate_credentials(&mut self) -> Option<JobStatus> {
        self.validated = true;
        let kind = self.snapshot.platform_kind();
        let fraction = self.deps.service.call_budget_fraction;
        let mut pool = std::mem::replace(&mut self.pool, ClientPool::new(kind, fraction));
        let checked = pool.valid_actors().len();
        let result = tokio::task::spawn_blocking(move || {
            let revoked = pool.validate_all(Instant::now());
            (pool, revoked)
        })
        .await;

        let now = self.now();
        match result {
            Ok((pool, revoked)) => {
                self.pool = pool;
                for _ in 0..checked {
                    self.snapshot.usage.record_platform_call(now);
                }
                for actor in revoked {
                    warn!(job = %self.snapshot.id, actor = %actor, "credential rejected during validation");
                    self.snapshot.revoke_actor(&actor);
                    self.snapshot.record_error(
                        ErrorKind::CredentialInvalid,
                        format!("credential for {actor} rejected during validation"),
                        Some(actor.clone()),
                        now,
                    );
                }
            }
            Err(e) => {
                error!(job = %self.snapshot.id, error = %e, "credential validation task failed");
                self.snapshot.record_error(ErrorKind::Unexpected, e.to_string(), None, now);
            }
        }

        if self.pool.is_exhausted() {
            error!(job = %self.snapshot.id, "no valid credentials; job errored");
            self.snapshot.record_error(
                ErrorKind::CredentialInvalid,
                "no valid credentials remain",
                None,
                now,
            );
            self.finish(JobStatus::Errored).await;
            return Some(JobStatus::Errored);
        }
        self.persist_or_escalate().await
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    /// Run one decision cycle. `forced` skips the working-hours and firing rolls.
    pub async fn tick(&mut self, forced: bool) -> TickOutcome {
        if self.snapshot.status.is_terminal() {
            return TickOutcome::Finished(self.snapshot.status);
        }
        let now = self.now();
        if self.snapshot.duration_elapsed(now) {
            info!(job = %self.snapshot.id, duration = %self.snapshot.config.duration, "duration elapsed");
            return TickOutcome::Finished(self.finish(JobStatus::Completed).await);
        }
        if self.snapshot.usage.roll_day(now) {
            debug!(job = %self.snapshot.id, "daily usage counters reset");
        }
        if self.pool.is_exhausted() {
            return TickOutcome::Finished(self.escalate_exhausted(now).await);
        }

        let decision = if forced {
            self.scheduler.decide_forced(now, &self.snapshot)
        } else {
            self.scheduler.decide(now, &self.snapshot)
        };
        let Some(decision) = decision else {
            return TickOutcome::Idle;
        };

        let planned = match self.plan(decision).await {
            Ok(Some(p)) => p,
            Ok(None) => return TickOutcome::Idle,
            Err(PoolError::Exhausted) => return TickOutcome::Finished(self.escalate_exhausted(now).await),
            Err(e) => {
                self.note_error(ErrorKind::Unexpected, e.to_string(), None);
                return TickOutcome::Failed;
            }
        };

        if self.control.directive() != Directive::Run {
            debug!(job = %self.snapshot.id, "control changed before platform call; dropping decision");
            return TickOutcome::Interrupted;
        }
        let spacing = self.pool.spacing_delay(Instant::now());
        if !spacing.is_zero()
            && self.control.sleep(spacing).await == Wake::Signalled
            && self.control.directive() != Directive::Run
        {
            return TickOutcome::Interrupted;
        }

        self.execute(planned).await
    }

    /// Choose the actor and build the platform call for `decision`.
    async fn plan(&mut self, decision: Decision) -> Result<Option<Planned>, PoolError> {
        let activity = decision.activity;
        let mut ctx = self.base_context();
        ctx.salt = self.snapshot.next_seq;

        let (actor, shape) = match decision.target {
            Target::Workspace => {
                let actor = self.pool.route(None, self.scheduler.rng())?;
                (actor, Shape::Create(Resource::Container, None))
            }
            Target::Container(key) => {
                let Some(container) = self.snapshot.container(key) else {
                    return Ok(None);
                };
                ctx.container_name = Some(container.name.clone());
                let parent = container.platform_id.clone();
                let actor = self.pool.route(None, self.scheduler.rng())?;
                (actor, Shape::Create(Resource::Entity, parent))
            }
            Target::Entity(key) => {
                let Some(entity) = self.snapshot.entity(key) else {
                    return Ok(None);
                };
                let owner = entity.owner.clone();
                ctx.entity_name = Some(entity.name.clone());
                let Some(id) = entity.platform_id.clone() else {
                    warn!(job = %self.snapshot.id, entity = key, "entity has no platform id; skipping");
                    return Ok(None);
                };
                ctx.container_name = self.snapshot.container_of(key).map(|c| c.name.clone());

                let other = match activity {
                    ActivityType::Reassign | ActivityType::Conversation => {
                        self.pool.other_actor(&owner, self.scheduler.rng())
                    }
                    _ => None,
                };
                let actor = match (activity, other) {
                    (ActivityType::Reassign, None) => return Ok(None),
                    (_, Some(other)) => other,
                    (_, None) => self.pool.route(Some(&owner), self.scheduler.rng())?,
                };
                if activity == ActivityType::Conversation && actor != owner {
                    ctx.other_actor = Some(owner);
                }
                (actor, Shape::Update(id))
            }
        };

        ctx.actor = actor.clone();
        let text = self.generate(content_kind(activity), &ctx).await;
        let op = match shape {
            Shape::Create(resource, parent) => PlatformOp::Create {
                resource,
                name: text.clone(),
                parent,
                owner: actor.clone(),
                description: None,
            },
            Shape::Update(id) => match entity_op(activity, id, &actor, &text) {
                Some(op) => op,
                None => return Ok(None),
            },
        };
        Ok(Some(Planned {
            decision,
            actor,
            op,
            text,
        }))
    }

    /// Call the platform and commit the outcome.
    async fn execute(&mut self, planned: Planned) -> TickOutcome {
        let Planned {
            decision,
            actor,
            op,
            text,
        } = planned;
        let activity = decision.activity;

        let result = self.call(&actor, op).await;
        let now = self.now();
        match result {
            Ok(platform_id) => {
                if let Err(e) = self.commit_success(decision, &actor, platform_id, text, now) {
                    self.note_error(ErrorKind::Unexpected, e.to_string(), Some(actor));
                    return self.persisted(TickOutcome::Failed).await;
                }
                info!(job = %self.snapshot.id, activity = %activity, actor = %actor, target = %decision.target, "activity recorded");
                self.persisted(TickOutcome::Acted(activity)).await
            }
            Err(err) => {
                self.commit_failure(decision, &actor, &err, now);
                match err {
                    PoolError::Throttled { .. } => {
                        self.note_error(ErrorKind::Throttle, err.to_string(), Some(actor));
                        self.persisted(TickOutcome::Throttled).await
                    }
                    PoolError::CredentialRevoked { ref reason, .. } => {
                        self.snapshot.revoke_actor(&actor);
                        let message = format!("credential for {actor} revoked: {reason}");
                        self.note_error(ErrorKind::CredentialInvalid, message, Some(actor));
                        self.persisted(TickOutcome::Failed).await
                    }
                    PoolError::Exhausted => {
                        self.snapshot.revoke_actor(&actor);
                        TickOutcome::Finished(self.escalate_exhausted(now).await)
                    }
                    PoolError::Platform(msg) => {
                        self.note_error(ErrorKind::Platform, msg, Some(actor));
                        self.persisted(TickOutcome::Failed).await
                    }
                    PoolError::UnknownActor(_) => {
                        self.note_error(ErrorKind::Unexpected, err.to_string(), Some(actor));
                        self.persisted(TickOutcome::Failed).await
                    }
                }
            }
        }
    }

    /// Checkout, run the request off the async threads, settle.
    async fn call(&mut self, actor: &str, op: PlatformOp) -> Result<Option<String>, PoolError> {
        let lease = self.pool.checkout(actor, Instant::now())?;
        let now = self.now();
        self.snapshot.usage.record_platform_call(now);
        let client = Arc::clone(&lease.client);
        let result = tokio::task::spawn_blocking(move || client.invoke(&op))
            .await
            .unwrap_or_else(|e| Err(PlatformError::Other(format!("platform call panicked: {e}"))));
        self.pool.settle(&lease, result).map(|resp| resp.id)
    }

    fn commit_success(
        &mut self,
        decision: Decision,
        actor: &str,
        platform_id: Option<String>,
        text: String,
        now: DateTime<Utc>,
    ) -> cadence_core::Result<u64> {
        let target = match (decision.activity, decision.target) {
            (ActivityType::CreateContainer, _) => {
                let key = self.snapshot.allocate_key();
                self.snapshot
                    .add_container(key, text.clone(), actor, platform_id, now)?;
                Target::Container(key)
            }
            (ActivityType::CreateEntity, Target::Container(container)) => {
                let key = self.snapshot.allocate_key();
                let mut entity = SimulatedEntity::new(key, text.clone(), actor, now);
                entity.platform_id = platform_id;
                self.snapshot.add_entity(container, entity)?;
                Target::Entity(key)
            }
            (_, target) => target,
        };
        if decision.activity == ActivityType::Block {
            if let Target::Entity(key) = target {
                if let Some(e) = self.snapshot.entity_mut(key) {
                    e.blocker_reason = Some(text.clone());
                }
            }
        }
        self.snapshot.record_activity(ActivityRecord {
            seq: 0,
            timestamp: now,
            activity: decision.activity,
            target,
            actor: actor.to_string(),
            outcome: Outcome::Success,
            transition: None,
            summary: Some(text),
        })
    }

    fn commit_failure(&mut self, decision: Decision, actor: &str, err: &PoolError, now: DateTime<Utc>) {
        let record = ActivityRecord {
            seq: 0,
            timestamp: now,
            activity: decision.activity,
            target: decision.target,
            actor: actor.to_string(),
            outcome: Outcome::Failure {
                reason: err.to_string(),
            },
            transition: None,
            summary: None,
        };
        if let Err(e) = self.snapshot.record_activity(record) {
            warn!(job = %self.snapshot.id, error = %e, "could not log failed activity");
        }
    }

    // -----------------------------------------------------------------------
    // Content
    // -----------------------------------------------------------------------

    fn base_context(&self) -> ContentContext {
        ContentContext {
            platform: self.snapshot.platform_kind(),
            industry: self.snapshot.config.industry.clone(),
            workspace_name: self.snapshot.config.workspace_name.clone(),
            ..ContentContext::default()
        }
    }

    /// Ask the generator for text, bounded by the content timeout. Any
    /// failure falls back to the deterministic template.
    async fn generate(&mut self, kind: ContentKind, ctx: &ContentContext) -> String {
        let content = Arc::clone(&self.deps.content);
        let request = ctx.clone();
        let task = tokio::task::spawn_blocking(move || content.generate(kind, &request));
        let failure = match tokio::time::timeout(self.deps.service.content_timeout(), task).await {
            Ok(Ok(Ok(generated))) if !generated.text.trim().is_empty() => {
                let now = self.now();
                self.snapshot.usage.record_content_call(generated.tokens, now);
                return generated.text;
            }
            Ok(Ok(Ok(_))) => "generator returned empty text".to_string(),
            Ok(Ok(Err(e))) => e.to_string(),
            Ok(Err(e)) => format!("generator task failed: {e}"),
            Err(_) => format!(
                "generator timed out after {}ms",
                self.deps.service.content_timeout_ms
            ),
        };
        self.note_error(
            ErrorKind::ContentGeneration,
            format!("{kind}: {failure}"),
            Some(ctx.actor.clone()),
        );
        TemplateContent::render(kind, ctx)
    }

    // -----------------------------------------------------------------------
    // Throttle narrative
    // -----------------------------------------------------------------------

    /// After a cool-down, let a few actors explain the silence.
    async fn narrate_gap(&mut self) {
        let chance = self.deps.service.narrative_chance.clamp(0.0, 1.0);
        let max = self.deps.service.narrative_max;
        let actors: Vec<String> = self.pool.valid_actors().iter().map(|a| a.to_string()).collect();
        let mut posted = 0;

        for actor in actors {
            if posted >= max || self.control.directive() != Directive::Run {
                break;
            }
            if !self.scheduler.rng().gen_bool(chance) {
                continue;
            }
            let Some((key, id, name)) = self.narrative_target(&actor) else {
                continue;
            };
            let mut ctx = self.base_context();
            ctx.actor = actor.clone();
            ctx.entity_name = Some(name);
            ctx.salt = self.snapshot.next_seq;
            let text = self.generate(ContentKind::OutOfOffice, &ctx).await;

            let spacing = self.pool.spacing_delay(Instant::now());
            if !spacing.is_zero() && self.control.sleep(spacing).await == Wake::Signalled {
                break;
            }
            let op = PlatformOp::Update {
                id,
                update: Update::Comment { text: text.clone() },
            };
            let decision = Decision {
                activity: ActivityType::OutOfOffice,
                target: Target::Entity(key),
            };
            match self.call(&actor, op).await {
                Ok(_) => {
                    let now = self.now();
                    if let Err(e) = self.commit_success(decision, &actor, None, text, now) {
                        warn!(job = %self.snapshot.id, error = %e, "could not record out-of-office note");
                        break;
                    }
                    posted += 1;
                }
                Err(err) => {
                    let now = self.now();
                    self.commit_failure(decision, &actor, &err, now);
                    break;
                }
            }
        }
        if posted > 0 {
            info!(job = %self.snapshot.id, notes = posted, "posted out-of-office notes after throttle");
        }
        self.persist_or_escalate().await;
    }

    /// An open entity to hang an out-of-office note on, preferring the actor's own.
    fn narrative_target(&self, actor: &str) -> Option<(u64, String, String)> {
        let open = || {
            self.snapshot
                .entities()
                .filter(|e| e.stage.is_open() && e.platform_id.is_some())
        };
        open()
            .find(|e| e.owner == actor)
            .or_else(|| open().next())
            .and_then(|e| e.platform_id.clone().map(|id| (e.key, id, e.name.clone())))
    }

    // -----------------------------------------------------------------------
    // Cleanup
    // -----------------------------------------------------------------------

    /// Delete every created entity, then every container, from the platform.
    /// Only valid for jobs whose loop is not running.
    pub async fn cleanup(&mut self) -> CleanupReport {
        let mut report = CleanupReport::default();
        let entities: Vec<(u64, Option<String>, String)> = self
            .snapshot
            .entities()
            .map(|e| (e.key, e.platform_id.clone(), e.owner.clone()))
            .collect();

        for (key, platform_id, owner) in entities {
            let Some(id) = platform_id else {
                self.snapshot.remove_entity(key);
                continue;
            };
            match self.cleanup_delete(Resource::Entity, id, &owner).await {
                Ok(()) => {
                    self.snapshot.remove_entity(key);
                    report.deleted_entities += 1;
                }
                Err(e) => {
                    report.failures += 1;
                    if matches!(e, PoolError::Throttled { .. } | PoolError::Exhausted) {
                        break;
                    }
                }
            }
        }

        let containers: Vec<(u64, Option<String>, String, bool)> = self
            .snapshot
            .containers
            .iter()
            .map(|c| (c.key, c.platform_id.clone(), c.owner.clone(), c.entities.is_empty()))
            .collect();
        for (key, platform_id, owner, empty) in containers {
            if !empty {
                continue;
            }
            let Some(id) = platform_id else {
                self.snapshot.remove_container(key);
                continue;
            };
            match self.cleanup_delete(Resource::Container, id, &owner).await {
                Ok(()) => {
                    self.snapshot.remove_container(key);
                    report.deleted_containers += 1;
                }
                Err(e) => {
                    report.failures += 1;
                    if matches!(e, PoolError::Throttled { .. } | PoolError::Exhausted) {
                        break;
                    }
                }
            }
        }

        info!(
            job = %self.snapshot.id,
            entities = report.deleted_entities,
            containers = report.deleted_containers,
            failures = report.failures,
            "cleanup finished"
        );
        if let Err(e) = self.persist().await {
            error!(job = %self.snapshot.id, error = %e, "could not save snapshot after cleanup");
        }
        report
    }

    async fn cleanup_delete(&mut self, resource: Resource, id: String, owner: &str) -> Result<(), PoolError> {
        let actor = self.pool.route(Some(owner), self.scheduler.rng())?;
        tokio::time::sleep(self.pool.spacing_delay(Instant::now())).await;
        let label = format!("delete {id}");
        match self.call(&actor, PlatformOp::Delete { resource, id }).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let kind = match e {
                    PoolError::Throttled { .. } => ErrorKind::Throttle,
                    PoolError::CredentialRevoked { .. } | PoolError::Exhausted => {
                        self.snapshot.revoke_actor(&actor);
                        ErrorKind::CredentialInvalid
                    }
                    _ => ErrorKind::Platform,
                };
                self.note_error(kind, format!("{label}: {e}"), Some(actor));
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Status and persistence
    // -----------------------------------------------------------------------

    fn note_error(&mut self, kind: ErrorKind, message: String, actor: Option<String>) {
        match kind {
            ErrorKind::Persistence | ErrorKind::Unexpected => {
                error!(job = %self.snapshot.id, kind = %kind, actor = actor.as_deref().unwrap_or("-"), "{message}")
            }
            _ => warn!(job = %self.snapshot.id, kind = %kind, actor = actor.as_deref().unwrap_or("-"), "{message}"),
        }
        let now = self.now();
        self.snapshot.record_error(kind, message, actor, now);
    }

    async fn escalate_exhausted(&mut self, now: DateTime<Utc>) -> JobStatus {
        error!(job = %self.snapshot.id, "no valid credentials remain; job errored");
        self.snapshot.record_error(
            ErrorKind::CredentialInvalid,
            "no valid credentials remain",
            None,
            now,
        );
        self.finish(JobStatus::Errored).await
    }

    async fn set_status(&mut self, status: JobStatus) {
        let now = self.now();
        if let Err(e) = self.snapshot.set_status(status, now) {
            warn!(job = %self.snapshot.id, error = %e, "status change rejected");
            return;
        }
        self.persist_or_escalate().await;
    }

    /// Move to a terminal status and save. Returns the status actually reached.
    async fn finish(&mut self, status: JobStatus) -> JobStatus {
        let now = self.now();
        if let Err(e) = self.snapshot.set_status(status, now) {
            debug!(job = %self.snapshot.id, error = %e, "already terminal");
            return self.snapshot.status;
        }
        if let Err(e) = self.persist().await {
            error!(job = %self.snapshot.id, status = %status, error = %e, "could not save final status");
        }
        self.snapshot.status
    }

    async fn persisted(&mut self, outcome: TickOutcome) -> TickOutcome {
        match self.persist_or_escalate().await {
            Some(status) => TickOutcome::Finished(status),
            None => outcome,
        }
    }

    /// Save with bounded retries; on exhaustion the job goes to `errored`
    /// rather than continuing with unsaved state. The store has just failed
    /// every attempt, so the errored status is not saved again here.
    async fn persist_or_escalate(&mut self) -> Option<JobStatus> {
        match self.persist().await {
            Ok(()) => None,
            Err(e) => {
                self.note_error(
                    ErrorKind::Persistence,
                    format!("giving up after {} save attempts: {e}", self.deps.service.save_attempts.max(1)),
                    None,
                );
                let now = self.now();
                if let Err(e) = self.snapshot.set_status(JobStatus::Errored, now) {
                    debug!(job = %self.snapshot.id, error = %e, "already terminal");
                }
                Some(self.snapshot.status)
            }
        }
    }

    async fn persist(&mut self) -> cadence_core::Result<()> {
        let attempts = self.deps.service.save_attempts.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            let store = Arc::clone(&self.deps.store);
            let snapshot = self.snapshot.clone();
            let result = tokio::task::spawn_blocking(move || store.save(&snapshot))
                .await
                .unwrap_or_else(|e| {
                    Err(cadence_core::CadenceError::Io(std::io::Error::other(e.to_string())))
                });
            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(job = %self.snapshot.id, attempt, error = %e, "snapshot save failed");
                    last_err = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.deps.service.save_retry_delay()).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            cadence_core::CadenceError::Io(std::io::Error::other("save never attempted"))
        }))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn content_kind(activity: ActivityType) -> ContentKind {
    match activity {
        ActivityType::CreateContainer => ContentKind::ContainerName,
        ActivityType::CreateEntity => ContentKind::EntityName,
        ActivityType::StartWork => ContentKind::StartNote,
        ActivityType::CommentProgress => ContentKind::ProgressComment,
        ActivityType::Block => ContentKind::BlockerReason,
        ActivityType::Unblock => ContentKind::UnblockNote,
        ActivityType::Complete => ContentKind::CompletionNote,
        ActivityType::Conversation => ContentKind::ConversationReply,
        ActivityType::Reassign => ContentKind::ReassignNote,
        ActivityType::OutOfOffice => ContentKind::OutOfOffice,
    }
}

fn entity_op(activity: ActivityType, id: String, actor: &str, text: &str) -> Option<PlatformOp> {
    let stage = |stage: LifecycleStage| Update::Stage {
        stage,
        note: Some(text.to_string()),
    };
    let update = match activity {
        ActivityType::StartWork | ActivityType::Unblock => stage(LifecycleStage::InProgress),
        ActivityType::Block => stage(LifecycleStage::Blocked),
        ActivityType::Complete => stage(LifecycleStage::Completed),
        ActivityType::CommentProgress | ActivityType::Conversation | ActivityType::OutOfOffice => {
            Update::Comment {
                text: text.to_string(),
            }
        }
        ActivityType::Reassign => Update::Assign {
            assignee: actor.to_string(),
        },
        ActivityType::CreateContainer | ActivityType::CreateEntity => return None,
    };
    Some(PlatformOp::Update { id, update })
}

fn random_between<R: Rng + ?Sized>(rng: &mut R, lo: Duration, hi: Duration) -> Duration {
    if hi <= lo {
        return lo;
    }
    rng.gen_range(lo..=hi)
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}
