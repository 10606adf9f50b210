//! Per-actor platform credentials with routing and invalidation.
//!
//! Platform clients themselves are external; the pool only sees them through
//! [`PlatformCapability`]. Calls go through a checkout/settle pair so the
//! actual request can run on another thread while the pool stays owned by
//! its job.

use crate::config::{CredentialSpec, PlatformSettings};
use crate::types::{LifecycleStage, PlatformKind};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Capability interface
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Container,
    Entity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Update {
    Comment { text: String },
    Stage {
        stage: LifecycleStage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    Assign { assignee: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PlatformOp {
    Create {
        resource: Resource,
        name: String,
        /// Platform id of the owning container, for entities.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<String>,
        owner: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Update { id: String, update: Update },
    Delete { resource: Resource, id: String },
    /// Cheap read used to check that a credential still works.
    List,
}

impl PlatformOp {
    pub fn name(&self) -> &'static str {
        match self {
            PlatformOp::Create { .. } => "create",
            PlatformOp::Update { .. } => "update",
            PlatformOp::Delete { .. } => "delete",
            PlatformOp::List => "list",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformResponse {
    /// Id assigned by the platform on create.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlatformError {
    #[error("rate limited by platform")]
    RateLimited { retry_after: Option<Duration> },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("{0}")]
    Other(String),
}

/// One authenticated platform client, bound to a single credential.
pub trait PlatformCapability: Send + Sync {
    fn invoke(&self, op: &PlatformOp) -> Result<PlatformResponse, PlatformError>;
}

/// Builds a client for one credential.
pub trait PlatformConnector: Send + Sync {
    fn connect(
        &self,
        settings: &PlatformSettings,
        credential: &CredentialSpec,
    ) -> Result<Arc<dyn PlatformCapability>, PlatformError>;
}

// ---------------------------------------------------------------------------
// PoolError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PoolError {
    /// Job-wide: the platform limits the workspace, not the actor.
    #[error("platform rate limit reached")]
    Throttled { retry_after: Option<Duration> },

    #[error("credential for {actor} is revoked: {reason}")]
    CredentialRevoked { actor: String, reason: String },

    #[error("no valid credentials remain")]
    Exhausted,

    #[error("unknown actor '{0}'")]
    UnknownActor(String),

    #[error("platform error: {0}")]
    Platform(String),
}

// ---------------------------------------------------------------------------
// ClientPool
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialStatus {
    pub actor: String,
    pub valid: bool,
    pub calls: u64,
}

struct Credential {
    actor: String,
    client: Arc<dyn PlatformCapability>,
    valid: bool,
    calls: u64,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("actor", &self.actor)
            .field("valid", &self.valid)
            .field("calls", &self.calls)
            .finish()
    }
}

/// A checked-out credential. Hand it back with [`ClientPool::settle`].
#[derive(Clone)]
pub struct Lease {
    pub actor: String,
    pub client: Arc<dyn PlatformCapability>,
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease").field("actor", &self.actor).finish()
    }
}

#[derive(Debug)]
pub struct ClientPool {
    credentials: Vec<Credential>,
    min_interval: Duration,
    last_call: Option<Instant>,
}

impl ClientPool {
    /// `budget_fraction` is the share of the platform's published per-minute
    /// limit this job may spend; calls are spaced to stay under it.
    pub fn new(platform: PlatformKind, budget_fraction: f64) -> Self {
        let per_minute = f64::from(platform.published_rate_limit_per_minute()) * budget_fraction;
        // A vanishing budget gives an unrepresentable interval; treat it as none.
        let min_interval = if per_minute > 0.0 {
            Duration::try_from_secs_f64(60.0 / per_minute).unwrap_or(Duration::from_secs(60))
        } else {
            Duration::from_secs(60)
        };
        Self {
            credentials: Vec::new(),
            min_interval,
            last_call: None,
        }
    }

    /// Connect every credential in `credentials`. Actors listed in `revoked`
    /// stay dead; connection failures are logged and the actor marked invalid.
    pub fn connect(
        settings: &PlatformSettings,
        credentials: &[CredentialSpec],
        revoked: &[String],
        connector: &dyn PlatformConnector,
        budget_fraction: f64,
    ) -> Self {
        let mut pool = Self::new(settings.kind(), budget_fraction);
        for cred in credentials {
            let client = match connector.connect(settings, cred) {
                Ok(client) => client,
                Err(e) => {
                    warn!(actor = %cred.actor, error = %e, "could not build platform client");
                    Arc::new(Disconnected(e.to_string()))
                }
            };
            let was_revoked = revoked.iter().any(|a| a == &cred.actor);
            pool.add(cred.actor.clone(), client);
            if was_revoked {
                pool.revoke(&cred.actor);
            }
        }
        pool
    }

    pub fn add(&mut self, actor: impl Into<String>, client: Arc<dyn PlatformCapability>) {
        self.credentials.push(Credential {
            actor: actor.into(),
            client,
            valid: true,
            calls: 0,
        });
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn set_min_interval(&mut self, interval: Duration) {
        self.min_interval = interval;
    }

    pub fn valid_actors(&self) -> Vec<&str> {
        self.credentials
            .iter()
            .filter(|c| c.valid)
            .map(|c| c.actor.as_str())
            .collect()
    }

    pub fn all_actors(&self) -> Vec<&str> {
        self.credentials.iter().map(|c| c.actor.as_str()).collect()
    }

    pub fn is_valid(&self, actor: &str) -> bool {
        self.credentials.iter().any(|c| c.actor == actor && c.valid)
    }

    pub fn is_exhausted(&self) -> bool {
        !self.credentials.iter().any(|c| c.valid)
    }

    pub fn calls(&self, actor: &str) -> u64 {
        self.credentials
            .iter()
            .find(|c| c.actor == actor)
            .map_or(0, |c| c.calls)
    }

    pub fn status(&self) -> Vec<CredentialStatus> {
        self.credentials
            .iter()
            .map(|c| CredentialStatus {
                actor: c.actor.clone(),
                valid: c.valid,
                calls: c.calls,
            })
            .collect()
    }

    /// Mark `actor` permanently invalid. Returns false if it already was.
    pub fn revoke(&mut self, actor: &str) -> bool {
        match self.credentials.iter_mut().find(|c| c.actor == actor) {
            Some(c) if c.valid => {
                c.valid = false;
                true
            }
            _ => false,
        }
    }

    /// Choose who performs the next activity: `preferred` when it is still
    /// valid, otherwise a random live actor.
    pub fn route<R: Rng + ?Sized>(
        &self,
        preferred: Option<&str>,
        rng: &mut R,
    ) -> Result<String, PoolError> {
        if let Some(actor) = preferred.filter(|a| self.is_valid(a)) {
            return Ok(actor.to_string());
        }
        self.valid_actors()
            .choose(rng)
            .map(|a| a.to_string())
            .ok_or(PoolError::Exhausted)
    }

    /// A live actor other than `actor`, if any.
    pub fn other_actor<R: Rng + ?Sized>(&self, actor: &str, rng: &mut R) -> Option<String> {
        let others: Vec<_> = self
            .valid_actors()
            .into_iter()
            .filter(|a| *a != actor)
            .collect();
        others.choose(rng).map(|a| a.to_string())
    }

    /// How long to wait before the next call stays inside the call budget.
    pub fn spacing_delay(&self, now: Instant) -> Duration {
        match self.last_call {
            Some(last) => (last + self.min_interval).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    pub fn checkout(&mut self, actor: &str, now: Instant) -> Result<Lease, PoolError> {
        let cred = self
            .credentials
            .iter_mut()
            .find(|c| c.actor == actor)
            .ok_or_else(|| PoolError::UnknownActor(actor.to_string()))?;
        if !cred.valid {
            return Err(PoolError::CredentialRevoked {
                actor: actor.to_string(),
                reason: "previously revoked".to_string(),
            });
        }
        cred.calls += 1;
        self.last_call = Some(now);
        Ok(Lease {
            actor: cred.actor.clone(),
            client: Arc::clone(&cred.client),
        })
    }

    /// Classify the result of a leased call, revoking the credential on an
    /// authorization failure.
    pub fn settle(
        &mut self,
        lease: &Lease,
        result: Result<PlatformResponse, PlatformError>,
    ) -> Result<PlatformResponse, PoolError> {
        match result {
            Ok(resp) => Ok(resp),
            Err(PlatformError::RateLimited { retry_after }) => {
                debug!(actor = %lease.actor, "platform signalled rate limit");
                Err(PoolError::Throttled { retry_after })
            }
            Err(PlatformError::Unauthorized(reason)) => {
                self.revoke(&lease.actor);
                warn!(actor = %lease.actor, reason = %reason, "credential revoked");
                if self.is_exhausted() {
                    Err(PoolError::Exhausted)
                } else {
                    Err(PoolError::CredentialRevoked {
                        actor: lease.actor.clone(),
                        reason,
                    })
                }
            }
            Err(PlatformError::Other(msg)) => Err(PoolError::Platform(msg)),
        }
    }

    /// Checkout, call and settle on the current thread.
    pub fn invoke(
        &mut self,
        actor: &str,
        op: &PlatformOp,
        now: Instant,
    ) -> Result<PlatformResponse, PoolError> {
        let lease = self.checkout(actor, now)?;
        let result = lease.client.invoke(op);
        self.settle(&lease, result)
    }

    /// Issue a `list` per live credential and revoke the ones the platform
    /// rejects. Returns the actors revoked by this pass.
    pub fn validate_all(&mut self, now: Instant) -> Vec<String> {
        let actors: Vec<String> = self.valid_actors().iter().map(|a| a.to_string()).collect();
        let mut revoked = Vec::new();
        for actor in actors {
            match self.invoke(&actor, &PlatformOp::List, now) {
                Ok(_) => {}
                Err(PoolError::CredentialRevoked { .. }) | Err(PoolError::Exhausted) => {
                    revoked.push(actor)
                }
                Err(e) => debug!(actor = %actor, error = %e, "validation call failed"),
            }
        }
        revoked
    }
}

/// Stand-in for a credential whose client could not be built.
struct Disconnected(String);

impl PlatformCapability for Disconnected {
    fn invoke(&self, _op: &PlatformOp) -> Result<PlatformResponse, PlatformError> {
        Err(PlatformError::Unauthorized(self.0.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[derive(Default)]
    struct Fake {
        unauthorized: AtomicBool,
        rate_limited: AtomicBool,
        calls: AtomicU32,
    }

    impl PlatformCapability for Fake {
        fn invoke(&self, _op: &PlatformOp) -> Result<PlatformResponse, PlatformError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.unauthorized.load(Ordering::SeqCst) {
                return Err(PlatformError::Unauthorized("401".into()));
            }
            if self.rate_limited.load(Ordering::SeqCst) {
                return Err(PlatformError::RateLimited { retry_after: None });
            }
            Ok(PlatformResponse {
                id: Some("x".into()),
            })
        }
    }

    fn comment() -> PlatformOp {
        PlatformOp::Update {
            id: "t1".into(),
            update: Update::Comment {
                text: "hi".into(),
            },
        }
    }

    fn two_actor_pool() -> (ClientPool, Arc<Fake>, Arc<Fake>) {
        let a = Arc::new(Fake::default());
        let b = Arc::new(Fake::default());
        let mut pool = ClientPool::new(PlatformKind::Asana, 0.5);
        pool.add("Alice", a.clone());
        pool.add("Bob", b.clone());
        (pool, a, b)
    }

    #[test]
    fn unauthorized_revokes_one_and_routes_to_the_other() {
        let (mut pool, a, b) = two_actor_pool();
        let mut rng = StdRng::seed_from_u64(1);
        a.unauthorized.store(true, Ordering::SeqCst);

        let err = pool.invoke("Alice", &comment(), Instant::now()).unwrap_err();
        assert!(matches!(err, PoolError::CredentialRevoked { .. }));
        assert!(!pool.is_exhausted());

        for _ in 0..20 {
            let actor = pool.route(Some("Alice"), &mut rng).unwrap();
            assert_eq!(actor, "Bob");
            pool.invoke(&actor, &comment(), Instant::now()).unwrap();
        }
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.calls.load(Ordering::SeqCst), 20);

        b.unauthorized.store(true, Ordering::SeqCst);
        let err = pool.invoke("Bob", &comment(), Instant::now()).unwrap_err();
        assert_eq!(err, PoolError::Exhausted);
        assert!(matches!(
            pool.route(None, &mut rng),
            Err(PoolError::Exhausted)
        ));
    }

    #[test]
    fn revoked_credential_is_never_called_again() {
        let (mut pool, a, _) = two_actor_pool();
        pool.revoke("Alice");
        a.unauthorized.store(false, Ordering::SeqCst);
        assert!(matches!(
            pool.invoke("Alice", &comment(), Instant::now()),
            Err(PoolError::CredentialRevoked { .. })
        ));
        assert_eq!(a.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn rate_limit_is_job_level_and_keeps_credential() {
        let (mut pool, a, _) = two_actor_pool();
        a.rate_limited.store(true, Ordering::SeqCst);
        assert!(matches!(
            pool.invoke("Alice", &comment(), Instant::now()),
            Err(PoolError::Throttled { .. })
        ));
        assert!(pool.is_valid("Alice"));
    }

    #[test]
    fn unknown_actor() {
        let (mut pool, _, _) = two_actor_pool();
        assert_eq!(
            pool.invoke("Mallory", &PlatformOp::List, Instant::now()),
            Err(PoolError::UnknownActor("Mallory".into()))
        );
    }

    #[test]
    fn spacing_follows_budget() {
        let (mut pool, _, _) = two_actor_pool();
        // 150/min at half budget is 75/min.
        assert_eq!(pool.min_interval(), Duration::from_millis(800));
        let now = Instant::now();
        assert_eq!(pool.spacing_delay(now), Duration::ZERO);
        pool.invoke("Alice", &PlatformOp::List, now).unwrap();
        assert_eq!(pool.spacing_delay(now), Duration::from_millis(800));
        assert_eq!(
            pool.spacing_delay(now + Duration::from_secs(1)),
            Duration::ZERO
        );
    }

    #[test]
    fn vanishing_budget_falls_back_to_a_minute() {
        let pool = ClientPool::new(PlatformKind::Asana, 1e-20);
        assert_eq!(pool.min_interval(), Duration::from_secs(60));
        let pool = ClientPool::new(PlatformKind::Okta, 0.0);
        assert_eq!(pool.min_interval(), Duration::from_secs(60));
    }

    #[test]
    fn validate_all_revokes_rejected_credentials() {
        let (mut pool, a, _) = two_actor_pool();
        a.unauthorized.store(true, Ordering::SeqCst);
        let revoked = pool.validate_all(Instant::now());
        assert_eq!(revoked, vec!["Alice".to_string()]);
        assert_eq!(pool.valid_actors(), vec!["Bob"]);
        assert_eq!(pool.calls("Bob"), 1);
    }

    #[test]
    fn other_actor_excludes_self() {
        let (pool, _, _) = two_actor_pool();
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(pool.other_actor("Alice", &mut rng).as_deref(), Some("Bob"));
    }
}
