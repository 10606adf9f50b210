//! In-memory stand-in for a collaboration platform.
//!
//! Assigns ids, remembers what exists, and replays scripted faults. Backs the
//! `cadence serve` binary until a real platform client is plugged in.

use cadence_core::client_pool::{
    PlatformCapability, PlatformConnector, PlatformError, PlatformOp, PlatformResponse, Resource,
};
use cadence_core::config::{CredentialSpec, PlatformSettings};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct SandboxCall {
    pub actor: String,
    pub op: PlatformOp,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    objects: HashMap<String, Resource>,
    revoked_secrets: HashSet<String>,
    /// `(actor filter, fault)`; `None` matches any actor.
    faults: VecDeque<(Option<String>, PlatformError)>,
    calls: Vec<SandboxCall>,
}

#[derive(Debug, Default)]
pub struct SandboxPlatform {
    state: Mutex<State>,
}

impl SandboxPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next call from anyone with `err`.
    pub fn fail_next(&self, err: PlatformError) {
        self.lock().faults.push_back((None, err));
    }

    /// Fail the next call made by `actor` with `err`.
    pub fn fail_next_for(&self, actor: &str, err: PlatformError) {
        self.lock().faults.push_back((Some(actor.to_string()), err));
    }

    /// Every later call made with `secret` is unauthorized.
    pub fn revoke_secret(&self, secret: &str) {
        self.lock().revoked_secrets.insert(secret.to_string());
    }

    pub fn calls(&self) -> Vec<SandboxCall> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn object_count(&self, resource: Resource) -> usize {
        self.lock()
            .objects
            .values()
            .filter(|r| **r == resource)
            .count()
    }

    /// Register an object created by an earlier process so restored jobs can
    /// keep updating it. Later ids are allocated past any adopted `x-N` id.
    pub fn adopt(&self, id: &str, resource: Resource) {
        let mut state = self.lock();
        if let Some(n) = id
            .rsplit_once('-')
            .and_then(|(_, n)| n.parse::<u64>().ok())
        {
            state.next_id = state.next_id.max(n);
        }
        state.objects.insert(id.to_string(), resource);
    }

    pub fn exists(&self, id: &str) -> bool {
        self.lock().objects.contains_key(id)
    }

    fn handle(&self, actor: &str, secret: &str, op: &PlatformOp) -> Result<PlatformResponse, PlatformError> {
        let mut state = self.lock();
        state.calls.push(SandboxCall {
            actor: actor.to_string(),
            op: op.clone(),
        });
        if state.revoked_secrets.contains(secret) {
            return Err(PlatformError::Unauthorized(format!("token for {actor} revoked")));
        }
        let fault = state
            .faults
            .iter()
            .position(|(who, _)| who.as_deref().map_or(true, |w| w == actor));
        if let Some(pos) = fault {
            if let Some((_, err)) = state.faults.remove(pos) {
                debug!(actor = %actor, error = %err, "sandbox injecting fault");
                return Err(err);
            }
        }

        match op {
            PlatformOp::Create { resource, .. } => {
                state.next_id += 1;
                let prefix = match resource {
                    Resource::Container => "c",
                    Resource::Entity => "e",
                };
                let id = format!("{prefix}-{}", state.next_id);
                state.objects.insert(id.clone(), *resource);
                Ok(PlatformResponse { id: Some(id) })
            }
            PlatformOp::Update { id, .. } => {
                if state.objects.contains_key(id) {
                    Ok(PlatformResponse::default())
                } else {
                    Err(PlatformError::Other(format!("404: no object {id}")))
                }
            }
            PlatformOp::Delete { id, .. } => match state.objects.remove(id) {
                Some(_) => Ok(PlatformResponse::default()),
                None => Err(PlatformError::Other(format!("404: no object {id}"))),
            },
            PlatformOp::List => Ok(PlatformResponse::default()),
        }
    }
}

struct SandboxClient {
    platform: Arc<SandboxPlatform>,
    actor: String,
    secret: String,
}

impl PlatformCapability for SandboxClient {
    fn invoke(&self, op: &PlatformOp) -> Result<PlatformResponse, PlatformError> {
        self.platform.handle(&self.actor, &self.secret, op)
    }
}

/// Hands out sandbox clients that all talk to one shared platform.
#[derive(Debug, Clone)]
pub struct SandboxConnector {
    platform: Arc<SandboxPlatform>,
}

impl SandboxConnector {
    pub fn new(platform: Arc<SandboxPlatform>) -> Self {
        Self { platform }
    }

    pub fn platform(&self) -> &Arc<SandboxPlatform> {
        &self.platform
    }
}

impl PlatformConnector for SandboxConnector {
    fn connect(
        &self,
        _settings: &PlatformSettings,
        credential: &CredentialSpec,
    ) -> Result<Arc<dyn PlatformCapability>, PlatformError> {
        Ok(Arc::new(SandboxClient {
            platform: Arc::clone(&self.platform),
            actor: credential.actor.clone(),
            secret: credential.secret.clone(),
        }))
    }
}
