//! Text for names, comments and notes.
//!
//! Real generators (LLM-backed or otherwise) live outside this crate and plug
//! in through [`ContentGenerator`]. [`TemplateContent`] is the deterministic
//! fallback used whenever a generator fails or times out.

use crate::types::PlatformKind;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    ContainerName,
    EntityName,
    StartNote,
    ProgressComment,
    BlockerReason,
    UnblockNote,
    CompletionNote,
    ConversationReply,
    ReassignNote,
    OutOfOffice,
}

impl ContentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentKind::ContainerName => "container_name",
            ContentKind::EntityName => "entity_name",
            ContentKind::StartNote => "start_note",
            ContentKind::ProgressComment => "progress_comment",
            ContentKind::BlockerReason => "blocker_reason",
            ContentKind::UnblockNote => "unblock_note",
            ContentKind::CompletionNote => "completion_note",
            ContentKind::ConversationReply => "conversation_reply",
            ContentKind::ReassignNote => "reassign_note",
            ContentKind::OutOfOffice => "out_of_office",
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the generator knows about the moment it is writing for.
#[derive(Debug, Clone, Default, PartialEq, Hash, Serialize, Deserialize)]
pub struct ContentContext {
    pub platform: PlatformKind,
    pub industry: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_name: Option<String>,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub other_actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_name: Option<String>,
    /// Varies otherwise-identical requests, e.g. the activity sequence number.
    #[serde(default)]
    pub salt: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generated {
    pub text: String,
    /// Tokens billed for the call; 0 for local templates.
    #[serde(default)]
    pub tokens: u64,
}

#[derive(Debug, Error)]
#[error("content generation failed: {0}")]
pub struct ContentError(pub String);

/// External text source. Calls may be slow; callers bound them with a timeout.
pub trait ContentGenerator: Send + Sync {
    fn generate(
        &self,
        kind: ContentKind,
        ctx: &ContentContext,
    ) -> std::result::Result<Generated, ContentError>;
}

// ---------------------------------------------------------------------------
// TemplateContent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateContent;

const CONTAINER_THEMES: &[&str] = &[
    "Q{q} Roadmap",
    "Customer Onboarding Revamp",
    "Platform Migration",
    "Security Review",
    "Launch Readiness",
    "Partner Integrations",
    "Cost Optimization",
    "Support Backlog Cleanup",
];

const ENTITY_THEMES: &[&str] = &[
    "Draft requirements",
    "Review vendor contract",
    "Update onboarding checklist",
    "Prepare stakeholder demo",
    "Audit access permissions",
    "Collect customer feedback",
    "Write rollout plan",
    "Fix reporting dashboard",
    "Schedule kickoff meeting",
    "Refresh pricing sheet",
];

const PROGRESS: &[&str] = &[
    "Made good progress on {entity} today, about halfway there.",
    "Pushed an update to {entity}; will pick up the remaining items tomorrow.",
    "Quick status on {entity}: first pass done, reviewing edge cases now.",
    "Synced with the team about {entity}. On track.",
];

const BLOCKERS: &[&str] = &[
    "Waiting on sign-off from legal before continuing {entity}.",
    "Blocked on access to the staging environment for {entity}.",
    "Need input from finance on {entity} before moving forward.",
];

const CONVERSATION: &[&str] = &[
    "@{other} could you take a look at {entity} when you get a chance?",
    "Thanks @{other}, that clears it up for {entity}.",
    "@{other} do we still need the extra review step on {entity}?",
];

impl TemplateContent {
    pub fn render(kind: ContentKind, ctx: &ContentContext) -> String {
        let pick = |options: &[&'static str]| -> &'static str {
            let mut h = DefaultHasher::new();
            kind.hash(&mut h);
            ctx.hash(&mut h);
            options[(h.finish() % options.len() as u64) as usize]
        };
        let entity = ctx.entity_name.as_deref().unwrap_or("this");
        let other = ctx.other_actor.as_deref().unwrap_or("team");
        let noun = ctx.platform.entity_noun();

        let text = match kind {
            ContentKind::ContainerName => {
                let theme = pick(CONTAINER_THEMES).replace("{q}", &(ctx.salt % 4 + 1).to_string());
                match &ctx.workspace_name {
                    Some(ws) => format!("{ws} {theme}"),
                    None => theme,
                }
            }
            ContentKind::EntityName => pick(ENTITY_THEMES).to_string(),
            ContentKind::StartNote => format!("Starting on this {noun} now."),
            ContentKind::ProgressComment => pick(PROGRESS).to_string(),
            ContentKind::BlockerReason => pick(BLOCKERS).to_string(),
            ContentKind::UnblockNote => format!("Unblocked, resuming work on {entity}."),
            ContentKind::CompletionNote => format!("{entity} is done. Closing this out."),
            ContentKind::ConversationReply => pick(CONVERSATION).to_string(),
            ContentKind::ReassignNote => format!("Handing {entity} over to {}.", ctx.actor),
            ContentKind::OutOfOffice => {
                "Out of office for a bit, responses will be delayed.".to_string()
            }
        };
        text.replace("{entity}", entity).replace("{other}", other)
    }
}

impl ContentGenerator for TemplateContent {
    fn generate(
        &self,
        kind: ContentKind,
        ctx: &ContentContext,
    ) -> std::result::Result<Generated, ContentError> {
        Ok(Generated {
            text: Self::render(kind, ctx),
            tokens: 0,
        })
    }
}
