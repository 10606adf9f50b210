use crate::error::{CadenceError, Result};
use crate::paths;
use crate::types::{ActivityLevel, PlatformKind, WorkPatternKind};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

impl ConfigWarning {
    fn error(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Error,
            message: message.into(),
        }
    }

    fn warning(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Warning,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// PlatformSettings
// ---------------------------------------------------------------------------

/// Platform tag plus the addressing details that platform needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlatformSettings {
    Asana(AsanaSettings),
    Okta(OktaSettings),
    Salesforce(SalesforceSettings),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AsanaSettings {
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default = "default_privacy")]
    pub privacy: String,
}

fn default_privacy() -> String {
    "private".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OktaSettings {
    #[serde(default)]
    pub org_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SalesforceSettings {
    #[serde(default)]
    pub instance_url: String,
    #[serde(default = "default_sf_api_version")]
    pub api_version: String,
}

fn default_sf_api_version() -> String {
    "v59.0".to_string()
}

impl Default for PlatformSettings {
    fn default() -> Self {
        PlatformSettings::Asana(AsanaSettings {
            workspace_id: None,
            privacy: default_privacy(),
        })
    }
}

impl PlatformSettings {
    pub fn kind(&self) -> PlatformKind {
        match self {
            PlatformSettings::Asana(_) => PlatformKind::Asana,
            PlatformSettings::Okta(_) => PlatformKind::Okta,
            PlatformSettings::Salesforce(_) => PlatformKind::Salesforce,
        }
    }

    /// Settings with empty addressing for `kind`; used when migrating records
    /// that only carried a platform tag.
    pub fn bare(kind: PlatformKind) -> Self {
        match kind {
            PlatformKind::Asana => PlatformSettings::default(),
            PlatformKind::Okta => PlatformSettings::Okta(OktaSettings::default()),
            PlatformKind::Salesforce => PlatformSettings::Salesforce(SalesforceSettings {
                instance_url: String::new(),
                api_version: default_sf_api_version(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// JobDuration
// ---------------------------------------------------------------------------

/// How long a job runs: a fixed number of days, or until stopped.
///
/// Serialized as a bare integer (`duration: 7`) or the word `indefinite`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobDuration {
    Days(u32),
    Indefinite,
}

impl Default for JobDuration {
    fn default() -> Self {
        JobDuration::Days(30)
    }
}

impl JobDuration {
    pub fn as_chrono(self) -> Option<chrono::Duration> {
        match self {
            JobDuration::Days(d) => Some(chrono::Duration::days(i64::from(d))),
            JobDuration::Indefinite => None,
        }
    }
}

impl fmt::Display for JobDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobDuration::Days(d) => write!(f, "{d} day(s)"),
            JobDuration::Indefinite => f.write_str("indefinite"),
        }
    }
}

impl Serialize for JobDuration {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            JobDuration::Days(d) => s.serialize_u32(*d),
            JobDuration::Indefinite => s.serialize_str("indefinite"),
        }
    }
}

impl<'de> Deserialize<'de> for JobDuration {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Days(u32),
            Word(String),
        }
        match Repr::deserialize(d)? {
            Repr::Days(0) => Err(serde::de::Error::custom(
                "duration must be a positive day count",
            )),
            Repr::Days(n) => Ok(JobDuration::Days(n)),
            Repr::Word(w) if w == "indefinite" => Ok(JobDuration::Indefinite),
            Repr::Word(w) => w.parse::<u32>().ok().filter(|n| *n > 0).map_or_else(
                || {
                    Err(serde::de::Error::custom(format!(
                        "invalid duration '{w}': expected a positive day count or 'indefinite'"
                    )))
                },
                |n| Ok(JobDuration::Days(n)),
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// LifecycleRates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleRates {
    /// Percentage of open entities completed per week.
    #[serde(default = "default_completion_rate")]
    pub completion_rate_per_week: f64,
    /// Percentage of entities that get blocked at some point.
    #[serde(default = "default_block_frequency")]
    pub block_frequency_pct: f64,
    /// Mean time an entity stays blocked, in days.
    #[serde(default = "default_avg_block_days")]
    pub avg_block_days: f64,
}

fn default_completion_rate() -> f64 {
    20.0
}

fn default_block_frequency() -> f64 {
    15.0
}

fn default_avg_block_days() -> f64 {
    2.0
}

impl Default for LifecycleRates {
    fn default() -> Self {
        Self {
            completion_rate_per_week: default_completion_rate(),
            block_frequency_pct: default_block_frequency(),
            avg_block_days: default_avg_block_days(),
        }
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// One simulated human: display name, platform secret, optional addressing.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialSpec {
    pub actor: String,
    pub secret: String,
    /// Platform-specific addressing such as an org URL or user id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl fmt::Debug for CredentialSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSpec")
            .field("actor", &self.actor)
            .field("secret", &"<redacted>")
            .field("address", &self.address)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Retention
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_activity_cap")]
    pub activity_log_cap: usize,
    #[serde(default = "default_error_cap")]
    pub error_log_cap: usize,
}

fn default_activity_cap() -> usize {
    1000
}

fn default_error_cap() -> usize {
    100
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            activity_log_cap: default_activity_cap(),
            error_log_cap: default_error_cap(),
        }
    }
}

// ---------------------------------------------------------------------------
// SchedulerTuning
// ---------------------------------------------------------------------------

/// Base selection weight per activity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityWeights {
    pub start_work: f64,
    pub comment_progress: f64,
    pub block: f64,
    pub unblock: f64,
    pub complete: f64,
    pub conversation: f64,
    pub create_entity: f64,
    pub create_container: f64,
    pub reassign: f64,
}

impl Default for ActivityWeights {
    fn default() -> Self {
        Self {
            start_work: 30.0,
            comment_progress: 20.0,
            block: 15.0,
            unblock: 25.0,
            complete: 15.0,
            conversation: 25.0,
            create_entity: 10.0,
            create_container: 10.0,
            reassign: 3.0,
        }
    }
}

/// Heuristic constants behind the scheduler's probability curves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerTuning {
    pub base_tick_rate: f64,
    pub burst_boost: f64,
    pub steady_floor: f64,
    pub off_hours_chance: f64,
    pub new_age_growth_per_day: f64,
    pub min_block_hours: f64,
    pub unblock_before_mean: f64,
    pub unblock_at_mean: f64,
    pub unblock_overdue_growth: f64,
    pub unblock_cap: f64,
    pub max_blocks_per_entity: u32,
    pub entity_creation_interval_minutes: u32,
    pub entity_creation_chance: f64,
    pub container_rollover_threshold: f64,
    pub container_rollover_chance: f64,
    pub container_cadence_chance: f64,
    pub max_open_entities: usize,
    pub weights: ActivityWeights,
}

impl Default for SchedulerTuning {
    fn default() -> Self {
        Self {
            base_tick_rate: 0.1,
            burst_boost: 3.0,
            steady_floor: 0.4,
            off_hours_chance: 0.05,
            new_age_growth_per_day: 0.5,
            min_block_hours: 2.0,
            unblock_before_mean: 0.3,
            unblock_at_mean: 0.7,
            unblock_overdue_growth: 0.15,
            unblock_cap: 0.95,
            max_blocks_per_entity: 1,
            entity_creation_interval_minutes: 60,
            entity_creation_chance: 0.35,
            container_rollover_threshold: 0.8,
            container_rollover_chance: 0.3,
            container_cadence_chance: 0.5,
            max_open_entities: 40,
            weights: ActivityWeights::default(),
        }
    }
}

impl SchedulerTuning {
    fn probabilities(&self) -> [(&'static str, f64); 10] {
        [
            ("base_tick_rate", self.base_tick_rate),
            ("steady_floor", self.steady_floor),
            ("off_hours_chance", self.off_hours_chance),
            ("unblock_before_mean", self.unblock_before_mean),
            ("unblock_at_mean", self.unblock_at_mean),
            ("unblock_cap", self.unblock_cap),
            ("entity_creation_chance", self.entity_creation_chance),
            ("container_rollover_threshold", self.container_rollover_threshold),
            ("container_rollover_chance", self.container_rollover_chance),
            ("container_cadence_chance", self.container_cadence_chance),
        ]
    }
}

// ---------------------------------------------------------------------------
// JobConfig
// ---------------------------------------------------------------------------

/// Everything the control surface supplies when starting a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub platform: PlatformSettings,
    #[serde(default)]
    pub duration: JobDuration,
    #[serde(default)]
    pub activity_level: ActivityLevel,
    #[serde(default)]
    pub work_pattern: WorkPatternKind,
    /// Local offset of the regional work pattern, in minutes east of UTC.
    #[serde(default = "default_utc_offset")]
    pub utc_offset_minutes: i32,
    /// 0 concentrates activity in burst windows, 1 spreads it evenly.
    #[serde(default = "default_burst_factor")]
    pub burst_factor: f64,
    #[serde(default)]
    pub rates: LifecycleRates,
    /// Days between new top-level containers.
    #[serde(default = "default_creation_cadence")]
    pub creation_cadence_days: f64,
    #[serde(default = "default_industry")]
    pub industry: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_name: Option<String>,
    #[serde(default)]
    pub credentials: Vec<CredentialSpec>,
    /// Fixed RNG seed for reproducible runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub tuning: SchedulerTuning,
}

fn default_utc_offset() -> i32 {
    -480
}

fn default_burst_factor() -> f64 {
    0.5
}

fn default_creation_cadence() -> f64 {
    14.0
}

fn default_industry() -> String {
    "technology".to_string()
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            name: None,
            platform: PlatformSettings::default(),
            duration: JobDuration::default(),
            activity_level: ActivityLevel::default(),
            work_pattern: WorkPatternKind::default(),
            utc_offset_minutes: default_utc_offset(),
            burst_factor: default_burst_factor(),
            rates: LifecycleRates::default(),
            creation_cadence_days: default_creation_cadence(),
            industry: default_industry(),
            workspace_name: None,
            credentials: Vec::new(),
            seed: None,
            retention: RetentionConfig::default(),
            tuning: SchedulerTuning::default(),
        }
    }
}

impl JobConfig {
    pub fn platform_kind(&self) -> PlatformKind {
        self.platform.kind()
    }

    pub fn from_yaml(data: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(data)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_yaml(&data)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        // 1. Ranges
        if !(0.0..=1.0).contains(&self.burst_factor) {
            warnings.push(ConfigWarning::error(format!(
                "burst_factor must be within [0, 1], got {}",
                self.burst_factor
            )));
        }
        let rates = &self.rates;
        if !(rates.completion_rate_per_week > 0.0 && rates.completion_rate_per_week < 100.0) {
            warnings.push(ConfigWarning::error(format!(
                "rates.completion_rate_per_week must be within (0, 100), got {}",
                rates.completion_rate_per_week
            )));
        }
        if !(0.0..100.0).contains(&rates.block_frequency_pct) {
            warnings.push(ConfigWarning::error(format!(
                "rates.block_frequency_pct must be within [0, 100), got {}",
                rates.block_frequency_pct
            )));
        }
        if rates.avg_block_days <= 0.0 {
            warnings.push(ConfigWarning::error(
                "rates.avg_block_days must be positive",
            ));
        }
        if self.creation_cadence_days <= 0.0 {
            warnings.push(ConfigWarning::error(
                "creation_cadence_days must be positive",
            ));
        }
        if self.retention.activity_log_cap == 0 || self.retention.error_log_cap == 0 {
            warnings.push(ConfigWarning::error("retention caps must be positive"));
        }
        for (name, p) in self.tuning.probabilities() {
            if !(0.0..=1.0).contains(&p) {
                warnings.push(ConfigWarning::error(format!(
                    "tuning.{name} must be a probability, got {p}"
                )));
            }
        }
        if self.tuning.burst_boost < 1.0 {
            warnings.push(ConfigWarning::error("tuning.burst_boost must be >= 1"));
        }

        // 2. Credentials
        if self.credentials.is_empty() {
            warnings.push(ConfigWarning::error(
                "at least one actor credential is required",
            ));
        }
        for (i, cred) in self.credentials.iter().enumerate() {
            if cred.actor.trim().is_empty() || cred.secret.trim().is_empty() {
                warnings.push(ConfigWarning::error(format!(
                    "credential #{} needs both an actor name and a secret",
                    i + 1
                )));
            }
            if self.credentials[..i].iter().any(|c| c.actor == cred.actor) {
                warnings.push(ConfigWarning::error(format!(
                    "duplicate actor '{}'",
                    cred.actor
                )));
            }
        }
        if self.credentials.len() == 1 {
            warnings.push(ConfigWarning::warning(
                "only one actor configured: conversations will be one-sided",
            ));
        }

        // 3. Platform addressing
        match &self.platform {
            PlatformSettings::Okta(s) if s.org_url.trim().is_empty() => {
                warnings.push(ConfigWarning::error("okta platform requires org_url"));
            }
            PlatformSettings::Salesforce(s) if s.instance_url.trim().is_empty() => {
                warnings.push(ConfigWarning::error(
                    "salesforce platform requires instance_url",
                ));
            }
            _ => {}
        }
        if self.platform_kind() == PlatformKind::Salesforce
            && self.activity_level == ActivityLevel::High
        {
            warnings.push(ConfigWarning::warning(
                "high activity against salesforce will spend the API budget quickly",
            ));
        }

        warnings
    }

    /// Fail on any error-level finding; warnings are returned for logging.
    pub fn ensure_valid(&self) -> Result<Vec<ConfigWarning>> {
        let (errors, warnings): (Vec<_>, Vec<_>) = self
            .validate()
            .into_iter()
            .partition(|w| w.level == WarnLevel::Error);
        if let Some(first) = errors.first() {
            let rest = errors.len() - 1;
            let message = if rest == 0 {
                first.message.clone()
            } else {
                format!("{} (and {rest} more)", first.message)
            };
            return Err(CadenceError::InvalidConfig(message));
        }
        Ok(warnings)
    }
}

// ---------------------------------------------------------------------------
// ServiceConfig
// ---------------------------------------------------------------------------

/// Process-wide loop timings, read from `.cadence/config.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub version: u32,
    pub idle_min_ms: u64,
    pub idle_max_ms: u64,
    pub activity_gap_min_ms: u64,
    pub activity_gap_max_ms: u64,
    pub throttle_cooldown_ms: u64,
    /// Chance that each actor posts an out-of-office note after a throttle.
    pub narrative_chance: f64,
    pub narrative_max: usize,
    pub save_attempts: u32,
    pub save_retry_ms: u64,
    pub content_timeout_ms: u64,
    pub stop_timeout_ms: u64,
    /// Share of the platform's published rate limit the pool may spend.
    pub call_budget_fraction: f64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            version: 1,
            idle_min_ms: 30_000,
            idle_max_ms: 90_000,
            activity_gap_min_ms: 5_000,
            activity_gap_max_ms: 20_000,
            throttle_cooldown_ms: 300_000,
            narrative_chance: 0.3,
            narrative_max: 3,
            save_attempts: 3,
            save_retry_ms: 500,
            content_timeout_ms: 20_000,
            stop_timeout_ms: 30_000,
            call_budget_fraction: 0.5,
        }
    }
}

impl ServiceConfig {
    /// Load from `root`, falling back to defaults when no file exists.
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        match crate::io::read_if_exists(&path)? {
            Some(data) => Ok(serde_yaml::from_str(&data)?),
            None => Ok(Self::default()),
        }
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    pub fn idle_range(&self) -> (Duration, Duration) {
        ordered(self.idle_min_ms, self.idle_max_ms)
    }

    pub fn activity_gap_range(&self) -> (Duration, Duration) {
        ordered(self.activity_gap_min_ms, self.activity_gap_max_ms)
    }

    pub fn throttle_cooldown(&self) -> Duration {
        Duration::from_millis(self.throttle_cooldown_ms)
    }

    pub fn save_retry_delay(&self) -> Duration {
        Duration::from_millis(self.save_retry_ms)
    }

    pub fn content_timeout(&self) -> Duration {
        Duration::from_millis(self.content_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

fn ordered(a: u64, b: u64) -> (Duration, Duration) {
    (
        Duration::from_millis(a.min(b)),
        Duration::from_millis(a.max(b)),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
