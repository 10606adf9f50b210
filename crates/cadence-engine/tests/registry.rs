use cadence_core::activity::ErrorKind;
use cadence_core::client_pool::{PlatformError, Resource};
use cadence_core::clock::{Clock, ManualClock, SystemClock};
use cadence_core::config::{CredentialSpec, JobConfig, JobDuration, SchedulerTuning, ServiceConfig};
use cadence_core::content::{ContentContext, ContentError, ContentGenerator, ContentKind, Generated, TemplateContent};
use cadence_core::snapshot::{JobFilter, JobSnapshot};
use cadence_core::store::{FileStore, StateStore};
use cadence_core::types::{ActivityLevel, JobStatus, WorkPatternKind};
use cadence_core::CadenceError;
use cadence_engine::sandbox::{SandboxConnector, SandboxPlatform};
use cadence_engine::{EngineError, JobRegistry};
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Harness {
    _dir: TempDir,
    store: Arc<FileStore>,
    platform: Arc<SandboxPlatform>,
    registry: JobRegistry,
}

fn service() -> ServiceConfig {
    ServiceConfig {
        idle_min_ms: 1,
        idle_max_ms: 3,
        activity_gap_min_ms: 1,
        activity_gap_max_ms: 3,
        throttle_cooldown_ms: 10,
        narrative_chance: 1.0,
        save_retry_ms: 1,
        stop_timeout_ms: 5_000,
        call_budget_fraction: 1_000_000.0,
        ..ServiceConfig::default()
    }
}

fn actor(name: &str) -> CredentialSpec {
    CredentialSpec {
        actor: name.into(),
        secret: format!("{name}-secret"),
        address: None,
    }
}

/// A config that fires on every tick at any hour.
fn busy_config() -> JobConfig {
    JobConfig {
        name: Some("demo".into()),
        duration: JobDuration::Indefinite,
        activity_level: ActivityLevel::High,
        work_pattern: WorkPatternKind::Global,
        credentials: vec![actor("Alice"), actor("Bob")],
        seed: Some(7),
        tuning: SchedulerTuning {
            base_tick_rate: 1.0,
            entity_creation_interval_minutes: 0,
            ..SchedulerTuning::default()
        },
        ..JobConfig::default()
    }
}

/// Template text, but each request takes a while.
struct SlowContent(Duration);

impl ContentGenerator for SlowContent {
    fn generate(&self, kind: ContentKind, ctx: &ContentContext) -> Result<Generated, ContentError> {
        std::thread::sleep(self.0);
        TemplateContent.generate(kind, ctx)
    }
}

/// Wall clock that panics on the first reading after being armed.
#[derive(Default)]
struct FaultyClock {
    armed: AtomicBool,
}

impl Clock for FaultyClock {
    fn now(&self) -> DateTime<Utc> {
        if self.armed.swap(false, Ordering::SeqCst) {
            panic!("clock source unavailable");
        }
        Utc::now()
    }
}

fn harness_with(dir: TempDir, clock: Arc<dyn Clock>) -> Harness {
    harness_using(dir, clock, Arc::new(TemplateContent))
}

fn harness_using(dir: TempDir, clock: Arc<dyn Clock>, content: Arc<dyn ContentGenerator>) -> Harness {
    let store = Arc::new(FileStore::new(dir.path()));
    let platform = SandboxPlatform::new();
    let registry = JobRegistry::new(
        store.clone(),
        Arc::new(SandboxConnector::new(platform.clone())),
        content,
        clock,
        service(),
    );
    Harness {
        _dir: dir,
        store,
        platform,
        registry,
    }
}

fn harness() -> Harness {
    harness_with(TempDir::new().unwrap(), Arc::new(SystemClock))
}

/// Poll the persisted snapshot until `pred` holds, or panic after 5s.
async fn wait_for(h: &Harness, id: &str, what: &str, pred: impl Fn(&JobSnapshot) -> bool) -> JobSnapshot {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(snap) = h.store.load(id) {
            if pred(&snap) {
                return snap;
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what} on job {id}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_not_running(h: &Harness, id: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while h.registry.running().await.iter().any(|r| r == id) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "loop for {id} never exited"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn is_core(err: &EngineError, f: impl Fn(&CadenceError) -> bool) -> bool {
    matches!(err, EngineError::Core(e) if f(e))
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_produces_activity_and_stop_is_final() {
    let h = harness();
    let id = h.registry.start(busy_config()).await.unwrap();
    assert_eq!(h.registry.running().await, vec![id.clone()]);

    let snap = wait_for(&h, &id, "activity", |s| s.activity_log.len() >= 4).await;
    assert_eq!(snap.status, JobStatus::Running);
    assert!(!snap.containers.is_empty());
    assert!(snap.usage.total_platform_calls >= 4);

    h.registry.stop(&id).await.unwrap();
    assert!(h.registry.running().await.is_empty());
    let stopped = h.registry.get(&id).await.unwrap();
    assert_eq!(stopped.status, JobStatus::Stopped);
    assert!(stopped.finished_at.is_some());

    let err = h.registry.stop(&id).await.unwrap_err();
    assert!(is_core(&err, |e| matches!(e, CadenceError::InvalidTransition { .. })));
    let err = h.registry.resume(&id).await.unwrap_err();
    assert!(is_core(&err, |e| matches!(e, CadenceError::InvalidTransition { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pause_halts_platform_calls_until_resume() {
    let h = harness();
    let id = h.registry.start(busy_config()).await.unwrap();
    wait_for(&h, &id, "activity", |s| s.activity_log.len() >= 2).await;

    h.registry.pause(&id).await.unwrap();
    let paused = wait_for(&h, &id, "paused", |s| s.status == JobStatus::Paused).await;
    let calls = h.platform.call_count();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.platform.call_count(), calls);

    let err = h.registry.generate_now(&id).await.unwrap_err();
    assert!(is_core(&err, |e| matches!(e, CadenceError::InvalidTransition { .. })));

    h.registry.resume(&id).await.unwrap();
    let seen = paused.activity_log.len();
    wait_for(&h, &id, "more activity", |s| {
        s.status == JobStatus::Running && s.activity_log.len() > seen
    })
    .await;
    h.registry.stop(&id).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fixed_duration_completes_on_its_own() {
    let start = Utc.with_ymd_and_hms(2024, 3, 4, 17, 0, 0).unwrap();
    let clock = ManualClock::new(start);
    let h = harness_with(TempDir::new().unwrap(), Arc::new(clock.clone()));
    let config = JobConfig {
        duration: JobDuration::Days(1),
        ..busy_config()
    };
    let id = h.registry.start(config).await.unwrap();
    wait_for(&h, &id, "activity", |s| s.activity_log.len() >= 2).await;

    clock.advance(chrono::Duration::days(1));
    let done = wait_for(&h, &id, "completion", |s| s.status == JobStatus::Completed).await;
    wait_not_running(&h, &id).await;

    // Nothing is recorded once the job is terminal.
    let logged = done.activity_log.len();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.registry.get(&id).await.unwrap().activity_log.len(), logged);
}

// ---------------------------------------------------------------------------
// Failure handling
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn revoked_credentials_degrade_then_error() {
    let h = harness();
    let id = h.registry.start(busy_config()).await.unwrap();
    wait_for(&h, &id, "activity", |s| s.activity_log.len() >= 2).await;

    h.platform.revoke_secret("Bob-secret");
    let degraded = wait_for(&h, &id, "bob revoked", |s| {
        s.revoked_actors.iter().any(|a| a == "Bob")
    })
    .await;
    assert!(degraded
        .errors
        .iter()
        .any(|e| e.kind == ErrorKind::CredentialInvalid));

    // Alice carries on alone.
    let seen = degraded.activity_log.len();
    let later = wait_for(&h, &id, "alice keeps working", |s| {
        s.activity_log
            .iter()
            .filter(|r| r.outcome.is_success())
            .count()
            > seen
    })
    .await;
    assert_ne!(later.status, JobStatus::Errored);

    h.platform.revoke_secret("Alice-secret");
    let errored = wait_for(&h, &id, "errored", |s| s.status == JobStatus::Errored).await;
    assert_eq!(errored.revoked_actors.len(), 2);
    wait_not_running(&h, &id).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn throttle_cools_down_and_posts_narrative() {
    let h = harness();
    let id = h.registry.start(busy_config()).await.unwrap();
    wait_for(&h, &id, "an entity", |s| s.entities().any(|e| e.platform_id.is_some())).await;

    h.platform
        .fail_next(PlatformError::RateLimited { retry_after: None });
    let snap = wait_for(&h, &id, "narrative", |s| {
        s.errors.iter().any(|e| e.kind == ErrorKind::Throttle) && s.stats.out_of_office_notes >= 1
    })
    .await;
    assert_eq!(snap.status, JobStatus::Running);
    assert!(snap.revoked_actors.is_empty());
    h.registry.stop(&id).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_config_is_rejected_before_anything_is_saved() {
    let h = harness();
    let config = JobConfig {
        credentials: Vec::new(),
        ..busy_config()
    };
    let err = h.registry.start(config).await.unwrap_err();
    assert!(is_core(&err, |e| matches!(e, CadenceError::InvalidConfig(_))));
    assert!(h.registry.list(&JobFilter::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_ids_report_not_found() {
    let h = harness();
    let not_found = |e: &EngineError| is_core(e, |c| matches!(c, CadenceError::JobNotFound(_)));
    assert!(not_found(&h.registry.get("deadbeef").await.unwrap_err()));
    assert!(not_found(&h.registry.stop("deadbeef").await.unwrap_err()));
    assert!(not_found(&h.registry.pause("deadbeef").await.unwrap_err()));
    assert!(not_found(&h.registry.resume("deadbeef").await.unwrap_err()));
    assert!(not_found(&h.registry.generate_now("deadbeef").await.unwrap_err()));
    assert!(not_found(&h.registry.delete("deadbeef").await.unwrap_err()));
    assert!(not_found(
        &h.registry.activity("deadbeef", 0, 10).await.unwrap_err()
    ));
}

// ---------------------------------------------------------------------------
// Process lifecycle
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_keeps_statuses_and_restore_relaunches() {
    let h = harness();
    let running = h.registry.start(busy_config()).await.unwrap();
    let paused = h.registry.start(busy_config()).await.unwrap();
    let stopped = h.registry.start(busy_config()).await.unwrap();
    h.registry.pause(&paused).await.unwrap();
    wait_for(&h, &paused, "paused", |s| s.status == JobStatus::Paused).await;
    h.registry.stop(&stopped).await.unwrap();
    wait_for(&h, &running, "activity", |s| !s.activity_log.is_empty()).await;

    h.registry.shutdown().await;
    assert!(h.registry.running().await.is_empty());
    assert_eq!(h.store.load(&running).unwrap().status, JobStatus::Running);
    assert_eq!(h.store.load(&paused).unwrap().status, JobStatus::Paused);

    // A new process over the same directory.
    let Harness { _dir: dir, .. } = h;
    let h = harness_with(dir, Arc::new(SystemClock));
    assert_eq!(h.registry.restore().await.unwrap(), 2);
    let mut expected = vec![running.clone(), paused.clone()];
    expected.sort();
    assert_eq!(h.registry.running().await, expected);

    let seen = h.store.load(&running).unwrap().activity_log.len();
    wait_for(&h, &running, "resumed activity", |s| s.activity_log.len() > seen).await;
    assert_eq!(h.store.load(&paused).unwrap().status, JobStatus::Paused);
    h.registry.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restore_marks_invalid_stored_config_errored() {
    let h = harness();
    let mut config = busy_config();
    config.tuning.entity_creation_chance = 2.0;
    h.store
        .save(&JobSnapshot::new("ab12cd34", config, Utc::now()))
        .unwrap();

    assert_eq!(h.registry.restore().await.unwrap(), 0);
    assert!(h.registry.running().await.is_empty());
    let saved = h.store.load("ab12cd34").unwrap();
    assert_eq!(saved.status, JobStatus::Errored);
    let entry = saved.errors.latest().unwrap();
    assert_eq!(entry.kind, ErrorKind::Config);
    assert!(entry.message.contains("entity_creation_chance"), "{}", entry.message);
    assert_eq!(h.platform.call_count(), 0);

    let err = h.registry.resume("ab12cd34").await.unwrap_err();
    assert!(is_core(&err, |e| matches!(e, CadenceError::InvalidTransition { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_loop_is_recorded_as_errored() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(FaultyClock::default());
    let h = harness_with(dir, clock.clone());
    h.store
        .save(&JobSnapshot::new("ab12cd34", busy_config(), Utc::now()))
        .unwrap();

    clock.armed.store(true, Ordering::SeqCst);
    assert_eq!(h.registry.restore().await.unwrap(), 1);
    let snap = wait_for(&h, "ab12cd34", "errored", |s| s.status == JobStatus::Errored).await;
    wait_not_running(&h, "ab12cd34").await;
    let entry = snap.errors.latest().unwrap();
    assert_eq!(entry.kind, ErrorKind::Unexpected);
    assert!(entry.message.contains("clock source unavailable"), "{}", entry.message);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resume_while_stopping_cannot_launch_a_second_loop() {
    let h = harness_using(
        TempDir::new().unwrap(),
        Arc::new(SystemClock),
        Arc::new(SlowContent(Duration::from_millis(400))),
    );
    let id = h.registry.start(busy_config()).await.unwrap();
    wait_for(&h, &id, "activity", |s| !s.activity_log.is_empty()).await;

    let registry = h.registry.clone();
    let stop_id = id.clone();
    let stopping = tokio::spawn(async move { registry.stop(&stop_id).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Either the loop is still winding down or it has already saved `stopped`.
    let resumed = h.registry.resume(&id).await;
    assert!(
        matches!(resumed, Err(EngineError::Stopping(_)))
            || matches!(&resumed, Err(e) if is_core(e, |c| matches!(c, CadenceError::InvalidTransition { .. }))),
        "{resumed:?}"
    );

    stopping.await.unwrap().unwrap();
    assert!(h.registry.running().await.is_empty());
    let calls = h.platform.call_count();
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(h.platform.call_count(), calls);
    assert_eq!(h.store.load(&id).unwrap().status, JobStatus::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn generate_now_forces_an_activity() {
    let h = harness();
    let config = JobConfig {
        tuning: SchedulerTuning {
            base_tick_rate: 0.0,
            off_hours_chance: 0.0,
            ..SchedulerTuning::default()
        },
        ..busy_config()
    };
    let id = h.registry.start(config).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.store.load(&id).unwrap().activity_log.is_empty());

    h.registry.generate_now(&id).await.unwrap();
    wait_for(&h, &id, "forced activity", |s| s.activity_log.len() == 1).await;
    h.registry.stop(&id).await.unwrap();

    let err = h.registry.generate_now(&id).await.unwrap_err();
    assert!(matches!(err, EngineError::NotRunning(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cleanup_requires_a_stopped_loop() {
    let h = harness();
    let id = h.registry.start(busy_config()).await.unwrap();
    wait_for(&h, &id, "entities", |s| s.entities().count() >= 2).await;

    let err = h.registry.cleanup(&id).await.unwrap_err();
    assert!(matches!(err, EngineError::JobRunning(_)));

    h.registry.stop(&id).await.unwrap();
    let report = h.registry.cleanup(&id).await.unwrap();
    assert!(report.deleted_entities >= 2);
    assert_eq!(report.failures, 0);
    assert_eq!(h.platform.object_count(Resource::Entity), 0);
    assert_eq!(h.platform.object_count(Resource::Container), 0);
    assert!(h.registry.get(&id).await.unwrap().containers.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delete_stops_and_removes() {
    let h = harness();
    let id = h.registry.start(busy_config()).await.unwrap();
    wait_for(&h, &id, "activity", |s| !s.activity_log.is_empty()).await;

    let page = h.registry.activity(&id, 0, 1).await.unwrap();
    assert_eq!(page.len(), 1);

    h.registry.delete(&id).await.unwrap();
    assert!(h.registry.running().await.is_empty());
    let err = h.registry.get(&id).await.unwrap_err();
    assert!(is_core(&err, |e| matches!(e, CadenceError::JobNotFound(_))));
}
