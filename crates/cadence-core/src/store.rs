use crate::error::{CadenceError, Result};
use crate::migrations::migrate_snapshot;
use crate::paths;
use crate::snapshot::{JobFilter, JobSnapshot, JobSummary};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Durable per-job snapshot persistence.
///
/// Each job is owned by exactly one writer at a time; implementations do not
/// need to arbitrate concurrent saves of the same id.
pub trait StateStore: Send + Sync {
    fn load(&self, id: &str) -> Result<JobSnapshot>;
    fn save(&self, snapshot: &JobSnapshot) -> Result<()>;
    /// Summaries matching `filter`, most recently updated first.
    fn list(&self, filter: &JobFilter) -> Result<Vec<JobSummary>>;
    fn delete(&self, id: &str) -> Result<()>;
}

/// One YAML document per job under `<root>/.cadence/jobs/`.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn parse(id: &str, data: &str) -> Result<JobSnapshot> {
        let corrupt = |reason: String| CadenceError::CorruptSnapshot {
            id: id.to_string(),
            reason,
        };
        let value: serde_yaml::Value =
            serde_yaml::from_str(data).map_err(|e| corrupt(e.to_string()))?;
        let value = migrate_snapshot(value)?;
        let snapshot: JobSnapshot =
            serde_yaml::from_value(value).map_err(|e| corrupt(e.to_string()))?;
        if snapshot.id != id {
            return Err(corrupt(format!(
                "file holds job '{}'",
                snapshot.id
            )));
        }
        snapshot.validate()?;
        Ok(snapshot)
    }
}

impl StateStore for FileStore {
    fn load(&self, id: &str) -> Result<JobSnapshot> {
        paths::validate_job_id(id)?;
        let path = paths::job_path(&self.root, id);
        let data = crate::io::read_if_exists(&path)?
            .ok_or_else(|| CadenceError::JobNotFound(id.to_string()))?;
        Self::parse(id, &data)
    }

    fn save(&self, snapshot: &JobSnapshot) -> Result<()> {
        paths::validate_job_id(&snapshot.id)?;
        let path = paths::job_path(&self.root, &snapshot.id);
        let data = serde_yaml::to_string(snapshot)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<JobSummary>> {
        let dir = paths::jobs_dir(&self.root);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(id) = paths::job_id_from_path(&path) else {
                continue;
            };
            match self.load(&id) {
                Ok(snapshot) => {
                    let summary = snapshot.summary();
                    if filter.matches(&summary) {
                        out.push(summary);
                    }
                }
                Err(e) => warn!(job = %id, error = %e, "skipping unreadable snapshot"),
            }
        }
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    fn delete(&self, id: &str) -> Result<()> {
        paths::validate_job_id(id)?;
        if !crate::io::remove_if_exists(&paths::job_path(&self.root, id))? {
            return Err(CadenceError::JobNotFound(id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CredentialSpec, JobConfig};
    use crate::entity::SimulatedEntity;
    use crate::types::{JobStatus, PlatformKind};
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use tempfile::TempDir;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 17, 0, 0).unwrap()
    }

    fn snapshot(id: &str) -> JobSnapshot {
        let cfg = JobConfig {
            credentials: vec![CredentialSpec {
                actor: "Alice".into(),
                secret: "tok-a".into(),
                address: None,
            }],
            ..JobConfig::default()
        };
        let mut snap = JobSnapshot::new(id, cfg, t0());
        let c = snap.allocate_key();
        snap.add_container(c, "Launch", "Alice", None, t0()).unwrap();
        let e = snap.allocate_key();
        snap.add_entity(c, SimulatedEntity::new(e, "Brief", "Alice", t0()))
            .unwrap();
        snap
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        let snap = snapshot("ab12cd34");
        store.save(&snap).unwrap();
        assert_eq!(store.load("ab12cd34").unwrap(), snap);
    }

    #[test]
    fn resave_is_byte_identical() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        store.save(&snapshot("ab12cd34")).unwrap();
        let path = paths::job_path(dir.path(), "ab12cd34");
        let first = std::fs::read(&path).unwrap();
        store.save(&store.load("ab12cd34").unwrap()).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), first);
    }

    #[test]
    fn missing_job_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        assert!(matches!(
            store.load("nope1234"),
            Err(CadenceError::JobNotFound(_))
        ));
        assert!(matches!(
            store.delete("nope1234"),
            Err(CadenceError::JobNotFound(_))
        ));
    }

    #[test]
    fn truncated_write_is_reported_not_loaded() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        store.save(&snapshot("ab12cd34")).unwrap();
        let path = paths::job_path(dir.path(), "ab12cd34");
        let full = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, &full[..full.len() / 2]).unwrap();
        assert!(matches!(
            store.load("ab12cd34"),
            Err(CadenceError::CorruptSnapshot { .. })
        ));
    }

    #[test]
    fn stray_temp_file_does_not_shadow_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        let snap = snapshot("ab12cd34");
        store.save(&snap).unwrap();
        std::fs::write(paths::jobs_dir(dir.path()).join(".tmpA1b2C3"), b"id: ab1").unwrap();
        assert_eq!(store.load("ab12cd34").unwrap(), snap);
        assert_eq!(store.list(&JobFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn list_filters_sorts_and_skips_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        let older = snapshot("aaaa1111");
        let mut newer = snapshot("bbbb2222");
        newer.updated_at = t0() + Duration::hours(1);
        newer.set_status(JobStatus::Paused, t0() + Duration::hours(2)).unwrap();
        store.save(&older).unwrap();
        store.save(&newer).unwrap();
        std::fs::write(paths::job_path(dir.path(), "cccc3333"), "::: not yaml").unwrap();

        let all = store.list(&JobFilter::default()).unwrap();
        let ids: Vec<_> = all.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["bbbb2222", "aaaa1111"]);

        let paused = store
            .list(&JobFilter {
                status: Some(JobStatus::Paused),
                platform: Some(PlatformKind::Asana),
            })
            .unwrap();
        assert_eq!(paused.len(), 1);
        assert_eq!(paused[0].id, "bbbb2222");
    }

    #[test]
    fn file_holding_another_job_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        store.save(&snapshot("ab12cd34")).unwrap();
        std::fs::rename(
            paths::job_path(dir.path(), "ab12cd34"),
            paths::job_path(dir.path(), "ffff0000"),
        )
        .unwrap();
        assert!(matches!(
            store.load("ffff0000"),
            Err(CadenceError::CorruptSnapshot { .. })
        ));
    }

    #[test]
    fn legacy_snapshot_is_upgraded_in_memory_only() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        let legacy = "id: legacy01\nstatus: running\ncreated_at: 2024-03-04T17:00:00Z\nupdated_at: 2024-03-04T17:00:00Z\nconfig:\n  credentials:\n    - actor: Alice\n      secret: tok-a\n";
        let path = paths::job_path(dir.path(), "legacy01");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, legacy).unwrap();

        let snap = store.load("legacy01").unwrap();
        assert_eq!(snap.platform_kind(), PlatformKind::Asana);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), legacy);

        store.save(&snap).unwrap();
        assert!(std::fs::read_to_string(&path)
            .unwrap()
            .contains("schema_version: 2"));
    }
}
