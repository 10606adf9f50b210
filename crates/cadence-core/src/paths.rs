use crate::error::{CadenceError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const CADENCE_DIR: &str = ".cadence";
pub const JOBS_DIR: &str = ".cadence/jobs";
pub const CONFIG_FILE: &str = ".cadence/config.yaml";

pub const SNAPSHOT_EXT: &str = "yaml";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn cadence_dir(root: &Path) -> PathBuf {
    root.join(CADENCE_DIR)
}

pub fn jobs_dir(root: &Path) -> PathBuf {
    root.join(JOBS_DIR)
}

pub fn job_path(root: &Path, id: &str) -> PathBuf {
    jobs_dir(root).join(format!("{id}.{SNAPSHOT_EXT}"))
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

/// Extract the job id from a snapshot file name, ignoring temp files and
/// anything that is not a `.yaml` document.
pub fn job_id_from_path(path: &Path) -> Option<String> {
    if path.extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_EXT) {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.starts_with('.') || validate_job_id(stem).is_err() {
        return None;
    }
    Some(stem.to_string())
}

// ---------------------------------------------------------------------------
// Job id validation
// ---------------------------------------------------------------------------

static JOB_ID_RE: OnceLock<Regex> = OnceLock::new();

fn job_id_re() -> &'static Regex {
    JOB_ID_RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9\-]{1,62}[a-z0-9]$").unwrap())
}

pub fn validate_job_id(id: &str) -> Result<()> {
    if !job_id_re().is_match(id) {
        return Err(CadenceError::InvalidJobId(id.to_string()));
    }
    Ok(())
}

/// Generate a short job id: the first eight hex characters of a v4 uuid.
pub fn new_job_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_job_ids() {
        for id in ["ab12cd34", "abc", "legacy-job-1", "0a0"] {
            validate_job_id(id).unwrap_or_else(|_| panic!("expected valid: {id}"));
        }
    }

    #[test]
    fn invalid_job_ids() {
        for id in ["", "ab", "-abc", "abc-", "UPPER", "a_b", "has space", "../etc"] {
            assert!(validate_job_id(id).is_err(), "expected invalid: {id}");
        }
    }

    #[test]
    fn generated_ids_are_valid() {
        for _ in 0..20 {
            let id = new_job_id();
            assert_eq!(id.len(), 8);
            validate_job_id(&id).unwrap();
        }
    }

    #[test]
    fn path_helpers() {
        let root = Path::new("/tmp/proj");
        assert_eq!(
            job_path(root, "ab12cd34"),
            PathBuf::from("/tmp/proj/.cadence/jobs/ab12cd34.yaml")
        );
        assert_eq!(
            config_path(root),
            PathBuf::from("/tmp/proj/.cadence/config.yaml")
        );
    }

    #[test]
    fn job_id_from_path_skips_temp_and_foreign_files() {
        let dir = Path::new("/tmp/proj/.cadence/jobs");
        assert_eq!(
            job_id_from_path(&dir.join("ab12cd34.yaml")),
            Some("ab12cd34".to_string())
        );
        assert_eq!(job_id_from_path(&dir.join(".tmpXYZ")), None);
        assert_eq!(job_id_from_path(&dir.join("notes.txt")), None);
        assert_eq!(job_id_from_path(&dir.join("BAD_ID.yaml")), None);
    }
}
