use crate::output::{print_json, print_table, timestamp};
use anyhow::{bail, Context, Result};
use cadence_core::clock::{Clock, SystemClock};
use cadence_core::snapshot::JobFilter;
use cadence_core::store::{FileStore, StateStore};
use cadence_core::types::{JobStatus, PlatformKind};
use std::path::Path;

pub fn run(
    root: &Path,
    status: Option<JobStatus>,
    platform: Option<PlatformKind>,
    json: bool,
) -> Result<()> {
    let store = FileStore::new(root);
    let jobs = store
        .list(&JobFilter { status, platform })
        .context("failed to list jobs")?;

    if json {
        return print_json(&jobs);
    }
    if jobs.is_empty() {
        println!("No jobs.");
        return Ok(());
    }
    let rows: Vec<Vec<String>> = jobs
        .iter()
        .map(|j| {
            vec![
                j.id.clone(),
                j.name.clone(),
                j.platform.to_string(),
                j.status.to_string(),
                format!("{}/{}", j.open_entities, j.entities),
                j.activities.to_string(),
                j.errors.to_string(),
                timestamp(Some(j.updated_at)),
            ]
        })
        .collect();
    print_table(
        &["ID", "NAME", "PLATFORM", "STATUS", "OPEN", "ACTIVITY", "ERRORS", "UPDATED"],
        &rows,
    );
    Ok(())
}

/// Only touches jobs at rest; a `serve` process owns the ones it runs.
pub fn stop(root: &Path, id: &str) -> Result<()> {
    let store = FileStore::new(root);
    let mut snapshot = store.load(id)?;
    if snapshot.status.is_terminal() {
        bail!("job {id} is already {}", snapshot.status);
    }
    snapshot.set_status(JobStatus::Stopped, SystemClock.now())?;
    store.save(&snapshot)?;
    println!("Stopped job {id}.");
    Ok(())
}

pub fn delete(root: &Path, id: &str) -> Result<()> {
    FileStore::new(root).delete(id)?;
    println!("Deleted job {id}.");
    Ok(())
}
