use crate::output::{print_json, print_table, timestamp};
use anyhow::Result;
use cadence_core::activity::{ActivityRecord, Outcome};
use cadence_core::snapshot::{JobSnapshot, JobSummary};
use cadence_core::store::{FileStore, StateStore};
use cadence_core::types::LifecycleStage;
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
struct ShowOutput<'a> {
    #[serde(flatten)]
    summary: JobSummary,
    stages: Vec<(LifecycleStage, usize)>,
    revoked_actors: &'a [String],
    usage: &'a cadence_core::usage::UsageCounters,
    stats: &'a cadence_core::snapshot::JobStats,
    recent_activity: Vec<ActivityRecord>,
}

pub fn run(root: &Path, id: &str, limit: usize, json: bool) -> Result<()> {
    let snap = FileStore::new(root).load(id)?;
    let recent = snap.activity_log.page(0, limit);

    if json {
        return print_json(&ShowOutput {
            summary: snap.summary(),
            stages: snap.stage_counts(),
            revoked_actors: &snap.revoked_actors,
            usage: &snap.usage,
            stats: &snap.stats,
            recent_activity: recent,
        });
    }

    print_overview(&snap);
    if recent.is_empty() {
        println!("\nNo activity yet.");
        return Ok(());
    }
    println!();
    let rows: Vec<Vec<String>> = recent.iter().map(activity_row).collect();
    print_table(&["SEQ", "WHEN", "ACTIVITY", "TARGET", "ACTOR", "RESULT"], &rows);
    Ok(())
}

fn print_overview(snap: &JobSnapshot) {
    let platform = snap.platform_kind();
    println!("Job:      {} ({})", snap.display_name(), snap.id);
    println!("Status:   {}", snap.status);
    println!("Platform: {platform}");
    println!("Duration: {}", snap.config.duration);
    println!("Started:  {}", timestamp(snap.started_at));
    println!("Next:     {}", timestamp(snap.next_activity_at));
    println!(
        "{}s: {}",
        capitalize(platform.container_noun()),
        snap.containers.len()
    );
    let stages: Vec<String> = snap
        .stage_counts()
        .into_iter()
        .map(|(stage, n)| format!("{stage} {n}"))
        .collect();
    println!(
        "{}s:  {} ({})",
        capitalize(platform.entity_noun()),
        snap.entities().count(),
        stages.join(", ")
    );
    if !snap.revoked_actors.is_empty() {
        println!("Revoked:  {}", snap.revoked_actors.join(", "));
    }
    println!(
        "Calls:    {} platform today / {} total, {} content",
        snap.usage.today_platform_calls, snap.usage.total_platform_calls, snap.usage.total_content_calls
    );
    if let Some(err) = snap.errors.latest() {
        println!("Last error [{}]: {}", err.kind, err.message);
    }
}

fn activity_row(r: &ActivityRecord) -> Vec<String> {
    let result = match &r.outcome {
        Outcome::Success => match r.transition {
            Some(t) => format!("ok ({} -> {})", t.from, t.to),
            None => "ok".to_string(),
        },
        Outcome::Failure { reason } => format!("failed: {reason}"),
    };
    vec![
        r.seq.to_string(),
        timestamp(Some(r.timestamp)),
        r.activity.to_string(),
        r.target.to_string(),
        r.actor.clone(),
        result,
    ]
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
