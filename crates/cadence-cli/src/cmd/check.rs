use crate::output::print_json;
use anyhow::{bail, Context, Result};
use cadence_core::config::{JobConfig, WarnLevel};
use std::path::Path;

pub fn run(path: &Path, json: bool) -> Result<()> {
    let config = JobConfig::load(path)
        .with_context(|| format!("failed to load job config {}", path.display()))?;
    let findings = config.validate();
    let errors = findings
        .iter()
        .filter(|w| w.level == WarnLevel::Error)
        .count();

    if json {
        print_json(&serde_json::json!({
            "valid": errors == 0,
            "platform": config.platform_kind(),
            "findings": findings,
        }))?;
    } else {
        for w in &findings {
            let tag = match w.level {
                WarnLevel::Error => "error",
                WarnLevel::Warning => "warning",
            };
            println!("{tag}: {}", w.message);
        }
        if errors == 0 {
            println!(
                "ok: {} job with {} actor(s), duration {}",
                config.platform_kind(),
                config.credentials.len(),
                config.duration
            );
        }
    }

    if errors > 0 {
        bail!("{errors} error(s) in {}", path.display());
    }
    Ok(())
}
