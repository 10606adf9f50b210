use anyhow::{Context, Result};
use cadence_core::client_pool::Resource;
use cadence_core::clock::SystemClock;
use cadence_core::config::{JobConfig, ServiceConfig};
use cadence_core::content::TemplateContent;
use cadence_core::snapshot::JobFilter;
use cadence_core::store::{FileStore, StateStore};
use cadence_core::{io, paths};
use cadence_engine::sandbox::{SandboxConnector, SandboxPlatform};
use cadence_engine::JobRegistry;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub fn run(root: &Path, start: &[PathBuf]) -> Result<()> {
    let service = ServiceConfig::load(root).context("failed to load .cadence/config.yaml")?;
    let configs = start
        .iter()
        .map(|p| {
            JobConfig::load(p).with_context(|| format!("failed to load job config {}", p.display()))
        })
        .collect::<Result<Vec<_>>>()?;
    io::ensure_dir(&paths::jobs_dir(root))?;

    let store = Arc::new(FileStore::new(root));
    let platform = SandboxPlatform::new();
    adopt_existing(&store, &platform)?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let registry = JobRegistry::new(
            store,
            Arc::new(SandboxConnector::new(platform)),
            Arc::new(TemplateContent),
            Arc::new(SystemClock),
            service,
        );

        let restored = registry.restore().await?;
        for config in configs {
            let id = registry.start(config).await?;
            println!("started job {id}");
        }
        info!(
            root = %root.display(),
            restored,
            running = registry.running().await.len(),
            "cadence serving; Ctrl-C to exit"
        );

        tokio::signal::ctrl_c().await?;
        info!("shutting down");
        registry.shutdown().await;
        Ok::<_, anyhow::Error>(())
    })
}

/// Seed the sandbox with every object persisted jobs already created.
fn adopt_existing(store: &FileStore, platform: &SandboxPlatform) -> Result<()> {
    for summary in store.list(&JobFilter::default())? {
        let snapshot = match store.load(&summary.id) {
            Ok(s) => s,
            Err(e) => {
                warn!(job = %summary.id, error = %e, "skipping unreadable job");
                continue;
            }
        };
        for container in &snapshot.containers {
            if let Some(id) = &container.platform_id {
                platform.adopt(id, Resource::Container);
            }
            for entity in &container.entities {
                if let Some(id) = &entity.platform_id {
                    platform.adopt(id, Resource::Entity);
                }
            }
        }
    }
    Ok(())
}
