use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use dual_feed_fusion::core::logging::init_logging;
use dual_feed_fusion::core::{Settings, SharedClock, SystemClock};
use dual_feed_fusion::retention::{NullArchive, SqliteTickArchive, TickArchive};
use dual_feed_fusion::scheduler::{ResourceProbe, SysinfoProbe};
use dual_feed_fusion::FusionSystem;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::load().context("failed to load fusion settings")?;

    // Initialize logging
    init_logging(&settings.logging.level);

    tracing::info!("🚀 Dual-feed fusion core starting...");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let clock: SharedClock = Arc::new(SystemClock);
    let probe: Arc<dyn ResourceProbe> = Arc::new(SysinfoProbe::new(Arc::clone(&clock)));

    let archive: Arc<dyn TickArchive> = match &settings.retention.archive_path {
        Some(path) => Arc::new(
            SqliteTickArchive::open(path)
                .await
                .with_context(|| format!("failed to open tick archive at {}", path))?,
        ),
        None => {
            tracing::info!("📭 No archive_path configured, evicted ticks are discarded");
            Arc::new(NullArchive)
        }
    };

    let system = FusionSystem::build(settings, clock, probe, archive)
        .context("failed to assemble fusion system")?;
    system.start();

    let status = {
        let system = Arc::clone(&system);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.tick().await;
            loop {
                interval.tick().await;
                let diagnostics = system.diagnostics().await;
                tracing::info!(
                    "Fusion status: {} | state {} | {} ticks buffered | {} offsets (uptime: {}s)",
                    diagnostics.health.status,
                    diagnostics.system_state.as_str(),
                    diagnostics.buffered_ticks,
                    diagnostics.offsets.len(),
                    diagnostics.health.uptime_seconds
                );
            }
        })
    };

    #[cfg(unix)]
    let reload = {
        use tokio::signal::unix::{signal, SignalKind};

        let system = Arc::clone(&system);
        let mut hangup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
        Some(tokio::spawn(async move {
            while hangup.recv().await.is_some() {
                tracing::info!("📨 SIGHUP received, reloading settings");
                match Settings::load() {
                    Ok(settings) => {
                        if let Err(e) = system.apply_settings(settings) {
                            tracing::error!("❌ Settings rejected: {}", e);
                        }
                    }
                    Err(e) => tracing::error!("❌ Failed to reload settings: {}", e),
                }
            }
        }))
    };
    #[cfg(not(unix))]
    let reload: Option<tokio::task::JoinHandle<()>> = None;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("🛑 Ctrl-C received");

    status.abort();
    if let Some(reload) = reload {
        reload.abort();
    }

    if !system.shutdown().await {
        tracing::warn!("⚠️  Some background work was abandoned at shutdown");
    }
    Ok(())
}
