use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;

use dm_autopilot::config::{self, EngineConfig, NotifyConfig, PolicyConfig, SurfaceConfig};
use dm_autopilot::conversation::{Engine, StopReason};
use dm_autopilot::notify;
use dm_autopilot::policy::HttpPolicy;
use dm_autopilot::store::{ContactStore, LibSqlBackend};
use dm_autopilot::surface::HttpSurface;

const USAGE: &str = "usage: dm-autopilot [run | reset <contact>]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let engine_config = EngineConfig::from_env()?;

    // ── Database ─────────────────────────────────────────────────────────
    let db_path = config::database_path();
    let store: Arc<dyn ContactStore> = Arc::new(
        LibSqlBackend::new_local(&db_path)
            .await
            .with_context(|| format!("failed to open database at {}", db_path.display()))?,
    );

    match args.first().map(String::as_str) {
        None | Some("run") => run(engine_config, store).await,
        Some("reset") => {
            let name = args.get(1).context(USAGE)?;
            if store.reset_contact(&engine_config.account_id, name).await? {
                eprintln!("Reset {name}");
            } else {
                eprintln!("No stored contact named {name}");
            }
            Ok(())
        }
        Some(other) => anyhow::bail!("unknown command '{other}'\n{USAGE}"),
    }
}

async fn run(engine_config: EngineConfig, store: Arc<dyn ContactStore>) -> anyhow::Result<()> {
    let surface_config = SurfaceConfig::from_env()?;
    let policy_config = PolicyConfig::from_env()?;
    let notify_config = NotifyConfig::from_env();

    eprintln!("DM autopilot v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Account: {}", engine_config.account_id);
    eprintln!("   Surface: {}", surface_config.base_url);
    eprintln!("   Policy: {}", policy_config.endpoint);

    let surface = Arc::new(HttpSurface::new(surface_config)?);
    let policy = Arc::new(HttpPolicy::new(policy_config)?);
    let notifier = notify::from_config(&notify_config)?;
    let engine = Engine::new(engine_config, surface, policy, store, notifier);

    // ── Ctrl-C: stop at the next cycle boundary ─────────────────────────
    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Ctrl-C received, stopping after this cycle");
                cancel.store(true, Ordering::Relaxed);
            }
        });
    }

    let report = engine.run(cancel).await?;
    eprintln!(
        "Stopped: {} ({} cycles, {} replies, {} policy calls, {} skipped)",
        report.stop, report.cycles, report.replies_sent, report.policy_calls, report.skipped
    );

    if let StopReason::SessionLost { .. } = report.stop {
        std::process::exit(2);
    }
    Ok(())
}
