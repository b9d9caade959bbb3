mod config;
mod db;
mod device;
mod error;
mod gateway;
mod scheduler;
mod web;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;
use db::Db;
use gateway::Gateway;
use scheduler::SchedulerHandle;
use web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ─────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let cfg = Config::from_env()?;

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&cfg.db_url).await?;
    db.migrate().await?;
    db.seed_devices().await?;
    info!(db = %cfg.db_url, "database ready, devices seeded");

    // ── Upstream gateway ────────────────────────────────────────────
    let gateway = Gateway::new(&cfg)?;

    // ── Irrigation scheduler ────────────────────────────────────────
    let scheduler = SchedulerHandle::default();
    tokio::spawn(scheduler::run(db.clone(), scheduler.clone(), cfg.utc_offset));

    // ── Web server ──────────────────────────────────────────────────
    web::serve(AppState { db, scheduler, gateway }, cfg.port).await
}
