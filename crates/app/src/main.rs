mod admin;
mod auth;
mod engine;
mod groups;
mod hooks;
mod migrator;
mod problem;
mod reverify;
mod router;
mod telemetry;

use std::{net::SocketAddr, sync::Arc};

use b2b_group_storage::Database;
use b2b_group_util::{load_env_file, AppConfig};
use tracing::{info, warn};

use crate::migrator::LegacyMigrator;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;

    match LegacyMigrator::new(database.clone()).run_if_needed().await {
        Ok(report) => info!(stage = "migration", ?report, "legacy migration check finished"),
        Err(err) => warn!(stage = "migration", error = %err, "legacy migration failed; will retry on next start"),
    }

    let hook_secret: Arc<[u8]> = Arc::from(config.hook_secret.as_bytes().to_vec().into_boxed_slice());
    let state = router::AppState::new(
        metrics,
        database,
        hook_secret,
        config.admin_token_secret.as_bytes(),
        config.assignment.clone(),
    );

    let addr: SocketAddr = config.bind_addr;
    info!(
        stage = "app",
        %addr,
        env = %config.environment.as_str(),
        group_field = %config.assignment.group_field,
        reverify_window_days = config.assignment.reverify_window_days,
        "starting HTTP server"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
