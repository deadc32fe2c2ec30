use bookshop_api::{config, db, migrator::Migrator};
use sea_orm_migration::MigratorTrait;
use tracing::info;

/// Applies (default) or rolls back the embedded schema migrations.
///
/// Usage: `migration [up|down|status]`
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::load_config()?;
    config::init_tracing(cfg.log_level(), cfg.log_json);

    let command = std::env::args().nth(1).unwrap_or_else(|| "up".to_string());
    let pool = db::establish_connection_from_app_config(&cfg).await?;

    match command.as_str() {
        "up" => db::run_migrations(&pool).await?,
        "down" => {
            info!("Rolling back the latest migration");
            Migrator::down(&pool, Some(1)).await?;
        }
        "status" => Migrator::status(&pool).await?,
        other => anyhow::bail!("unknown command '{}'; expected up, down or status", other),
    }

    info!(command = %command, "Migration command finished");
    Ok(())
}
