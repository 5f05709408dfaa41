use sea_orm_migration::prelude::*;
use tracing::info;

use storefront_api::db::{establish_connection_with_config, DbConfig};
use storefront_api::migrator::Migrator;

/// Applies (`up`, the default), reverts (`down [n]`) or reports (`status`)
/// the embedded migrations against `DATABASE_URL`.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://storefront.db?mode=rwc".to_string());
    info!("Connecting to database: {}", database_url);

    let db = establish_connection_with_config(&DbConfig {
        url: database_url,
        max_connections: 5,
        ..DbConfig::default()
    })
    .await?;

    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        None | Some("up") => {
            Migrator::up(&db, None).await?;
            info!("Migration completed successfully");
        }
        Some("down") => {
            let steps = args.next().map(|s| s.parse::<u32>()).transpose()?.unwrap_or(1);
            Migrator::down(&db, Some(steps)).await?;
            info!(steps, "Rolled back migrations");
        }
        Some("status") => {
            Migrator::status(&db).await?;
        }
        Some(other) => anyhow::bail!("unknown command `{}`; expected up, down [n] or status", other),
    }

    Ok(())
}
