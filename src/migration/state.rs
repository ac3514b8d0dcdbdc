//! Schema management for the engine's own state tables.
//!
//! Only needed with the postgres cache backend; the file backend keeps its
//! state next to the binary.

use sqlx::PgPool;
use sqlx::migrate::Migrator;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Create or upgrade the `migration_mappings` table.
///
/// Idempotent: migrations that have already been applied are skipped.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    log::info!("checking migration state schema");
    MIGRATOR.run(pool).await?;
    log::info!("migration state schema up to date");
    Ok(())
}
