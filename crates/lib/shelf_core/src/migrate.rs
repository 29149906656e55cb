//! Schema migrations for the Postgres ledger store.

use sqlx::PgPool;

/// Run the embedded migrations in `shelf_core/migrations/`.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
