//! Wrapper para correr las migraciones embebidas de `migrations/`.

use diesel::pg::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

use crate::error::PersistenceError;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

pub fn run_pending_migrations(conn: &mut PgConnection) -> Result<usize, PersistenceError> {
    conn.run_pending_migrations(MIGRATIONS)
        .map(|applied| applied.len())
        .map_err(|e| PersistenceError::Unknown(format!("migration error: {e}")))
}
