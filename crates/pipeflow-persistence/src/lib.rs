//! pipeflow-persistence
//!
//! Implementación Postgres (Diesel + r2d2) de `ExecutionRepository`, con la
//! misma semántica que el repositorio en memoria del core.
//!
//! Módulos:
//! - `pg`: pool, reintentos ante errores transitorios y el repositorio.
//! - `migrations`: runner embebido de migraciones Diesel.
//! - `config`: carga de configuración desde .env.
//! - `schema`: tablas Diesel declaradas a mano.

pub mod config;
pub mod error;
pub mod migrations;
pub mod pg;
pub mod schema;

pub use config::{init_dotenv, DbConfig};
pub use error::PersistenceError;
pub use pg::{build_dev_pool_from_env, build_pool, ConnectionProvider, PgExecutionRepository, PgPool, PoolProvider};
