//! pipeflow-adapters: implementaciones concretas de los puertos del core.
//!
//! - `LocalFsBlobStore`: Blob Store sobre el filesystem local.
//! - `JsonPipelineRegistry`: registry de pipelines cargado desde un JSON.
//! - `RealtimeDriver`: loop tokio que corre las tareas vencidas de la cola en
//!   tiempo real.

pub mod driver;
pub mod local_fs;
pub mod registry;

pub use driver::{DriverStats, RealtimeDriver};
pub use local_fs::LocalFsBlobStore;
pub use registry::JsonPipelineRegistry;
