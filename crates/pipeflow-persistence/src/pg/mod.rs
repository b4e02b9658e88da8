//! Implementación Postgres (Diesel) de `ExecutionRepository`.
//!
//! Cada registro se guarda como documento JSONB completo más las columnas por
//! las que se filtra u ordena (estado, `position`, attachable, etc.). El
//! change log de estados es append-only con orden total por `seq`
//! (BIGSERIAL), igual que el backend en memoria.
//!
//! Errores transitorios (conflictos de serialización, conexión) se reintentan
//! con un backoff corto antes de subir al worker, que aplica su propia
//! política.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{self, ConnectionManager};
use log::{debug, warn};
use pipeflow_core::{ExecutionRepository, OrchestrationError};
use pipeflow_domain::{Activity, Attachable, Attachment, ExecutionState, Sample, SamplesWorkflowExecution, StateChange,
                      WorkflowExecution};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::config::{init_dotenv, DbConfig};
use crate::error::PersistenceError;
use crate::migrations::run_pending_migrations;
use crate::schema::{activities, attachments, execution_state_changes, samples, samples_workflow_executions,
                    workflow_executions};

/// Alias de tipo para el pool r2d2 de conexiones Postgres.
pub type PgPool = r2d2::Pool<ConnectionManager<PgConnection>>;

/// Proveedor abstracto de conexiones.
///
/// Contrato: devolver una conexión válida o `PersistenceError::TransientIo`.
pub trait ConnectionProvider: Send + Sync + 'static {
    fn connection(&self) -> Result<r2d2::PooledConnection<ConnectionManager<PgConnection>>, PersistenceError>;
}

pub struct PoolProvider {
    pub pool: PgPool,
}

impl ConnectionProvider for PoolProvider {
    fn connection(&self) -> Result<r2d2::PooledConnection<ConnectionManager<PgConnection>>, PersistenceError> {
        self.pool
            .get()
            .map_err(|e| PersistenceError::TransientIo(format!("pool error: {e}")))
    }
}

#[derive(Insertable, Debug)]
#[diesel(table_name = workflow_executions)]
struct ExecutionRow<'a> {
    id: Uuid,
    state: &'a str,
    run_id: Option<&'a str>,
    document: &'a Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = samples_workflow_executions)]
struct JoinRow<'a> {
    id: Uuid,
    workflow_execution_id: Uuid,
    sample_id: Uuid,
    position: i32,
    document: &'a Value,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = samples)]
struct SampleRow<'a> {
    id: Uuid,
    puid: &'a str,
    document: &'a Value,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = attachments)]
struct AttachmentRow<'a> {
    id: Uuid,
    attachable_type: &'a str,
    attachable_id: Uuid,
    created_at: DateTime<Utc>,
    document: &'a Value,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = activities)]
struct ActivityRow<'a> {
    id: Uuid,
    trackable_id: Uuid,
    activity_key: &'a str,
    created_at: DateTime<Utc>,
    document: &'a Value,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = execution_state_changes)]
struct StateChangeRow<'a> {
    workflow_execution_id: Uuid,
    from_state: &'a str,
    to_state: &'a str,
    changed_at: DateTime<Utc>,
}

/// Determina si un error es transitorio (recomendado reintentar con backoff).
fn is_retryable(e: &PersistenceError) -> bool {
    match e {
        PersistenceError::SerializationConflict | PersistenceError::TransientIo(_) => true,
        // Algunos mensajes llegan como Unknown; match por texto sin acoplar a SQLSTATE.
        PersistenceError::Unknown(msg) => {
            let m = msg.to_lowercase();
            m.contains("deadlock detected")
            || m.contains("could not serialize access due to concurrent update")
            || m.contains("terminating connection due to administrator command")
            || m.contains("connection closed")
            || m.contains("connection refused")
            || m.contains("timeout")
        }
        _ => false,
    }
}

/// Retry con backoff lineal corto (15ms, 30ms, 45ms; hasta 3 reintentos).
pub(crate) fn with_retry<F, T>(mut f: F) -> Result<T, PersistenceError>
    where F: FnMut() -> Result<T, PersistenceError>
{
    let mut attempts = 0;
    loop {
        match f() {
            Err(e) if is_retryable(&e) && attempts < 3 => {
                let delay_ms = 15 * ((attempts + 1) as u64);
                warn!("retryable db error attempt={} err={e:?} sleep_ms={delay_ms}", attempts + 1);
                std::thread::sleep(std::time::Duration::from_millis(delay_ms));
                attempts += 1;
            }
            r => return r,
        }
    }
}

fn to_doc<T: Serialize>(value: &T) -> Result<Value, PersistenceError> {
    Ok(serde_json::to_value(value)?)
}

fn from_doc<T: DeserializeOwned>(doc: Value) -> Result<T, PersistenceError> {
    Ok(serde_json::from_value(doc)?)
}

fn position_of(swe: &SamplesWorkflowExecution) -> Result<i32, PersistenceError> {
    i32::try_from(swe.position).map_err(|_| PersistenceError::Document(format!("position {} out of range", swe.position)))
}

fn parse_state(s: &str) -> Result<ExecutionState, PersistenceError> {
    s.parse().map_err(|_| PersistenceError::Document(format!("unknown execution state {s:?}")))
}

fn insert_join(conn: &mut PgConnection, swe: &SamplesWorkflowExecution, doc: &Value) -> Result<(), PersistenceError> {
    let row = JoinRow { id: swe.id,
                        workflow_execution_id: swe.workflow_execution_id,
                        sample_id: swe.sample_id,
                        position: position_of(swe)?,
                        document: doc };
    diesel::insert_into(samples_workflow_executions::table).values(&row)
                                                           .on_conflict(samples_workflow_executions::id)
                                                           .do_update()
                                                           .set((samples_workflow_executions::position.eq(row.position),
                                                                 samples_workflow_executions::document.eq(row.document)))
                                                           .execute(conn)?;
    Ok(())
}

/// Repositorio Postgres con paridad respecto a `InMemoryExecutionRepository`.
pub struct PgExecutionRepository<P: ConnectionProvider> {
    pub provider: P,
}

impl<P: ConnectionProvider> PgExecutionRepository<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    fn run<T, F>(&self, op: &str, mut f: F) -> Result<T, OrchestrationError>
        where F: FnMut(&mut PgConnection) -> Result<T, PersistenceError>
    {
        debug!("{op}:start");
        let result = with_retry(|| {
            let mut conn = self.provider.connection()?;
            f(&mut *conn)
        });
        if let Err(e) = &result {
            warn!("{op}:failed err={e}");
        }
        Ok(result?)
    }
}

impl<P: ConnectionProvider> ExecutionRepository for PgExecutionRepository<P> {
    fn insert_execution(&self,
                        execution: &WorkflowExecution,
                        samples: &[SamplesWorkflowExecution])
                        -> Result<(), OrchestrationError> {
        let doc = to_doc(execution)?;
        let joins = samples.iter()
                           .map(|s| to_doc(s).map(|d| (s, d)))
                           .collect::<Result<Vec<_>, _>>()?;
        self.run("insert_execution", |conn| {
                let row = ExecutionRow { id: execution.id,
                                         state: execution.state.as_str(),
                                         run_id: execution.run_id.as_deref(),
                                         document: &doc,
                                         created_at: execution.created_at,
                                         updated_at: execution.updated_at };
                conn.build_transaction().read_write().run(|tx| {
                                                         diesel::insert_into(workflow_executions::table).values(&row)
                                                                                                        .execute(tx)?;
                                                         for (swe, d) in &joins {
                                                             insert_join(tx, swe, d)?;
                                                         }
                                                         Ok::<(), PersistenceError>(())
                                                     })
            })
    }

    fn get_execution(&self, id: Uuid) -> Result<WorkflowExecution, OrchestrationError> {
        let doc: Option<Value> = self.run("get_execution", |conn| {
                                         Ok(workflow_executions::table.find(id)
                                                                      .select(workflow_executions::document)
                                                                      .first::<Value>(conn)
                                                                      .optional()?)
                                     })?;
        let doc = doc.ok_or_else(|| OrchestrationError::NotFound(format!("workflow execution {id}")))?;
        Ok(from_doc(doc)?)
    }

    fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), OrchestrationError> {
        let doc = to_doc(execution)?;
        self.run("save_execution", |conn| {
                let row = ExecutionRow { id: execution.id,
                                         state: execution.state.as_str(),
                                         run_id: execution.run_id.as_deref(),
                                         document: &doc,
                                         created_at: execution.created_at,
                                         updated_at: execution.updated_at };
                diesel::insert_into(workflow_executions::table).values(&row)
                                                               .on_conflict(workflow_executions::id)
                                                               .do_update()
                                                               .set((workflow_executions::state.eq(row.state),
                                                                     workflow_executions::run_id.eq(row.run_id),
                                                                     workflow_executions::document.eq(row.document),
                                                                     workflow_executions::updated_at.eq(row.updated_at)))
                                                               .execute(conn)?;
                Ok(())
            })
    }

    fn save_execution_if(&self, execution: &WorkflowExecution, expected: ExecutionState) -> Result<bool, OrchestrationError> {
        let doc = to_doc(execution)?;
        let updated = self.run("save_execution_if", |conn| {
                              let target = workflow_executions::table.filter(workflow_executions::id.eq(execution.id))
                                                                     .filter(workflow_executions::state.eq(expected.as_str()));
                              Ok(diesel::update(target).set((workflow_executions::state.eq(execution.state.as_str()),
                                                             workflow_executions::run_id.eq(execution.run_id.as_deref()),
                                                             workflow_executions::document.eq(&doc),
                                                             workflow_executions::updated_at.eq(execution.updated_at)))
                                                       .execute(conn)?)
                          })?;
        if updated == 0 {
            debug!("save_execution_if:conflict execution_id={} expected={expected}", execution.id);
        }
        Ok(updated == 1)
    }

    fn append_state_change(&self, change: &StateChange) -> Result<(), OrchestrationError> {
        self.run("append_state_change", |conn| {
                let row = StateChangeRow { workflow_execution_id: change.execution_id,
                                           from_state: change.from.as_str(),
                                           to_state: change.to.as_str(),
                                           changed_at: change.at };
                diesel::insert_into(execution_state_changes::table).values(&row).execute(conn)?;
                Ok(())
            })
    }

    fn state_changes(&self, execution_id: Uuid) -> Result<Vec<StateChange>, OrchestrationError> {
        let rows: Vec<(String, String, DateTime<Utc>)> = self.run("state_changes", |conn| {
            Ok(execution_state_changes::table.filter(execution_state_changes::workflow_execution_id.eq(execution_id))
                                             .order(execution_state_changes::seq.asc())
                                             .select((execution_state_changes::from_state,
                                                      execution_state_changes::to_state,
                                                      execution_state_changes::changed_at))
                                             .load(conn)?)
        })?;
        let changes = rows.into_iter()
                          .map(|(from, to, at)| {
                              Ok(StateChange { execution_id,
                                               from: parse_state(&from)?,
                                               to: parse_state(&to)?,
                                               at })
                          })
                          .collect::<Result<Vec<_>, PersistenceError>>()?;
        Ok(changes)
    }

    fn samples_workflow_executions(&self, execution_id: Uuid) -> Result<Vec<SamplesWorkflowExecution>, OrchestrationError> {
        let docs: Vec<Value> = self.run("samples_workflow_executions", |conn| {
            Ok(samples_workflow_executions::table.filter(samples_workflow_executions::workflow_execution_id.eq(execution_id))
                                                 .order(samples_workflow_executions::position.asc())
                                                 .select(samples_workflow_executions::document)
                                                 .load(conn)?)
        })?;
        Ok(docs.into_iter().map(from_doc).collect::<Result<Vec<_>, _>>()?)
    }

    fn save_samples_workflow_execution(&self, swe: &SamplesWorkflowExecution) -> Result<(), OrchestrationError> {
        let doc = to_doc(swe)?;
        self.run("save_samples_workflow_execution", |conn| insert_join(conn, swe, &doc))
    }

    fn get_sample(&self, id: Uuid) -> Result<Sample, OrchestrationError> {
        let doc: Option<Value> = self.run("get_sample", |conn| {
                                         Ok(samples::table.find(id)
                                                          .select(samples::document)
                                                          .first::<Value>(conn)
                                                          .optional()?)
                                     })?;
        let doc = doc.ok_or_else(|| OrchestrationError::NotFound(format!("sample {id}")))?;
        Ok(from_doc(doc)?)
    }

    fn save_sample(&self, sample: &Sample) -> Result<(), OrchestrationError> {
        let doc = to_doc(sample)?;
        self.run("save_sample", |conn| {
                let row = SampleRow { id: sample.id,
                                      puid: &sample.puid,
                                      document: &doc };
                diesel::insert_into(samples::table).values(&row)
                                                   .on_conflict(samples::id)
                                                   .do_update()
                                                   .set((samples::puid.eq(row.puid), samples::document.eq(row.document)))
                                                   .execute(conn)?;
                Ok(())
            })
    }

    fn get_attachment(&self, id: Uuid) -> Result<Option<Attachment>, OrchestrationError> {
        let doc: Option<Value> = self.run("get_attachment", |conn| {
                                         Ok(attachments::table.find(id)
                                                              .select(attachments::document)
                                                              .first::<Value>(conn)
                                                              .optional()?)
                                     })?;
        Ok(doc.map(from_doc).transpose()?)
    }

    fn create_attachment(&self, attachment: &Attachment) -> Result<(), OrchestrationError> {
        let doc = to_doc(attachment)?;
        self.run("create_attachment", |conn| {
                let row = AttachmentRow { id: attachment.id,
                                          attachable_type: attachment.attachable.kind.as_str(),
                                          attachable_id: attachment.attachable.id,
                                          created_at: attachment.created_at,
                                          document: &doc };
                diesel::insert_into(attachments::table).values(&row).execute(conn)?;
                Ok(())
            })
    }

    fn attachments_for(&self, attachable: Attachable) -> Result<Vec<Attachment>, OrchestrationError> {
        let docs: Vec<Value> = self.run("attachments_for", |conn| {
                                       Ok(attachments::table.filter(attachments::attachable_type.eq(attachable.kind.as_str()))
                                                            .filter(attachments::attachable_id.eq(attachable.id))
                                                            .select(attachments::document)
                                                            .load(conn)?)
                                   })?;
        let mut out = docs.into_iter().map(from_doc).collect::<Result<Vec<Attachment>, _>>()?;
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.blob.filename.cmp(&b.blob.filename)));
        Ok(out)
    }

    fn create_activity(&self, activity: &Activity) -> Result<(), OrchestrationError> {
        let doc = to_doc(activity)?;
        self.run("create_activity", |conn| {
                let row = ActivityRow { id: activity.id,
                                        trackable_id: activity.trackable_id,
                                        activity_key: &activity.key,
                                        created_at: activity.created_at,
                                        document: &doc };
                diesel::insert_into(activities::table).values(&row).execute(conn)?;
                Ok(())
            })
    }

    fn activities_for(&self, trackable_id: Uuid) -> Result<Vec<Activity>, OrchestrationError> {
        let docs: Vec<Value> = self.run("activities_for", |conn| {
                                       Ok(activities::table.filter(activities::trackable_id.eq(trackable_id))
                                                           .order(activities::created_at.asc())
                                                           .select(activities::document)
                                                           .load(conn)?)
                                   })?;
        Ok(docs.into_iter().map(from_doc).collect::<Result<Vec<_>, _>>()?)
    }
}

/// Construye un pool Postgres r2d2 y corre las migraciones pendientes.
///
/// Si `min_size > max_size` se usa `min_size = max_size`; tamaños 0 se
/// llevan a 1.
pub fn build_pool(database_url: &str, min_size: u32, max_size: u32) -> Result<PgPool, PersistenceError> {
    let validated_min = min_size.max(1);
    let validated_max = max_size.max(1);
    if validated_min > validated_max {
        warn!("min_size > max_size ({validated_min} > {validated_max}), ajustando min=max");
    }
    let final_min = validated_min.min(validated_max);
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    let pool = r2d2::Pool::builder().min_idle(Some(final_min))
                                    .max_size(validated_max)
                                    .build(manager)
                                    .map_err(|e| PersistenceError::TransientIo(format!("pool build: {e}")))?;
    {
        let mut conn = pool.get()
                           .map_err(|e| PersistenceError::TransientIo(format!("pool get for migrations: {e}")))?;
        let applied = run_pending_migrations(&mut conn)?;
        debug!("migrations applied count={applied}");
    }
    Ok(pool)
}

/// Carga `.env`, lee `DbConfig` y construye un pool ya migrado.
pub fn build_dev_pool_from_env() -> Result<PgPool, PersistenceError> {
    init_dotenv();
    let cfg = DbConfig::from_env()?;
    build_pool(&cfg.url, cfg.min_connections, cfg.max_connections)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retried() {
        assert!(is_retryable(&PersistenceError::SerializationConflict));
        assert!(is_retryable(&PersistenceError::Unknown("Deadlock detected".into())));
        assert!(!is_retryable(&PersistenceError::NotFound));
        assert!(!is_retryable(&PersistenceError::UniqueViolation("dup".into())));
    }

    #[test]
    fn with_retry_gives_up_after_three_retries() {
        let mut calls = 0;
        let r: Result<(), _> = with_retry(|| {
            calls += 1;
            Err(PersistenceError::TransientIo("pool".into()))
        });
        assert!(r.is_err());
        assert_eq!(calls, 4);
    }

    #[test]
    fn persistence_errors_map_to_orchestration_classes() {
        let e: OrchestrationError = PersistenceError::TransientIo("x".into()).into();
        assert!(matches!(e, OrchestrationError::Repository(_)));
        let e: OrchestrationError = PersistenceError::NotFound.into();
        assert!(matches!(e, OrchestrationError::NotFound(_)));
    }
}
