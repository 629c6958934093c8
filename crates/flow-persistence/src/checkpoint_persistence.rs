use crate::schema;
use crate::schema::checkpoints::dsl as cp_dsl;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use flow::{Checkpoint, CheckpointData, CheckpointStore, FlowError, FlowId, FlowStatus, PersistResult, Result, ShardId};
use std::sync::Arc;
use uuid::Uuid;

#[cfg(not(feature = "pg"))]
pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations/sqlite");
#[cfg(feature = "pg")]
pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations/postgres");
#[cfg(feature = "pg")]
type DbConn = PgConnection;
#[cfg(not(feature = "pg"))]
type DbConn = SqliteConnection;
type DbPool = Pool<ConnectionManager<DbConn>>;

pub const DEFAULT_POOL_SIZE: u32 = 4;
pub const DEFAULT_SQLITE_PATH: &str = "flowstate.db";

/// Ajustes aplicados a cada conexión SQLite que entrega el pool. Sin
/// `busy_timeout` las escrituras concurrentes fallan con SQLITE_BUSY en vez
/// de esperar su turno.
#[cfg(not(feature = "pg"))]
#[derive(Debug, Clone, Copy)]
struct SqlitePragmas {
  busy_timeout_ms: u32,
}
#[cfg(not(feature = "pg"))]
impl diesel::r2d2::CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for SqlitePragmas {
  fn on_acquire(&self, conn: &mut SqliteConnection) -> std::result::Result<(), diesel::r2d2::Error> {
    use diesel::connection::SimpleConnection;
    conn.batch_execute(&format!("PRAGMA busy_timeout = {}; PRAGMA journal_mode = WAL;", self.busy_timeout_ms))
        .map_err(diesel::r2d2::Error::QueryError)
  }
}

/// Store Diesel que implementa `CheckpointStore`.
///
/// La escritura condicional se resuelve en la propia base: la primera
/// versión es un INSERT (clave primaria única) y las siguientes un UPDATE
/// filtrado por la versión esperada. Cero filas afectadas es un conflicto.
pub struct DieselCheckpointStore {
  pool: Arc<DbPool>,
}
impl DieselCheckpointStore {
  pub fn new(database_url: &str) -> Result<Self> {
    Self::with_pool_size(database_url, DEFAULT_POOL_SIZE)
  }
  pub fn with_pool_size(database_url: &str, max_size: u32) -> Result<Self> {
    let manager = ConnectionManager::<DbConn>::new(database_url);
    let builder = Pool::builder().max_size(max_size.max(1));
    #[cfg(not(feature = "pg"))]
    let builder = builder.connection_customizer(Box::new(SqlitePragmas { busy_timeout_ms: 5_000 }));
    let pool = builder.build(manager).map_err(|e| FlowError::Storage(format!("pool: {}", e)))?;
    let store = DieselCheckpointStore { pool: Arc::new(pool) };
    store.migrate()?;
    Ok(store)
  }
  fn migrate(&self) -> Result<()> {
    let mut conn = self.conn()?;
    let applied = conn.run_pending_migrations(MIGRATIONS)
                      .map_err(|e| FlowError::Storage(format!("migraciones: {}", e)))?
                      .len();
    if applied > 0 {
      log::info!("flow-persistence: {} migraciones aplicadas", applied);
    }
    Ok(())
  }
  fn conn(&self) -> Result<PooledConnection<ConnectionManager<DbConn>>> {
    self.pool.get().map_err(|e| FlowError::Storage(format!("pool: {}", e)))
  }
  /// Número de checkpoints guardados.
  pub fn count(&self) -> Result<u64> {
    let mut conn = self.conn()?;
    let n: i64 = map_db_err(cp_dsl::checkpoints.count().get_result(&mut conn))?;
    Ok(n.max(0) as u64)
  }
  /// Checkpoints de un shard, para inspección durante un rebalanceo.
  pub fn list_by_shard(&self, shard: &ShardId) -> Result<Vec<Checkpoint>> {
    let mut conn = self.conn()?;
    let rows = map_db_err(cp_dsl::checkpoints.filter(cp_dsl::shard.eq(shard.as_str()))
                                             .order(cp_dsl::updated_at_ts.asc())
                                             .load::<CheckpointRow>(&mut conn))?;
    rows.into_iter().map(CheckpointRow::into_checkpoint).collect()
  }
}
#[derive(Debug, Queryable, Insertable)]
#[diesel(table_name = schema::checkpoints)]
struct CheckpointRow {
  pub flow_id: String,
  pub version: i64,
  pub status: String,
  pub shard: String,
  pub state: Vec<u8>,
  pub created_at_ts: i64,
  pub updated_at_ts: i64,
}
impl CheckpointRow {
  fn into_checkpoint(self) -> Result<Checkpoint> {
    let flow_id = Uuid::parse_str(&self.flow_id).map_err(|e| FlowError::Storage(format!("flow_id invalido '{}': {}", self.flow_id, e)))?;
    let version = u64::try_from(self.version).map_err(|_| FlowError::Storage(format!("version negativa en flow {}", flow_id)))?;
    Ok(Checkpoint { flow_id,
                    version,
                    shard: ShardId::parse(&self.shard, self.shard.len())?,
                    status: self.status.parse::<FlowStatus>()?,
                    state: self.state,
                    created_at: from_millis(self.created_at_ts)?,
                    updated_at: from_millis(self.updated_at_ts)? })
  }
}
fn from_millis(ts: i64) -> Result<DateTime<Utc>> {
  DateTime::from_timestamp_millis(ts).ok_or_else(|| FlowError::Storage(format!("timestamp fuera de rango: {}", ts)))
}
fn to_db_version(v: u64) -> Result<i64> {
  i64::try_from(v).map_err(|_| FlowError::Storage(format!("version {} fuera de rango", v)))
}
fn map_db_err<T>(res: std::result::Result<T, DieselError>) -> Result<T> {
  res.map_err(|e| FlowError::Storage(format!("db: {}", e)))
}
impl CheckpointStore for DieselCheckpointStore {
  fn load(&self, flow_id: &FlowId) -> Result<Option<Checkpoint>> {
    let mut conn = self.conn()?;
    let row = map_db_err(cp_dsl::checkpoints.filter(cp_dsl::flow_id.eq(flow_id.to_string()))
                                            .first::<CheckpointRow>(&mut conn)
                                            .optional())?;
    row.map(CheckpointRow::into_checkpoint).transpose()
  }
  fn save(&self, data: &CheckpointData, expected_version: u64) -> Result<PersistResult> {
    let mut conn = self.conn()?;
    let now = Utc::now().timestamp_millis();
    let id_s = data.flow_id.to_string();
    let new_version = expected_version + 1;
    if expected_version == 0 {
      let row = CheckpointRow { flow_id: id_s,
                                version: to_db_version(new_version)?,
                                status: data.status.as_str().to_string(),
                                shard: data.shard.as_str().to_string(),
                                state: data.state.clone(),
                                created_at_ts: now,
                                updated_at_ts: now };
      match diesel::insert_into(cp_dsl::checkpoints).values(&row).execute(&mut conn) {
        Ok(_) => {}
        Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
          log::debug!("flow-persistence: flow {} ya existe, conflicto en v0", data.flow_id);
          return Ok(PersistResult::Conflict);
        }
        Err(e) => return map_db_err(Err(e)),
      }
    } else {
      let updated =
        map_db_err(diesel::update(cp_dsl::checkpoints.filter(cp_dsl::flow_id.eq(&id_s))
                                                     .filter(cp_dsl::version.eq(to_db_version(expected_version)?)))
                   .set((cp_dsl::version.eq(to_db_version(new_version)?),
                         cp_dsl::status.eq(data.status.as_str()),
                         cp_dsl::shard.eq(data.shard.as_str()),
                         cp_dsl::state.eq(data.state.as_slice()),
                         cp_dsl::updated_at_ts.eq(now)))
                   .execute(&mut conn))?;
      if updated == 0 {
        log::debug!("flow-persistence: conflicto en flow {} (esperada v{})", data.flow_id, expected_version);
        return Ok(PersistResult::Conflict);
      }
    }
    Ok(PersistResult::Ok { new_version })
  }
  fn delete(&self, flow_id: &FlowId) -> Result<()> {
    let mut conn = self.conn()?;
    map_db_err(diesel::delete(cp_dsl::checkpoints.filter(cp_dsl::flow_id.eq(flow_id.to_string()))).execute(&mut conn))?;
    Ok(())
  }
  fn list_by_status(&self, statuses: &[FlowStatus]) -> Result<Vec<Checkpoint>> {
    if statuses.is_empty() {
      return Ok(Vec::new());
    }
    let mut conn = self.conn()?;
    let names: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
    let rows = map_db_err(cp_dsl::checkpoints.filter(cp_dsl::status.eq_any(names))
                                             .order(cp_dsl::updated_at_ts.asc())
                                             .load::<CheckpointRow>(&mut conn))?;
    rows.into_iter().map(CheckpointRow::into_checkpoint).collect()
  }
}
/// Crea el store desde el entorno. Con `pg` exige `FLOW_DB_URL` o
/// `DATABASE_URL` apuntando a Postgres.
#[cfg(feature = "pg")]
pub fn new_from_env() -> Result<DieselCheckpointStore> {
  dotenvy::dotenv().ok();
  let url = std::env::var("FLOW_DB_URL").or_else(|_| std::env::var("DATABASE_URL"))
                                        .map_err(|_| FlowError::Validation("FLOW_DB_URL / DATABASE_URL no definido".into()))?;
  if !looks_like_postgres(&url) {
    return Err(FlowError::Validation("FLOW_DB_URL / DATABASE_URL no parece una URL de Postgres".into()));
  }
  DieselCheckpointStore::with_pool_size(&url, pool_size_from_env())
}
/// Crea el store desde el entorno: `FLOW_DB_URL`, luego `DATABASE_URL` y,
/// sin ninguna, el fichero SQLite local `flowstate.db`.
#[cfg(not(feature = "pg"))]
pub fn new_from_env() -> Result<DieselCheckpointStore> {
  dotenvy::dotenv().ok();
  let url = std::env::var("FLOW_DB_URL").or_else(|_| std::env::var("DATABASE_URL"))
                                        .unwrap_or_else(|_| DEFAULT_SQLITE_PATH.to_string());
  if looks_like_postgres(&url) {
    return Err(FlowError::Validation("flow-persistence se compilo sin la feature 'pg'; habilitela para usar Postgres".into()));
  }
  DieselCheckpointStore::with_pool_size(&url, pool_size_from_env())
}
fn looks_like_postgres(url: &str) -> bool {
  let l = url.to_lowercase();
  l.starts_with("postgres://") || l.starts_with("postgresql://")
}
fn pool_size_from_env() -> u32 {
  std::env::var("FLOW_DB_POOL_SIZE").ok()
                                    .and_then(|v| v.trim().parse().ok())
                                    .unwrap_or(DEFAULT_POOL_SIZE)
}
