// Archivo: repository.rs
// Propósito: definir el trait `CheckpointStore`, el contrato que deben
// implementar las persistencias de checkpoints (Diesel/SQLite, Postgres,
// in-memory, etc.).
use crate::domain::{Checkpoint, CheckpointData, FlowId, FlowStatus, PersistResult};
use crate::errors::Result;

/// Almacén durable de checkpoints con escritura condicional por versión.
///
/// Un flujo sin checkpoint tiene versión 0: la primera escritura usa
/// `expected_version = 0` y produce la versión 1. Cada escritura exitosa
/// incrementa la versión exactamente en uno; si la versión almacenada no
/// coincide con `expected_version` la escritura no tiene efecto y devuelve
/// `PersistResult::Conflict`. Una vez que `save` devuelve `Ok` el
/// checkpoint es visible para cualquier `load` posterior, incluso tras un
/// reinicio del proceso.
pub trait CheckpointStore: Send + Sync {
    /// Último checkpoint confirmado del flujo, si existe.
    fn load(&self, flow_id: &FlowId) -> Result<Option<Checkpoint>>;

    /// Compare-and-set atómico respecto de escritores concurrentes.
    fn save(&self, data: &CheckpointData, expected_version: u64) -> Result<PersistResult>;

    /// Elimina el checkpoint (fin del ciclo de vida). Idempotente.
    fn delete(&self, flow_id: &FlowId) -> Result<()>;

    /// Checkpoints cuyo estado está en `statuses`. Se usa en la recuperación
    /// al arrancar y en las consultas de operador.
    fn list_by_status(&self, statuses: &[FlowStatus]) -> Result<Vec<Checkpoint>>;
}
