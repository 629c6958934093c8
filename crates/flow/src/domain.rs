// Archivo: domain.rs
// Propósito: tipos de datos del motor: estados de un flujo, checkpoints,
// sesiones, identificadores de mensaje y el registro de fallos.
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::errors::{FlowError, FlowLogicError};
use crate::shard::ShardId;

pub type FlowId = Uuid;
pub type SessionId = Uuid;

/// Identidad opaca de la contraparte de una sesión (otro nodo/servicio).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CounterpartyId(pub String);

impl fmt::Display for CounterpartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CounterpartyId {
    fn from(s: &str) -> Self {
        CounterpartyId(s.to_string())
    }
}

impl From<String> for CounterpartyId {
    fn from(s: String) -> Self {
        CounterpartyId(s)
    }
}

/// Estado del ciclo de vida de un flujo.
///
/// `Completed` y `Killed` son terminales. `Hospitalized` no se reanuda sin
/// intervención explícita.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowStatus {
    Created,
    Running,
    Suspended,
    Completed,
    Failed,
    Hospitalized,
    Killed,
}

impl FlowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowStatus::Created => "CREATED",
            FlowStatus::Running => "RUNNING",
            FlowStatus::Suspended => "SUSPENDED",
            FlowStatus::Completed => "COMPLETED",
            FlowStatus::Failed => "FAILED",
            FlowStatus::Hospitalized => "HOSPITALIZED",
            FlowStatus::Killed => "KILLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowStatus::Completed | FlowStatus::Killed)
    }

    /// Estados que el supervisor reanuda al arrancar.
    pub fn is_resumable(&self) -> bool {
        matches!(self, FlowStatus::Running | FlowStatus::Suspended)
    }
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlowStatus {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CREATED" => Ok(FlowStatus::Created),
            "RUNNING" => Ok(FlowStatus::Running),
            "SUSPENDED" => Ok(FlowStatus::Suspended),
            "COMPLETED" => Ok(FlowStatus::Completed),
            "FAILED" => Ok(FlowStatus::Failed),
            "HOSPITALIZED" => Ok(FlowStatus::Hospitalized),
            "KILLED" => Ok(FlowStatus::Killed),
            other => Err(FlowError::Validation(format!("estado de flujo desconocido: {}", other))),
        }
    }
}

/// Resultado de persistir con control optimista.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistResult {
    /// Persistido correctamente; devuelve la nueva versión.
    Ok { new_version: u64 },
    /// Conflicto de versión: `expected_version` no coincide.
    Conflict,
}

/// Nuevo estado que se entrega al store en cada `save`.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointData {
    pub flow_id: FlowId,
    pub shard: ShardId,
    pub status: FlowStatus,
    pub state: Vec<u8>,
}

/// Registro durable de un flujo. `version` crece en uno por cada escritura
/// y un checkpoint ausente equivale a la versión 0.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub flow_id: FlowId,
    pub version: u64,
    pub shard: ShardId,
    pub status: FlowStatus,
    pub state: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Initiating,
    Open,
    Closed,
}

/// Canal de mensajes de un flujo con una contraparte.
///
/// `next_send_seq` es la próxima secuencia a asignar (empieza en 1) y
/// `last_received_seq` la última consumida (0 si ninguna).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub flow_id: FlowId,
    pub counterparty: CounterpartyId,
    pub state: SessionState,
    pub next_send_seq: u64,
    pub last_received_seq: u64,
}

impl Session {
    pub fn new(flow_id: FlowId, counterparty: CounterpartyId) -> Self {
        Self { session_id: Uuid::new_v4(),
               flow_id,
               counterparty,
               state: SessionState::Initiating,
               next_send_seq: 1,
               last_received_seq: 0 }
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }
}

/// Identidad de deduplicación de un mensaje.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageIdentifier {
    pub flow_id: FlowId,
    pub session_id: SessionId,
    pub sequence_number: u64,
    pub shard_prefix: ShardId,
}

impl fmt::Display for MessageIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}#{}", self.shard_prefix, self.flow_id, self.session_id, self.sequence_number)
    }
}

/// Sobre de mensaje tal como viaja por el transporte.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    #[serde(flatten)]
    pub id: MessageIdentifier,
    pub payload: JsonValue,
}

impl MessageEnvelope {
    /// Construye una respuesta en la misma sesión con la secuencia propia
    /// de la contraparte.
    pub fn reply(&self, sequence_number: u64, payload: JsonValue) -> MessageEnvelope {
        MessageEnvelope { id: MessageIdentifier { sequence_number,
                                                  ..self.id.clone() },
                          payload }
    }
}

/// Mensaje saliente pendiente de entrega. Forma parte del checkpoint y se
/// reenvía tal cual tras un reinicio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outbound {
    pub to: CounterpartyId,
    pub envelope: MessageEnvelope,
}

/// Clasificación de un fallo por el hospital.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    Transient,
    Permanent,
    Unknown,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Classification::Transient => "TRANSIENT",
            Classification::Permanent => "PERMANENT",
            Classification::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Fallo de un segmento entregado al hospital.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowFailure {
    pub flow_id: FlowId,
    pub cause: FlowLogicError,
    pub attempt: u32,
    pub classification: Classification,
}

/// Nota del último fallo guardada dentro del estado del flujo, visible para
/// los operadores cuando queda hospitalizado.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureNote {
    pub cause: String,
    pub attempt: u32,
    pub classification: Classification,
    pub at: DateTime<Utc>,
}

impl FailureNote {
    pub fn from_failure(failure: &FlowFailure, at: DateTime<Utc>) -> Self {
        Self { cause: failure.cause.to_string(),
               attempt: failure.attempt,
               classification: failure.classification,
               at }
    }
}
