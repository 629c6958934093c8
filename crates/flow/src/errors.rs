// Archivo: errors.rs
// Propósito: definir los errores del motor (`FlowError`), los fallos que
// devuelve la lógica de un flujo (`FlowLogicError`) y el alias Result<T>
// usado por las APIs del crate.
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errores comunes del motor de flujos.
///
/// - `NotFound`: entidad no encontrada.
/// - `Conflict`: conflicto de concurrencia o de estado.
/// - `Storage`: error al acceder al almacenamiento externo.
/// - `Rejected`: admisión rechazada (modo drenaje o shards no propios).
/// - `ConcurrencyViolation`: otra ejecución ya avanzó el checkpoint.
#[derive(Error, Debug)]
pub enum FlowError {
    /// Entidad no encontrada (por ejemplo, flow o checkpoint).
    #[error("No encontrado: {0}")]
    NotFound(String),
    /// Conflicto optimista o de estado.
    #[error("Conflicto: {0}")]
    Conflict(String),
    /// Error genérico de almacenamiento (BD, pool, etc.).
    #[error("Error de almacenamiento: {0}")]
    Storage(String),
    /// Admisión rechazada de forma síncrona al que envía el flujo.
    #[error("Rechazado: {0}")]
    Rejected(String),
    /// Validación de entrada o configuración.
    #[error("Error de validacion: {0}")]
    Validation(String),
    /// Fallo del códec de estado (serialize/deserialize).
    #[error("Error de codec: {0}")]
    Codec(String),
    /// Fallo del transporte de mensajes. Se reintenta en la capa de
    /// mensajería y nunca cambia el estado del flujo.
    #[error("Error de transporte: {0}")]
    Transport(String),
    /// Escritura de checkpoint con versión obsoleta: la ejecución actual
    /// debe abandonarse.
    #[error("Violacion de concurrencia en flow {0}")]
    ConcurrencyViolation(Uuid),
    /// Otro tipo de error.
    #[error("Otro: {0}")]
    Other(String),
}

impl From<serde_json::Error> for FlowError {
    fn from(e: serde_json::Error) -> Self {
        FlowError::Codec(e.to_string())
    }
}

/// Alias de resultado usado por las APIs del crate.
pub type Result<T> = std::result::Result<T, FlowError>;

/// Fallo producido por la lógica de un flujo dentro de un segmento.
///
/// La variante lleva la clasificación explícita cuando la lógica la conoce;
/// `Other` queda a criterio del hospital.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FlowLogicError {
    #[error("fallo transitorio: {0}")]
    Transient(String),
    #[error("fallo permanente: {0}")]
    Permanent(String),
    #[error("flujo abortado: {0}")]
    Aborted(String),
    /// Mensaje faltante en la secuencia de una sesión dentro del plazo.
    #[error("hueco de secuencia sin resolver en la sesion {session_id}")]
    SessionGap { session_id: Uuid },
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for FlowLogicError {
    fn from(e: serde_json::Error) -> Self {
        FlowLogicError::Other(format!("serializacion: {}", e))
    }
}
