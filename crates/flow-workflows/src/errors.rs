use flow::{FlowError, FlowLogicError};
use thiserror::Error;

// Errores de las lógicas de flujo incluidas.
//
// Los flujos devuelven `WorkflowError`; el adaptador `Typed` lo convierte en
// `FlowLogicError` para que el hospital decida qué hacer con él.
#[derive(Error, Debug)]
pub enum WorkflowError {
  /// Errores originados por el motor (`flow` crate).
  #[error("Error de flujo: {0}")]
  Flow(#[from] FlowError),

  /// Errores de serializacion/deserializacion JSON del estado o los
  /// argumentos.
  #[error("Error de serializacion: {0}")]
  Serialization(#[from] serde_json::Error),

  /// Argumentos o transiciones invalidas.
  #[error("Error de validacion: {0}")]
  Validation(String),

  /// Fallo ya clasificado que se propaga tal cual (por ejemplo un hueco de
  /// secuencia en una sesion).
  #[error("{0}")]
  Logic(#[from] FlowLogicError),

  #[error("Otro error: {0}")]
  Other(String),
}

impl From<WorkflowError> for FlowLogicError {
  fn from(e: WorkflowError) -> Self {
    match e {
      WorkflowError::Logic(inner) => inner,
      WorkflowError::Flow(FlowError::Transport(m)) | WorkflowError::Flow(FlowError::Storage(m)) => FlowLogicError::Transient(m),
      WorkflowError::Serialization(err) => FlowLogicError::Permanent(format!("estado o argumentos ilegibles: {}", err)),
      WorkflowError::Validation(m) => FlowLogicError::Permanent(m),
      other => FlowLogicError::Other(other.to_string()),
    }
  }
}
