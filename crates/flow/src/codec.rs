// Archivo: codec.rs
// Propósito: serialización del estado de un flujo hacia/desde los bytes
// opacos del checkpoint.
use crate::engine::FlowInstance;
use crate::errors::{FlowError, Result};

/// Códec de estado enchufable. Debe ser estable entre versiones del
/// binario para que un checkpoint escrito antes de un reinicio se pueda
/// leer después.
pub trait StateCodec: Send + Sync {
    fn encode(&self, instance: &FlowInstance) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<FlowInstance>;
}

/// Códec por defecto: JSON vía serde.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonStateCodec;

impl StateCodec for JsonStateCodec {
    fn encode(&self, instance: &FlowInstance) -> Result<Vec<u8>> {
        serde_json::to_vec(instance).map_err(|e| FlowError::Codec(format!("encode {}: {}", instance.flow_id, e)))
    }

    fn decode(&self, bytes: &[u8]) -> Result<FlowInstance> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
