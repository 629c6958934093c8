// Archivo: transport.rs
// Propósito: contrato del transporte de mensajes entre flujos y
// contrapartes.
use crate::domain::{CounterpartyId, MessageEnvelope, MessageIdentifier};
use crate::errors::Result;

/// Transporte con entrega al-menos-una-vez. Los receptores deduplican por
/// `(session_id, sequence_number)`.
pub trait MessageTransport: Send + Sync {
    /// Envía un sobre. Un error se traduce en `FlowError::Transport` y se
    /// reintenta sin alterar el estado del flujo.
    fn send(&self, to: &CounterpartyId, envelope: &MessageEnvelope) -> Result<()>;

    /// Confirma un mensaje entrante una vez que el checkpoint que lo
    /// consumió (o lo descartó) está confirmado.
    fn acknowledge(&self, _id: &MessageIdentifier) {}
}
