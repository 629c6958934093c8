// Archivo: logic.rs
// Propósito: contrato de la lógica de un flujo escrita como intérprete de
// continuaciones. Cada llamada a `step` ejecuta un segmento hasta el
// siguiente punto de suspensión y devuelve qué espera el flujo.
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::domain::{CounterpartyId, FlowId, FlowStatus, Session, SessionId, SessionState};
use crate::errors::FlowLogicError;
use crate::registry::FlowDescriptor;

/// Estado explícito de la continuación: contador de programa y variables
/// locales serializables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Continuation {
    pub pc: u32,
    #[serde(default)]
    pub locals: Map<String, JsonValue>,
}

impl Continuation {
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, FlowLogicError> {
        match self.locals.get(key) {
            Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
            None => Ok(None),
        }
    }

    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), FlowLogicError> {
        self.locals.insert(key.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn jump(&mut self, pc: u32) {
        self.pc = pc;
    }
}

/// Valor con el que se reanuda un flujo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Resume {
    Start,
    /// El envío solicitado quedó confirmado en el checkpoint.
    Sent,
    Message { session_id: SessionId, payload: JsonValue },
    /// Venció el plazo de espera de un mensaje.
    Timeout { session_id: SessionId },
    Woke,
    SubFlowFinished { flow_id: FlowId, status: FlowStatus, result: Option<JsonValue>, error: Option<String> },
    SessionError { session_id: SessionId, error: FlowLogicError },
}

/// Punto de suspensión solicitado por la lógica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Suspend {
    Send { session_id: SessionId, payload: JsonValue },
    Receive { session_id: SessionId, deadline: Option<DateTime<Utc>> },
    SendAndReceive { session_id: SessionId, payload: JsonValue, deadline: Option<DateTime<Utc>> },
    Sleep { until: DateTime<Utc> },
    SubFlow { descriptor: FlowDescriptor },
    Complete { result: JsonValue },
}

/// Vista que el motor entrega a la lógica durante un segmento.
pub struct FlowContext<'a> {
    flow_id: FlowId,
    now: DateTime<Utc>,
    args: &'a JsonValue,
    sessions: &'a mut Vec<Session>,
}

impl<'a> FlowContext<'a> {
    pub(crate) fn new(flow_id: FlowId, now: DateTime<Utc>, args: &'a JsonValue, sessions: &'a mut Vec<Session>) -> Self {
        Self { flow_id,
               now,
               args,
               sessions }
    }

    pub fn flow_id(&self) -> FlowId {
        self.flow_id
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn args(&self) -> &JsonValue {
        self.args
    }

    /// Abre una sesión nueva; queda registrada en el próximo checkpoint.
    pub fn open_session(&mut self, counterparty: impl Into<CounterpartyId>) -> SessionId {
        let session = Session::new(self.flow_id, counterparty.into());
        let id = session.session_id;
        self.sessions.push(session);
        id
    }

    pub fn counterparty(&self, session_id: &SessionId) -> Option<&CounterpartyId> {
        self.sessions.iter().find(|s| &s.session_id == session_id).map(|s| &s.counterparty)
    }

    /// Cierra una sesión; los mensajes que lleguen después se descartan.
    pub fn close_session(&mut self, session_id: &SessionId) -> bool {
        match self.sessions.iter_mut().find(|s| &s.session_id == session_id) {
            Some(s) => {
                s.state = SessionState::Closed;
                true
            }
            None => false,
        }
    }

    pub fn sessions(&self) -> &[Session] {
        self.sessions
    }
}

/// Lógica de un flujo registrada bajo un nombre estable.
///
/// `step` no debe producir efectos externos por su cuenta: envíos, esperas
/// y subflujos se piden devolviendo un [`Suspend`] y el motor los ejecuta
/// después de confirmar el checkpoint.
pub trait FlowLogic: Send + Sync {
    fn name(&self) -> &str;

    fn step(&self, ctx: &mut FlowContext<'_>, cont: &mut Continuation, resume: Resume) -> Result<Suspend, FlowLogicError>;
}
