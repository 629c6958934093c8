use crate::errors::WorkflowError;
use crate::flow_kind::FlowKind;
use crate::typed::TypedFlow;
use chrono::{DateTime, Utc};
use flow::{FlowContext, Resume, SessionId, Suspend};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};

/// Envía el mismo mensaje a varias contrapartes, una sesión por cada una,
/// y recoge una respuesta de cada sesión. Las respuestas que llegan antes
/// de tiempo quedan en el buffer de su sesión hasta que el flujo las pide.
pub struct BroadcastFlow;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastArgs {
  pub counterparties: Vec<String>,
  #[serde(default)]
  pub payload: JsonValue,
  /// Plazo común para todas las respuestas, contado desde el último envío.
  #[serde(default)]
  pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BroadcastState {
  pub sessions: Vec<(String, SessionId)>,
  pub sent: usize,
  pub received: usize,
  pub deadline: Option<DateTime<Utc>>,
  pub replies: Map<String, JsonValue>,
}

impl BroadcastState {
  fn awaiting(&self) -> Option<&(String, SessionId)> {
    self.sessions.get(self.received)
  }

  fn next_receive(&self) -> Suspend {
    match self.awaiting() {
      Some((_, session)) => Suspend::Receive { session_id: *session,
                                               deadline: self.deadline },
      None => Suspend::Complete { result: json!({"replies": self.replies}) },
    }
  }
}

impl TypedFlow for BroadcastFlow {
  type Args = BroadcastArgs;
  type State = BroadcastState;

  fn kind(&self) -> FlowKind {
    FlowKind::Broadcast
  }

  fn step(&self, ctx: &mut FlowContext<'_>, args: &BroadcastArgs, state: &mut BroadcastState, resume: Resume) -> Result<Suspend, WorkflowError> {
    match resume {
      Resume::Start => {
        if args.counterparties.is_empty() {
          return Err(WorkflowError::Validation("broadcast sin contrapartes".into()));
        }
        for party in &args.counterparties {
          let session = ctx.open_session(party.as_str());
          state.sessions.push((party.clone(), session));
        }
        let (_, first) = &state.sessions[0];
        Ok(Suspend::Send { session_id: *first,
                           payload: args.payload.clone() })
      }
      Resume::Sent => {
        state.sent += 1;
        if let Some((_, session)) = state.sessions.get(state.sent) {
          return Ok(Suspend::Send { session_id: *session,
                                    payload: args.payload.clone() });
        }
        state.deadline = super::deadline_from(ctx.now(), args.timeout_ms);
        Ok(state.next_receive())
      }
      Resume::Message { session_id, payload } => {
        let (party, expected) = state.awaiting()
                                     .cloned()
                                     .ok_or_else(|| WorkflowError::Validation("broadcast sin respuestas pendientes".into()))?;
        if expected != session_id {
          return Err(WorkflowError::Validation(format!("respuesta de sesion inesperada {}", session_id)));
        }
        ctx.close_session(&session_id);
        state.replies.insert(party, payload);
        state.received += 1;
        Ok(state.next_receive())
      }
      Resume::Timeout { session_id } => {
        // se dejan de esperar todas las que faltan
        log::info!("broadcast: plazo vencido esperando sesion {}", session_id);
        for (party, session) in state.sessions.iter().skip(state.received) {
          ctx.close_session(session);
          state.replies.insert(party.clone(), JsonValue::Null);
        }
        state.received = state.sessions.len();
        Ok(Suspend::Complete { result: json!({"replies": state.replies, "timed_out": true}) })
      }
      Resume::SessionError { error, .. } => Err(error.into()),
      other => Err(WorkflowError::Validation(format!("broadcast no espera {:?}", other))),
    }
  }
}
