use crate::errors::WorkflowError;
use crate::flow_kind::FlowKind;
use crate::typed::TypedFlow;
use flow::{FlowContext, Resume, SessionId, Suspend};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

/// Intercambio de `rounds` pares petición/respuesta con una contraparte
/// sobre una única sesión.
pub struct PingPongFlow;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingPongArgs {
  pub counterparty: String,
  #[serde(default)]
  pub payload: JsonValue,
  #[serde(default = "default_rounds")]
  pub rounds: u32,
  #[serde(default)]
  pub timeout_ms: Option<u64>,
}

fn default_rounds() -> u32 {
  1
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingPongState {
  pub session: Option<SessionId>,
  pub round: u32,
  pub replies: Vec<JsonValue>,
}

impl PingPongFlow {
  fn ask(ctx: &FlowContext<'_>, args: &PingPongArgs, state: &PingPongState, session: SessionId) -> Suspend {
    Suspend::SendAndReceive { session_id: session,
                              payload: json!({"round": state.round, "payload": args.payload}),
                              deadline: super::deadline_from(ctx.now(), args.timeout_ms) }
  }
}

impl TypedFlow for PingPongFlow {
  type Args = PingPongArgs;
  type State = PingPongState;

  fn kind(&self) -> FlowKind {
    FlowKind::PingPong
  }

  fn step(&self, ctx: &mut FlowContext<'_>, args: &PingPongArgs, state: &mut PingPongState, resume: Resume) -> Result<Suspend, WorkflowError> {
    match resume {
      Resume::Start => {
        let session = ctx.open_session(args.counterparty.as_str());
        state.session = Some(session);
        state.round = 1;
        Ok(Self::ask(ctx, args, state, session))
      }
      Resume::Message { session_id, payload } => {
        if state.session != Some(session_id) {
          return Err(WorkflowError::Validation(format!("respuesta en sesion ajena {}", session_id)));
        }
        state.replies.push(payload);
        if state.round < args.rounds {
          state.round += 1;
          return Ok(Self::ask(ctx, args, state, session_id));
        }
        ctx.close_session(&session_id);
        Ok(Suspend::Complete { result: json!({"counterparty": args.counterparty, "replies": state.replies}) })
      }
      Resume::Timeout { session_id } => {
        ctx.close_session(&session_id);
        Ok(Suspend::Complete { result: json!({"counterparty": args.counterparty,
                                               "replies": state.replies,
                                               "timed_out_in_round": state.round}) })
      }
      Resume::SessionError { error, .. } => Err(error.into()),
      other => Err(WorkflowError::Validation(format!("ping_pong no espera {:?}", other))),
    }
  }
}
