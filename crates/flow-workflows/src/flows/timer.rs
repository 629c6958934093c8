use crate::errors::WorkflowError;
use crate::flow_kind::FlowKind;
use crate::typed::TypedFlow;
use chrono::{DateTime, Duration, Utc};
use flow::{FlowContext, Resume, Suspend};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Duerme `delay_ms` y completa. El temporizador sobrevive a reinicios
/// porque el instante de despertar está en el checkpoint.
pub struct TimerFlow;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerArgs {
  #[serde(default)]
  pub delay_ms: u64,
  #[serde(default)]
  pub label: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimerState {
  pub started_at: Option<DateTime<Utc>>,
  pub until: Option<DateTime<Utc>>,
}

impl TypedFlow for TimerFlow {
  type Args = TimerArgs;
  type State = TimerState;

  fn kind(&self) -> FlowKind {
    FlowKind::Timer
  }

  fn step(&self, ctx: &mut FlowContext<'_>, args: &TimerArgs, state: &mut TimerState, resume: Resume) -> Result<Suspend, WorkflowError> {
    match resume {
      Resume::Start => {
        let until = ctx.now() + Duration::milliseconds(args.delay_ms.min(i64::MAX as u64) as i64);
        state.started_at = Some(ctx.now());
        state.until = Some(until);
        Ok(Suspend::Sleep { until })
      }
      Resume::Woke => Ok(Suspend::Complete { result: json!({"label": args.label,
                                                            "started_at": state.started_at,
                                                            "until": state.until,
                                                            "woke_at": ctx.now()}) }),
      other => Err(WorkflowError::Validation(format!("timer no espera {:?}", other))),
    }
  }
}
