use crate::errors::WorkflowError;
use crate::flow_kind::FlowKind;
use crate::typed::TypedFlow;
use flow::{FlowContext, FlowDescriptor, FlowLogicError, FlowStatus, Resume, Suspend};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

/// Ejecuta `children` como subflujos, uno tras otro, y completa con la
/// lista de resultados. Con `fail_fast` un hijo terminado en KILLED aborta
/// al padre.
pub struct OrchestratorFlow;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorArgs {
  pub children: Vec<FlowDescriptor>,
  #[serde(default)]
  pub fail_fast: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildReport {
  pub flow_id: flow::FlowId,
  pub logic: String,
  pub status: FlowStatus,
  pub result: Option<JsonValue>,
  pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorState {
  pub next: usize,
  pub reports: Vec<ChildReport>,
}

impl OrchestratorFlow {
  fn next_child(args: &OrchestratorArgs, state: &OrchestratorState) -> Suspend {
    match args.children.get(state.next) {
      Some(child) => Suspend::SubFlow { descriptor: child.clone() },
      None => Suspend::Complete { result: json!({"children": state.reports}) },
    }
  }
}

impl TypedFlow for OrchestratorFlow {
  type Args = OrchestratorArgs;
  type State = OrchestratorState;

  fn kind(&self) -> FlowKind {
    FlowKind::Orchestrator
  }

  fn step(&self, _ctx: &mut FlowContext<'_>, args: &OrchestratorArgs, state: &mut OrchestratorState, resume: Resume) -> Result<Suspend, WorkflowError> {
    match resume {
      Resume::Start => Ok(Self::next_child(args, state)),
      Resume::SubFlowFinished { flow_id, status, result, error } => {
        let logic = args.children.get(state.next).map(|c| c.logic.clone()).unwrap_or_default();
        state.reports.push(ChildReport { flow_id,
                                         logic: logic.clone(),
                                         status,
                                         result,
                                         error: error.clone() });
        state.next += 1;
        if args.fail_fast && status != FlowStatus::Completed {
          return Err(FlowLogicError::Aborted(format!("subflujo {} ({}) termino en {}: {}",
                                                     flow_id,
                                                     logic,
                                                     status,
                                                     error.unwrap_or_default())).into());
        }
        Ok(Self::next_child(args, state))
      }
      other => Err(WorkflowError::Validation(format!("orchestrator no espera {:?}", other))),
    }
  }
}
