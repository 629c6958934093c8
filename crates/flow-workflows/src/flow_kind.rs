use crate::errors::WorkflowError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Flujos incluidos en el crate. El nombre en texto es el que se registra
/// en el `FlowRegistry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
  PingPong,
  Broadcast,
  Timer,
  Orchestrator,
}

impl FlowKind {
  pub const ALL: [FlowKind; 4] = [FlowKind::PingPong, FlowKind::Broadcast, FlowKind::Timer, FlowKind::Orchestrator];

  pub fn logic_name(&self) -> &'static str {
    match self {
      FlowKind::PingPong => "ping_pong",
      FlowKind::Broadcast => "broadcast",
      FlowKind::Timer => "timer",
      FlowKind::Orchestrator => "orchestrator",
    }
  }
}

impl fmt::Display for FlowKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.logic_name())
  }
}

impl FromStr for FlowKind {
  type Err = WorkflowError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let wanted = s.trim().to_lowercase().replace('-', "_");
    FlowKind::ALL.iter()
                 .copied()
                 .find(|k| k.logic_name() == wanted)
                 .ok_or_else(|| WorkflowError::Validation(format!("tipo de flujo desconocido: '{}'", s)))
  }
}
