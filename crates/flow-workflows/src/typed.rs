use crate::errors::WorkflowError;
use crate::flow_kind::FlowKind;
use flow::{Continuation, FlowContext, FlowLogic, FlowLogicError, Resume, Suspend};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Clave de la continuación donde vive el estado tipado.
pub const STATE_KEY: &str = "state";

/// Flujo con argumentos y estado tipados.
///
/// `step` recibe el estado deserializado desde la continuación y lo puede
/// modificar; el adaptador lo vuelve a guardar antes de que el motor
/// escriba el checkpoint. Igual que en `FlowLogic`, los efectos externos se
/// piden devolviendo un `Suspend`.
pub trait TypedFlow: Send + Sync + 'static {
  type Args: DeserializeOwned;
  type State: Serialize + DeserializeOwned + Default;

  fn kind(&self) -> FlowKind;

  fn step(&self, ctx: &mut FlowContext<'_>, args: &Self::Args, state: &mut Self::State, resume: Resume) -> Result<Suspend, WorkflowError>;
}

/// Adaptador `TypedFlow` -> `FlowLogic`.
pub struct Typed<F>(pub F);

impl<F: TypedFlow> FlowLogic for Typed<F> {
  fn name(&self) -> &str {
    self.0.kind().logic_name()
  }

  fn step(&self, ctx: &mut FlowContext<'_>, cont: &mut Continuation, resume: Resume) -> Result<Suspend, FlowLogicError> {
    let args: F::Args = serde_json::from_value(ctx.args().clone()).map_err(|e| FlowLogicError::Permanent(format!("argumentos invalidos para {}: {}", self.0.kind(), e)))?;
    let mut state: F::State = cont.get(STATE_KEY)?.unwrap_or_default();
    let suspend = self.0.step(ctx, &args, &mut state, resume)?;
    cont.set(STATE_KEY, &state)?;
    // pc cuenta segmentos ejecutados
    cont.jump(cont.pc + 1);
    Ok(suspend)
  }
}
