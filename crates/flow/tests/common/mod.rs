// Lógicas de prueba y arnés compartido por los tests de integración.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use chrono::Duration;
use flow::{Continuation, FlowContext, FlowDescriptor, FlowLogic, FlowLogicError, FlowRegistry, FlowSupervisor, InMemoryCheckpointStore, RecordingTransport, Resume, SessionId, Suspend, SupervisorConfig};
use serde_json::json;

/// Abre sesión, envía un ping, espera la respuesta (con plazo opcional
/// `timeout_ms`) y completa con ella.
pub struct PingLogic;

impl FlowLogic for PingLogic {
  fn name(&self) -> &str {
    "test.ping"
  }

  fn step(&self, ctx: &mut FlowContext<'_>, cont: &mut Continuation, resume: Resume) -> Result<Suspend, FlowLogicError> {
    match (cont.pc, resume) {
      (0, Resume::Start) => {
        let counterparty = ctx.args()["counterparty"].as_str().unwrap_or("bob").to_string();
        let session = ctx.open_session(counterparty);
        cont.set("session", &session)?;
        cont.jump(1);
        Ok(Suspend::Send { session_id: session,
                           payload: json!({"ping": 1}) })
      }
      (1, Resume::Sent) => {
        let session: SessionId = cont.get("session")?.ok_or_else(|| FlowLogicError::Permanent("sin sesion".into()))?;
        let deadline = ctx.args().get("timeout_ms").and_then(|v| v.as_i64()).map(|ms| ctx.now() + Duration::milliseconds(ms));
        cont.jump(2);
        Ok(Suspend::Receive { session_id: session,
                              deadline })
      }
      (2, Resume::Message { payload, .. }) => Ok(Suspend::Complete { result: json!({"reply": payload}) }),
      (2, Resume::Timeout { .. }) => Ok(Suspend::Complete { result: json!({"timed_out": true}) }),
      (_, Resume::SessionError { error, .. }) => Err(error),
      (pc, other) => Err(FlowLogicError::Permanent(format!("pc {} inesperado con {:?}", pc, other))),
    }
  }
}

/// Falla con error transitorio las primeras `failures` ejecuciones.
pub struct FlakyLogic {
  pub executions: Arc<AtomicU32>,
  pub failures: u32,
}

impl FlowLogic for FlakyLogic {
  fn name(&self) -> &str {
    "test.flaky"
  }

  fn step(&self, _ctx: &mut FlowContext<'_>, _cont: &mut Continuation, _resume: Resume) -> Result<Suspend, FlowLogicError> {
    let n = self.executions.fetch_add(1, Ordering::SeqCst) + 1;
    if n <= self.failures {
      return Err(FlowLogicError::Transient(format!("servicio no disponible (ejecucion {})", n)));
    }
    Ok(Suspend::Complete { result: json!({"executions": n}) })
  }
}

/// Siempre falla con error permanente.
pub struct DoomedLogic {
  pub executions: Arc<AtomicU32>,
}

impl FlowLogic for DoomedLogic {
  fn name(&self) -> &str {
    "test.doomed"
  }

  fn step(&self, _ctx: &mut FlowContext<'_>, _cont: &mut Continuation, _resume: Resume) -> Result<Suspend, FlowLogicError> {
    self.executions.fetch_add(1, Ordering::SeqCst);
    Err(FlowLogicError::Permanent("entrada invalida".into()))
  }
}

/// Falla con un error sin clasificar mientras `broken` sea true.
pub struct MysteryLogic {
  pub broken: Arc<AtomicBool>,
}

impl FlowLogic for MysteryLogic {
  fn name(&self) -> &str {
    "test.mystery"
  }

  fn step(&self, _ctx: &mut FlowContext<'_>, _cont: &mut Continuation, _resume: Resume) -> Result<Suspend, FlowLogicError> {
    if self.broken.load(Ordering::SeqCst) {
      return Err(FlowLogicError::Other("algo raro".into()));
    }
    Ok(Suspend::Complete { result: json!("curado") })
  }
}

/// Duerme `delay_ms` y completa.
pub struct SleepLogic;

impl FlowLogic for SleepLogic {
  fn name(&self) -> &str {
    "test.sleep"
  }

  fn step(&self, ctx: &mut FlowContext<'_>, cont: &mut Continuation, resume: Resume) -> Result<Suspend, FlowLogicError> {
    match (cont.pc, resume) {
      (0, Resume::Start) => {
        let delay = ctx.args()["delay_ms"].as_i64().unwrap_or(1_000);
        cont.jump(1);
        Ok(Suspend::Sleep { until: ctx.now() + Duration::milliseconds(delay) })
      }
      (1, Resume::Woke) => Ok(Suspend::Complete { result: json!({"slept": true}) }),
      (pc, other) => Err(FlowLogicError::Permanent(format!("pc {} inesperado con {:?}", pc, other))),
    }
  }
}

/// Completa de inmediato con `args.value`.
pub struct ConstantLogic;

impl FlowLogic for ConstantLogic {
  fn name(&self) -> &str {
    "test.constant"
  }

  fn step(&self, ctx: &mut FlowContext<'_>, _cont: &mut Continuation, _resume: Resume) -> Result<Suspend, FlowLogicError> {
    Ok(Suspend::Complete { result: ctx.args()["value"].clone() })
  }
}

/// Lanza `args.child` como subflujo y completa con su resultado.
pub struct ParentLogic;

impl FlowLogic for ParentLogic {
  fn name(&self) -> &str {
    "test.parent"
  }

  fn step(&self, ctx: &mut FlowContext<'_>, cont: &mut Continuation, resume: Resume) -> Result<Suspend, FlowLogicError> {
    match (cont.pc, resume) {
      (0, Resume::Start) => {
        let descriptor: FlowDescriptor = serde_json::from_value(ctx.args()["child"].clone())?;
        cont.jump(1);
        Ok(Suspend::SubFlow { descriptor })
      }
      (1, Resume::SubFlowFinished { flow_id, status, result, error }) => {
        Ok(Suspend::Complete { result: json!({"child": flow_id, "status": status, "result": result, "error": error}) })
      }
      (pc, other) => Err(FlowLogicError::Permanent(format!("pc {} inesperado con {:?}", pc, other))),
    }
  }
}

pub struct Counters {
  pub flaky: Arc<AtomicU32>,
  pub doomed: Arc<AtomicU32>,
  pub broken: Arc<AtomicBool>,
}

pub fn registry(flaky_failures: u32) -> (FlowRegistry, Counters) {
  let counters = Counters { flaky: Arc::new(AtomicU32::new(0)),
                            doomed: Arc::new(AtomicU32::new(0)),
                            broken: Arc::new(AtomicBool::new(true)) };
  let mut registry = FlowRegistry::new();
  registry.register(Arc::new(PingLogic))
          .register(Arc::new(FlakyLogic { executions: counters.flaky.clone(),
                                          failures: flaky_failures }))
          .register(Arc::new(DoomedLogic { executions: counters.doomed.clone() }))
          .register(Arc::new(MysteryLogic { broken: counters.broken.clone() }))
          .register(Arc::new(SleepLogic))
          .register(Arc::new(ConstantLogic))
          .register(Arc::new(ParentLogic));
  (registry, counters)
}

/// Reintentos inmediatos para no depender del reloj.
pub fn fast_config() -> SupervisorConfig {
  SupervisorConfig { retry_base_delay_ms: 0,
                     retry_max_delay_ms: 0,
                     ..SupervisorConfig::default() }
}

pub struct Harness {
  pub store: Arc<InMemoryCheckpointStore>,
  pub transport: Arc<RecordingTransport>,
  pub supervisor: Arc<FlowSupervisor>,
  pub counters: Counters,
}

pub fn harness(config: SupervisorConfig) -> Harness {
  harness_with(config, Arc::new(InMemoryCheckpointStore::new()), Arc::new(RecordingTransport::new()), 2)
}

pub fn harness_with(config: SupervisorConfig,
                    store: Arc<InMemoryCheckpointStore>,
                    transport: Arc<RecordingTransport>,
                    flaky_failures: u32)
                    -> Harness {
  let (registry, counters) = registry(flaky_failures);
  let supervisor = FlowSupervisor::new(config, store.clone(), transport.clone(), Arc::new(registry)).expect("supervisor");
  Harness { store,
            transport,
            supervisor: Arc::new(supervisor),
            counters }
}
