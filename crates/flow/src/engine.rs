// Archivo: engine.rs
// Propósito: máquina de estados de un flujo. Ejecuta segmentos de la
// lógica entre puntos de suspensión, escribe un checkpoint en cada
// suspensión antes de producir el efecto pedido (envío, espera, subflujo) y
// reanuda a partir del último checkpoint confirmado.
//
// Un flujo reanudado tras un reinicio llega al mismo estado lógico que si
// no se hubiera interrumpido: los envíos pendientes se repiten con la misma
// secuencia y los receptores los deduplican.
use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::codec::StateCodec;
use crate::domain::{Checkpoint, CheckpointData, FailureNote, FlowFailure, FlowId, FlowStatus, MessageIdentifier, Outbound, PersistResult, Session, SessionId, SessionState};
use crate::errors::{FlowError, FlowLogicError, Result};
use crate::logic::{Continuation, FlowContext, Resume, Suspend};
use crate::registry::{FlowDescriptor, FlowRegistry};
use crate::repository::CheckpointStore;
use crate::session::SessionManager;
use crate::shard::{ShardId, ShardRouter};
use crate::transport::MessageTransport;

/// Punto en el que el flujo está detenido, persistido en el checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WaitingOn {
    /// Aún no ejecutó su primer segmento.
    Start,
    /// Pidió un envío; al reanudar continúa con `Resume::Sent`.
    Sent,
    Message { session_id: SessionId, deadline: Option<DateTime<Utc>> },
    Timer { until: DateTime<Utc> },
    SubFlow { child: FlowId, descriptor: FlowDescriptor },
    Finished,
}

/// Estado completo de un flujo tal como se guarda en el checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowInstance {
    pub flow_id: FlowId,
    pub logic: String,
    pub args: JsonValue,
    #[serde(default)]
    pub parent: Option<FlowId>,
    pub continuation: Continuation,
    pub waiting_on: WaitingOn,
    #[serde(default)]
    pub sessions: Vec<Session>,
    #[serde(default)]
    pub pending_sends: Vec<Outbound>,
    /// Checkpoints confirmados por este flujo.
    pub suspend_count: u64,
    #[serde(default)]
    pub last_failure: Option<FailureNote>,
    #[serde(default)]
    pub result: Option<JsonValue>,
    #[serde(default)]
    pub error: Option<String>,
}

impl FlowInstance {
    pub fn new(flow_id: FlowId, descriptor: &FlowDescriptor, parent: Option<FlowId>) -> Self {
        Self { flow_id,
               logic: descriptor.logic.clone(),
               args: descriptor.args.clone(),
               parent,
               continuation: Continuation::default(),
               waiting_on: WaitingOn::Start,
               sessions: Vec::new(),
               pending_sends: Vec::new(),
               suspend_count: 0,
               last_failure: None,
               result: None,
               error: None }
    }

    fn session_mut(&mut self, session_id: &SessionId) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| &s.session_id == session_id)
    }
}

/// Resultado de ejecutar o reanudar un flujo.
#[derive(Debug, Clone, PartialEq)]
pub enum SuspendOutcome {
    Suspended { waiting_on: WaitingOn },
    Completed { result: JsonValue },
    Killed { error: Option<String> },
    /// La lógica falló; el checkpoint sigue en el último punto confirmado.
    Failed { cause: FlowLogicError, suspend_count: u64 },
    Hospitalized,
    /// El checkpoint está en un estado que no se reanuda.
    NotResumable { status: FlowStatus },
    /// Otra ejecución avanzó el checkpoint; esta se descarta.
    Abandoned,
}

/// Peticiones de terminación cooperativa. Se comprueban en cada punto de
/// suspensión.
#[derive(Default)]
pub struct KillSwitch {
    requested: DashMap<FlowId, String>,
}

impl KillSwitch {
    pub fn request(&self, flow_id: FlowId, reason: &str) {
        self.requested.insert(flow_id, reason.to_string());
    }

    pub fn reason(&self, flow_id: &FlowId) -> Option<String> {
        self.requested.get(flow_id).map(|r| r.clone())
    }

    pub fn is_requested(&self, flow_id: &FlowId) -> bool {
        self.requested.contains_key(flow_id)
    }

    pub fn clear(&self, flow_id: &FlowId) {
        self.requested.remove(flow_id);
    }
}

struct Execution {
    instance: FlowInstance,
    version: u64,
    status: FlowStatus,
    shard: ShardId,
    consumed_child: Option<FlowId>,
}

/// Ajustes del motor derivados de la configuración del supervisor.
#[derive(Debug, Clone, Copy)]
pub struct MachineSettings {
    pub send_attempts: u32,
    pub session_gap_timeout: Duration,
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self { send_attempts: 3,
               session_gap_timeout: Duration::milliseconds(30_000) }
    }
}

pub struct FlowStateMachine {
    store: Arc<dyn CheckpointStore>,
    codec: Arc<dyn StateCodec>,
    transport: Arc<dyn MessageTransport>,
    sessions: Arc<SessionManager>,
    registry: Arc<FlowRegistry>,
    router: ShardRouter,
    kills: Arc<KillSwitch>,
    settings: MachineSettings,
    /// Envíos del último checkpoint de cada flujo ya transmitidos por este
    /// proceso.
    transmitted: DashMap<FlowId, HashSet<MessageIdentifier>>,
}

impl FlowStateMachine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(store: Arc<dyn CheckpointStore>,
               codec: Arc<dyn StateCodec>,
               transport: Arc<dyn MessageTransport>,
               sessions: Arc<SessionManager>,
               registry: Arc<FlowRegistry>,
               router: ShardRouter,
               kills: Arc<KillSwitch>,
               settings: MachineSettings)
               -> Self {
        Self { store,
               codec,
               transport,
               sessions,
               registry,
               router,
               kills,
               settings,
               transmitted: DashMap::new() }
    }

    /// Crea el flujo: primer checkpoint (RUNNING, versión 1) y primer
    /// segmento.
    pub fn start(&self, flow_id: FlowId, descriptor: &FlowDescriptor, parent: Option<FlowId>, now: DateTime<Utc>) -> Result<SuspendOutcome> {
        self.registry.logic(&descriptor.logic)?;
        let mut exec = Execution { instance: FlowInstance::new(flow_id, descriptor, parent),
                                   version: 0,
                                   status: FlowStatus::Created,
                                   shard: self.router.shard_of(&flow_id),
                                   consumed_child: None };
        let outcome = self.checkpoint(&mut exec, FlowStatus::Running, now)
                          .and_then(|_| self.run(&mut exec, Resume::Start, now));
        abandon_on_conflict(outcome)
    }

    /// Reanuda desde el último checkpoint. Si el flujo no tiene nada que
    /// hacer todavía devuelve `Suspended` sin escribir.
    pub fn resume(&self, flow_id: FlowId, now: DateTime<Utc>) -> Result<SuspendOutcome> {
        let mut exec = self.load(&flow_id)?
                           .ok_or_else(|| FlowError::NotFound(format!("checkpoint de flow {}", flow_id)))?;
        if !exec.status.is_resumable() {
            return Ok(SuspendOutcome::NotResumable { status: exec.status });
        }
        self.sync_sessions(&exec, now);
        self.flush(&mut exec.instance);
        abandon_on_conflict(self.continue_from_checkpoint(&mut exec, now))
    }

    /// Devuelve un flujo hospitalizado a su estado activo y lo reanuda.
    pub fn readmit(&self, flow_id: FlowId, now: DateTime<Utc>) -> Result<SuspendOutcome> {
        let mut exec = self.load(&flow_id)?
                           .ok_or_else(|| FlowError::NotFound(format!("checkpoint de flow {}", flow_id)))?;
        if exec.status != FlowStatus::Hospitalized {
            return Err(FlowError::Conflict(format!("flow {} no esta hospitalizado ({})", flow_id, exec.status)));
        }
        let back = match exec.instance.waiting_on {
            WaitingOn::Start | WaitingOn::Sent => FlowStatus::Running,
            _ => FlowStatus::Suspended,
        };
        exec.instance.last_failure = None;
        let outcome = self.commit(&mut exec, back, now).and_then(|_| {
                                                            self.flush(&mut exec.instance);
                                                            self.continue_from_checkpoint(&mut exec, now)
                                                        });
        abandon_on_conflict(outcome)
    }

    /// Deja el flujo en HOSPITALIZED con la nota del fallo. No cuenta como
    /// punto de suspensión nuevo.
    pub fn hospitalize(&self, failure: &FlowFailure, now: DateTime<Utc>) -> Result<SuspendOutcome> {
        let flow_id = failure.flow_id;
        let mut exec = self.load(&flow_id)?
                           .ok_or_else(|| FlowError::NotFound(format!("checkpoint de flow {}", flow_id)))?;
        if !exec.status.is_resumable() {
            return Ok(SuspendOutcome::NotResumable { status: exec.status });
        }
        exec.instance.last_failure = Some(FailureNote::from_failure(failure, now));
        let outcome = self.commit(&mut exec, FlowStatus::Hospitalized, now).map(|_| SuspendOutcome::Hospitalized);
        self.sessions.clear_awaiting(&flow_id);
        abandon_on_conflict(outcome)
    }

    /// Termina el flujo en KILLED desde fuera de un segmento (flujo
    /// suspendido u hospitalizado).
    pub fn kill(&self, flow_id: FlowId, reason: &str, now: DateTime<Utc>) -> Result<SuspendOutcome> {
        let mut exec = self.load(&flow_id)?
                           .ok_or_else(|| FlowError::NotFound(format!("checkpoint de flow {}", flow_id)))?;
        if exec.status.is_terminal() {
            return Ok(SuspendOutcome::NotResumable { status: exec.status });
        }
        abandon_on_conflict(self.finish(&mut exec, FlowStatus::Killed, None, Some(reason.to_string()), now))
    }

    /// Checkpoint y estado decodificado, para consultas de operador.
    pub fn inspect(&self, flow_id: &FlowId) -> Result<Option<(Checkpoint, FlowInstance)>> {
        match self.store.load(flow_id)? {
            Some(cp) => {
                let instance = self.codec.decode(&cp.state)?;
                Ok(Some((cp, instance)))
            }
            None => Ok(None),
        }
    }

    pub fn decode(&self, checkpoint: &Checkpoint) -> Result<FlowInstance> {
        self.codec.decode(&checkpoint.state)
    }

    fn load(&self, flow_id: &FlowId) -> Result<Option<Execution>> {
        let Some(cp) = self.store.load(flow_id)? else {
            return Ok(None);
        };
        let instance = self.codec.decode(&cp.state)?;
        Ok(Some(Execution { instance,
                            version: cp.version,
                            status: cp.status,
                            shard: cp.shard,
                            consumed_child: None }))
    }

    fn continue_from_checkpoint(&self, exec: &mut Execution, now: DateTime<Utc>) -> Result<SuspendOutcome> {
        if let Some(reason) = self.kills.reason(&exec.instance.flow_id) {
            return self.finish(exec, FlowStatus::Killed, None, Some(reason), now);
        }
        match self.wake(exec, now)? {
            Some(resume) => self.run(exec, resume, now),
            None => Ok(SuspendOutcome::Suspended { waiting_on: exec.instance.waiting_on.clone() }),
        }
    }

    /// Calcula con qué reanudar según el punto de espera, o `None` si la
    /// condición aún no se cumple. Consumir un mensaje avanza la sesión sólo
    /// en el estado en memoria; se vuelve durable con el siguiente
    /// checkpoint.
    fn wake(&self, exec: &mut Execution, now: DateTime<Utc>) -> Result<Option<Resume>> {
        let waiting = exec.instance.waiting_on.clone();
        let resume = match waiting {
            WaitingOn::Start => Some(Resume::Start),
            WaitingOn::Sent => Some(Resume::Sent),
            WaitingOn::Message { session_id, deadline } => {
                if let Some((seq, payload)) = self.sessions.peek_next(&session_id) {
                    if let Some(s) = exec.instance.session_mut(&session_id) {
                        s.last_received_seq = seq;
                        if s.state == SessionState::Initiating {
                            s.state = SessionState::Open;
                        }
                    }
                    Some(Resume::Message { session_id, payload })
                } else if self.sessions.gap_expired(&session_id, now, self.settings.session_gap_timeout) {
                    Some(Resume::SessionError { session_id,
                                                error: FlowLogicError::SessionGap { session_id } })
                } else if deadline.map(|d| d <= now).unwrap_or(false) {
                    Some(Resume::Timeout { session_id })
                } else {
                    None
                }
            }
            WaitingOn::Timer { until } => (until <= now).then_some(Resume::Woke),
            WaitingOn::SubFlow { child, .. } => match self.store.load(&child)? {
                Some(cp) if cp.status.is_terminal() => {
                    let state = self.codec.decode(&cp.state)?;
                    exec.consumed_child = Some(child);
                    Some(Resume::SubFlowFinished { flow_id: child,
                                                   status: cp.status,
                                                   result: state.result,
                                                   error: state.error })
                }
                _ => None,
            },
            WaitingOn::Finished => None,
        };
        Ok(resume)
    }

    fn run(&self, exec: &mut Execution, first: Resume, now: DateTime<Utc>) -> Result<SuspendOutcome> {
        let logic = self.registry.logic(&exec.instance.logic)?;
        let flow_id = exec.instance.flow_id;
        let mut resume = first;
        loop {
            let step = {
                let inst = &mut exec.instance;
                let mut ctx = FlowContext::new(flow_id, now, &inst.args, &mut inst.sessions);
                logic.step(&mut ctx, &mut inst.continuation, resume)
            };
            let suspend = match step {
                Ok(s) => s,
                Err(cause) => return Ok(self.failed(exec, cause)),
            };

            // punto de suspensión
            if let Some(reason) = self.kills.reason(&flow_id) {
                return self.finish(exec, FlowStatus::Killed, None, Some(reason), now);
            }

            let status = match suspend {
                Suspend::Complete { result } => return self.finish(exec, FlowStatus::Completed, Some(result), None, now),
                Suspend::Send { session_id, payload } => {
                    if let Err(cause) = self.queue_send(exec, session_id, payload) {
                        return Ok(self.failed(exec, cause));
                    }
                    exec.instance.waiting_on = WaitingOn::Sent;
                    FlowStatus::Running
                }
                Suspend::SendAndReceive { session_id, payload, deadline } => {
                    if let Err(cause) = self.queue_send(exec, session_id, payload) {
                        return Ok(self.failed(exec, cause));
                    }
                    exec.instance.waiting_on = WaitingOn::Message { session_id, deadline };
                    FlowStatus::Suspended
                }
                Suspend::Receive { session_id, deadline } => {
                    let open = exec.instance.sessions.iter().any(|s| s.session_id == session_id && !s.is_closed());
                    if !open {
                        let cause = FlowLogicError::Permanent(format!("espera en sesion {} desconocida o cerrada", session_id));
                        return Ok(self.failed(exec, cause));
                    }
                    exec.instance.waiting_on = WaitingOn::Message { session_id, deadline };
                    FlowStatus::Suspended
                }
                Suspend::Sleep { until } => {
                    exec.instance.waiting_on = WaitingOn::Timer { until };
                    FlowStatus::Suspended
                }
                Suspend::SubFlow { descriptor } => {
                    let descriptor = match self.registry.validate(&descriptor) {
                        Ok(d) => d,
                        Err(e) => return Ok(self.failed(exec, FlowLogicError::Permanent(e.to_string()))),
                    };
                    let child = self.child_id(&exec.shard)?;
                    exec.instance.waiting_on = WaitingOn::SubFlow { child, descriptor };
                    FlowStatus::Suspended
                }
            };

            self.checkpoint(exec, status, now)?;
            if let Some(child) = exec.consumed_child.take() {
                self.store.delete(&child)?;
            }
            self.flush(&mut exec.instance);

            match self.wake(exec, now)? {
                Some(next) => resume = next,
                None => return Ok(SuspendOutcome::Suspended { waiting_on: exec.instance.waiting_on.clone() }),
            }
        }
    }

    fn failed(&self, exec: &Execution, cause: FlowLogicError) -> SuspendOutcome {
        log::warn!("engine: flow {} fallo tras {} checkpoints: {}", exec.instance.flow_id, exec.instance.suspend_count, cause);
        SuspendOutcome::Failed { cause,
                                 suspend_count: exec.instance.suspend_count }
    }

    fn queue_send(&self, exec: &mut Execution, session_id: SessionId, payload: JsonValue) -> std::result::Result<(), FlowLogicError> {
        let session = exec.instance
                          .sessions
                          .iter_mut()
                          .find(|s| s.session_id == session_id && !s.is_closed())
                          .ok_or_else(|| FlowLogicError::Permanent(format!("envio en sesion {} desconocida o cerrada", session_id)))?;
        let envelope = self.sessions.send(session, payload);
        let to = session.counterparty.clone();
        exec.instance.pending_sends.push(Outbound { to, envelope });
        Ok(())
    }

    fn checkpoint(&self, exec: &mut Execution, status: FlowStatus, now: DateTime<Utc>) -> Result<()> {
        exec.instance.suspend_count += 1;
        self.commit(exec, status, now)
    }

    /// Escritura condicional por versión. Un conflicto significa que otra
    /// ejecución avanzó el flujo.
    fn commit(&self, exec: &mut Execution, status: FlowStatus, now: DateTime<Utc>) -> Result<()> {
        let flow_id = exec.instance.flow_id;
        let data = CheckpointData { flow_id,
                                    shard: exec.shard.clone(),
                                    status,
                                    state: self.codec.encode(&exec.instance)? };
        match self.store.save(&data, exec.version)? {
            PersistResult::Ok { new_version } => {
                log::debug!("engine: checkpoint flow {} v{} {}", flow_id, new_version, status);
                exec.version = new_version;
                exec.status = status;
            }
            PersistResult::Conflict => return Err(FlowError::ConcurrencyViolation(flow_id)),
        }
        self.sync_sessions(exec, now);
        Ok(())
    }

    fn sync_sessions(&self, exec: &Execution, now: DateTime<Utc>) {
        for id in self.sessions.sync(&exec.instance.flow_id, &exec.instance.sessions, now) {
            self.transport.acknowledge(&id);
        }
    }

    /// Transmite los envíos pendientes. Lo que no sale se queda en el
    /// estado y se repite con la misma secuencia en la próxima reanudación.
    /// Lo que este proceso ya transmitió no se repite en cada despertar; sí
    /// tras un reinicio.
    fn flush(&self, instance: &mut FlowInstance) {
        if instance.pending_sends.is_empty() {
            return;
        }
        let flow_id = instance.flow_id;
        let already = self.transmitted.remove(&flow_id).map(|(_, ids)| ids).unwrap_or_default();
        let mut sent = HashSet::new();
        for out in std::mem::take(&mut instance.pending_sends) {
            if already.contains(&out.envelope.id) || self.transmit(&out) {
                sent.insert(out.envelope.id);
            } else {
                instance.pending_sends.push(out);
            }
        }
        if !sent.is_empty() {
            self.transmitted.insert(flow_id, sent);
        }
    }

    /// Olvida los envíos transmitidos de los flujos que cumplen `pred`.
    pub fn forget_transmitted<P>(&self, pred: P)
        where P: Fn(&FlowId) -> bool
    {
        self.transmitted.retain(|flow_id, _| !pred(flow_id));
    }

    fn transmit(&self, out: &Outbound) -> bool {
        let attempts = self.settings.send_attempts.max(1);
        for attempt in 1..=attempts {
            match self.transport.send(&out.to, &out.envelope) {
                Ok(()) => return true,
                Err(e) => log::warn!("transport: envio {} a {} fallo (intento {}/{}): {}", out.envelope.id, out.to, attempt, attempts, e),
            }
        }
        false
    }

    fn finish(&self, exec: &mut Execution, status: FlowStatus, result: Option<JsonValue>, error: Option<String>, now: DateTime<Utc>) -> Result<SuspendOutcome> {
        let flow_id = exec.instance.flow_id;
        self.flush(&mut exec.instance);
        if !exec.instance.pending_sends.is_empty() {
            log::warn!("engine: flow {} termina con {} envios sin entregar", flow_id, exec.instance.pending_sends.len());
        }
        for s in exec.instance.sessions.iter_mut() {
            s.state = SessionState::Closed;
        }
        exec.instance.waiting_on = WaitingOn::Finished;
        exec.instance.result = result.clone();
        exec.instance.error = error.clone();

        // Un subflujo conserva su checkpoint terminal hasta que el padre
        // consume el resultado.
        if exec.instance.parent.is_some() {
            self.checkpoint(exec, status, now)?;
        } else {
            self.store.delete(&flow_id)?;
            self.sync_sessions(exec, now);
        }
        if let Some(child) = exec.consumed_child.take() {
            self.store.delete(&child)?;
        }
        self.sessions.close_flow(&flow_id);
        self.kills.clear(&flow_id);
        self.transmitted.remove(&flow_id);
        log::info!("engine: flow {} terminado en {}", flow_id, status);
        Ok(match status {
               FlowStatus::Completed => SuspendOutcome::Completed { result: result.unwrap_or(JsonValue::Null) },
               _ => SuspendOutcome::Killed { error },
           })
    }

    /// Id de subflujo en el mismo shard que el padre.
    fn child_id(&self, shard: &ShardId) -> Result<FlowId> {
        let limit = self.router.shard_count().saturating_mul(64);
        for _ in 0..limit {
            let id = Uuid::new_v4();
            if &self.router.shard_of(&id) == shard {
                return Ok(id);
            }
        }
        Err(FlowError::Other(format!("no se encontro id de subflujo para el shard {}", shard)))
    }
}

fn abandon_on_conflict(outcome: Result<SuspendOutcome>) -> Result<SuspendOutcome> {
    match outcome {
        Err(FlowError::ConcurrencyViolation(flow_id)) => {
            log::warn!("engine: flow {} avanzado por otra ejecucion; se abandona esta", flow_id);
            Ok(SuspendOutcome::Abandoned)
        }
        other => other,
    }
}
