// Archivo: service.rs
// Propósito: implementar `FlowSupervisor`, la capa orquestadora que posee
// los flujos de los shards asignados a este worker: admite flujos nuevos,
// entrega mensajes, dispara temporizadores, aplica las decisiones del
// hospital y reanuda los flujos pendientes al arrancar.
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use uuid::Uuid;

use crate::codec::{JsonStateCodec, StateCodec};
use crate::config::SupervisorConfig;
use crate::domain::{Checkpoint, FailureNote, FlowId, FlowStatus, MessageEnvelope};
use crate::drain::{DrainModeController, DrainModeSetEvent};
use crate::engine::{FlowStateMachine, KillSwitch, SuspendOutcome, WaitingOn};
use crate::errors::{FlowError, Result};
use crate::events::{EventBus, FlowTerminated, LifecycleEvent, LifecycleObserver, OutcomeLog};
use crate::hospital::{Decision, FlowHospital, MedicalRecord};
use crate::locks::{ExecutionLocks, LockRefusal};
use crate::registry::{FlowDescriptor, FlowRegistry};
use crate::repository::CheckpointStore;
use crate::session::{DeliveryOutcome, SessionManager};
use crate::shard::{ShardId, ShardOwnership, ShardRouter, ShardSet};
use crate::timers::{TimerKind, TimerQueue};
use crate::transport::MessageTransport;

enum Trigger {
    Start { descriptor: FlowDescriptor, parent: Option<FlowId> },
    Resume,
    Kill(String),
    Readmit,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub timers_fired: usize,
    pub gaps_expired: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub scanned: usize,
    pub resumed: usize,
    pub busy: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebalanceReport {
    pub released: usize,
    pub gained: usize,
    pub evicted_flows: usize,
    pub recovery: RecoveryReport,
}

/// Flujo hospitalizado visto por el operador.
#[derive(Debug, Clone, PartialEq)]
pub struct HospitalEntry {
    pub flow_id: FlowId,
    pub logic: String,
    pub since: DateTime<Utc>,
    pub note: Option<FailureNote>,
    pub records: Vec<MedicalRecord>,
}

/// Resumen de un flujo no terminado.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowSummary {
    pub flow_id: FlowId,
    pub logic: String,
    pub status: FlowStatus,
    pub version: u64,
    pub shard: ShardId,
    pub waiting_on: WaitingOn,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorStatus {
    pub worker_id: String,
    pub draining: bool,
    pub owned_shards: String,
    pub active_executions: usize,
    pub pending_timers: usize,
    pub tracked_sessions: usize,
    pub flows_by_status: BTreeMap<FlowStatus, usize>,
}

/// Supervisor de flujos de un worker.
///
/// Garantiza a lo sumo una ejecución activa por flujo dentro del proceso;
/// entre procesos la exclusión la dan la propiedad de shards y la escritura
/// condicional por versión del store.
pub struct FlowSupervisor {
    config: SupervisorConfig,
    store: Arc<dyn CheckpointStore>,
    transport: Arc<dyn MessageTransport>,
    registry: Arc<FlowRegistry>,
    machine: FlowStateMachine,
    router: ShardRouter,
    ownership: ShardOwnership,
    sessions: Arc<SessionManager>,
    hospital: FlowHospital,
    drain: Arc<DrainModeController>,
    locks: ExecutionLocks,
    timers: TimerQueue,
    kills: Arc<KillSwitch>,
    events: Arc<EventBus>,
    outcomes: OutcomeLog,
}

impl FlowSupervisor {
    /// Supervisor con códec JSON y modo drenaje inicialmente desactivado.
    pub fn new(config: SupervisorConfig,
               store: Arc<dyn CheckpointStore>,
               transport: Arc<dyn MessageTransport>,
               registry: Arc<FlowRegistry>)
               -> Result<Self> {
        Self::with_parts(config,
                         store,
                         transport,
                         registry,
                         Arc::new(JsonStateCodec),
                         Arc::new(DrainModeController::default()))
    }

    pub fn with_parts(config: SupervisorConfig,
                      store: Arc<dyn CheckpointStore>,
                      transport: Arc<dyn MessageTransport>,
                      registry: Arc<FlowRegistry>,
                      codec: Arc<dyn StateCodec>,
                      drain: Arc<DrainModeController>)
                      -> Result<Self> {
        config.validate()?;
        let router = config.router()?;
        let sessions = Arc::new(SessionManager::new(router));
        let kills = Arc::new(KillSwitch::default());
        let machine = FlowStateMachine::new(store.clone(),
                                            codec,
                                            transport.clone(),
                                            sessions.clone(),
                                            registry.clone(),
                                            router,
                                            kills.clone(),
                                            config.machine_settings());
        let events = Arc::new(EventBus::new());
        let bus = events.clone();
        drain.subscribe(Arc::new(move |e: &DrainModeSetEvent| bus.publish(LifecycleEvent::DrainModeSet(e.clone()))));
        log::info!("supervisor {}: shards {} (prefijo {}), {} logicas registradas",
                   config.worker_id,
                   config.owned_shards,
                   router.prefix_len(),
                   registry.names().len());
        Ok(Self { ownership: ShardOwnership::new(config.owned_shards.clone()),
                  outcomes: OutcomeLog::new(config.max_retained_outcomes),
                  hospital: FlowHospital::new(config.retry_policy()),
                  config,
                  store,
                  transport,
                  registry,
                  machine,
                  router,
                  sessions,
                  drain,
                  locks: ExecutionLocks::new(),
                  timers: TimerQueue::new(),
                  kills,
                  events })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn router(&self) -> &ShardRouter {
        &self.router
    }

    pub fn owned_shards(&self) -> ShardSet {
        self.ownership.snapshot()
    }

    pub fn hospital(&self) -> &FlowHospital {
        &self.hospital
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn registry(&self) -> &FlowRegistry {
        &self.registry
    }

    pub fn drain_controller(&self) -> Arc<DrainModeController> {
        self.drain.clone()
    }

    pub fn set_draining(&self, value: bool) -> Option<DrainModeSetEvent> {
        self.drain.set_draining(value)
    }

    pub fn is_draining(&self) -> bool {
        self.drain.is_draining()
    }

    pub fn subscribe(&self, observer: Arc<dyn LifecycleObserver>) {
        self.events.subscribe(observer);
    }

    pub fn next_timer(&self) -> Option<DateTime<Utc>> {
        self.timers.next_due()
    }

    /// Admite un flujo nuevo. Falla con `Rejected` en modo drenaje y con
    /// `Validation` si la lógica no existe o rechaza los argumentos. El id
    /// se elige para caer en un shard propio.
    pub fn submit(&self, descriptor: FlowDescriptor) -> Result<FlowId> {
        if self.drain.is_draining() {
            return Err(FlowError::Rejected("modo drenaje activo: no se admiten flujos nuevos".into()));
        }
        let descriptor = self.registry.validate(&descriptor)?;
        let flow_id = self.allocate_flow_id()?;
        log::info!("supervisor: admitido flow {} ({}) en shard {}", flow_id, descriptor.logic, self.router.shard_of(&flow_id));
        self.drive(flow_id, Trigger::Start { descriptor, parent: None }, Utc::now())?;
        Ok(flow_id)
    }

    /// Entrega un mensaje entrante. Los duplicados de mensajes ya
    /// consumidos en un checkpoint se confirman al transporte sin efecto;
    /// los de mensajes aún en buffer esperan a ese checkpoint. Un mensaje que completa una espera reanuda el
    /// flujo en el mismo hilo.
    pub fn deliver(&self, envelope: MessageEnvelope) -> Result<DeliveryOutcome> {
        let shard = self.router.shard_of(&envelope.id.flow_id);
        if !self.ownership.owns(&shard) {
            log::debug!("supervisor: mensaje {} para shard ajeno {}", envelope.id, shard);
            return Ok(DeliveryOutcome::NotOwned);
        }
        let id = envelope.id.clone();
        let now = Utc::now();
        let outcome = self.sessions.on_message(envelope, now);
        match &outcome {
            DeliveryOutcome::Resumes(flow_id) => {
                self.drive(*flow_id, Trigger::Resume, now)?;
            }
            DeliveryOutcome::Duplicate if self.sessions.is_committed(&id) => {
                log::debug!("supervisor: duplicado {}", id);
                self.transport.acknowledge(&id);
            }
            DeliveryOutcome::Duplicate => log::debug!("supervisor: duplicado {} aun sin confirmar, queda en buffer", id),
            DeliveryOutcome::Discarded => log::debug!("supervisor: descartado {}", id),
            DeliveryOutcome::Buffered | DeliveryOutcome::NotOwned => {}
        }
        Ok(outcome)
    }

    /// Dispara los temporizadores vencidos y los huecos de secuencia
    /// expirados a fecha `now`.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport::default();
        for (flow_id, kind) in self.timers.due(now) {
            if !self.ownership.owns(&self.router.shard_of(&flow_id)) {
                continue;
            }
            report.timers_fired += 1;
            match self.drive(flow_id, Trigger::Resume, now) {
                Ok(Some(_)) => {}
                Ok(None) => {
                    // flujo ocupado o shard en cesión: se reintenta en el próximo tick
                    let retry_at = now + chrono::Duration::milliseconds(self.config.tick_interval_ms as i64);
                    self.timers.schedule(retry_at, flow_id, kind);
                }
                Err(e) => {
                    log::error!("supervisor: temporizador de flow {} fallo: {}", flow_id, e);
                    report.errors += 1;
                }
            }
        }
        let gap_timeout = self.config.machine_settings().session_gap_timeout;
        for flow_id in self.sessions.expired_gaps(now, gap_timeout) {
            report.gaps_expired += 1;
            log::warn!("supervisor: hueco de secuencia vencido en flow {}", flow_id);
            if let Err(e) = self.drive(flow_id, Trigger::Resume, now) {
                log::error!("supervisor: flow {} tras hueco vencido: {}", flow_id, e);
                report.errors += 1;
            }
        }
        Ok(report)
    }

    /// Reanuda en paralelo los flujos RUNNING/SUSPENDED de los shards
    /// propios. Se llama al arrancar el worker.
    pub fn recover(&self) -> Result<RecoveryReport> {
        self.recover_where(|shard| self.ownership.owns(shard))
    }

    fn recover_where<P>(&self, pred: P) -> Result<RecoveryReport>
        where P: Fn(&ShardId) -> bool + Sync
    {
        let candidates: Vec<Checkpoint> = self.store
                                              .list_by_status(&[FlowStatus::Running, FlowStatus::Suspended])?
                                              .into_iter()
                                              .filter(|cp| pred(&self.router.shard_of(&cp.flow_id)))
                                              .collect();
        let now = Utc::now();
        let results: Vec<Result<Option<SuspendOutcome>>> = candidates.par_iter()
                                                                     .map(|cp| self.drive(cp.flow_id, Trigger::Resume, now))
                                                                     .collect();
        let mut report = RecoveryReport { scanned: candidates.len(),
                                          ..Default::default() };
        for (cp, r) in candidates.iter().zip(results) {
            match r {
                Ok(Some(_)) => report.resumed += 1,
                Ok(None) => report.busy += 1,
                Err(e) => {
                    log::error!("supervisor: recuperacion de flow {} fallo: {}", cp.flow_id, e);
                    report.errors += 1;
                }
            }
        }
        log::info!("supervisor: recuperacion {:?}", report);
        Ok(report)
    }

    /// Pide la terminación de un flujo. Si está suspendido se termina ya;
    /// si está ejecutando, en su próximo punto de suspensión. Devuelve
    /// false si el flujo no existe, ya terminó o su shard no es propio.
    pub fn kill(&self, flow_id: FlowId, reason: &str) -> Result<bool> {
        if !self.ownership.owns(&self.router.shard_of(&flow_id)) {
            return Ok(false);
        }
        let alive = self.store.load(&flow_id)?.map(|cp| !cp.status.is_terminal()).unwrap_or(false);
        if !alive && !self.locks.is_active(&flow_id) {
            return Ok(false);
        }
        self.kills.request(flow_id, reason);
        self.drive(flow_id, Trigger::Kill(reason.to_string()), Utc::now())?;
        Ok(true)
    }

    /// Flujos hospitalizados de los shards propios.
    pub fn hospitalized(&self) -> Result<Vec<HospitalEntry>> {
        let mut out = Vec::new();
        for cp in self.store.list_by_status(&[FlowStatus::Hospitalized])? {
            if !self.ownership.owns(&self.router.shard_of(&cp.flow_id)) {
                continue;
            }
            let instance = self.machine.decode(&cp)?;
            out.push(HospitalEntry { flow_id: cp.flow_id,
                                     logic: instance.logic,
                                     since: cp.updated_at,
                                     note: instance.last_failure,
                                     records: self.hospital.records(&cp.flow_id) });
        }
        Ok(out)
    }

    /// Devuelve un flujo hospitalizado a ejecución con el historial a cero.
    pub fn retry_hospitalized(&self, flow_id: FlowId) -> Result<SuspendOutcome> {
        self.hospital.discharge(&flow_id);
        self.drive(flow_id, Trigger::Readmit, Utc::now())?
            .ok_or_else(|| FlowError::Conflict(format!("flow {} esta en ejecucion o su shard no es propio", flow_id)))
    }

    /// Reintenta todos los hospitalizados; devuelve cuántos se readmitieron.
    pub fn redrive_hospitalized(&self) -> Result<usize> {
        let mut count = 0;
        for entry in self.hospitalized()? {
            match self.retry_hospitalized(entry.flow_id) {
                Ok(_) => count += 1,
                Err(e) => log::warn!("supervisor: no se pudo readmitir flow {}: {}", entry.flow_id, e),
            }
        }
        Ok(count)
    }

    /// Estado actual: el del checkpoint o, si ya no existe, el del
    /// resultado terminal conocido.
    pub fn status(&self, flow_id: &FlowId) -> Result<Option<FlowStatus>> {
        if let Some(cp) = self.store.load(flow_id)? {
            return Ok(Some(cp.status));
        }
        Ok(self.outcomes.get(flow_id).map(|o| o.status))
    }

    /// Resultado terminal conocido. Se conservan los últimos
    /// `max_retained_outcomes`.
    pub fn outcome(&self, flow_id: &FlowId) -> Option<FlowTerminated> {
        self.outcomes.get(flow_id)
    }

    pub fn forget_outcome(&self, flow_id: &FlowId) -> Option<FlowTerminated> {
        self.outcomes.forget(flow_id)
    }

    pub fn retained_outcomes(&self) -> usize {
        self.outcomes.len()
    }

    /// Flujos no terminados de los shards propios.
    pub fn active_flows(&self) -> Result<Vec<FlowSummary>> {
        let mut out = Vec::new();
        let statuses = [FlowStatus::Running, FlowStatus::Suspended, FlowStatus::Hospitalized];
        for cp in self.store.list_by_status(&statuses)? {
            if !self.ownership.owns(&self.router.shard_of(&cp.flow_id)) {
                continue;
            }
            let instance = self.machine.decode(&cp)?;
            out.push(FlowSummary { flow_id: cp.flow_id,
                                   logic: instance.logic,
                                   status: cp.status,
                                   version: cp.version,
                                   shard: cp.shard,
                                   waiting_on: instance.waiting_on });
        }
        Ok(out)
    }

    /// true cuando, en modo drenaje, ya no queda trabajo en curso.
    pub fn is_drained(&self) -> Result<bool> {
        if !self.drain.is_draining() || self.locks.active_count() > 0 {
            return Ok(false);
        }
        Ok(self.active_flows()?.iter().all(|f| f.status == FlowStatus::Hospitalized))
    }

    pub fn report(&self) -> Result<SupervisorStatus> {
        let mut flows_by_status = BTreeMap::new();
        for f in self.active_flows()? {
            *flows_by_status.entry(f.status).or_insert(0) += 1;
        }
        Ok(SupervisorStatus { worker_id: self.config.worker_id.clone(),
                              draining: self.drain.is_draining(),
                              owned_shards: self.ownership.snapshot().to_string(),
                              active_executions: self.locks.active_count(),
                              pending_timers: self.timers.len(),
                              tracked_sessions: self.sessions.len(),
                              flows_by_status })
    }

    /// Cambia los shards propios: bloquea los cedidos, espera a que
    /// terminen sus ejecuciones, olvida su estado en memoria y recupera los
    /// flujos de los shards ganados.
    pub fn rebalance(&self, new_set: ShardSet) -> Result<RebalanceReport> {
        let current = self.ownership.snapshot();
        let before = current.shards(&self.router);
        let after = new_set.shards(&self.router);
        let released: BTreeSet<ShardId> = before.difference(&after).cloned().collect();
        let gained: BTreeSet<ShardId> = after.difference(&before).cloned().collect();

        self.locks.block(&released);
        if !self.locks.wait_idle(&released, self.config.rebalance_timeout()) {
            self.locks.unblock(&released);
            return Err(FlowError::Conflict(format!("rebalanceo: ejecuciones en curso en {} shards cedidos", released.len())));
        }
        self.ownership.replace(new_set.clone());
        let evicted_flows = self.sessions.evict_shards(&released);
        self.timers.cancel_where(|f| released.contains(&self.router.shard_of(f)));
        self.machine.forget_transmitted(|f| released.contains(&self.router.shard_of(f)));
        self.locks.unblock(&released);
        log::info!("supervisor {}: rebalanceo {} -> {} ({} cedidos, {} ganados)",
                   self.config.worker_id,
                   current,
                   new_set,
                   released.len(),
                   gained.len());

        let recovery = if gained.is_empty() {
            RecoveryReport::default()
        } else {
            self.recover_where(|shard| gained.contains(shard))?
        };
        Ok(RebalanceReport { released: released.len(),
                             gained: gained.len(),
                             evicted_flows,
                             recovery })
    }

    fn allocate_flow_id(&self) -> Result<FlowId> {
        let limit = self.router.shard_count().saturating_mul(64);
        for _ in 0..limit {
            let id = Uuid::new_v4();
            if self.ownership.owns(&self.router.shard_of(&id)) {
                return Ok(id);
            }
        }
        Err(FlowError::Rejected(format!("worker {} no posee shards", self.config.worker_id)))
    }

    /// Ejecuta el flujo bajo su lock. Devuelve `None` si no se pudo tomar
    /// el lock en el primer intento o si el shard dejó de ser propio. Tras soltar el lock vuelve a comprobar
    /// si llegaron mensajes o peticiones de terminación mientras ejecutaba.
    fn drive(&self, flow_id: FlowId, trigger: Trigger, now: DateTime<Utc>) -> Result<Option<SuspendOutcome>> {
        let shard = self.router.shard_of(&flow_id);
        let mut trigger = trigger;
        let mut last = None;
        loop {
            let guard = match self.locks.try_acquire(flow_id, &shard) {
                Ok(g) => g,
                Err(LockRefusal::Busy) => {
                    log::debug!("supervisor: flow {} ya en ejecucion", flow_id);
                    return Ok(last);
                }
                Err(LockRefusal::ShardReleasing) => {
                    log::debug!("supervisor: shard {} en cesion, flow {} no se ejecuta", shard, flow_id);
                    return Ok(last);
                }
            };
            // con el lock tomado un rebalanceo ya no puede ceder el shard
            if !self.ownership.owns(&shard) {
                log::debug!("supervisor: shard {} ya no es propio, flow {} no se ejecuta", shard, flow_id);
                return Ok(last);
            }
            self.sessions.clear_awaiting(&flow_id);
            let outcome = match trigger {
                Trigger::Start { ref descriptor, parent } => self.machine.start(flow_id, descriptor, parent, now)?,
                Trigger::Resume => self.machine.resume(flow_id, now)?,
                Trigger::Kill(ref reason) => self.machine.kill(flow_id, reason, now)?,
                Trigger::Readmit => self.machine.readmit(flow_id, now)?,
            };
            let again = self.settle(flow_id, &outcome, now)?;
            drop(guard);

            let parked = matches!(outcome, SuspendOutcome::Suspended { .. } | SuspendOutcome::Failed { .. } | SuspendOutcome::Hospitalized);
            last = Some(outcome);
            trigger = if again {
                Trigger::Resume
            } else if parked && self.kills.is_requested(&flow_id) {
                Trigger::Kill(self.kills.reason(&flow_id).unwrap_or_default())
            } else if self.sessions.ready_for(&flow_id) {
                Trigger::Resume
            } else {
                return Ok(last);
            };
        }
    }

    /// Efectos del resultado de una ejecución, con el lock aún tomado.
    /// Devuelve true si el flujo debe volver a ejecutarse de inmediato.
    fn settle(&self, flow_id: FlowId, outcome: &SuspendOutcome, now: DateTime<Utc>) -> Result<bool> {
        match outcome {
            SuspendOutcome::Suspended { waiting_on } => match waiting_on {
                WaitingOn::Message { session_id, deadline } => {
                    self.sessions.set_awaiting(session_id);
                    if let Some(at) = deadline {
                        self.timers.schedule(*at, flow_id, TimerKind::Wake);
                    }
                    Ok(false)
                }
                WaitingOn::Timer { until } => {
                    self.timers.schedule(*until, flow_id, TimerKind::Wake);
                    Ok(false)
                }
                WaitingOn::SubFlow { child, descriptor } => self.ensure_child(flow_id, *child, descriptor, now),
                WaitingOn::Start | WaitingOn::Sent | WaitingOn::Finished => Ok(false),
            },
            SuspendOutcome::Completed { result } => {
                self.terminated(flow_id, FlowStatus::Completed, Some(result.clone()), None, now)?;
                Ok(false)
            }
            SuspendOutcome::Killed { error } => {
                self.terminated(flow_id, FlowStatus::Killed, None, error.clone(), now)?;
                Ok(false)
            }
            SuspendOutcome::Failed { cause, suspend_count } => {
                let (failure, decision) = self.hospital.admit(flow_id, *suspend_count, cause.clone())?;
                match decision {
                    Decision::Retry { after } if after.is_zero() => Ok(true),
                    Decision::Retry { after } => {
                        let delay = chrono::Duration::from_std(after).unwrap_or_else(|_| chrono::Duration::milliseconds(self.config.retry_max_delay_ms as i64));
                        self.timers.schedule(now + delay, flow_id, TimerKind::Retry);
                        Ok(false)
                    }
                    Decision::Hospitalize => {
                        if self.machine.hospitalize(&failure, now)? == SuspendOutcome::Hospitalized {
                            log::warn!("supervisor: flow {} hospitalizado: {}", flow_id, failure.cause);
                            self.events.publish(LifecycleEvent::FlowHospitalized { flow_id,
                                                                                   cause: failure.cause.to_string() });
                        }
                        Ok(false)
                    }
                    Decision::Kill => {
                        let killed = self.machine.kill(flow_id, &failure.cause.to_string(), now)?;
                        self.settle(flow_id, &killed, now)
                    }
                }
            }
            SuspendOutcome::Hospitalized | SuspendOutcome::NotResumable { .. } | SuspendOutcome::Abandoned => Ok(false),
        }
    }

    /// Arranca (o reanuda) el subflujo que espera el padre. Devuelve true
    /// si el hijo ya terminó y el padre puede continuar.
    fn ensure_child(&self, parent: FlowId, child: FlowId, descriptor: &FlowDescriptor, now: DateTime<Utc>) -> Result<bool> {
        match self.store.load(&child)? {
            Some(cp) if cp.status.is_terminal() => return Ok(true),
            Some(_) => {
                self.drive(child, Trigger::Resume, now)?;
            }
            None => {
                log::info!("supervisor: flow {} inicia subflujo {} ({})", parent, child, descriptor.logic);
                self.drive(child,
                           Trigger::Start { descriptor: descriptor.clone(),
                                            parent: Some(parent) },
                           now)?;
            }
        }
        Ok(self.store.load(&child)?.map(|cp| cp.status.is_terminal()).unwrap_or(false))
    }

    fn terminated(&self, flow_id: FlowId, status: FlowStatus, result: Option<serde_json::Value>, error: Option<String>, now: DateTime<Utc>) -> Result<()> {
        // Sólo los subflujos conservan checkpoint tras terminar.
        let parent = match self.machine.inspect(&flow_id)? {
            Some((cp, instance)) if cp.status.is_terminal() => instance.parent,
            _ => None,
        };
        let event = FlowTerminated { flow_id,
                                     status,
                                     result,
                                     error,
                                     at: now };
        self.outcomes.record(event.clone());
        self.hospital.discharge(&flow_id);
        self.timers.cancel(&flow_id);
        self.events.publish(LifecycleEvent::FlowTerminated(event));
        if let Some(parent) = parent {
            if self.store.load(&parent)?.is_some() {
                self.drive(parent, Trigger::Resume, now)?;
            } else {
                log::warn!("supervisor: padre {} de {} ya no existe; se descarta el resultado", parent, flow_id);
                self.store.delete(&flow_id)?;
            }
        }
        Ok(())
    }
}
