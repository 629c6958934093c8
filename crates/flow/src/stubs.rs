// Archivo: stubs.rs
// Propósito: implementaciones en memoria para pruebas y wiring rápido.
//
// Incluye un store de checkpoints en memoria (`InMemoryCheckpointStore`),
// un transporte que registra lo enviado (`RecordingTransport`) y un
// observador que guarda los eventos. No son durables y se usan para demos o
// pruebas locales.
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;

use crate::domain::{Checkpoint, CheckpointData, CounterpartyId, FlowId, FlowStatus, MessageEnvelope, MessageIdentifier, Outbound, PersistResult, SessionId};
use crate::errors::{FlowError, Result};
use crate::events::{LifecycleEvent, LifecycleObserver};
use crate::repository::CheckpointStore;
use crate::transport::MessageTransport;

/// Helper para mapear `Mutex::lock()` en un `Result` con
/// `FlowError::Storage`.
fn lock<T>(m: &Mutex<T>) -> std::result::Result<MutexGuard<'_, T>, FlowError> {
    m.lock().map_err(|e| FlowError::Storage(format!("mutex poisoned: {:?}", e)))
}

// Store mínimo en memoria (no durable)
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: Mutex<HashMap<FlowId, Checkpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.checkpoints).map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn load(&self, flow_id: &FlowId) -> Result<Option<Checkpoint>> {
        Ok(lock(&self.checkpoints)?.get(flow_id).cloned())
    }

    /// Compare-and-set bajo un único mutex: la comprobación de versión y la
    /// escritura son atómicas.
    fn save(&self, data: &CheckpointData, expected_version: u64) -> Result<PersistResult> {
        let mut map = lock(&self.checkpoints)?;
        let now = Utc::now();
        let current = map.get(&data.flow_id).map(|c| c.version).unwrap_or(0);
        if current != expected_version {
            return Ok(PersistResult::Conflict);
        }
        let created_at = map.get(&data.flow_id).map(|c| c.created_at).unwrap_or(now);
        let new_version = current + 1;
        map.insert(data.flow_id,
                   Checkpoint { flow_id: data.flow_id,
                                version: new_version,
                                shard: data.shard.clone(),
                                status: data.status,
                                state: data.state.clone(),
                                created_at,
                                updated_at: now });
        Ok(PersistResult::Ok { new_version })
    }

    fn delete(&self, flow_id: &FlowId) -> Result<()> {
        lock(&self.checkpoints)?.remove(flow_id);
        Ok(())
    }

    fn list_by_status(&self, statuses: &[FlowStatus]) -> Result<Vec<Checkpoint>> {
        let map = lock(&self.checkpoints)?;
        let mut out: Vec<Checkpoint> = map.values().filter(|c| statuses.contains(&c.status)).cloned().collect();
        out.sort_by_key(|c| c.created_at);
        Ok(out)
    }
}

/// Transporte que guarda cada envío exitoso y cada confirmación. Puede
/// simular fallos (`fail_next`, `set_offline`).
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<Outbound>>,
    acked: Mutex<Vec<MessageIdentifier>>,
    failures_left: AtomicU32,
    offline: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Los próximos `n` envíos fallan.
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Outbound> {
        lock(&self.sent).map(|v| v.clone()).unwrap_or_default()
    }

    pub fn sent_to(&self, to: &CounterpartyId) -> Vec<MessageEnvelope> {
        self.sent().into_iter().filter(|o| &o.to == to).map(|o| o.envelope).collect()
    }

    /// Vista de un receptor que deduplica por `(sesión, secuencia)`.
    pub fn delivered_unique(&self) -> HashSet<(SessionId, u64)> {
        self.sent()
            .iter()
            .map(|o| (o.envelope.id.session_id, o.envelope.id.sequence_number))
            .collect()
    }

    pub fn acknowledged(&self) -> Vec<MessageIdentifier> {
        lock(&self.acked).map(|v| v.clone()).unwrap_or_default()
    }
}

impl MessageTransport for RecordingTransport {
    fn send(&self, to: &CounterpartyId, envelope: &MessageEnvelope) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(FlowError::Transport(format!("{} inalcanzable", to)));
        }
        let failing = self.failures_left
                          .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                          .is_ok();
        if failing {
            return Err(FlowError::Transport(format!("fallo simulado enviando a {}", to)));
        }
        lock(&self.sent)?.push(Outbound { to: to.clone(),
                                          envelope: envelope.clone() });
        Ok(())
    }

    fn acknowledge(&self, id: &MessageIdentifier) {
        if let Ok(mut v) = lock(&self.acked) {
            v.push(id.clone());
        }
    }
}

/// Observador que acumula los eventos recibidos.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        lock(&self.events).map(|v| v.clone()).unwrap_or_default()
    }
}

impl LifecycleObserver for RecordingObserver {
    fn on_event(&self, event: &LifecycleEvent) {
        if let Ok(mut v) = lock(&self.events) {
            v.push(event.clone());
        }
    }
}
