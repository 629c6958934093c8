// Archivo: events.rs
// Propósito: eventos de ciclo de vida observables por componentes externos
// (operadores, métricas, tests), y registro acotado de resultados finales.
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::domain::{FlowId, FlowStatus};
use crate::drain::DrainModeSetEvent;

/// Resultado final de un flujo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowTerminated {
    pub flow_id: FlowId,
    pub status: FlowStatus,
    pub result: Option<JsonValue>,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    DrainModeSet(DrainModeSetEvent),
    FlowHospitalized { flow_id: FlowId, cause: String },
    FlowTerminated(FlowTerminated),
}

pub trait LifecycleObserver: Send + Sync {
    fn on_event(&self, event: &LifecycleEvent);
}

impl<F> LifecycleObserver for F where F: Fn(&LifecycleEvent) + Send + Sync
{
    fn on_event(&self, event: &LifecycleEvent) {
        self(event)
    }
}

#[derive(Default)]
pub struct EventBus {
    observers: RwLock<Vec<Arc<dyn LifecycleObserver>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn LifecycleObserver>) {
        match self.observers.write() {
            Ok(mut g) => g.push(observer),
            Err(p) => p.into_inner().push(observer),
        }
    }

    pub fn publish(&self, event: LifecycleEvent) {
        let observers: Vec<Arc<dyn LifecycleObserver>> = match self.observers.read() {
            Ok(g) => g.clone(),
            Err(p) => p.into_inner().clone(),
        };
        for o in observers {
            o.on_event(&event);
        }
    }
}

/// Últimos resultados finales, en orden de llegada. Al superar la
/// capacidad se olvida el más antiguo.
pub struct OutcomeLog {
    capacity: usize,
    entries: Mutex<IndexMap<FlowId, FlowTerminated>>,
}

impl OutcomeLog {
    pub fn new(capacity: usize) -> Self {
        Self { capacity,
               entries: Mutex::new(IndexMap::new()) }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn record(&self, outcome: FlowTerminated) {
        let mut entries = match self.entries.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        entries.shift_remove(&outcome.flow_id);
        entries.insert(outcome.flow_id, outcome);
        while entries.len() > self.capacity {
            if let Some((evicted, _)) = entries.shift_remove_index(0) {
                log::debug!("outcomes: se olvida el resultado de flow {}", evicted);
            }
        }
    }

    pub fn get(&self, flow_id: &FlowId) -> Option<FlowTerminated> {
        self.entries.lock().ok().and_then(|g| g.get(flow_id).cloned())
    }

    pub fn forget(&self, flow_id: &FlowId) -> Option<FlowTerminated> {
        self.entries.lock().ok().and_then(|mut g| g.shift_remove(flow_id))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
