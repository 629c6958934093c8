// Archivo: drain.rs
// Propósito: modo drenaje. Mientras está activo no se admiten flujos
// nuevos; los flujos ya en curso siguen hasta terminar.
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Evento emitido exactamente una vez por cada transición real.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrainModeSetEvent {
    pub value: bool,
    pub timestamp: DateTime<Utc>,
}

pub trait DrainModeListener: Send + Sync {
    fn on_drain_mode_set(&self, event: &DrainModeSetEvent);
}

impl<F> DrainModeListener for F where F: Fn(&DrainModeSetEvent) + Send + Sync
{
    fn on_drain_mode_set(&self, event: &DrainModeSetEvent) {
        self(event)
    }
}

#[derive(Debug, Clone, Copy)]
struct DrainState {
    draining: bool,
    since: Option<DateTime<Utc>>,
}

pub struct DrainModeController {
    state: RwLock<DrainState>,
    listeners: Mutex<Vec<Arc<dyn DrainModeListener>>>,
}

impl Default for DrainModeController {
    fn default() -> Self {
        Self::new(false)
    }
}

impl DrainModeController {
    /// Estado inicial explícito (por ejemplo, el persistido por el
    /// operador antes de un reinicio).
    pub fn new(initial: bool) -> Self {
        let since = if initial { Some(Utc::now()) } else { None };
        Self { state: RwLock::new(DrainState { draining: initial, since }),
               listeners: Mutex::new(Vec::new()) }
    }

    /// Cambia el modo. Idempotente: si el valor no cambia no hay evento.
    /// Los oyentes se notifican fuera del lock de estado.
    pub fn set_draining(&self, value: bool) -> Option<DrainModeSetEvent> {
        let event = {
            let mut st = match self.state.write() {
                Ok(g) => g,
                Err(p) => p.into_inner(),
            };
            if st.draining == value {
                return None;
            }
            let now = Utc::now();
            st.draining = value;
            st.since = if value { Some(now) } else { None };
            DrainModeSetEvent { value, timestamp: now }
        };
        log::info!("drain: modo drenaje {}", if value { "activado" } else { "desactivado" });
        let listeners: Vec<Arc<dyn DrainModeListener>> = match self.listeners.lock() {
            Ok(g) => g.clone(),
            Err(p) => p.into_inner().clone(),
        };
        for l in listeners {
            l.on_drain_mode_set(&event);
        }
        Some(event)
    }

    pub fn is_draining(&self) -> bool {
        match self.state.read() {
            Ok(g) => g.draining,
            Err(p) => p.into_inner().draining,
        }
    }

    /// Momento en que se activó el drenaje actual.
    pub fn draining_since(&self) -> Option<DateTime<Utc>> {
        match self.state.read() {
            Ok(g) => g.since,
            Err(p) => p.into_inner().since,
        }
    }

    pub fn subscribe(&self, listener: Arc<dyn DrainModeListener>) {
        match self.listeners.lock() {
            Ok(mut g) => g.push(listener),
            Err(p) => p.into_inner().push(listener),
        }
    }
}
