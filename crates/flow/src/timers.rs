// Archivo: timers.rs
// Propósito: cola de despertares programados (sleeps, plazos de espera y
// reintentos con backoff). Vive en memoria: tras un reinicio los plazos se
// reconstruyen al reanudar los flujos.
use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::domain::FlowId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TimerKind {
    Wake,
    Retry,
}

#[derive(Default)]
pub struct TimerQueue {
    entries: Mutex<BTreeMap<(DateTime<Utc>, FlowId), TimerKind>>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut BTreeMap<(DateTime<Utc>, FlowId), TimerKind>) -> T) -> T {
        match self.entries.lock() {
            Ok(mut g) => f(&mut g),
            Err(p) => f(&mut p.into_inner()),
        }
    }

    pub fn schedule(&self, at: DateTime<Utc>, flow_id: FlowId, kind: TimerKind) {
        self.with(|m| {
            m.insert((at, flow_id), kind);
        });
    }

    /// Retira y devuelve los despertares vencidos, en orden de vencimiento.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<(FlowId, TimerKind)> {
        self.with(|m| {
            let keys: Vec<(DateTime<Utc>, FlowId)> = m.range(..).take_while(|((at, _), _)| *at <= now).map(|(k, _)| *k).collect();
            keys.into_iter().filter_map(|k| m.remove(&k).map(|kind| (k.1, kind))).collect()
        })
    }

    pub fn cancel(&self, flow_id: &FlowId) {
        self.with(|m| m.retain(|(_, f), _| f != flow_id));
    }

    pub fn cancel_where(&self, pred: impl Fn(&FlowId) -> bool) -> usize {
        self.with(|m| {
            let before = m.len();
            m.retain(|(_, f), _| !pred(f));
            before - m.len()
        })
    }

    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.with(|m| m.keys().next().map(|(at, _)| *at))
    }

    pub fn len(&self) -> usize {
        self.with(|m| m.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
