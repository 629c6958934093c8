// Archivo: locks.rs
// Propósito: exclusión por flujo dentro del proceso. Un flujo tiene a lo
// sumo una ejecución activa; los shards en proceso de cesión no admiten
// ejecuciones nuevas.
use std::collections::BTreeSet;
use std::sync::{Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::domain::FlowId;
use crate::shard::ShardId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockRefusal {
    /// Otra ejecución del mismo flujo está en curso.
    Busy,
    /// El shard del flujo se está cediendo a otro worker.
    ShardReleasing,
}

pub struct ExecutionLocks {
    active: DashMap<FlowId, ShardId>,
    blocked: RwLock<BTreeSet<ShardId>>,
    idle: Mutex<()>,
    released: Condvar,
}

/// Guardia de ejecución: libera el flujo al soltarse.
pub struct ExecutionGuard<'a> {
    locks: &'a ExecutionLocks,
    flow_id: FlowId,
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        self.locks.active.remove(&self.flow_id);
        let _g = self.locks.idle.lock();
        self.locks.released.notify_all();
    }
}

impl Default for ExecutionLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionLocks {
    pub fn new() -> Self {
        Self { active: DashMap::new(),
               blocked: RwLock::new(BTreeSet::new()),
               idle: Mutex::new(()),
               released: Condvar::new() }
    }

    /// Intenta tomar el flujo. La comprobación del shard y la inserción se
    /// hacen bajo el lock de lectura de `blocked` para que `block` vea
    /// todas las ejecuciones admitidas antes que él.
    pub fn try_acquire(&self, flow_id: FlowId, shard: &ShardId) -> Result<ExecutionGuard<'_>, LockRefusal> {
        let blocked = match self.blocked.read() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        if blocked.contains(shard) {
            return Err(LockRefusal::ShardReleasing);
        }
        match self.active.entry(flow_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(LockRefusal::Busy),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(shard.clone());
                Ok(ExecutionGuard { locks: self, flow_id })
            }
        }
    }

    pub fn is_active(&self, flow_id: &FlowId) -> bool {
        self.active.contains_key(flow_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn block(&self, shards: &BTreeSet<ShardId>) {
        let mut g = match self.blocked.write() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        g.extend(shards.iter().cloned());
    }

    pub fn unblock(&self, shards: &BTreeSet<ShardId>) {
        let mut g = match self.blocked.write() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        for s in shards {
            g.remove(s);
        }
    }

    fn active_in(&self, shards: &BTreeSet<ShardId>) -> usize {
        self.active.iter().filter(|e| shards.contains(e.value())).count()
    }

    /// Espera a que terminen las ejecuciones en curso de `shards`. Devuelve
    /// false si vence el plazo.
    pub fn wait_idle(&self, shards: &BTreeSet<ShardId>, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = match self.idle.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        loop {
            if self.active_in(shards) == 0 {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            // Espera acotada: una liberación puede ocurrir entre el conteo
            // y la espera.
            let step = (deadline - now).min(Duration::from_millis(50));
            guard = match self.released.wait_timeout(guard, step) {
                Ok((g, _)) => g,
                Err(p) => p.into_inner().0,
            };
        }
    }
}
