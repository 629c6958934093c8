// Archivo: session.rs
// Propósito: gestor de sesiones. Asigna secuencias de envío, deduplica y
// ordena los mensajes entrantes, mantiene el buffer de mensajes adelantados
// y detecta huecos de secuencia que no se resuelven a tiempo.
//
// El estado autoritativo de cada sesión vive dentro del checkpoint del
// flujo; este gestor guarda una copia sincronizada tras cada checkpoint
// para emparejar los mensajes entrantes.
use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde_json::Value as JsonValue;

use crate::domain::{FlowId, MessageEnvelope, MessageIdentifier, Session, SessionId, SessionState};
use crate::shard::{ShardId, ShardRouter};

/// Qué ocurrió con un mensaje entrante.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// El mensaje completa la espera de un flujo suspendido.
    Resumes(FlowId),
    /// Guardado hasta que el flujo lo pida o llegue el hueco anterior.
    Buffered,
    /// Ya consumido o ya en buffer. Sin efecto.
    Duplicate,
    /// Sesión desconocida o cerrada.
    Discarded,
    /// El shard del flujo no pertenece a este worker.
    NotOwned,
}

#[derive(Debug)]
struct SessionEntry {
    session: Session,
    pending: BTreeMap<u64, JsonValue>,
    awaiting: bool,
    gap_since: Option<DateTime<Utc>>,
    gap_reported: bool,
}

impl SessionEntry {
    fn new(session: Session) -> Self {
        Self { session,
               pending: BTreeMap::new(),
               awaiting: false,
               gap_since: None,
               gap_reported: false }
    }

    fn next_expected(&self) -> u64 {
        self.session.last_received_seq + 1
    }

    fn next_ready(&self) -> Option<(u64, &JsonValue)> {
        let seq = self.next_expected();
        self.pending.get(&seq).map(|p| (seq, p))
    }

    // Hay hueco cuando el primer mensaje en buffer no es el siguiente esperado.
    fn refresh_gap(&mut self, now: DateTime<Utc>) {
        let has_gap = match self.pending.keys().next() {
            Some(first) => *first > self.next_expected(),
            None => false,
        };
        if has_gap {
            self.gap_since.get_or_insert(now);
        } else {
            self.gap_since = None;
            self.gap_reported = false;
        }
    }

    fn gap_expired(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        matches!(self.gap_since, Some(since) if since + timeout <= now)
    }
}

pub struct SessionManager {
    router: ShardRouter,
    sessions: DashMap<SessionId, SessionEntry>,
    by_flow: DashMap<FlowId, HashSet<SessionId>>,
}

impl SessionManager {
    pub fn new(router: ShardRouter) -> Self {
        Self { router,
               sessions: DashMap::new(),
               by_flow: DashMap::new() }
    }

    /// Asigna la siguiente secuencia de la sesión y construye el sobre.
    /// La transmisión ocurre después, cuando el checkpoint que contiene el
    /// envío está confirmado.
    pub fn send(&self, session: &mut Session, payload: JsonValue) -> MessageEnvelope {
        let seq = session.next_send_seq;
        session.next_send_seq += 1;
        MessageEnvelope { id: MessageIdentifier { flow_id: session.flow_id,
                                                  session_id: session.session_id,
                                                  sequence_number: seq,
                                                  shard_prefix: self.router.shard_of(&session.flow_id) },
                          payload }
    }

    /// Procesa un mensaje entrante. Nunca reactiva un flujo por un
    /// duplicado ni por un mensaje fuera de orden.
    pub fn on_message(&self, envelope: MessageEnvelope, now: DateTime<Utc>) -> DeliveryOutcome {
        let id = envelope.id;
        let mut entry = match self.sessions.get_mut(&id.session_id) {
            Some(e) => e,
            None => return DeliveryOutcome::Discarded,
        };
        if entry.session.flow_id != id.flow_id || entry.session.state == SessionState::Closed || id.sequence_number == 0 {
            return DeliveryOutcome::Discarded;
        }
        let seq = id.sequence_number;
        if seq <= entry.session.last_received_seq || entry.pending.contains_key(&seq) {
            return DeliveryOutcome::Duplicate;
        }
        entry.pending.insert(seq, envelope.payload);
        entry.refresh_gap(now);
        if entry.awaiting && entry.next_ready().is_some() {
            DeliveryOutcome::Resumes(entry.session.flow_id)
        } else {
            DeliveryOutcome::Buffered
        }
    }

    /// Siguiente mensaje consumible de la sesión, sin retirarlo del buffer.
    /// Se retira en la sincronización que sigue al checkpoint que lo
    /// consumió.
    pub fn peek_next(&self, session_id: &SessionId) -> Option<(u64, JsonValue)> {
        self.sessions
            .get(session_id)
            .and_then(|e| e.next_ready().map(|(seq, p)| (seq, p.clone())))
    }

    /// true si el mensaje ya quedó consumido en un checkpoint confirmado.
    /// Un duplicado de un mensaje aún en buffer no lo está.
    pub fn is_committed(&self, id: &MessageIdentifier) -> bool {
        self.sessions
            .get(&id.session_id)
            .map(|e| e.session.flow_id == id.flow_id && id.sequence_number <= e.session.last_received_seq)
            .unwrap_or(false)
    }

    pub fn gap_expired(&self, session_id: &SessionId, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.sessions.get(session_id).map(|e| e.gap_expired(now, timeout)).unwrap_or(false)
    }

    /// Marca la sesión como punto de espera de su flujo.
    pub fn set_awaiting(&self, session_id: &SessionId) {
        if let Some(mut e) = self.sessions.get_mut(session_id) {
            e.awaiting = true;
        }
    }

    pub fn clear_awaiting(&self, flow_id: &FlowId) {
        for sid in self.flow_sessions(flow_id) {
            if let Some(mut e) = self.sessions.get_mut(&sid) {
                e.awaiting = false;
            }
        }
    }

    /// true si alguna sesión en espera del flujo tiene listo su siguiente
    /// mensaje.
    pub fn ready_for(&self, flow_id: &FlowId) -> bool {
        self.flow_sessions(flow_id)
            .iter()
            .any(|sid| self.sessions.get(sid).map(|e| e.awaiting && e.next_ready().is_some()).unwrap_or(false))
    }

    /// Flujos en espera cuyo hueco de secuencia venció. Cada hueco se
    /// informa una sola vez.
    pub fn expired_gaps(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<FlowId> {
        let mut out = Vec::new();
        for mut e in self.sessions.iter_mut() {
            if e.awaiting && !e.gap_reported && e.gap_expired(now, timeout) {
                e.gap_reported = true;
                out.push(e.session.flow_id);
            }
        }
        out.sort();
        out.dedup();
        out
    }

    /// Sincroniza la copia local con las sesiones del checkpoint recién
    /// confirmado. Retira del buffer los mensajes ya consumidos y devuelve
    /// sus identificadores para confirmarlos al transporte. Las sesiones
    /// del flujo que no están en el checkpoint se olvidan.
    pub fn sync(&self, flow_id: &FlowId, sessions: &[Session], now: DateTime<Utc>) -> Vec<MessageIdentifier> {
        let shard = self.router.shard_of(flow_id);
        let mut acked = Vec::new();
        let keep: HashSet<SessionId> = sessions.iter().map(|s| s.session_id).collect();
        for s in sessions {
            let mut entry = self.sessions.entry(s.session_id).or_insert_with(|| SessionEntry::new(s.clone()));
            entry.session = s.clone();
            entry.awaiting = false;
            let consumed: Vec<u64> = if s.state == SessionState::Closed {
                entry.pending.keys().copied().collect()
            } else {
                entry.pending.range(..=s.last_received_seq).map(|(k, _)| *k).collect()
            };
            for seq in consumed {
                entry.pending.remove(&seq);
                acked.push(MessageIdentifier { flow_id: *flow_id,
                                               session_id: s.session_id,
                                               sequence_number: seq,
                                               shard_prefix: shard.clone() });
            }
            entry.refresh_gap(now);
        }
        let previous = self.by_flow.insert(*flow_id, keep.clone()).unwrap_or_default();
        for orphan in previous.difference(&keep) {
            self.sessions.remove(orphan);
        }
        acked
    }

    /// Olvida todas las sesiones de un flujo terminado. Los mensajes que
    /// lleguen después se descartan.
    pub fn close_flow(&self, flow_id: &FlowId) {
        if let Some((_, ids)) = self.by_flow.remove(flow_id) {
            for sid in ids {
                self.sessions.remove(&sid);
            }
        }
    }

    /// Olvida el estado en memoria de los flujos de los shards cedidos.
    pub fn evict_shards(&self, released: &BTreeSet<ShardId>) -> usize {
        let flows: Vec<FlowId> = self.by_flow
                                     .iter()
                                     .map(|e| *e.key())
                                     .filter(|f| released.contains(&self.router.shard_of(f)))
                                     .collect();
        for f in flows.iter() {
            self.close_flow(f);
        }
        flows.len()
    }

    pub fn session(&self, session_id: &SessionId) -> Option<Session> {
        self.sessions.get(session_id).map(|e| e.session.clone())
    }

    pub fn buffered(&self, session_id: &SessionId) -> usize {
        self.sessions.get(session_id).map(|e| e.pending.len()).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn flow_sessions(&self, flow_id: &FlowId) -> Vec<SessionId> {
        self.by_flow.get(flow_id).map(|s| s.iter().copied().collect()).unwrap_or_default()
    }
}
