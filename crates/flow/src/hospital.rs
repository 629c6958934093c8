// Archivo: hospital.rs
// Propósito: clasificar los fallos de los flujos y decidir si se
// reintentan con backoff, se hospitalizan para intervención manual o se
// terminan. Mantiene un historial clínico por flujo.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::domain::{Classification, FlowFailure, FlowId};
use crate::errors::{FlowError, FlowLogicError, Result};

/// Decisión del hospital para un fallo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Retry { after: Duration },
    Hospitalize,
    Kill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Retry,
    Hospitalize,
    Kill,
}

impl From<Decision> for Outcome {
    fn from(d: Decision) -> Self {
        match d {
            Decision::Retry { .. } => Outcome::Retry,
            Decision::Hospitalize => Outcome::Hospitalize,
            Decision::Kill => Outcome::Kill,
        }
    }
}

/// Política de reintentos: techo de intentos por punto de suspensión y
/// backoff exponencial acotado.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3,
               base_delay: Duration::from_millis(1_000),
               max_delay: Duration::from_millis(120_000) }
    }
}

impl RetryPolicy {
    /// `base * 2^(attempt-1)`, limitado a `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exp;
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Especialista que emite un veredicto sobre un fallo, o se abstiene.
pub trait Diagnostician: Send + Sync {
    fn name(&self) -> &str;
    fn diagnose(&self, cause: &FlowLogicError) -> Option<Classification>;
}

/// Respeta la clasificación que la propia lógica dio al error.
struct ExplicitClassification;

impl Diagnostician for ExplicitClassification {
    fn name(&self) -> &str {
        "explicit"
    }

    fn diagnose(&self, cause: &FlowLogicError) -> Option<Classification> {
        match cause {
            FlowLogicError::Transient(_) => Some(Classification::Transient),
            FlowLogicError::Permanent(_) | FlowLogicError::Aborted(_) => Some(Classification::Permanent),
            FlowLogicError::SessionGap { .. } | FlowLogicError::Other(_) => None,
        }
    }
}

/// Reconoce fallos genéricos por patrones del mensaje.
struct PatternSpecialist {
    name: &'static str,
    patterns: &'static [&'static str],
}

impl Diagnostician for PatternSpecialist {
    fn name(&self) -> &str {
        self.name
    }

    fn diagnose(&self, cause: &FlowLogicError) -> Option<Classification> {
        let FlowLogicError::Other(msg) = cause else {
            return None;
        };
        let msg = msg.to_ascii_lowercase();
        self.patterns.iter().any(|p| msg.contains(p)).then_some(Classification::Transient)
    }
}

/// Manda al hospital los huecos de secuencia vencidos.
struct GapSpecialist;

impl Diagnostician for GapSpecialist {
    fn name(&self) -> &str {
        "gap"
    }

    fn diagnose(&self, cause: &FlowLogicError) -> Option<Classification> {
        matches!(cause, FlowLogicError::SessionGap { .. }).then_some(Classification::Unknown)
    }
}

static DEFAULT_STAFF: Lazy<Vec<Arc<dyn Diagnostician>>> = Lazy::new(|| {
    vec![Arc::new(ExplicitClassification),
         Arc::new(PatternSpecialist { name: "connection",
                                      patterns: &["connection", "timed out", "unavailable"] }),
         Arc::new(PatternSpecialist { name: "database",
                                      patterns: &["deadlock", "could not serialize", "database is locked"] }),
         Arc::new(GapSpecialist),]
});

/// Entrada del historial clínico de un flujo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MedicalRecord {
    pub flow_id: FlowId,
    pub at: DateTime<Utc>,
    /// Número de checkpoints confirmados al fallar; identifica el punto de
    /// suspensión.
    pub suspend_count: u64,
    pub attempt: u32,
    pub cause: String,
    pub classification: Classification,
    pub outcome: Outcome,
}

pub struct FlowHospital {
    policy: RetryPolicy,
    staff: Vec<Arc<dyn Diagnostician>>,
    records: Mutex<HashMap<FlowId, Vec<MedicalRecord>>>,
}

impl FlowHospital {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_staff(policy, DEFAULT_STAFF.clone())
    }

    pub fn with_staff(policy: RetryPolicy, staff: Vec<Arc<dyn Diagnostician>>) -> Self {
        Self { policy,
               staff,
               records: Mutex::new(HashMap::new()) }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<FlowId, Vec<MedicalRecord>>>> {
        self.records.lock().map_err(|e| FlowError::Storage(format!("mutex poisoned: {:?}", e)))
    }

    /// Consulta al personal. Un veredicto permanente prevalece sobre uno
    /// transitorio; sin veredictos, o con sólo veredictos de desconocido,
    /// el fallo es desconocido y se hospitaliza.
    pub fn classify(&self, failure: &FlowFailure) -> Classification {
        let verdicts: Vec<Classification> = self.staff.iter().filter_map(|d| d.diagnose(&failure.cause)).collect();
        if verdicts.contains(&Classification::Permanent) {
            Classification::Permanent
        } else if verdicts.contains(&Classification::Transient) {
            Classification::Transient
        } else {
            Classification::Unknown
        }
    }

    /// Decisión pura a partir de la clasificación y el número de intento.
    pub fn schedule(&self, failure: &FlowFailure) -> Decision {
        match failure.classification {
            Classification::Transient if failure.attempt < self.policy.max_attempts => Decision::Retry { after: self.policy.backoff(failure.attempt) },
            Classification::Transient => Decision::Hospitalize,
            Classification::Permanent => Decision::Kill,
            Classification::Unknown => Decision::Hospitalize,
        }
    }

    /// Admite un fallo: calcula el intento (fallos previos en el mismo
    /// punto de suspensión + 1), lo clasifica, decide y lo anota.
    pub fn admit(&self, flow_id: FlowId, suspend_count: u64, cause: FlowLogicError) -> Result<(FlowFailure, Decision)> {
        let mut records = self.lock()?;
        let history = records.entry(flow_id).or_default();
        let previous = history.iter().filter(|r| r.suspend_count == suspend_count).count() as u32;
        let mut failure = FlowFailure { flow_id,
                                        cause,
                                        attempt: previous + 1,
                                        classification: Classification::Unknown };
        failure.classification = self.classify(&failure);
        let decision = self.schedule(&failure);
        history.push(MedicalRecord { flow_id,
                                     at: Utc::now(),
                                     suspend_count,
                                     attempt: failure.attempt,
                                     cause: failure.cause.to_string(),
                                     classification: failure.classification,
                                     outcome: decision.into() });
        log::info!("hospital: flow {} intento {} ({}) -> {:?}: {}",
                   flow_id,
                   failure.attempt,
                   failure.classification,
                   decision,
                   failure.cause);
        Ok((failure, decision))
    }

    /// Historial clínico del flujo (vacío si nunca falló o fue dado de alta).
    pub fn records(&self, flow_id: &FlowId) -> Vec<MedicalRecord> {
        self.lock().ok().and_then(|r| r.get(flow_id).cloned()).unwrap_or_default()
    }

    /// Da de alta al flujo: olvida su historial.
    pub fn discharge(&self, flow_id: &FlowId) {
        if let Ok(mut r) = self.lock() {
            r.remove(flow_id);
        }
    }
}
