// Archivo: driver.rs
// Propósito: integración con tokio. Un ticker periódico dispara los
// temporizadores del supervisor y una bomba consume mensajes de una fuente
// asíncrona. El supervisor es síncrono; cada llamada corre en
// `spawn_blocking`.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, watch};

use crate::domain::MessageEnvelope;
use crate::errors::{FlowError, Result};
use crate::service::FlowSupervisor;
use crate::session::DeliveryOutcome;

/// Fuente asíncrona de mensajes entrantes. `None` indica fin del flujo de
/// entrada.
#[async_trait]
pub trait InboundSource: Send {
    async fn next_envelope(&mut self) -> Option<MessageEnvelope>;
}

#[async_trait]
impl InboundSource for mpsc::Receiver<MessageEnvelope> {
    async fn next_envelope(&mut self) -> Option<MessageEnvelope> {
        self.recv().await
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickerStats {
    pub ticks: u64,
    pub timers_fired: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub delivered: u64,
    pub resumed: u64,
    pub buffered: u64,
    pub duplicates: u64,
    pub discarded: u64,
    pub not_owned: u64,
}

/// Llama a `tick` cada `every` hasta que `shutdown` pase a true o se cierre.
pub async fn run_ticker(supervisor: Arc<FlowSupervisor>, every: Duration, mut shutdown: watch::Receiver<bool>) -> TickerStats {
    let mut stats = TickerStats::default();
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let sup = supervisor.clone();
                stats.ticks += 1;
                match tokio::task::spawn_blocking(move || sup.tick(Utc::now())).await {
                    Ok(Ok(report)) => {
                        stats.timers_fired += report.timers_fired as u64;
                        stats.errors += report.errors as u64;
                    }
                    Ok(Err(e)) => {
                        log::error!("driver: tick fallo: {}", e);
                        stats.errors += 1;
                    }
                    Err(e) => {
                        log::error!("driver: tarea de tick abortada: {}", e);
                        stats.errors += 1;
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    log::info!("driver: ticker detenido tras {} ticks", stats.ticks);
    stats
}

/// Entrega al supervisor todo lo que produzca `source` hasta agotarla.
pub async fn pump_inbound<S>(supervisor: Arc<FlowSupervisor>, mut source: S) -> Result<PumpStats>
    where S: InboundSource
{
    let mut stats = PumpStats::default();
    while let Some(envelope) = source.next_envelope().await {
        let sup = supervisor.clone();
        let outcome = tokio::task::spawn_blocking(move || sup.deliver(envelope)).await
                                                                                 .map_err(|e| FlowError::Other(format!("tarea de entrega abortada: {}", e)))??;
        stats.delivered += 1;
        match outcome {
            DeliveryOutcome::Resumes(_) => stats.resumed += 1,
            DeliveryOutcome::Buffered => stats.buffered += 1,
            DeliveryOutcome::Duplicate => stats.duplicates += 1,
            DeliveryOutcome::Discarded => stats.discarded += 1,
            DeliveryOutcome::NotOwned => stats.not_owned += 1,
        }
    }
    Ok(stats)
}
