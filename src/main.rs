use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use flow::driver::run_ticker;
use flow::{CounterpartyId, FlowSupervisor, MessageEnvelope, MessageTransport, SessionId, SupervisorConfig};
use flow_workflows::{builtin_registry, FlowKind, FlowWorkflowFactory};
use serde_json::json;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Transporte de consola: imprime cada envío y lo guarda para que el
/// operador pueda contestar en nombre de la contraparte.
#[derive(Default)]
struct ConsoleTransport {
    outbox: Mutex<Vec<(CounterpartyId, MessageEnvelope)>>,
    replies: Mutex<HashMap<SessionId, u64>>,
}

impl MessageTransport for ConsoleTransport {
    fn send(&self, to: &CounterpartyId, envelope: &MessageEnvelope) -> flow::Result<()> {
        println!("  -> {} [{}] {}", to, envelope.id, envelope.payload);
        if let Ok(mut outbox) = self.outbox.lock() {
            outbox.push((to.clone(), envelope.clone()));
        }
        Ok(())
    }
}

impl ConsoleTransport {
    fn outbox(&self) -> Vec<(CounterpartyId, MessageEnvelope)> {
        self.outbox.lock().map(|o| o.clone()).unwrap_or_default()
    }

    /// Respuesta al envío `index` con la siguiente secuencia de la
    /// contraparte en esa sesión.
    fn reply_to(&self, index: usize, payload: serde_json::Value) -> Option<MessageEnvelope> {
        let (_, original) = self.outbox().get(index)?.clone();
        let mut replies = self.replies.lock().ok()?;
        let seq = replies.entry(original.id.session_id).or_insert(0);
        *seq += 1;
        Some(original.reply(*seq, payload))
    }
}

/// Menú de operador sobre un supervisor de flujos.
///
/// Opciones soportadas:
/// 1) Lanzar flujo (ping_pong, broadcast, timer, orchestrator)
/// 2) Ver flujos activos
/// 3) Ver mensajes enviados y contestar uno
/// 4) Ver hospitalizados
/// 5) Reintentar un hospitalizado
/// 6) Matar flujo
/// 7) Activar/desactivar drenaje
/// 8) Estado del worker
/// 9) Salir
fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let config = SupervisorConfig::from_env().context("configuracion FLOW_*")?;
    let store = Arc::new(flow_persistence::new_from_env().context("store de checkpoints")?);
    let transport = Arc::new(ConsoleTransport::default());
    let supervisor = Arc::new(FlowSupervisor::new(config.clone(), store, transport.clone(), Arc::new(builtin_registry()))?);

    let recovered = supervisor.recover()?;
    println!("Recuperados {} de {} flujos ({} con error)", recovered.resumed, recovered.scanned, recovered.errors);

    let runtime = tokio::runtime::Runtime::new()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ticker = runtime.spawn(run_ticker(supervisor.clone(), config.tick_interval(), shutdown_rx));

    loop {
        println!("\n== Flowstate operador ({}) ==", config.worker_id);
        println!("1) Lanzar flujo");
        println!("2) Ver flujos activos");
        println!("3) Ver enviados / contestar");
        println!("4) Ver hospitalizados");
        println!("5) Reintentar hospitalizado");
        println!("6) Matar flujo");
        println!("7) Drenaje on/off");
        println!("8) Estado");
        println!("9) Salir");
        let choice = prompt("Elige una opción: ")?;
        let result = match choice.trim() {
            "1" => submit_flow(&supervisor),
            "2" => list_active(&supervisor),
            "3" => answer(&supervisor, &transport),
            "4" => list_hospitalized(&supervisor),
            "5" => retry(&supervisor),
            "6" => kill(&supervisor),
            "7" => {
                let value = !supervisor.is_draining();
                supervisor.set_draining(value);
                println!("Drenaje {}", if value { "activado" } else { "desactivado" });
                Ok(())
            }
            "8" => status(&supervisor),
            "9" => {
                println!("Saliendo...");
                break;
            }
            other => {
                println!("Opción inválida: {}", other);
                Ok(())
            }
        };
        if let Err(e) = result {
            eprintln!("Error: {:#}", e);
        }
    }

    shutdown_tx.send(true).ok();
    let stats = runtime.block_on(ticker)?;
    log::info!("ticker detenido tras {} ticks ({} temporizadores)", stats.ticks, stats.timers_fired);
    Ok(())
}

fn submit_flow(supervisor: &FlowSupervisor) -> anyhow::Result<()> {
    let names: Vec<String> = FlowKind::ALL.iter().map(|k| k.to_string()).collect();
    let kind: FlowKind = prompt(&format!("Tipo ({}): ", names.join(", ")))?.trim().parse()?;
    let example = match kind {
        FlowKind::PingPong => json!({"counterparty": "bob", "rounds": 2}),
        FlowKind::Broadcast => json!({"counterparties": ["ana", "bea"]}),
        FlowKind::Timer => json!({"delay_ms": 5000}),
        FlowKind::Orchestrator => json!({"children": [{"logic": "timer", "args": {"delay_ms": 1000}}]}),
    };
    let raw = prompt(&format!("Argumentos JSON (enter para {}): ", example))?;
    let args = if raw.trim().is_empty() {
        example
    } else {
        serde_json::from_str(raw.trim()).context("JSON invalido")?
    };
    let flow_id = FlowWorkflowFactory::submit(supervisor, kind, args)?;
    println!("Flujo lanzado: {} ({:?})", flow_id, supervisor.status(&flow_id)?);
    Ok(())
}

fn list_active(supervisor: &FlowSupervisor) -> anyhow::Result<()> {
    println!("\nID                                   | SHARD | V  | ESTADO     | LOGICA       | ESPERA");
    println!("---------------------------------------------------------------------------------------");
    for f in supervisor.active_flows()? {
        println!("{} | {:5} | {:2} | {:10} | {:12} | {:?}", f.flow_id, f.shard.to_string(), f.version, f.status.as_str(), f.logic, f.waiting_on);
    }
    Ok(())
}

fn answer(supervisor: &FlowSupervisor, transport: &ConsoleTransport) -> anyhow::Result<()> {
    let outbox = transport.outbox();
    if outbox.is_empty() {
        println!("No hay mensajes enviados");
        return Ok(());
    }
    for (i, (to, env)) in outbox.iter().enumerate() {
        println!("{:3}) {} [{}] {}", i, to, env.id, env.payload);
    }
    let raw = prompt("Contestar al número (enter para volver): ")?;
    if raw.trim().is_empty() {
        return Ok(());
    }
    let index: usize = raw.trim().parse().context("numero invalido")?;
    let payload_s = prompt("Respuesta (JSON o texto simple): ")?;
    let payload = serde_json::from_str(payload_s.trim()).unwrap_or_else(|_| json!(payload_s.trim()));
    let reply = transport.reply_to(index, payload).ok_or_else(|| anyhow!("no existe el envio {}", index))?;
    println!("Entrega: {:?}", supervisor.deliver(reply)?);
    Ok(())
}

fn list_hospitalized(supervisor: &FlowSupervisor) -> anyhow::Result<()> {
    let entries = supervisor.hospitalized()?;
    if entries.is_empty() {
        println!("Hospital vacío");
    }
    for e in entries {
        let cause = e.note.as_ref().map(|n| n.cause.as_str()).unwrap_or("-");
        println!("{} | {} | desde {} | {} intentos | {}", e.flow_id, e.logic, e.since, e.records.len(), cause);
    }
    Ok(())
}

fn retry(supervisor: &FlowSupervisor) -> anyhow::Result<()> {
    let id = read_flow_id("Flow id a reintentar (UUID): ")?;
    println!("Resultado: {:?}", supervisor.retry_hospitalized(id)?);
    Ok(())
}

fn kill(supervisor: &FlowSupervisor) -> anyhow::Result<()> {
    let id = read_flow_id("Flow id a matar (UUID): ")?;
    let confirm = prompt(&format!("Confirma kill de {}? escribir 'yes' para confirmar: ", id))?;
    if confirm.trim().to_lowercase() != "yes" {
        println!("Kill cancelado");
        return Ok(());
    }
    if supervisor.kill(id, "operador")? {
        println!("Flujo {} marcado para terminar", id);
    } else {
        println!("El flujo {} no está activo", id);
    }
    Ok(())
}

fn status(supervisor: &FlowSupervisor) -> anyhow::Result<()> {
    let report = supervisor.report()?;
    println!("worker:     {}", report.worker_id);
    println!("shards:     {}", report.owned_shards);
    println!("drenaje:    {} (drenado: {})", report.draining, supervisor.is_drained()?);
    println!("ejecuciones activas: {}", report.active_executions);
    println!("temporizadores: {}  sesiones: {}", report.pending_timers, report.tracked_sessions);
    for (status, count) in &report.flows_by_status {
        println!("  {:12} {}", status.as_str(), count);
    }
    Ok(())
}

fn read_flow_id(msg: &str) -> anyhow::Result<Uuid> {
    let raw = prompt(msg)?;
    Uuid::parse_str(raw.trim()).context("UUID inválido")
}

fn prompt(msg: &str) -> io::Result<String> {
    print!("{}", msg);
    io::stdout().flush()?;
    let mut s = String::new();
    io::stdin().read_line(&mut s)?;
    Ok(s)
}
