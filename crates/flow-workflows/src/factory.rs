use crate::errors::WorkflowError;
use crate::flow_kind::FlowKind;
use crate::flows::{BroadcastFlow, OrchestratorFlow, PingPongFlow, TimerFlow};
use crate::typed::Typed;
use flow::{FlowDescriptor, FlowId, FlowRegistry, FlowSupervisor};
use serde_json::{json, Value as JsonValue};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Límite de rondas de ping_pong si el registro no indica otro.
pub const DEFAULT_MAX_ROUNDS: u64 = 100;
/// Límite de hijos de un orquestador si el registro no indica otro.
pub const DEFAULT_MAX_CHILDREN: u64 = 32;

/// Registro con los cuatro flujos incluidos y sus validadores.
pub fn builtin_registry() -> FlowRegistry {
  let mut registry = FlowRegistry::new();
  registry.register_with_validator(Arc::new(Typed(PingPongFlow)),
                                   Some(validate_ping_pong),
                                   Some(json!({"max_rounds": DEFAULT_MAX_ROUNDS})))
          .register_with_validator(Arc::new(Typed(BroadcastFlow)), Some(validate_broadcast), None)
          .register_with_validator(Arc::new(Typed(TimerFlow)), Some(validate_timer), None)
          .register_with_validator(Arc::new(Typed(OrchestratorFlow)),
                                   Some(validate_orchestrator),
                                   Some(json!({"max_children": DEFAULT_MAX_CHILDREN})));
  registry
}

/// Descriptor para uno de los flujos incluidos.
pub fn descriptor(kind: FlowKind, args: JsonValue) -> FlowDescriptor {
  FlowDescriptor::new(kind.logic_name(), args)
}

fn as_object(args: &JsonValue) -> Result<serde_json::Map<String, JsonValue>, Vec<String>> {
  match args {
    JsonValue::Object(m) => Ok(m.clone()),
    JsonValue::Null => Ok(serde_json::Map::new()),
    other => Err(vec![format!("los argumentos deben ser un objeto, no {}", other)]),
  }
}

fn option_u64(options: Option<&JsonValue>, key: &str, default: u64) -> u64 {
  options.and_then(|o| o.get(key)).and_then(|v| v.as_u64()).unwrap_or(default)
}

fn check_timeout(args: &serde_json::Map<String, JsonValue>, errors: &mut Vec<String>) {
  match args.get("timeout_ms") {
    None | Some(JsonValue::Null) => {}
    Some(v) if v.as_u64().map(|ms| ms > 0).unwrap_or(false) => {}
    Some(v) => errors.push(format!("timeout_ms debe ser un entero positivo, no {}", v)),
  }
}

pub fn validate_ping_pong(args: &JsonValue, options: Option<&JsonValue>) -> Result<JsonValue, Vec<String>> {
  let mut args = as_object(args)?;
  let mut errors = Vec::new();
  match args.get("counterparty").and_then(|v| v.as_str()) {
    Some(c) if !c.trim().is_empty() => {}
    _ => errors.push("counterparty es obligatorio".to_string()),
  }
  let max_rounds = option_u64(options, "max_rounds", DEFAULT_MAX_ROUNDS);
  let rounds = args.get("rounds").cloned().unwrap_or(json!(1));
  match rounds.as_u64() {
    Some(r) if r >= 1 && r <= max_rounds => {}
    _ => errors.push(format!("rounds debe estar entre 1 y {}, no {}", max_rounds, rounds)),
  }
  check_timeout(&args, &mut errors);
  if !errors.is_empty() {
    return Err(errors);
  }
  args.insert("rounds".into(), rounds);
  args.entry("payload").or_insert(JsonValue::Null);
  Ok(JsonValue::Object(args))
}

pub fn validate_broadcast(args: &JsonValue, _options: Option<&JsonValue>) -> Result<JsonValue, Vec<String>> {
  let args = as_object(args)?;
  let mut errors = Vec::new();
  match args.get("counterparties").and_then(|v| v.as_array()) {
    Some(list) if !list.is_empty() => {
      let mut seen = BTreeSet::new();
      for party in list {
        match party.as_str() {
          Some(p) if !p.trim().is_empty() => {
            if !seen.insert(p) {
              errors.push(format!("contraparte repetida: {}", p));
            }
          }
          _ => errors.push(format!("contraparte invalida: {}", party)),
        }
      }
    }
    _ => errors.push("counterparties debe ser una lista no vacia".to_string()),
  }
  check_timeout(&args, &mut errors);
  if errors.is_empty() {
    Ok(JsonValue::Object(args))
  } else {
    Err(errors)
  }
}

pub fn validate_timer(args: &JsonValue, _options: Option<&JsonValue>) -> Result<JsonValue, Vec<String>> {
  let mut args = as_object(args)?;
  match args.get("delay_ms") {
    None => {
      args.insert("delay_ms".into(), json!(1_000));
    }
    Some(v) if v.as_u64().is_some() => {}
    Some(v) => return Err(vec![format!("delay_ms debe ser un entero no negativo, no {}", v)]),
  }
  Ok(JsonValue::Object(args))
}

pub fn validate_orchestrator(args: &JsonValue, options: Option<&JsonValue>) -> Result<JsonValue, Vec<String>> {
  let args = as_object(args)?;
  let max_children = option_u64(options, "max_children", DEFAULT_MAX_CHILDREN) as usize;
  let children = match args.get("children").and_then(|v| v.as_array()) {
    Some(c) if !c.is_empty() => c,
    _ => return Err(vec!["children debe ser una lista no vacia".to_string()]),
  };
  let mut errors = Vec::new();
  if children.len() > max_children {
    errors.push(format!("demasiados hijos: {} (maximo {})", children.len(), max_children));
  }
  for (i, child) in children.iter().enumerate() {
    match serde_json::from_value::<FlowDescriptor>(child.clone()) {
      Ok(d) if d.logic.trim().is_empty() => errors.push(format!("hijo {}: logic vacio", i)),
      Ok(_) => {}
      Err(e) => errors.push(format!("hijo {}: {}", i, e)),
    }
  }
  if errors.is_empty() {
    Ok(JsonValue::Object(args))
  } else {
    Err(errors)
  }
}

/// Consultas de operador agrupadas por tipo de flujo.
pub struct FlowWorkflowFactory;
impl FlowWorkflowFactory {
  /// Flujos activos del supervisor y su tipo. Las lógicas que no son de
  /// este crate quedan fuera.
  pub fn active_by_kind(supervisor: &FlowSupervisor) -> Result<HashMap<FlowId, FlowKind>, WorkflowError> {
    let mut out = HashMap::new();
    for summary in supervisor.active_flows()? {
      if let Ok(kind) = summary.logic.parse::<FlowKind>() {
        out.insert(summary.flow_id, kind);
      }
    }
    Ok(out)
  }

  /// Valida y admite un flujo incluido.
  pub fn submit(supervisor: &FlowSupervisor, kind: FlowKind, args: JsonValue) -> Result<FlowId, WorkflowError> {
    let flow_id = supervisor.submit(descriptor(kind, args))?;
    log::info!("workflows: {} admitido como {}", kind, flow_id);
    Ok(flow_id)
  }
}
