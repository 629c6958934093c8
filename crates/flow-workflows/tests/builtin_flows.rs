use std::sync::Arc;

use chrono::{Duration, Utc};
use flow::{CounterpartyId, DeliveryOutcome, FlowError, FlowRegistry, FlowStatus, FlowSupervisor, InMemoryCheckpointStore, RecordingTransport, SupervisorConfig};
use flow_workflows::{builtin_registry, descriptor, FlowKind, FlowWorkflowFactory, Typed, WorkflowError};
use flow_workflows::flows::PingPongFlow;
use serde_json::json;

fn supervisor_with(registry: FlowRegistry) -> (FlowSupervisor, Arc<RecordingTransport>) {
  let transport = Arc::new(RecordingTransport::new());
  let config = SupervisorConfig { retry_base_delay_ms: 0,
                                  retry_max_delay_ms: 0,
                                  ..SupervisorConfig::default() };
  let supervisor = FlowSupervisor::new(config, Arc::new(InMemoryCheckpointStore::new()), transport.clone(), Arc::new(registry)).unwrap();
  (supervisor, transport)
}

fn supervisor() -> (FlowSupervisor, Arc<RecordingTransport>) {
  supervisor_with(builtin_registry())
}

#[test]
fn flow_kind_parses_its_own_names() {
  for kind in FlowKind::ALL {
    assert_eq!(kind.to_string().parse::<FlowKind>().unwrap(), kind);
  }
  assert_eq!("Ping-Pong".parse::<FlowKind>().unwrap(), FlowKind::PingPong);
  assert!(matches!("cadena".parse::<FlowKind>(), Err(WorkflowError::Validation(_))));
}

#[test]
fn ping_pong_runs_all_rounds() {
  let (sup, transport) = supervisor();
  let bob = CounterpartyId::from("bob");
  let f = FlowWorkflowFactory::submit(&sup, FlowKind::PingPong, json!({"counterparty": "bob", "rounds": 2, "payload": "hola"})).unwrap();

  let first = transport.sent_to(&bob);
  assert_eq!(first.len(), 1);
  assert_eq!(first[0].payload, json!({"round": 1, "payload": "hola"}));
  assert_eq!(sup.deliver(first[0].reply(1, json!("r1"))).unwrap(), DeliveryOutcome::Resumes(f));

  let second = transport.sent_to(&bob);
  assert_eq!(second.len(), 2);
  assert_eq!(second[1].id.sequence_number, 2);
  assert_eq!(second[1].id.session_id, first[0].id.session_id);
  sup.deliver(second[1].reply(2, json!("r2"))).unwrap();

  let result = sup.outcome(&f).unwrap().result.unwrap();
  assert_eq!(result["replies"], json!(["r1", "r2"]));
}

#[test]
fn ping_pong_timeout_completes_with_partial_replies() {
  let (sup, transport) = supervisor();
  let f = sup.submit(descriptor(FlowKind::PingPong, json!({"counterparty": "bob", "timeout_ms": 100}))).unwrap();
  sup.tick(Utc::now() + Duration::seconds(1)).unwrap();
  // el envío del checkpoint ya salió: despertar por plazo no lo repite
  assert_eq!(transport.sent().len(), 1);
  let result = sup.outcome(&f).unwrap().result.unwrap();
  assert_eq!(result["timed_out_in_round"], json!(1));
  assert_eq!(result["replies"], json!([]));
}

#[test]
fn ping_pong_gap_tick_does_not_resend_within_the_process() {
  let (sup, transport) = supervisor();
  let bob = CounterpartyId::from("bob");
  let f = FlowWorkflowFactory::submit(&sup, FlowKind::PingPong, json!({"counterparty": "bob", "rounds": 1})).unwrap();
  let first = transport.sent_to(&bob);
  assert_eq!(sup.deliver(first[0].reply(2, json!("tarde"))).unwrap(), DeliveryOutcome::Buffered);

  let report = sup.tick(Utc::now() + Duration::seconds(60)).unwrap();
  assert_eq!(report.gaps_expired, 1);
  assert_eq!(sup.status(&f).unwrap(), Some(FlowStatus::Hospitalized));
  assert_eq!(transport.sent_to(&bob).len(), 1);

  // la readmisión tampoco lo repite
  sup.deliver(first[0].reply(1, json!("r1"))).unwrap();
  sup.retry_hospitalized(f).unwrap();
  assert_eq!(transport.sent_to(&bob).len(), 1);
  assert_eq!(sup.outcome(&f).unwrap().result.unwrap()["replies"], json!(["r1"]));
}

#[test]
fn broadcast_collects_replies_in_any_arrival_order() {
  let (sup, transport) = supervisor();
  let parties = ["ana", "bea", "cris"];
  let f = sup.submit(descriptor(FlowKind::Broadcast, json!({"counterparties": parties, "payload": {"q": 1}}))).unwrap();
  assert_eq!(transport.sent().len(), 3);

  // cris y bea contestan antes que ana
  for party in ["cris", "bea"] {
    let out = &transport.sent_to(&CounterpartyId::from(party))[0];
    assert_eq!(sup.deliver(out.reply(1, json!(format!("{}!", party)))).unwrap(), DeliveryOutcome::Buffered);
  }
  assert_eq!(sup.status(&f).unwrap(), Some(FlowStatus::Suspended));

  let ana = &transport.sent_to(&CounterpartyId::from("ana"))[0];
  assert_eq!(sup.deliver(ana.reply(1, json!("ana!"))).unwrap(), DeliveryOutcome::Resumes(f));

  let result = sup.outcome(&f).unwrap().result.unwrap();
  assert_eq!(result["replies"], json!({"ana": "ana!", "bea": "bea!", "cris": "cris!"}));
}

#[test]
fn broadcast_timeout_marks_missing_parties() {
  let (sup, transport) = supervisor();
  let f = sup.submit(descriptor(FlowKind::Broadcast, json!({"counterparties": ["ana", "bea"], "timeout_ms": 100}))).unwrap();
  let ana = &transport.sent_to(&CounterpartyId::from("ana"))[0];
  sup.deliver(ana.reply(1, json!("si"))).unwrap();
  sup.tick(Utc::now() + Duration::seconds(1)).unwrap();

  let result = sup.outcome(&f).unwrap().result.unwrap();
  assert_eq!(result["timed_out"], json!(true));
  assert_eq!(result["replies"], json!({"ana": "si", "bea": null}));
}

#[test]
fn timer_wakes_on_tick() {
  let (sup, _) = supervisor();
  let f = sup.submit(descriptor(FlowKind::Timer, json!({"delay_ms": 200, "label": "siesta"}))).unwrap();
  assert_eq!(sup.status(&f).unwrap(), Some(FlowStatus::Suspended));
  assert_eq!(FlowWorkflowFactory::active_by_kind(&sup).unwrap().get(&f), Some(&FlowKind::Timer));

  sup.tick(Utc::now() + Duration::seconds(1)).unwrap();
  assert_eq!(sup.outcome(&f).unwrap().result.unwrap()["label"], json!("siesta"));
}

#[test]
fn orchestrator_runs_children_in_sequence() {
  let (sup, _) = supervisor();
  let children = json!([{"logic": "timer", "args": {"delay_ms": 0, "label": "a"}},
                        {"logic": "timer", "args": {"delay_ms": 0, "label": "b"}}]);
  let f = sup.submit(descriptor(FlowKind::Orchestrator, json!({"children": children}))).unwrap();

  let result = sup.outcome(&f).expect("orquestador terminado").result.unwrap();
  let reports = result["children"].as_array().unwrap();
  assert_eq!(reports.len(), 2);
  assert_eq!(reports[0]["status"], json!("COMPLETED"));
  assert_eq!(reports[0]["result"]["label"], json!("a"));
  assert_eq!(reports[1]["result"]["label"], json!("b"));
}

#[test]
fn orchestrator_fail_fast_kills_the_parent() {
  let (sup, _) = supervisor();
  // el validador de timer no mira label; el hijo muere al leer sus argumentos
  let children = json!([{"logic": "timer", "args": {"delay_ms": 0, "label": 5}},
                        {"logic": "timer", "args": {"delay_ms": 0}}]);
  let f = sup.submit(descriptor(FlowKind::Orchestrator, json!({"children": children, "fail_fast": true}))).unwrap();
  assert_eq!(sup.status(&f).unwrap(), Some(FlowStatus::Killed));
  assert!(sup.outcome(&f).unwrap().error.unwrap().contains("KILLED"));
}

#[test]
fn validators_reject_bad_arguments() {
  let (sup, _) = supervisor();
  let bad = [(FlowKind::PingPong, json!({})),
             (FlowKind::PingPong, json!({"counterparty": "bob", "rounds": 0})),
             (FlowKind::PingPong, json!({"counterparty": "bob", "timeout_ms": -5})),
             (FlowKind::Broadcast, json!({"counterparties": []})),
             (FlowKind::Broadcast, json!({"counterparties": ["ana", "ana"]})),
             (FlowKind::Timer, json!({"delay_ms": "pronto"})),
             (FlowKind::Orchestrator, json!({"children": [{"args": {}}]})),
             (FlowKind::Timer, json!([1, 2]))];
  for (kind, args) in bad {
    let err = sup.submit(descriptor(kind, args.clone())).unwrap_err();
    assert!(matches!(err, FlowError::Validation(_)), "{} {} -> {:?}", kind, args, err);
  }
}

#[test]
fn typed_adapter_rejects_unreadable_arguments_permanently() {
  let mut registry = FlowRegistry::new();
  registry.register(Arc::new(Typed(PingPongFlow)));
  let (sup, transport) = supervisor_with(registry);
  let f = sup.submit(descriptor(FlowKind::PingPong, json!({"rounds": "muchas"}))).unwrap();
  assert_eq!(sup.status(&f).unwrap(), Some(FlowStatus::Killed));
  assert!(transport.sent().is_empty());
}
