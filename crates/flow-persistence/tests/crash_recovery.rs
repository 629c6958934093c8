// Un supervisor se "cae" con flujos suspendidos; otro proceso abre la misma
// base y los termina.
use std::sync::Arc;

use chrono::{Duration, Utc};
use flow::{CheckpointStore, Continuation, CounterpartyId, DeliveryOutcome, FlowContext, FlowDescriptor, FlowLogic, FlowLogicError, FlowRegistry, FlowStatus, FlowSupervisor, RecordingTransport, Resume, SessionId, Suspend, SupervisorConfig};
use flow_persistence::DieselCheckpointStore;
use serde_json::json;
use tempfile::TempDir;

struct Nap;

impl FlowLogic for Nap {
  fn name(&self) -> &str {
    "test.nap"
  }

  fn step(&self, ctx: &mut FlowContext<'_>, cont: &mut Continuation, resume: Resume) -> Result<Suspend, FlowLogicError> {
    match (cont.pc, resume) {
      (0, Resume::Start) => {
        cont.jump(1);
        Ok(Suspend::Sleep { until: ctx.now() + Duration::milliseconds(500) })
      }
      (1, Resume::Woke) => Ok(Suspend::Complete { result: json!("despierto") }),
      (pc, other) => Err(FlowLogicError::Permanent(format!("pc {} inesperado con {:?}", pc, other))),
    }
  }
}

struct Ask;

impl FlowLogic for Ask {
  fn name(&self) -> &str {
    "test.ask"
  }

  fn step(&self, ctx: &mut FlowContext<'_>, cont: &mut Continuation, resume: Resume) -> Result<Suspend, FlowLogicError> {
    match (cont.pc, resume) {
      (0, Resume::Start) => {
        let session = ctx.open_session("carol");
        cont.set("session", &session)?;
        cont.jump(1);
        Ok(Suspend::SendAndReceive { session_id: session,
                                     payload: json!("pregunta"),
                                     deadline: None })
      }
      (1, Resume::Message { payload, .. }) => Ok(Suspend::Complete { result: payload }),
      (pc, other) => Err(FlowLogicError::Permanent(format!("pc {} inesperado con {:?}", pc, other))),
    }
  }
}

fn supervisor(store: Arc<DieselCheckpointStore>, transport: Arc<RecordingTransport>) -> FlowSupervisor {
  let mut registry = FlowRegistry::new();
  registry.register(Arc::new(Nap)).register(Arc::new(Ask));
  FlowSupervisor::new(SupervisorConfig::default(), store, transport, Arc::new(registry)).expect("supervisor")
}

#[test]
fn suspended_flows_finish_after_a_restart() {
  let dir = TempDir::new().unwrap();
  let url = dir.path().join("flows.db").to_string_lossy().to_string();

  let (nap, ask) = {
    let store = Arc::new(DieselCheckpointStore::new(&url).unwrap());
    let offline = Arc::new(RecordingTransport::new());
    offline.set_offline(true);
    let first = supervisor(store.clone(), offline);
    let nap = first.submit(FlowDescriptor::new("test.nap", json!({}))).unwrap();
    let ask = first.submit(FlowDescriptor::new("test.ask", json!({}))).unwrap();
    assert_eq!(store.load(&nap).unwrap().unwrap().status, FlowStatus::Suspended);
    assert_eq!(store.load(&ask).unwrap().unwrap().status, FlowStatus::Suspended);
    (nap, ask)
  };

  // proceso nuevo sobre el mismo fichero
  let store = Arc::new(DieselCheckpointStore::new(&url).unwrap());
  let transport = Arc::new(RecordingTransport::new());
  let second = supervisor(store.clone(), transport.clone());
  let report = second.recover().unwrap();
  assert_eq!(report.scanned, 2);
  assert_eq!(report.resumed, 2);

  // la pregunta pendiente se reenvía con su secuencia original
  let sent = transport.sent_to(&CounterpartyId::from("carol"));
  assert_eq!(sent.len(), 1);
  assert_eq!(sent[0].id.sequence_number, 1);
  assert_eq!(sent[0].id.flow_id, ask);

  second.tick(Utc::now() + Duration::seconds(5)).unwrap();
  assert_eq!(second.status(&nap).unwrap(), Some(FlowStatus::Completed));

  let answer = sent[0].reply(1, json!("respuesta"));
  assert_eq!(second.deliver(answer).unwrap(), DeliveryOutcome::Resumes(ask));
  assert_eq!(second.outcome(&ask).unwrap().result, Some(json!("respuesta")));
  assert_eq!(store.count().unwrap(), 0);
}

#[test]
fn session_state_is_durable_across_restarts() {
  let dir = TempDir::new().unwrap();
  let url = dir.path().join("sessions.db").to_string_lossy().to_string();
  let store = Arc::new(DieselCheckpointStore::new(&url).unwrap());
  let first = supervisor(store.clone(), Arc::new(RecordingTransport::new()));
  let ask = first.submit(FlowDescriptor::new("test.ask", json!({}))).unwrap();
  let cp = store.load(&ask).unwrap().unwrap();
  let state: serde_json::Value = serde_json::from_slice(&cp.state).unwrap();
  let session: SessionId = serde_json::from_value(state["sessions"][0]["session_id"].clone()).unwrap();
  assert_eq!(state["sessions"][0]["next_send_seq"], json!(2));
  drop(first);

  let second = supervisor(store.clone(), Arc::new(RecordingTransport::new()));
  second.recover().unwrap();
  assert!(second.sessions().session(&session).is_some());
}
