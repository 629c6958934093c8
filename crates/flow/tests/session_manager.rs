use chrono::{Duration, Utc};
use flow::domain::{CounterpartyId, MessageEnvelope, MessageIdentifier, Session, SessionState};
use flow::session::{DeliveryOutcome, SessionManager};
use flow::ShardRouter;
use serde_json::json;
use uuid::Uuid;

fn setup() -> (SessionManager, Session) {
  let router = ShardRouter::default();
  let manager = SessionManager::new(router);
  let flow_id = Uuid::new_v4();
  let session = Session::new(flow_id, CounterpartyId::from("bob"));
  manager.sync(&flow_id, std::slice::from_ref(&session), Utc::now());
  (manager, session)
}

fn msg(session: &Session, seq: u64) -> MessageEnvelope {
  MessageEnvelope { id: MessageIdentifier { flow_id: session.flow_id,
                                            session_id: session.session_id,
                                            sequence_number: seq,
                                            shard_prefix: ShardRouter::default().shard_of(&session.flow_id) },
                    payload: json!({"seq": seq}) }
}

#[test]
fn send_assigns_consecutive_sequences_from_one() {
  let (manager, mut session) = setup();
  let a = manager.send(&mut session, json!("a"));
  let b = manager.send(&mut session, json!("b"));
  assert_eq!(a.id.sequence_number, 1);
  assert_eq!(b.id.sequence_number, 2);
  assert_eq!(session.next_send_seq, 3);
  assert_eq!(a.id.shard_prefix, ShardRouter::default().shard_of(&session.flow_id));
}

#[test]
fn message_resumes_only_when_awaited() {
  let (manager, session) = setup();
  assert_eq!(manager.on_message(msg(&session, 1), Utc::now()), DeliveryOutcome::Buffered);

  let (manager, session) = setup();
  manager.set_awaiting(&session.session_id);
  assert_eq!(manager.on_message(msg(&session, 1), Utc::now()), DeliveryOutcome::Resumes(session.flow_id));
  assert!(manager.ready_for(&session.flow_id));
  assert_eq!(manager.peek_next(&session.session_id).unwrap(), (1, json!({"seq": 1})));
}

#[test]
fn duplicate_delivery_is_a_no_op() {
  let (manager, mut session) = setup();
  manager.set_awaiting(&session.session_id);
  assert!(matches!(manager.on_message(msg(&session, 1), Utc::now()), DeliveryOutcome::Resumes(_)));
  // duplicado en buffer
  assert_eq!(manager.on_message(msg(&session, 1), Utc::now()), DeliveryOutcome::Duplicate);
  assert_eq!(manager.buffered(&session.session_id), 1);
  assert!(!manager.is_committed(&msg(&session, 1).id));

  // el flujo consume seq 1 y confirma checkpoint
  session.last_received_seq = 1;
  session.state = SessionState::Open;
  let acked = manager.sync(&session.flow_id, std::slice::from_ref(&session), Utc::now());
  assert_eq!(acked.len(), 1);
  assert_eq!(acked[0].sequence_number, 1);
  assert_eq!(manager.buffered(&session.session_id), 0);

  // duplicado ya consumido
  assert!(manager.is_committed(&msg(&session, 1).id));
  assert!(!manager.is_committed(&msg(&session, 2).id));
  assert_eq!(manager.on_message(msg(&session, 1), Utc::now()), DeliveryOutcome::Duplicate);
  assert_eq!(manager.buffered(&session.session_id), 0);
  assert!(!manager.ready_for(&session.flow_id));
}

#[test]
fn out_of_order_messages_wait_for_the_gap() {
  let (manager, session) = setup();
  manager.set_awaiting(&session.session_id);
  let t0 = Utc::now();
  assert_eq!(manager.on_message(msg(&session, 2), t0), DeliveryOutcome::Buffered);
  assert!(manager.peek_next(&session.session_id).is_none());

  // el hueco vence tras el plazo
  let timeout = Duration::milliseconds(500);
  assert!(!manager.gap_expired(&session.session_id, t0 + Duration::milliseconds(100), timeout));
  assert!(manager.gap_expired(&session.session_id, t0 + Duration::milliseconds(600), timeout));
  assert_eq!(manager.expired_gaps(t0 + Duration::milliseconds(600), timeout), vec![session.flow_id]);
  // se informa una sola vez
  assert!(manager.expired_gaps(t0 + Duration::milliseconds(700), timeout).is_empty());

  // llega el que faltaba
  assert_eq!(manager.on_message(msg(&session, 1), t0), DeliveryOutcome::Resumes(session.flow_id));
  assert!(!manager.gap_expired(&session.session_id, t0 + Duration::seconds(10), timeout));
  assert_eq!(manager.peek_next(&session.session_id).unwrap().0, 1);
}

#[test]
fn unknown_closed_or_mismatched_sessions_are_discarded() {
  let (manager, mut session) = setup();
  let stranger = Session::new(Uuid::new_v4(), CounterpartyId::from("eve"));
  assert_eq!(manager.on_message(msg(&stranger, 1), Utc::now()), DeliveryOutcome::Discarded);

  let mut wrong_flow = msg(&session, 1);
  wrong_flow.id.flow_id = Uuid::new_v4();
  assert_eq!(manager.on_message(wrong_flow, Utc::now()), DeliveryOutcome::Discarded);
  assert_eq!(manager.on_message(msg(&session, 0), Utc::now()), DeliveryOutcome::Discarded);

  session.state = SessionState::Closed;
  manager.sync(&session.flow_id, std::slice::from_ref(&session), Utc::now());
  assert_eq!(manager.on_message(msg(&session, 1), Utc::now()), DeliveryOutcome::Discarded);

  manager.close_flow(&session.flow_id);
  assert!(manager.session(&session.session_id).is_none());
  assert!(manager.is_empty());
}

#[test]
fn sync_forgets_sessions_missing_from_the_checkpoint() {
  let (manager, session) = setup();
  let other = Session::new(session.flow_id, CounterpartyId::from("carol"));
  manager.sync(&session.flow_id, &[session.clone(), other.clone()], Utc::now());
  assert_eq!(manager.len(), 2);

  // reanudación desde un checkpoint que sólo conoce la primera sesión
  manager.sync(&session.flow_id, std::slice::from_ref(&session), Utc::now());
  assert_eq!(manager.len(), 1);
  assert!(manager.session(&other.session_id).is_none());
}
