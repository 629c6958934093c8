use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flow::domain::{Classification, FlowFailure};
use flow::drain::{DrainModeController, DrainModeSetEvent};
use flow::hospital::{Decision, FlowHospital, Outcome, RetryPolicy};
use flow::FlowLogicError;
use uuid::Uuid;

fn policy() -> RetryPolicy {
  RetryPolicy { max_attempts: 3,
                base_delay: Duration::from_millis(1_000),
                max_delay: Duration::from_millis(5_000) }
}

fn failure(cause: FlowLogicError, attempt: u32, classification: Classification) -> FlowFailure {
  FlowFailure { flow_id: Uuid::new_v4(),
                cause,
                attempt,
                classification }
}

#[test]
fn classification_follows_the_staff() {
  let h = FlowHospital::new(policy());
  let c = |e: FlowLogicError| h.classify(&failure(e, 1, Classification::Unknown));
  assert_eq!(c(FlowLogicError::Transient("x".into())), Classification::Transient);
  assert_eq!(c(FlowLogicError::Permanent("x".into())), Classification::Permanent);
  assert_eq!(c(FlowLogicError::Aborted("x".into())), Classification::Permanent);
  assert_eq!(c(FlowLogicError::SessionGap { session_id: Uuid::new_v4() }), Classification::Unknown);
  assert_eq!(c(FlowLogicError::Other("Connection reset by peer".into())), Classification::Transient);
  assert_eq!(c(FlowLogicError::Other("deadlock detected".into())), Classification::Transient);
  assert_eq!(c(FlowLogicError::Other("division por cero".into())), Classification::Unknown);
}

#[test]
fn schedule_retries_transients_until_ceiling() {
  let h = FlowHospital::new(policy());
  let t = |attempt| h.schedule(&failure(FlowLogicError::Transient("x".into()), attempt, Classification::Transient));
  assert_eq!(t(1), Decision::Retry { after: Duration::from_millis(1_000) });
  assert_eq!(t(2), Decision::Retry { after: Duration::from_millis(2_000) });
  assert_eq!(t(3), Decision::Hospitalize);

  let p = failure(FlowLogicError::Permanent("x".into()), 1, Classification::Permanent);
  assert_eq!(h.schedule(&p), Decision::Kill);
  let u = failure(FlowLogicError::Other("x".into()), 1, Classification::Unknown);
  assert_eq!(h.schedule(&u), Decision::Hospitalize);
}

#[test]
fn session_gap_is_hospitalized_on_first_admission() {
  let h = FlowHospital::new(policy());
  let flow_id = Uuid::new_v4();
  let (failure, decision) = h.admit(flow_id, 4, FlowLogicError::SessionGap { session_id: Uuid::new_v4() }).unwrap();
  assert_eq!(failure.attempt, 1);
  assert_eq!(failure.classification, Classification::Unknown);
  assert_eq!(decision, Decision::Hospitalize);
  assert_eq!(h.records(&flow_id)[0].outcome, Outcome::Hospitalize);
}

#[test]
fn backoff_is_exponential_and_capped() {
  let p = policy();
  assert_eq!(p.backoff(1), Duration::from_millis(1_000));
  assert_eq!(p.backoff(3), Duration::from_millis(4_000));
  assert_eq!(p.backoff(4), Duration::from_millis(5_000));
  assert_eq!(p.backoff(60), Duration::from_millis(5_000));
}

#[test]
fn admit_counts_attempts_per_suspension_point() {
  let h = FlowHospital::new(policy());
  let id = Uuid::new_v4();
  let (f1, d1) = h.admit(id, 4, FlowLogicError::Transient("a".into())).unwrap();
  let (f2, _) = h.admit(id, 4, FlowLogicError::Transient("b".into())).unwrap();
  assert_eq!((f1.attempt, f2.attempt), (1, 2));
  assert!(matches!(d1, Decision::Retry { .. }));

  // avanzar a otro punto reinicia la cuenta
  let (f3, _) = h.admit(id, 5, FlowLogicError::Transient("c".into())).unwrap();
  assert_eq!(f3.attempt, 1);

  let records = h.records(&id);
  assert_eq!(records.len(), 3);
  assert!(records.iter().all(|r| r.outcome == Outcome::Retry));

  h.discharge(&id);
  assert!(h.records(&id).is_empty());
}

#[test]
fn drain_mode_emits_one_event_per_transition() {
  let drain = DrainModeController::new(false);
  let seen = Arc::new(AtomicUsize::new(0));
  let counter = seen.clone();
  drain.subscribe(Arc::new(move |_e: &DrainModeSetEvent| {
                    counter.fetch_add(1, Ordering::SeqCst);
                  }));

  let ev = drain.set_draining(true).expect("transition");
  assert!(ev.value);
  assert!(drain.is_draining());
  assert!(drain.draining_since().is_some());
  assert!(drain.set_draining(true).is_none());
  assert_eq!(seen.load(Ordering::SeqCst), 1);

  assert!(!drain.set_draining(false).expect("transition").value);
  assert!(drain.set_draining(false).is_none());
  assert_eq!(seen.load(Ordering::SeqCst), 2);
  assert!(drain.draining_since().is_none());
}
