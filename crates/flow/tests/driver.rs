mod common;

use std::time::Duration;

use common::*;
use flow::driver::{pump_inbound, run_ticker};
use flow::{CounterpartyId, FlowDescriptor, FlowStatus};
use serde_json::json;
use tokio::sync::{mpsc, watch};

#[tokio::test]
async fn pump_delivers_until_the_channel_closes() {
  let h = harness(fast_config());
  let f = h.supervisor.submit(FlowDescriptor::new("test.ping", json!({"counterparty": "bob"}))).unwrap();
  let request = h.transport.sent_to(&CounterpartyId::from("bob"))[0].clone();

  let (tx, rx) = mpsc::channel(8);
  tx.send(request.reply(2, json!("dos"))).await.unwrap();
  tx.send(request.reply(1, json!("uno"))).await.unwrap();
  tx.send(request.reply(1, json!("uno"))).await.unwrap();
  drop(tx);

  let stats = pump_inbound(h.supervisor.clone(), rx).await.unwrap();
  assert_eq!(stats.delivered, 3);
  assert_eq!(stats.buffered, 1);
  assert_eq!(stats.resumed, 1);
  // tras completar, la sesión ya no existe
  assert_eq!(stats.discarded, 1);
  assert_eq!(h.supervisor.status(&f).unwrap(), Some(FlowStatus::Completed));
}

#[tokio::test]
async fn ticker_fires_timers_and_stops_on_shutdown() {
  let h = harness(fast_config());
  let f = h.supervisor.submit(FlowDescriptor::new("test.sleep", json!({"delay_ms": 50}))).unwrap();

  let (stop, shutdown) = watch::channel(false);
  let ticker = tokio::spawn(run_ticker(h.supervisor.clone(), Duration::from_millis(10), shutdown));

  let mut done = false;
  for _ in 0..200 {
    if h.supervisor.status(&f).unwrap() == Some(FlowStatus::Completed) {
      done = true;
      break;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  stop.send(true).unwrap();
  let stats = ticker.await.unwrap();

  assert!(done, "el temporizador no se disparo");
  assert!(stats.ticks > 0);
  assert_eq!(stats.timers_fired, 1);
  assert_eq!(stats.errors, 0);
}

#[test]
fn pump_on_a_closed_channel_does_nothing() {
  let h = harness(fast_config());
  let (tx, rx) = mpsc::channel(1);
  drop(tx);
  let stats = tokio_test::assert_ok!(tokio_test::block_on(pump_inbound(h.supervisor.clone(), rx)));
  assert_eq!(stats, flow::driver::PumpStats::default());
}
