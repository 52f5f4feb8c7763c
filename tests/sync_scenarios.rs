use agrosync::model::{HarvestPayload, OrderPayload, PaymentPayload};
use agrosync::status::RetryPolicy;
use agrosync::store::Collection;
use agrosync::sync::{
  ItemOutcome, NoopBackgroundSync, OutboundRequest, Transport, TransportError, TransportResponse,
};
use agrosync::{
  Connectivity, DrainOutcome, Engine, EngineSettings, EnqueueOptions, Mutation, Operation,
  Priority, Store, SyncState,
};
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Plays back scripted replies per endpoint; unscripted requests succeed.
#[derive(Default)]
struct ScriptedTransport {
  replies: Mutex<Vec<(String, VecDeque<Reply>)>>,
  sent: Mutex<Vec<OutboundRequest>>,
}

#[derive(Clone)]
enum Reply {
  Status(u16),
  Error(TransportError),
  Hang,
}

impl ScriptedTransport {
  fn script(self: &Arc<Self>, endpoint: &str, replies: impl IntoIterator<Item = Reply>) {
    self
      .replies
      .lock()
      .unwrap()
      .push((endpoint.to_string(), replies.into_iter().collect()));
  }

  fn sent_to(&self, endpoint: &str) -> usize {
    self
      .sent
      .lock()
      .unwrap()
      .iter()
      .filter(|r| r.url == endpoint)
      .count()
  }

  fn next_reply(&self, endpoint: &str) -> Reply {
    let mut replies = self.replies.lock().unwrap();
    replies
      .iter_mut()
      .find(|(e, _)| e == endpoint)
      .and_then(|(_, queue)| queue.pop_front())
      .unwrap_or(Reply::Status(200))
  }
}

impl Transport for ScriptedTransport {
  fn send(
    &self,
    request: OutboundRequest,
  ) -> BoxFuture<'_, Result<TransportResponse, TransportError>> {
    let reply = self.next_reply(&request.url);
    self.sent.lock().unwrap().push(request);

    Box::pin(async move {
      match reply {
        Reply::Status(status) => Ok(TransportResponse {
          status,
          body: format!("{{\"status\":{}}}", status),
        }),
        Reply::Error(err) => Err(err),
        Reply::Hang => futures::future::pending().await,
      }
    })
  }
}

fn settings() -> EngineSettings {
  EngineSettings {
    retry: RetryPolicy {
      base_delay: chrono::Duration::zero(),
      max_delay: chrono::Duration::zero(),
    },
    request_timeout: Duration::from_millis(50),
    drain_on_enqueue: false,
    ..EngineSettings::default()
  }
}

fn engine(transport: &Arc<ScriptedTransport>, online: bool) -> Engine {
  Engine::new(
    Store::in_memory(),
    transport.clone(),
    Arc::new(NoopBackgroundSync),
    Connectivity::new(online),
    settings(),
  )
}

fn harvest_op() -> Operation {
  Operation::post(
    "/api/harvests",
    Mutation::Harvest(HarvestPayload {
      farm_id: "farm-11".to_string(),
      crop: "coffee".to_string(),
      quantity_kg: 95.0,
      harvested_at: None,
      grade: Some("AA".to_string()),
      photo_keys: Vec::new(),
    }),
  )
}

fn payment_op() -> Operation {
  Operation::post(
    "/api/payments",
    Mutation::Payment(PaymentPayload {
      order_id: "order-31".to_string(),
      amount: 12_000.0,
      currency: "KES".to_string(),
      method: Some("mpesa".to_string()),
    }),
  )
}

fn order_op() -> Operation {
  Operation::post(
    "/api/orders",
    Mutation::Order(OrderPayload {
      product_id: "prod-5".to_string(),
      buyer_id: "buyer-2".to_string(),
      quantity: 10.0,
      unit_price: Some(55.0),
    }),
  )
}

async fn drain(engine: &Engine) -> agrosync::SyncReport {
  match engine.drain().await.unwrap() {
    DrainOutcome::Ran(report) => report,
    DrainOutcome::Offline => panic!("expected an online pass"),
  }
}

#[tokio::test]
async fn harvest_succeeds_on_third_attempt() {
  let transport = Arc::new(ScriptedTransport::default());
  transport.script(
    "/api/harvests",
    [
      Reply::Error(TransportError::Network("connection reset".to_string())),
      Reply::Status(503),
    ],
  );
  let engine = engine(&transport, true);

  let id = engine
    .enqueue(harvest_op(), EnqueueOptions::default().priority(Priority::High))
    .await
    .unwrap();

  assert_eq!(drain(&engine).await.retried, 1);
  assert_eq!(drain(&engine).await.retried, 1);
  assert_eq!(engine.queue().get(&id).await.unwrap().unwrap().retry_count, 2);

  let report = drain(&engine).await;
  assert_eq!(report.succeeded, 1);
  assert_eq!(report.outcome(&id), Some(&ItemOutcome::Completed));

  let record = engine.tracker().get_status(&id).await.unwrap().unwrap();
  assert_eq!(record.status, SyncState::Completed);
  assert_eq!(record.retry_count, 2);
  assert!(record.error.is_none());
  assert!(engine.queue().is_empty().await.unwrap());
  assert_eq!(transport.sent_to("/api/harvests"), 3);
}

#[tokio::test]
async fn payment_with_single_retry_fails_terminally() {
  let transport = Arc::new(ScriptedTransport::default());
  transport.script("/api/payments", [Reply::Status(502)]);
  let engine = engine(&transport, true);

  let id = engine
    .enqueue(payment_op(), EnqueueOptions::default().max_retries(1))
    .await
    .unwrap();
  let report = drain(&engine).await;

  assert_eq!(report.failed, 1);
  assert!(engine.queue().is_empty().await.unwrap());
  let record = engine.tracker().get_status(&id).await.unwrap().unwrap();
  assert_eq!(record.status, SyncState::Failed);
  assert!(record.error.as_deref().unwrap().contains("HTTP 502"));

  // Terminal items are never retried automatically
  assert_eq!(drain(&engine).await.attempted(), 0);
  assert_eq!(transport.sent_to("/api/payments"), 1);
}

#[tokio::test]
async fn items_past_their_budget_never_stay_queued() {
  let transport = Arc::new(ScriptedTransport::default());
  transport.script("/api/orders", std::iter::repeat(Reply::Status(500)).take(10));
  let engine = engine(&transport, true);

  let id = engine
    .enqueue(order_op(), EnqueueOptions::default())
    .await
    .unwrap();
  for _ in 0..5 {
    drain(&engine).await;
  }

  assert!(engine.queue().get(&id).await.unwrap().is_none());
  let record = engine.tracker().get_status(&id).await.unwrap().unwrap();
  assert_eq!(record.status, SyncState::Failed);
  assert_eq!(record.retry_count, 3);
  assert!(!record.error.unwrap().is_empty());
  assert_eq!(transport.sent_to("/api/orders"), 3);
}

#[tokio::test]
async fn offline_drain_is_a_no_op() {
  let transport = Arc::new(ScriptedTransport::default());
  let engine = engine(&transport, false);
  engine
    .enqueue(harvest_op(), EnqueueOptions::default())
    .await
    .unwrap();

  assert_eq!(engine.drain().await.unwrap(), DrainOutcome::Offline);
  assert_eq!(engine.queue().len().await.unwrap(), 1);
  assert_eq!(transport.sent_to("/api/harvests"), 0);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
  let transport = Arc::new(ScriptedTransport::default());
  transport.script("/api/orders", [Reply::Status(422)]);
  let engine = engine(&transport, true);

  let id = engine
    .enqueue(order_op(), EnqueueOptions::default())
    .await
    .unwrap();
  let report = drain(&engine).await;

  assert_eq!(report.failed, 1);
  assert_eq!(report.retried, 0);
  let record = engine.tracker().get_status(&id).await.unwrap().unwrap();
  assert_eq!(record.status, SyncState::Failed);
  assert_eq!(record.retry_count, 0);
  assert!(record.error.unwrap().starts_with("HTTP 422"));
}

#[tokio::test]
async fn timeouts_count_as_failed_attempts() {
  let transport = Arc::new(ScriptedTransport::default());
  transport.script("/api/harvests", [Reply::Hang]);
  let engine = engine(&transport, true);

  let id = engine
    .enqueue(harvest_op(), EnqueueOptions::default())
    .await
    .unwrap();
  let report = drain(&engine).await;

  assert!(matches!(
    report.outcome(&id),
    Some(ItemOutcome::Retrying { retry_count: 1, .. })
  ));
  assert_eq!(drain(&engine).await.succeeded, 1);
}

#[tokio::test]
async fn one_bad_item_does_not_stall_the_rest() {
  let transport = Arc::new(ScriptedTransport::default());
  transport.script("/api/payments", [Reply::Status(400)]);
  transport.script("/api/orders", [Reply::Status(503)]);
  let engine = engine(&transport, true);

  let payment = engine
    .enqueue(payment_op(), EnqueueOptions::default().priority(Priority::High))
    .await
    .unwrap();
  let order = engine
    .enqueue(order_op(), EnqueueOptions::default())
    .await
    .unwrap();
  let harvest = engine
    .enqueue(harvest_op(), EnqueueOptions::default().priority(Priority::Low))
    .await
    .unwrap();

  let report = drain(&engine).await;

  assert_eq!(report.summary(), "1 synced, 1 retrying, 1 failed");
  let order_ids: Vec<&str> = report.items.iter().map(|i| i.id.as_str()).collect();
  assert_eq!(order_ids, vec![payment.as_str(), order.as_str(), harvest.as_str()]);

  let stats = engine.sync_stats().await.unwrap();
  assert_eq!(stats.overall.total, 3);
  assert_eq!(stats.overall.completed, 1);
  assert_eq!(stats.overall.pending, 1);
  assert_eq!(stats.overall.failed, 1);
  assert_eq!(stats.queued, 1);
}

#[tokio::test]
async fn failed_items_can_be_requeued_explicitly() {
  let transport = Arc::new(ScriptedTransport::default());
  transport.script("/api/payments", [Reply::Status(500)]);
  let engine = engine(&transport, true);

  let id = engine
    .enqueue(payment_op(), EnqueueOptions::default().max_retries(1))
    .await
    .unwrap();
  drain(&engine).await;

  assert_eq!(engine.requeue_failed(&id).await.unwrap(), Some(id.clone()));
  let item = engine.queue().get(&id).await.unwrap().unwrap();
  assert_eq!(item.retry_count, 0);
  assert_eq!(item.max_retries, 1);
  assert_eq!(
    engine.tracker().get_status(&id).await.unwrap().unwrap().status,
    SyncState::Pending
  );

  assert_eq!(drain(&engine).await.succeeded, 1);
  assert_eq!(engine.requeue_failed(&id).await.unwrap(), None);
}

#[tokio::test]
async fn clear_all_twice_is_harmless() {
  let transport = Arc::new(ScriptedTransport::default());
  let engine = engine(&transport, false);
  engine
    .enqueue(harvest_op(), EnqueueOptions::default())
    .await
    .unwrap();
  engine
    .cache()
    .set("products:/api/products", &vec![1, 2, 3], chrono::Duration::minutes(5))
    .await
    .unwrap();
  engine.capabilities().set_capability("harvest-logging", true).await.unwrap();

  engine.clear_all().await.unwrap();
  let first = engine.storage_stats().await.unwrap();
  engine.clear_all().await.unwrap();
  let second = engine.storage_stats().await.unwrap();

  assert_eq!(first.total_items(), 0);
  assert_eq!(second.total_items(), 0);
  for collection in Collection::ALL {
    assert_eq!(
      first.get(collection).unwrap().items,
      second.get(collection).unwrap().items
    );
  }
  assert!(!engine.capabilities().is_enabled("harvest-logging").await.unwrap());
}

#[tokio::test]
async fn clear_all_during_a_pass_leaves_no_orphans() {
  let transport = Arc::new(ScriptedTransport::default());
  transport.script("/api/harvests", [Reply::Hang]);
  let engine = Engine::new(
    Store::in_memory(),
    transport.clone(),
    Arc::new(NoopBackgroundSync),
    Connectivity::new(true),
    EngineSettings {
      request_timeout: Duration::from_millis(200),
      ..settings()
    },
  );
  engine
    .enqueue(harvest_op(), EnqueueOptions::default())
    .await
    .unwrap();

  let draining = engine.clone();
  let pass = tokio::spawn(async move { drain(&draining).await });
  while transport.sent_to("/api/harvests") == 0 {
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
  engine.clear_all().await.unwrap();
  let report = pass.await.unwrap();

  assert_eq!(report.discarded, 1);
  assert_eq!(engine.storage_stats().await.unwrap().total_items(), 0);
}

#[tokio::test]
async fn rows_from_an_older_build_do_not_block_delivery() {
  let transport = Arc::new(ScriptedTransport::default());
  let engine = engine(&transport, true);
  let id = engine
    .enqueue(harvest_op(), EnqueueOptions::default())
    .await
    .unwrap();
  engine
    .store()
    .call(|conn| {
      conn.execute(
        "INSERT INTO queue (id, resource_type, priority, operation, retry_count, max_retries, created_at)
         VALUES ('legacy-1', 'order', 1, '{\"old\":true}', 0, 3, 0)",
        [],
      )?;
      Ok(())
    })
    .await
    .unwrap();

  let report = drain(&engine).await;

  assert_eq!(report.outcome(&id), Some(&ItemOutcome::Completed));
  assert!(matches!(report.outcome("legacy-1"), Some(ItemOutcome::Failed { .. })));
  assert!(engine.queue().is_empty().await.unwrap());
  assert_eq!(
    engine.tracker().get_status("legacy-1").await.unwrap().unwrap().status,
    SyncState::Failed
  );
  assert_eq!(drain(&engine).await.attempted(), 0);
}
