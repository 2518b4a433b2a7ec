// Reconnection behaviour observed from the outside

use std::sync::Arc;
use std::time::Duration;

use notify_mq::mailer::MockMailer;
use notify_mq::message::NotificationRequest;
use notify_mq::notification::{NotificationService, NOTIFICATION_QUEUE};
use notify_mq::rabbitmq::{
    ConnectionManager, ConnectionState, Consumer, InMemoryBroker, ManualScheduler, Publisher,
    RabbitMQError, ReconnectPolicy, TokioScheduler,
};

fn request() -> NotificationRequest {
    NotificationRequest::new("x@example.com", "S", "T", "M")
}

async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn test_backoff_after_broker_closes_connection() {
    let broker = InMemoryBroker::new();
    let scheduler = Arc::new(ManualScheduler::new());
    let manager = ConnectionManager::new("memory://", Arc::new(broker.clone()), scheduler.clone());

    manager.acquire().await.expect("initial connect failed");
    assert_eq!(manager.reconnect_attempts(), 0);

    broker.drop_connections("CONNECTION_FORCED");
    assert_eq!(scheduler.requested_delays(), vec![Duration::from_millis(1000)]);
    assert_eq!(manager.state(), ConnectionState::Reconnecting { attempt: 1 });

    let err = Publisher::new(manager.clone())
        .publish(NOTIFICATION_QUEUE, &request(), Duration::ZERO)
        .await
        .err()
        .expect("publish should fail while reconnecting");
    assert!(matches!(err, RabbitMQError::ConnectionUnavailable(_)));

    broker.refuse_connections(1);
    scheduler.run_next().await;
    assert_eq!(
        scheduler.requested_delays(),
        vec![Duration::from_millis(1000), Duration::from_millis(2000)]
    );

    scheduler.run_next().await;
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(manager.reconnect_attempts(), 0);
    assert_eq!(broker.connect_count(), 2);
}

#[tokio::test]
async fn test_initial_connect_failure_is_not_retried() {
    let broker = InMemoryBroker::new();
    broker.refuse_connections(1);
    let scheduler = Arc::new(ManualScheduler::new());
    let manager = ConnectionManager::new("memory://", Arc::new(broker.clone()), scheduler.clone());

    let err = manager.acquire().await.err().expect("connect should fail");
    assert!(matches!(err, RabbitMQError::ConnectionError(_)));
    assert_eq!(scheduler.pending(), 0);
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    // The next caller simply tries again
    assert!(manager.acquire().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_tokio_scheduler_reconnects_after_delay() {
    let broker = InMemoryBroker::new();
    let manager = ConnectionManager::new(
        "memory://",
        Arc::new(broker.clone()),
        Arc::new(TokioScheduler::current()),
    );
    manager.acquire().await.expect("initial connect failed");

    broker.drop_connections("CONNECTION_FORCED");
    tokio::time::sleep(Duration::from_millis(999)).await;
    assert_eq!(broker.connect_count(), 1);

    tokio::time::sleep(Duration::from_millis(2)).await;
    wait_until(|| manager.state() == ConnectionState::Connected).await;
    assert_eq!(broker.connect_count(), 2);
}

#[tokio::test]
async fn test_worker_resubscribes_after_reconnect() {
    let broker = InMemoryBroker::new();
    let scheduler = Arc::new(ManualScheduler::new());
    let manager = ConnectionManager::new("memory://", Arc::new(broker.clone()), scheduler.clone());
    manager.acquire().await.expect("initial connect failed");

    let mailer = MockMailer::new();
    let service = Arc::new(NotificationService::new(
        Publisher::new(manager.clone()),
        mailer.clone(),
    ));
    tokio::spawn(service.clone().run_worker(Consumer::new(manager.clone())));

    service.enqueue(&request()).await.unwrap();
    wait_until(|| broker.acked(NOTIFICATION_QUEUE) == 1).await;

    broker.drop_connections("CONNECTION_FORCED");
    scheduler.run_next().await;
    assert_eq!(manager.state(), ConnectionState::Connected);

    service.enqueue(&request()).await.unwrap();
    wait_until(|| broker.acked(NOTIFICATION_QUEUE) == 2).await;
    assert_eq!(mailer.sent_count().await, 2);
}

#[tokio::test]
async fn test_worker_stops_when_reconnection_exhausted() {
    let broker = InMemoryBroker::new();
    let scheduler = Arc::new(ManualScheduler::new());
    let policy = ReconnectPolicy {
        max_attempts: 2,
        ..ReconnectPolicy::default()
    };
    let manager = ConnectionManager::with_reconnect_policy(
        "memory://",
        Arc::new(broker.clone()),
        scheduler.clone(),
        policy,
    );
    manager.acquire().await.expect("initial connect failed");

    let service = Arc::new(NotificationService::new(
        Publisher::new(manager.clone()),
        MockMailer::new(),
    ));
    let worker = tokio::spawn(service.run_worker(Consumer::new(manager.clone())));
    wait_until(|| broker.queue_exists(NOTIFICATION_QUEUE)).await;

    broker.refuse_connections(u32::MAX);
    broker.drop_connections("CONNECTION_FORCED");
    while scheduler.run_next().await.is_some() {}

    assert_eq!(manager.state(), ConnectionState::Exhausted);
    assert_eq!(
        scheduler.requested_delays(),
        vec![Duration::from_millis(1000), Duration::from_millis(2000)]
    );
    tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .expect("worker did not stop")
        .unwrap();

    // A manual reconnect recovers once the broker is back
    broker.refuse_connections(0);
    assert!(manager.reconnect().await.is_ok());
    assert_eq!(manager.state(), ConnectionState::Connected);
}
