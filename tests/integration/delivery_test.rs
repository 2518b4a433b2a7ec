// End-to-end delivery through the in-process broker

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use notify_mq::mailer::MockMailer;
use notify_mq::message::NotificationRequest;
use notify_mq::notification::{NotificationService, NOTIFICATION_QUEUE};
use notify_mq::rabbitmq::{
    holding_queue_name, ConnectionManager, Consumer, InMemoryBroker, ManualScheduler, Publisher,
};
use tokio::sync::mpsc;

fn load_fixture() -> NotificationRequest {
    let path = Path::new("tests/fixtures/notification.json");
    let body = fs::read_to_string(path).expect("Failed to read notification fixture");
    serde_json::from_str(&body).expect("Failed to parse notification fixture")
}

fn connect(broker: &InMemoryBroker) -> ConnectionManager {
    ConnectionManager::new(
        "memory://",
        Arc::new(broker.clone()),
        Arc::new(ManualScheduler::new()),
    )
}

fn spawn_collector(
    consumer: Consumer,
) -> mpsc::UnboundedReceiver<NotificationRequest> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        consumer
            .consume::<NotificationRequest, _>(NOTIFICATION_QUEUE, move |request: NotificationRequest| {
                let tx = tx.clone();
                async move {
                    tx.send(request)?;
                    Ok::<(), anyhow::Error>(())
                }
            })
            .await
    });
    rx
}

#[tokio::test]
async fn test_immediate_notification_delivered_once() {
    let broker = InMemoryBroker::new();
    let manager = connect(&broker);
    let request = load_fixture();

    let mut received = spawn_collector(Consumer::new(manager.clone()));
    Publisher::new(manager)
        .publish(NOTIFICATION_QUEUE, &request, Duration::ZERO)
        .await
        .expect("publish failed");

    let delivered = tokio::time::timeout(Duration::from_secs(5), received.recv())
        .await
        .expect("no delivery")
        .expect("consumer ended");
    assert_eq!(delivered, request);

    while broker.acked(NOTIFICATION_QUEUE) == 0 {
        tokio::task::yield_now().await;
    }
    assert!(received.try_recv().is_err());
    assert!(!broker.queue_exists(&holding_queue_name(NOTIFICATION_QUEUE)));
}

#[tokio::test(start_paused = true)]
async fn test_delayed_notification_waits_for_expiry() {
    let broker = InMemoryBroker::new();
    let manager = connect(&broker);
    let request = load_fixture();

    let mut received = spawn_collector(Consumer::new(manager.clone()));
    Publisher::new(manager)
        .publish(NOTIFICATION_QUEUE, &request, Duration::from_millis(5000))
        .await
        .expect("publish failed");

    tokio::time::sleep(Duration::from_millis(4999)).await;
    assert!(received.try_recv().is_err());
    assert_eq!(broker.queue_depth(&holding_queue_name(NOTIFICATION_QUEUE)), 1);

    tokio::time::sleep(Duration::from_millis(2)).await;
    let delivered = tokio::time::timeout(Duration::from_secs(1), received.recv())
        .await
        .expect("no delivery after expiry")
        .expect("consumer ended");
    assert_eq!(delivered, request);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(received.try_recv().is_err());
    assert_eq!(broker.acked(NOTIFICATION_QUEUE), 1);
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_request_reaches_mailer() {
    let broker = InMemoryBroker::new();
    let manager = connect(&broker);
    let mailer = MockMailer::new();
    let service = Arc::new(NotificationService::new(
        Publisher::new(manager.clone()),
        mailer.clone(),
    ));
    tokio::spawn(service.clone().run_worker(Consumer::new(manager)));

    let request = load_fixture().scheduled_in(Duration::from_secs(3));
    service.enqueue(&request).await.expect("enqueue failed");

    tokio::time::sleep(Duration::from_millis(2900)).await;
    assert_eq!(mailer.sent_count().await, 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    while broker.acked(NOTIFICATION_QUEUE) == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let sent = mailer.sent_emails().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0], request.email());
}

#[tokio::test]
async fn test_failed_notification_is_dropped() {
    let broker = InMemoryBroker::new();
    let manager = connect(&broker);
    let service = Arc::new(NotificationService::new(
        Publisher::new(manager.clone()),
        MockMailer::failing("smtp unavailable"),
    ));
    tokio::spawn(service.clone().run_worker(Consumer::new(manager)));

    service.enqueue(&load_fixture()).await.expect("enqueue failed");

    tokio::time::timeout(Duration::from_secs(5), async {
        while broker.rejected(NOTIFICATION_QUEUE) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("message was not rejected");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.rejected(NOTIFICATION_QUEUE), 1);
    assert_eq!(broker.queue_depth(NOTIFICATION_QUEUE), 0);
}
