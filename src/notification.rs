use std::sync::Arc;

use async_trait::async_trait;
use chrono::Local;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::mailer::Mailer;
use crate::message::NotificationRequest;
use crate::rabbitmq::{ConnectionState, Consumer, MessageHandler, Publisher, RabbitMQError};

pub const NOTIFICATION_QUEUE: &str = "notifications";

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Failed to queue notification: {0}")]
    Queue(#[from] RabbitMQError),

    #[error("Failed to send notification: {0:#}")]
    Send(anyhow::Error),
}

/// Routes notifications through the queue and hands consumed ones to a mailer.
pub struct NotificationService<M: Mailer> {
    publisher: Publisher,
    mailer: Arc<M>,
    queue: String,
}

impl<M: Mailer + 'static> NotificationService<M> {
    pub fn new(publisher: Publisher, mailer: M) -> Self {
        Self {
            publisher,
            mailer: Arc::new(mailer),
            queue: NOTIFICATION_QUEUE.to_string(),
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Queue a notification, delayed by its `scheduleFor` when present.
    ///
    /// Never sends synchronously: delivery happens when the worker consumes it.
    pub async fn enqueue(&self, request: &NotificationRequest) -> Result<(), DispatchError> {
        let delay = request.delay();
        self.publisher.publish(&self.queue, request, delay).await?;

        if delay.is_zero() {
            info!(queue = %self.queue, to = %request.to, "Notification queued");
        } else {
            let deliver_at = chrono::Duration::from_std(delay)
                .ok()
                .and_then(|delay| Local::now().checked_add_signed(delay))
                .map(|at| at.format("%d/%m/%Y %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string());
            info!(
                queue = %self.queue,
                to = %request.to,
                deliver_at = %deliver_at,
                "Notification scheduled"
            );
        }
        Ok(())
    }

    /// Send the notification through the mailer. Never re-publishes.
    pub async fn deliver(&self, request: &NotificationRequest) -> Result<(), DispatchError> {
        self.mailer
            .send(&request.email())
            .await
            .map_err(DispatchError::Send)?;
        info!(to = %request.to, mailer = self.mailer.name(), "Notification delivered");
        Ok(())
    }

    /// Consume the notification queue until the connection is closed or
    /// reconnection gives up, resubscribing after every successful reconnect.
    pub async fn run_worker(self: Arc<Self>, consumer: Consumer) {
        let manager = consumer.connection_manager().clone();
        let mut states = manager.subscribe();

        loop {
            let handler = DeliverHandler {
                service: self.clone(),
            };
            match consumer
                .consume::<NotificationRequest, _>(&self.queue, handler)
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_connection_failure() => {
                    warn!(queue = %self.queue, "Connection unavailable for subscription: {}", e);
                }
                Err(e) => {
                    error!(queue = %self.queue, "Notification subscription failed: {}", e);
                }
            }

            let ended_while_connected = manager.state() == ConnectionState::Connected;

            let settled = match states
                .wait_for(|state| {
                    !matches!(
                        state,
                        ConnectionState::Connecting | ConnectionState::Reconnecting { .. }
                    )
                })
                .await
            {
                Ok(state) => *state,
                Err(_) => break,
            };

            match settled {
                ConnectionState::Connected => {
                    if ended_while_connected {
                        // Only the channel went away; avoid spinning on a broken queue
                        tokio::time::sleep(manager.policy().base_delay).await;
                    }
                    info!(queue = %self.queue, "Resubscribing to notification queue");
                }
                state => {
                    warn!(queue = %self.queue, ?state, "Notification worker stopped");
                    break;
                }
            }
        }
    }
}

struct DeliverHandler<M: Mailer> {
    service: Arc<NotificationService<M>>,
}

#[async_trait]
impl<M: Mailer + 'static> MessageHandler<NotificationRequest> for DeliverHandler<M> {
    async fn handle(&self, request: NotificationRequest) -> anyhow::Result<()> {
        self.service.deliver(&request).await?;
        Ok(())
    }
}
