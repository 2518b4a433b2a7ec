use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::message::Email;
use crate::template::EmailRenderer;

/// Terminal delivery of a notification.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &Email) -> anyhow::Result<()>;

    fn name(&self) -> &'static str;
}

/// Renders every email and records it in the structured log instead of
/// talking to a mail server.
pub struct LogMailer {
    renderer: EmailRenderer,
}

impl LogMailer {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            renderer: EmailRenderer::new()?,
        })
    }
}

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: &Email) -> anyhow::Result<()> {
        let rendered = self.renderer.render(email)?;
        debug!(to = %email.to, html = %rendered.html, "Rendered email body");
        info!(
            to = %email.to,
            subject = %rendered.subject,
            body_bytes = rendered.html.len(),
            "Email sent"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Captures sent emails for assertions. Clones share the same outbox.
#[derive(Clone, Default)]
pub struct MockMailer {
    sent_emails: Arc<Mutex<Vec<Email>>>,
    failure_message: Option<String>,
}

impl MockMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mailer whose every send fails with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            sent_emails: Arc::new(Mutex::new(Vec::new())),
            failure_message: Some(message.into()),
        }
    }

    pub async fn sent_emails(&self) -> Vec<Email> {
        self.sent_emails.lock().await.clone()
    }

    pub async fn sent_count(&self) -> usize {
        self.sent_emails.lock().await.len()
    }
}

#[async_trait]
impl Mailer for MockMailer {
    async fn send(&self, email: &Email) -> anyhow::Result<()> {
        if let Some(message) = &self.failure_message {
            anyhow::bail!("{}", message);
        }
        self.sent_emails.lock().await.push(email.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
