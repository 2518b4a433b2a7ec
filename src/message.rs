use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One address or a list of addresses.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Recipients {
    One(String),
    Many(Vec<String>),
}

impl Recipients {
    pub fn addresses(&self) -> Vec<&str> {
        match self {
            Recipients::One(address) => vec![address.as_str()],
            Recipients::Many(addresses) => addresses.iter().map(String::as_str).collect(),
        }
    }
}

impl fmt::Display for Recipients {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.addresses().join(", "))
    }
}

impl From<&str> for Recipients {
    fn from(address: &str) -> Self {
        Recipients::One(address.to_string())
    }
}

impl From<Vec<String>> for Recipients {
    fn from(addresses: Vec<String>) -> Self {
        Recipients::Many(addresses)
    }
}

/// A notification as it travels through the queue.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRequest {
    pub to: Recipients,
    pub subject: String,
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    /// Delay in milliseconds, relative to when the request was enqueued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_for: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application: Option<String>,
}

impl NotificationRequest {
    pub fn new(
        to: impl Into<Recipients>,
        subject: &str,
        title: &str,
        message: &str,
    ) -> Self {
        NotificationRequest {
            to: to.into(),
            subject: subject.to_string(),
            title: title.to_string(),
            message: message.to_string(),
            link: None,
            schedule_for: None,
            application: None,
        }
    }

    pub fn with_link(mut self, link: &str) -> Self {
        self.link = Some(link.to_string());
        self
    }

    pub fn with_application(mut self, application: &str) -> Self {
        self.application = Some(application.to_string());
        self
    }

    pub fn scheduled_in(mut self, delay: Duration) -> Self {
        self.schedule_for = Some(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// How long to hold the notification before delivery.
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.schedule_for.unwrap_or(0))
    }

    /// The email to send for this notification.
    pub fn email(&self) -> Email {
        Email {
            to: self.to.clone(),
            subject: self.subject.clone(),
            title: self.title.clone(),
            message: self.message.clone(),
            link: self.link.clone(),
            application: self.application.clone(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Email {
    pub to: Recipients,
    pub subject: String,
    pub title: String,
    pub message: String,
    pub link: Option<String>,
    pub application: Option<String>,
}
