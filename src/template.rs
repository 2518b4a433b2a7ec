//! HTML rendering of notification emails with Handlebars.

use anyhow::{Context, Result};
use handlebars::Handlebars;
use serde_json::json;

use crate::message::Email;

/// Application named in the header when a notification carries none.
pub const DEFAULT_APPLICATION: &str = "SEST";

const NOTIFICATION_TEMPLATE: &str = "notification";

const NOTIFICATION_HTML: &str = r#"<div style="color: #333; line-height: 1.6; max-width: 600px; margin: 0 auto; padding: 15px; border-radius: 12px; border: 1px solid #e0e0e0;">
  <div style="text-align: center; margin-bottom: 25px;">
    <p style="color: #555; font-size: 14px; margin-top: 8px;">{{application}} notifications</p>
  </div>
  <div style="background-color: #fff5f5; padding: 25px; border-radius: 10px; border: 1px solid #f0c7c7;">
    <h2 style="color: #b22222; font-size: 22px; margin: 0 0 15px; text-align: center;">{{title}}</h2>
    <p style="font-size: 16px; color: #444; text-align: center; margin-bottom: 20px;">{{message}}</p>
    {{#if link}}
    <div class="notification-link" style="text-align: center; margin-top: 20px;">
      <a href="{{link}}" target="_blank" style="background-color: #b22222; color: #fff; text-decoration: none; padding: 12px 20px; border-radius: 8px;">View details</a>
    </div>
    {{/if}}
  </div>
  <div style="text-align: center; margin-top: 40px; color: #999; font-size: 13px;">
    <p>This is an automated message. Please do not reply to this email.</p>
  </div>
</div>
"#;

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
}

pub struct EmailRenderer {
    handlebars: Handlebars<'static>,
}

impl EmailRenderer {
    pub fn new() -> Result<Self> {
        let mut handlebars = Handlebars::new();
        handlebars
            .register_template_string(NOTIFICATION_TEMPLATE, NOTIFICATION_HTML)
            .context("Failed to register notification template")?;
        Ok(Self { handlebars })
    }

    pub fn render(&self, email: &Email) -> Result<RenderedEmail> {
        let data = json!({
            "title": email.title,
            "message": email.message,
            "link": email.link,
            "application": email.application.as_deref().unwrap_or(DEFAULT_APPLICATION),
        });

        let html = self
            .handlebars
            .render(NOTIFICATION_TEMPLATE, &data)
            .context("Failed to render notification email")?;

        Ok(RenderedEmail {
            subject: email.subject.clone(),
            html,
        })
    }
}
