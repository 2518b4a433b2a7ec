pub mod env;
pub mod mailer;
pub mod message;
pub mod notification;
pub mod rabbitmq;
pub mod template;
