//! Trigger evaluation and notification dispatch

pub mod engine;
pub mod notifiers;

pub use engine::TriggerEngine;
pub use notifiers::{Delivery, MailSender, NotificationDispatcher, PagerDutyClient};
