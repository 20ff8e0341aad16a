//! Notification transports: SMTP email, SMS through carrier email gateways
//! and PagerDuty trigger events.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::checks::model::{CheckDefinition, Trigger, TriggerAction, ViolationRecord};
use crate::config::{EmailConfig, PagerDutyConfig};

#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<()>;
}

/// Trigger event submitted to PagerDuty.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PagerDutyEvent {
    pub service_key: String,
    pub event_type: &'static str,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incident_key: Option<String>,
    pub client: String,
    pub details: serde_json::Value,
}

#[async_trait]
pub trait PagerDutyClient: Send + Sync {
    /// Submit a trigger event and return the incident key PagerDuty assigned.
    async fn submit_trigger(&self, event: &PagerDutyEvent) -> anyhow::Result<String>;
}

/// SMTP mailer built on lettre's tokio transport.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    subject_prefix: Option<String>,
}

impl SmtpMailer {
    pub fn new(config: &EmailConfig) -> anyhow::Result<Self> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .with_context(|| format!("invalid SMTP relay {}", config.host))?
            .port(config.port);

        if let Some(username) = &config.username {
            builder = builder.credentials(Credentials::new(
                username.clone(),
                config.password.clone().unwrap_or_default(),
            ));
        }

        let from = config
            .from
            .parse()
            .with_context(|| format!("invalid sender address {}", config.from))?;

        Ok(Self {
            transport: builder.build(),
            from,
            subject_prefix: config.subject_prefix.clone(),
        })
    }
}

#[async_trait]
impl MailSender for SmtpMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<()> {
        let subject = match &self.subject_prefix {
            Some(prefix) if !subject.is_empty() => format!("{prefix} {subject}"),
            _ => subject.to_string(),
        };

        let message = Message::builder()
            .from(self.from.clone())
            .to(to.parse().with_context(|| format!("invalid recipient {to}"))?)
            .subject(subject)
            .body(body.to_string())
            .context("failed to build email")?;

        self.transport
            .send(message)
            .await
            .with_context(|| format!("failed to send email to {to}"))?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct PagerDutyResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    incident_key: String,
}

/// Client for the PagerDuty generic events API.
pub struct PagerDutyEventsClient {
    client: reqwest::Client,
    events_url: String,
}

impl PagerDutyEventsClient {
    pub fn new(config: &PagerDutyConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            events_url: config.events_url.clone(),
        }
    }
}

#[async_trait]
impl PagerDutyClient for PagerDutyEventsClient {
    async fn submit_trigger(&self, event: &PagerDutyEvent) -> anyhow::Result<String> {
        let response = self
            .client
            .post(&self.events_url)
            .json(event)
            .send()
            .await
            .context("failed to reach PagerDuty")?;

        let status = response.status();
        let body: PagerDutyResponse = response
            .json()
            .await
            .context("unexpected PagerDuty response")?;

        if !status.is_success() {
            bail!("PagerDuty rejected event ({status}): {}", body.message);
        }

        debug!("PagerDuty accepted event: {}", body.status);
        Ok(body.incident_key)
    }
}

/// Outcome of dispatching one trigger action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Nothing was sent (transport `nothing`, or an unusable destination)
    Skipped,
    Sent,
    /// PagerDuty accepted the event under this incident key
    Incident(String),
}

impl Delivery {
    pub fn delivered(&self) -> bool {
        !matches!(self, Delivery::Skipped)
    }
}

/// Routes trigger actions to their transport.
pub struct NotificationDispatcher {
    mailer: Option<Arc<dyn MailSender>>,
    pagerduty: Arc<dyn PagerDutyClient>,
    sms_gateways: HashMap<String, String>,
    client_label: String,
}

impl NotificationDispatcher {
    pub fn new(
        mailer: Option<Arc<dyn MailSender>>,
        pagerduty: Arc<dyn PagerDutyClient>,
        sms_gateways: HashMap<String, String>,
    ) -> Self {
        let hostname = sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string());
        Self {
            mailer,
            pagerduty,
            sms_gateways,
            client_label: format!("fleet-checks daemon on: {hostname}"),
        }
    }

    pub fn client_label(&self) -> &str {
        &self.client_label
    }

    /// Dispatch `trigger`'s action for a check that failed `violations`
    /// times. `last_violation` is the newest violating record and
    /// `incident_key` the key of an incident still open for this trigger.
    #[instrument(
        skip(self, check, trigger, last_violation, incident_key),
        fields(check_id = check.id, trigger_id = trigger.id, transport = trigger.action.transport())
    )]
    pub async fn dispatch(
        &self,
        check: &CheckDefinition,
        trigger: &Trigger,
        violations: usize,
        last_violation: Option<&ViolationRecord>,
        incident_key: Option<&str>,
    ) -> anyhow::Result<Delivery> {
        match &trigger.action {
            TriggerAction::Nothing => Ok(Delivery::Skipped),

            TriggerAction::Email { email } => {
                if email.trim().is_empty() {
                    bail!("trigger has no email address");
                }
                let subject = summary(check, violations);
                let body = last_violation
                    .map(|record| render_email_body(check, record))
                    .unwrap_or_default();

                self.mailer()?.send(email.trim(), &subject, &body).await?;
                info!("sent email notification to {email}");
                Ok(Delivery::Sent)
            }

            TriggerAction::Sms { phone, carrier } => {
                let carrier = carrier.to_lowercase();
                let gateway = self
                    .sms_gateways
                    .get(&carrier)
                    .ok_or_else(|| anyhow!("no SMS gateway for carrier {carrier:?}"))?;

                let digits = flatten_phone(phone);
                if digits.len() != 10 {
                    warn!(
                        "phone number {digits:?} has {} digits instead of 10, skipping",
                        digits.len()
                    );
                    return Ok(Delivery::Skipped);
                }

                let to = format!("{digits}@{gateway}");
                self.mailer()?.send(&to, "", &summary(check, violations)).await?;
                info!("sent SMS notification to {to}");
                Ok(Delivery::Sent)
            }

            TriggerAction::PagerDuty {
                service_key,
                description,
                incident_key: configured_key,
            } => {
                let details = match last_violation {
                    Some(record) => serde_json::to_value(&record.expressions)?,
                    None => serde_json::Value::Null,
                };

                let incident_key = Some(configured_key.trim())
                    .filter(|key| !key.is_empty())
                    .or(incident_key)
                    .map(str::to_string);

                let event = PagerDutyEvent {
                    service_key: service_key.clone(),
                    event_type: "trigger",
                    description: description.clone(),
                    incident_key,
                    client: self.client_label.clone(),
                    details,
                };

                let key = self.pagerduty.submit_trigger(&event).await?;
                info!("PagerDuty incident {key} triggered");
                Ok(Delivery::Incident(key))
            }
        }
    }

    fn mailer(&self) -> anyhow::Result<&Arc<dyn MailSender>> {
        self.mailer
            .as_ref()
            .ok_or_else(|| anyhow!("no SMTP configuration, cannot send mail"))
    }
}

/// Subject line for email and body for SMS.
pub fn summary(check: &CheckDefinition, violations: usize) -> String {
    format!("Check(ID: {}): {}, failed {} times", check.id, check.name, violations)
}

/// Plain-text description of the newest violation.
pub fn render_email_body(check: &CheckDefinition, violation: &ViolationRecord) -> String {
    let mut body = String::new();
    let _ = writeln!(body, "Check(ID: {}): {}", check.id, check.name);
    let _ = writeln!(body, "Last violation: {}", violation.created.to_rfc3339());

    for (index, expression) in violation.expressions.iter().enumerate() {
        let result = &expression.result;
        let _ = writeln!(body);
        let _ = writeln!(body, "{}. [{}] {}", index + 1, expression.kind.type_name(), expression.kind);
        let _ = writeln!(body, "   Failing: {}", result.value);
        if !result.message.is_empty() {
            let _ = writeln!(body, "   Message: {}", result.message);
        }
        if !result.bad_hostnames.is_empty() {
            let _ = writeln!(body, "   Bad hosts: {}", result.bad_hostnames.join(", "));
        }
        if !result.good_hostnames.is_empty() {
            let _ = writeln!(body, "   Good hosts: {}", result.good_hostnames.join(", "));
        }
    }

    body
}

/// Keep only the digits of a phone number.
pub fn flatten_phone(phone: &str) -> String {
    phone.chars().filter(char::is_ascii_digit).collect()
}
