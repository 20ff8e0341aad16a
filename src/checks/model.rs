//! Check, expression and trigger definitions
//!
//! Expressions, triggers and host lists are persisted as JSON arrays whose
//! field names are fixed by existing stored definitions (`"Type"`,
//! `"MinHost"`, `"LowViolationsCount"`, ...). The serde attributes below keep
//! that external shape while the in-memory form is a closed set of enums.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub type ClusterId = i64;
pub type CheckId = i64;
pub type TriggerId = i64;

/// Upper band used when a trigger has no explicit high violation count.
pub const UNBOUNDED_VIOLATIONS: i64 = 1_000_000;

/// A check definition as read from the check store.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckDefinition {
    pub id: CheckId,
    pub cluster_id: ClusterId,
    pub name: String,
    /// Evaluation interval as written by the user ("60s", "5m")
    pub interval: String,
    pub hosts: HostSelection,
    pub expressions: Vec<Expression>,
    pub triggers: Vec<Trigger>,
    pub is_silenced: bool,
}

/// Which hosts a check evaluates against.
#[derive(Debug, Clone, PartialEq)]
pub enum HostSelection {
    /// Host query predicate resolved against recently reporting hosts
    Query(String),
    /// Explicit hostnames
    List(Vec<String>),
}

impl CheckDefinition {
    /// Parse the evaluation interval.
    ///
    /// Zero-length intervals are rejected so that a worker never spins.
    pub fn interval(&self) -> anyhow::Result<Duration> {
        let interval = humantime::parse_duration(self.interval.trim())
            .with_context(|| format!("unparsable check interval {:?}", self.interval))?;

        if interval.is_zero() {
            bail!("check interval must be greater than zero");
        }

        Ok(interval)
    }

    /// Explicit hostnames, if the check uses a host list.
    pub fn hosts_list(&self) -> &[String] {
        match &self.hosts {
            HostSelection::List(names) => names,
            HostSelection::Query(_) => &[],
        }
    }
}

/// Raw row layout of a stored check, JSON columns still encoded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoredCheck {
    pub id: CheckId,
    pub cluster_id: ClusterId,
    pub name: String,
    pub interval: String,
    pub is_silenced: bool,
    pub hosts_query: String,
    pub hosts_list: String,
    pub expressions: String,
    pub triggers: String,
}

impl StoredCheck {
    /// Decode the JSON columns into a typed definition.
    pub fn into_definition(self) -> Result<CheckDefinition, serde_json::Error> {
        let hosts = if self.hosts_query.trim().is_empty() {
            HostSelection::List(decode_array(&self.hosts_list)?)
        } else {
            HostSelection::Query(self.hosts_query)
        };

        Ok(CheckDefinition {
            id: self.id,
            cluster_id: self.cluster_id,
            name: self.name,
            interval: self.interval,
            hosts,
            expressions: decode_array(&self.expressions)?,
            triggers: decode_array(&self.triggers)?,
            is_silenced: self.is_silenced,
        })
    }

    /// Encode a typed definition back into its stored layout.
    pub fn from_definition(check: &CheckDefinition) -> Result<Self, serde_json::Error> {
        let (hosts_query, hosts_list) = match &check.hosts {
            HostSelection::Query(query) => (query.clone(), "[]".to_string()),
            HostSelection::List(names) => (String::new(), serde_json::to_string(names)?),
        };

        Ok(Self {
            id: check.id,
            cluster_id: check.cluster_id,
            name: check.name.clone(),
            interval: check.interval.clone(),
            is_silenced: check.is_silenced,
            hosts_query,
            hosts_list,
            expressions: serde_json::to_string(&check.expressions)?,
            triggers: serde_json::to_string(&check.triggers)?,
        })
    }
}

/// Empty columns and JSON `null` both decode to an empty list.
fn decode_array<T: serde::de::DeserializeOwned>(raw: &str) -> Result<Vec<T>, serde_json::Error> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let items: Option<Vec<T>> = serde_json::from_str(raw)?;
    Ok(items.unwrap_or_default())
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// One expression of a check plus the result of its latest evaluation.
///
/// `result` is only filled while evaluating; a definition fresh from the
/// store carries the default (empty) result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expression {
    #[serde(flatten)]
    pub kind: ExpressionKind,

    #[serde(rename = "Result", default, deserialize_with = "null_as_default")]
    pub result: ExpressionResult,
}

impl Expression {
    pub fn new(kind: ExpressionKind) -> Self {
        Self {
            kind,
            result: ExpressionResult::default(),
        }
    }

    pub fn with_result(mut self, result: ExpressionResult) -> Self {
        self.result = result;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum ExpressionKind {
    RawHostData(MetricThreshold),
    RelativeHostData(RelativeThreshold),
    LogData(LogThreshold),
    Ping(PingProbe),
    #[serde(rename = "SSH")]
    Ssh(SshProbe),
    #[serde(rename = "HTTP", alias = "HTTPS")]
    Http(HttpProbe),
    BooleanOperator(BooleanOperator),
}

impl ExpressionKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ExpressionKind::RawHostData(_) => "RawHostData",
            ExpressionKind::RelativeHostData(_) => "RelativeHostData",
            ExpressionKind::LogData(_) => "LogData",
            ExpressionKind::Ping(_) => "Ping",
            ExpressionKind::Ssh(_) => "SSH",
            ExpressionKind::Http(_) => "HTTP",
            ExpressionKind::BooleanOperator(_) => "BooleanOperator",
        }
    }
}

impl fmt::Display for ExpressionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpressionKind::RawHostData(e) => write!(
                f,
                "{} {} {} (min hosts: {})",
                e.metric, e.operator, e.value, e.min_host
            ),
            ExpressionKind::RelativeHostData(e) => write!(
                f,
                "{} {} {}% of {} over last {}m (min hosts: {})",
                e.metric, e.operator, e.value, e.prev_aggr, e.prev_range, e.min_host
            ),
            ExpressionKind::LogData(e) => write!(
                f,
                "logs matching {:?} over last {}m {} {} (min hosts: {})",
                e.search, e.prev_range, e.operator, e.value, e.min_host
            ),
            ExpressionKind::Ping(e) => write!(f, "ping (min hosts: {})", e.min_host),
            ExpressionKind::Ssh(e) => write!(f, "ssh port {:?} (min hosts: {})", e.port, e.min_host),
            ExpressionKind::Http(e) => write!(
                f,
                "{} {}://host:{} (min hosts: {})",
                e.method(),
                e.scheme(),
                e.port,
                e.min_host
            ),
            ExpressionKind::BooleanOperator(e) => write!(f, "{}", e.operator),
        }
    }
}

/// Comparison between an observed value and the configured threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    #[serde(rename = ">")]
    Greater,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "=", alias = "==")]
    Equal,
    #[serde(rename = "<")]
    Less,
    #[serde(rename = "<=")]
    LessOrEqual,
}

impl Comparison {
    /// True when `observed <op> threshold` holds, i.e. the host is bad.
    pub fn holds(self, observed: f64, threshold: f64) -> bool {
        match self {
            Comparison::Greater => observed > threshold,
            Comparison::GreaterOrEqual => observed >= threshold,
            Comparison::Equal => observed == threshold,
            Comparison::Less => observed < threshold,
            Comparison::LessOrEqual => observed <= threshold,
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Comparison::Greater => ">",
            Comparison::GreaterOrEqual => ">=",
            Comparison::Equal => "=",
            Comparison::Less => "<",
            Comparison::LessOrEqual => "<=",
        };
        f.write_str(symbol)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateKind {
    Avg,
    Max,
    Min,
    Sum,
}

impl fmt::Display for AggregateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggregateKind::Avg => "avg",
            AggregateKind::Max => "max",
            AggregateKind::Min => "min",
            AggregateKind::Sum => "sum",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoolOp {
    #[serde(rename = "and", alias = "AND")]
    And,
    #[serde(rename = "or", alias = "OR")]
    Or,
}

impl fmt::Display for BoolOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoolOp::And => f.write_str("and"),
            BoolOp::Or => f.write_str("or"),
        }
    }
}

/// Current metric value compared against a fixed threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricThreshold {
    #[serde(rename = "Metric")]
    pub metric: String,
    #[serde(rename = "Operator")]
    pub operator: Comparison,
    #[serde(rename = "Value")]
    pub value: f64,
    #[serde(rename = "MinHost", default)]
    pub min_host: usize,
}

/// Current metric value as a percentage of its historical aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelativeThreshold {
    #[serde(rename = "Metric")]
    pub metric: String,
    #[serde(rename = "Operator")]
    pub operator: Comparison,
    /// Percentage threshold
    #[serde(rename = "Value")]
    pub value: f64,
    #[serde(rename = "MinHost", default)]
    pub min_host: usize,
    /// Minutes of history to aggregate
    #[serde(rename = "PrevRange")]
    pub prev_range: i64,
    #[serde(rename = "PrevAggr")]
    pub prev_aggr: AggregateKind,
}

/// Number of matching log lines compared against a threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogThreshold {
    #[serde(rename = "Search")]
    pub search: String,
    #[serde(rename = "Operator")]
    pub operator: Comparison,
    #[serde(rename = "Value")]
    pub value: f64,
    #[serde(rename = "MinHost", default)]
    pub min_host: usize,
    #[serde(rename = "PrevRange")]
    pub prev_range: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PingProbe {
    #[serde(rename = "MinHost", default)]
    pub min_host: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SshProbe {
    #[serde(rename = "Port", default)]
    pub port: String,
    #[serde(rename = "Username", default)]
    pub username: String,
    #[serde(rename = "MinHost", default)]
    pub min_host: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpProbe {
    /// URL scheme, "http" or "https"
    #[serde(rename = "Protocol", default)]
    pub protocol: String,
    #[serde(rename = "Port", default)]
    pub port: String,
    /// `key=value` pairs separated by newlines or commas
    #[serde(rename = "Headers", default)]
    pub headers: String,
    #[serde(rename = "Username", default)]
    pub username: String,
    #[serde(rename = "Password", default)]
    pub password: String,
    #[serde(rename = "HTTPMethod", default)]
    pub http_method: String,
    #[serde(rename = "HTTPBody", default)]
    pub http_body: String,
    #[serde(rename = "MinHost", default)]
    pub min_host: usize,
}

impl HttpProbe {
    pub fn scheme(&self) -> &str {
        match self.protocol.trim() {
            "" => "http",
            scheme => scheme,
        }
    }

    pub fn method(&self) -> String {
        match self.http_method.trim() {
            "" => "GET".to_string(),
            method => method.to_uppercase(),
        }
    }
}

/// Sets the operator used to fold the following expression's verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BooleanOperator {
    #[serde(rename = "Operator")]
    pub operator: BoolOp,
}

/// Transient outcome of evaluating one expression.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpressionResult {
    /// True when the expression is failing
    #[serde(rename = "Value", default)]
    pub value: bool,
    #[serde(rename = "Message", default, deserialize_with = "null_as_default")]
    pub message: String,
    #[serde(rename = "BadHostnames", default, deserialize_with = "null_as_default")]
    pub bad_hostnames: Vec<String>,
    #[serde(rename = "GoodHostnames", default, deserialize_with = "null_as_default")]
    pub good_hostnames: Vec<String>,
}

impl ExpressionResult {
    /// Fail-safe result for an expression that had no hosts to look at.
    pub fn no_hosts() -> Self {
        Self {
            value: true,
            message: "There are no hosts to check".to_string(),
            ..Self::default()
        }
    }

    /// Tally per-host verdicts (`true` = bad) against the minimum host count.
    pub fn from_hosts<I>(min_host: usize, verdicts: I) -> Self
    where
        I: IntoIterator<Item = (String, bool)>,
    {
        let mut result = Self::default();
        for (hostname, bad) in verdicts {
            if bad {
                result.bad_hostnames.push(hostname);
            } else {
                result.good_hostnames.push(hostname);
            }
        }
        result.value = result.bad_hostnames.len() >= min_host;
        result
    }
}

/// Notification rule keyed to a violation-count band over a sliding window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    #[serde(rename = "ID")]
    pub id: TriggerId,
    #[serde(rename = "LowViolationsCount", default)]
    pub low_violations_count: i64,
    #[serde(rename = "HighViolationsCount", default)]
    pub high_violations_count: Option<i64>,
    #[serde(rename = "CreatedIntervalMinute", default)]
    pub created_interval_minute: i64,
    #[serde(rename = "Action")]
    pub action: TriggerAction,
}

impl Trigger {
    pub fn high_bound(&self) -> i64 {
        self.high_violations_count.unwrap_or(UNBOUNDED_VIOLATIONS)
    }

    /// Inclusive `[low, high]` band check.
    pub fn in_band(&self, violations: usize) -> bool {
        let violations = i64::try_from(violations).unwrap_or(i64::MAX);
        violations >= self.low_violations_count && violations <= self.high_bound()
    }

    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.created_interval_minute.max(0))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Transport")]
pub enum TriggerAction {
    #[serde(rename = "nothing", alias = "")]
    Nothing,
    #[serde(rename = "email")]
    Email {
        #[serde(rename = "Email", default)]
        email: String,
    },
    #[serde(rename = "sms")]
    Sms {
        #[serde(rename = "SMSPhone", default)]
        phone: String,
        #[serde(rename = "SMSCarrier", default)]
        carrier: String,
    },
    #[serde(rename = "pagerduty")]
    PagerDuty {
        #[serde(rename = "PagerDutyServiceKey", default)]
        service_key: String,
        #[serde(rename = "PagerDutyDescription", default)]
        description: String,
        #[serde(rename = "PagerDutyIncidentKey", default)]
        incident_key: String,
    },
}

impl TriggerAction {
    pub fn transport(&self) -> &'static str {
        match self {
            TriggerAction::Nothing => "nothing",
            TriggerAction::Email { .. } => "email",
            TriggerAction::Sms { .. } => "sms",
            TriggerAction::PagerDuty { .. } => "pagerduty",
        }
    }
}

/// One persisted evaluation cycle. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub cluster_id: ClusterId,
    pub check_id: CheckId,
    pub created: DateTime<Utc>,
    /// True when the check was failing
    pub result: bool,
    pub expressions: Vec<Expression>,
    /// Retention marker; the record is ignored by reads once this passes
    pub expires_at: DateTime<Utc>,
}

impl ViolationRecord {
    pub fn is_retained(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}
