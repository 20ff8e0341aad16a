//! Live reachability probes: ICMP ping, SSH connect and HTTP requests.
//!
//! Every probe is bounded by the configured probe timeout. A probe never
//! returns an error to the evaluator; failures are reported as
//! `ProbeOutcome::Unreachable` with the reason.

use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use tokio::process::Command;
use tracing::{debug, trace};

use super::model::{HttpProbe, SshProbe};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Reachable,
    Unreachable(String),
}

impl ProbeOutcome {
    pub fn is_bad(&self) -> bool {
        matches!(self, ProbeOutcome::Unreachable(_))
    }
}

#[async_trait]
pub trait Prober: Send + Sync {
    async fn ping(&self, hostname: &str) -> ProbeOutcome;
    async fn ssh(&self, hostname: &str, probe: &SshProbe) -> ProbeOutcome;
    async fn http(&self, hostname: &str, probe: &HttpProbe) -> ProbeOutcome;
}

/// Probes using the system `ping`/`ssh` binaries and a shared HTTP client.
pub struct SystemProber {
    client: reqwest::Client,
    timeout: Duration,
}

impl SystemProber {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP probe client")?;

        Ok(Self { client, timeout })
    }

    async fn run(&self, mut command: Command) -> Result<std::process::Output, String> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(format!("failed to spawn probe: {e}")),
            Err(_) => Err(format!("probe timed out after {:?}", self.timeout)),
        }
    }
}

/// SSH output that proves the daemon reached a live sshd.
const SSH_REACHABLE_MARKERS: [&str; 2] = ["Permission denied", "Host key verification failed"];

#[async_trait]
impl Prober for SystemProber {
    async fn ping(&self, hostname: &str) -> ProbeOutcome {
        let mut command = Command::new("ping");
        command.args(["-c", "1", hostname]);

        match self.run(command).await {
            Ok(output) if output.status.success() => ProbeOutcome::Reachable,
            Ok(output) => ProbeOutcome::Unreachable(String::from_utf8_lossy(&output.stdout).trim().to_string()),
            Err(reason) => ProbeOutcome::Unreachable(reason),
        }
    }

    async fn ssh(&self, hostname: &str, probe: &SshProbe) -> ProbeOutcome {
        let mut command = Command::new("ssh");
        command.args(["-o", "BatchMode=yes", "-o", "ConnectTimeout=10"]);
        if !probe.port.trim().is_empty() {
            command.args(["-p", probe.port.trim()]);
        }
        if probe.username.trim().is_empty() {
            command.arg(hostname);
        } else {
            command.arg(format!("{}@{}", probe.username.trim(), hostname));
        }
        command.arg("exit");

        match self.run(command).await {
            Ok(output) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                trace!("ssh output for {hostname}: {text}");

                if output.status.success() || SSH_REACHABLE_MARKERS.iter().any(|m| text.contains(m)) {
                    ProbeOutcome::Reachable
                } else {
                    ProbeOutcome::Unreachable(text.trim().to_string())
                }
            }
            Err(reason) => ProbeOutcome::Unreachable(reason),
        }
    }

    async fn http(&self, hostname: &str, probe: &HttpProbe) -> ProbeOutcome {
        let url = probe_url(hostname, probe);
        let method = match reqwest::Method::from_bytes(probe.method().as_bytes()) {
            Ok(method) => method,
            Err(_) => return ProbeOutcome::Unreachable(format!("invalid HTTP method {:?}", probe.http_method)),
        };

        let mut request = self
            .client
            .request(method, &url)
            .headers(parse_headers(&probe.headers));

        if !probe.http_body.is_empty() {
            let content_type = body_content_type(&probe.http_body);
            request = request
                .header(CONTENT_TYPE, content_type)
                .body(probe.http_body.clone());
        }
        if !probe.username.is_empty() || !probe.password.is_empty() {
            request = request.basic_auth(&probe.username, Some(&probe.password));
        }

        debug!("probing {url}");
        match request.send().await {
            Ok(response) if response.status() == reqwest::StatusCode::OK => ProbeOutcome::Reachable,
            Ok(response) => ProbeOutcome::Unreachable(format!("{url} returned {}", response.status())),
            Err(e) => ProbeOutcome::Unreachable(e.to_string()),
        }
    }
}

pub fn probe_url(hostname: &str, probe: &HttpProbe) -> String {
    match probe.port.trim() {
        "" => format!("{}://{}", probe.scheme(), hostname),
        port => format!("{}://{}:{}", probe.scheme(), hostname, port),
    }
}

/// Parse `key=value` pairs separated by newlines or commas. Malformed pairs
/// are dropped.
pub fn parse_headers(raw: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for pair in raw.split(['\n', ',']) {
        let Some((name, value)) = pair.split_once('=') else {
            continue;
        };
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.trim().as_bytes()),
            HeaderValue::from_str(value.trim()),
        ) else {
            continue;
        };
        headers.append(name, value);
    }

    headers
}

fn body_content_type(body: &str) -> &'static str {
    match body.trim_start().chars().next() {
        Some('{') | Some('[') => "application/json",
        _ => "application/x-www-form-urlencoded",
    }
}
