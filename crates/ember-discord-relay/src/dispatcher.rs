//! API dispatcher: a single-consumer worker that drains the outbound queue,
//! merges compatible adjacent messages, and performs the HTTP calls under
//! the service's rate-limit rules. All network calls and all sleeps happen
//! on the worker task; enqueueing never blocks.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::header::{HeaderMap, HeaderValue};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::outbound::OutboundMessage;

const MAX_SEND_ATTEMPTS: usize = 10;
/// Give-up threshold shared by server errors and transport failures.
const ERROR_ATTEMPT_BUDGET: usize = 3;
const RATE_LIMIT_FALLBACK: Duration = Duration::from_secs(30);
/// Added on top of every server-advised reset window.
const RATE_LIMIT_BUFFER: Duration = Duration::from_millis(500);

/// Handle for enqueueing outbound messages. Cloneable; the worker exits once
/// every handle is dropped and the queue has drained.
#[derive(Clone)]
pub struct ApiDispatcher {
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

impl ApiDispatcher {
    /// Starts the worker task and returns the enqueue handle plus the
    /// worker's join handle.
    pub fn spawn(client: RestClient) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_dispatch_worker(rx, client));
        (Self { tx }, handle)
    }

    /// Appends a message to the pending queue and wakes the worker. Never
    /// blocks or sleeps.
    pub fn enqueue(&self, message: OutboundMessage) {
        if self.tx.send(message).is_err() {
            debug!("dispatcher is shut down, dropping outbound message");
        }
    }

    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

pub(crate) async fn run_dispatch_worker(
    mut rx: mpsc::UnboundedReceiver<OutboundMessage>,
    client: RestClient,
) {
    // A message that refused to merge becomes the next head, preserving
    // queue order.
    let mut carry: Option<OutboundMessage> = None;
    loop {
        let mut head = match carry.take() {
            Some(message) => message,
            None => match rx.recv().await {
                Some(message) => message,
                None => break,
            },
        };

        // Greedily absorb immediately-following compatible messages so one
        // call covers the whole run.
        while let Ok(next) = rx.try_recv() {
            if let Some(refused) = head.try_absorb(next) {
                carry = Some(refused);
                break;
            }
        }

        if let Err(error) = client.send_message(&head).await {
            warn!(channel_id = %head.channel_id(), %error, "outbound message abandoned");
        }
    }
    debug!("dispatch worker stopped");
}

/// Thin REST client carrying the bot credential and retry policy.
#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
}

impl RestClient {
    pub fn new(api_base: &str, token: &str, request_timeout_ms: u64) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            HeaderValue::from_static("ember-relay"),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("application/json"),
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(request_timeout_ms.max(1)))
            .build()
            .context("failed to create relay rest client")?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.trim().to_string(),
        })
    }

    /// Performs one logical call with up to [`MAX_SEND_ATTEMPTS`] attempts.
    /// Rate limits sleep and retry without consuming the error budget;
    /// server errors and transport faults share a budget of
    /// [`ERROR_ATTEMPT_BUDGET`]; DNS failures and unexpected failures are
    /// abandoned immediately.
    pub async fn send_message(&self, message: &OutboundMessage) -> Result<()> {
        let url = format!("{}{}", self.api_base, message.route());
        let body = message.body();
        let mut failures = 0usize;

        for _ in 0..MAX_SEND_ATTEMPTS {
            let response = self
                .http
                .post(&url)
                .header(
                    reqwest::header::AUTHORIZATION,
                    format!("Bot {}", self.token),
                )
                .json(&body)
                .send()
                .await;

            match response {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if status == 429 {
                        let delay = rate_limit_delay(response.headers());
                        warn!(
                            delay_ms = delay.as_millis() as u64,
                            "rate limited, pausing outbound traffic"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    if (500..=504).contains(&status) {
                        failures += 1;
                        if failures >= ERROR_ATTEMPT_BUDGET {
                            bail!("giving up after {failures} server errors (last status {status})");
                        }
                        warn!(status, "server error, retrying send");
                        continue;
                    }
                    if !(200..300).contains(&status) {
                        let detail = response.text().await.unwrap_or_default();
                        bail!(
                            "send rejected with status {status}: {}",
                            truncate_for_log(&detail, 800)
                        );
                    }
                    if remaining_quota(response.headers()) == Some(1) {
                        // The next call would trip the limit; wait out the
                        // window instead of causing a 429.
                        let delay = reset_delay(response.headers())
                            .unwrap_or(RATE_LIMIT_FALLBACK)
                            + RATE_LIMIT_BUFFER;
                        debug!(
                            delay_ms = delay.as_millis() as u64,
                            "outbound quota nearly exhausted, pausing"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    return Ok(());
                }
                Err(error) => match classify_transport_failure(&error) {
                    TransportFailure::NameResolution => {
                        return Err(error)
                            .context("name resolution failed, abandoning send");
                    }
                    TransportFailure::Io => {
                        failures += 1;
                        if failures >= ERROR_ATTEMPT_BUDGET {
                            return Err(error)
                                .with_context(|| format!("giving up after {failures} transport failures"));
                        }
                        warn!(%error, "transport failure, retrying send");
                    }
                    TransportFailure::Other => {
                        return Err(error).context("unexpected send failure, abandoning");
                    }
                },
            }
        }
        bail!("send abandoned after {MAX_SEND_ATTEMPTS} attempts")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportFailure {
    NameResolution,
    Io,
    Other,
}

fn classify_transport_failure(error: &reqwest::Error) -> TransportFailure {
    if is_dns_failure(error) {
        return TransportFailure::NameResolution;
    }
    if error.is_timeout() || error.is_connect() || error.is_request() || error.is_body() {
        return TransportFailure::Io;
    }
    TransportFailure::Other
}

// reqwest exposes no typed DNS variant; the resolver error only shows up in
// the source chain.
fn is_dns_failure(error: &reqwest::Error) -> bool {
    let mut source = std::error::Error::source(error);
    while let Some(current) = source {
        let text = current.to_string();
        if text.contains("dns error") || text.contains("failed to lookup address") {
            return true;
        }
        source = current.source();
    }
    false
}

fn parse_float_seconds(headers: &HeaderMap, name: &str) -> Option<Duration> {
    let seconds = headers.get(name)?.to_str().ok()?.trim().parse::<f64>().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(seconds))
}

fn reset_delay(headers: &HeaderMap) -> Option<Duration> {
    parse_float_seconds(headers, "x-ratelimit-reset-after")
}

/// Server-advised pause for a 429: millisecond-precision reset header first,
/// coarser retry-after next, fixed fallback last, always plus the buffer.
fn rate_limit_delay(headers: &HeaderMap) -> Duration {
    reset_delay(headers)
        .or_else(|| parse_float_seconds(headers, "retry-after"))
        .unwrap_or(RATE_LIMIT_FALLBACK)
        + RATE_LIMIT_BUFFER
}

fn remaining_quota(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("x-ratelimit-remaining")?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn truncate_for_log(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut output: String = text.chars().take(limit).collect();
    output.push_str("...");
    output
}
