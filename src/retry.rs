/// Retry Controller: runs one call descriptor to completion.
///
/// Each failure is classified as transient, quota or fatal. Transient and
/// quota failures are retried with capped exponential backoff plus jitter
/// (quota failures on a slower schedule); fatal ones propagate at once. The
/// whole loop is bound to an overall deadline and to the caller's abort
/// signal, both of which cut an in-flight attempt short.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::config::{BackoffSettings, RowGateConfig};
use crate::descriptor::{CallContext, CallDescriptor};
use crate::error::{AttemptRecord, ErrorKind, Result, RowGateError};
use crate::transport::{StoreResponse, Transport, TransportError};

/// Substrings the store uses to report its own quota being exhausted.
const QUOTA_MARKERS: &[&str] = &[
    "rate_limit_exceeded",
    "ratelimitexceeded",
    "userratelimitexceeded",
    "quotaexceeded",
    "quota exceeded",
    "resource_exhausted",
];

const TRANSIENT_STATUSES: &[u16] = &[408, 429, 500, 502, 503, 504];

/// Statuses meaning the store rejected the request without applying it.
const REJECTED_STATUSES: &[u16] = &[408, 429, 503];

const JITTER_FRACTION: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Success,
    Transient,
    Quota,
    Fatal,
}

fn has_quota_marker(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    QUOTA_MARKERS.iter().any(|m| lower.contains(m))
}

/// A 2xx only counts as a quota failure when it is an error envelope, so a
/// cell that happens to say "quota exceeded" is not misread.
fn success_carries_quota_error(body: &[u8]) -> bool {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => map
            .get("error")
            .map_or(false, |err| has_quota_marker(&err.to_string())),
        _ => false,
    }
}

pub fn classify(response: &StoreResponse) -> Classification {
    let status = response.status;
    if (200..300).contains(&status) {
        if success_carries_quota_error(&response.body) {
            return Classification::Quota;
        }
        return Classification::Success;
    }
    if (status == 429 || status == 500) && has_quota_marker(&response.body_text()) {
        return Classification::Quota;
    }
    if TRANSIENT_STATUSES.contains(&status) {
        return Classification::Transient;
    }
    Classification::Fatal
}

/// Human-readable part of an error body.
fn error_message(response: &StoreResponse) -> String {
    if let Ok(value) = serde_json::from_slice::<Value>(&response.body) {
        if let Some(msg) = value.pointer("/error/message").and_then(Value::as_str) {
            return msg.to_string();
        }
    }
    let text = response.body_text();
    if text.len() > 200 {
        let mut end = 200;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &text[..end])
    } else {
        text
    }
}

fn response_error(class: Classification, response: &StoreResponse) -> RowGateError {
    let message = error_message(response);
    let status = response.status;
    match class {
        Classification::Quota => RowGateError::Quota { status, message },
        Classification::Transient => RowGateError::Transient {
            status: Some(status),
            message,
        },
        Classification::Fatal | Classification::Success => RowGateError::Fatal {
            status: Some(status),
            message,
        },
    }
}

fn transport_error(err: &TransportError) -> RowGateError {
    RowGateError::Transient {
        status: None,
        message: err.to_string(),
    }
}

/// `min(base * 2^(attempt-1), cap)`, before jitter.
pub fn base_delay(attempt: u32, params: BackoffSettings) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    params
        .base()
        .saturating_mul(2u32.saturating_pow(exponent))
        .min(params.cap())
}

/// Backoff before the retry following failed attempt `attempt` (1-based),
/// with jitter drawn uniformly from `[0, 0.3 * delay]`.
pub fn backoff<R: Rng>(attempt: u32, params: BackoffSettings, rng: &mut R) -> Duration {
    let delay = base_delay(attempt, params);
    let factor: f64 = rng.gen_range(0.0..=JITTER_FRACTION);
    delay + delay.mul_f64(factor)
}

/// Smallest and largest value `backoff` can return.
pub fn backoff_bounds(attempt: u32, params: BackoffSettings) -> (Duration, Duration) {
    let delay = base_delay(attempt, params);
    (delay, delay + delay.mul_f64(JITTER_FRACTION))
}

/// Per-call bookkeeping; lives only as long as one `execute`.
#[derive(Debug, Default)]
struct RetryState {
    attempt: u32,
    last_kind: Option<ErrorKind>,
    next_delay: Option<Duration>,
    history: Vec<AttemptRecord>,
}

impl RetryState {
    fn record(&mut self, err: &RowGateError, backoff: Option<Duration>) {
        self.last_kind = Some(err.kind());
        self.next_delay = backoff;
        self.history.push(AttemptRecord {
            attempt: self.attempt,
            kind: err.kind(),
            status: err.status(),
            message: err.to_string(),
            backoff,
        });
    }
}

/// A successful call and what it took.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub response: StoreResponse,
    pub attempts: u32,
    /// Total time spent in backoff sleeps.
    pub waited: Duration,
}

pub struct RetryController {
    transport: Arc<dyn Transport>,
    max_attempts: u32,
    transient: BackoffSettings,
    quota: BackoffSettings,
    request_timeout: Duration,
}

impl RetryController {
    pub fn new(transport: Arc<dyn Transport>, config: &RowGateConfig) -> Self {
        Self {
            transport,
            max_attempts: config.max_attempts.max(1),
            transient: config.transient,
            quota: config.quota_backoff(),
            request_timeout: config.request_timeout(),
        }
    }

    pub async fn execute(&self, descriptor: &CallDescriptor) -> Result<CallOutcome> {
        self.execute_with(descriptor, &CallContext::default()).await
    }

    pub async fn execute_with(
        &self,
        descriptor: &CallDescriptor,
        ctx: &CallContext,
    ) -> Result<CallOutcome> {
        let start = Instant::now();
        let deadline = ctx.effective_deadline(start, self.request_timeout);
        let mut state = RetryState::default();
        let mut waited = Duration::ZERO;
        let call = descriptor.kind.name();

        loop {
            if ctx.is_aborted() {
                return Err(RowGateError::Cancelled {
                    attempts: state.attempt,
                });
            }
            state.attempt += 1;
            debug!("{}: attempt {}/{}", call, state.attempt, self.max_attempts);

            let result = tokio::select! {
                biased;
                _ = wait_for_abort(ctx) => {
                    return Err(RowGateError::Cancelled { attempts: state.attempt });
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("{}: deadline hit during attempt {}", call, state.attempt);
                    return Err(RowGateError::Timeout {
                        elapsed: start.elapsed(),
                        attempts: state.attempt,
                    });
                }
                result = self.attempt(descriptor) => result,
            };

            let (err, resend_is_safe) = match result {
                Ok(response) => match classify(&response) {
                    Classification::Success => {
                        return Ok(CallOutcome {
                            response,
                            attempts: state.attempt,
                            waited,
                        });
                    }
                    class => {
                        let safe = class == Classification::Quota
                            || REJECTED_STATUSES.contains(&response.status);
                        (response_error(class, &response), safe)
                    }
                },
                Err(e) => {
                    let safe = matches!(e, TransportError::Connect(_));
                    (transport_error(&e), safe)
                }
            };

            let kind = err.kind();
            let retryable = match kind {
                ErrorKind::Quota => true,
                ErrorKind::Transient => descriptor.idempotent || resend_is_safe,
                _ => false,
            };
            if !retryable {
                if kind == ErrorKind::Transient {
                    warn!(
                        "{}: not resending non-idempotent call after ambiguous failure: {}",
                        call, err
                    );
                }
                return Err(err);
            }

            if state.attempt >= self.max_attempts {
                state.record(&err, None);
                if kind == ErrorKind::Quota {
                    warn!(
                        "{}: store quota still exhausted after {} attempts; store is overloaded",
                        call, state.attempt
                    );
                }
                error!(
                    "{}: giving up after {} attempts: {}",
                    call, state.attempt, err
                );
                return Err(RowGateError::RetriesExhausted {
                    kind,
                    attempts: state.attempt,
                    last: Box::new(err),
                    history: state.history,
                });
            }

            let params = if kind == ErrorKind::Quota {
                self.quota
            } else {
                self.transient
            };
            let delay = backoff(state.attempt, params, &mut rand::thread_rng());
            state.record(&err, Some(delay));
            warn!(
                "{}: {:?} failure on attempt {}/{}, retrying in {:?}: {}",
                call, state.last_kind, state.attempt, self.max_attempts, state.next_delay, err
            );

            tokio::select! {
                biased;
                _ = wait_for_abort(ctx) => {
                    return Err(RowGateError::Cancelled { attempts: state.attempt });
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(RowGateError::Timeout {
                        elapsed: start.elapsed(),
                        attempts: state.attempt,
                    });
                }
                _ = tokio::time::sleep(delay) => {
                    waited += delay;
                }
            }
        }
    }

    async fn attempt(
        &self,
        descriptor: &CallDescriptor,
    ) -> std::result::Result<StoreResponse, TransportError> {
        match descriptor.timeout {
            Some(limit) => tokio::time::timeout(limit, self.transport.send(&descriptor.kind))
                .await
                .unwrap_or(Err(TransportError::TimedOut)),
            None => self.transport.send(&descriptor.kind).await,
        }
    }
}

async fn wait_for_abort(ctx: &CallContext) {
    match &ctx.abort {
        Some(signal) => signal.aborted().await,
        None => futures::future::pending::<()>().await,
    }
}
