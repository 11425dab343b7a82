//! Bounded exponential-backoff retry for one-shot calls and streams.

use std::{future::Future, pin::Pin, time::Duration};

use async_trait::async_trait;
use tracing::warn;

use crate::{
    errors::Error, model::types::ConversationMessage, stream::MessageSource,
    stream::MessageStream, Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before the retry that follows failed attempt `attempt` (0-based):
    /// `base * 2^attempt`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn should_retry(&self, attempt: u32, err: &Error) -> bool {
        err.is_retryable() && attempt + 1 < self.max_attempts.max(1)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or attempts run out.
    /// The last failure is returned.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(err) if self.should_retry(attempt, &err) => {
                    let delay = self.delay_for(attempt);
                    warn!(what, attempt = attempt + 1, ?delay, error = %err, "retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

type OpenFuture = Pin<Box<dyn Future<Output = Result<MessageStream>> + Send>>;
type OpenFn = Box<dyn FnMut() -> OpenFuture + Send>;

/// A stream that re-issues its request from the beginning on retryable failures, but only
/// while nothing has been delivered downstream. Once a message has been yielded, a failure
/// is surfaced as-is so the consumer never sees duplicated partial output.
pub struct RetryingStream {
    policy: RetryPolicy,
    what: String,
    open: OpenFn,
    current: Option<MessageStream>,
    attempt: u32,
    delivered: bool,
    done: bool,
}

impl RetryingStream {
    pub fn new<F, Fut>(policy: RetryPolicy, what: impl Into<String>, mut open: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<MessageStream>> + Send + 'static,
    {
        Self {
            policy,
            what: what.into(),
            open: Box::new(move || Box::pin(open()) as OpenFuture),
            current: None,
            attempt: 0,
            delivered: false,
            done: false,
        }
    }

    /// Attempts made so far (the first try counts).
    pub fn attempts(&self) -> u32 {
        self.attempt + u32::from(self.current.is_some() || self.done)
    }

    /// Stop and release the underlying request.
    pub fn cancel(&mut self) {
        if let Some(mut s) = self.current.take() {
            s.cancel();
        }
        self.done = true;
    }

    pub async fn next(&mut self) -> Option<Result<ConversationMessage>> {
        loop {
            if self.done {
                return None;
            }

            if self.current.is_none() {
                match (self.open)().await {
                    Ok(s) => self.current = Some(s),
                    Err(err) => {
                        if self.policy.should_retry(self.attempt, &err) {
                            self.back_off(&err).await;
                            continue;
                        }
                        self.done = true;
                        return Some(Err(err));
                    }
                }
            }

            let Some(stream) = self.current.as_mut() else {
                continue;
            };

            match stream.next().await {
                Some(Ok(m)) => {
                    self.delivered = true;
                    return Some(Ok(m));
                }
                Some(Err(err)) => {
                    self.current = None;
                    if !self.delivered && self.policy.should_retry(self.attempt, &err) {
                        self.back_off(&err).await;
                        continue;
                    }
                    self.done = true;
                    return Some(Err(err));
                }
                None => {
                    self.done = true;
                    return None;
                }
            }
        }
    }

    async fn back_off(&mut self, err: &Error) {
        let delay = self.policy.delay_for(self.attempt);
        warn!(what = %self.what, attempt = self.attempt + 1, ?delay, error = %err, "retrying stream before first message");
        tokio::time::sleep(delay).await;
        self.attempt += 1;
    }
}

#[async_trait]
impl MessageSource for RetryingStream {
    async fn next_message(&mut self) -> Option<Result<ConversationMessage>> {
        self.next().await
    }
}
