//! Short-lived in-process retries with exponential backoff.
//!
//! Audit writes and async MDN deliveries retry here, inside one call. The
//! outbound transmission schedule is persisted instead (`engine::scheduler`)
//! because it has to survive restarts.

use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;

/// Backoff parameters
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt; 0 disables retrying
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction (0.0-1.0) by which each delay may randomly deviate
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::partner_delivery()
    }
}

impl RetryConfig {
    /// Tight loop for tests and local contention
    pub fn fast() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
            multiplier: 2.0,
            jitter: 0.3,
        }
    }

    /// SQLite writers waiting out `database is locked`
    pub fn database() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }

    /// POSTs to partner endpoints (async MDNs)
    pub fn partner_delivery() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(120),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Pause after failed attempt number `failed` (1-based)
    pub fn backoff(&self, failed: u32) -> Duration {
        let exponent = failed.saturating_sub(1).min(i32::MAX as u32) as i32;
        let nominal = (self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent))
            .min(self.max_delay.as_secs_f64());

        if self.jitter <= 0.0 {
            return Duration::from_secs_f64(nominal);
        }
        let spread = nominal * self.jitter;
        let jittered = nominal + rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

/// Outcome of [`Retry::run`]
#[derive(Debug)]
pub struct RetryResult<T, E> {
    /// The first success or the last error
    pub result: Result<T, E>,
    /// Attempts made, including the first
    pub attempts: u32,
    pub elapsed: Duration,
}

impl<T, E> RetryResult<T, E> {
    pub fn into_result(self) -> Result<T, E> {
        self.result
    }
}

/// Backoff executor
#[derive(Debug, Clone)]
pub struct Retry {
    config: RetryConfig,
}

impl Retry {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `operation` until it succeeds, fails with an error `is_transient`
    /// rejects, or the retry budget is spent. `label` names the operation in
    /// logs.
    pub async fn run<F, Fut, T, E, P>(
        &self,
        label: &str,
        operation: F,
        is_transient: P,
    ) -> RetryResult<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let started = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let error = match operation().await {
                Ok(value) => {
                    if attempts > 1 {
                        tracing::info!(operation = label, attempts, "Succeeded after retries");
                    }
                    return RetryResult {
                        result: Ok(value),
                        attempts,
                        elapsed: started.elapsed(),
                    };
                }
                Err(error) => error,
            };

            let transient = is_transient(&error);
            if !transient || attempts > self.config.max_retries {
                tracing::warn!(
                    operation = label,
                    attempts,
                    transient,
                    error = %error,
                    "Giving up"
                );
                return RetryResult {
                    result: Err(error),
                    attempts,
                    elapsed: started.elapsed(),
                };
            }

            let pause = self.config.backoff(attempts);
            tracing::debug!(
                operation = label,
                attempt = attempts,
                pause_ms = pause.as_millis() as u64,
                error = %error,
                "Transient failure, backing off"
            );
            tokio::time::sleep(pause).await;
        }
    }
}
