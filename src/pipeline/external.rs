//! 外部呼び出し 1 回分の共通処理。
//!
//! 共有の [`RateLimitState`] を試行ごとに確認し、403/429 を受けたら状態を立てる。
//! 意味分類と検索の両方がこの経路を通る。
use std::{
    future::Future,
    time::{Duration, Instant},
};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    clients::BackendError,
    observability::metrics::Metrics,
    util::{
        rate_limit::RateLimitState,
        retry::{RetryConfig, RetryError, Sleeper, retry_with_backoff},
    },
};

#[derive(Debug)]
pub(crate) enum AttemptError {
    /// 試行前にレート制限が立っていた
    CircuitOpen,
    Backend(BackendError),
}

impl AttemptError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend(error) if !error.is_rate_limit())
    }
}

pub(crate) struct ExternalCall<'a> {
    pub(crate) service: &'static str,
    pub(crate) rate_limit: &'a RateLimitState,
    pub(crate) metrics: Option<&'a Metrics>,
    pub(crate) timeout: Duration,
    pub(crate) retry: &'a RetryConfig,
    pub(crate) sleeper: &'a dyn Sleeper,
}

impl ExternalCall<'_> {
    /// `call` を再試行付きで実行する。レート制限は再試行しない。
    pub(crate) async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        call: F,
    ) -> Result<T, RetryError<AttemptError>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        retry_with_backoff(
            self.retry,
            self.sleeper,
            cancel,
            |attempt| self.attempt(attempt, &call),
            AttemptError::is_retryable,
        )
        .await
    }

    async fn attempt<T, F, Fut>(&self, attempt: usize, call: &F) -> Result<T, AttemptError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        if self.rate_limit.is_rate_limited() {
            return Err(AttemptError::CircuitOpen);
        }
        self.rate_limit.mark_used();
        if let Some(metrics) = self.metrics.filter(|_| attempt > 1) {
            metrics.retries_total.inc();
        }

        let started = Instant::now();
        let outcome = match tokio::time::timeout(self.timeout, call()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(BackendError::Timeout(self.timeout)),
        };
        if let Some(metrics) = self.metrics {
            metrics.record_external_call(self.service, started.elapsed().as_secs_f64());
        }

        outcome.map_err(|error| {
            if let Some(metrics) = self.metrics {
                metrics.record_external_failure(self.service, error.kind());
            }
            if error.is_rate_limit() {
                if self.rate_limit.trip() {
                    warn!(service = self.service, error = %error, "rate limited, disabling external calls");
                    if let Some(metrics) = self.metrics {
                        metrics.record_rate_limit_trip(self.service);
                    }
                }
            } else {
                debug!(service = self.service, attempt, error = %error, "external attempt failed");
            }
            AttemptError::Backend(error)
        })
    }
}
