/// 指数バックオフ+ジッター付き再試行ロジック。
///
/// 待機は [`Sleeper`] 経由で行うため、テストでは実時間を消費せずに遅延列を検証できる。
/// キャンセルは各試行の前と各待機の前に確認し、試行中・待機中もトークンと競合させる。
use std::{future::Future, time::Duration};

use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 再試行戦略の設定。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// 最大試行回数（初回を含む）
    pub max_attempts: usize,
    /// ベースとなる遅延時間（ミリ秒）
    pub base_delay_ms: u64,
    /// 1 回の待機の上限（ミリ秒）
    pub max_delay_ms: u64,
    /// 上乗せするジッターの上限（ミリ秒）
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2000,
            max_delay_ms: 8000,
            jitter_ms: 500,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub const fn new(max_attempts: usize, base_delay_ms: u64, max_delay_ms: u64, jitter_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms,
            jitter_ms,
        }
    }

    /// ジッターを除いた遅延: `min(base * 2^(attempt-1), max)`。
    ///
    /// # Arguments
    /// * `attempt` - 失敗済みの試行回数（0 なら遅延なし）
    #[must_use]
    pub fn base_delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let shift = u32::try_from(attempt - 1).unwrap_or(u32::MAX);
        let exponential_delay = self
            .base_delay_ms
            .saturating_mul(1_u64.checked_shl(shift).unwrap_or(u64::MAX));

        Duration::from_millis(exponential_delay.min(self.max_delay_ms))
    }

    /// 指定された試行回数に対する遅延時間（`[0, jitter_ms]` の加算ジッター込み）。
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let base = self.base_delay_for_attempt(attempt);
        if base.is_zero() || self.jitter_ms == 0 {
            return base;
        }
        let jitter = rand::rng().random_range(0..=self.jitter_ms);
        base + Duration::from_millis(jitter)
    }

    /// この試行回数が再試行可能かどうかを判定する。
    #[must_use]
    pub const fn can_retry(&self, attempt: usize) -> bool {
        attempt < self.max_attempts
    }
}

/// 待機の抽象。
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// `tokio::time::sleep` による実時間の待機。
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("operation cancelled")]
    Cancelled,
    #[error("operation failed after {attempts} attempts: {last}")]
    Exhausted { attempts: usize, last: E },
    #[error("operation aborted: {0}")]
    Aborted(E),
}

/// `op` を最大 `config.max_attempts` 回まで実行する。
///
/// `is_retryable` が `false` を返したエラーは即座に [`RetryError::Aborted`] で返す。
/// `op` には 1 始まりの試行番号が渡される。
///
/// # Errors
/// キャンセル、再試行不能なエラー、試行回数の上限到達のいずれかで失敗する。
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    config: &RetryConfig,
    sleeper: &dyn Sleeper,
    cancel: &CancellationToken,
    mut op: F,
    is_retryable: R,
) -> Result<T, RetryError<E>>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        attempt += 1;

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(RetryError::Cancelled),
            outcome = op(attempt) => outcome,
        };

        let error = match outcome {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if !is_retryable(&error) {
            return Err(RetryError::Aborted(error));
        }
        if !config.can_retry(attempt) {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: error,
            });
        }

        let delay = config.delay_for_attempt(attempt);
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        debug!(attempt, delay_ms = delay.as_millis(), "retrying after backoff");
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(RetryError::Cancelled),
            () = sleeper.sleep(delay) => {}
        }
    }
}

#[cfg(any(test, feature = "test-support"))]
#[allow(clippy::missing_panics_doc)]
pub mod testing {
    use std::sync::Mutex;

    use super::*;

    /// 待機せずに要求された遅延を記録する。
    #[derive(Debug, Default)]
    pub struct RecordingSleeper {
        delays: Mutex<Vec<Duration>>,
    }

    impl RecordingSleeper {
        #[must_use]
        pub fn delays(&self) -> Vec<Duration> {
            self.delays.lock().expect("sleeper mutex").clone()
        }
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.delays.lock().expect("sleeper mutex").push(duration);
        }
    }
}
