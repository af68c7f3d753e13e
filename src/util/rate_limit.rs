//! 外部サービスのレート制限状態（プロセス全体で共有）。
use std::sync::atomic::{AtomicBool, Ordering};

/// 一度立つとプロセス終了まで戻らないレート制限フラグと、診断用の利用フラグ。
///
/// 意味論・検索の両アダプタが同じインスタンスを `Arc` で共有する。
#[derive(Debug, Default)]
pub struct RateLimitState {
    rate_limited: AtomicBool,
    api_used: AtomicBool,
}

impl RateLimitState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// 外部呼び出し前に必ず確認する。
    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        self.rate_limited.load(Ordering::Acquire)
    }

    /// 403/429 を観測したときに呼ぶ。今回の呼び出しで初めて立った場合は `true`。
    pub fn trip(&self) -> bool {
        !self.rate_limited.swap(true, Ordering::AcqRel)
    }

    /// 試行ごとに結果にかかわらず呼ぶ。制御には使わない。
    pub fn mark_used(&self) {
        self.api_used.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn api_used(&self) -> bool {
        self.api_used.load(Ordering::Relaxed)
    }
}
