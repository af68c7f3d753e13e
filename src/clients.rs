//! 外部サービスとの境界。
//!
//! 分類パイプラインはここで定義したトレイトにのみ依存し、HTTP 実装は差し替え可能。
pub(crate) mod google_search;
pub(crate) mod openai;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use google_search::GoogleSearchClient;
pub use openai::OpenAiClient;

/// 外部呼び出しの生の失敗。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("service responded with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed response: {0}")]
    Decode(String),
}

impl BackendError {
    /// 403 / 429 はレート制限として扱う。
    #[must_use]
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::Status { status: 403 | 429, .. })
    }

    /// メトリクス用の短い種別名。
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status { .. } if self.is_rate_limit() => "rate_limited",
            Self::Status { .. } => "status",
            Self::Transport(_) => "transport",
            Self::Timeout(_) => "timeout",
            Self::Decode(_) => "decode",
        }
    }

    pub(crate) fn from_reqwest(error: &reqwest::Error, timeout: Duration) -> Self {
        if error.is_timeout() {
            Self::Timeout(timeout)
        } else if error.is_decode() {
            Self::Decode(error.to_string())
        } else {
            Self::Transport(error.to_string())
        }
    }
}

/// 意味分類サービスへの 1 回分の問い合わせ。
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// ラベル提案を返す外部サービス。応答本文をそのまま返す。
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, BackendError>;
}

/// 検索結果 1 件分のテキスト。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchHit {
    pub title: String,
    pub snippet: String,
}

/// 検索問い合わせ。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub text: String,
    pub limit: usize,
    pub language: String,
    pub country: String,
}

#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>, BackendError>;
}

/// 呼び出し回数を数える偽の外部サービス。結合テストからは `test-support` で使う。
#[cfg(any(test, feature = "test-support"))]
#[allow(clippy::missing_panics_doc)]
pub mod testing {
    use std::{
        collections::VecDeque,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use super::*;

    /// 応答を順番に返し、使い切ったら最後の応答を繰り返す。
    #[derive(Debug)]
    pub struct ScriptedCompletion {
        responses: Mutex<VecDeque<Result<String, BackendError>>>,
        last: Result<String, BackendError>,
        calls: AtomicUsize,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedCompletion {
        #[must_use]
        pub fn new(responses: Vec<Result<String, BackendError>>) -> Self {
            let last = responses
                .last()
                .cloned()
                .unwrap_or_else(|| Err(BackendError::Transport("no scripted response".into())));
            Self {
                responses: Mutex::new(responses.into()),
                last,
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            }
        }

        #[must_use]
        pub fn always(response: Result<String, BackendError>) -> Self {
            Self::new(vec![response])
        }

        #[must_use]
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        #[must_use]
        pub fn requests(&self) -> Vec<CompletionRequest> {
            self.requests.lock().expect("requests mutex").clone()
        }
    }

    #[async_trait]
    impl CompletionBackend for ScriptedCompletion {
        async fn complete(&self, request: &CompletionRequest) -> Result<String, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests
                .lock()
                .expect("requests mutex")
                .push(request.clone());
            self.responses
                .lock()
                .expect("responses mutex")
                .pop_front()
                .unwrap_or_else(|| self.last.clone())
        }
    }

    #[derive(Debug)]
    pub struct ScriptedSearch {
        response: Result<Vec<SearchHit>, BackendError>,
        calls: AtomicUsize,
        queries: Mutex<Vec<SearchQuery>>,
    }

    impl ScriptedSearch {
        #[must_use]
        pub fn new(response: Result<Vec<SearchHit>, BackendError>) -> Self {
            Self {
                response,
                calls: AtomicUsize::new(0),
                queries: Mutex::new(Vec::new()),
            }
        }

        #[must_use]
        pub fn hits(snippets: &[&str]) -> Self {
            Self::new(Ok(snippets
                .iter()
                .map(|snippet| SearchHit {
                    title: String::new(),
                    snippet: (*snippet).to_string(),
                })
                .collect()))
        }

        #[must_use]
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        #[must_use]
        pub fn queries(&self) -> Vec<SearchQuery> {
            self.queries.lock().expect("queries mutex").clone()
        }
    }

    #[async_trait]
    impl SearchBackend for ScriptedSearch {
        async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.queries
                .lock()
                .expect("queries mutex")
                .push(query.clone());
            self.response.clone()
        }
    }
}
