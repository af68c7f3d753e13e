//! 外部意味分類サービスのアダプター。
//!
//! 呼び出しは共有の [`RateLimitState`] を毎試行前に確認し、403/429 を受けたら状態を立てて
//! 以降の外部呼び出しをすべて止める。それ以外の失敗は指数バックオフで再試行する。
use std::{fmt::Write as _, sync::Arc, time::Duration};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    clients::{BackendError, CompletionBackend, CompletionRequest},
    evidence::Evidence,
    observability::metrics::Metrics,
    taxonomy::Taxonomy,
    util::{
        rate_limit::RateLimitState,
        retry::{RetryConfig, RetryError, Sleeper, TokioSleeper},
        text::truncate_chars,
    },
};

use super::external::{AttemptError, ExternalCall};

const SERVICE: &str = "semantic";
const CONTENT_PREVIEW_CHARS: usize = 2000;
const LABEL_MAX_TOKENS: u32 = 50;
const LABEL_TEMPERATURE: f32 = 0.3;

#[derive(Debug, Error)]
pub enum SemanticError {
    #[error("semantic service is rate limited")]
    RateLimited,
    #[error("semantic service failed after {attempts} attempts: {source}")]
    Transient {
        attempts: usize,
        #[source]
        source: BackendError,
    },
    #[error("semantic service returned a label outside the taxonomy: {0:?}")]
    Invalid(String),
    #[error("semantic call cancelled")]
    Cancelled,
}

impl SemanticError {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::Transient { .. } => "transient",
            Self::Invalid(_) => "invalid",
            Self::Cancelled => "cancelled",
        }
    }
}

/// 意味分類の呼び出し設定。
#[derive(Debug, Clone, PartialEq)]
pub struct SemanticSettings {
    pub model: String,
    pub timeout: Duration,
    pub retry: RetryConfig,
}

/// 企業分類のプロンプトに載せる証拠。`business_type` は読み替え済みの値を使う。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PromptContext<'a> {
    pub company_name: Option<&'a str>,
    pub profile: Option<&'a str>,
    pub business_type: Option<&'a str>,
    pub business_field: Option<&'a str>,
    pub content: Option<&'a str>,
}

impl<'a> PromptContext<'a> {
    #[must_use]
    pub fn from_evidence(evidence: &'a Evidence) -> Self {
        Self {
            company_name: evidence.company_name(),
            profile: evidence.profile_text(),
            business_type: evidence.business_type(),
            business_field: evidence.business_field(),
            content: evidence.full_content(),
        }
    }

    /// 問い合わせる主題（企業名かプロフィール）があるか。
    #[must_use]
    pub fn has_subject(&self) -> bool {
        self.company_name.is_some() || self.profile.is_some()
    }

    fn render(&self) -> String {
        let mut prompt = String::from("以下の企業情報から業種を判定してください。\n");
        let fields = [
            ("企業名", self.company_name),
            ("顧客プロフィール", self.profile),
            ("業種", self.business_type),
            ("業務分野", self.business_field),
        ];
        for (name, value) in fields {
            if let Some(value) = value {
                let _ = writeln!(prompt, "{name}: {value}");
            }
        }
        if let Some(content) = self.content {
            prompt.push_str("\nページ内容:\n");
            prompt.push_str(truncate_chars(content, CONTENT_PREVIEW_CHARS));
            prompt.push('\n');
        }
        prompt
    }
}

pub struct SemanticClassifier {
    backend: Arc<dyn CompletionBackend>,
    rate_limit: Arc<RateLimitState>,
    taxonomy: Arc<Taxonomy>,
    settings: SemanticSettings,
    sleeper: Arc<dyn Sleeper>,
    metrics: Option<Arc<Metrics>>,
}

impl SemanticClassifier {
    #[must_use]
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        rate_limit: Arc<RateLimitState>,
        taxonomy: Arc<Taxonomy>,
        settings: SemanticSettings,
    ) -> Self {
        Self {
            backend,
            rate_limit,
            taxonomy,
            settings,
            sleeper: Arc::new(TokioSleeper),
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// 企業証拠から業種ラベルを 1 つ問い合わせる。
    ///
    /// # Errors
    /// レート制限中、再試行の上限到達、キャンセル、タクソノミー外の応答のいずれかで失敗する。
    pub async fn classify(
        &self,
        context: &PromptContext<'_>,
        cancel: &CancellationToken,
    ) -> Result<String, SemanticError> {
        let request = CompletionRequest {
            model: self.settings.model.clone(),
            system: self.system_prompt(),
            user: context.render(),
            max_tokens: LABEL_MAX_TOKENS,
            temperature: LABEL_TEMPERATURE,
        };

        let raw = self.ask(&request, cancel).await?;
        self.parse_label(&raw)
    }

    /// 任意の問い合わせを送り、応答本文をそのまま返す。
    ///
    /// # Errors
    /// レート制限中、再試行の上限到達、キャンセルのいずれかで失敗する。
    pub async fn ask(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<String, SemanticError> {
        if self.rate_limit.is_rate_limited() {
            return Err(SemanticError::RateLimited);
        }

        let call = ExternalCall {
            service: SERVICE,
            rate_limit: &self.rate_limit,
            metrics: self.metrics.as_deref(),
            timeout: self.settings.timeout,
            retry: &self.settings.retry,
            sleeper: self.sleeper.as_ref(),
        };
        let outcome = call.run(cancel, || self.backend.complete(request)).await;

        match outcome {
            Ok(content) => Ok(content),
            Err(RetryError::Cancelled) => Err(SemanticError::Cancelled),
            Err(RetryError::Exhausted {
                attempts,
                last: AttemptError::Backend(source),
            }) => Err(SemanticError::Transient { attempts, source }),
            Err(RetryError::Aborted(_) | RetryError::Exhausted { .. }) => {
                Err(SemanticError::RateLimited)
            }
        }
    }

    fn system_prompt(&self) -> String {
        format!(
            "あなたは企業の業種を分類する専門家です。次の業種リストから最も適切なものを 1 つだけ選び、\
             業種名のみを回答してください。どれにも当てはまらない場合は「{}」と回答してください。\n\n{}",
            self.taxonomy.fallback_alias(),
            self.taxonomy.prompt_listing(None)
        )
    }

    fn parse_label(&self, raw: &str) -> Result<String, SemanticError> {
        let candidate = raw
            .lines()
            .map(|line| line.trim().trim_start_matches(['-', '*', '・']).trim())
            .find(|line| !line.is_empty())
            .unwrap_or_default();

        if let Some(label) = self.taxonomy.canonicalize(candidate) {
            return Ok(label.to_string());
        }

        if candidate == self.taxonomy.fallback() || candidate == self.taxonomy.fallback_alias() {
            debug!(response = candidate, "semantic service declined to pick a label");
        } else {
            warn!(response = %raw, "semantic service returned a label outside the taxonomy");
        }
        Err(SemanticError::Invalid(raw.to_string()))
    }
}
