//! 検索結果のスニペットを採点する二次分類。
//!
//! どの失敗もフォールバックラベルに落とし、呼び出し元にはエラーを返さない。
use std::{sync::Arc, time::Duration};

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    clients::{SearchBackend, SearchHit, SearchQuery},
    observability::metrics::Metrics,
    tables::{SearchTables, TablesError},
    util::{
        rate_limit::RateLimitState,
        retry::{RetryConfig, RetryError, Sleeper, TokioSleeper},
        text::contains_any,
    },
};

use super::{
    external::{AttemptError, ExternalCall},
    scoring::WeightedScorer,
};

const SERVICE: &str = "search";
const STAGE: &str = "search_fallback";
const MIN_COMPANY_CHARS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchSettings {
    pub limit: usize,
    pub timeout: Duration,
    pub retry: RetryConfig,
}

/// 本文から企業名を抜き出す。
#[derive(Debug, Clone)]
struct CompanyExtractor {
    patterns: Vec<Regex>,
    exclude: Vec<String>,
}

impl CompanyExtractor {
    fn extract(&self, text: &str) -> Option<String> {
        self.patterns.iter().find_map(|pattern| {
            pattern
                .captures_iter(text)
                .filter_map(|captures| captures.get(1))
                .map(|found| found.as_str().trim())
                .find(|candidate| {
                    candidate.chars().count() >= MIN_COMPANY_CHARS
                        && !contains_any(candidate, &self.exclude)
                })
                .map(ToString::to_string)
        })
    }
}

pub struct SearchClassifier {
    backend: Option<Arc<dyn SearchBackend>>,
    rate_limit: Arc<RateLimitState>,
    scorer: WeightedScorer,
    extractor: CompanyExtractor,
    query_suffix: String,
    language: String,
    country: String,
    settings: SearchSettings,
    sleeper: Arc<dyn Sleeper>,
    metrics: Option<Arc<Metrics>>,
}

impl SearchClassifier {
    /// # Errors
    /// 企業名抽出パターンのコンパイルに失敗した場合はエラーを返す。
    pub fn new(
        backend: Option<Arc<dyn SearchBackend>>,
        rate_limit: Arc<RateLimitState>,
        scorer: WeightedScorer,
        tables: &SearchTables,
        settings: SearchSettings,
    ) -> Result<Self, TablesError> {
        let patterns = tables
            .extraction
            .patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| TablesError::Pattern {
                    table: "search.extraction.patterns",
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            backend,
            rate_limit,
            scorer,
            extractor: CompanyExtractor {
                patterns,
                exclude: tables.extraction.exclude.clone(),
            },
            query_suffix: tables.query_suffix.clone(),
            language: tables.language.clone(),
            country: tables.country.clone(),
            settings,
            sleeper: Arc::new(TokioSleeper),
            metrics: None,
        })
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

    /// 検索バックエンドが構成されているか。
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.backend.is_some()
    }

    /// 本文から企業名を抽出する。
    #[must_use]
    pub fn extract_company(&self, content: &str) -> Option<String> {
        self.extractor.extract(content)
    }

    /// 企業名（なければ本文から抽出した名前）で検索し、スニペットを採点したラベルを返す。
    pub async fn classify_via_search(
        &self,
        company: Option<&str>,
        content_hint: Option<&str>,
        cancel: &CancellationToken,
    ) -> String {
        let fallback = self.scorer.table().fallback().to_string();

        let Some(company) = company
            .map(ToString::to_string)
            .or_else(|| content_hint.and_then(|content| self.extract_company(content)))
        else {
            debug!(stage = STAGE, "no company name to search for");
            return fallback;
        };

        if let Some(category) = self.scorer.override_for(&company) {
            debug!(entity = %company, category, "search override matched");
            return category.to_string();
        }

        let Some(backend) = &self.backend else {
            debug!(entity = %company, stage = STAGE, "search backend not configured");
            return fallback;
        };
        if self.rate_limit.is_rate_limited() {
            debug!(entity = %company, stage = STAGE, "skipping search, rate limited");
            return fallback;
        }

        let query = SearchQuery {
            text: format!("{company} {}", self.query_suffix),
            limit: self.settings.limit,
            language: self.language.clone(),
            country: self.country.clone(),
        };

        let call = ExternalCall {
            service: SERVICE,
            rate_limit: &self.rate_limit,
            metrics: self.metrics.as_deref(),
            timeout: self.settings.timeout,
            retry: &self.settings.retry,
            sleeper: self.sleeper.as_ref(),
        };
        let outcome = call.run(cancel, || backend.search(&query)).await;

        let hits = match outcome {
            Ok(hits) => hits,
            Err(error) => {
                let detail = match &error {
                    RetryError::Cancelled => "cancelled".to_string(),
                    RetryError::Aborted(AttemptError::CircuitOpen)
                    | RetryError::Exhausted {
                        last: AttemptError::CircuitOpen,
                        ..
                    } => "rate limited".to_string(),
                    RetryError::Aborted(AttemptError::Backend(error))
                    | RetryError::Exhausted {
                        last: AttemptError::Backend(error),
                        ..
                    } => error.to_string(),
                };
                warn!(entity = %company, stage = STAGE, error = %detail, "search failed, using fallback label");
                self.record_degradation();
                return fallback;
            }
        };

        if hits.is_empty() {
            debug!(entity = %company, stage = STAGE, "search returned no results");
            return fallback;
        }

        let corpus = corpus_from_hits(&hits);
        let report = self.scorer.table().score(&corpus);
        debug!(
            entity = %company,
            label = %report.label,
            top_score = report.top_score,
            "search snippets scored"
        );
        report.label
    }

    fn record_degradation(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.record_degradation(STAGE);
        }
    }
}

fn corpus_from_hits(hits: &[SearchHit]) -> String {
    hits.iter()
        .map(|hit| format!("{} {}", hit.title, hit.snippet))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clients::{BackendError, testing::ScriptedSearch},
        tables::TableSet,
        util::retry::testing::RecordingSleeper,
    };

    fn classifier(
        backend: Option<Arc<ScriptedSearch>>,
        rate_limit: Arc<RateLimitState>,
    ) -> SearchClassifier {
        let tables = TableSet::embedded().expect("embedded tables");
        let scorer =
            WeightedScorer::from_tables("scoring", &tables.scoring, "Other").expect("scorer");
        let settings = SearchSettings {
            limit: 5,
            timeout: Duration::from_secs(20),
            retry: RetryConfig::default(),
        };
        SearchClassifier::new(
            backend.map(|backend| backend as Arc<dyn SearchBackend>),
            rate_limit,
            scorer,
            &tables.search,
            settings,
        )
        .expect("search classifier builds")
        .with_sleeper(Arc::new(RecordingSleeper::default()))
    }

    #[tokio::test]
    async fn snippets_are_scored() {
        let backend = Arc::new(ScriptedSearch::hits(&[
            "アクメは自動車部品を製造する自動車メーカーです",
            "会社概要",
        ]));
        let search = classifier(Some(backend.clone()), Arc::new(RateLimitState::new()));

        let label = search
            .classify_via_search(Some("アクメ"), None, &CancellationToken::new())
            .await;

        assert_eq!(label, "Automotive");
        let queries = backend.queries();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].text, "アクメ 業種 業界 セクター 事業内容");
        assert_eq!(queries[0].limit, 5);
        assert_eq!(queries[0].language, "lang_ja");
    }

    #[tokio::test]
    async fn override_skips_the_search() {
        let backend = Arc::new(ScriptedSearch::hits(&["銀行"]));
        let search = classifier(Some(backend.clone()), Arc::new(RateLimitState::new()));

        let label = search
            .classify_via_search(Some("株式会社CTC"), None, &CancellationToken::new())
            .await;

        assert_eq!(label, "Technology");
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn missing_backend_degrades_to_other() {
        let search = classifier(None, Arc::new(RateLimitState::new()));
        let label = search
            .classify_via_search(Some("アクメ"), None, &CancellationToken::new())
            .await;
        assert_eq!(label, "Other");
    }

    #[tokio::test]
    async fn rate_limited_state_skips_network() {
        let backend = Arc::new(ScriptedSearch::hits(&["自動車"]));
        let rate_limit = Arc::new(RateLimitState::new());
        rate_limit.trip();
        let search = classifier(Some(backend.clone()), rate_limit);

        let label = search
            .classify_via_search(Some("アクメ"), None, &CancellationToken::new())
            .await;

        assert_eq!(label, "Other");
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn quota_error_trips_shared_state() {
        let backend = Arc::new(ScriptedSearch::new(Err(BackendError::Status {
            status: 429,
            body: String::new(),
        })));
        let rate_limit = Arc::new(RateLimitState::new());
        let search = classifier(Some(backend.clone()), Arc::clone(&rate_limit));

        let label = search
            .classify_via_search(Some("アクメ"), None, &CancellationToken::new())
            .await;

        assert_eq!(label, "Other");
        assert_eq!(backend.calls(), 1);
        assert!(rate_limit.is_rate_limited());
    }

    #[tokio::test]
    async fn empty_results_degrade_to_other() {
        let backend = Arc::new(ScriptedSearch::hits(&[]));
        let search = classifier(Some(backend.clone()), Arc::new(RateLimitState::new()));

        let label = search
            .classify_via_search(Some("アクメ"), None, &CancellationToken::new())
            .await;

        assert_eq!(label, "Other");
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn company_is_extracted_from_content() {
        let backend = Arc::new(ScriptedSearch::hits(&["損害保険会社"]));
        let search = classifier(Some(backend.clone()), Arc::new(RateLimitState::new()));

        let label = search
            .classify_via_search(
                None,
                Some("導入事例 アクメ損保株式会社 は業務を刷新した"),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(label, "Insurance");
        assert_eq!(backend.queries()[0].text, "アクメ損保 業種 業界 セクター 事業内容");
    }

    #[test]
    fn excluded_and_short_names_are_skipped() {
        let search = classifier(None, Arc::new(RateLimitState::new()));
        assert_eq!(search.extract_company("導入事例 CTC社は 提供した"), None);
        assert_eq!(search.extract_company("A社は 提供した"), None);
        assert_eq!(
            search.extract_company("当社 株式会社アクメ 提供"),
            Some("アクメ".to_string())
        );
    }
}
