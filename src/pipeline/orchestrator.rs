//! エンティティごとの段の順序付けと、失敗を呼び出し元に返さない保証。
use std::{
    sync::{Arc, Once},
    time::Instant,
};

use futures::{StreamExt, stream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    evidence::{ClassificationResult, Evidence, SourceStage},
    observability::metrics::Metrics,
    taxonomy::Taxonomy,
    util::rate_limit::RateLimitState,
};

use super::{
    narrative::{NarrativeClassifier, NarrativePath},
    rules::{RuleMatcher, RuleOutcome},
    scoring::{ScoreReport, WeightedScorer},
    search::SearchClassifier,
    semantic::{PromptContext, SemanticClassifier},
};

static SEMANTIC_MISSING: Once = Once::new();
static SEARCH_MISSING: Once = Once::new();

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineOptions {
    pub semantic_enabled: bool,
    pub search_enabled: bool,
    /// 採点段で確定させる最低スコア
    pub scorer_min_score: f64,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            semantic_enabled: true,
            search_enabled: true,
            scorer_min_score: 1.0,
        }
    }
}

pub struct PipelineBuilder {
    taxonomy: Arc<Taxonomy>,
    rules: RuleMatcher,
    scorer: WeightedScorer,
    semantic: Option<Arc<SemanticClassifier>>,
    search: Option<SearchClassifier>,
    narrative: Option<NarrativeClassifier>,
    rate_limit: Arc<RateLimitState>,
    options: PipelineOptions,
    metrics: Option<Arc<Metrics>>,
}

impl PipelineBuilder {
    #[must_use]
    pub fn new(taxonomy: Arc<Taxonomy>, rules: RuleMatcher, scorer: WeightedScorer) -> Self {
        Self {
            taxonomy,
            rules,
            scorer,
            semantic: None,
            search: None,
            narrative: None,
            rate_limit: Arc::new(RateLimitState::new()),
            options: PipelineOptions::default(),
            metrics: None,
        }
    }

    #[must_use]
    pub fn semantic(mut self, semantic: Arc<SemanticClassifier>) -> Self {
        self.semantic = Some(semantic);
        self
    }

    #[must_use]
    pub fn search(mut self, search: SearchClassifier) -> Self {
        self.search = Some(search);
        self
    }

    #[must_use]
    pub fn narrative(mut self, narrative: NarrativeClassifier) -> Self {
        self.narrative = Some(narrative);
        self
    }

    /// 外部段と共有しているレート制限状態。準備状態の報告に使う。
    #[must_use]
    pub fn rate_limit(mut self, rate_limit: Arc<RateLimitState>) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    #[must_use]
    pub fn options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn build(self) -> ClassificationPipeline {
        if self.semantic.is_none() {
            SEMANTIC_MISSING.call_once(|| {
                warn!(
                    stage = SourceStage::Semantic.as_str(),
                    "semantic service credentials missing, running without the semantic stage"
                );
            });
        }
        if !self.search.as_ref().is_some_and(SearchClassifier::is_configured) {
            SEARCH_MISSING.call_once(|| {
                warn!(
                    stage = SourceStage::SearchFallback.as_str(),
                    "search credentials missing, search fallback uses the override table only"
                );
            });
        }

        ClassificationPipeline {
            taxonomy: self.taxonomy,
            rules: self.rules,
            scorer: self.scorer,
            semantic: self.semantic,
            search: self.search,
            narrative: self.narrative,
            rate_limit: self.rate_limit,
            options: self.options,
            metrics: self.metrics,
        }
    }
}

/// ルール → 採点 → 外部段 の順にエンティティを分類する。
pub struct ClassificationPipeline {
    taxonomy: Arc<Taxonomy>,
    rules: RuleMatcher,
    scorer: WeightedScorer,
    semantic: Option<Arc<SemanticClassifier>>,
    search: Option<SearchClassifier>,
    narrative: Option<NarrativeClassifier>,
    rate_limit: Arc<RateLimitState>,
    options: PipelineOptions,
    metrics: Option<Arc<Metrics>>,
}

impl ClassificationPipeline {
    #[must_use]
    pub fn taxonomy(&self) -> &Taxonomy {
        &self.taxonomy
    }

    #[must_use]
    pub fn rate_limit(&self) -> &RateLimitState {
        &self.rate_limit
    }

    #[must_use]
    pub fn semantic_configured(&self) -> bool {
        self.semantic.is_some()
    }

    #[must_use]
    pub fn search_configured(&self) -> bool {
        self.search.as_ref().is_some_and(SearchClassifier::is_configured)
    }

    /// 1 エンティティを分類する。常に有効なラベルを返す。
    pub async fn classify(
        &self,
        evidence: &Evidence,
        cancel: &CancellationToken,
    ) -> ClassificationResult {
        let started = Instant::now();

        let result = match &self.narrative {
            Some(narrative) if evidence.is_article() => {
                let result = self.classify_article(narrative, evidence, cancel).await;
                enforce_taxonomy(narrative.taxonomy(), evidence, result)
            }
            _ => {
                let result = self.classify_company(evidence, cancel).await;
                enforce_taxonomy(&self.taxonomy, evidence, result)
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_classification(result.source_stage.as_str());
            metrics
                .classification_duration
                .observe(started.elapsed().as_secs_f64());
        }
        debug!(
            entity = evidence.entity(),
            label = %result.label,
            stage = result.source_stage.as_str(),
            confidence = ?result.confidence,
            "classified"
        );
        result
    }

    /// 入力順を保ったまま、最大 `concurrency` 件ずつ並行に分類する。
    pub async fn classify_batch(
        &self,
        entities: &[Evidence],
        concurrency: usize,
        cancel: &CancellationToken,
    ) -> Vec<ClassificationResult> {
        if let Some(metrics) = &self.metrics {
            metrics.batches_total.inc();
        }
        let pending: Vec<_> = entities
            .iter()
            .map(|evidence| self.classify(evidence, cancel))
            .collect();
        stream::iter(pending)
            .buffered(concurrency.max(1))
            .collect()
            .await
    }

    async fn classify_company(
        &self,
        evidence: &Evidence,
        cancel: &CancellationToken,
    ) -> ClassificationResult {
        let evidence = evidence.with_remapped_business_type(&self.taxonomy);

        if let RuleOutcome::Matched { category, .. } = self.rules.match_evidence(&evidence) {
            return ClassificationResult::new(category, SourceStage::Rule);
        }

        let report = self
            .scorer
            .classify(evidence.company_name(), &evidence.scoring_corpus());
        if report.is_resolved(self.options.scorer_min_score) {
            return ClassificationResult::new(report.label, SourceStage::Scorer);
        }

        let mut last_stage = SourceStage::Scorer;

        if let Some(semantic) = self.semantic.as_ref().filter(|_| self.options.semantic_enabled) {
            let context = PromptContext::from_evidence(&evidence);
            if context.has_subject() && !cancel.is_cancelled() {
                last_stage = SourceStage::Semantic;
                match semantic.classify(&context, cancel).await {
                    Ok(label) => return ClassificationResult::new(label, SourceStage::Semantic),
                    Err(error) => self.record_degradation(&evidence, last_stage, &error),
                }
            }
        }

        let search = self
            .search
            .as_ref()
            .filter(|_| self.options.search_enabled && !cancel.is_cancelled());
        if let Some(search) = search {
            last_stage = SourceStage::SearchFallback;
            let label = search
                .classify_via_search(evidence.company_name(), evidence.full_content(), cancel)
                .await;
            if label != self.taxonomy.fallback() {
                return ClassificationResult::new(label, SourceStage::SearchFallback);
            }
        }

        self.local_fallback(report, last_stage)
    }

    async fn classify_article(
        &self,
        narrative: &NarrativeClassifier,
        evidence: &Evidence,
        cancel: &CancellationToken,
    ) -> ClassificationResult {
        let decision = narrative.classify(evidence, cancel).await;
        let degraded = decision.path == NarrativePath::Degraded;
        if let Some(metrics) = self.metrics.as_ref().filter(|_| degraded) {
            metrics.record_degradation(SourceStage::Narrative.as_str());
        }

        let result = ClassificationResult::new(decision.label, SourceStage::Narrative);
        match decision.confidence {
            Some(confidence) => result.with_confidence(confidence),
            None => result,
        }
    }

    /// 弱い採点結果があればそれを、なければフォールバックラベルを返す。
    fn local_fallback(&self, report: ScoreReport, last_stage: SourceStage) -> ClassificationResult {
        if report.scores.is_empty() {
            ClassificationResult::new(self.taxonomy.fallback(), last_stage)
        } else {
            ClassificationResult::new(report.label, SourceStage::Scorer)
        }
    }

    fn record_degradation(
        &self,
        evidence: &Evidence,
        stage: SourceStage,
        error: &dyn std::error::Error,
    ) {
        warn!(
            entity = evidence.entity(),
            stage = stage.as_str(),
            error = %error,
            "stage failed, falling back"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_degradation(stage.as_str());
        }
    }
}

/// タクソノミー外のラベルはフォールバックに置き換える。
fn enforce_taxonomy(
    taxonomy: &Taxonomy,
    evidence: &Evidence,
    result: ClassificationResult,
) -> ClassificationResult {
    if taxonomy.is_valid_result(&result.label) {
        return result;
    }
    warn!(
        entity = evidence.entity(),
        label = %result.label,
        stage = result.source_stage.as_str(),
        "label outside taxonomy, using fallback"
    );
    ClassificationResult {
        label: taxonomy.fallback().to_string(),
        ..result
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        clients::{BackendError, testing::{ScriptedCompletion, ScriptedSearch}},
        pipeline::{
            arbitration::ArbitrationConfig,
            search::SearchSettings,
            semantic::SemanticSettings,
        },
        tables::TableSet,
        util::retry::{RetryConfig, testing::RecordingSleeper},
    };

    #[derive(Default)]
    struct Fakes {
        completion: Option<Arc<ScriptedCompletion>>,
        search: Option<Arc<ScriptedSearch>>,
        options: PipelineOptions,
    }

    fn pipeline(fakes: Fakes) -> (ClassificationPipeline, Arc<RateLimitState>) {
        let tables = TableSet::embedded().expect("embedded tables");
        let taxonomy = Arc::new(tables.industry_taxonomy().expect("taxonomy"));
        let rate_limit = Arc::new(RateLimitState::new());
        let sleeper = Arc::new(RecordingSleeper::default());
        let retry = RetryConfig::default();
        let scorer = || {
            WeightedScorer::from_tables("scoring", &tables.scoring, taxonomy.fallback())
                .expect("scorer")
        };

        let semantic = fakes.completion.map(|backend| {
            Arc::new(
                SemanticClassifier::new(
                    backend,
                    Arc::clone(&rate_limit),
                    Arc::clone(&taxonomy),
                    SemanticSettings {
                        model: "gpt-4o-mini".to_string(),
                        timeout: Duration::from_secs(20),
                        retry,
                    },
                )
                .with_sleeper(sleeper.clone()),
            )
        });
        let search = SearchClassifier::new(
            fakes
                .search
                .map(|backend| backend as Arc<dyn crate::clients::SearchBackend>),
            Arc::clone(&rate_limit),
            scorer(),
            &tables.search,
            SearchSettings {
                limit: 5,
                timeout: Duration::from_secs(20),
                retry,
            },
        )
        .expect("search")
        .with_sleeper(sleeper);
        let narrative = NarrativeClassifier::new(
            &tables.narrative,
            Arc::new(tables.narrative_taxonomy().expect("narrative taxonomy")),
            semantic.clone(),
            "gpt-4o",
            ArbitrationConfig::default(),
        )
        .expect("narrative");

        let rules = RuleMatcher::from_tables(Arc::clone(&taxonomy), &tables.rules).expect("rules");
        let mut builder = PipelineBuilder::new(Arc::clone(&taxonomy), rules, scorer())
            .search(search)
            .narrative(narrative)
            .rate_limit(Arc::clone(&rate_limit))
            .options(fakes.options);
        if let Some(semantic) = semantic {
            builder = builder.semantic(semantic);
        }
        (builder.build(), rate_limit)
    }

    fn company(name: &str) -> Evidence {
        Evidence {
            company_name: Some(name.to_string()),
            ..Evidence::default()
        }
    }

    #[tokio::test]
    async fn explicit_company_keyword_wins_over_external_stages() {
        let completion = Arc::new(ScriptedCompletion::always(Ok("Insurance".to_string())));
        let (pipeline, _) = pipeline(Fakes {
            completion: Some(completion.clone()),
            ..Fakes::default()
        });

        let result = pipeline
            .classify(&company("○○銀行"), &CancellationToken::new())
            .await;

        assert_eq!(result.label, "Banking/Securities");
        assert_eq!(result.source_stage, SourceStage::Rule);
        assert_eq!(result.confidence, None);
        assert_eq!(completion.calls(), 0);
    }

    #[tokio::test]
    async fn scorer_resolves_content_keywords() {
        let (pipeline, _) = pipeline(Fakes::default());
        let evidence = Evidence {
            company_name: Some("アクメ".to_string()),
            full_content: Some("自動車部品の製造".to_string()),
            ..Evidence::default()
        };

        let result = pipeline.classify(&evidence, &CancellationToken::new()).await;

        assert_eq!(result.label, "Automotive");
        assert_eq!(result.source_stage, SourceStage::Scorer);
    }

    #[tokio::test]
    async fn legacy_business_type_is_remapped_before_rules() {
        let (pipeline, _) = pipeline(Fakes::default());
        let evidence = Evidence {
            business_type: Some("金融機関（地方銀行）".to_string()),
            ..Evidence::default()
        };

        let result = pipeline.classify(&evidence, &CancellationToken::new()).await;

        assert_eq!(result.label, "Banking/Securities");
        assert_eq!(result.source_stage, SourceStage::Rule);
    }

    #[tokio::test]
    async fn semantic_answers_unresolved_company() {
        let completion = Arc::new(ScriptedCompletion::always(Ok("人材サービス".to_string())));
        let (pipeline, _) = pipeline(Fakes {
            completion: Some(completion.clone()),
            ..Fakes::default()
        });

        let result = pipeline
            .classify(&company("アクメ"), &CancellationToken::new())
            .await;

        assert_eq!(result.label, "Human Resources Services");
        assert_eq!(result.source_stage, SourceStage::Semantic);
        assert_eq!(completion.calls(), 1);
    }

    #[tokio::test]
    async fn invalid_semantic_label_falls_through_to_search() {
        let completion = Arc::new(ScriptedCompletion::always(Ok("宇宙開発".to_string())));
        let search = Arc::new(ScriptedSearch::hits(&["アクメは損害保険会社です"]));
        let (pipeline, _) = pipeline(Fakes {
            completion: Some(completion),
            search: Some(search.clone()),
            ..Fakes::default()
        });

        let result = pipeline
            .classify(&company("アクメ"), &CancellationToken::new())
            .await;

        assert_eq!(result.label, "Insurance");
        assert_eq!(result.source_stage, SourceStage::SearchFallback);
        assert_eq!(search.calls(), 1);
    }

    #[tokio::test]
    async fn rate_limit_stops_all_later_network_calls() {
        let completion = Arc::new(ScriptedCompletion::always(Err(BackendError::Status {
            status: 403,
            body: "quota".to_string(),
        })));
        let search = Arc::new(ScriptedSearch::hits(&["自動車"]));
        let (pipeline, rate_limit) = pipeline(Fakes {
            completion: Some(completion.clone()),
            search: Some(search.clone()),
            ..Fakes::default()
        });
        let cancel = CancellationToken::new();

        let first = pipeline.classify(&company("アクメ"), &cancel).await;
        assert!(rate_limit.is_rate_limited());
        assert_eq!(first.label, "Other");
        assert_eq!(completion.calls(), 1);

        let second = pipeline.classify(&company("ベータ"), &cancel).await;
        assert_eq!(second.label, "Other");
        assert_eq!(completion.calls(), 1);
        assert_eq!(search.calls(), 0);
    }

    #[tokio::test]
    async fn disabled_semantic_stage_is_skipped() {
        let completion = Arc::new(ScriptedCompletion::always(Ok("Insurance".to_string())));
        let (pipeline, _) = pipeline(Fakes {
            completion: Some(completion.clone()),
            options: PipelineOptions {
                semantic_enabled: false,
                ..PipelineOptions::default()
            },
            ..Fakes::default()
        });

        let result = pipeline
            .classify(&company("アクメ"), &CancellationToken::new())
            .await;

        assert_eq!(result.label, "Other");
        assert_eq!(completion.calls(), 0);
    }

    #[tokio::test]
    async fn missing_credentials_degrade_to_local_stages() {
        let (pipeline, _) = pipeline(Fakes::default());
        assert!(!pipeline.semantic_configured());
        assert!(!pipeline.search_configured());

        let result = pipeline
            .classify(&company("アクメ"), &CancellationToken::new())
            .await;
        assert_eq!(result.label, "Other");

        let result = pipeline
            .classify(&company("日本電気株式会社"), &CancellationToken::new())
            .await;
        assert_eq!(result.label, "Technology");
    }

    #[tokio::test]
    async fn cancelled_request_returns_local_label() {
        let completion = Arc::new(ScriptedCompletion::always(Ok("Insurance".to_string())));
        let (pipeline, _) = pipeline(Fakes {
            completion: Some(completion.clone()),
            ..Fakes::default()
        });
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = pipeline.classify(&company("アクメ"), &cancel).await;

        assert_eq!(result.label, "Other");
        assert_eq!(result.source_stage, SourceStage::Scorer);
        assert_eq!(completion.calls(), 0);
    }

    #[tokio::test]
    async fn classification_is_idempotent() {
        let completion = Arc::new(ScriptedCompletion::always(Ok("Insurance".to_string())));
        let (pipeline, _) = pipeline(Fakes {
            completion: Some(completion),
            ..Fakes::default()
        });
        let evidence = Evidence {
            company_name: Some("アクメ".to_string()),
            profile_text: Some("地域の保険代理店".to_string()),
            ..Evidence::default()
        };
        let cancel = CancellationToken::new();

        let first = pipeline.classify(&evidence, &cancel).await;
        let second = pipeline.classify(&evidence, &cancel).await;

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn articles_use_the_narrative_classifier() {
        let (pipeline, _) = pipeline(Fakes::default());
        let evidence = Evidence {
            article_title: Some("AI市場の動向調査".to_string()),
            ..Evidence::default()
        };

        let result = pipeline.classify(&evidence, &CancellationToken::new()).await;

        assert_eq!(result.label, "Market/Business Trends");
        assert_eq!(result.source_stage, SourceStage::Narrative);
    }

    #[tokio::test]
    async fn batch_preserves_input_order() {
        let (pipeline, _) = pipeline(Fakes::default());
        let entities = vec![
            company("○○銀行"),
            company("アクメ"),
            company("横浜市"),
            company("日本電気"),
        ];

        let results = pipeline
            .classify_batch(&entities, 2, &CancellationToken::new())
            .await;

        let labels: Vec<_> = results.iter().map(|result| result.label.as_str()).collect();
        assert_eq!(
            labels,
            [
                "Banking/Securities",
                "Other",
                "Government/Public Sector",
                "Technology"
            ]
        );
    }

    #[test]
    fn labels_outside_taxonomy_fall_back() {
        let tables = TableSet::embedded().expect("embedded tables");
        let taxonomy = tables.industry_taxonomy().expect("taxonomy");
        let evidence = company("アクメ");

        let kept = enforce_taxonomy(
            &taxonomy,
            &evidence,
            ClassificationResult::new("Insurance", SourceStage::Semantic),
        );
        let replaced = enforce_taxonomy(
            &taxonomy,
            &evidence,
            ClassificationResult::new("Space Exploration", SourceStage::Semantic)
                .with_confidence(90.0),
        );

        assert_eq!(kept.label, "Insurance");
        assert_eq!(replaced.label, "Other");
        assert_eq!(replaced.source_stage, SourceStage::Semantic);
        assert_eq!(replaced.confidence, Some(90.0));
    }
}
