use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;

use crate::{
    api,
    clients::{CompletionBackend, GoogleSearchClient, OpenAiClient, SearchBackend},
    config::Config,
    observability::{Telemetry, metrics::Metrics},
    pipeline::{
        ClassificationPipeline, NarrativeClassifier, PipelineBuilder, PipelineOptions, RuleMatcher,
        SearchClassifier, SearchSettings, SemanticClassifier, SemanticSettings, WeightedScorer,
    },
    tables::TableSet,
    util::{
        rate_limit::RateLimitState,
        retry::{Sleeper, TokioSleeper},
    },
};

#[derive(Clone)]
pub(crate) struct AppState {
    registry: Arc<ComponentRegistry>,
}

pub struct ComponentRegistry {
    config: Arc<Config>,
    telemetry: Telemetry,
    pipeline: Arc<ClassificationPipeline>,
}

/// 外部サービスの実装。認証情報がなければ `None`。
pub struct Backends {
    pub completion: Option<Arc<dyn CompletionBackend>>,
    pub search: Option<Arc<dyn SearchBackend>>,
    pub sleeper: Arc<dyn Sleeper>,
}

impl Backends {
    /// 設定された認証情報から HTTP クライアントを構築する。
    ///
    /// # Errors
    /// クライアントの構築に失敗した場合はエラーを返す。
    pub fn from_config(config: &Config) -> Result<Self> {
        let completion = config
            .openai_api_key()
            .map(|api_key| {
                OpenAiClient::new(
                    api_key,
                    config.openai_base_url(),
                    config.external_call_timeout(),
                )
                .map(|client| Arc::new(client) as Arc<dyn CompletionBackend>)
            })
            .transpose()
            .context("failed to build semantic service client")?;

        let search = config
            .search_credentials()
            .map(|(api_key, engine_id)| {
                GoogleSearchClient::new(
                    config.google_search_endpoint(),
                    api_key,
                    engine_id,
                    config.external_call_timeout(),
                )
                .map(|client| Arc::new(client) as Arc<dyn SearchBackend>)
            })
            .transpose()
            .context("failed to build search client")?;

        Ok(Self {
            completion,
            search,
            sleeper: Arc::new(TokioSleeper),
        })
    }
}

impl AppState {
    pub(crate) fn new(registry: ComponentRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub(crate) fn telemetry(&self) -> &Telemetry {
        &self.registry.telemetry
    }

    pub(crate) fn config(&self) -> &Config {
        &self.registry.config
    }

    pub(crate) fn pipeline(&self) -> &ClassificationPipeline {
        &self.registry.pipeline
    }
}

impl ComponentRegistry {
    /// 構成情報と依存をまとめて初期化し、アプリケーションの共有レジストリを構築する。
    ///
    /// # Errors
    /// Telemetry の初期化、分類表の読み込み、HTTP クライアント構築が失敗した場合はエラーを返す。
    pub fn build(config: Config) -> Result<Self> {
        let telemetry = Telemetry::new()?;
        let backends = Backends::from_config(&config)?;
        Self::assemble(config, telemetry, backends)
    }

    /// 与えられた外部サービス実装でレジストリを組み立てる。
    ///
    /// # Errors
    /// 分類表の読み込みや検証に失敗した場合はエラーを返す。
    pub fn assemble(config: Config, telemetry: Telemetry, backends: Backends) -> Result<Self> {
        let pipeline = build_pipeline(&config, backends, telemetry.metrics())?;

        Ok(Self {
            config: Arc::new(config),
            telemetry,
            pipeline: Arc::new(pipeline),
        })
    }

    #[must_use]
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    #[must_use]
    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    #[must_use]
    pub fn pipeline(&self) -> Arc<ClassificationPipeline> {
        Arc::clone(&self.pipeline)
    }
}

/// 分類表を読み込み、全段を共有のレート制限状態で結線する。
///
/// # Errors
/// 分類表の読み込み、ラベル検証、正規表現のコンパイルに失敗した場合はエラーを返す。
pub fn build_pipeline(
    config: &Config,
    backends: Backends,
    metrics: Arc<Metrics>,
) -> Result<ClassificationPipeline> {
    let tables =
        TableSet::load(config.tables_path()).context("failed to load classifier tables")?;
    let taxonomy = Arc::new(
        tables
            .industry_taxonomy()
            .context("failed to build industry taxonomy")?,
    );
    let narrative_taxonomy = Arc::new(
        tables
            .narrative_taxonomy()
            .context("failed to build narrative taxonomy")?,
    );
    let rate_limit = Arc::new(RateLimitState::new());
    let retry = config.retry();
    let timeout = config.external_call_timeout();

    let semantic = backends.completion.map(|backend| {
        Arc::new(
            SemanticClassifier::new(
                backend,
                Arc::clone(&rate_limit),
                Arc::clone(&taxonomy),
                SemanticSettings {
                    model: config.semantic_model().to_string(),
                    timeout,
                    retry,
                },
            )
            .with_sleeper(Arc::clone(&backends.sleeper))
            .with_metrics(Arc::clone(&metrics)),
        )
    });

    let scorer = || {
        WeightedScorer::from_tables("scoring", &tables.scoring, taxonomy.fallback())
            .context("failed to compile scoring table")
    };
    let search = SearchClassifier::new(
        backends.search,
        Arc::clone(&rate_limit),
        scorer()?,
        &tables.search,
        SearchSettings {
            limit: config.search_result_limit().get(),
            timeout,
            retry,
        },
    )
    .context("failed to compile search tables")?
    .with_sleeper(Arc::clone(&backends.sleeper))
    .with_metrics(Arc::clone(&metrics));

    let narrative = NarrativeClassifier::new(
        &tables.narrative,
        narrative_taxonomy,
        semantic.clone(),
        config.narrative_model(),
        config.arbitration(),
    )
    .context("failed to compile narrative tables")?;

    let rules = RuleMatcher::from_tables(Arc::clone(&taxonomy), &tables.rules)
        .context("failed to compile rule tables")?;

    let mut builder = PipelineBuilder::new(Arc::clone(&taxonomy), rules, scorer()?)
        .search(search)
        .narrative(narrative)
        .rate_limit(rate_limit)
        .options(PipelineOptions {
            semantic_enabled: config.semantic_enabled(),
            search_enabled: config.search_enabled(),
            scorer_min_score: config.scorer_min_score(),
        })
        .metrics(metrics);
    if let Some(semantic) = semantic {
        builder = builder.semantic(semantic);
    }

    tracing::info!(
        version = taxonomy.version(),
        labels = taxonomy.len(),
        "classification pipeline ready"
    );
    Ok(builder.build())
}

pub fn build_router(registry: ComponentRegistry) -> Router {
    let state = AppState::new(registry);
    api::router(state)
}
