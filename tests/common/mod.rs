//! 結合テスト共通のヘルパー。フェイクは `test-support` で公開されたものを使う。
#![allow(dead_code)]

use std::sync::Arc;

use sector_classifier::{
    app::{Backends, build_pipeline},
    clients::{BackendError, CompletionBackend, SearchBackend},
    config::Config,
    observability::Telemetry,
    pipeline::ClassificationPipeline,
    util::retry::testing::RecordingSleeper,
};

pub use sector_classifier::clients::testing::{ScriptedCompletion, ScriptedSearch};

pub fn status(status: u16) -> BackendError {
    BackendError::Status {
        status,
        body: "scripted".to_string(),
    }
}

/// 認証情報と表の上書きを消した環境で `overrides` だけを設定して読み込む。
pub fn config(overrides: &[(&str, &str)]) -> Config {
    let mut vars: Vec<(&str, Option<&str>)> = [
        "OPENAI_API_KEY",
        "OPENAI_BASE_URL",
        "GOOGLE_API_KEY",
        "GOOGLE_CSE_ID",
        "GOOGLE_SEARCH_ENDPOINT",
        "CLASSIFIER_TABLES_PATH",
        "SEMANTIC_ENABLED",
        "SEARCH_ENABLED",
    ]
    .into_iter()
    .map(|name| (name, None))
    .collect();
    for (name, value) in overrides {
        match vars.iter_mut().find(|(key, _)| key == name) {
            Some(slot) => slot.1 = Some(*value),
            None => vars.push((*name, Some(*value))),
        }
    }
    temp_env::with_vars(vars, Config::from_env).expect("config loads")
}

/// 実 HTTP クライアントを使い、待機だけを記録用に差し替える。
pub fn backends_for(config: &Config) -> Backends {
    let mut backends = Backends::from_config(config).expect("backends");
    backends.sleeper = Arc::new(RecordingSleeper::default());
    backends
}

pub fn pipeline(
    config: &Config,
    completion: Option<Arc<dyn CompletionBackend>>,
    search: Option<Arc<dyn SearchBackend>>,
) -> ClassificationPipeline {
    let telemetry = Telemetry::metrics_only().expect("telemetry");
    let backends = Backends {
        completion,
        search,
        sleeper: Arc::new(RecordingSleeper::default()),
    };
    build_pipeline(config, backends, telemetry.metrics()).expect("pipeline builds")
}
