use axum::{Json, extract::State};
use serde::Serialize;

use crate::app::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) struct HealthReport {
    status: &'static str,
}

/// 外部段の構成状況。レート制限中でもローカル段だけで応答できるため常に 200 を返す。
#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) struct ReadinessReport {
    status: &'static str,
    taxonomy_version: String,
    semantic_configured: bool,
    search_configured: bool,
    rate_limited: bool,
}

pub(crate) async fn ready(State(state): State<AppState>) -> Json<ReadinessReport> {
    let pipeline = state.pipeline();
    let rate_limited = pipeline.rate_limit().is_rate_limited();

    Json(ReadinessReport {
        status: if rate_limited { "degraded" } else { "ready" },
        taxonomy_version: pipeline.taxonomy().version().to_string(),
        semantic_configured: pipeline.semantic_configured(),
        search_configured: pipeline.search_configured(),
        rate_limited,
    })
}

pub(crate) async fn live() -> Json<HealthReport> {
    Json(HealthReport { status: "live" })
}
