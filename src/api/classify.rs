use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    app::AppState,
    evidence::{ClassificationResult, Evidence},
};

#[derive(Debug, Deserialize)]
pub(crate) struct ClassifyRequest {
    entities: Vec<Evidence>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClassifyResponse {
    batch_id: Uuid,
    results: Vec<ClassificationResult>,
}

/// バッチを分類する。期限を過ぎたら外部呼び出しを打ち切り、残りはローカル段の結果で埋める。
pub(crate) async fn classify_batch(
    State(state): State<AppState>,
    Json(payload): Json<ClassifyRequest>,
) -> impl IntoResponse {
    let batch_id = Uuid::now_v7();
    let deadline = state.config().batch_deadline();
    let concurrency = state.config().batch_max_concurrency().get();
    let cancel = CancellationToken::new();

    let pipeline = state.pipeline();
    let work = pipeline.classify_batch(&payload.entities, concurrency, &cancel);
    tokio::pin!(work);

    let results = tokio::select! {
        results = &mut work => results,
        () = tokio::time::sleep(deadline) => {
            warn!(%batch_id, deadline_secs = deadline.as_secs(), "batch deadline reached, cancelling external calls");
            cancel.cancel();
            work.await
        }
    };

    info!(%batch_id, entities = results.len(), "batch classified");

    let body = Json(ClassifyResponse { batch_id, results });
    (StatusCode::OK, body).into_response()
}
