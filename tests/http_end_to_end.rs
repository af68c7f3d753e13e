// 実際の HTTP クライアントをモックサーバーに向けた結合テスト。
mod common;

use std::io::Write;

use axum::{
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use sector_classifier::{
    app::{ComponentRegistry, build_pipeline, build_router},
    evidence::{Evidence, SourceStage},
    observability::Telemetry,
};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path, query_param},
};

use common::{backends_for, config};

const EMBEDDED_TABLES: &str = include_str!("../config/classifier_tables.yaml");

fn company(name: &str) -> Evidence {
    Evidence {
        company_name: Some(name.to_string()),
        ..Evidence::default()
    }
}

#[tokio::test]
async fn quota_rejection_trips_rate_limit_for_all_later_entities() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(403).set_body_string("quota exceeded"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/customsearch/v1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": []})))
        .expect(0)
        .mount(&server)
        .await;

    let search_endpoint = format!("{}/customsearch/v1", server.uri());
    let config = config(&[
        ("OPENAI_API_KEY", "test-key"),
        ("OPENAI_BASE_URL", &server.uri()),
        ("GOOGLE_API_KEY", "g-key"),
        ("GOOGLE_CSE_ID", "cse"),
        ("GOOGLE_SEARCH_ENDPOINT", &search_endpoint),
    ]);
    let telemetry = Telemetry::metrics_only().expect("telemetry");
    let pipeline = build_pipeline(&config, backends_for(&config), telemetry.metrics())
        .expect("pipeline builds");
    let cancel = CancellationToken::new();

    let first = pipeline.classify(&company("アクメ"), &cancel).await;
    let second = pipeline.classify(&company("ベータ"), &cancel).await;

    assert_eq!(first.label, "Other");
    assert_eq!(second.label, "Other");
    assert!(pipeline.rate_limit().is_rate_limited());

    let rendered = telemetry.render_prometheus();
    assert!(rendered.contains("classifier_rate_limit_trips_total{service=\"semantic\"} 1"));
    assert!(rendered.contains("classifier_rate_limited 1"));
}

#[tokio::test]
async fn search_fallback_uses_custom_search_snippets() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/customsearch/v1"))
        .and(query_param("cx", "cse"))
        .and(query_param("q", "アクメ 業種 業界 セクター 事業内容"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                {"title": "アクメ株式会社", "snippet": "アクメは生命保険と損害保険を扱う保険会社です。"},
                {"title": "会社概要", "snippet": "保険代理店事業"}
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let search_endpoint = format!("{}/customsearch/v1", server.uri());
    let config = config(&[
        ("GOOGLE_API_KEY", "g-key"),
        ("GOOGLE_CSE_ID", "cse"),
        ("GOOGLE_SEARCH_ENDPOINT", &search_endpoint),
    ]);
    let telemetry = Telemetry::metrics_only().expect("telemetry");
    let pipeline = build_pipeline(&config, backends_for(&config), telemetry.metrics())
        .expect("pipeline builds");

    let result = pipeline
        .classify(&company("アクメ"), &CancellationToken::new())
        .await;

    assert_eq!(result.label, "Insurance");
    assert_eq!(result.source_stage, SourceStage::SearchFallback);
}

#[tokio::test]
async fn tables_can_be_replaced_from_a_file() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    let replaced = EMBEDDED_TABLES.replacen("version: \"2025.1\"", "version: \"2025.1-local\"", 1);
    file.write_all(replaced.as_bytes()).expect("write tables");
    let tables_path = file.path().to_string_lossy().into_owned();

    let config = config(&[("CLASSIFIER_TABLES_PATH", &tables_path)]);
    let telemetry = Telemetry::metrics_only().expect("telemetry");
    let pipeline = build_pipeline(&config, backends_for(&config), telemetry.metrics())
        .expect("pipeline builds");

    assert_eq!(pipeline.taxonomy().version(), "2025.1-local");
}

#[tokio::test]
async fn tables_with_unknown_labels_are_rejected() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    let broken = EMBEDDED_TABLES.replacen(
        "government_label: Government/Public Sector",
        "government_label: Space Exploration",
        1,
    );
    file.write_all(broken.as_bytes()).expect("write tables");
    let tables_path = file.path().to_string_lossy().into_owned();

    let config = config(&[("CLASSIFIER_TABLES_PATH", &tables_path)]);
    let telemetry = Telemetry::metrics_only().expect("telemetry");
    let error = build_pipeline(&config, backends_for(&config), telemetry.metrics())
        .err()
        .expect("unknown label must fail");

    assert!(format!("{error:#}").contains("Space Exploration"));
}

#[tokio::test]
async fn classify_endpoint_returns_batch_in_order() {
    let config = config(&[]);
    let telemetry = Telemetry::metrics_only().expect("telemetry");
    let registry = ComponentRegistry::assemble(config.clone(), telemetry, backends_for(&config))
        .expect("registry");
    let router = build_router(registry);

    let response = router
        .oneshot(
            Request::post("/v1/classify")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({
                        "entities": [
                            {"companyName": "日本電気株式会社"},
                            {"companyName": "○○銀行"},
                            {"articleTitle": "AI市場の動向調査"}
                        ]
                    })
                    .to_string(),
                ))
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let body: Value = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(
        body["results"],
        json!([
            {"label": "Technology", "sourceStage": "Scorer"},
            {"label": "Banking/Securities", "sourceStage": "Rule"},
            {"label": "Market/Business Trends", "sourceStage": "Narrative"}
        ])
    );
}
