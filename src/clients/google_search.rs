use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use tracing::debug;

use super::{BackendError, SearchBackend, SearchHit, SearchQuery};

/// Google Custom Search JSON API クライアント。
#[derive(Debug, Clone)]
pub struct GoogleSearchClient {
    http: Client,
    endpoint: Url,
    api_key: String,
    engine_id: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    #[serde(default)]
    title: String,
    #[serde(default)]
    snippet: String,
}

impl GoogleSearchClient {
    /// # Errors
    /// エンドポイント URL が不正、もしくは HTTP クライアントの構築に失敗した場合はエラーを返す。
    pub fn new(
        endpoint: &str,
        api_key: impl Into<String>,
        engine_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let endpoint = Url::parse(endpoint).context("invalid search endpoint URL")?;
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build search client")?;

        Ok(Self {
            http,
            endpoint,
            api_key: api_key.into(),
            engine_id: engine_id.into(),
            timeout,
        })
    }
}

#[async_trait]
impl SearchBackend for GoogleSearchClient {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>, BackendError> {
        debug!(query = %query.text, limit = query.limit, "search request");

        let limit = query.limit.to_string();
        let response = self
            .http
            .get(self.endpoint.clone())
            .query(&[
                ("key", self.api_key.as_str()),
                ("cx", self.engine_id.as_str()),
                ("q", query.text.as_str()),
                ("num", limit.as_str()),
                ("lr", query.language.as_str()),
                ("gl", query.country.as_str()),
            ])
            .send()
            .await
            .map_err(|error| BackendError::from_reqwest(&error, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|error| BackendError::Decode(error.to_string()))?;

        Ok(parsed
            .items
            .into_iter()
            .take(query.limit)
            .map(|item| SearchHit {
                title: item.title,
                snippet: item.snippet,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn query() -> SearchQuery {
        SearchQuery {
            text: "アクメ 業種 業界 セクター 事業内容".to_string(),
            limit: 5,
            language: "lang_ja".to_string(),
            country: "jp".to_string(),
        }
    }

    fn client(server: &MockServer) -> GoogleSearchClient {
        GoogleSearchClient::new(
            &format!("{}/customsearch/v1", server.uri()),
            "key",
            "engine",
            Duration::from_secs(5),
        )
        .expect("client builds")
    }

    #[tokio::test]
    async fn search_sends_parameters_and_parses_items() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/customsearch/v1"))
            .and(query_param("key", "key"))
            .and(query_param("cx", "engine"))
            .and(query_param("q", "アクメ 業種 業界 セクター 事業内容"))
            .and(query_param("num", "5"))
            .and(query_param("lr", "lang_ja"))
            .and(query_param("gl", "jp"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [
                    {"title": "アクメ株式会社", "snippet": "自動車部品メーカー"},
                    {"title": "会社概要"}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let hits = client(&server).search(&query()).await.expect("search succeeds");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].snippet, "自動車部品メーカー");
        assert_eq!(hits[1].snippet, "");
    }

    #[tokio::test]
    async fn missing_items_yield_empty_result() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/customsearch/v1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"kind": "customsearch#search"})))
            .mount(&server)
            .await;

        let hits = client(&server).search(&query()).await.expect("search succeeds");
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn quota_error_is_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/customsearch/v1"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "error": {"message": "Daily Limit Exceeded"}
            })))
            .mount(&server)
            .await;

        let error = client(&server).search(&query()).await.expect_err("403 must fail");
        assert!(error.is_rate_limit());
    }
}
