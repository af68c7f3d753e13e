use std::{env, net::SocketAddr, num::NonZeroUsize, path::PathBuf, time::Duration};

use thiserror::Error;

use crate::{pipeline::ArbitrationConfig, util::retry::RetryConfig};

const MIN_EXTERNAL_TIMEOUT_MS: u64 = 10_000;
const MAX_EXTERNAL_TIMEOUT_MS: u64 = 30_000;
const MAX_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    http_bind: SocketAddr,
    openai_api_key: Option<String>,
    openai_base_url: String,
    semantic_model: String,
    narrative_model: String,
    google_api_key: Option<String>,
    google_cse_id: Option<String>,
    google_search_endpoint: String,
    semantic_enabled: bool,
    search_enabled: bool,
    external_call_timeout: Duration,
    http_max_attempts: usize,
    http_backoff_base_ms: u64,
    http_backoff_cap_ms: u64,
    http_backoff_jitter_ms: u64,
    search_result_limit: NonZeroUsize,
    tables_path: Option<PathBuf>,
    narrative_discard_below: f64,
    narrative_verify_below: f64,
    narrative_trust_above: f64,
    narrative_min_scorer_strength: f64,
    scorer_min_score: f64,
    batch_max_concurrency: NonZeroUsize,
    batch_deadline: Duration,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {source}")]
    Invalid {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl Config {
    /// 環境変数から分類器の設定値を読み込み、検証する。
    ///
    /// 外部サービスの認証情報は任意。未設定の場合は該当する段が無効になる。
    ///
    /// # Errors
    /// 値のパースや範囲検証に失敗した場合、検索の認証情報が片方しか設定されていない場合は
    /// [`ConfigError`] を返す。
    pub fn from_env() -> Result<Self, ConfigError> {
        let http_bind = parse_socket_addr("CLASSIFIER_HTTP_BIND", "0.0.0.0:9010")?;

        // Semantic service
        let openai_api_key = optional_var("OPENAI_API_KEY");
        let openai_base_url = env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let semantic_model =
            env::var("SEMANTIC_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let narrative_model = env::var("NARRATIVE_MODEL").unwrap_or_else(|_| "gpt-4o".to_string());

        // Web search
        let google_api_key = optional_var("GOOGLE_API_KEY");
        let google_cse_id = optional_var("GOOGLE_CSE_ID");
        match (&google_api_key, &google_cse_id) {
            (Some(_), None) => return Err(ConfigError::Missing("GOOGLE_CSE_ID")),
            (None, Some(_)) => return Err(ConfigError::Missing("GOOGLE_API_KEY")),
            _ => {}
        }
        let google_search_endpoint = env::var("GOOGLE_SEARCH_ENDPOINT")
            .unwrap_or_else(|_| "https://www.googleapis.com/customsearch/v1".to_string());

        let semantic_enabled = parse_bool("SEMANTIC_ENABLED", true)?;
        let search_enabled = parse_bool("SEARCH_ENABLED", true)?;

        // External call budget (exponential backoff + jitter)
        let external_call_timeout = parse_duration_ms_within(
            "EXTERNAL_CALL_TIMEOUT_MS",
            20_000,
            MIN_EXTERNAL_TIMEOUT_MS..=MAX_EXTERNAL_TIMEOUT_MS,
        )?;
        let http_max_attempts = parse_usize("HTTP_MAX_ATTEMPTS", 3)?;
        if !(1..=MAX_ATTEMPTS).contains(&http_max_attempts) {
            return Err(ConfigError::Invalid {
                name: "HTTP_MAX_ATTEMPTS",
                source: anyhow::anyhow!("value must be between 1 and {MAX_ATTEMPTS}"),
            });
        }
        let http_backoff_base_ms = parse_u64("HTTP_BACKOFF_BASE_MS", 2000)?;
        let http_backoff_cap_ms = parse_u64("HTTP_BACKOFF_CAP_MS", 8000)?;
        let http_backoff_jitter_ms = parse_u64("HTTP_BACKOFF_JITTER_MS", 500)?;
        let search_result_limit = parse_non_zero_usize("SEARCH_RESULT_LIMIT", 5)?;

        let tables_path = optional_var("CLASSIFIER_TABLES_PATH").map(PathBuf::from);

        // Narrative arbitration bands
        let narrative_discard_below = parse_percentage("NARRATIVE_DISCARD_BELOW", 50.0)?;
        let narrative_verify_below = parse_percentage("NARRATIVE_VERIFY_BELOW", 70.0)?;
        let narrative_trust_above = parse_percentage("NARRATIVE_TRUST_ABOVE", 80.0)?;
        if !(narrative_discard_below <= narrative_verify_below
            && narrative_verify_below <= narrative_trust_above)
        {
            return Err(ConfigError::Invalid {
                name: "NARRATIVE_VERIFY_BELOW",
                source: anyhow::anyhow!(
                    "bands must satisfy discard ({narrative_discard_below}) <= verify ({narrative_verify_below}) <= trust ({narrative_trust_above})"
                ),
            });
        }
        let narrative_min_scorer_strength = parse_f64("NARRATIVE_MIN_SCORER_STRENGTH", 3.0)?;
        let scorer_min_score = parse_f64("SCORER_MIN_SCORE", 1.0)?;

        // Batch processing
        let batch_max_concurrency = parse_non_zero_usize("BATCH_MAX_CONCURRENCY", 8)?;
        let batch_deadline = parse_duration_secs("BATCH_DEADLINE_SECS", 120)?;

        Ok(Self {
            http_bind,
            openai_api_key,
            openai_base_url,
            semantic_model,
            narrative_model,
            google_api_key,
            google_cse_id,
            google_search_endpoint,
            semantic_enabled,
            search_enabled,
            external_call_timeout,
            http_max_attempts,
            http_backoff_base_ms,
            http_backoff_cap_ms,
            http_backoff_jitter_ms,
            search_result_limit,
            tables_path,
            narrative_discard_below,
            narrative_verify_below,
            narrative_trust_above,
            narrative_min_scorer_strength,
            scorer_min_score,
            batch_max_concurrency,
            batch_deadline,
        })
    }

    #[must_use]
    pub fn http_bind(&self) -> SocketAddr {
        self.http_bind
    }

    #[must_use]
    pub fn openai_api_key(&self) -> Option<&str> {
        self.openai_api_key.as_deref()
    }

    #[must_use]
    pub fn openai_base_url(&self) -> &str {
        &self.openai_base_url
    }

    #[must_use]
    pub fn semantic_model(&self) -> &str {
        &self.semantic_model
    }

    #[must_use]
    pub fn narrative_model(&self) -> &str {
        &self.narrative_model
    }

    /// API キーと検索エンジン ID の組。どちらも設定されている場合のみ返す。
    #[must_use]
    pub fn search_credentials(&self) -> Option<(&str, &str)> {
        self.google_api_key.as_deref().zip(self.google_cse_id.as_deref())
    }

    #[must_use]
    pub fn google_search_endpoint(&self) -> &str {
        &self.google_search_endpoint
    }

    #[must_use]
    pub fn semantic_enabled(&self) -> bool {
        self.semantic_enabled
    }

    #[must_use]
    pub fn search_enabled(&self) -> bool {
        self.search_enabled
    }

    #[must_use]
    pub fn external_call_timeout(&self) -> Duration {
        self.external_call_timeout
    }

    #[must_use]
    pub fn retry(&self) -> RetryConfig {
        RetryConfig::new(
            self.http_max_attempts,
            self.http_backoff_base_ms,
            self.http_backoff_cap_ms,
            self.http_backoff_jitter_ms,
        )
    }

    #[must_use]
    pub fn search_result_limit(&self) -> NonZeroUsize {
        self.search_result_limit
    }

    #[must_use]
    pub fn tables_path(&self) -> Option<&std::path::Path> {
        self.tables_path.as_deref()
    }

    #[must_use]
    pub fn arbitration(&self) -> ArbitrationConfig {
        ArbitrationConfig {
            discard_below: self.narrative_discard_below,
            verify_below: self.narrative_verify_below,
            trust_above: self.narrative_trust_above,
            min_scorer_strength: self.narrative_min_scorer_strength,
        }
    }

    #[must_use]
    pub fn scorer_min_score(&self) -> f64 {
        self.scorer_min_score
    }

    #[must_use]
    pub fn batch_max_concurrency(&self) -> NonZeroUsize {
        self.batch_max_concurrency
    }

    #[must_use]
    pub fn batch_deadline(&self) -> Duration {
        self.batch_deadline
    }
}

/// 空文字列は未設定として扱う。
fn optional_var(name: &'static str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_socket_addr(name: &'static str, default: &str) -> Result<SocketAddr, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());

    raw.parse().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_non_zero_usize(name: &'static str, default: usize) -> Result<NonZeroUsize, ConfigError> {
    let parsed = parse_usize(name, default)?;
    NonZeroUsize::new(parsed).ok_or_else(|| ConfigError::Invalid {
        name,
        source: anyhow::anyhow!("must be greater than zero"),
    })
}

fn parse_duration_secs(name: &'static str, default_secs: u64) -> Result<Duration, ConfigError> {
    let value = parse_u64(name, default_secs)?;
    Ok(Duration::from_secs(value))
}

fn parse_duration_ms_within(
    name: &'static str,
    default_ms: u64,
    range: std::ops::RangeInclusive<u64>,
) -> Result<Duration, ConfigError> {
    let ms = parse_u64(name, default_ms)?;
    if !range.contains(&ms) {
        return Err(ConfigError::Invalid {
            name,
            source: anyhow::anyhow!(
                "value must be between {} and {} milliseconds",
                range.start(),
                range.end()
            ),
        });
    }
    Ok(Duration::from_millis(ms))
}

fn parse_usize(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<usize>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<u64>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_f64(name: &'static str, default: f64) -> Result<f64, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    let parsed = raw.parse::<f64>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })?;
    if !parsed.is_finite() {
        return Err(ConfigError::Invalid {
            name,
            source: anyhow::anyhow!("value must be finite"),
        });
    }
    Ok(parsed)
}

fn parse_percentage(name: &'static str, default: f64) -> Result<f64, ConfigError> {
    let parsed = parse_f64(name, default)?;
    if !(0.0..=100.0).contains(&parsed) {
        return Err(ConfigError::Invalid {
            name,
            source: anyhow::anyhow!("value must be between 0 and 100"),
        });
    }
    Ok(parsed)
}

fn parse_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    match raw.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            name,
            source: anyhow::anyhow!("invalid boolean value: {raw}"),
        }),
    }
}
