use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::cache::TtlCache;

/// Why an explorer holder-count lookup failed. Callers degrade on every
/// variant; none of them means "zero holders".
#[derive(Debug, thiserror::Error)]
pub enum CounterError {
    #[error("explorer request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("explorer returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed counters payload: {0}")]
    Malformed(String),
}

impl CounterError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network(e) if e.is_timeout() => "timeout",
            Self::Network(_) => "network",
            Self::Status { status: 429, .. } => "rate_limited",
            Self::Status { .. } => "http_status",
            Self::Malformed(_) => "malformed",
        }
    }
}

/// Body of the explorer's `/api/v2/tokens/{address}/counters` endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenCounters {
    #[serde(deserialize_with = "de_opt_string_any", default)]
    pub token_holders_count: Option<String>,
}

/// Block-explorer client for authoritative holder counts.
pub struct ExplorerClient {
    client: reqwest::Client,
    request_delay: Duration,
    cache: TtlCache<String, u64>,
}

impl ExplorerClient {
    pub fn new(timeout: Duration, request_delay: Duration, cache_ttl: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build explorer HTTP client")?;
        Ok(Self {
            client,
            request_delay,
            cache: TtlCache::new(cache_ttl),
        })
    }

    pub fn counters_url(explorer_url: &str, contract_address: &str) -> String {
        format!(
            "{}/api/v2/tokens/{}/counters",
            explorer_url.trim_end_matches('/'),
            urlencoding::encode(contract_address)
        )
    }

    /// Authoritative holder count for a token contract.
    ///
    /// Successful answers are cached per URL for the configured TTL; failures
    /// are never cached.
    pub async fn fetch_holder_count(
        &self,
        explorer_url: &str,
        contract_address: &str,
    ) -> std::result::Result<u64, CounterError> {
        let url = Self::counters_url(explorer_url, contract_address);
        if let Some(count) = self.cache.get(&url) {
            debug!(url = %url, count, "explorer holder count served from cache");
            return Ok(count);
        }

        if !self.request_delay.is_zero() {
            tokio::time::sleep(self.request_delay).await;
        }

        debug!(url = %url, "fetching explorer token counters");
        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CounterError::Status {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        let body = resp.bytes().await?;
        let count = parse_holder_count(&body)?;
        self.cache.insert(url, count);
        Ok(count)
    }
}

/// Extract `token_holders_count` from a counters payload. Missing, null,
/// negative or non-integer values are errors.
pub fn parse_holder_count(body: &[u8]) -> std::result::Result<u64, CounterError> {
    let counters: TokenCounters = serde_json::from_slice(body)
        .map_err(|e| CounterError::Malformed(format!("invalid JSON: {e}")))?;
    let raw = counters
        .token_holders_count
        .ok_or_else(|| CounterError::Malformed("missing token_holders_count".to_string()))?;
    raw.trim().parse::<u64>().map_err(|e| {
        CounterError::Malformed(format!("unparseable token_holders_count {raw:?}: {e}"))
    })
}

/// Deserialize a field that can be either a string or a number into Option<String>.
fn de_opt_string_any<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de;

    struct StringOrNumber;

    impl de::Visitor<'_> for StringOrNumber {
        type Value = Option<String>;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            write!(f, "a string or number")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<Self::Value, E> {
            Ok(Some(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_none<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
            Ok(None)
        }
    }

    deserializer.deserialize_any(StringOrNumber)
}
