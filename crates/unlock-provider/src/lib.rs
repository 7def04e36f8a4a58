//! Offer provider contract + the locker-wall HTTP client and its response normalization.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};
use unlock_core::{Difficulty, Offer, OfferBatch, OFFER_REWARD_LABEL};

pub const CRATE_NAME: &str = "unlock-provider";

pub const DEFAULT_PROVIDER_URL: &str = "https://lockverify.org/api/v2";
pub const DEFAULT_IP_LOOKUP_URL: &str = "https://api.ipify.org?format=json";
pub const DEFAULT_CLIENT_AGENT: &str = "Mozilla/5.0";

/// Returned by address resolution whenever the lookup cannot complete.
pub const FALLBACK_CLIENT_ADDRESS: &str = "127.0.0.1";

const FALLBACK_TITLE: &str = "Complete Offer";
const FALLBACK_DESCRIPTION: &str = "Complete this offer to unlock premium scripts";
const FALLBACK_CATEGORY: &str = "General";
const PLACEHOLDER_URL: &str = "#";

/// App, game, survey and download icons, picked by position.
pub const DEFAULT_OFFER_ICONS: [&str; 4] = [
    "https://cdn-icons-png.flaticon.com/512/888/888857.png",
    "https://cdn-icons-png.flaticon.com/512/888/888854.png",
    "https://cdn-icons-png.flaticon.com/512/888/888851.png",
    "https://cdn-icons-png.flaticon.com/512/888/888848.png",
];

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_token: String,
    pub ip_lookup_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_PROVIDER_URL.to_string(),
            api_token: String::new(),
            ip_lookup_url: DEFAULT_IP_LOOKUP_URL.to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

impl ProviderConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("UNLOCK_PROVIDER_URL").unwrap_or(defaults.base_url),
            api_token: std::env::var("UNLOCK_PROVIDER_TOKEN").unwrap_or_default(),
            ip_lookup_url: std::env::var("UNLOCK_IP_LOOKUP_URL").unwrap_or(defaults.ip_lookup_url),
            timeout: std::env::var("UNLOCK_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            user_agent: std::env::var("UNLOCK_USER_AGENT").ok(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("API request failed: {status}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed provider response: {0}")]
    Malformed(String),
    #[error("provider API token is not configured")]
    MissingToken,
    #[error("max_count must be a positive integer")]
    InvalidMaxCount,
}

/// Source of offers for one unlock session.
///
/// Implementations capture every failure into the returned value; neither
/// method may fail past this boundary.
#[async_trait]
pub trait OfferProvider: Send + Sync {
    async fn fetch_offers(&self, client_address: &str, client_agent: &str, max_count: usize) -> OfferBatch;

    async fn resolve_client_address(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct LockerProviderClient {
    client: reqwest::Client,
    config: ProviderConfig,
}

impl LockerProviderClient {
    pub fn new(config: ProviderConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client, config })
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Self::new(ProviderConfig::from_env())
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    async fn try_fetch_offers(
        &self,
        client_address: &str,
        client_agent: &str,
        max_count: usize,
    ) -> Result<Vec<Offer>, ProviderError> {
        if max_count == 0 {
            return Err(ProviderError::InvalidMaxCount);
        }
        if self.config.api_token.trim().is_empty() {
            return Err(ProviderError::MissingToken);
        }

        // min = max so the upstream does not hand back a shorter list.
        let count = max_count.to_string();
        let response = self
            .client
            .get(&self.config.base_url)
            .query(&[
                ("ip", client_address),
                ("user_agent", client_agent),
                ("max", count.as_str()),
                ("min", count.as_str()),
            ])
            .bearer_auth(&self.config.api_token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::HttpStatus {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }

        let body = response.bytes().await?;
        let payload: JsonValue =
            serde_json::from_slice(&body).map_err(|e| ProviderError::Malformed(e.to_string()))?;
        let records = upstream_records(&payload)?;
        if records.len() > max_count {
            warn!(
                returned = records.len(),
                max_count, "provider returned more offers than requested"
            );
        }

        let offers = normalize_offers(records);
        debug!(
            count = offers.len(),
            titles = ?offers.iter().map(|o| o.title.as_str()).collect::<Vec<_>>(),
            "normalized provider offers"
        );
        Ok(offers)
    }

    async fn try_resolve_client_address(&self) -> Result<String, ProviderError> {
        let response = self.client.get(&self.config.ip_lookup_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::HttpStatus {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }
        let body = response.bytes().await?;
        let payload: JsonValue =
            serde_json::from_slice(&body).map_err(|e| ProviderError::Malformed(e.to_string()))?;
        json_text(&payload, "ip")
            .ok_or_else(|| ProviderError::Malformed("ip lookup response has no `ip` field".into()))
    }
}

#[async_trait]
impl OfferProvider for LockerProviderClient {
    async fn fetch_offers(&self, client_address: &str, client_agent: &str, max_count: usize) -> OfferBatch {
        let span = info_span!("offer_fetch", max_count, client_address);
        match self
            .try_fetch_offers(client_address, client_agent, max_count)
            .instrument(span)
            .await
        {
            Ok(offers) => OfferBatch::success(offers),
            Err(err) => {
                warn!(error = %err, "offer fetch failed");
                OfferBatch::failure(err.to_string())
            }
        }
    }

    async fn resolve_client_address(&self) -> String {
        let span = info_span!("ip_lookup", url = %self.config.ip_lookup_url);
        match self.try_resolve_client_address().instrument(span).await {
            Ok(address) => address,
            Err(err) => {
                warn!(error = %err, "client address lookup failed; using loopback fallback");
                FALLBACK_CLIENT_ADDRESS.to_string()
            }
        }
    }
}

/// Extracts the upstream offer list. A missing or null `offers` key is an empty batch.
pub fn upstream_records(payload: &JsonValue) -> Result<&[JsonValue], ProviderError> {
    let Some(object) = payload.as_object() else {
        return Err(ProviderError::Malformed("response body is not a JSON object".into()));
    };
    match object.get("offers") {
        None | Some(JsonValue::Null) => Ok(&[]),
        Some(JsonValue::Array(records)) => Ok(records.as_slice()),
        Some(_) => Err(ProviderError::Malformed("`offers` is not an array".into())),
    }
}

/// Maps upstream records to [`Offer`]s in provider order, one offer per record.
pub fn normalize_offers(records: &[JsonValue]) -> Vec<Offer> {
    let mut seen = HashSet::with_capacity(records.len());
    records
        .iter()
        .enumerate()
        .map(|(position, record)| {
            let candidate =
                json_text(record, "offerid").unwrap_or_else(|| format!("offer-{position}"));
            Offer {
                id: unique_id(&mut seen, candidate, position),
                title: first_text(record, &["name_short", "name"])
                    .unwrap_or_else(|| FALLBACK_TITLE.to_string()),
                description: first_text(record, &["adcopy", "description"])
                    .unwrap_or_else(|| FALLBACK_DESCRIPTION.to_string()),
                difficulty: Difficulty::for_position(position),
                reward: OFFER_REWARD_LABEL.to_string(),
                url: json_text(record, "link").unwrap_or_else(|| PLACEHOLDER_URL.to_string()),
                icon: json_text(record, "picture")
                    .unwrap_or_else(|| default_offer_icon(position).to_string()),
                category: json_text(record, "device")
                    .unwrap_or_else(|| FALLBACK_CATEGORY.to_string()),
            }
        })
        .collect()
}

pub fn default_offer_icon(position: usize) -> &'static str {
    DEFAULT_OFFER_ICONS[position % DEFAULT_OFFER_ICONS.len()]
}

// Repeated upstream ids get a positional suffix so ids stay unique per batch.
fn unique_id(seen: &mut HashSet<String>, candidate: String, position: usize) -> String {
    let mut id = candidate.clone();
    let mut suffix = position;
    while seen.contains(&id) {
        id = format!("{candidate}-{suffix}");
        suffix += 1;
    }
    seen.insert(id.clone());
    id
}

fn first_text(value: &JsonValue, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| json_text(value, key))
}

/// Strings and numbers count as text; empty strings count as absent.
fn json_text(value: &JsonValue, key: &str) -> Option<String> {
    match value.get(key)? {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn client_for(server: &MockServer) -> LockerProviderClient {
        LockerProviderClient::new(ProviderConfig {
            base_url: server.url("/api/v2"),
            api_token: "test-token".into(),
            ip_lookup_url: server.url("/ip"),
            timeout: Duration::from_secs(5),
            user_agent: None,
        })
        .expect("client")
    }

    #[test]
    fn normalization_applies_fallbacks_for_empty_records() {
        let records = vec![json!({}), json!({"name": "", "adcopy": ""})];
        let offers = normalize_offers(&records);

        assert_eq!(offers.len(), 2);
        assert_eq!(offers[0].id, "offer-0");
        assert_eq!(offers[1].id, "offer-1");
        for (idx, offer) in offers.iter().enumerate() {
            assert_eq!(offer.title, FALLBACK_TITLE);
            assert_eq!(offer.description, FALLBACK_DESCRIPTION);
            assert_eq!(offer.url, "#");
            assert!(!offer.is_navigable());
            assert_eq!(offer.icon, DEFAULT_OFFER_ICONS[idx]);
            assert_eq!(offer.category, FALLBACK_CATEGORY);
            assert_eq!(offer.reward, OFFER_REWARD_LABEL);
        }
    }

    #[test]
    fn normalization_prefers_short_name_and_ad_copy() {
        let records = vec![json!({
            "offerid": 991,
            "name": "Long Name",
            "name_short": "Short",
            "adcopy": "Install and open",
            "description": "Ignored",
            "link": "https://offers.example/991",
            "picture": "https://cdn.example/991.png",
            "device": "Android"
        })];
        let offer = &normalize_offers(&records)[0];
        assert_eq!(offer.id, "991");
        assert_eq!(offer.title, "Short");
        assert_eq!(offer.description, "Install and open");
        assert_eq!(offer.url, "https://offers.example/991");
        assert_eq!(offer.icon, "https://cdn.example/991.png");
        assert_eq!(offer.category, "Android");
    }

    #[test]
    fn normalization_falls_through_to_secondary_fields() {
        let records = vec![json!({"offerid": "abc", "name": "Long Name", "description": "Desc"})];
        let offer = &normalize_offers(&records)[0];
        assert_eq!(offer.id, "abc");
        assert_eq!(offer.title, "Long Name");
        assert_eq!(offer.description, "Desc");
    }

    #[test]
    fn difficulty_and_icons_follow_position_not_content() {
        let records: Vec<_> = (0..5)
            .map(|i| json!({"offerid": i, "difficulty": "HARD"}))
            .collect();
        let offers = normalize_offers(&records);
        let difficulties: Vec<_> = offers.iter().map(|o| o.difficulty).collect();
        assert_eq!(
            difficulties,
            vec![
                Difficulty::VeryEasy,
                Difficulty::Easy,
                Difficulty::Medium,
                Difficulty::Medium,
                Difficulty::VeryEasy,
            ]
        );
        assert_eq!(offers[4].icon, DEFAULT_OFFER_ICONS[0]);
    }

    #[test]
    fn duplicate_upstream_ids_are_disambiguated_without_dropping_records() {
        let records = vec![
            json!({"offerid": 7}),
            json!({"offerid": 7}),
            json!({"offerid": "7-1"}),
        ];
        let offers = normalize_offers(&records);
        let ids: Vec<_> = offers.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[0], "7");
        assert_eq!(ids[1], "7-1");
        assert_eq!(ids[2], "7-1-2");
    }

    #[test]
    fn payload_shape_is_validated() {
        assert!(upstream_records(&json!({})).expect("missing").is_empty());
        assert!(upstream_records(&json!({"offers": null})).expect("null").is_empty());
        assert!(matches!(
            upstream_records(&json!({"offers": "nope"})),
            Err(ProviderError::Malformed(_))
        ));
        assert!(matches!(
            upstream_records(&json!([1, 2])),
            Err(ProviderError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn fetch_sends_query_and_bearer_token() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/v2")
                    .query_param("ip", "203.0.113.9")
                    .query_param("user_agent", "TestAgent/1.0")
                    .query_param("max", "4")
                    .query_param("min", "4")
                    .header("Authorization", "Bearer test-token");
                then.status(200)
                    .header("content-type", "application/json")
                    .json_body(json!({
                        "offers": [
                            {"offerid": 1, "name_short": "First", "link": "https://o.example/1"},
                            {"offerid": 2, "name": "Second"}
                        ]
                    }));
            })
            .await;

        let batch = client_for(&server)
            .fetch_offers("203.0.113.9", "TestAgent/1.0", 4)
            .await;

        mock.assert_async().await;
        assert!(batch.success);
        assert_eq!(batch.error, None);
        let titles: Vec<_> = batch.offers.iter().map(|o| o.title.as_str()).collect();
        assert_eq!(titles, vec!["First", "Second"]);
    }

    #[tokio::test]
    async fn empty_offer_list_is_a_successful_batch() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/v2");
                then.status(200).json_body(json!({"offers": []}));
            })
            .await;

        let batch = client_for(&server).fetch_offers("1.1.1.1", "ua", 4).await;
        assert!(batch.success);
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn non_success_status_becomes_failure_batch() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/v2");
                then.status(503);
            })
            .await;

        let batch = client_for(&server).fetch_offers("1.1.1.1", "ua", 4).await;
        assert!(!batch.success);
        assert!(batch.offers.is_empty());
        assert_eq!(batch.error.as_deref(), Some("API request failed: 503"));
    }

    #[tokio::test]
    async fn unparseable_body_becomes_failure_batch() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/v2");
                then.status(200).body("<html>not json</html>");
            })
            .await;

        let batch = client_for(&server).fetch_offers("1.1.1.1", "ua", 4).await;
        assert!(!batch.success);
        assert!(batch
            .error
            .as_deref()
            .unwrap_or_default()
            .starts_with("malformed provider response"));
    }

    #[tokio::test]
    async fn missing_token_and_zero_count_never_hit_the_network() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/api/v2");
                then.status(200).json_body(json!({"offers": []}));
            })
            .await;

        let mut config = client_for(&server).config().clone();
        config.api_token = String::new();
        let tokenless = LockerProviderClient::new(config).expect("client");
        let batch = tokenless.fetch_offers("1.1.1.1", "ua", 4).await;
        assert!(!batch.success);

        let batch = client_for(&server).fetch_offers("1.1.1.1", "ua", 0).await;
        assert!(!batch.success);
        assert_eq!(mock.hits_async().await, 0);
    }

    #[tokio::test]
    async fn unreachable_provider_becomes_failure_batch() {
        let client = LockerProviderClient::new(ProviderConfig {
            base_url: "http://127.0.0.1:9/api/v2".into(),
            api_token: "t".into(),
            timeout: Duration::from_secs(2),
            ..Default::default()
        })
        .expect("client");
        let batch = client.fetch_offers("1.1.1.1", "ua", 4).await;
        assert!(!batch.success);
        assert!(batch.error.is_some());
    }

    #[tokio::test]
    async fn client_address_comes_from_lookup_service() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/ip");
                then.status(200).json_body(json!({"ip": "198.51.100.23"}));
            })
            .await;

        assert_eq!(client_for(&server).resolve_client_address().await, "198.51.100.23");
    }

    #[tokio::test]
    async fn client_address_degrades_to_loopback() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/ip");
                then.status(500);
            })
            .await;
        assert_eq!(
            client_for(&server).resolve_client_address().await,
            FALLBACK_CLIENT_ADDRESS
        );

        let offline = LockerProviderClient::new(ProviderConfig {
            ip_lookup_url: "http://127.0.0.1:9/ip".into(),
            timeout: Duration::from_secs(2),
            ..Default::default()
        })
        .expect("client");
        assert_eq!(offline.resolve_client_address().await, FALLBACK_CLIENT_ADDRESS);
    }
}
