use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use ciq_core::{PromptContext, ProviderError, RawMetrics, StructuredInsight};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info_span, Instrument};

use crate::{classify_reqwest_error, classify_status, insight, standardize};
use crate::{InsightProvider, MetricsProvider};

const MAX_RELATED_TARGETS: usize = 20;

#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl HttpProviderConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            timeout: Duration::from_secs(30),
            user_agent: Some(format!("ciq/{}", env!("CARGO_PKG_VERSION"))),
        }
    }

    fn client(&self) -> anyhow::Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(self.timeout);
        if let Some(user_agent) = &self.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        builder.build().context("building reqwest client")
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

/// Metrics provider backed by a scraping API that extracts product fields
/// from the target's public listing page.
pub struct HttpMetricsProvider {
    client: reqwest::Client,
    config: HttpProviderConfig,
    listing_url_template: String,
}

impl HttpMetricsProvider {
    pub fn new(config: HttpProviderConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: config.client()?,
            config,
            listing_url_template: "https://www.amazon.com/dp/{target}".to_string(),
        })
    }

    pub fn with_listing_url_template(mut self, template: impl Into<String>) -> Self {
        self.listing_url_template = template.into();
        self
    }

    fn listing_url(&self, target_id: &str) -> String {
        self.listing_url_template.replace("{target}", target_id)
    }
}

#[derive(Debug, Deserialize)]
struct ScrapeResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Option<ScrapeData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScrapeData {
    #[serde(default)]
    extract: JsonValue,
}

fn validate_target_id(target_id: &str) -> Result<(), ProviderError> {
    if target_id.is_empty() || !target_id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ProviderError::Permanent(format!(
            "malformed target id {target_id:?}"
        )));
    }
    Ok(())
}

fn metrics_from_extract(target_id: &str, extract: &JsonValue) -> RawMetrics {
    static MISSING: JsonValue = JsonValue::Null;
    let field = |name: &str| extract.get(name).unwrap_or(&MISSING);
    let related_targets = field("related_targets")
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(JsonValue::as_str)
                .filter(|id| *id != target_id)
                .take(MAX_RELATED_TARGETS)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    RawMetrics {
        target_id: target_id.to_string(),
        title: field("title").as_str().map(|t| t.trim().to_string()),
        price: standardize::price(field("price")),
        rank: standardize::rank(field("rank")),
        rating: standardize::rating(field("rating")),
        review_count: standardize::review_count(field("review_count")),
        available: standardize::availability(field("availability")).unwrap_or(true),
        fetched_at: Utc::now(),
        related_targets,
    }
}

#[async_trait]
impl MetricsProvider for HttpMetricsProvider {
    fn provider_id(&self) -> &'static str {
        "scrape"
    }

    async fn fetch(&self, target_id: &str) -> Result<RawMetrics, ProviderError> {
        validate_target_id(target_id)?;
        let url = self.listing_url(target_id);
        let payload = json!({
            "url": url,
            "formats": ["extract"],
            "extract": {
                "schema": {
                    "type": "object",
                    "properties": {
                        "title": {"type": "string"},
                        "price": {"type": "string"},
                        "rank": {"type": "string"},
                        "rating": {"type": "string"},
                        "review_count": {"type": "string"},
                        "availability": {"type": "string"},
                        "related_targets": {"type": "array", "items": {"type": "string"}}
                    }
                }
            }
        });

        let mut request = self.client.post(self.config.endpoint("v1/scrape")).json(&payload);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        async {
            let response = request.send().await.map_err(|e| classify_reqwest_error(&e))?;
            let status = response.status();
            if !status.is_success() {
                return Err(classify_status(status, &url));
            }
            let body: ScrapeResponse = response
                .json()
                .await
                .map_err(|e| ProviderError::Transient(format!("decoding scrape response: {e}")))?;
            if !body.success {
                return Err(ProviderError::Permanent(
                    body.error.unwrap_or_else(|| "scrape reported failure".to_string()),
                ));
            }
            let extract = body.data.map(|d| d.extract).unwrap_or(JsonValue::Null);
            let metrics = metrics_from_extract(target_id, &extract);
            debug!(price = ?metrics.price, rank = ?metrics.rank, "scraped metrics");
            Ok::<_, ProviderError>(metrics)
        }
        .instrument(info_span!("metrics_fetch", target_id))
        .await
    }
}

/// Insight provider speaking the chat-completions protocol.
pub struct HttpInsightProvider {
    client: reqwest::Client,
    config: HttpProviderConfig,
    model: String,
}

impl HttpInsightProvider {
    pub fn new(config: HttpProviderConfig, model: impl Into<String>) -> anyhow::Result<Self> {
        Ok(Self {
            client: config.client()?,
            config,
            model: model.into(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl InsightProvider for HttpInsightProvider {
    fn provider_id(&self) -> &'static str {
        "chat"
    }

    async fn analyze(&self, context: &PromptContext) -> Result<StructuredInsight, ProviderError> {
        let Some(key) = &self.config.api_key else {
            return Err(ProviderError::Permanent(
                "analysis api key not configured".to_string(),
            ));
        };
        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": "You are an expert marketplace seller consultant."},
                {"role": "user", "content": insight::render_prompt(context)}
            ],
            "temperature": 0.7,
            "max_tokens": 500
        });

        let response = self
            .client
            .post(self.config.endpoint("v1/chat/completions"))
            .bearer_auth(key)
            .json(&payload)
            .send()
            .instrument(info_span!("insight_analyze", target_id = %context.target_id))
            .await
            .map_err(|e| classify_reqwest_error(&e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, "chat completion"));
        }
        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("decoding chat response: {e}")))?;
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ProviderError::Transient("chat response had no content".to_string()))?;
        Ok(insight::parse_insight(&content, Utc::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_ids_are_validated() {
        assert!(validate_target_id("B00TEST01").is_ok());
        assert!(matches!(
            validate_target_id("not a target"),
            Err(ProviderError::Permanent(_))
        ));
        assert!(validate_target_id("").is_err());
    }

    #[test]
    fn extract_is_standardized() {
        let extract = json!({
            "title": "  Desk Lamp ",
            "price": "$24.99",
            "rank": "#1,532 in Home & Kitchen",
            "rating": "4.4 out of 5 stars",
            "review_count": "2,301 ratings",
            "availability": "In Stock",
            "related_targets": ["B00COMP01", "B00TEST01", 7, "B00COMP02"]
        });
        let metrics = metrics_from_extract("B00TEST01", &extract);
        assert_eq!(metrics.title.as_deref(), Some("Desk Lamp"));
        assert_eq!(metrics.price, Some(24.99));
        assert_eq!(metrics.rank, Some(1532));
        assert_eq!(metrics.rating, Some(4.4));
        assert_eq!(metrics.review_count, Some(2301));
        assert!(metrics.available);
        assert_eq!(metrics.related_targets, vec!["B00COMP01", "B00COMP02"]);
    }

    #[test]
    fn missing_fields_stay_empty() {
        let metrics = metrics_from_extract("B00TEST01", &JsonValue::Null);
        assert_eq!(metrics.price, None);
        assert!(metrics.available);
        assert!(metrics.related_targets.is_empty());
    }
}
