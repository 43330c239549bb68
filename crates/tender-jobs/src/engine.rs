//! LLM analysis engine.
//!
//! [`OpenAiAnalysisEngine`] talks to any OpenAI-compatible chat completions
//! endpoint. Without a base URL the engine is disabled and every request
//! fails with [`Error::Unavailable`].

use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use tender_core::defaults::{ANALYSIS_MODEL, ANALYSIS_TIMEOUT_SECS};
use tender_core::{Error, Notice, Result, StoredAttachment};

/// Attachment lines included in a prompt.
const MAX_PROMPT_ATTACHMENTS: usize = 20;

const INSTRUCTIONS: &str = "You are a procurement analyst. Assess the tender below for a \
supplier: summarize the subject, the key requirements and deadlines, and rate its \
profitability, attractiveness and risk from 0 to 10 with a one-sentence rationale each. \
Answer in JSON with the fields summary, requirements, deadlines, scores and recommendation.";

/// Produces an analysis text for a notice.
#[async_trait]
pub trait AnalysisEngine: Send + Sync {
    async fn analyze(&self, notice: &Notice, attachments: &[StoredAttachment]) -> Result<String>;

    fn model_name(&self) -> &str;
}

/// Configuration for the OpenAI-compatible engine.
#[derive(Debug, Clone)]
pub struct AnalysisEngineConfig {
    /// `None` disables the engine.
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout_seconds: u64,
}

impl Default for AnalysisEngineConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            model: ANALYSIS_MODEL.to_string(),
            timeout_seconds: ANALYSIS_TIMEOUT_SECS,
        }
    }
}

impl AnalysisEngineConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `ANALYSIS_BASE_URL` | - | OpenAI-compatible base URL; unset disables analysis |
    /// | `ANALYSIS_API_KEY` | - | Bearer token |
    /// | `ANALYSIS_MODEL` | `gpt-4o-mini` | Chat model |
    /// | `ANALYSIS_TIMEOUT_SECS` | `120` | Request timeout |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let clean = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Self {
            base_url: clean("ANALYSIS_BASE_URL"),
            api_key: clean("ANALYSIS_API_KEY"),
            model: clean("ANALYSIS_MODEL").unwrap_or(defaults.model),
            timeout_seconds: clean("ANALYSIS_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.timeout_seconds),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.base_url.is_some()
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

pub struct OpenAiAnalysisEngine {
    client: Client,
    config: AnalysisEngineConfig,
}

impl OpenAiAnalysisEngine {
    pub fn new(config: AnalysisEngineConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        match &config.base_url {
            Some(url) => info!(
                subsystem = "jobs",
                component = "analysis_engine",
                url = %url,
                model = %config.model,
                "Analysis engine configured"
            ),
            None => warn!(
                subsystem = "jobs",
                component = "analysis_engine",
                "No analysis endpoint configured, analyses will fail"
            ),
        }

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &AnalysisEngineConfig {
        &self.config
    }
}

#[async_trait]
impl AnalysisEngine for OpenAiAnalysisEngine {
    async fn analyze(&self, notice: &Notice, attachments: &[StoredAttachment]) -> Result<String> {
        let base_url = self
            .config
            .base_url
            .as_deref()
            .ok_or_else(|| Error::Unavailable("analysis engine is not configured".to_string()))?;

        let prompt = build_prompt(notice, attachments);
        debug!(
            subsystem = "jobs",
            component = "analysis_engine",
            notice_id = %notice.id,
            prompt_len = prompt.len(),
            "Requesting analysis"
        );

        let request = ChatCompletionRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: INSTRUCTIONS.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt,
                },
            ],
            temperature: 0.2,
            max_tokens: 800,
        };

        let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
        let mut builder = self.client.post(&url).json(&request);
        if let Some(api_key) = &self.config.api_key {
            builder = builder.bearer_auth(api_key);
        }
        let response = builder.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Request(format!(
                "analysis service returned {}: {}",
                status,
                body.chars().take(500).collect::<String>()
            )));
        }

        let completion: ChatCompletionResponse = response.json().await?;
        let answer = completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .unwrap_or_default();
        if answer.is_empty() {
            return Err(Error::Request(
                "analysis service returned no text".to_string(),
            ));
        }
        Ok(answer)
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

fn field(value: Option<&str>) -> &str {
    value.map(str::trim).filter(|v| !v.is_empty()).unwrap_or("not specified")
}

/// User prompt describing a notice and its attachments.
pub fn build_prompt(notice: &Notice, attachments: &[StoredAttachment]) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "TENDER");
    let _ = writeln!(
        prompt,
        "Purchase number: {}",
        field(notice.purchase_number.as_deref())
    );
    let _ = writeln!(
        prompt,
        "Subject: {}",
        field(notice.purchase_object_info.as_deref())
    );
    let _ = writeln!(prompt, "Region: {}", notice.region);
    let _ = writeln!(prompt, "Platform: {}", field(notice.etp_name.as_deref()));
    if let Some(published) = notice.publish_date {
        let _ = writeln!(prompt, "Published: {}", published.format("%Y-%m-%d %H:%M"));
    }
    if let Some(price) = notice.max_price {
        let _ = writeln!(
            prompt,
            "Maximum price: {:.2} {}",
            price,
            notice.currency_code.as_deref().unwrap_or("")
        );
    }
    if notice.okpd2_code.is_some() || notice.okpd2_name.is_some() {
        let _ = writeln!(
            prompt,
            "OKPD2: {} ({})",
            notice.okpd2_code.as_deref().unwrap_or("-"),
            field(notice.okpd2_name.as_deref())
        );
    }
    if notice.kvr_code.is_some() || notice.kvr_name.is_some() {
        let _ = writeln!(
            prompt,
            "KVR: {} ({})",
            notice.kvr_code.as_deref().unwrap_or("-"),
            field(notice.kvr_name.as_deref())
        );
    }
    if let Some(end) = notice.collecting_end {
        let _ = writeln!(prompt, "Bids accepted until: {}", end.format("%Y-%m-%d %H:%M"));
    }

    if !attachments.is_empty() {
        let _ = writeln!(prompt);
        let _ = writeln!(prompt, "ATTACHMENTS");
        for stored in attachments.iter().take(MAX_PROMPT_ATTACHMENTS) {
            let a = &stored.attachment;
            let _ = write!(prompt, "- {}", field(a.file_name.as_deref()));
            if let Some(description) = a.description.as_deref().filter(|d| !d.trim().is_empty()) {
                let _ = write!(prompt, ": {}", description.trim());
            }
            let _ = writeln!(prompt);
        }
        if attachments.len() > MAX_PROMPT_ATTACHMENTS {
            let _ = writeln!(
                prompt,
                "- ... and {} more",
                attachments.len() - MAX_PROMPT_ATTACHMENTS
            );
        }
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use std::collections::HashMap;
    use tender_core::NoticeAttachment;
    use uuid::Uuid;

    fn notice() -> Notice {
        let now = Utc::now();
        Notice {
            id: Uuid::new_v4(),
            external_id: "ext-1".into(),
            source: "test".into(),
            document_type: "notice".into(),
            region: 77,
            period: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            entry_name: "a.xml".into(),
            version_number: 1,
            purchase_number: Some("0373100000125000001".into()),
            document_number: None,
            publish_date: Some(Utc.with_ymd_and_hms(2025, 1, 10, 9, 30, 0).unwrap()),
            href: None,
            placing_way_code: None,
            placing_way_name: None,
            etp_code: None,
            etp_name: None,
            etp_url: None,
            contract_conclusion_on_st83_ch2: false,
            purchase_object_info: Some("Road repair".into()),
            max_price: Some(1500.5),
            currency_code: Some("RUB".into()),
            okpd2_code: Some("42.11".into()),
            okpd2_name: None,
            kvr_code: None,
            kvr_name: None,
            collecting_end: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn attachment(name: &str) -> StoredAttachment {
        let now = Utc::now();
        StoredAttachment {
            attachment: NoticeAttachment {
                id: Uuid::new_v4(),
                notice_version_id: Uuid::new_v4(),
                published_content_id: name.into(),
                file_name: Some(name.into()),
                file_size: None,
                description: Some("Terms of reference".into()),
                document_date: None,
                document_kind_code: None,
                document_kind_name: None,
                url: None,
                inserted_at: now,
                last_seen_at: now,
                source_file_name: None,
            },
            signatures: Vec::new(),
        }
    }

    #[test]
    fn test_prompt_contains_notice_fields() {
        let prompt = build_prompt(&notice(), &[attachment("terms.docx")]);
        assert!(prompt.contains("Purchase number: 0373100000125000001"));
        assert!(prompt.contains("Subject: Road repair"));
        assert!(prompt.contains("Platform: not specified"));
        assert!(prompt.contains("Published: 2025-01-10 09:30"));
        assert!(prompt.contains("Maximum price: 1500.50 RUB"));
        assert!(prompt.contains("OKPD2: 42.11 (not specified)"));
        assert!(!prompt.contains("KVR:"));
        assert!(prompt.contains("- terms.docx: Terms of reference"));
    }

    #[test]
    fn test_prompt_caps_attachments() {
        let attachments: Vec<StoredAttachment> = (0..25)
            .map(|i| attachment(&format!("file-{i}.pdf")))
            .collect();
        let prompt = build_prompt(&notice(), &attachments);
        assert!(prompt.contains("file-19.pdf"));
        assert!(!prompt.contains("file-20.pdf"));
        assert!(prompt.contains("... and 5 more"));
    }

    #[test]
    fn test_config_from_lookup() {
        let map: HashMap<&str, &str> = [("ANALYSIS_BASE_URL", " http://llm:8080/v1 ")].into();
        let config = AnalysisEngineConfig::from_lookup(|k| map.get(k).map(|v| v.to_string()));
        assert_eq!(config.base_url.as_deref(), Some("http://llm:8080/v1"));
        assert_eq!(config.model, "gpt-4o-mini");
        assert_eq!(config.timeout_seconds, 120);
        assert!(config.is_enabled());
        assert!(!AnalysisEngineConfig::default().is_enabled());
    }

    #[tokio::test]
    async fn test_disabled_engine_is_unavailable() {
        let engine = OpenAiAnalysisEngine::new(AnalysisEngineConfig::default()).unwrap();
        let err = engine.analyze(&notice(), &[]).await.unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
    }
}
