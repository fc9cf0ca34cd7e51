//! LLM-backed extraction strategy.
//!
//! Strictly an augmenter: the regex path is correct without it, the LLM only
//! widens coverage on messages the patterns handle poorly. Providers share
//! one fixed prompt that mandates a strict JSON schema; outputs are
//! re-validated against the carrier formats downstream.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::{Error, Result};

const EXTRACTION_PROMPT: &str = r#"Extract shipping tracking numbers from the email below.

Respond with ONLY a JSON object, no prose, matching exactly this schema:
{
  "tracking_numbers": [
    {
      "number": "the tracking number exactly as written",
      "carrier": "ups|usps|fedex|dhl|amazon",
      "description": "what is being shipped, if stated",
      "confidence": 0.0,
      "context": "the sentence the number appeared in"
    }
  ],
  "reasoning": "one sentence on how you decided"
}

Include Amazon order numbers (###-#######-#######) with carrier "amazon".
If there are no tracking numbers, return {"tracking_numbers": [], "reasoning": "..."}."#;

/// One candidate as reported by the model.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmCandidate {
    pub number: String,
    #[serde(default)]
    pub carrier: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub context: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmExtraction {
    #[serde(default)]
    pub tracking_numbers: Vec<LlmCandidate>,
    #[serde(default)]
    pub reasoning: String,
}

/// The swappable strategy seam; absence must not change regex-path results.
#[async_trait]
pub trait LlmExtractor: Send + Sync {
    async fn extract(&self, subject: &str, from: &str, text: &str) -> Result<LlmExtraction>;
}

/// HTTP extractor speaking to an OpenAI-compatible, Anthropic-compatible, or
/// local endpoint depending on `llm.provider`.
pub struct HttpLlmExtractor {
    http: reqwest::Client,
    config: LlmConfig,
}

impl HttpLlmExtractor {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    fn user_message(subject: &str, from: &str, text: &str) -> String {
        format!(
            "{}\n\nFrom: {}\nSubject: {}\n\n{}",
            EXTRACTION_PROMPT, from, subject, text
        )
    }

    async fn call_once(&self, subject: &str, from: &str, text: &str) -> Result<LlmExtraction> {
        let content = match self.config.provider.as_str() {
            "anthropic" => self.call_anthropic(subject, from, text).await?,
            // `local` endpoints speak the OpenAI chat shape
            _ => self.call_openai(subject, from, text).await?,
        };
        parse_model_output(&content)
    }

    async fn call_openai(&self, subject: &str, from: &str, text: &str) -> Result<String> {
        let endpoint = if self.config.endpoint.is_empty() {
            "https://api.openai.com/v1".to_string()
        } else {
            self.config.endpoint.trim_end_matches('/').to_string()
        };

        let body = json!({
            "model": self.config.model,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "user", "content": Self::user_message(subject, from, text)}
            ]
        });

        let mut request = self
            .http
            .post(format!("{}/chat/completions", endpoint))
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .json(&body);
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Error::Other(format!(
                "LLM endpoint returned {}",
                response.status()
            )));
        }

        let value: Value = response.json().await.map_err(Error::from)?;
        value["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::Other("LLM response had no content".to_string()))
    }

    async fn call_anthropic(&self, subject: &str, from: &str, text: &str) -> Result<String> {
        let endpoint = if self.config.endpoint.is_empty() {
            "https://api.anthropic.com".to_string()
        } else {
            self.config.endpoint.trim_end_matches('/').to_string()
        };

        let body = json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "messages": [
                {"role": "user", "content": Self::user_message(subject, from, text)}
            ]
        });

        let response = self
            .http
            .post(format!("{}/v1/messages", endpoint))
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Other(format!(
                "LLM endpoint returned {}",
                response.status()
            )));
        }

        let value: Value = response.json().await.map_err(Error::from)?;
        value["content"][0]["text"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::Other("LLM response had no content".to_string()))
    }
}

/// Models occasionally wrap JSON in code fences or prose; dig the object out.
fn parse_model_output(content: &str) -> Result<LlmExtraction> {
    let trimmed = content.trim();
    let json_slice = if trimmed.starts_with('{') {
        trimmed.to_string()
    } else {
        let start = trimmed
            .find('{')
            .ok_or_else(|| Error::Other("LLM output contained no JSON object".to_string()))?;
        let end = trimmed
            .rfind('}')
            .ok_or_else(|| Error::Other("LLM output contained no JSON object".to_string()))?;
        trimmed[start..=end].to_string()
    };

    serde_json::from_str(&json_slice)
        .map_err(|e| Error::Other(format!("LLM output failed schema validation: {}", e)))
}

#[async_trait]
impl LlmExtractor for HttpLlmExtractor {
    async fn extract(&self, subject: &str, from: &str, text: &str) -> Result<LlmExtraction> {
        let mut last_error = None;
        for attempt in 0..=self.config.retry_count {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1 << attempt.min(4))).await;
            }
            match self.call_once(subject, from, text).await {
                Ok(extraction) => {
                    debug!(
                        candidates = extraction.tracking_numbers.len(),
                        "LLM extraction complete"
                    );
                    return Ok(extraction);
                }
                Err(e) => {
                    warn!(attempt, "LLM extraction attempt failed: {}", e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| Error::Other("LLM extraction failed".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_clean_json() {
        let output = r#"{"tracking_numbers":[{"number":"1Z999AA10123456784","carrier":"ups","confidence":0.95}],"reasoning":"labeled"}"#;
        let extraction = parse_model_output(output).unwrap();
        assert_eq!(extraction.tracking_numbers.len(), 1);
        assert_eq!(extraction.tracking_numbers[0].carrier, "ups");
    }

    #[test]
    fn test_parse_fenced_json() {
        let output = "Here you go:\n```json\n{\"tracking_numbers\": [], \"reasoning\": \"none found\"}\n```";
        let extraction = parse_model_output(output).unwrap();
        assert!(extraction.tracking_numbers.is_empty());
        assert_eq!(extraction.reasoning, "none found");
    }

    #[test]
    fn test_parse_garbage_fails() {
        assert!(parse_model_output("I could not find any tracking numbers.").is_err());
    }
}
