//! OAuth2 mailbox access (Gmail-style REST API).
//!
//! The reader is time-window oriented: list ids newer than a timestamp, then
//! fetch full messages one at a time. Attachments are never downloaded; only
//! the text and HTML parts of the MIME tree are decoded.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::MailboxOauth;
use crate::{Error, Result};

const LIST_PAGE_SIZE: usize = 100;

/// One fetched mailbox message, decoded for the pipeline.
#[derive(Debug, Clone, Default)]
pub struct MailboxMessage {
    pub provider_message_id: String,
    pub provider_thread_id: Option<String>,
    pub from_address: String,
    pub subject: String,
    /// Date header, as claimed by the sender
    pub message_date: Option<DateTime<Utc>>,
    /// Provider-reported receipt time; drives the scan window
    pub internal_timestamp: DateTime<Utc>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
}

/// Mailbox capability the scanner consumes.
#[async_trait]
pub trait MailboxClient: Send + Sync {
    /// Ids of messages with internal timestamp after `after`, oldest first,
    /// capped at `max`
    async fn list_message_ids(&self, after: DateTime<Utc>, max: usize) -> Result<Vec<String>>;

    async fn fetch_message(&self, id: &str) -> Result<MailboxMessage>;
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

/// Gmail REST client using a refresh-token grant.
pub struct GmailClient {
    http: reqwest::Client,
    oauth: MailboxOauth,
    token: Mutex<Option<CachedToken>>,
}

impl GmailClient {
    pub fn new(oauth: MailboxOauth) -> Self {
        Self {
            http: reqwest::Client::new(),
            oauth,
            token: Mutex::new(None),
        }
    }

    async fn get_token(&self) -> Result<String> {
        let mut guard = self.token.lock().await;
        if let Some(ref cached) = *guard {
            if Instant::now() < cached.expires_at {
                return Ok(cached.access_token.clone());
            }
        }

        debug!("refreshing mailbox access token");
        let response = self
            .http
            .post(&self.oauth.token_url)
            .timeout(Duration::from_secs(30))
            .form(&[
                ("client_id", self.oauth.client_id.as_str()),
                ("client_secret", self.oauth.client_secret.as_str()),
                ("refresh_token", self.oauth.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| Error::email(format!("mailbox token request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::email(format!(
                "mailbox token refresh rejected with {}",
                response.status()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::email(format!("mailbox token response unreadable: {}", e)))?;
        let access_token = body["access_token"]
            .as_str()
            .ok_or_else(|| Error::email("mailbox token response missing access_token"))?
            .to_string();
        let expires_in = body["expires_in"].as_u64().unwrap_or(3600);

        *guard = Some(CachedToken {
            access_token: access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(expires_in.saturating_sub(60)),
        });
        Ok(access_token)
    }

    async fn get_json(&self, url: &str, query: &[(String, String)]) -> Result<Value> {
        let token = self.get_token().await?;
        let response = self
            .http
            .get(url)
            .timeout(Duration::from_secs(30))
            .bearer_auth(token)
            .query(query)
            .send()
            .await
            .map_err(|e| Error::email(format!("mailbox request failed: {}", e)))?;

        match response.status() {
            s if s.is_success() => {}
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                return Err(Error::email("mailbox rejected the access token"))
            }
            s => return Err(Error::email(format!("mailbox returned {}", s))),
        }

        response
            .json()
            .await
            .map_err(|e| Error::email(format!("mailbox response unreadable: {}", e)))
    }
}

#[async_trait]
impl MailboxClient for GmailClient {
    async fn list_message_ids(&self, after: DateTime<Utc>, max: usize) -> Result<Vec<String>> {
        let url = format!("{}/users/me/messages", self.oauth.api_url);
        let query_filter = format!("after:{}", after.timestamp());

        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("q".to_string(), query_filter.clone()),
                (
                    "maxResults".to_string(),
                    LIST_PAGE_SIZE.min(max - ids.len()).to_string(),
                ),
            ];
            if let Some(token) = &page_token {
                query.push(("pageToken".to_string(), token.clone()));
            }

            let body = self.get_json(&url, &query).await?;
            if let Some(messages) = body["messages"].as_array() {
                for message in messages {
                    if let Some(id) = message["id"].as_str() {
                        ids.push(id.to_string());
                    }
                }
            }

            page_token = body["nextPageToken"].as_str().map(str::to_string);
            if page_token.is_none() || ids.len() >= max {
                break;
            }
        }

        ids.truncate(max);
        // The API lists newest first; the pipeline wants oldest first so the
        // high-water mark advances monotonically
        ids.reverse();
        debug!(count = ids.len(), "mailbox listing complete");
        Ok(ids)
    }

    async fn fetch_message(&self, id: &str) -> Result<MailboxMessage> {
        let url = format!("{}/users/me/messages/{}", self.oauth.api_url, id);
        let body = self
            .get_json(&url, &[("format".to_string(), "full".to_string())])
            .await?;
        parse_message(&body)
    }
}

fn parse_message(body: &Value) -> Result<MailboxMessage> {
    let id = body["id"]
        .as_str()
        .ok_or_else(|| Error::email("message missing id"))?
        .to_string();

    let internal_timestamp = body["internalDate"]
        .as_str()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now);

    let payload = &body["payload"];
    let mut from_address = String::new();
    let mut subject = String::new();
    let mut message_date = None;
    if let Some(headers) = payload["headers"].as_array() {
        for header in headers {
            let name = header["name"].as_str().unwrap_or_default();
            let value = header["value"].as_str().unwrap_or_default();
            match name.to_ascii_lowercase().as_str() {
                "from" => from_address = value.to_string(),
                "subject" => subject = value.to_string(),
                "date" => {
                    message_date = DateTime::parse_from_rfc2822(value)
                        .ok()
                        .map(|d| d.with_timezone(&Utc));
                }
                _ => {}
            }
        }
    }

    let mut body_text = None;
    let mut body_html = None;
    collect_bodies(payload, &mut body_text, &mut body_html);

    Ok(MailboxMessage {
        provider_message_id: id,
        provider_thread_id: body["threadId"].as_str().map(str::to_string),
        from_address,
        subject,
        message_date,
        internal_timestamp,
        body_text,
        body_html,
    })
}

/// Walk the MIME tree collecting the first text and HTML parts. Anything with
/// a filename or attachment id is an attachment and is never decoded.
fn collect_bodies(part: &Value, text: &mut Option<String>, html: &mut Option<String>) {
    let filename = part["filename"].as_str().unwrap_or_default();
    let is_attachment = !filename.is_empty() || part["body"]["attachmentId"].is_string();

    if !is_attachment {
        let mime = part["mimeType"].as_str().unwrap_or_default();
        if let Some(data) = part["body"]["data"].as_str() {
            if let Some(decoded) = decode_body(data) {
                match mime {
                    "text/plain" if text.is_none() => *text = Some(decoded),
                    "text/html" if html.is_none() => *html = Some(decoded),
                    _ => {}
                }
            }
        }
    }

    if let Some(parts) = part["parts"].as_array() {
        for child in parts {
            collect_bodies(child, text, html);
        }
    }
}

fn decode_body(data: &str) -> Option<String> {
    let bytes = base64::engine::general_purpose::URL_SAFE
        .decode(data)
        .or_else(|_| base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(data))
        .ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn b64(s: &str) -> String {
        base64::engine::general_purpose::URL_SAFE.encode(s)
    }

    #[test]
    fn test_parse_multipart_message() {
        let body = json!({
            "id": "msg-1",
            "threadId": "thread-1",
            "internalDate": "1768915800000",
            "payload": {
                "mimeType": "multipart/alternative",
                "headers": [
                    {"name": "From", "value": "Amazon <ship-confirm@amazon.com>"},
                    {"name": "Subject", "value": "Your order has shipped"},
                    {"name": "Date", "value": "Tue, 20 Jan 2026 14:30:00 +0000"}
                ],
                "parts": [
                    {
                        "mimeType": "text/plain",
                        "filename": "",
                        "body": {"data": b64("UPS tracking 1Z999AA10123456784")}
                    },
                    {
                        "mimeType": "text/html",
                        "filename": "",
                        "body": {"data": b64("<b>UPS tracking 1Z999AA10123456784</b>")}
                    },
                    {
                        "mimeType": "application/pdf",
                        "filename": "invoice.pdf",
                        "body": {"attachmentId": "att-1"}
                    }
                ]
            }
        });

        let message = parse_message(&body).unwrap();
        assert_eq!(message.provider_message_id, "msg-1");
        assert_eq!(message.provider_thread_id.as_deref(), Some("thread-1"));
        assert!(message.from_address.contains("amazon.com"));
        assert!(message.body_text.as_deref().unwrap().contains("1Z999AA10123456784"));
        assert!(message.body_html.is_some());
        assert!(message.message_date.is_some());
    }

    #[test]
    fn test_html_only_message() {
        let body = json!({
            "id": "msg-2",
            "internalDate": "1768915800000",
            "payload": {
                "mimeType": "text/html",
                "filename": "",
                "headers": [],
                "body": {"data": b64("<div>hello</div>")}
            }
        });

        let message = parse_message(&body).unwrap();
        assert!(message.body_text.is_none());
        assert_eq!(message.body_html.as_deref(), Some("<div>hello</div>"));
    }

    #[test]
    fn test_attachment_bodies_never_decoded() {
        let body = json!({
            "id": "msg-3",
            "internalDate": "1768915800000",
            "payload": {
                "mimeType": "multipart/mixed",
                "filename": "",
                "headers": [],
                "parts": [
                    {
                        "mimeType": "text/plain",
                        "filename": "notes.txt",
                        "body": {"data": b64("attached text")}
                    }
                ]
            }
        });

        let message = parse_message(&body).unwrap();
        assert!(message.body_text.is_none());
        assert!(message.body_html.is_none());
    }
}
