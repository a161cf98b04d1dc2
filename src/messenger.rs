//! # Messenger — Outbound Chat Delivery
//!
//! The notifier's only external collaborator. The [`Messenger`] trait keeps
//! the data plane ignorant of the chat platform: production talks to the
//! Telegram Bot API over HTTPS, tests script a [`MockMessenger`], and a
//! token-less deployment gets a [`NullMessenger`] that logs instead of
//! sending.
//!
//! ## Error Classification
//!
//! Delivery failures split into two kinds with different policy:
//!
//! - **Transient** — network failures, 5xx, 429. The notifier retries these
//!   (bounded, with jitter) and otherwise counts the miss and moves on.
//! - **Permanent** — the user blocked the bot or the chat no longer exists.
//!   Retrying is pointless; the subscriber is retired instead.

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessengerError {
    /// Worth retrying: the platform or the network hiccuped.
    #[error("transient delivery failure: {0}")]
    Transient(String),
    /// Never retry: this chat is gone for good.
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

impl MessengerError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, MessengerError::Permanent(_))
    }
}

/// Outbound delivery capability.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Deliver one message to one chat.
    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        parse_mode: Option<&str>,
    ) -> Result<(), MessengerError>;

    /// Convenience fan-out without rate control. The notifier does its own
    /// per-recipient dispatch; this exists for operator tooling.
    async fn broadcast(
        &self,
        chat_ids: &[i64],
        text: &str,
        parse_mode: Option<&str>,
    ) -> Vec<(i64, Result<(), MessengerError>)> {
        let mut results = Vec::with_capacity(chat_ids.len());
        for &chat_id in chat_ids {
            results.push((chat_id, self.send_text(chat_id, text, parse_mode).await));
        }
        results
    }
}

// ── Telegram ────────────────────────────────────────────────────

/// Telegram Bot API client. One `sendMessage` call per delivery, 10 s
/// request budget.
pub struct TelegramMessenger {
    client: reqwest::Client,
    api_base: String,
}

impl TelegramMessenger {
    pub fn new(bot_token: &str) -> Self {
        TelegramMessenger::with_base("https://api.telegram.org", bot_token)
    }

    /// Point at a different API host. Tests aim this at a local stub.
    pub fn with_base(base: &str, bot_token: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        TelegramMessenger {
            client,
            api_base: format!("{}/bot{}", base.trim_end_matches('/'), bot_token),
        }
    }

    fn classify(status: reqwest::StatusCode, description: &str) -> MessengerError {
        let desc = description.to_ascii_lowercase();
        // 403 means the user blocked the bot; "chat not found" /
        // "deactivated" mean the chat id is dead. Everything else is worth
        // another try later.
        if status == reqwest::StatusCode::FORBIDDEN
            || desc.contains("chat not found")
            || desc.contains("user is deactivated")
            || desc.contains("bot was blocked")
        {
            MessengerError::Permanent(format!("{}: {}", status, description))
        } else {
            MessengerError::Transient(format!("{}: {}", status, description))
        }
    }
}

#[async_trait]
impl Messenger for TelegramMessenger {
    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        parse_mode: Option<&str>,
    ) -> Result<(), MessengerError> {
        let mut body = json!({ "chat_id": chat_id, "text": text });
        if let Some(mode) = parse_mode {
            body["parse_mode"] = json!(mode);
        }
        let response = self
            .client
            .post(format!("{}/sendMessage", self.api_base))
            .json(&body)
            .send()
            .await
            .map_err(|e| MessengerError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let description = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| v["description"].as_str().map(str::to_string))
            .unwrap_or_default();
        Err(TelegramMessenger::classify(status, &description))
    }
}

// ── Null sink ───────────────────────────────────────────────────

/// Used when no bot token is configured: deliveries are logged at debug and
/// reported successful, so the pipeline stays exercisable in development.
pub struct NullMessenger;

#[async_trait]
impl Messenger for NullMessenger {
    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        _parse_mode: Option<&str>,
    ) -> Result<(), MessengerError> {
        tracing::debug!(chat_id, text, "messenger disabled, dropping message");
        Ok(())
    }
}

// ── Mock ────────────────────────────────────────────────────────

/// Test double: records every send and pops scripted failures per chat.
pub struct MockMessenger {
    pub sent: std::sync::Mutex<Vec<(i64, String)>>,
    failures: std::sync::Mutex<std::collections::HashMap<i64, Vec<MessengerError>>>,
}

impl Default for MockMessenger {
    fn default() -> Self {
        MockMessenger {
            sent: std::sync::Mutex::new(Vec::new()),
            failures: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }
}

impl MockMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an error for the next send(s) to `chat_id`, consumed in order.
    pub fn fail_next(&self, chat_id: i64, error: MessengerError) {
        self.failures
            .lock()
            .unwrap()
            .entry(chat_id)
            .or_default()
            .push(error);
    }

    pub fn sent_to(&self, chat_id: i64) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == chat_id)
            .map(|(_, text)| text.clone())
            .collect()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl Messenger for MockMessenger {
    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        _parse_mode: Option<&str>,
    ) -> Result<(), MessengerError> {
        let scripted = {
            let mut failures = self.failures.lock().unwrap();
            failures.get_mut(&chat_id).and_then(|queue| {
                if queue.is_empty() {
                    None
                } else {
                    Some(queue.remove(0))
                }
            })
        };
        if let Some(error) = scripted {
            return Err(error);
        }
        self.sent.lock().unwrap().push((chat_id, text.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_is_permanent() {
        let err = TelegramMessenger::classify(
            reqwest::StatusCode::FORBIDDEN,
            "Forbidden: bot was blocked by the user",
        );
        assert!(err.is_permanent());
    }

    #[test]
    fn chat_not_found_is_permanent() {
        let err = TelegramMessenger::classify(
            reqwest::StatusCode::BAD_REQUEST,
            "Bad Request: chat not found",
        );
        assert!(err.is_permanent());
    }

    #[test]
    fn throttle_and_server_errors_are_transient() {
        for (status, desc) in [
            (reqwest::StatusCode::TOO_MANY_REQUESTS, "Too Many Requests"),
            (reqwest::StatusCode::BAD_GATEWAY, "Bad Gateway"),
            (reqwest::StatusCode::BAD_REQUEST, "message is too long"),
        ] {
            assert!(!TelegramMessenger::classify(status, desc).is_permanent());
        }
    }

    #[tokio::test]
    async fn mock_scripts_failures_in_order() {
        let mock = MockMessenger::new();
        mock.fail_next(42, MessengerError::Transient("flaky".into()));
        assert!(mock.send_text(42, "one", None).await.is_err());
        assert!(mock.send_text(42, "two", None).await.is_ok());
        assert_eq!(mock.sent_to(42), vec!["two".to_string()]);
    }
}
