//! # Operator Client — CLI Access to a Running Service
//!
//! Deploy scripts and operators drive freezes and broadcasts through the
//! HTTP API rather than touching the database file next to a live writer.
//! A typical deploy brackets itself with:
//!
//! ```text
//! gridwatch freeze-all --minutes 20        # stamps frozen_at
//! ... flash firmware ...
//! gridwatch unfreeze-stamped <frozen_at>   # lifts only that stamp
//! ```

use anyhow::{bail, Result};
use serde_json::Value;
use std::time::Duration;

pub struct OperatorClient {
    base: String,
    api_key: String,
    client: reqwest::Client,
}

impl OperatorClient {
    pub fn new(base: &str, api_key: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        OperatorClient {
            base: base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            client,
        }
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        let response = self
            .client
            .post(format!("{}{}", self.base, path))
            .header("x-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;
        Self::parse(response).await
    }

    async fn get(&self, path: &str) -> Result<Value> {
        let response = self
            .client
            .get(format!("{}{}", self.base, path))
            .header("x-api-key", &self.api_key)
            .send()
            .await?;
        Self::parse(response).await
    }

    async fn parse(response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            bail!(
                "server returned {}: {}",
                status,
                body["error"].as_str().unwrap_or("unknown error")
            );
        }
        Ok(body)
    }

    pub async fn freeze(
        &self,
        sensor_uuid: &str,
        minutes: Option<i64>,
        assumed_is_up: bool,
    ) -> Result<Value> {
        self.post(
            "/api/v1/freeze",
            serde_json::json!({
                "sensor_uuid": sensor_uuid,
                "minutes": minutes,
                "assumed_is_up": assumed_is_up,
            }),
        )
        .await
    }

    pub async fn unfreeze(&self, sensor_uuid: &str) -> Result<Value> {
        self.post(
            "/api/v1/unfreeze",
            serde_json::json!({"sensor_uuid": sensor_uuid}),
        )
        .await
    }

    pub async fn freeze_all(&self, minutes: Option<i64>, assumed_is_up: bool) -> Result<Value> {
        self.post(
            "/api/v1/freeze_all",
            serde_json::json!({"minutes": minutes, "assumed_is_up": assumed_is_up}),
        )
        .await
    }

    pub async fn unfreeze_stamped(&self, frozen_at: &str) -> Result<Value> {
        self.post(
            "/api/v1/unfreeze_stamped",
            serde_json::json!({"frozen_at": frozen_at}),
        )
        .await
    }

    pub async fn sensors(&self) -> Result<Value> {
        self.get("/api/v1/sensors").await
    }

    pub async fn status(&self) -> Result<Value> {
        self.get("/api/v1/status").await
    }

    pub async fn broadcast(&self, text: &str, parse_mode: Option<&str>) -> Result<Value> {
        self.post(
            "/api/v1/broadcast",
            serde_json::json!({"text": text, "parse_mode": parse_mode}),
        )
        .await
    }
}
