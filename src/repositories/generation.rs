use anyhow::bail;
use serde_json::{json, Value};

/// Client for the external AI generation service.
#[derive(Clone)]
pub struct GenerationRepository {
    url: String,
    api_key: String,
    client: reqwest::Client,
}

impl GenerationRepository {
    pub fn new(url: String, api_key: String) -> Self {
        Self {
            url,
            api_key,
            client: reqwest::Client::new(),
        }
    }

    pub async fn generate(&self, feature: &str, payload: Value) -> Result<Value, anyhow::Error> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "feature": feature,
                "payload": payload
            }))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            bail!("Generation service answered {}: {}", status, body);
        }

        Ok(serde_json::from_str(&body)?)
    }
}
