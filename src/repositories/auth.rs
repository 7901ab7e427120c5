use anyhow::bail;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

/// Resolves a bearer token to the user id it was issued for.
#[async_trait]
pub trait TokenVerifier: Send + Sync + 'static {
    async fn verify(&self, token: &str) -> Result<String, anyhow::Error>;
}

#[derive(Deserialize)]
struct VerifiedToken {
    uid: String,
}

/// Asks the identity provider's verification endpoint about each token.
#[derive(Clone)]
pub struct RemoteTokenVerifier {
    url: String,
    client: reqwest::Client,
}

impl RemoteTokenVerifier {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl TokenVerifier for RemoteTokenVerifier {
    async fn verify(&self, token: &str) -> Result<String, anyhow::Error> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "token": token }))
            .send()
            .await?;

        if !response.status().is_success() {
            bail!("Token rejected: {}", response.status());
        }

        let verified: VerifiedToken = response.json().await?;
        Ok(verified.uid)
    }
}
