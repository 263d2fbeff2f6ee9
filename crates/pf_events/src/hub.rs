//! Publisher token signing and the outbound leg of SSE dispatch.
//!
//! The hub itself (the Mercure-style SSE relay that holds subscriber
//! connections) is an external collaborator, out of scope here. This
//! module only knows how to sign a short-lived publisher JWT and POST one
//! event body to it.

use async_trait::async_trait;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::Serialize;

use pf_core::{PipelineError, Result};

#[derive(Serialize)]
struct MercureClaims {
    mercure: MercurePublish,
}

#[derive(Serialize)]
struct MercurePublish {
    publish: Vec<String>,
}

/// Signs an `HS256` token over `{mercure: {publish: ["*"]}}`; a publisher
/// may target any topic, matching the source system's own token scope.
pub fn sign_publisher_token(secret: &str) -> Result<String> {
    let claims = MercureClaims { mercure: MercurePublish { publish: vec!["*".to_string()] } };
    encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(secret.as_bytes()))
        .map_err(|e| PipelineError::Validation(format!("failed to sign publisher token: {e}")))
}

/// Outbound publication to the SSE hub. A `topics` entry becomes a
/// form-encoded `topic` field per the hub's POST publish protocol; `data`
/// carries the event's JSON body.
#[async_trait]
pub trait SseHub: Send + Sync {
    async fn publish(&self, topics: &[String], body: &str, bearer_token: &str) -> Result<()>;
}

/// Production adapter: form-encoded POST with a bearer-JWT `Authorization`
/// header.
pub struct HttpSseHub {
    client: reqwest::Client,
    hub_url: String,
}

impl HttpSseHub {
    pub fn new(hub_url: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), hub_url: hub_url.into() }
    }
}

#[async_trait]
impl SseHub for HttpSseHub {
    async fn publish(&self, topics: &[String], body: &str, bearer_token: &str) -> Result<()> {
        let mut form: Vec<(&str, String)> =
            topics.iter().map(|t| ("topic", t.clone())).collect();
        form.push(("data", body.to_string()));

        let response = self
            .client
            .post(&self.hub_url)
            .bearer_auth(bearer_token)
            .form(&form)
            .send()
            .await
            .map_err(|e| PipelineError::UpstreamUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(PipelineError::UpstreamUnavailable(format!(
                "sse hub responded {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signs_a_token_with_publish_star_claim() {
        let token = sign_publisher_token("s3cret").unwrap();
        let parts: Vec<&str> = token.split('.').collect();
        assert_eq!(parts.len(), 3);
    }
}
