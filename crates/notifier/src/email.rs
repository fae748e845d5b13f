//! Email delivery through the Resend HTTP API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use beacon_common::config::AppConfig;
use beacon_common::error::AppError;
use beacon_engine::email::{EmailSender, LogEmailSender};

const RESEND_API_URL: &str = "https://api.resend.com/emails";
const DEFAULT_FROM: &str = "Beacon <notifications@beacon.local>";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct ResendEmail<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    text: &'a str,
}

#[derive(Debug, Clone)]
pub struct ResendEmailSender {
    client: reqwest::Client,
    api_key: String,
    from: String,
    url: String,
}

impl ResendEmailSender {
    pub fn new(api_key: String, from: String) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AppError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            from,
            url: RESEND_API_URL.to_string(),
        })
    }

    /// Point the sender at a different endpoint.
    pub fn with_url(mut self, url: String) -> Self {
        self.url = url;
        self
    }
}

#[async_trait]
impl EmailSender for ResendEmailSender {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), AppError> {
        let payload = ResendEmail {
            from: &self.from,
            to: [to],
            subject,
            text: body,
        };

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| AppError::Email(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AppError::Email(format!(
                "Resend returned {}: {}",
                status, detail
            )));
        }

        tracing::info!(to, subject, "Email sent");
        Ok(())
    }
}

/// Resend when an API key is configured, otherwise log-only.
pub fn email_sender_from_config(config: &AppConfig) -> Result<Arc<dyn EmailSender>, AppError> {
    match &config.resend_api_key {
        Some(key) if !key.is_empty() => {
            let from = config
                .email_from
                .clone()
                .unwrap_or_else(|| DEFAULT_FROM.to_string());
            tracing::info!(from = %from, "Email delivery via Resend");
            Ok(Arc::new(ResendEmailSender::new(key.clone(), from)?))
        }
        _ => {
            tracing::warn!("RESEND_API_KEY not set, emails will only be logged");
            Ok(Arc::new(LogEmailSender))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sender(server: &MockServer) -> ResendEmailSender {
        ResendEmailSender::new("re_test".into(), "Beacon <noreply@example.com>".into())
            .unwrap()
            .with_url(format!("{}/emails", server.uri()))
    }

    #[tokio::test]
    async fn test_send_posts_to_resend() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/emails"))
            .and(header("authorization", "Bearer re_test"))
            .and(body_json(serde_json::json!({
                "from": "Beacon <noreply@example.com>",
                "to": ["alice@example.com"],
                "subject": "Hello",
                "text": "Body"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "e1"})))
            .expect(1)
            .mount(&server)
            .await;

        sender(&server)
            .send("alice@example.com", "Hello", "Body")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422).set_body_string("invalid recipient"))
            .mount(&server)
            .await;

        let err = sender(&server)
            .send("bad", "Hello", "Body")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Email(_)));
        assert!(err.to_string().contains("invalid recipient"));
    }
}
