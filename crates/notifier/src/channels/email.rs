//! Email delivery through the Resend HTTP API.

use async_trait::async_trait;
use serde::Serialize;

use super::Transport;

#[derive(Serialize)]
struct SendEmailRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    text: &'a str,
}

pub struct ResendEmail {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    from: String,
    subject: String,
}

impl ResendEmail {
    pub fn new(
        client: reqwest::Client,
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        from: impl Into<String>,
        subject: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            from: from.into(),
            subject: subject.into(),
        }
    }
}

#[async_trait]
impl Transport for ResendEmail {
    async fn send(&self, destination: &str, body: &str) -> anyhow::Result<()> {
        let request = SendEmailRequest {
            from: &self.from,
            to: [destination],
            subject: &self.subject,
            text: body,
        };

        let response = self
            .client
            .post(format!("{}/emails", self.api_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            anyhow::bail!("Resend API returned {}: {}", status, detail);
        }

        tracing::debug!(to = %destination, "Email accepted by Resend");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{Value, json};

    use super::*;

    type Captured = Arc<Mutex<Vec<(Option<String>, Value)>>>;

    async fn spawn_resend(status: StatusCode) -> (String, Captured) {
        let captured: Captured = Arc::default();
        let app = Router::new()
            .route(
                "/emails",
                post(
                    move |State(captured): State<Captured>,
                          headers: HeaderMap,
                          Json(body): Json<Value>| async move {
                        let auth = headers
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        captured.lock().unwrap().push((auth, body));
                        (status, Json(json!({ "id": "email-1" })))
                    },
                ),
            )
            .with_state(captured.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{}", addr), captured)
    }

    #[tokio::test]
    async fn test_posts_message_with_bearer_key() {
        let (url, captured) = spawn_resend(StatusCode::OK).await;
        let email = ResendEmail::new(
            reqwest::Client::new(),
            format!("{}/", url),
            "re_test",
            "herald@example.com",
            "Reminder",
        );

        email.send("user@example.com", "hello").await.unwrap();

        let captured = captured.lock().unwrap();
        assert_eq!(captured.len(), 1);
        let (auth, body) = &captured[0];
        assert_eq!(auth.as_deref(), Some("Bearer re_test"));
        assert_eq!(body["from"], "herald@example.com");
        assert_eq!(body["to"], json!(["user@example.com"]));
        assert_eq!(body["subject"], "Reminder");
        assert_eq!(body["text"], "hello");
    }

    #[tokio::test]
    async fn test_rejected_request_is_an_error() {
        let (url, _) = spawn_resend(StatusCode::UNPROCESSABLE_ENTITY).await;
        let email = ResendEmail::new(reqwest::Client::new(), url, "re_test", "a@b.c", "s");

        let err = email.send("bad-address", "hello").await.unwrap_err();
        assert!(err.to_string().contains("422"));
    }
}
