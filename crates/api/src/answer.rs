//! Client for the retrieval-augmented answer engine
//!
//! The engine is an opaque HTTP service: it takes the user's question plus
//! recent conversation turns and returns a single answer string. Chat
//! routes only ever see the [`AnswerEngine`] trait.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// Turns forwarded to the engine; older history is dropped
pub const MAX_HISTORY_TURNS: usize = 8;

/// One prior message in the conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AnswerError {
    #[error("answer engine request failed: {0}")]
    Request(String),
    #[error("answer engine returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("answer engine response was malformed: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait AnswerEngine: Send + Sync {
    async fn answer(&self, question: &str, history: &[ChatTurn]) -> Result<String, AnswerError>;
}

#[derive(Debug, Serialize)]
struct AnswerRequest<'a> {
    question: &'a str,
    history: &'a [ChatTurn],
}

#[derive(Debug, Deserialize)]
struct AnswerResponse {
    answer: String,
}

/// [`AnswerEngine`] backed by an HTTP endpoint
#[derive(Clone)]
pub struct HttpAnswerEngine {
    client: Client,
    url: String,
}

impl HttpAnswerEngine {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, AnswerError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AnswerError::Request(e.to_string()))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AnswerEngine for HttpAnswerEngine {
    async fn answer(&self, question: &str, history: &[ChatTurn]) -> Result<String, AnswerError> {
        let history = &history[history.len().saturating_sub(MAX_HISTORY_TURNS)..];

        let response = self
            .client
            .post(&self.url)
            .json(&AnswerRequest { question, history })
            .send()
            .await
            .map_err(|e| AnswerError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = status.as_u16(), "Answer engine returned error status");
            return Err(AnswerError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: AnswerResponse = response
            .json()
            .await
            .map_err(|e| AnswerError::Malformed(e.to_string()))?;

        Ok(parsed.answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn turn(role: &str, content: &str) -> ChatTurn {
        ChatTurn {
            role: role.to_string(),
            content: content.to_string(),
        }
    }

    #[tokio::test]
    async fn test_answer_round_trip() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/answer")
            .match_body(Matcher::PartialJson(json!({
                "question": "How is custody decided?",
                "history": [{"role": "user", "content": "hi"}]
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"answer":"Courts weigh the best interests of the child."}"#)
            .create_async()
            .await;

        let engine =
            HttpAnswerEngine::new(format!("{}/answer", server.url()), Duration::from_secs(5)).unwrap();
        let answer = engine
            .answer("How is custody decided?", &[turn("user", "hi")])
            .await
            .unwrap();

        assert_eq!(answer, "Courts weigh the best interests of the child.");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_history_is_truncated() {
        let mut server = mockito::Server::new_async().await;
        let history: Vec<ChatTurn> = (0..12).map(|i| turn("user", &format!("m{i}"))).collect();
        let expected: Vec<ChatTurn> = history[4..].to_vec();

        let mock = server
            .mock("POST", "/answer")
            .match_body(Matcher::Json(json!({
                "question": "q",
                "history": expected
            })))
            .with_status(200)
            .with_body(r#"{"answer":"ok"}"#)
            .create_async()
            .await;

        let engine =
            HttpAnswerEngine::new(format!("{}/answer", server.url()), Duration::from_secs(5)).unwrap();
        assert_eq!(engine.answer("q", &history).await.unwrap(), "ok");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/answer")
            .with_status(500)
            .with_body("index unavailable")
            .create_async()
            .await;

        let engine =
            HttpAnswerEngine::new(format!("{}/answer", server.url()), Duration::from_secs(5)).unwrap();
        let err = engine.answer("q", &[]).await.unwrap_err();

        assert!(matches!(err, AnswerError::Status { status: 500, ref body } if body == "index unavailable"));
    }

    #[tokio::test]
    async fn test_malformed_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/answer")
            .with_status(200)
            .with_body(r#"{"text":"wrong field"}"#)
            .create_async()
            .await;

        let engine =
            HttpAnswerEngine::new(format!("{}/answer", server.url()), Duration::from_secs(5)).unwrap();
        assert!(matches!(
            engine.answer("q", &[]).await,
            Err(AnswerError::Malformed(_))
        ));
    }
}
