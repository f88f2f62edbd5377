//! OpenAI provider.
//!
//! Talks to the chat-completions API with a dedicated `reqwest` client. The
//! credential lives in a [`SecretString`] and is only ever written into the
//! `Authorization` header; it never appears in errors or logs.

use std::time::Duration;

use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};

use super::ProviderError;
use crate::session::Session;
use crate::store::{Answer, Question, QuestionDraft};

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
const MODEL: &str = "gpt-4o-mini";

/// OpenAI-backed generator.
#[derive(Debug)]
pub struct OpenAiProvider {
    client: Client,
    api_key: SecretString,
    api_base: String,
}

impl OpenAiProvider {
    /// Creates a provider with the given credential and request timeout.
    #[must_use]
    pub fn new(api_key: SecretString, timeout: Duration) -> Self {
        Self::with_api_base(api_key, timeout, DEFAULT_API_BASE)
    }

    /// Creates a provider against a custom API base (tests).
    #[must_use]
    pub fn with_api_base(api_key: SecretString, timeout: Duration, api_base: &str) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key,
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    /// Generates one question of `question_type` for the session's role.
    ///
    /// # Errors
    ///
    /// [`ProviderError`] on transport, status, or decode failure.
    pub async fn generate_question(
        &self,
        session: &Session,
        question_type: &str,
    ) -> Result<QuestionDraft, ProviderError> {
        let prompt = format!(
            "You are an interviewer. Create one question in the given mode for a role.\n\
             Mode: {question_type}\nRole: {role}\nDifficulty: {difficulty}\n\
             Return only the question text.",
            role = session.config.role_category,
            difficulty = session.config.difficulty,
        );
        let text = self.complete(&prompt).await?;
        Ok(QuestionDraft {
            question_type: question_type.to_string(),
            text: text.trim().to_string(),
            metadata: json!({
                "difficulty": session.config.difficulty,
                "hintAvailable": true
            }),
        })
    }

    /// Generates the session summary as a JSON object.
    ///
    /// # Errors
    ///
    /// [`ProviderError`] on transport, status, or decode failure (including a
    /// non-JSON completion).
    pub async fn generate_summary(
        &self,
        session: &Session,
        questions: &[Question],
        answers: &[Answer],
    ) -> Result<Value, ProviderError> {
        let qa = transcript(questions, answers);
        let prompt = format!(
            "Summarize this interview session. Return a JSON object with keys: \
             rubric (communication, problemSolving, technical, each 0-5), \
             strengths (2-3 bullets), gaps (2-3 bullets), \
             scoreBreakdown (object with overall 0-100).\n\
             Role: {role}\nQ/A: {qa}",
            role = session.config.role_category,
        );
        let text = self.complete(&prompt).await?;
        parse_json_object(&text)
    }

    /// Evaluates one answer. Returns `{score, feedback, modelAnswer}`.
    ///
    /// # Errors
    ///
    /// [`ProviderError`] on transport, status, or decode failure.
    pub async fn analyze_answer(
        &self,
        question: &Question,
        answer: &Answer,
    ) -> Result<Value, ProviderError> {
        let answer_text = answer
            .payload
            .get("responseText")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let prompt = format!(
            "Evaluate the candidate's answer to the interview question.\n\
             Return a JSON object with keys: score (0-100), feedback (1-2 sentences), \
             modelAnswer (short ideal outline).\n\
             Question type: {qtype}\nAnswer type: {atype}\n\
             Question: {question}\nAnswer: {answer}",
            qtype = question.question_type,
            atype = answer.kind,
            question = question.text,
            answer = answer_text,
        );
        let text = self.complete(&prompt).await?;
        parse_json_object(&text)
    }

    async fn complete(&self, prompt: &str) -> Result<String, ProviderError> {
        let body = json!({
            "model": MODEL,
            "messages": [{"role": "user", "content": prompt}],
        });
        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(sanitize(&e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Status(status.as_u16()));
        }
        let value: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(sanitize(&e)))?;
        value["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ProviderError::Decode("missing completion content".into()))
    }
}

/// Renders the Q/A transcript for summary prompts.
fn transcript(questions: &[Question], answers: &[Answer]) -> String {
    let mut out = String::new();
    for question in questions {
        out.push_str(&format!(
            "Q{}: [{}] {}\n",
            question.ordinal, question.question_type, question.text
        ));
        if let Some(answer) = answers.iter().find(|a| a.question_id == question.id) {
            let text = answer
                .payload
                .get("responseText")
                .and_then(Value::as_str)
                .unwrap_or("(non-text answer)");
            out.push_str(&format!("A{}: {text}\n", question.ordinal));
        }
    }
    out
}

/// Parses a completion that is expected to be one JSON object, tolerating
/// surrounding prose or code fences.
pub(super) fn parse_json_object(text: &str) -> Result<Value, ProviderError> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_object() {
            return Ok(value);
        }
    }
    let start = trimmed.find('{');
    let end = trimmed.rfind('}');
    if let (Some(start), Some(end)) = (start, end) {
        if start < end {
            if let Ok(value) = serde_json::from_str::<Value>(&trimmed[start..=end]) {
                if value.is_object() {
                    return Ok(value);
                }
            }
        }
    }
    Err(ProviderError::Decode("completion is not a JSON object".into()))
}

/// Error text with no header/credential material.
fn sanitize(err: &dyn std::fmt::Display) -> String {
    let text = err.to_string();
    if text.to_lowercase().contains("authorization") {
        "request failed".to_string()
    } else {
        text
    }
}
